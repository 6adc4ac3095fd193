//! Parked-session registry and the close watcher
//!
//! Closing a device mid-track and reopening it moments later is common
//! (track switches re-open the PCM). Instead of tearing the negotiated
//! stream down on every close, the session is parked here under a short
//! grace period; an open that matches by remote address and transport
//! reclaims it and skips OPEN and SET_CONFIGURATION entirely.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::constants::WATCHER_TIMEOUT;
use crate::session::Session;
use crate::transport::TransportKind;

struct WatchFlag {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl WatchFlag {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }

    /// Wait out the grace period; true if cancelled before the deadline.
    fn wait(&self) -> bool {
        let deadline = Instant::now() + WATCHER_TIMEOUT;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

struct Parked {
    id: u64,
    address: String,
    kind: TransportKind,
    session: Session,
    flag: Arc<WatchFlag>,
}

#[derive(Default)]
struct Inner {
    next_id: Mutex<u64>,
    parked: Mutex<Vec<Parked>>,
}

/// Internally synchronized registry; clones share the same store.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `session` for the grace period. If the watcher cannot be
    /// spawned the session is torn down immediately.
    pub fn park(&self, session: Session) {
        let id = {
            let mut next = self.inner.next_id.lock();
            *next += 1;
            *next
        };
        let flag = WatchFlag::new();
        let entry = Parked {
            id,
            address: session.address().to_string(),
            kind: session.transport(),
            session,
            flag: Arc::clone(&flag),
        };
        let address = entry.address.clone();
        self.inner.parked.lock().push(entry);

        if let Err(e) = self.spawn_watcher(id, flag) {
            tracing::warn!(error = %e, "close watcher spawn failed, tearing down now");
            if let Some(session) = self.take(id) {
                session.teardown();
            }
        } else {
            tracing::debug!(%address, "session parked");
        }
    }

    /// Reclaim a parked session matching the remote and transport. The
    /// watcher is cancelled before the entry leaves the store, so it can
    /// never tear down a session someone just claimed.
    pub fn claim(&self, address: &str, kind: TransportKind) -> Option<Session> {
        let mut parked = self.inner.parked.lock();
        let pos = parked
            .iter()
            .position(|p| p.address == address && p.kind == kind)?;
        let entry = parked.remove(pos);
        entry.flag.cancel();
        tracing::debug!(%address, "session reclaimed");
        Some(entry.session)
    }

    fn take(&self, id: u64) -> Option<Session> {
        let mut parked = self.inner.parked.lock();
        let pos = parked.iter().position(|p| p.id == id)?;
        Some(parked.remove(pos).session)
    }

    fn spawn_watcher(&self, id: u64, flag: Arc<WatchFlag>) -> io::Result<()> {
        let registry = self.clone();
        thread::Builder::new()
            .name("bt-close-watcher".into())
            .spawn(move || {
                if flag.wait() {
                    // Claimed in time: the claimer owns the session now.
                    return;
                }
                if let Some(session) = registry.take(id) {
                    tracing::debug!("close grace period expired");
                    session.teardown();
                }
            })?;
        Ok(())
    }

    #[cfg(test)]
    fn parked_count(&self) -> usize {
        self.inner.parked.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::error::ProtocolError;
    use crate::ipc::message::{CapabilityBlock, CodecCapabilities, PcmCapabilities};
    use crate::ipc::{ControlChannel, DelayPoller, Indication, MessageName, Request, Response};
    use crate::transport::{DataSocket, Direction};
    use std::time::Duration;

    struct VoiceOnlyChannel;

    impl ControlChannel for VoiceOnlyChannel {
        fn request(&mut self, req: Request) -> Result<Response, ProtocolError> {
            match req {
                Request::GetCapabilities { .. } => Ok(Response::GetCapabilities {
                    transport: TransportKind::Voice,
                    blocks: vec![CapabilityBlock {
                        transport: TransportKind::Voice,
                        seid: 0,
                        lock: 0,
                        codec: CodecCapabilities::Pcm(PcmCapabilities { sample_rate: 8000 }),
                    }],
                }),
                _ => Err(ProtocolError::Timeout),
            }
        }

        fn expect_indication(
            &mut self,
            name: MessageName,
        ) -> Result<Indication, ProtocolError> {
            Err(ProtocolError::UnexpectedMessage {
                expected: name,
                got: MessageName::NewStream,
            })
        }

        fn take_data_socket(&mut self) -> Result<DataSocket, ProtocolError> {
            Err(ProtocolError::Timeout)
        }

        fn delay_poller(&self) -> Result<Box<dyn DelayPoller>, ProtocolError> {
            Err(ProtocolError::Timeout)
        }
    }

    fn voice_session(address: &str) -> Session {
        Session::with_channel(
            Box::new(VoiceOnlyChannel),
            StreamConfig::new(address),
            Direction::Playback,
        )
        .unwrap()
    }

    #[test]
    fn claim_within_grace_period_returns_the_session() {
        let registry = SessionRegistry::new();
        registry.park(voice_session("00:11:22:33:44:55"));

        let session = registry.claim("00:11:22:33:44:55", TransportKind::Voice);
        assert!(session.is_some());
        assert_eq!(registry.parked_count(), 0);

        // The cancelled watcher leaves nothing behind.
        thread::sleep(WATCHER_TIMEOUT + Duration::from_millis(100));
        assert_eq!(registry.parked_count(), 0);
    }

    #[test]
    fn mismatched_claims_leave_the_entry_parked() {
        let registry = SessionRegistry::new();
        registry.park(voice_session("00:11:22:33:44:55"));

        assert!(registry
            .claim("66:77:88:99:AA:BB", TransportKind::Voice)
            .is_none());
        assert!(registry
            .claim("00:11:22:33:44:55", TransportKind::Encoded)
            .is_none());
        assert_eq!(registry.parked_count(), 1);
    }

    #[test]
    fn expired_entries_are_removed_and_torn_down() {
        let registry = SessionRegistry::new();
        registry.park(voice_session("00:11:22:33:44:55"));
        assert_eq!(registry.parked_count(), 1);

        thread::sleep(WATCHER_TIMEOUT + Duration::from_millis(200));
        assert_eq!(registry.parked_count(), 0);
        assert!(registry
            .claim("00:11:22:33:44:55", TransportKind::Voice)
            .is_none());
    }

    #[test]
    fn parallel_entries_are_matched_independently() {
        let registry = SessionRegistry::new();
        registry.park(voice_session("00:11:22:33:44:55"));
        registry.park(voice_session("66:77:88:99:AA:BB"));
        assert_eq!(registry.parked_count(), 2);

        assert!(registry
            .claim("66:77:88:99:AA:BB", TransportKind::Voice)
            .is_some());
        assert_eq!(registry.parked_count(), 1);
        assert!(registry
            .claim("00:11:22:33:44:55", TransportKind::Voice)
            .is_some());
    }
}
