//! Virtual audio clock
//!
//! The data channel gives no transfer feedback, so a per-stream thread
//! synthesizes the hardware pointer from wall time. The thread owns only
//! shared atomics, a cloned data socket for health probes, a delay-report
//! poller and the tick sender; it can never reach into stream buffers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::constants::{ADJUST_RATE_HZ, MIN_POLL_INTERVAL};
use crate::ipc::DelayPoller;
use crate::transport::DataSocket;

/// State shared between the clock thread and the stream
#[derive(Debug, Default)]
pub struct ClockShared {
    /// Synthesized hardware pointer, in frames since prepare
    hw_ptr: AtomicU64,
    /// Stream stopped: keep polling but do not advance
    stopped: AtomicBool,
    /// Re-anchor the time origin on the next iteration
    reset: AtomicBool,
    /// Data channel found dead by the health probe
    disconnected: AtomicBool,
    /// Latest remote sink delay, in 0.1 ms units
    sink_delay: AtomicU32,
}

impl ClockShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hw_ptr(&self) -> u64 {
        self.hw_ptr.load(Ordering::Relaxed)
    }

    pub fn set_hw_ptr(&self, frames: u64) {
        self.hw_ptr.store(frames, Ordering::Relaxed);
    }

    pub fn advance_hw_ptr(&self, frames: u64) {
        self.hw_ptr.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn set_stopped(&self, value: bool) {
        self.stopped.store(value, Ordering::Relaxed);
    }

    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Relaxed);
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    pub fn sink_delay(&self) -> u32 {
        self.sink_delay.load(Ordering::Relaxed)
    }

    pub fn set_sink_delay(&self, tenths_ms: u32) {
        self.sink_delay.store(tenths_ms, Ordering::Relaxed);
    }
}

/// Events emitted towards the stream's readiness channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// One period of frames became available
    Tick,
    /// The data channel died; the stream must be torn down
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockParams {
    /// Period size in frames
    pub period_size: u64,
    /// Negotiated sample rate in Hz
    pub rate: u32,
}

/// Handle to a running clock thread
pub struct AudioClock {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioClock {
    pub fn spawn(
        params: ClockParams,
        shared: Arc<ClockShared>,
        data: DataSocket,
        poller: Box<dyn DelayPoller>,
        ticks: Sender<ClockEvent>,
    ) -> io::Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name("bt-audio-clock".into())
            .spawn(move || run(params, shared, data, poller, ticks, thread_cancel))?;
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Cancel the thread and wait for it to park.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("audio clock thread panicked");
            }
        }
    }
}

impl Drop for AudioClock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    params: ClockParams,
    shared: Arc<ClockShared>,
    data: DataSocket,
    mut poller: Box<dyn DelayPoller>,
    ticks: Sender<ClockEvent>,
    cancel: Arc<AtomicBool>,
) {
    // Run slightly fast so the application is asked for data a touch
    // early; the remote's own clock absorbs the difference.
    let period_us =
        (1_000_000u64 * params.period_size / (params.rate + ADJUST_RATE_HZ) as u64).max(1);
    let poll_timeout = Duration::from_micros(period_us).max(MIN_POLL_INTERVAL);

    tracing::debug!(
        period_size = params.period_size,
        rate = params.rate,
        period_us,
        "audio clock running"
    );

    let mut origin = Instant::now();
    while !cancel.load(Ordering::Relaxed) {
        // The bounded delay-report poll doubles as the period sleep.
        match poller.poll_delay(poll_timeout) {
            Ok(Some(delay)) => {
                tracing::debug!(delay_tenths_ms = delay, "sink delay updated");
                shared.set_sink_delay(delay as u32);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "delay report poll failed"),
        }

        if data.health().is_err() {
            tracing::warn!("data channel died, stopping clock");
            shared.disconnected.store(true, Ordering::Relaxed);
            let _ = ticks.try_send(ClockEvent::Failed);
            break;
        }

        if shared.reset.swap(false, Ordering::Relaxed) {
            origin = Instant::now();
            continue;
        }
        if shared.stopped() {
            origin = Instant::now();
            continue;
        }

        let elapsed_us = origin.elapsed().as_micros() as u64;
        let periods = elapsed_us / period_us;
        if periods > 0 {
            shared.advance_hw_ptr(periods * params.period_size);
            // Advance the origin by whole periods so the remainder carries
            // over and the microsecond count never accumulates unbounded.
            origin += Duration::from_micros(periods * period_us);
            for _ in 0..periods {
                let _ = ticks.try_send(ClockEvent::Tick);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::os::unix::net::UnixStream;

    struct SilentPoller;

    impl DelayPoller for SilentPoller {
        fn poll_delay(&mut self, timeout: Duration) -> Result<Option<u16>, ProtocolError> {
            thread::sleep(timeout);
            Ok(None)
        }
    }

    struct ReportOncePoller {
        delay: Option<u16>,
    }

    impl DelayPoller for ReportOncePoller {
        fn poll_delay(&mut self, timeout: Duration) -> Result<Option<u16>, ProtocolError> {
            thread::sleep(timeout);
            Ok(self.delay.take())
        }
    }

    fn data_pair() -> (DataSocket, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (DataSocket::new(a), b)
    }

    #[test]
    fn pointer_advances_monotonically_by_periods() {
        let shared = ClockShared::new();
        let (tx, rx) = crossbeam_channel::bounded(64);
        let (data, _remote) = data_pair();

        // 480 frames at 48 kHz: one period every ~10 ms.
        let mut clock = AudioClock::spawn(
            ClockParams {
                period_size: 480,
                rate: 48_000,
            },
            Arc::clone(&shared),
            data,
            Box::new(SilentPoller),
            tx,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(55));
        clock.stop();

        let ptr = shared.hw_ptr();
        assert!(ptr >= 480, "pointer never advanced: {ptr}");
        assert_eq!(ptr % 480, 0, "pointer advanced by partial periods");
        let ticks = rx.try_iter().filter(|e| *e == ClockEvent::Tick).count();
        assert_eq!(ticks as u64, ptr / 480);
    }

    #[test]
    fn stopped_clock_holds_the_pointer() {
        let shared = ClockShared::new();
        shared.set_stopped(true);
        let (tx, rx) = crossbeam_channel::bounded(64);
        let (data, _remote) = data_pair();

        let mut clock = AudioClock::spawn(
            ClockParams {
                period_size: 128,
                rate: 16_000,
            },
            Arc::clone(&shared),
            data,
            Box::new(SilentPoller),
            tx,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(40));
        clock.stop();

        assert_eq!(shared.hw_ptr(), 0);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn dead_data_socket_reports_failure() {
        let shared = ClockShared::new();
        let (tx, rx) = crossbeam_channel::bounded(64);
        let (data, remote) = data_pair();
        drop(remote);

        let mut clock = AudioClock::spawn(
            ClockParams {
                period_size: 480,
                rate: 48_000,
            },
            Arc::clone(&shared),
            data,
            Box::new(SilentPoller),
            tx,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(40));
        clock.stop();

        assert!(shared.disconnected());
        assert!(rx.try_iter().any(|e| e == ClockEvent::Failed));
    }

    #[test]
    fn delay_reports_land_in_shared_state() {
        let shared = ClockShared::new();
        let (tx, _rx) = crossbeam_channel::bounded(64);
        let (data, _remote) = data_pair();

        let mut clock = AudioClock::spawn(
            ClockParams {
                period_size: 480,
                rate: 48_000,
            },
            Arc::clone(&shared),
            data,
            Box::new(ReportOncePoller { delay: Some(150) }),
            tx,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(40));
        clock.stop();

        assert_eq!(shared.sink_delay(), 150);
    }
}
