//! Data-channel socket wrapper and transport identifiers
//!
//! The data channel is handed over by the audio service after START_STREAM.
//! For the encoded transport it carries whole media packets (header +
//! payload) up to the negotiated transfer unit; for the voice transport it
//! carries raw transfer-unit-sized PCM chunks.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::SockRef;

use crate::error::TransportError;

/// Transport actually negotiated for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Low-latency voice channel (SCO), raw PCM on the wire
    Voice,
    /// A2DP channel carrying SBC-encoded media packets
    Encoded,
}

impl TransportKind {
    pub(crate) fn wire(self) -> u8 {
        match self {
            TransportKind::Voice => 0,
            TransportKind::Encoded => 1,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransportKind::Voice),
            1 => Some(TransportKind::Encoded),
            _ => None,
        }
    }
}

/// Transport requested by configuration, before the service picks one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    #[default]
    Auto,
    #[serde(alias = "hfp")]
    Voice,
    #[serde(alias = "a2dp", alias = "hifi")]
    Encoded,
}

impl TransportPreference {
    pub(crate) fn wire(self) -> u8 {
        match self {
            TransportPreference::Voice => 0,
            TransportPreference::Encoded => 1,
            TransportPreference::Auto => 2,
        }
    }

    /// True when a stream of `kind` satisfies this preference
    pub fn accepts(self, kind: TransportKind) -> bool {
        match self {
            TransportPreference::Auto => true,
            TransportPreference::Voice => kind == TransportKind::Voice,
            TransportPreference::Encoded => kind == TransportKind::Encoded,
        }
    }
}

/// Stream direction as seen from the host framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

/// Connected data socket for one started stream
#[derive(Debug)]
pub struct DataSocket {
    inner: UnixStream,
}

impl DataSocket {
    pub fn new(inner: UnixStream) -> Self {
        Self { inner }
    }

    /// Clone the underlying descriptor for the clock thread's health poll.
    pub fn try_clone(&self) -> io::Result<DataSocket> {
        Ok(DataSocket {
            inner: self.inner.try_clone()?,
        })
    }

    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.inner.set_write_timeout(Some(timeout))
    }

    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.inner.set_read_timeout(Some(timeout))
    }

    /// Request kernel buffer sizing for the voice channel.
    pub fn set_buffer_size(&self, direction: Direction, bytes: usize) -> io::Result<()> {
        let sock = SockRef::from(&self.inner);
        match direction {
            Direction::Playback => sock.set_send_buffer_size(bytes),
            Direction::Capture => sock.set_recv_buffer_size(bytes),
        }
    }

    /// Send one packet without ever blocking. `Ok(false)` means the socket
    /// was not writable and nothing was sent.
    pub fn send_nonblocking(&self, buf: &[u8]) -> Result<bool, TransportError> {
        let sock = SockRef::from(&self.inner);
        match sock.send_with_flags(buf, libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Send one transfer unit, blocking up to the configured send timeout.
    pub fn send_blocking(&self, buf: &[u8]) -> Result<(), TransportError> {
        let sock = SockRef::from(&self.inner);
        match sock.send_with_flags(buf, libc::MSG_NOSIGNAL) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Receive one transfer unit into `buf`, verifying the length matches.
    ///
    /// The nonblocking case uses `MSG_DONTWAIT` on the single receive, so
    /// the socket's blocking mode is never touched; the clock thread holds
    /// a clone sharing the same open file description.
    pub fn recv_transfer_unit(
        &mut self,
        buf: &mut [u8],
        nonblocking: bool,
    ) -> Result<(), TransportError> {
        let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
        let n = unsafe {
            libc::recv(
                self.inner.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            return Err(match e.kind() {
                io::ErrorKind::WouldBlock => TransportError::WouldBlock,
                io::ErrorKind::BrokenPipe => TransportError::Disconnected,
                _ => TransportError::Io(e),
            });
        }
        match n as usize {
            0 => Err(TransportError::Disconnected),
            n if n == buf.len() => Ok(()),
            n => Err(TransportError::SizeMismatch {
                expected: buf.len(),
                got: n,
            }),
        }
    }

    /// Non-destructive health probe used by the clock thread: reports
    /// `Disconnected` on EOF or a pending socket error, `Ok` otherwise.
    /// `MSG_PEEK | MSG_DONTWAIT` keeps both the queued data and the
    /// socket's blocking mode untouched.
    pub fn health(&self) -> Result<(), TransportError> {
        if let Ok(Some(err)) = self.inner.take_error() {
            return Err(TransportError::Io(err));
        }
        let mut probe = [0u8; 1];
        let n = unsafe {
            libc::recv(
                self.inner.as_raw_fd(),
                probe.as_mut_ptr().cast(),
                probe.len(),
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n == 0 {
            return Err(TransportError::Disconnected);
        }
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(TransportError::Io(e));
        }
        Ok(())
    }
}

impl Write for DataSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_accepts() {
        assert!(TransportPreference::Auto.accepts(TransportKind::Voice));
        assert!(TransportPreference::Auto.accepts(TransportKind::Encoded));
        assert!(TransportPreference::Encoded.accepts(TransportKind::Encoded));
        assert!(!TransportPreference::Encoded.accepts(TransportKind::Voice));
        assert!(!TransportPreference::Voice.accepts(TransportKind::Encoded));
    }

    #[test]
    fn recv_checks_transfer_unit_size() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sock = DataSocket::new(a);
        let remote = DataSocket::new(b);

        remote.send_blocking(&[7u8; 48]).unwrap();

        let mut buf = [0u8; 48];
        sock.recv_transfer_unit(&mut buf, false).unwrap();
        assert_eq!(buf, [7u8; 48]);

        remote.send_blocking(&[1u8; 10]).unwrap();
        let err = sock.recv_transfer_unit(&mut buf, false).unwrap_err();
        assert!(matches!(
            err,
            TransportError::SizeMismatch {
                expected: 48,
                got: 10
            }
        ));
    }

    #[test]
    fn health_check_keeps_the_socket_blocking() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sock = DataSocket::new(a);
        let shared = sock.try_clone().unwrap();
        assert!(shared.health().is_ok());

        // The clone shares the open file description with `sock`. After a
        // health check a timed receive must still wait out its timeout
        // instead of returning immediately.
        sock.set_recv_timeout(std::time::Duration::from_millis(50))
            .unwrap();
        let started = std::time::Instant::now();
        let mut buf = [0u8; 4];
        let err = sock.recv_transfer_unit(&mut buf, false).unwrap_err();
        assert!(matches!(err, TransportError::WouldBlock));
        assert!(started.elapsed() >= std::time::Duration::from_millis(40));
        drop(b);
    }

    #[test]
    fn health_reports_disconnect() {
        let (a, b) = UnixStream::pair().unwrap();
        let sock = DataSocket::new(a);
        assert!(sock.health().is_ok());
        drop(b);
        assert!(matches!(sock.health(), Err(TransportError::Disconnected)));
    }
}
