//! Control-channel client
//!
//! Blocking request/response client for the audio service socket. Every
//! receive is bounded by [`crate::constants::RECV_TIMEOUT`]; an error reply
//! arriving in place of the expected response is decoded into the remote's
//! POSIX error code instead of the payload.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::time::Duration;

use crate::constants::RECV_TIMEOUT;
use crate::error::ProtocolError;
use crate::ipc::message::{
    self, Indication, Message, MessageKind, MessageName, Request, Response, HEADER_LEN,
};
use crate::transport::DataSocket;

/// Abstract-namespace name of the audio service socket
pub const SERVICE_SOCKET_NAME: &[u8] = b"/org/bluez/audio";

/// Typed request/response access to the audio service.
///
/// This is the seam between the negotiation state machine and the socket
/// framing; tests substitute scripted implementations.
pub trait ControlChannel: Send {
    /// Send a request and block for the matching response.
    fn request(&mut self, req: Request) -> Result<Response, ProtocolError>;

    /// Block for a specific server-initiated indication.
    fn expect_indication(&mut self, name: MessageName) -> Result<Indication, ProtocolError>;

    /// Receive the data-channel descriptor announced by NEW_STREAM.
    fn take_data_socket(&mut self) -> Result<DataSocket, ProtocolError>;

    /// Independent handle for draining unsolicited delay reports. The
    /// clock thread owns the returned poller.
    fn delay_poller(&self) -> Result<Box<dyn DelayPoller>, ProtocolError>;
}

/// Bounded wait for an unsolicited DELAY_REPORT indication.
pub trait DelayPoller: Send {
    /// Wait up to `timeout`; returns the reported sink delay in 0.1 ms
    /// units, or `None` if nothing relevant arrived. Messages other than
    /// delay reports are left queued for the owning client.
    fn poll_delay(&mut self, timeout: Duration) -> Result<Option<u16>, ProtocolError>;
}

/// Concrete client over the service's Unix socket
pub struct ServiceClient {
    stream: UnixStream,
}

impl ServiceClient {
    /// Connect to the audio service's abstract socket.
    pub fn connect() -> Result<Self, ProtocolError> {
        let addr = SocketAddr::from_abstract_name(SERVICE_SOCKET_NAME)
            .map_err(|e| ProtocolError::Socket(e.to_string()))?;
        let stream = UnixStream::connect_addr(&addr)
            .map_err(|e| ProtocolError::Socket(format!("connect: {e}")))?;
        Self::from_stream(stream)
    }

    /// Wrap an already-connected stream (tests, alternate service paths).
    pub fn from_stream(stream: UnixStream) -> Result<Self, ProtocolError> {
        stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| ProtocolError::Socket(e.to_string()))?;
        Ok(Self { stream })
    }

    fn send(&mut self, req: &Request) -> Result<(), ProtocolError> {
        let frame = message::encode_request(req);
        tracing::debug!(name = ?req.name(), len = frame.len(), "sending request");
        self.stream
            .write_all(&frame)
            .map_err(|e| ProtocolError::Socket(format!("send: {e}")))
    }

    fn recv(&mut self) -> Result<Message, ProtocolError> {
        let frame = read_frame(&mut self.stream)?;
        let msg = message::decode(&frame)?;
        tracing::debug!(name = ?msg.name(), "received message");
        if let Message::Error { name, errno } = msg {
            return Err(ProtocolError::Remote { name, errno });
        }
        Ok(msg)
    }
}

fn map_recv_err(e: io::Error) -> ProtocolError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtocolError::Timeout,
        _ => ProtocolError::Socket(format!("recv: {e}")),
    }
}

fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).map_err(map_recv_err)?;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Err(ProtocolError::Malformed("length below header size".into()));
    }
    let mut frame = vec![0u8; length];
    frame[..HEADER_LEN].copy_from_slice(&header);
    stream
        .read_exact(&mut frame[HEADER_LEN..])
        .map_err(map_recv_err)?;
    Ok(frame)
}

impl ControlChannel for ServiceClient {
    fn request(&mut self, req: Request) -> Result<Response, ProtocolError> {
        let expected = req.name();
        self.send(&req)?;
        match self.recv()? {
            Message::Response(rsp) if rsp.name() == expected => Ok(rsp),
            other => Err(ProtocolError::UnexpectedMessage {
                expected,
                got: other.name(),
            }),
        }
    }

    fn expect_indication(&mut self, name: MessageName) -> Result<Indication, ProtocolError> {
        match self.recv()? {
            Message::Indication(ind) if ind.name() == name => Ok(ind),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: name,
                got: other.name(),
            }),
        }
    }

    fn take_data_socket(&mut self) -> Result<DataSocket, ProtocolError> {
        let fd = recv_fd(self.stream.as_raw_fd())
            .map_err(|e| ProtocolError::Socket(format!("descriptor receipt: {e}")))?;
        // Safety: the descriptor was just received via SCM_RIGHTS and is
        // owned by nobody else in this process.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(DataSocket::new(stream))
    }

    fn delay_poller(&self) -> Result<Box<dyn DelayPoller>, ProtocolError> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| ProtocolError::Socket(e.to_string()))?;
        Ok(Box::new(ServiceDelayPoller { stream }))
    }
}

/// Receive a single descriptor attached to a one-byte message.
fn recv_fd(socket: RawFd) -> io::Result<RawFd> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u8; 32];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no descriptor attached to stream announcement",
            ));
        }
        Ok(*(libc::CMSG_DATA(cmsg) as *const RawFd))
    }
}

/// Send a descriptor the way the service does. Exposed for fake services
/// in tests and tooling.
#[doc(hidden)]
pub fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u8; 32];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
        *(libc::CMSG_DATA(cmsg) as *mut RawFd) = fd;
    }

    let n = unsafe { libc::sendmsg(socket, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct ServiceDelayPoller {
    stream: UnixStream,
}

/// Bounded wait for readability. `poll(2)` rather than SO_RCVTIMEO: the
/// poller's stream is a clone sharing its open file description with the
/// owning client, so the receive timeout must stay untouched.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128).max(1) as libc::c_int;
    let n = unsafe { libc::poll(&mut pfd, 1, ms) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n > 0)
}

fn peek_bytes(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

impl DelayPoller for ServiceDelayPoller {
    fn poll_delay(&mut self, timeout: Duration) -> Result<Option<u16>, ProtocolError> {
        let fd = self.stream.as_raw_fd();
        match wait_readable(fd, timeout) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => return Err(ProtocolError::Socket(format!("poll: {e}"))),
        }

        // Peek first: anything that is not a delay report stays queued for
        // the request/response path.
        let mut header = [0u8; HEADER_LEN];
        let n = match peek_bytes(fd, &mut header) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(ProtocolError::Socket(format!("peek: {e}"))),
        };
        if n == 0 {
            // Control channel EOF. Keep pacing; teardown is driven by the
            // data-channel health check.
            std::thread::sleep(timeout);
            return Ok(None);
        }
        if n < HEADER_LEN
            || header[0] != MessageKind::Indication as u8
            || header[1] != MessageName::DelayReport as u8
        {
            return Ok(None);
        }

        let frame = read_frame(&mut self.stream)?;
        match message::decode(&frame)? {
            Message::Indication(Indication::DelayReport { delay }) => Ok(Some(delay)),
            _ => Ok(None),
        }
    }
}
