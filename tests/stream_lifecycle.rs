//! End-to-end stream lifecycle tests: a scripted or wire-level fake
//! service on one side, the public stream surface on the other.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use bt_audio_bridge::codec::sbc::{SbcCodec, SbcParams};
use bt_audio_bridge::config::StreamConfig;
use bt_audio_bridge::error::{CodecError, ProtocolError};
use bt_audio_bridge::ipc::client::send_fd;
use bt_audio_bridge::ipc::message::{
    self, caps, CapabilityBlock, CodecCapabilities, PcmCapabilities, SbcCapabilities,
    HEADER_LEN,
};
use bt_audio_bridge::ipc::{
    ControlChannel, DelayPoller, Indication, Message, MessageName, Request, Response,
    ServiceClient,
};
use bt_audio_bridge::rtp::{self, MediaPacketHeader};
use bt_audio_bridge::stream::{BluetoothStream, HwParams, PcmState};
use bt_audio_bridge::transport::{DataSocket, Direction, TransportKind};
use bt_audio_bridge::{SessionRegistry, TransportPreference};

/// Encoder stand-in producing fixed-size frames of filler bytes.
struct StubCodec {
    frame_len: usize,
}

impl SbcCodec for StubCodec {
    fn configure(&mut self, params: &SbcParams) -> Result<(), CodecError> {
        self.frame_len = params.frame_length();
        Ok(())
    }

    fn encode(&mut self, _pcm: &[u8], out: &mut [u8]) -> Result<usize, CodecError> {
        out[..self.frame_len].fill(0xC3);
        Ok(self.frame_len)
    }
}

struct SleepyPoller;

impl DelayPoller for SleepyPoller {
    fn poll_delay(&mut self, timeout: Duration) -> Result<Option<u16>, ProtocolError> {
        thread::sleep(timeout);
        Ok(None)
    }
}

/// Scripted control channel sharing its request log with the test.
struct ScriptedChannel {
    requests: Arc<Mutex<Vec<Request>>>,
    responses: VecDeque<Result<Response, ProtocolError>>,
    indications: VecDeque<Indication>,
    sockets: VecDeque<UnixStream>,
}

impl ScriptedChannel {
    fn new() -> (Self, Arc<Mutex<Vec<Request>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                requests: Arc::clone(&requests),
                responses: VecDeque::new(),
                indications: VecDeque::new(),
                sockets: VecDeque::new(),
            },
            requests,
        )
    }
}

impl ControlChannel for ScriptedChannel {
    fn request(&mut self, req: Request) -> Result<Response, ProtocolError> {
        self.requests.lock().push(req);
        self.responses
            .pop_front()
            .unwrap_or(Err(ProtocolError::Timeout))
    }

    fn expect_indication(&mut self, name: MessageName) -> Result<Indication, ProtocolError> {
        match self.indications.pop_front() {
            Some(ind) if ind.name() == name => Ok(ind),
            Some(ind) => Err(ProtocolError::UnexpectedMessage {
                expected: name,
                got: ind.name(),
            }),
            None => Err(ProtocolError::Timeout),
        }
    }

    fn take_data_socket(&mut self) -> Result<DataSocket, ProtocolError> {
        self.sockets
            .pop_front()
            .map(DataSocket::new)
            .ok_or(ProtocolError::Timeout)
    }

    fn delay_poller(&self) -> Result<Box<dyn DelayPoller>, ProtocolError> {
        Ok(Box::new(SleepyPoller))
    }
}

fn full_sbc_caps() -> SbcCapabilities {
    SbcCapabilities {
        channel_mode: 0x0f,
        frequency: 0x0f,
        allocation: 0x03,
        subbands: 0x03,
        block_length: 0x0f,
        min_bitpool: 2,
        max_bitpool: 64,
    }
}

fn sbc_endpoint(seid: u8) -> CapabilityBlock {
    CapabilityBlock {
        transport: TransportKind::Encoded,
        seid,
        lock: 0,
        codec: CodecCapabilities::Sbc(full_sbc_caps()),
    }
}

fn read_wire_frame(stream: &mut UnixStream) -> Option<Message> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).ok()?;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    let mut frame = vec![0u8; length];
    frame[..HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut frame[HEADER_LEN..]).ok()?;
    message::decode(&frame).ok()
}

/// Wire-level fake service: speaks the real control protocol over a
/// socket pair and hands over a real data descriptor.
fn spawn_fake_service(
    mut control: UnixStream,
    data_remote_keeper: std::sync::mpsc::Sender<UnixStream>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("fake-audio-service".into())
        .spawn(move || {
            loop {
                // A failed read means the client hung up: done serving.
                let Some(msg) = read_wire_frame(&mut control) else {
                    return;
                };
                let Message::Request(req) = msg else { continue };
                match req {
                    Request::GetCapabilities { .. } => {
                        let rsp = Response::GetCapabilities {
                            transport: TransportKind::Encoded,
                            blocks: vec![sbc_endpoint(4)],
                        };
                        control
                            .write_all(&message::encode_response(&rsp))
                            .unwrap();
                    }
                    Request::Open { .. } => {
                        control
                            .write_all(&message::encode_response(&Response::Open))
                            .unwrap();
                    }
                    Request::SetConfiguration { .. } => {
                        control
                            .write_all(&message::encode_response(
                                &Response::SetConfiguration { link_mtu: 679 },
                            ))
                            .unwrap();
                        control
                            .write_all(&message::encode_indication(
                                &Indication::DelayReport { delay: 1500 },
                            ))
                            .unwrap();
                    }
                    Request::StartStream => {
                        control
                            .write_all(&message::encode_response(&Response::StartStream))
                            .unwrap();
                        control
                            .write_all(&message::encode_indication(&Indication::NewStream))
                            .unwrap();
                        let (local, remote) = UnixStream::pair().unwrap();
                        send_fd(control.as_raw_fd(), local.as_raw_fd()).unwrap();
                        // Keep the far end alive for the duration of the
                        // test; the clock health-probes it.
                        let _ = data_remote_keeper.send(remote);
                    }
                }
            }
        })
        .unwrap()
}

#[test]
fn encoded_playback_over_the_wire_protocol() {
    let (client_end, service_end) = UnixStream::pair().unwrap();
    let (keeper_tx, keeper_rx) = std::sync::mpsc::channel();
    let _service = spawn_fake_service(service_end, keeper_tx);

    let client = ServiceClient::from_stream(client_end).unwrap();
    let mut config = StreamConfig::new("00:11:22:33:44:55");
    config.profile = TransportPreference::Encoded;

    let mut stream = BluetoothStream::open_with_channel(
        config,
        Direction::Playback,
        Box::new(client),
        None,
        Some(Box::new(StubCodec { frame_len: 0 })),
    )
    .unwrap();

    stream
        .hw_params(HwParams {
            rate: 44_100,
            channels: 2,
            period_size: 1024,
            periods: 2,
            start_threshold: 1024,
        })
        .unwrap();
    stream.prepare().unwrap();
    assert_eq!(stream.state(), PcmState::Prepared);

    let mut data_remote = keeper_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("service never handed over the data channel");

    // 44.1 kHz joint stereo, 8 subbands, 16 blocks, bitpool 53: codesize
    // 512 and frame length 119. Five frames fill a 679-byte MTU (13 + 595
    // = 608; a sixth would overflow), so ten blocks yield one packet.
    let pcm = vec![0u8; 512 * 10];
    let frames = stream.writei(&pcm).unwrap();
    assert_eq!(frames, (512 * 10 / 4) as u64);
    assert_eq!(stream.state(), PcmState::Running);

    let mut packet = [0u8; 608];
    data_remote.read_exact(&mut packet).unwrap();
    let header = MediaPacketHeader::parse(&packet).unwrap();
    assert_eq!(header.sequence, 0);
    assert_eq!(header.timestamp, 0);
    assert_eq!(header.frame_count, 5);
    assert!(packet[rtp::HEADER_LEN..].iter().all(|&b| b == 0xC3));

    // Freeze the clock before checking the delay so the assertion does
    // not race the pointer. 1500 tenths of a ms at 44.1 kHz is 6615
    // frames of sink latency on top of whatever is still queued.
    stream.stop().unwrap();
    let delay = stream.delay().unwrap();
    assert!(delay >= 5000, "delay {delay} missing the sink term");

    stream.close();
}

#[test]
fn unchanged_hw_params_cause_no_control_traffic() {
    let (mut channel, log) = ScriptedChannel::new();
    channel.responses.push_back(Ok(Response::GetCapabilities {
        transport: TransportKind::Encoded,
        blocks: vec![sbc_endpoint(4)],
    }));
    channel.responses.push_back(Ok(Response::Open));
    channel
        .responses
        .push_back(Ok(Response::SetConfiguration { link_mtu: 679 }));
    channel
        .indications
        .push_back(Indication::DelayReport { delay: 0 });

    let mut config = StreamConfig::new("00:11:22:33:44:55");
    config.profile = TransportPreference::Encoded;
    let mut stream = BluetoothStream::open_with_channel(
        config,
        Direction::Playback,
        Box::new(channel),
        None,
        Some(Box::new(StubCodec { frame_len: 0 })),
    )
    .unwrap();

    let hw = HwParams {
        rate: 44_100,
        channels: 2,
        period_size: 1024,
        periods: 2,
        start_threshold: 1024,
    };
    stream.hw_params(hw).unwrap();
    let exchanges = log.lock().len();

    // Same parameters again: the session must stay silent.
    stream.hw_params(hw).unwrap();
    assert_eq!(log.lock().len(), exchanges);
}

#[test]
fn closed_endpoint_on_start_reopens_and_retries() {
    let (mut channel, log) = ScriptedChannel::new();
    channel.responses.push_back(Ok(Response::GetCapabilities {
        transport: TransportKind::Encoded,
        blocks: vec![sbc_endpoint(4)],
    }));
    // First round: open + configure succeed, start is refused with the
    // endpoint-gone error.
    channel.responses.push_back(Ok(Response::Open));
    channel
        .responses
        .push_back(Ok(Response::SetConfiguration { link_mtu: 679 }));
    channel
        .indications
        .push_back(Indication::DelayReport { delay: 0 });
    channel.responses.push_back(Err(ProtocolError::Remote {
        name: MessageName::StartStream,
        errno: libc::EAGAIN,
    }));
    // Second round: full reopen succeeds.
    channel.responses.push_back(Ok(Response::Open));
    channel
        .responses
        .push_back(Ok(Response::SetConfiguration { link_mtu: 679 }));
    channel
        .indications
        .push_back(Indication::DelayReport { delay: 0 });
    channel.responses.push_back(Ok(Response::StartStream));
    channel.indications.push_back(Indication::NewStream);
    let (local, _remote) = UnixStream::pair().unwrap();
    channel.sockets.push_back(local);

    let mut config = StreamConfig::new("00:11:22:33:44:55");
    config.profile = TransportPreference::Encoded;
    let mut stream = BluetoothStream::open_with_channel(
        config,
        Direction::Playback,
        Box::new(channel),
        None,
        Some(Box::new(StubCodec { frame_len: 0 })),
    )
    .unwrap();

    stream
        .hw_params(HwParams {
            rate: 44_100,
            channels: 2,
            period_size: 1024,
            periods: 2,
            start_threshold: 1024,
        })
        .unwrap();
    stream.prepare().unwrap();
    assert_eq!(stream.state(), PcmState::Prepared);

    let requests = log.lock();
    let opens = requests
        .iter()
        .filter(|r| matches!(r, Request::Open { .. }))
        .count();
    assert_eq!(opens, 2, "endpoint-gone start must redo OPEN");
    stream.close();
}

#[test]
fn reclaimed_session_skips_negotiation() {
    let registry = SessionRegistry::new();

    let (mut channel, log) = ScriptedChannel::new();
    channel.responses.push_back(Ok(Response::GetCapabilities {
        transport: TransportKind::Voice,
        blocks: vec![CapabilityBlock {
            transport: TransportKind::Voice,
            seid: 0,
            lock: 0,
            codec: CodecCapabilities::Pcm(PcmCapabilities { sample_rate: 8000 }),
        }],
    }));
    channel.responses.push_back(Ok(Response::Open));
    channel
        .responses
        .push_back(Ok(Response::SetConfiguration { link_mtu: 48 }));
    channel
        .indications
        .push_back(Indication::DelayReport { delay: 0 });
    channel.responses.push_back(Ok(Response::StartStream));
    channel.indications.push_back(Indication::NewStream);
    let (local, _remote) = UnixStream::pair().unwrap();
    channel.sockets.push_back(local);

    let mut config = StreamConfig::new("00:11:22:33:44:55");
    config.profile = TransportPreference::Voice;
    let mut first = BluetoothStream::open_with_channel(
        config.clone(),
        Direction::Playback,
        Box::new(channel),
        Some(registry.clone()),
        None,
    )
    .unwrap();

    let hw = HwParams {
        rate: 8000,
        channels: 1,
        period_size: 24,
        periods: 4,
        start_threshold: 24,
    };
    first.hw_params(hw).unwrap();
    first.prepare().unwrap();
    first.close();
    let exchanges = log.lock().len();

    // The reopen lands inside the grace period: the parked session is
    // reused, its already-started state survives, and the scripted
    // channel sees no further traffic.
    let (fresh_channel, _) = ScriptedChannel::new();
    let mut second = BluetoothStream::open_with_channel(
        config,
        Direction::Playback,
        Box::new(fresh_channel),
        Some(registry.clone()),
        None,
    )
    .unwrap();
    second.hw_params(hw).unwrap();
    second.prepare().unwrap();
    assert_eq!(second.state(), PcmState::Prepared);
    assert_eq!(log.lock().len(), exchanges);
    second.close();
}

#[test]
fn expired_park_means_fresh_negotiation() {
    let registry = SessionRegistry::new();

    let (mut channel, _log) = ScriptedChannel::new();
    channel.responses.push_back(Ok(Response::GetCapabilities {
        transport: TransportKind::Voice,
        blocks: vec![CapabilityBlock {
            transport: TransportKind::Voice,
            seid: 0,
            lock: 0,
            codec: CodecCapabilities::Pcm(PcmCapabilities { sample_rate: 8000 }),
        }],
    }));
    channel.responses.push_back(Ok(Response::Open));
    channel
        .responses
        .push_back(Ok(Response::SetConfiguration { link_mtu: 48 }));
    channel
        .indications
        .push_back(Indication::DelayReport { delay: 0 });

    let mut config = StreamConfig::new("00:11:22:33:44:55");
    config.profile = TransportPreference::Voice;
    let mut first = BluetoothStream::open_with_channel(
        config.clone(),
        Direction::Playback,
        Box::new(channel),
        Some(registry.clone()),
        None,
    )
    .unwrap();
    first
        .hw_params(HwParams {
            rate: 8000,
            channels: 1,
            period_size: 24,
            periods: 4,
            start_threshold: 24,
        })
        .unwrap();
    first.close();

    thread::sleep(Duration::from_millis(1300));
    assert!(registry
        .claim("00:11:22:33:44:55", TransportKind::Voice)
        .is_none());
}

#[test]
fn capabilities_constants_line_up_with_the_protocol() {
    // The advertised masks drive negotiation; a silent renumbering of the
    // bits would negotiate garbage, so pin them here.
    assert_eq!(caps::FREQ_48000, 1 << 0);
    assert_eq!(caps::FREQ_16000, 1 << 3);
    assert_eq!(caps::CHANNEL_MODE_JOINT, 1 << 0);
    assert_eq!(caps::SUBBANDS_8, 1 << 0);
    assert_eq!(caps::BLOCK_LENGTH_16, 1 << 0);
    assert_eq!(caps::ALLOCATION_LOUDNESS, 1 << 0);
}
