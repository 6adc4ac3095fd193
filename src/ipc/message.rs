//! Typed control-channel messages and their wire codec
//!
//! Every message is `{kind, name, length}` followed by a name-specific
//! payload. The length field covers the whole message including the
//! header. Encoding and decoding happen in exactly one place here; no
//! other module touches raw control-channel bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::transport::{TransportKind, TransportPreference};

pub const HEADER_LEN: usize = 4;

/// Fixed size of the destination address field (colon-separated Bluetooth
/// address plus NUL padding).
pub const ADDRESS_LEN: usize = 18;

/// Endpoint lock flags carried in capability blocks and OPEN requests
pub const LOCK_READ: u8 = 1 << 0;
pub const LOCK_WRITE: u8 = 1 << 1;

/// GET_CAPABILITIES request flags
pub const FLAG_AUTOCONNECT: u8 = 1 << 0;

/// SBC capability bitmasks, as advertised by the remote device
pub mod caps {
    pub const FREQ_16000: u8 = 1 << 3;
    pub const FREQ_32000: u8 = 1 << 2;
    pub const FREQ_44100: u8 = 1 << 1;
    pub const FREQ_48000: u8 = 1 << 0;

    pub const CHANNEL_MODE_MONO: u8 = 1 << 3;
    pub const CHANNEL_MODE_DUAL: u8 = 1 << 2;
    pub const CHANNEL_MODE_STEREO: u8 = 1 << 1;
    pub const CHANNEL_MODE_JOINT: u8 = 1 << 0;

    pub const BLOCK_LENGTH_4: u8 = 1 << 3;
    pub const BLOCK_LENGTH_8: u8 = 1 << 2;
    pub const BLOCK_LENGTH_12: u8 = 1 << 1;
    pub const BLOCK_LENGTH_16: u8 = 1 << 0;

    pub const SUBBANDS_4: u8 = 1 << 1;
    pub const SUBBANDS_8: u8 = 1 << 0;

    pub const ALLOCATION_SNR: u8 = 1 << 1;
    pub const ALLOCATION_LOUDNESS: u8 = 1 << 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Indication = 2,
    Error = 3,
}

impl MessageKind {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Indication),
            3 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Operation name used to match responses to requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageName {
    GetCapabilities = 0,
    Open = 1,
    SetConfiguration = 2,
    NewStream = 3,
    StartStream = 4,
    DelayReport = 9,
}

impl MessageName {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageName::GetCapabilities),
            1 => Some(MessageName::Open),
            2 => Some(MessageName::SetConfiguration),
            3 => Some(MessageName::NewStream),
            4 => Some(MessageName::StartStream),
            9 => Some(MessageName::DelayReport),
            _ => None,
        }
    }
}

/// SBC capability set: bitmasks while advertised, narrowed to single bits
/// (plus a concrete bitpool range) once negotiation settles on values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbcCapabilities {
    pub channel_mode: u8,
    pub frequency: u8,
    pub allocation: u8,
    pub subbands: u8,
    pub block_length: u8,
    pub min_bitpool: u8,
    pub max_bitpool: u8,
}

const SBC_CAPS_LEN: usize = 7;

impl SbcCapabilities {
    fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.channel_mode);
        dst.put_u8(self.frequency);
        dst.put_u8(self.allocation);
        dst.put_u8(self.subbands);
        dst.put_u8(self.block_length);
        dst.put_u8(self.min_bitpool);
        dst.put_u8(self.max_bitpool);
    }

    fn get(src: &mut &[u8]) -> Result<Self, ProtocolError> {
        if src.remaining() < SBC_CAPS_LEN {
            return Err(malformed("truncated SBC capabilities"));
        }
        Ok(SbcCapabilities {
            channel_mode: src.get_u8(),
            frequency: src.get_u8(),
            allocation: src.get_u8(),
            subbands: src.get_u8(),
            block_length: src.get_u8(),
            min_bitpool: src.get_u8(),
            max_bitpool: src.get_u8(),
        })
    }
}

/// PCM configuration for the voice channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmCapabilities {
    pub sample_rate: u32,
}

const PCM_CAPS_LEN: usize = 4;

/// One capability block from a GET_CAPABILITIES response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityBlock {
    pub transport: TransportKind,
    pub seid: u8,
    pub lock: u8,
    pub codec: CodecCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecCapabilities {
    Sbc(SbcCapabilities),
    Pcm(PcmCapabilities),
}

/// Codec configuration carried by SET_CONFIGURATION
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfig {
    Sbc(SbcCapabilities),
    Pcm(PcmCapabilities),
}

impl CodecConfig {
    fn transport(&self) -> TransportKind {
        match self {
            CodecConfig::Sbc(_) => TransportKind::Encoded,
            CodecConfig::Pcm(_) => TransportKind::Voice,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetCapabilities {
        destination: String,
        preference: TransportPreference,
        autoconnect: bool,
    },
    Open {
        destination: String,
        seid: u8,
        lock: u8,
    },
    SetConfiguration {
        seid: u8,
        config: CodecConfig,
    },
    StartStream,
}

impl Request {
    pub fn name(&self) -> MessageName {
        match self {
            Request::GetCapabilities { .. } => MessageName::GetCapabilities,
            Request::Open { .. } => MessageName::Open,
            Request::SetConfiguration { .. } => MessageName::SetConfiguration,
            Request::StartStream => MessageName::StartStream,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    GetCapabilities {
        transport: TransportKind,
        blocks: Vec<CapabilityBlock>,
    },
    Open,
    SetConfiguration {
        link_mtu: u16,
    },
    StartStream,
}

impl Response {
    pub fn name(&self) -> MessageName {
        match self {
            Response::GetCapabilities { .. } => MessageName::GetCapabilities,
            Response::Open => MessageName::Open,
            Response::SetConfiguration { .. } => MessageName::SetConfiguration,
            Response::StartStream => MessageName::StartStream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indication {
    NewStream,
    /// Remote sink delay in 0.1 ms units
    DelayReport {
        delay: u16,
    },
}

impl Indication {
    pub fn name(&self) -> MessageName {
        match self {
            Indication::NewStream => MessageName::NewStream,
            Indication::DelayReport { .. } => MessageName::DelayReport,
        }
    }
}

/// Any decoded control-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Indication(Indication),
    Error { name: MessageName, errno: i32 },
}

impl Message {
    pub fn name(&self) -> MessageName {
        match self {
            Message::Request(r) => r.name(),
            Message::Response(r) => r.name(),
            Message::Indication(i) => i.name(),
            Message::Error { name, .. } => *name,
        }
    }
}

fn malformed(what: &str) -> ProtocolError {
    ProtocolError::Malformed(what.to_string())
}

fn put_address(dst: &mut BytesMut, address: &str) {
    let bytes = address.as_bytes();
    let n = bytes.len().min(ADDRESS_LEN);
    dst.put_slice(&bytes[..n]);
    dst.put_bytes(0, ADDRESS_LEN - n);
}

fn get_address(src: &mut &[u8]) -> Result<String, ProtocolError> {
    if src.remaining() < ADDRESS_LEN {
        return Err(malformed("truncated address"));
    }
    let mut raw = [0u8; ADDRESS_LEN];
    src.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(ADDRESS_LEN);
    String::from_utf8(raw[..end].to_vec()).map_err(|_| malformed("non-UTF-8 address"))
}

fn finish(mut buf: BytesMut) -> BytesMut {
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_le_bytes());
    buf
}

fn header(kind: MessageKind, name: MessageName) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(kind as u8);
    buf.put_u8(name as u8);
    buf.put_u16_le(0); // patched by finish()
    buf
}

fn put_codec_config(dst: &mut BytesMut, config: &CodecConfig) {
    dst.put_u8(config.transport().wire());
    match config {
        CodecConfig::Sbc(caps) => caps.put(dst),
        CodecConfig::Pcm(pcm) => dst.put_u32_le(pcm.sample_rate),
    }
}

fn get_codec_payload(
    transport: TransportKind,
    src: &mut &[u8],
) -> Result<CodecCapabilities, ProtocolError> {
    match transport {
        TransportKind::Encoded => Ok(CodecCapabilities::Sbc(SbcCapabilities::get(src)?)),
        TransportKind::Voice => {
            if src.remaining() < PCM_CAPS_LEN {
                return Err(malformed("truncated PCM capabilities"));
            }
            Ok(CodecCapabilities::Pcm(PcmCapabilities {
                sample_rate: src.get_u32_le(),
            }))
        }
    }
}

/// Encode a message for the wire.
pub fn encode(msg: &Message) -> BytesMut {
    match msg {
        Message::Request(req) => encode_request(req),
        Message::Response(rsp) => encode_response(rsp),
        Message::Indication(ind) => encode_indication(ind),
        Message::Error { name, errno } => {
            let mut buf = header(MessageKind::Error, *name);
            buf.put_i32_le(*errno);
            finish(buf)
        }
    }
}

pub fn encode_request(req: &Request) -> BytesMut {
    let mut buf = header(MessageKind::Request, req.name());
    match req {
        Request::GetCapabilities {
            destination,
            preference,
            autoconnect,
        } => {
            buf.put_u8(if *autoconnect { FLAG_AUTOCONNECT } else { 0 });
            buf.put_u8(preference.wire());
            put_address(&mut buf, destination);
        }
        Request::Open {
            destination,
            seid,
            lock,
        } => {
            put_address(&mut buf, destination);
            buf.put_u8(*seid);
            buf.put_u8(*lock);
        }
        Request::SetConfiguration { seid, config } => {
            buf.put_u8(*seid);
            put_codec_config(&mut buf, config);
        }
        Request::StartStream => {}
    }
    finish(buf)
}

pub fn encode_response(rsp: &Response) -> BytesMut {
    let mut buf = header(MessageKind::Response, rsp.name());
    match rsp {
        Response::GetCapabilities { transport, blocks } => {
            buf.put_u8(transport.wire());
            for block in blocks {
                buf.put_u8(block.transport.wire());
                buf.put_u8(block.seid);
                buf.put_u8(block.lock);
                let mut payload = BytesMut::new();
                match &block.codec {
                    CodecCapabilities::Sbc(caps) => caps.put(&mut payload),
                    CodecCapabilities::Pcm(pcm) => payload.put_u32_le(pcm.sample_rate),
                }
                buf.put_u16_le(payload.len() as u16);
                buf.put_slice(&payload);
            }
        }
        Response::Open => {}
        Response::SetConfiguration { link_mtu } => buf.put_u16_le(*link_mtu),
        Response::StartStream => {}
    }
    finish(buf)
}

pub fn encode_indication(ind: &Indication) -> BytesMut {
    let mut buf = header(MessageKind::Indication, ind.name());
    if let Indication::DelayReport { delay } = ind {
        buf.put_u16_le(*delay);
    }
    finish(buf)
}

/// Decode one complete message (header included).
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(malformed("message shorter than header"));
    }
    let kind = MessageKind::from_wire(frame[0])
        .ok_or_else(|| malformed("unknown message kind"))?;
    let name = MessageName::from_wire(frame[1])
        .ok_or_else(|| malformed("unknown message name"))?;
    let length = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    if length != frame.len() {
        return Err(malformed("length field does not match frame"));
    }
    let mut src = &frame[HEADER_LEN..];

    match kind {
        MessageKind::Error => {
            if src.remaining() < 4 {
                return Err(malformed("truncated error reply"));
            }
            Ok(Message::Error {
                name,
                errno: src.get_i32_le(),
            })
        }
        MessageKind::Request => decode_request(name, &mut src).map(Message::Request),
        MessageKind::Response => decode_response(name, &mut src).map(Message::Response),
        MessageKind::Indication => decode_indication(name, &mut src).map(Message::Indication),
    }
}

fn decode_request(name: MessageName, src: &mut &[u8]) -> Result<Request, ProtocolError> {
    match name {
        MessageName::GetCapabilities => {
            if src.remaining() < 2 {
                return Err(malformed("truncated GET_CAPABILITIES request"));
            }
            let flags = src.get_u8();
            let preference = match src.get_u8() {
                0 => TransportPreference::Voice,
                1 => TransportPreference::Encoded,
                2 => TransportPreference::Auto,
                _ => return Err(malformed("unknown transport preference")),
            };
            Ok(Request::GetCapabilities {
                autoconnect: flags & FLAG_AUTOCONNECT != 0,
                preference,
                destination: get_address(src)?,
            })
        }
        MessageName::Open => {
            let destination = get_address(src)?;
            if src.remaining() < 2 {
                return Err(malformed("truncated OPEN request"));
            }
            Ok(Request::Open {
                destination,
                seid: src.get_u8(),
                lock: src.get_u8(),
            })
        }
        MessageName::SetConfiguration => {
            if src.remaining() < 2 {
                return Err(malformed("truncated SET_CONFIGURATION request"));
            }
            let seid = src.get_u8();
            let transport = TransportKind::from_wire(src.get_u8())
                .ok_or_else(|| malformed("unknown transport"))?;
            let config = match get_codec_payload(transport, src)? {
                CodecCapabilities::Sbc(caps) => CodecConfig::Sbc(caps),
                CodecCapabilities::Pcm(pcm) => CodecConfig::Pcm(pcm),
            };
            Ok(Request::SetConfiguration { seid, config })
        }
        MessageName::StartStream => Ok(Request::StartStream),
        other => Err(malformed(&format!("{other:?} is not a request"))),
    }
}

fn decode_response(name: MessageName, src: &mut &[u8]) -> Result<Response, ProtocolError> {
    match name {
        MessageName::GetCapabilities => {
            if src.remaining() < 1 {
                return Err(malformed("truncated GET_CAPABILITIES response"));
            }
            let transport = TransportKind::from_wire(src.get_u8())
                .ok_or_else(|| malformed("unknown transport"))?;
            let mut blocks = Vec::new();
            while src.has_remaining() {
                if src.remaining() < 5 {
                    return Err(malformed("truncated capability block"));
                }
                let block_transport = TransportKind::from_wire(src.get_u8())
                    .ok_or_else(|| malformed("unknown transport"))?;
                let seid = src.get_u8();
                let lock = src.get_u8();
                let payload_len = src.get_u16_le() as usize;
                if src.remaining() < payload_len {
                    return Err(malformed("capability block overruns frame"));
                }
                let rest = *src;
                let (mut payload, rest) = rest.split_at(payload_len);
                let codec = get_codec_payload(block_transport, &mut payload)?;
                *src = rest;
                blocks.push(CapabilityBlock {
                    transport: block_transport,
                    seid,
                    lock,
                    codec,
                });
            }
            Ok(Response::GetCapabilities { transport, blocks })
        }
        MessageName::Open => Ok(Response::Open),
        MessageName::SetConfiguration => {
            if src.remaining() < 2 {
                return Err(malformed("truncated SET_CONFIGURATION response"));
            }
            Ok(Response::SetConfiguration {
                link_mtu: src.get_u16_le(),
            })
        }
        MessageName::StartStream => Ok(Response::StartStream),
        other => Err(malformed(&format!("{other:?} is not a response"))),
    }
}

fn decode_indication(name: MessageName, src: &mut &[u8]) -> Result<Indication, ProtocolError> {
    match name {
        MessageName::NewStream => Ok(Indication::NewStream),
        MessageName::DelayReport => {
            if src.remaining() < 2 {
                return Err(malformed("truncated DELAY_REPORT"));
            }
            Ok(Indication::DelayReport {
                delay: src.get_u16_le(),
            })
        }
        other => Err(malformed(&format!("{other:?} is not an indication"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let wire = encode(&msg);
        let back = decode(&wire).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn request_roundtrips() {
        roundtrip(Message::Request(Request::GetCapabilities {
            destination: "00:11:22:33:44:55".into(),
            preference: TransportPreference::Encoded,
            autoconnect: true,
        }));
        roundtrip(Message::Request(Request::Open {
            destination: "00:11:22:33:44:55".into(),
            seid: 3,
            lock: LOCK_WRITE,
        }));
        roundtrip(Message::Request(Request::SetConfiguration {
            seid: 3,
            config: CodecConfig::Sbc(SbcCapabilities {
                channel_mode: caps::CHANNEL_MODE_JOINT,
                frequency: caps::FREQ_44100,
                allocation: caps::ALLOCATION_LOUDNESS,
                subbands: caps::SUBBANDS_8,
                block_length: caps::BLOCK_LENGTH_16,
                min_bitpool: 2,
                max_bitpool: 53,
            }),
        }));
        roundtrip(Message::Request(Request::StartStream));
    }

    #[test]
    fn response_roundtrips() {
        roundtrip(Message::Response(Response::GetCapabilities {
            transport: TransportKind::Encoded,
            blocks: vec![CapabilityBlock {
                transport: TransportKind::Encoded,
                seid: 1,
                lock: 0,
                codec: CodecCapabilities::Sbc(SbcCapabilities {
                    channel_mode: 0x0f,
                    frequency: 0x0f,
                    allocation: 0x03,
                    subbands: 0x03,
                    block_length: 0x0f,
                    min_bitpool: 2,
                    max_bitpool: 64,
                }),
            }],
        }));
        roundtrip(Message::Response(Response::SetConfiguration { link_mtu: 679 }));
        roundtrip(Message::Indication(Indication::DelayReport { delay: 1500 }));
        roundtrip(Message::Error {
            name: MessageName::StartStream,
            errno: libc::EAGAIN,
        });
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut wire = encode(&Message::Request(Request::StartStream)).to_vec();
        wire.push(0);
        assert!(decode(&wire).is_err());
    }

    #[test]
    fn address_padding_strips_nuls() {
        let wire = encode(&Message::Request(Request::Open {
            destination: "AA:BB".into(),
            seid: 1,
            lock: LOCK_READ,
        }));
        match decode(&wire).unwrap() {
            Message::Request(Request::Open { destination, .. }) => {
                assert_eq!(destination, "AA:BB");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
