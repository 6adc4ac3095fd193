//! Transfer pipelines
//!
//! One strategy per transport/direction pair. The encoded playback path
//! accumulates PCM into whole codesize blocks (a carry buffer holds the
//! trailing partial block between calls), encodes, and packs compressed
//! frames into media packets up to the link MTU. The voice paths move raw
//! transfer units. Capture over the encoded transport is not supported.

use crate::codec::sbc::{SbcCodec, SbcParams};
use crate::config::OverrunPolicy;
use crate::error::{CodecError, Error, ProtocolError, Result, TransportError};
use crate::rtp::{self, MediaPacketHeader};
use crate::session::NegotiatedConfig;
use crate::transport::{DataSocket, Direction, TransportKind};

/// Hard cap from the 4-bit frame-count field in the payload descriptor
const MAX_FRAMES_PER_PACKET: u8 = 15;

pub enum Pipeline {
    EncodedPlayback(EncodedPlayback),
    VoicePlayback(VoicePlayback),
    VoiceCapture(VoiceCapture),
}

impl Pipeline {
    /// Build the strategy for a negotiated stream. Buffers are sized here,
    /// after negotiation succeeded, so a failed negotiation never leaves a
    /// partially sized pipeline behind.
    pub fn new(
        negotiated: &NegotiatedConfig,
        direction: Direction,
        codec: Option<Box<dyn SbcCodec>>,
        policy: OverrunPolicy,
    ) -> Result<Self> {
        match (negotiated.kind, direction) {
            (TransportKind::Encoded, Direction::Playback) => {
                let params = negotiated
                    .sbc
                    .ok_or(Error::Codec(CodecError::Missing))?;
                let frame_length = params.frame_length();
                if negotiated.link_mtu < rtp::HEADER_LEN + frame_length {
                    return Err(Error::Protocol(ProtocolError::Malformed(format!(
                        "link MTU {} cannot carry one {frame_length}-byte frame",
                        negotiated.link_mtu
                    ))));
                }
                let mut codec = codec.ok_or(Error::Codec(CodecError::Missing))?;
                codec.configure(&params).map_err(Error::Codec)?;
                Ok(Pipeline::EncodedPlayback(EncodedPlayback::new(
                    codec,
                    params,
                    negotiated.link_mtu,
                    policy,
                )))
            }
            (TransportKind::Encoded, Direction::Capture) => {
                Err(Error::Transport(TransportError::Unsupported))
            }
            (TransportKind::Voice, Direction::Playback) => {
                Ok(Pipeline::VoicePlayback(VoicePlayback::new(
                    negotiated.link_mtu,
                )))
            }
            (TransportKind::Voice, Direction::Capture) => {
                Ok(Pipeline::VoiceCapture(VoiceCapture::new(
                    negotiated.link_mtu,
                )))
            }
        }
    }

    /// Recover the codec for the next negotiation round.
    pub fn into_codec(self) -> Option<Box<dyn SbcCodec>> {
        match self {
            Pipeline::EncodedPlayback(p) => Some(p.codec),
            _ => None,
        }
    }

    /// Bytes of PCM consumed from `pcm`.
    pub fn write(&mut self, pcm: &[u8], sock: &DataSocket) -> Result<usize> {
        match self {
            Pipeline::EncodedPlayback(p) => p.write(pcm, sock),
            Pipeline::VoicePlayback(p) => p.write(pcm, sock),
            Pipeline::VoiceCapture(_) => {
                Err(Error::Transport(TransportError::Unsupported))
            }
        }
    }

    /// Bytes copied into `out`, plus whether a fresh transfer unit was
    /// pulled off the socket (the caller advances the pointer on that).
    pub fn read(
        &mut self,
        out: &mut [u8],
        sock: &mut DataSocket,
        nonblocking: bool,
    ) -> Result<(usize, bool)> {
        match self {
            Pipeline::VoiceCapture(p) => p.read(out, sock, nonblocking),
            _ => Err(Error::Transport(TransportError::Unsupported)),
        }
    }
}

/// SBC encode + packetize + transmit
pub struct EncodedPlayback {
    codec: Box<dyn SbcCodec>,
    codesize: usize,
    frame_length: usize,
    samples_per_frame: u32,
    link_mtu: usize,
    policy: OverrunPolicy,
    /// Outgoing packet; `fill` starts past the header
    wire: Vec<u8>,
    fill: usize,
    /// Trailing partial codesize block from the previous call
    carry: Vec<u8>,
    carry_len: usize,
    frame_count: u8,
    packet_samples: u32,
    /// Cumulative samples transmitted, used as the packet timestamp
    nsamples: u32,
    sequence: u16,
}

impl EncodedPlayback {
    fn new(
        codec: Box<dyn SbcCodec>,
        params: SbcParams,
        link_mtu: usize,
        policy: OverrunPolicy,
    ) -> Self {
        let codesize = params.codesize();
        Self {
            codec,
            codesize,
            frame_length: params.frame_length(),
            samples_per_frame: params.subbands as u32 * params.blocks as u32,
            link_mtu,
            policy,
            wire: vec![0; link_mtu],
            fill: rtp::HEADER_LEN,
            carry: vec![0; codesize],
            carry_len: 0,
            frame_count: 0,
            packet_samples: 0,
            nsamples: 0,
            sequence: 0,
        }
    }

    pub fn write(&mut self, mut pcm: &[u8], sock: &DataSocket) -> Result<usize> {
        let mut consumed = 0;

        if self.carry_len > 0 {
            let need = self.codesize - self.carry_len;
            let take = need.min(pcm.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&pcm[..take]);
            self.carry_len += take;
            consumed += take;
            pcm = &pcm[take..];
            if self.carry_len < self.codesize {
                return Ok(consumed);
            }
            // Move the completed block out so it can be encoded while
            // `self` is borrowed mutably, then hand the buffer back.
            let block = std::mem::take(&mut self.carry);
            let encoded = self.encode_block_slice(&block, sock);
            self.carry = block;
            self.carry_len = 0;
            encoded?;
        }

        while pcm.len() >= self.codesize {
            let (block, rest) = pcm.split_at(self.codesize);
            self.encode_block_slice(block, sock)?;
            pcm = rest;
            consumed += self.codesize;
        }

        if !pcm.is_empty() {
            self.carry[..pcm.len()].copy_from_slice(pcm);
            self.carry_len = pcm.len();
            consumed += pcm.len();
        }

        Ok(consumed)
    }

    fn encode_block_slice(&mut self, block: &[u8], sock: &DataSocket) -> Result<()> {
        if self.fill + self.frame_length > self.link_mtu
            || self.frame_count == MAX_FRAMES_PER_PACKET
        {
            self.transmit(sock)?;
        }
        let Self { codec, wire, fill, .. } = self;
        let written = codec.encode(block, &mut wire[*fill..]).map_err(Error::Codec)?;
        if written == 0 {
            return Err(Error::Codec(CodecError::EmptyBlock));
        }
        self.fill += written;
        self.frame_count += 1;
        self.packet_samples += self.samples_per_frame;
        Ok(())
    }

    /// Send the accumulated packet. Counters reset whether or not the
    /// packet made it out, so a stall never poisons the next packet.
    fn transmit(&mut self, sock: &DataSocket) -> Result<()> {
        if self.frame_count == 0 {
            return Ok(());
        }
        MediaPacketHeader {
            sequence: self.sequence,
            timestamp: self.nsamples,
            frame_count: self.frame_count,
        }
        .write_to(&mut self.wire[..rtp::HEADER_LEN]);

        let sent = sock
            .send_nonblocking(&self.wire[..self.fill])
            .map_err(Error::Transport)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.nsamples = self.nsamples.wrapping_add(self.packet_samples);
        self.fill = rtp::HEADER_LEN;
        self.frame_count = 0;
        self.packet_samples = 0;

        if !sent {
            tracing::warn!("data channel not writable, media packet dropped");
            if self.policy == OverrunPolicy::Fail {
                return Err(Error::Transport(TransportError::WouldBlock));
            }
        }
        Ok(())
    }
}

/// Raw PCM transfer units towards the remote
pub struct VoicePlayback {
    link_mtu: usize,
    wire: Vec<u8>,
    fill: usize,
}

impl VoicePlayback {
    fn new(link_mtu: usize) -> Self {
        Self {
            link_mtu,
            wire: vec![0; link_mtu],
            fill: 0,
        }
    }

    pub fn write(&mut self, mut pcm: &[u8], sock: &DataSocket) -> Result<usize> {
        let mut consumed = 0;
        while !pcm.is_empty() {
            let take = (self.link_mtu - self.fill).min(pcm.len());
            self.wire[self.fill..self.fill + take].copy_from_slice(&pcm[..take]);
            self.fill += take;
            consumed += take;
            pcm = &pcm[take..];
            if self.fill == self.link_mtu {
                sock.send_blocking(&self.wire).map_err(Error::Transport)?;
                self.fill = 0;
            }
        }
        Ok(consumed)
    }
}

/// Raw PCM transfer units from the remote
pub struct VoiceCapture {
    link_mtu: usize,
    unit: Vec<u8>,
    offset: usize,
}

impl VoiceCapture {
    fn new(link_mtu: usize) -> Self {
        Self {
            link_mtu,
            unit: vec![0; link_mtu],
            offset: 0,
        }
    }

    pub fn read(
        &mut self,
        out: &mut [u8],
        sock: &mut DataSocket,
        nonblocking: bool,
    ) -> Result<(usize, bool)> {
        let mut fresh = false;
        if self.offset == 0 {
            sock.recv_transfer_unit(&mut self.unit, nonblocking)
                .map_err(Error::Transport)?;
            fresh = true;
        }
        let take = (self.link_mtu - self.offset).min(out.len());
        out[..take].copy_from_slice(&self.unit[self.offset..self.offset + take]);
        self.offset = (self.offset + take) % self.link_mtu;
        Ok((take, fresh))
    }
}
