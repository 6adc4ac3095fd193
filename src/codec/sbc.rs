//! SBC codec adapter
//!
//! The bit-exact encoder is a black box behind [`SbcCodec`]; this module
//! owns everything derivable from negotiated parameters: the PCM block
//! size one encode call consumes (codesize), the compressed frame length,
//! and the known-interoperable default bitpool table.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::ipc::message::{caps, SbcCapabilities};

/// Channel mode, mirroring the A2DP capability bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Mono,
    Dual,
    Stereo,
    Joint,
}

impl ChannelMode {
    pub fn bit(self) -> u8 {
        match self {
            ChannelMode::Mono => caps::CHANNEL_MODE_MONO,
            ChannelMode::Dual => caps::CHANNEL_MODE_DUAL,
            ChannelMode::Stereo => caps::CHANNEL_MODE_STEREO,
            ChannelMode::Joint => caps::CHANNEL_MODE_JOINT,
        }
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            caps::CHANNEL_MODE_MONO => Some(ChannelMode::Mono),
            caps::CHANNEL_MODE_DUAL => Some(ChannelMode::Dual),
            caps::CHANNEL_MODE_STEREO => Some(ChannelMode::Stereo),
            caps::CHANNEL_MODE_JOINT => Some(ChannelMode::Joint),
            _ => None,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            ChannelMode::Mono => 1,
            _ => 2,
        }
    }
}

/// Bit allocation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocation {
    Loudness,
    Snr,
}

impl Allocation {
    pub fn bit(self) -> u8 {
        match self {
            Allocation::Loudness => caps::ALLOCATION_LOUDNESS,
            Allocation::Snr => caps::ALLOCATION_SNR,
        }
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            caps::ALLOCATION_LOUDNESS => Some(Allocation::Loudness),
            caps::ALLOCATION_SNR => Some(Allocation::Snr),
            _ => None,
        }
    }
}

/// Map a PCM sample rate to its capability bit.
pub fn rate_to_bit(rate: u32) -> Option<u8> {
    match rate {
        16000 => Some(caps::FREQ_16000),
        32000 => Some(caps::FREQ_32000),
        44100 => Some(caps::FREQ_44100),
        48000 => Some(caps::FREQ_48000),
        _ => None,
    }
}

pub fn bit_to_rate(bit: u8) -> Option<u32> {
    match bit {
        caps::FREQ_16000 => Some(16000),
        caps::FREQ_32000 => Some(32000),
        caps::FREQ_44100 => Some(44100),
        caps::FREQ_48000 => Some(48000),
        _ => None,
    }
}

pub fn subbands_to_bit(subbands: u8) -> Option<u8> {
    match subbands {
        4 => Some(caps::SUBBANDS_4),
        8 => Some(caps::SUBBANDS_8),
        _ => None,
    }
}

pub fn blocks_to_bit(blocks: u8) -> Option<u8> {
    match blocks {
        4 => Some(caps::BLOCK_LENGTH_4),
        8 => Some(caps::BLOCK_LENGTH_8),
        12 => Some(caps::BLOCK_LENGTH_12),
        16 => Some(caps::BLOCK_LENGTH_16),
        _ => None,
    }
}

/// Default bitpool for a rate/mode pair.
///
/// Values are fixed per pair to match known-interoperable defaults, not
/// recomputed per negotiation. Unknown inputs fall back to the most
/// permissive value.
pub fn default_bitpool(rate: u32, mode: ChannelMode) -> u8 {
    match rate {
        16000 | 32000 => 53,
        44100 => match mode {
            ChannelMode::Mono | ChannelMode::Dual => 31,
            ChannelMode::Stereo | ChannelMode::Joint => 53,
        },
        48000 => match mode {
            ChannelMode::Mono | ChannelMode::Dual => 29,
            ChannelMode::Stereo | ChannelMode::Joint => 51,
        },
        other => {
            tracing::debug!(rate = other, "no bitpool entry for rate, using fallback");
            53
        }
    }
}

/// Fully negotiated SBC parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcParams {
    pub rate: u32,
    pub mode: ChannelMode,
    pub allocation: Allocation,
    /// 4 or 8
    pub subbands: u8,
    /// 4, 8, 12 or 16
    pub blocks: u8,
    pub bitpool: u8,
}

impl SbcParams {
    /// Build from a capability set narrowed to single bits by negotiation.
    /// The encoder runs at the agreed maximum bitpool.
    pub fn from_negotiated(caps: &SbcCapabilities) -> Result<Self, CodecError> {
        let rate = bit_to_rate(caps.frequency)
            .ok_or_else(|| unsupported("frequency", caps.frequency))?;
        let mode = ChannelMode::from_bit(caps.channel_mode)
            .ok_or_else(|| unsupported("channel mode", caps.channel_mode))?;
        let allocation = Allocation::from_bit(caps.allocation)
            .ok_or_else(|| unsupported("allocation", caps.allocation))?;
        let subbands = match caps.subbands {
            x if x == caps::SUBBANDS_4 => 4,
            x if x == caps::SUBBANDS_8 => 8,
            other => return Err(unsupported("subbands", other)),
        };
        let blocks = match caps.block_length {
            x if x == caps::BLOCK_LENGTH_4 => 4,
            x if x == caps::BLOCK_LENGTH_8 => 8,
            x if x == caps::BLOCK_LENGTH_12 => 12,
            x if x == caps::BLOCK_LENGTH_16 => 16,
            other => return Err(unsupported("block length", other)),
        };
        Ok(SbcParams {
            rate,
            mode,
            allocation,
            subbands,
            blocks,
            bitpool: caps.max_bitpool,
        })
    }

    /// PCM bytes consumed by one encode call (16-bit samples).
    pub fn codesize(&self) -> usize {
        self.blocks as usize * self.subbands as usize * self.mode.channels() * 2
    }

    /// Compressed frame size produced per codesize block.
    pub fn frame_length(&self) -> usize {
        let subbands = self.subbands as usize;
        let blocks = self.blocks as usize;
        let channels = self.mode.channels();
        let bitpool = self.bitpool as usize;
        let head = 4 + (4 * subbands * channels) / 8;
        let body = match self.mode {
            ChannelMode::Mono | ChannelMode::Dual => {
                (blocks * channels * bitpool).div_ceil(8)
            }
            ChannelMode::Stereo => (blocks * bitpool).div_ceil(8),
            ChannelMode::Joint => (subbands + blocks * bitpool).div_ceil(8),
        };
        head + body
    }

    /// Duration of one codesize block in microseconds.
    pub fn frame_duration_us(&self) -> u64 {
        self.subbands as u64 * self.blocks as u64 * 1_000_000 / self.rate as u64
    }
}

fn unsupported(what: &str, value: u8) -> CodecError {
    CodecError::UnsupportedParameter(format!("{what} 0x{value:02x}"))
}

/// Black-box SBC encoder/decoder boundary.
///
/// `encode` consumes exactly one codesize block of interleaved 16-bit PCM
/// and writes one compressed frame into `out`, returning the bytes
/// written. Implementations must honor `configure` on renegotiation.
pub trait SbcCodec: Send {
    fn configure(&mut self, params: &SbcParams) -> Result<(), CodecError>;

    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<usize, CodecError>;
}
