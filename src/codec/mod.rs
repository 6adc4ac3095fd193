//! Codec adapters for the encoded transport

pub mod sbc;

pub use sbc::{default_bitpool, Allocation, ChannelMode, SbcCodec, SbcParams};
