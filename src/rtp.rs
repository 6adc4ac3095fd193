//! Media packet framing for the encoded transport
//!
//! Each outgoing packet is a fixed RTP header followed by one payload
//! descriptor byte (SBC frame count) and then whole SBC frames. Fields the
//! sink ignores are pinned: version 2, payload type 1, SSRC 1.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// RTP header plus the one-byte SBC payload descriptor
pub const HEADER_LEN: usize = 13;

const VERSION: u8 = 2;
const PAYLOAD_TYPE: u8 = 1;
const SSRC: u32 = 1;

/// Header of one media packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPacketHeader {
    /// Wrapping packet counter
    pub sequence: u16,
    /// Cumulative sample count at the first frame in this packet
    pub timestamp: u32,
    /// Whole SBC frames carried in the payload (max 15)
    pub frame_count: u8,
}

impl MediaPacketHeader {
    /// Write the header into the first [`HEADER_LEN`] bytes of `dst`.
    pub fn write_to(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() >= HEADER_LEN);
        let mut dst = &mut dst[..HEADER_LEN];
        dst.put_u8(VERSION << 6);
        dst.put_u8(PAYLOAD_TYPE);
        dst.put_u16(self.sequence);
        dst.put_u32(self.timestamp);
        dst.put_u32(SSRC);
        dst.put_u8(self.frame_count & 0x0f);
    }

    /// Parse the header from the front of a received packet.
    pub fn parse(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed(
                "media packet shorter than header".into(),
            ));
        }
        let mut src = &src[..HEADER_LEN];
        let first = src.get_u8();
        if first >> 6 != VERSION {
            return Err(ProtocolError::Malformed(format!(
                "unsupported RTP version {}",
                first >> 6
            )));
        }
        let _payload_type = src.get_u8();
        let sequence = src.get_u16();
        let timestamp = src.get_u32();
        let _ssrc = src.get_u32();
        let frame_count = src.get_u8() & 0x0f;
        Ok(MediaPacketHeader {
            sequence,
            timestamp,
            frame_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_fields() {
        let header = MediaPacketHeader {
            sequence: 0x0102,
            timestamp: 0x03040506,
            frame_count: 5,
        };
        let mut buf = [0u8; HEADER_LEN];
        header.write_to(&mut buf);
        assert_eq!(
            buf,
            [0x80, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0, 0, 0, 1, 0x05]
        );
    }

    #[test]
    fn short_packet_rejected() {
        assert!(MediaPacketHeader::parse(&[0x80; 12]).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        MediaPacketHeader {
            sequence: 0,
            timestamp: 0,
            frame_count: 1,
        }
        .write_to(&mut buf);
        buf[0] = 0x40;
        assert!(MediaPacketHeader::parse(&buf).is_err());
    }

    proptest! {
        #[test]
        fn header_roundtrip(sequence: u16, timestamp: u32, frame_count in 0u8..16) {
            let header = MediaPacketHeader { sequence, timestamp, frame_count };
            let mut buf = [0u8; HEADER_LEN];
            header.write_to(&mut buf);
            prop_assert_eq!(MediaPacketHeader::parse(&buf).unwrap(), header);
        }
    }
}
