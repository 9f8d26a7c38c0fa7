//! RTPv2 packet parsing and header emission
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::{WireError, RTP_HEADER_LEN, RTP_VERSION};

/// The fixed header fields a sender fills in
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RtpHeader {
    /// Marker bit (profile defined; unused by the bridge)
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// RTP timestamp in sample frames
    pub timestamp: u32,
    /// Synchronization source
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize the 12-byte fixed header (no CSRCs, no extension)
    pub fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = RTP_VERSION << 6;
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        Ok(RTP_HEADER_LEN)
    }
}

/// A parsed RTP datagram borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy)]
pub struct RtpPacket<'a> {
    /// Marker bit
    pub marker: bool,
    /// Payload type, parsed but not interpreted
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// RTP timestamp
    pub timestamp: u32,
    /// Synchronization source
    pub ssrc: u32,
    /// Payload with CSRCs, extension and padding stripped
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse one datagram
    ///
    /// Rejects anything that is not well-formed version 2; never reads past
    /// `buf`. All multi-byte fields are network byte order.
    pub fn parse(buf: &'a [u8]) -> Result<Self, WireError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(WireError::TooShort);
        }
        if buf[0] >> 6 != RTP_VERSION {
            return Err(WireError::BadVersion);
        }
        let has_padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0F) as usize;

        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7F;
        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut header_len = RTP_HEADER_LEN + 4 * csrc_count;
        if has_extension {
            // 4-byte extension header carries the extension word count.
            let ext_words = buf
                .get(header_len + 2..header_len + 4)
                .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
                .ok_or(WireError::BadLength)?;
            header_len += 4 + 4 * ext_words;
        }
        if buf.len() <= header_len {
            return Err(WireError::BadLength);
        }

        let padding_len = if has_padding {
            buf[buf.len() - 1] as usize
        } else {
            0
        };
        let payload_len = buf
            .len()
            .checked_sub(header_len + padding_len)
            .ok_or(WireError::BadPadding)?;
        if payload_len == 0 {
            return Err(WireError::BadPadding);
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: &buf[header_len..header_len + payload_len],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn minimal_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = std::vec![0u8; RTP_HEADER_LEN];
        RtpHeader {
            marker: false,
            payload_type: 96,
            sequence: seq,
            timestamp: 0x01020304,
            ssrc: 0xDEADBEEF,
        }
        .to_bytes(&mut buf)
        .unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_parse_minimal() {
        let buf = minimal_packet(1000, &[1, 2, 3, 4]);
        let pkt = RtpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.sequence, 1000);
        assert_eq!(pkt.timestamp, 0x01020304);
        assert_eq!(pkt.ssrc, 0xDEADBEEF);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(pkt.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_reject_short_and_wrong_version() {
        assert_eq!(RtpPacket::parse(&[0x80; 11]).err(), Some(WireError::TooShort));

        let mut buf = minimal_packet(1, &[0; 4]);
        buf[0] = 0x40; // version 1
        assert_eq!(RtpPacket::parse(&buf).err(), Some(WireError::BadVersion));
    }

    #[test]
    fn test_csrc_list_is_skipped() {
        let mut buf = minimal_packet(7, &[]);
        buf[0] |= 2; // CC = 2
        buf.extend_from_slice(&[0xAA; 8]); // two CSRCs
        buf.extend_from_slice(&[9, 9]); // payload
        let pkt = RtpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.payload, &[9, 9]);
    }

    #[test]
    fn test_extension_is_skipped() {
        let mut buf = minimal_packet(7, &[]);
        buf[0] |= 0x10;
        // Extension header: profile 0xBEDE, length 1 word.
        buf.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]);
        buf.extend_from_slice(&[0x11; 4]); // the extension word
        buf.extend_from_slice(&[5, 6, 7]); // payload
        let pkt = RtpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.payload, &[5, 6, 7]);
    }

    #[test]
    fn test_truncated_extension_rejected() {
        let mut buf = minimal_packet(7, &[]);
        buf[0] |= 0x10;
        buf.extend_from_slice(&[0xBE, 0xDE]); // extension header cut short
        assert_eq!(RtpPacket::parse(&buf).err(), Some(WireError::BadLength));
    }

    #[test]
    fn test_padding_stripped() {
        let mut buf = minimal_packet(7, &[1, 2, 3, 4]);
        buf[0] |= 0x20;
        buf.extend_from_slice(&[0, 0, 3]); // padding, count byte last
        let pkt = RtpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_padding_consuming_everything_rejected() {
        let mut buf = minimal_packet(7, &[1, 2]);
        buf[0] |= 0x20;
        *buf.last_mut().unwrap() = 200; // claims more padding than data
        assert_eq!(RtpPacket::parse(&buf).err(), Some(WireError::BadPadding));
    }

    #[test]
    fn test_header_only_packet_rejected() {
        let buf = minimal_packet(7, &[]);
        assert_eq!(RtpPacket::parse(&buf).err(), Some(WireError::BadLength));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The parser either rejects or yields a payload fully inside
            /// the input; it never panics on arbitrary bytes.
            #[test]
            fn prop_parse_never_reads_past_end(data in proptest::collection::vec(any::<u8>(), 0..256)) {
                if let Ok(pkt) = RtpPacket::parse(&data) {
                    prop_assert!(!pkt.payload.is_empty());
                    prop_assert!(pkt.payload.len() <= data.len());
                }
            }
        }
    }
}
