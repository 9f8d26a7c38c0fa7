//! RTCP compound packet handling
//!
//! The bridge consumes SR for clock sync, notes BYE and SDES, and answers
//! with RR carrying the LSR/DLSR pair. Everything else is parsed far enough
//! to be skipped safely.

use crate::{WireError, RTP_VERSION};

/// RTCP packet types
pub mod pt {
    pub const SENDER_REPORT: u8 = 200;
    pub const RECEIVER_REPORT: u8 = 201;
    pub const SOURCE_DESCRIPTION: u8 = 202;
    pub const BYE: u8 = 203;
    pub const APP: u8 = 204;
}

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_DELTA_SECONDS: u64 = 2_208_988_800;

/// The sender-info block of an SR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenderInfo {
    /// SSRC of the reporting sender
    pub ssrc: u32,
    /// NTP timestamp, integer seconds since 1900
    pub ntp_seconds: u32,
    /// NTP timestamp, 2^-32 fraction
    pub ntp_fraction: u32,
    /// RTP timestamp sampled at the same instant
    pub rtp_timestamp: u32,
    /// Sender's packet count
    pub packet_count: u32,
    /// Sender's octet count
    pub octet_count: u32,
}

impl SenderInfo {
    /// The NTP instant as Unix milliseconds
    pub fn ntp_unix_ms(&self) -> u64 {
        let seconds = u64::from(self.ntp_seconds).saturating_sub(NTP_UNIX_DELTA_SECONDS);
        let fraction_ms = (u64::from(self.ntp_fraction) * 1000) >> 32;
        seconds * 1000 + fraction_ms
    }

    /// Middle 32 bits of the NTP timestamp, as echoed in RR LSR fields
    pub const fn lsr(&self) -> u32 {
        (self.ntp_seconds << 16) | (self.ntp_fraction >> 16)
    }
}

/// One packet out of a compound RTCP datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RtcpPacket<'a> {
    /// Sender report; seeds the master-clock mapping
    SenderReport(SenderInfo),
    /// Receiver report from a peer
    ReceiverReport {
        /// Reporting SSRC
        ssrc: u32,
    },
    /// Source description; the CNAME of the first chunk if present
    SourceDescription {
        /// CNAME text, when the first chunk carries one
        cname: Option<&'a str>,
    },
    /// Stream goodbye
    Bye {
        /// Departing SSRC
        ssrc: u32,
    },
    /// Application-defined; accepted and ignored
    App,
}

/// Iterate the packets of a compound RTCP datagram
///
/// Yields `Err` once and stops at the first malformed packet; never reads
/// past the buffer.
pub fn compound(buf: &[u8]) -> CompoundIter<'_> {
    CompoundIter { rest: buf }
}

/// Iterator over a compound datagram
pub struct CompoundIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for CompoundIter<'a> {
    type Item = Result<RtcpPacket<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 4 {
            self.rest = &[];
            return Some(Err(WireError::TooShort));
        }
        if self.rest[0] >> 6 != RTP_VERSION {
            self.rest = &[];
            return Some(Err(WireError::BadVersion));
        }

        let packet_type = self.rest[1];
        let words = u16::from_be_bytes([self.rest[2], self.rest[3]]) as usize;
        let total = (words + 1) * 4;
        let Some(packet) = self.rest.get(..total) else {
            self.rest = &[];
            return Some(Err(WireError::BadLength));
        };
        self.rest = &self.rest[total..];

        let body = &packet[4..];
        let parsed = match packet_type {
            pt::SENDER_REPORT => parse_sender_report(body),
            pt::RECEIVER_REPORT => read_u32(body, 0)
                .map(|ssrc| RtcpPacket::ReceiverReport { ssrc })
                .ok_or(WireError::BadLength),
            pt::SOURCE_DESCRIPTION => Ok(RtcpPacket::SourceDescription {
                cname: parse_first_cname(body),
            }),
            pt::BYE => read_u32(body, 0)
                .map(|ssrc| RtcpPacket::Bye { ssrc })
                .ok_or(WireError::BadLength),
            pt::APP => Ok(RtcpPacket::App),
            _ => Err(WireError::BadLength),
        };
        if parsed.is_err() {
            self.rest = &[];
        }
        Some(parsed)
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_sender_report(body: &[u8]) -> Result<RtcpPacket<'_>, WireError> {
    if body.len() < 24 {
        return Err(WireError::BadLength);
    }
    Ok(RtcpPacket::SenderReport(SenderInfo {
        ssrc: read_u32(body, 0).ok_or(WireError::BadLength)?,
        ntp_seconds: read_u32(body, 4).ok_or(WireError::BadLength)?,
        ntp_fraction: read_u32(body, 8).ok_or(WireError::BadLength)?,
        rtp_timestamp: read_u32(body, 12).ok_or(WireError::BadLength)?,
        packet_count: read_u32(body, 16).ok_or(WireError::BadLength)?,
        octet_count: read_u32(body, 20).ok_or(WireError::BadLength)?,
    }))
}

/// CNAME (item type 1) of the first SDES chunk, if well-formed UTF-8
fn parse_first_cname(body: &[u8]) -> Option<&str> {
    // Chunk: SSRC, then type/length/text items until a zero type.
    let mut pos = 4;
    loop {
        let item_type = *body.get(pos)?;
        if item_type == 0 {
            return None;
        }
        let len = *body.get(pos + 1)? as usize;
        let text = body.get(pos + 2..pos + 2 + len)?;
        if item_type == 1 {
            return core::str::from_utf8(text).ok();
        }
        pos += 2 + len;
    }
}

/// A receiver report with a single report block, emitted back to the
/// SR origin
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverReport {
    /// Our SSRC
    pub sender_ssrc: u32,
    /// The stream being reported on
    pub source_ssrc: u32,
    /// Loss fraction since the previous report (8-bit fixed point)
    pub fraction_lost: u8,
    /// Cumulative packets lost (24 bits used)
    pub cumulative_lost: u32,
    /// Extended highest sequence number received
    pub highest_seq: u32,
    /// Interarrival jitter estimate
    pub jitter: u32,
    /// LSR: middle 32 bits of the last SR's NTP timestamp
    pub last_sr: u32,
    /// DLSR: delay since that SR, in 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl ReceiverReport {
    /// Serialized length: header, reporter SSRC, one report block
    pub const LEN: usize = 32;

    /// Serialize into `buf`
    pub fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::BufferTooSmall);
        }
        buf[0] = (RTP_VERSION << 6) | 1; // one report block
        buf[1] = pt::RECEIVER_REPORT;
        buf[2..4].copy_from_slice(&((Self::LEN as u16 / 4) - 1).to_be_bytes());
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.source_ssrc.to_be_bytes());
        let lost = self.cumulative_lost.min(0x00FF_FFFF);
        buf[12] = self.fraction_lost;
        buf[13..16].copy_from_slice(&lost.to_be_bytes()[1..]);
        buf[16..20].copy_from_slice(&self.highest_seq.to_be_bytes());
        buf[20..24].copy_from_slice(&self.jitter.to_be_bytes());
        buf[24..28].copy_from_slice(&self.last_sr.to_be_bytes());
        buf[28..32].copy_from_slice(&self.delay_since_last_sr.to_be_bytes());
        Ok(Self::LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn sr_packet(info: &SenderInfo) -> Vec<u8> {
        let mut buf = std::vec![0u8; 28];
        buf[0] = RTP_VERSION << 6;
        buf[1] = pt::SENDER_REPORT;
        buf[2..4].copy_from_slice(&6u16.to_be_bytes()); // 7 words total
        buf[4..8].copy_from_slice(&info.ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&info.ntp_seconds.to_be_bytes());
        buf[12..16].copy_from_slice(&info.ntp_fraction.to_be_bytes());
        buf[16..20].copy_from_slice(&info.rtp_timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&info.packet_count.to_be_bytes());
        buf[24..28].copy_from_slice(&info.octet_count.to_be_bytes());
        buf
    }

    fn sample_info() -> SenderInfo {
        SenderInfo {
            ssrc: 0x0BAD_CAFE,
            ntp_seconds: 3_900_000_000,
            ntp_fraction: 0x8000_0000, // .5 s
            rtp_timestamp: 144_000,
            packet_count: 500,
            octet_count: 576_000,
        }
    }

    #[test]
    fn test_sr_parses() {
        let info = sample_info();
        let buf = sr_packet(&info);
        let mut iter = compound(&buf);
        assert_eq!(iter.next(), Some(Ok(RtcpPacket::SenderReport(info))));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_ntp_unix_conversion() {
        let info = sample_info();
        let expected = (3_900_000_000u64 - 2_208_988_800) * 1000 + 500;
        assert_eq!(info.ntp_unix_ms(), expected);
    }

    #[test]
    fn test_lsr_is_middle_bits() {
        let info = sample_info();
        let expected = (info.ntp_seconds << 16) | (info.ntp_fraction >> 16);
        assert_eq!(info.lsr(), expected);
    }

    #[test]
    fn test_compound_sr_then_bye() {
        let mut buf = sr_packet(&sample_info());
        // BYE for the same SSRC.
        let mut bye = std::vec![0u8; 8];
        bye[0] = (RTP_VERSION << 6) | 1;
        bye[1] = pt::BYE;
        bye[2..4].copy_from_slice(&1u16.to_be_bytes());
        bye[4..8].copy_from_slice(&0x0BAD_CAFEu32.to_be_bytes());
        buf.extend_from_slice(&bye);

        let packets: Vec<_> = compound(&buf).collect();
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[0], Ok(RtcpPacket::SenderReport(_))));
        assert_eq!(packets[1], Ok(RtcpPacket::Bye { ssrc: 0x0BAD_CAFE }));
    }

    #[test]
    fn test_sdes_cname() {
        let mut buf = std::vec![0u8; 4];
        buf[0] = (RTP_VERSION << 6) | 1;
        buf[1] = pt::SOURCE_DESCRIPTION;
        buf.extend_from_slice(&0x1111_2222u32.to_be_bytes());
        buf.extend_from_slice(&[1, 4]); // CNAME, 4 bytes
        buf.extend_from_slice(b"brdg");
        buf.extend_from_slice(&[0, 0]); // terminator + pad
        let words = (buf.len() / 4 - 1) as u16;
        buf[2..4].copy_from_slice(&words.to_be_bytes());

        let mut iter = compound(&buf);
        assert_eq!(
            iter.next(),
            Some(Ok(RtcpPacket::SourceDescription {
                cname: Some("brdg")
            }))
        );
    }

    #[test]
    fn test_truncated_compound_rejected_once() {
        let mut buf = sr_packet(&sample_info());
        buf.truncate(20); // SR body cut short, header claims 28

        let packets: Vec<_> = compound(&buf).collect();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut buf = sr_packet(&sample_info());
        buf[0] = 0x40;
        assert_eq!(compound(&buf).next(), Some(Err(WireError::BadVersion)));
    }

    #[test]
    fn test_receiver_report_round_trip_fields() {
        let rr = ReceiverReport {
            sender_ssrc: 0x0101_0101,
            source_ssrc: 0x0202_0202,
            fraction_lost: 12,
            cumulative_lost: 34,
            highest_seq: 0x0001_1000,
            jitter: 7,
            last_sr: 0xAABB_CCDD,
            delay_since_last_sr: 65536, // one second
        };
        let mut buf = [0u8; 64];
        let len = rr.to_bytes(&mut buf).unwrap();
        assert_eq!(len, ReceiverReport::LEN);
        assert_eq!(buf[1], pt::RECEIVER_REPORT);
        assert_eq!(&buf[24..28], &0xAABB_CCDDu32.to_be_bytes());
        assert_eq!(&buf[28..32], &65536u32.to_be_bytes());

        // Our own iterator accepts what we emit.
        let mut iter = compound(&buf[..len]);
        assert_eq!(
            iter.next(),
            Some(Ok(RtcpPacket::ReceiverReport { ssrc: 0x0101_0101 }))
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Compound iteration terminates and never panics on arbitrary
            /// input.
            #[test]
            fn prop_compound_always_terminates(data in proptest::collection::vec(any::<u8>(), 0..128)) {
                let count = compound(&data).count();
                prop_assert!(count <= data.len() / 4 + 1);
            }
        }
    }
}
