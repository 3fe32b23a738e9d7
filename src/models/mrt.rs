use crate::error::ParserError;
use crate::models::{Afi, RawPrefix};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::IpAddr;

/// Timestamp, type, subtype, length, all big-endian.
pub const MRT_HEADER_LEN: usize = 12;
/// Hard cap on a BGP4MP-class payload; a header declaring more is corrupt.
pub const MRT_MAX_PAYLOAD: usize = 4096;
/// Sanity bound for TABLE_DUMP_V2 records, which may legitimately exceed
/// the BGP4MP cap.
pub const MRT_MAX_TABLE_PAYLOAD: usize = 1 << 20;

/// MRT record types accepted by the ingest (RFC 6396). Anything else fails
/// header validation and triggers resynchronisation.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u16)]
pub enum MrtEntryType {
    TableDumpV2 = 13,
    Bgp4Mp = 16,
}

#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u16)]
pub enum Bgp4MpType {
    StateChange = 0,
    Message = 1,
    MessageAs4 = 4,
    StateChangeAs4 = 5,
}

#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u16)]
pub enum TableDumpV2Type {
    PeerIndexTable = 1,
    RibIpv4Unicast = 2,
    RibIpv4Multicast = 3,
    RibIpv6Unicast = 4,
    RibIpv6Multicast = 5,
    RibGeneric = 6,
}

/// The 12-byte MRT common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrtHeader {
    pub timestamp: u32,
    pub entry_type: u16,
    pub entry_subtype: u16,
    pub length: u32,
}

impl MrtHeader {
    pub fn decode(data: &[u8]) -> Result<MrtHeader, ParserError> {
        if data.len() < MRT_HEADER_LEN {
            return Err(ParserError::TruncatedMsg(
                "MRT header shorter than 12 bytes".to_string(),
            ));
        }
        Ok(MrtHeader {
            timestamp: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            entry_type: u16::from_be_bytes([data[4], data[5]]),
            entry_subtype: u16::from_be_bytes([data[6], data[7]]),
            length: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    pub fn encode(&self) -> [u8; MRT_HEADER_LEN] {
        let mut out = [0u8; MRT_HEADER_LEN];
        out[0..4].copy_from_slice(&self.timestamp.to_be_bytes());
        out[4..6].copy_from_slice(&self.entry_type.to_be_bytes());
        out[6..8].copy_from_slice(&self.entry_subtype.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Validate type, subtype and declared length against the closed set
    /// the ingest understands. A failure here means the feed cursor is
    /// misaligned and the backlog must resynchronise.
    pub fn validate(&self) -> Result<(), ParserError> {
        match MrtEntryType::try_from(self.entry_type) {
            Ok(MrtEntryType::Bgp4Mp) => {
                Bgp4MpType::try_from(self.entry_subtype).map_err(|_| {
                    ParserError::ParseError(format!(
                        "unknown BGP4MP subtype {}",
                        self.entry_subtype
                    ))
                })?;
                if self.length as usize > MRT_MAX_PAYLOAD {
                    return Err(ParserError::ParseError(format!(
                        "BGP4MP payload of {} bytes exceeds {}",
                        self.length, MRT_MAX_PAYLOAD
                    )));
                }
            }
            Ok(MrtEntryType::TableDumpV2) => {
                TableDumpV2Type::try_from(self.entry_subtype).map_err(|_| {
                    ParserError::ParseError(format!(
                        "unknown TABLE_DUMP_V2 subtype {}",
                        self.entry_subtype
                    ))
                })?;
                if self.length as usize > MRT_MAX_TABLE_PAYLOAD {
                    return Err(ParserError::ParseError(format!(
                        "TABLE_DUMP_V2 payload of {} bytes exceeds {}",
                        self.length, MRT_MAX_TABLE_PAYLOAD
                    )));
                }
            }
            Err(_) => {
                return Err(ParserError::ParseError(format!(
                    "unknown MRT entry type {}",
                    self.entry_type
                )));
            }
        }
        Ok(())
    }
}

/// A decoded BGP4MP_MESSAGE / BGP4MP_MESSAGE_AS4 record. The BGP bytes are
/// kept raw; the parser has already checked that they begin with the
/// all-ones marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bgp4MpMessage {
    pub peer_asn: u32,
    pub local_asn: u32,
    pub interface_index: u16,
    pub afi: Afi,
    pub peer_ip: IpAddr,
    pub local_ip: IpAddr,
    pub bgp_bytes: Bytes,
}

impl Bgp4MpMessage {
    /// A record whose BGP part is a bare header is a keepalive on the feed.
    pub fn is_keepalive(&self) -> bool {
        self.bgp_bytes.len() == crate::models::bgp::BGP_HEADER_LEN
    }
}

/// One peer out of a PEER_INDEX_TABLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIndexEntry {
    pub peer_type: u8,
    pub bgp_id: u32,
    pub ip: IpAddr,
    pub asn: u32,
}

/// TABLE_DUMP_V2 PEER_INDEX_TABLE: collector identity plus the peer table
/// that subsequent RIB entries index into.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerIndexTable {
    pub collector_bgp_id: u32,
    pub view_name: String,
    pub peers: Vec<PeerIndexEntry>,
}

/// Prefix header shared by all entries of one RIB record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RibEntryHeader {
    pub sequence: u32,
    pub prefix: RawPrefix,
}

/// One RIB entry: the peer it was learned from, when, and its attributes
/// as raw bytes (MP_REACH, when present, carries no NLRI per RFC 6396).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RibEntry {
    pub peer_index: u16,
    pub originated_time: u32,
    pub attributes: Bytes,
}

/// Frame a payload with an MRT common header.
pub fn frame_mrt(timestamp: u32, entry_type: u16, entry_subtype: u16, payload: &[u8]) -> Bytes {
    let header = MrtHeader {
        timestamp,
        entry_type,
        entry_subtype,
        length: payload.len() as u32,
    };
    let mut out = BytesMut::with_capacity(MRT_HEADER_LEN + payload.len());
    out.put_slice(&header.encode());
    out.put_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = MrtHeader {
            timestamp: 1_600_000_000,
            entry_type: MrtEntryType::Bgp4Mp.into(),
            entry_subtype: Bgp4MpType::MessageAs4.into(),
            length: 63,
        };
        let decoded = MrtHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let header = MrtHeader {
            timestamp: 0,
            entry_type: 99,
            entry_subtype: 0,
            length: 10,
        };
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_header_rejects_oversized_bgp4mp() {
        let header = MrtHeader {
            timestamp: 0,
            entry_type: MrtEntryType::Bgp4Mp.into(),
            entry_subtype: Bgp4MpType::Message.into(),
            length: (MRT_MAX_PAYLOAD + 1) as u32,
        };
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_table_dump_may_exceed_bgp4mp_cap() {
        let header = MrtHeader {
            timestamp: 0,
            entry_type: MrtEntryType::TableDumpV2.into(),
            entry_subtype: TableDumpV2Type::RibIpv4Unicast.into(),
            length: (MRT_MAX_PAYLOAD + 1) as u32,
        };
        assert!(header.validate().is_ok());
    }
}
