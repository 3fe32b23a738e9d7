use crate::error::ParserError;
use crate::models::{Afi, AsnLength, RawPrefix, Safi, AS_TRANS};
use crate::parser::ReadUtils;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt::{Display, Formatter};

bitflags! {
    /// Path attribute flag octet (RFC 4271 §4.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u8 {
        const OPTIONAL   = 0x80;
        const TRANSITIVE = 0x40;
        const PARTIAL    = 0x20;
        const EXTENDED   = 0x10;
    }
}

/// Attribute type codes this collector cares about by name. Everything
/// else is carried as opaque bytes under its numeric code.
#[allow(non_camel_case_types)]
#[derive(Debug, FromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u8)]
pub enum AttrType {
    ORIGIN = 1,
    AS_PATH = 2,
    NEXT_HOP = 3,
    MULTI_EXIT_DISCRIMINATOR = 4,
    LOCAL_PREFERENCE = 5,
    ATOMIC_AGGREGATE = 6,
    AGGREGATOR = 7,
    COMMUNITIES = 8,
    MP_REACHABLE_NLRI = 14,
    MP_UNREACHABLE_NLRI = 15,
    AS4_PATH = 17,
    AS4_AGGREGATOR = 18,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One path attribute in wire form: flags, code, and the raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAttribute {
    pub flags: AttrFlags,
    pub code: u8,
    pub value: Bytes,
}

impl PathAttribute {
    pub fn new(flags: AttrFlags, code: u8, value: Bytes) -> Self {
        PathAttribute { flags, code, value }
    }

    pub fn attr_type(&self) -> AttrType {
        AttrType::from(self.code)
    }

    /// Whether the length field needs the extended (2-octet) form.
    fn needs_extended(&self) -> bool {
        self.value.len() > 255
    }

    pub fn wire_len(&self) -> usize {
        let len_field = if self.flags.contains(AttrFlags::EXTENDED) || self.needs_extended() {
            2
        } else {
            1
        };
        2 + len_field + self.value.len()
    }

    /// Serialise flag, type, length, value. The EXTENDED flag is forced on
    /// when the value cannot fit a 1-octet length.
    pub fn encode(&self, out: &mut BytesMut) {
        let mut flags = self.flags;
        if self.needs_extended() {
            flags |= AttrFlags::EXTENDED;
        }
        out.put_u8(flags.bits());
        out.put_u8(self.code);
        if flags.contains(AttrFlags::EXTENDED) {
            out.put_u16(self.value.len() as u16);
        } else {
            out.put_u8(self.value.len() as u8);
        }
        out.put_slice(&self.value);
    }
}

pub const AS_PATH_SEGMENT_SET: u8 = 1;
pub const AS_PATH_SEGMENT_SEQUENCE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsPathSegment {
    pub seg_type: u8,
    pub asns: Vec<u32>,
}

/// AS_PATH attribute value: a list of segments, each a set or a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AsPath {
    pub segments: Vec<AsPathSegment>,
}

impl AsPath {
    pub fn from_sequence(asns: &[u32]) -> AsPath {
        AsPath {
            segments: vec![AsPathSegment {
                seg_type: AS_PATH_SEGMENT_SEQUENCE,
                asns: asns.to_vec(),
            }],
        }
    }

    /// Decode the attribute value at the given AS number width.
    pub fn parse(mut data: Bytes, asn_len: AsnLength) -> Result<AsPath, ParserError> {
        let mut segments = Vec::new();
        while !data.is_empty() {
            let seg_type = data.read_u8()?;
            if seg_type != AS_PATH_SEGMENT_SET && seg_type != AS_PATH_SEGMENT_SEQUENCE {
                return Err(ParserError::ParseError(format!(
                    "invalid AS_PATH segment type {seg_type}"
                )));
            }
            let count = data.read_u8()? as usize;
            data.has_n_remaining(count * asn_len.octets())?;
            let mut asns = Vec::with_capacity(count);
            for _ in 0..count {
                asns.push(data.read_asn(asn_len)?);
            }
            segments.push(AsPathSegment { seg_type, asns });
        }
        Ok(AsPath { segments })
    }

    /// Serialise the attribute value at the chosen AS number width.
    ///
    /// Downcasting a 4-octet path to the 2-octet form truncates the high
    /// 16 bits; callers only hand over paths whose members are
    /// representable, and an AS whose low half already reads as
    /// [`AS_TRANS`] stays as-is.
    pub fn encode(&self, asn_len: AsnLength) -> Bytes {
        let mut out = BytesMut::new();
        for segment in &self.segments {
            out.put_u8(segment.seg_type);
            out.put_u8(segment.asns.len() as u8);
            for asn in &segment.asns {
                match asn_len {
                    AsnLength::Bits16 => out.put_u16(*asn as u16),
                    AsnLength::Bits32 => out.put_u32(*asn),
                }
            }
        }
        out.freeze()
    }

    pub fn asn_count(&self) -> usize {
        self.segments.iter().map(|s| s.asns.len()).sum()
    }
}

impl Display for AsPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match segment.seg_type {
                AS_PATH_SEGMENT_SET => {
                    write!(f, "{{")?;
                    for (i, asn) in segment.asns.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{asn}")?;
                    }
                    write!(f, "}}")?;
                }
                _ => {
                    for (i, asn) in segment.asns.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{asn}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// A multiprotocol NLRI block (RFC 4760) with the prefix bytes split away
/// from the attribute header, so the header can be re-emitted on its own
/// during table transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpNlri {
    pub reachable: bool,
    pub afi: Afi,
    pub safi: Safi,
    /// Next-hop bytes, empty for MP_UNREACH.
    pub next_hop: Bytes,
    pub prefixes: Vec<RawPrefix>,
}

impl MpNlri {
    /// Attribute value bytes without the NLRI: AFI, SAFI, next hop and the
    /// reserved octet for the reachable form; AFI and SAFI only for the
    /// unreachable form.
    pub fn encode_header(&self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u16(self.afi.into());
        out.put_u8(self.safi.into());
        if self.reachable {
            out.put_u8(self.next_hop.len() as u8);
            out.put_slice(&self.next_hop);
            out.put_u8(0); // reserved
        }
        out
    }

    /// Full attribute value bytes, NLRI included.
    pub fn encode_value(&self) -> Bytes {
        let mut out = self.encode_header();
        for prefix in &self.prefixes {
            prefix.encode(&mut out);
        }
        out.freeze()
    }

    pub fn attr_code(&self) -> u8 {
        if self.reachable {
            AttrType::MP_REACHABLE_NLRI.into()
        } else {
            AttrType::MP_UNREACHABLE_NLRI.into()
        }
    }

    /// Wrap into a wire attribute.
    pub fn to_attribute(&self) -> PathAttribute {
        PathAttribute::new(AttrFlags::OPTIONAL, self.attr_code(), self.encode_value())
    }
}
