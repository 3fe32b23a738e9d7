use crate::error::ParserError;
use crate::models::{Afi, AttrFlags, AttrType, MpNlri, PathAttribute, RawPrefix, Safi};
use crate::parser::ReadUtils;
use bytes::{Buf, Bytes};
use log::debug;
use std::collections::BTreeMap;

/// Result of walking an UPDATE's attribute section: plain attributes keyed
/// by code, and the multiprotocol blocks in wire order.
pub struct ParsedAttributes {
    pub attributes: BTreeMap<u8, PathAttribute>,
    pub mp_reach: Vec<MpNlri>,
    pub mp_unreach: Vec<MpNlri>,
}

/// Parse a run of `<length, prefix>` pairs covering exactly `data`.
pub fn parse_nlri_list(
    mut data: Bytes,
    afi: Afi,
    safi: Safi,
) -> Result<Vec<RawPrefix>, ParserError> {
    let mut prefixes = Vec::new();
    while !data.is_empty() {
        prefixes.push(RawPrefix::parse(&mut data, afi, safi)?);
    }
    Ok(prefixes)
}

/// Parse the attribute section of an UPDATE.
///
/// Every attribute length is validated against the remaining buffer before
/// the value is consumed; a duplicate attribute code replaces the earlier
/// copy. MP_REACH / MP_UNREACH attributes are decoded into [`MpNlri`]
/// blocks instead of landing in the code map.
pub fn parse_attributes(mut data: Bytes) -> Result<ParsedAttributes, ParserError> {
    let mut attributes: BTreeMap<u8, PathAttribute> = BTreeMap::new();
    let mut mp_reach = Vec::new();
    let mut mp_unreach = Vec::new();

    while data.remaining() >= 3 {
        let flags = AttrFlags::from_bits_retain(data.read_u8()?);
        let code = data.read_u8()?;
        let attr_length = match flags.contains(AttrFlags::EXTENDED) {
            false => data.read_u8()? as usize,
            true => data.read_u16()? as usize,
        };
        debug!("reading attribute: type {code}, length {attr_length}");

        let value = data.read_n_bytes(attr_length)?;

        match AttrType::from(code) {
            AttrType::MP_REACHABLE_NLRI => {
                mp_reach.push(parse_mp_nlri(value, true)?);
            }
            AttrType::MP_UNREACHABLE_NLRI => {
                mp_unreach.push(parse_mp_nlri(value, false)?);
            }
            _ => {
                attributes.insert(code, PathAttribute::new(flags, code, value));
            }
        }
    }
    if data.remaining() != 0 {
        return Err(ParserError::TruncatedMsg(format!(
            "{} stray bytes after last path attribute",
            data.remaining()
        )));
    }

    Ok(ParsedAttributes {
        attributes,
        mp_reach,
        mp_unreach,
    })
}

/// Decode an MP_REACH / MP_UNREACH attribute value (RFC 4760 §3, §4),
/// separating the NLRI bytes from the block header.
///
/// For the reachable form, the SNPA list of the original multiprotocol
/// specification is absent in RFC 4760; only the reserved octet sits
/// between next hop and NLRI.
fn parse_mp_nlri(mut data: Bytes, reachable: bool) -> Result<MpNlri, ParserError> {
    let afi = data.read_afi()?;
    let safi = Safi::from(data.read_u8()?);

    let next_hop = if reachable {
        let next_hop_len = data.read_u8()? as usize;
        let next_hop = data.read_n_bytes(next_hop_len)?;
        if data.read_u8()? != 0 {
            debug!("MP_REACH reserved octet not zero");
        }
        next_hop
    } else {
        Bytes::new()
    };

    let prefixes = parse_nlri_list(data, afi, safi)?;

    Ok(MpNlri {
        reachable,
        afi,
        safi,
        next_hop,
        prefixes,
    })
}
