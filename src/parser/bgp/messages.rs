use crate::error::ParserError;
use crate::models::bgp::{BGP_HEADER_LEN, BGP_MAX_MESSAGE_LEN};
use crate::models::{
    Afi, AsnLength, AttrType, BgpCapability, BgpCapabilityCode, BgpMessage, BgpMessageType,
    BgpNotification, BgpOpen, BgpRouteRefresh, BgpUpdate, PathAttribute, Safi,
};
use crate::parser::bgp::attributes::parse_attributes;
use crate::parser::ReadUtils;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;

/// The 16-octet all-ones marker that precedes every message (RFC 4271 §4.1).
pub const BGP_MARKER: [u8; 16] = [0xFF; 16];

const OPT_PARAM_CAPABILITY: u8 = 2;

/// Validate the fixed header and return `(type, declared length)` without
/// consuming the body. Used by the session engine to frame messages off
/// the socket before the body has arrived.
pub fn parse_bgp_message_header(header: &[u8]) -> Result<(BgpMessageType, usize), ParserError> {
    if header.len() < BGP_HEADER_LEN {
        return Err(ParserError::TruncatedMsg(
            "BGP header shorter than 19 bytes".to_string(),
        ));
    }
    if header[..16] != BGP_MARKER {
        return Err(ParserError::ParseError(
            "BGP marker is not all ones".to_string(),
        ));
    }
    let length = u16::from_be_bytes([header[16], header[17]]) as usize;
    if !(BGP_HEADER_LEN..=BGP_MAX_MESSAGE_LEN).contains(&length) {
        return Err(ParserError::ParseError(format!(
            "invalid BGP message length {length}"
        )));
    }
    let msg_type = BgpMessageType::try_from(header[18])?;
    Ok((msg_type, length))
}

/// Parse one complete BGP message, header included. `data` must hold
/// exactly the message; the declared length is checked against it.
pub fn parse_bgp_message(mut data: Bytes, asn_len: AsnLength) -> Result<BgpMessage, ParserError> {
    let total = data.len();
    data.has_n_remaining(BGP_HEADER_LEN)?;
    let header = data.read_n_bytes(BGP_HEADER_LEN)?;
    let (msg_type, length) = parse_bgp_message_header(&header)?;
    if length != total {
        return Err(ParserError::TruncatedMsg(format!(
            "BGP message declares {length} bytes, buffer holds {total}"
        )));
    }

    Ok(match msg_type {
        BgpMessageType::Open => BgpMessage::Open(parse_bgp_open(data)?),
        BgpMessageType::Update => BgpMessage::Update(parse_bgp_update(data, asn_len)?),
        BgpMessageType::Notification => BgpMessage::Notification(parse_bgp_notification(data)?),
        BgpMessageType::Keepalive => {
            if !data.is_empty() {
                return Err(ParserError::ParseError(
                    "KEEPALIVE with a body".to_string(),
                ));
            }
            BgpMessage::Keepalive
        }
        BgpMessageType::RouteRefresh => BgpMessage::RouteRefresh(parse_bgp_route_refresh(data)?),
    })
}

fn parse_bgp_open(mut data: Bytes) -> Result<BgpOpen, ParserError> {
    let version = data.read_u8()?;
    let asn = data.read_u16()? as u32;
    let hold_time = data.read_u16()?;
    let bgp_id = data.read_u32()?;
    let opt_params_len = data.read_u8()? as usize;
    data.has_n_remaining(opt_params_len)?;
    let mut params = data.read_n_bytes(opt_params_len)?;

    let mut capabilities = Vec::new();
    while params.remaining() >= 2 {
        let param_type = params.read_u8()?;
        let param_len = params.read_u8()? as usize;
        let mut param_value = params.read_n_bytes(param_len)?;
        if param_type != OPT_PARAM_CAPABILITY {
            // authentication (deprecated) or unassigned; ignored
            warn!("ignoring OPEN optional parameter type {param_type}");
            continue;
        }
        // one capability parameter may carry several triplets
        while param_value.remaining() >= 2 {
            let code = BgpCapabilityCode::from(param_value.read_u8()?);
            let cap_len = param_value.read_u8()? as usize;
            let value = param_value.read_n_bytes(cap_len)?;
            capabilities.push(BgpCapability::new(code, value));
        }
    }

    Ok(BgpOpen {
        version,
        asn,
        hold_time,
        bgp_id,
        capabilities,
    })
}

/// Parse an UPDATE body (everything after the 19-byte header).
pub fn parse_bgp_update(mut data: Bytes, asn_len: AsnLength) -> Result<BgpUpdate, ParserError> {
    let withdrawn_len = data.read_u16()? as usize;
    let withdrawn_bytes = data.read_n_bytes(withdrawn_len)?;
    let withdrawn =
        crate::parser::bgp::attributes::parse_nlri_list(withdrawn_bytes, Afi::Ipv4, Safi::Unicast)?;

    let attr_len = data.read_u16()? as usize;
    let attr_bytes = data.read_n_bytes(attr_len)?;
    let parsed = parse_attributes(attr_bytes)?;

    // whatever remains is IPv4 unicast NLRI
    let announced =
        crate::parser::bgp::attributes::parse_nlri_list(data, Afi::Ipv4, Safi::Unicast)?;

    Ok(BgpUpdate {
        asn_len,
        withdrawn,
        attributes: parsed.attributes,
        mp_reach: parsed.mp_reach,
        mp_unreach: parsed.mp_unreach,
        announced,
    })
}

fn parse_bgp_notification(mut data: Bytes) -> Result<BgpNotification, ParserError> {
    let error_code = data.read_u8()?;
    let error_subcode = data.read_u8()?;
    Ok(BgpNotification {
        error_code,
        error_subcode,
        data,
    })
}

fn parse_bgp_route_refresh(mut data: Bytes) -> Result<BgpRouteRefresh, ParserError> {
    let afi = data.read_afi()?;
    let _reserved = data.read_u8()?;
    let safi = Safi::from(data.read_u8()?);
    Ok(BgpRouteRefresh { afi, safi })
}

/// Serialise a message, computing the length field a priori and emitting
/// attributes in ascending code order. `asn_len` selects the AS_PATH
/// number width; when it differs from the width the update was parsed
/// with, the path is re-encoded (a 4→2 downcast truncates high bytes).
pub fn encode_bgp_message(msg: &BgpMessage, asn_len: AsnLength) -> Bytes {
    let body = match msg {
        BgpMessage::Open(open) => encode_bgp_open(open),
        BgpMessage::Update(update) => encode_bgp_update(update, asn_len),
        BgpMessage::Notification(notification) => encode_bgp_notification(notification),
        BgpMessage::Keepalive => BytesMut::new(),
        BgpMessage::RouteRefresh(rr) => encode_bgp_route_refresh(rr),
    };

    let mut out = BytesMut::with_capacity(BGP_HEADER_LEN + body.len());
    out.put_slice(&BGP_MARKER);
    out.put_u16((BGP_HEADER_LEN + body.len()) as u16);
    out.put_u8(msg.msg_type().into());
    out.put_slice(&body);
    out.freeze()
}

fn encode_bgp_open(open: &BgpOpen) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(open.version);
    out.put_u16(open.asn as u16);
    out.put_u16(open.hold_time);
    out.put_u32(open.bgp_id);

    // one capability optional parameter per capability
    let params_len: usize = open.capabilities.iter().map(|c| 2 + c.wire_len()).sum();
    out.put_u8(params_len as u8);
    for cap in &open.capabilities {
        out.put_u8(OPT_PARAM_CAPABILITY);
        out.put_u8(cap.wire_len() as u8);
        cap.encode(&mut out);
    }
    out
}

fn encode_bgp_update(update: &BgpUpdate, asn_len: AsnLength) -> BytesMut {
    let mut out = BytesMut::new();

    let mut withdrawn = BytesMut::new();
    for prefix in &update.withdrawn {
        prefix.encode(&mut withdrawn);
    }
    out.put_u16(withdrawn.len() as u16);
    out.put_slice(&withdrawn);

    // collect attributes, re-encoding the AS_PATH if the width changes,
    // then emit in ascending code order (stable for the MP blocks)
    let mut attrs: Vec<PathAttribute> = Vec::with_capacity(update.attributes.len() + 2);
    for attr in update.attributes.values() {
        if attr.attr_type() == AttrType::AS_PATH && asn_len != update.asn_len {
            match crate::models::AsPath::parse(attr.value.clone(), update.asn_len) {
                Ok(path) => {
                    attrs.push(PathAttribute::new(
                        attr.flags,
                        attr.code,
                        path.encode(asn_len),
                    ));
                    continue;
                }
                Err(e) => warn!("cannot re-encode AS_PATH at new width: {e}"),
            }
        }
        attrs.push(attr.clone());
    }
    for block in update.mp_unreach.iter().chain(update.mp_reach.iter()) {
        attrs.push(block.to_attribute());
    }
    attrs.sort_by_key(|a| a.code);

    let mut attr_bytes = BytesMut::new();
    for attr in &attrs {
        attr.encode(&mut attr_bytes);
    }
    out.put_u16(attr_bytes.len() as u16);
    out.put_slice(&attr_bytes);

    for prefix in &update.announced {
        prefix.encode(&mut out);
    }
    out
}

fn encode_bgp_notification(notification: &BgpNotification) -> BytesMut {
    let mut out = BytesMut::with_capacity(2 + notification.data.len());
    out.put_u8(notification.error_code);
    out.put_u8(notification.error_subcode);
    out.put_slice(&notification.data);
    out
}

fn encode_bgp_route_refresh(rr: &BgpRouteRefresh) -> BytesMut {
    let mut out = BytesMut::with_capacity(4);
    out.put_u16(rr.afi.into());
    out.put_u8(0);
    out.put_u8(rr.safi.into());
    out
}

/// Build an UPDATE that announces `prefixes` with the given attribute
/// section, already in wire form. Used by the MRT ingest to synthesise
/// messages from RIB entries.
pub fn build_raw_update(attr_bytes: &[u8], nlri: &[u8]) -> Bytes {
    let body_len = 2 + 2 + attr_bytes.len() + nlri.len();
    let mut out = BytesMut::with_capacity(BGP_HEADER_LEN + body_len);
    out.put_slice(&BGP_MARKER);
    out.put_u16((BGP_HEADER_LEN + body_len) as u16);
    out.put_u8(BgpMessageType::Update.into());
    out.put_u16(0); // no withdrawn routes
    out.put_u16(attr_bytes.len() as u16);
    out.put_slice(attr_bytes);
    out.put_slice(nlri);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AsPath;

    fn sample_update_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&BGP_MARKER);
        bytes.extend_from_slice(&[0x00, 0x34]); // length 52
        bytes.push(0x02); // UPDATE
        bytes.extend_from_slice(&[0x00, 0x00]); // withdrawn length
        bytes.extend_from_slice(&[0x00, 0x1B]); // attribute length 27
        bytes.extend_from_slice(&[0x40, 0x01, 0x01, 0x00]); // ORIGIN igp
        bytes.extend_from_slice(&[0x40, 0x02, 0x06, 0x02, 0x02, 0x00, 0x01, 0x00, 0x02]); // AS_PATH {1 2}
        bytes.extend_from_slice(&[0x40, 0x03, 0x04, 0x0A, 0x00, 0x00, 0x01]); // NEXT_HOP
        bytes.extend_from_slice(&[0x80, 0x04, 0x04, 0x00, 0x00, 0x00, 0x00]); // MED 0
        bytes.extend_from_slice(&[0x08, 0x0A]); // 10.0.0.0/8
        bytes
    }

    #[test]
    fn test_update_roundtrip_2byte_as() {
        let raw = Bytes::from(sample_update_bytes());
        let msg = parse_bgp_message(raw.clone(), AsnLength::Bits16).unwrap();
        let update = match &msg {
            BgpMessage::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(update.announced.len(), 1);
        assert_eq!(update.announced[0].to_string(), "10.0.0.0/8");
        let as_path = AsPath::parse(update.attr(2).unwrap().value.clone(), AsnLength::Bits16)
            .unwrap();
        assert_eq!(as_path, AsPath::from_sequence(&[1, 2]));

        // attributes already arrive in ascending code order, so the
        // re-serialisation matches byte for byte
        let encoded = encode_bgp_message(&msg, AsnLength::Bits16);
        assert_eq!(encoded, raw);
    }

    #[test]
    fn test_header_validation() {
        let mut bad_marker = sample_update_bytes();
        bad_marker[0] = 0x00;
        assert!(parse_bgp_message(Bytes::from(bad_marker), AsnLength::Bits16).is_err());

        let mut bad_len = sample_update_bytes();
        bad_len[16] = 0xFF;
        bad_len[17] = 0xFF;
        assert!(parse_bgp_message(Bytes::from(bad_len), AsnLength::Bits16).is_err());

        let mut bad_type = sample_update_bytes();
        bad_type[18] = 9;
        assert!(parse_bgp_message(Bytes::from(bad_type), AsnLength::Bits16).is_err());
    }

    #[test]
    fn test_declared_length_checked_against_buffer() {
        let mut raw = sample_update_bytes();
        raw.pop();
        assert!(parse_bgp_message(Bytes::from(raw), AsnLength::Bits16).is_err());
    }

    #[test]
    fn test_open_roundtrip_with_capabilities() {
        let open = BgpOpen {
            version: 4,
            asn: 65001,
            hold_time: 180,
            bgp_id: u32::from_be_bytes([192, 0, 2, 1]),
            capabilities: vec![
                BgpCapability::multiprotocol(Afi::Ipv4, Safi::Unicast),
                BgpCapability::route_refresh(),
                BgpCapability::four_octet_as(65001),
            ],
        };
        let encoded = encode_bgp_message(&BgpMessage::Open(open.clone()), AsnLength::Bits16);
        let parsed = parse_bgp_message(encoded, AsnLength::Bits16).unwrap();
        match parsed {
            BgpMessage::Open(parsed_open) => {
                assert_eq!(parsed_open, open);
                assert_eq!(parsed_open.effective_asn(), 65001);
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let encoded = encode_bgp_message(&BgpMessage::Keepalive, AsnLength::Bits16);
        assert_eq!(encoded.len(), BGP_HEADER_LEN);
        assert_eq!(
            parse_bgp_message(encoded, AsnLength::Bits16).unwrap(),
            BgpMessage::Keepalive
        );
    }

    #[test]
    fn test_notification_roundtrip() {
        let notification = BgpNotification {
            error_code: 2,
            error_subcode: 7,
            data: Bytes::from(vec![0x41]),
        };
        let encoded =
            encode_bgp_message(&BgpMessage::Notification(notification.clone()), AsnLength::Bits16);
        match parse_bgp_message(encoded, AsnLength::Bits16).unwrap() {
            BgpMessage::Notification(parsed) => assert_eq!(parsed, notification),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_route_refresh_roundtrip() {
        let rr = BgpRouteRefresh {
            afi: Afi::Ipv4,
            safi: Safi::Unicast,
        };
        let encoded = encode_bgp_message(&BgpMessage::RouteRefresh(rr), AsnLength::Bits16);
        match parse_bgp_message(encoded, AsnLength::Bits16).unwrap() {
            BgpMessage::RouteRefresh(parsed) => assert_eq!(parsed, rr),
            other => panic!("expected route refresh, got {other:?}"),
        }
    }

    #[test]
    fn test_update_width_conversion() {
        let raw = Bytes::from(sample_update_bytes());
        let msg = parse_bgp_message(raw, AsnLength::Bits16).unwrap();
        let wide = encode_bgp_message(&msg, AsnLength::Bits32);
        // re-parse at the 4-octet width and confirm the path survived
        match parse_bgp_message(wide, AsnLength::Bits32).unwrap() {
            BgpMessage::Update(update) => {
                let path =
                    AsPath::parse(update.attr(2).unwrap().value.clone(), AsnLength::Bits32)
                        .unwrap();
                assert_eq!(path, AsPath::from_sequence(&[1, 2]));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }
}
