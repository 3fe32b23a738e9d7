use crate::models::{Afi, Safi};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

/// Capability codes (RFC 5492 registry). Unassigned and unsupported codes
/// are carried raw so the required-capability check can still compare
/// payloads byte for byte.
#[derive(Debug, FromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u8)]
pub enum BgpCapabilityCode {
    Multiprotocol = 1,
    RouteRefresh = 2,
    FourOctetAs = 65,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One capability as carried in an OPEN optional parameter: code plus raw
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpCapability {
    pub code: BgpCapabilityCode,
    pub value: Bytes,
}

impl BgpCapability {
    pub fn new(code: BgpCapabilityCode, value: Bytes) -> Self {
        BgpCapability { code, value }
    }

    pub fn multiprotocol(afi: Afi, safi: Safi) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u16(afi.into());
        value.put_u8(0); // reserved
        value.put_u8(safi.into());
        BgpCapability {
            code: BgpCapabilityCode::Multiprotocol,
            value: value.freeze(),
        }
    }

    pub fn route_refresh() -> Self {
        BgpCapability {
            code: BgpCapabilityCode::RouteRefresh,
            value: Bytes::new(),
        }
    }

    pub fn four_octet_as(asn: u32) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(asn);
        BgpCapability {
            code: BgpCapabilityCode::FourOctetAs,
            value: value.freeze(),
        }
    }

    /// The advertised 4-octet AS, when this is a FourOctetAs capability
    /// with a well-formed payload.
    pub fn four_octet_asn(&self) -> Option<u32> {
        if self.code == BgpCapabilityCode::FourOctetAs && self.value.len() == 4 {
            Some(u32::from_be_bytes([
                self.value[0],
                self.value[1],
                self.value[2],
                self.value[3],
            ]))
        } else {
            None
        }
    }

    pub fn is_route_refresh(&self) -> bool {
        self.code == BgpCapabilityCode::RouteRefresh
    }

    /// Serialise as a capability triplet (code, length, value).
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.code.into());
        out.put_u8(self.value.len() as u8);
        out.put_slice(&self.value);
    }

    pub fn wire_len(&self) -> usize {
        2 + self.value.len()
    }
}

/// A capability the local side requires the peer to advertise, payload and
/// all. Checked during OPEN validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequirement {
    pub capability: BgpCapability,
    /// When false a missing capability is tolerated and only logged.
    pub mandatory: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_octet_roundtrip() {
        let cap = BgpCapability::four_octet_as(196608);
        assert_eq!(cap.four_octet_asn(), Some(196608));
        let mut out = BytesMut::new();
        cap.encode(&mut out);
        assert_eq!(out.freeze(), Bytes::from(vec![65, 4, 0x00, 0x03, 0x00, 0x00]));
    }

    #[test]
    fn test_multiprotocol_payload() {
        let cap = BgpCapability::multiprotocol(Afi::Ipv6, Safi::Unicast);
        assert_eq!(cap.value, Bytes::from(vec![0x00, 0x02, 0x00, 0x01]));
    }

    #[test]
    fn test_unknown_code_is_carried() {
        let cap = BgpCapability::new(BgpCapabilityCode::from(70u8), Bytes::new());
        assert_eq!(cap.code, BgpCapabilityCode::Unknown(70));
    }
}
