use crate::error::ParserError;
use crate::parser::ReadUtils;
use bytes::{BufMut, Bytes, BytesMut};
use ipnet::{IpNet, Ipv4Net, Ipv6Net, PrefixLenError};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 2-octet AS number used in place of a 4-octet AS when talking to a
/// 2-octet-only peer (RFC 4893).
pub const AS_TRANS: u32 = 23456;

/// Address family identifier.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u16)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

/// Subsequent address family identifier. The RIB keys on the raw octet, so
/// unknown values are carried rather than rejected.
#[derive(Debug, FromPrimitive, IntoPrimitive, PartialEq, Eq, Hash, Copy, Clone)]
#[repr(u8)]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// AS number width negotiated for a session (RFC 4893).
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone)]
pub enum AsnLength {
    Bits16,
    Bits32,
}

impl AsnLength {
    pub fn octets(&self) -> usize {
        match self {
            AsnLength::Bits16 => 2,
            AsnLength::Bits32 => 4,
        }
    }
}

/// A prefix exactly as it appears on the wire: declared bit length plus the
/// minimum number of octets that cover it. The routing tables key on this
/// form, so no normalisation to host addresses happens here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawPrefix {
    pub afi: Afi,
    pub safi: Safi,
    pub bit_len: u8,
    pub addr: SmallVec<[u8; 16]>,
}

/// Octets needed to carry `bit_len` prefix bits.
#[inline]
pub fn prefix_octets(bit_len: u8) -> usize {
    (bit_len as usize + 7) / 8
}

impl RawPrefix {
    pub fn new(afi: Afi, safi: Safi, bit_len: u8, addr: &[u8]) -> Self {
        RawPrefix {
            afi,
            safi,
            bit_len,
            addr: SmallVec::from_slice(addr),
        }
    }

    /// Read one `<length, prefix>` pair, validating the declared bit length
    /// against the family and the remaining buffer before advancing.
    pub fn parse(
        input: &mut Bytes,
        afi: Afi,
        safi: Safi,
    ) -> Result<RawPrefix, ParserError> {
        let bit_len = input.read_u8()?;
        let max_bits = match afi {
            Afi::Ipv4 => 32,
            Afi::Ipv6 => 128,
        };
        if bit_len > max_bits {
            return Err(ParserError::ParseError(format!(
                "invalid prefix length {bit_len} for {afi:?}"
            )));
        }
        let n = prefix_octets(bit_len);
        let bytes = input.read_n_bytes(n)?;
        let addr = SmallVec::from_slice(&bytes);
        Ok(RawPrefix {
            afi,
            safi,
            bit_len,
            addr,
        })
    }

    /// Wire size of the `<length, prefix>` pair.
    pub fn encoded_len(&self) -> usize {
        1 + prefix_octets(self.bit_len)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.bit_len);
        out.put_slice(&self.addr[..prefix_octets(self.bit_len)]);
    }

    /// The prefix as a network, for display and API consumers. Fails only
    /// when the record carries an out-of-range bit length.
    pub fn to_ip_net(&self) -> Result<IpNet, PrefixLenError> {
        match self.to_ip_addr() {
            IpAddr::V4(addr) => Ipv4Net::new(addr, self.bit_len).map(IpNet::V4),
            IpAddr::V6(addr) => Ipv6Net::new(addr, self.bit_len).map(IpNet::V6),
        }
    }

    /// The prefix as a host address with trailing bits zeroed.
    pub fn to_ip_addr(&self) -> IpAddr {
        match self.afi {
            Afi::Ipv4 => {
                let mut octets = [0u8; 4];
                let n = prefix_octets(self.bit_len).min(4);
                octets[..n].copy_from_slice(&self.addr[..n]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            Afi::Ipv6 => {
                let mut octets = [0u8; 16];
                let n = prefix_octets(self.bit_len).min(16);
                octets[..n].copy_from_slice(&self.addr[..n]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }
}

impl Display for RawPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.to_ip_net() {
            Ok(net) => write!(f, "{net}"),
            Err(_) => write!(f, "{}/{}", self.to_ip_addr(), self.bit_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_octets() {
        assert_eq!(prefix_octets(0), 0);
        assert_eq!(prefix_octets(1), 1);
        assert_eq!(prefix_octets(8), 1);
        assert_eq!(prefix_octets(9), 2);
        assert_eq!(prefix_octets(24), 3);
        assert_eq!(prefix_octets(32), 4);
    }

    #[test]
    fn test_parse_and_encode_roundtrip() {
        let mut data = Bytes::from(vec![24, 192, 0, 2]);
        let prefix = RawPrefix::parse(&mut data, Afi::Ipv4, Safi::Unicast).unwrap();
        assert_eq!(prefix.bit_len, 24);
        assert_eq!(prefix.to_string(), "192.0.2.0/24");

        let mut out = BytesMut::new();
        prefix.encode(&mut out);
        assert_eq!(out.freeze(), Bytes::from(vec![24, 192, 0, 2]));
    }

    #[test]
    fn test_one_bit_prefix_encodes_to_two_bytes() {
        let prefix = RawPrefix::new(Afi::Ipv4, Safi::Unicast, 1, &[0x80]);
        let mut out = BytesMut::new();
        prefix.encode(&mut out);
        assert_eq!(out.freeze(), Bytes::from(vec![0x01, 0x80]));
    }

    #[test]
    fn test_zero_length_prefix_is_single_byte() {
        let prefix = RawPrefix::new(Afi::Ipv4, Safi::Unicast, 0, &[]);
        let mut out = BytesMut::new();
        prefix.encode(&mut out);
        assert_eq!(out.freeze(), Bytes::from(vec![0x00]));
        assert_eq!(prefix.encoded_len(), 1);
    }

    #[test]
    fn test_truncated_prefix_rejected() {
        let mut data = Bytes::from(vec![24, 192, 0]);
        assert!(RawPrefix::parse(&mut data, Afi::Ipv4, Safi::Unicast).is_err());
    }

    #[test]
    fn test_oversized_bit_length_rejected() {
        let mut data = Bytes::from(vec![33, 192, 0, 2, 0, 0]);
        assert!(RawPrefix::parse(&mut data, Afi::Ipv4, Safi::Unicast).is_err());
    }
}
