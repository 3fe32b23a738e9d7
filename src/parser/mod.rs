/*!
Byte-level reading utilities shared by the BGP and MRT decoders.

Everything in the pipeline parses out of [`bytes::Bytes`] views; the
[`ReadUtils`] trait adds bounds-checked reads on top of [`Buf`] so a
truncated message surfaces as a [`ParserError`] instead of a panic.
*/
pub mod bgp;
pub mod mrt;

use crate::error::ParserError;
use crate::models::{Afi, AsnLength};
use bytes::{Buf, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub trait ReadUtils: Buf {
    #[inline]
    fn has_n_remaining(&self, n: usize) -> Result<(), ParserError> {
        if self.remaining() < n {
            return Err(ParserError::TruncatedMsg(format!(
                "truncated message: {} bytes available, {} bytes needed",
                self.remaining(),
                n
            )));
        }
        Ok(())
    }

    #[inline]
    fn read_u8(&mut self) -> Result<u8, ParserError> {
        self.has_n_remaining(1)?;
        Ok(self.get_u8())
    }

    #[inline]
    fn read_u16(&mut self) -> Result<u16, ParserError> {
        self.has_n_remaining(2)?;
        Ok(self.get_u16())
    }

    #[inline]
    fn read_u32(&mut self) -> Result<u32, ParserError> {
        self.has_n_remaining(4)?;
        Ok(self.get_u32())
    }

    fn read_n_bytes(&mut self, n_bytes: usize) -> Result<Bytes, ParserError> {
        self.has_n_remaining(n_bytes)?;
        Ok(self.copy_to_bytes(n_bytes))
    }

    fn read_asn(&mut self, asn_len: AsnLength) -> Result<u32, ParserError> {
        match asn_len {
            AsnLength::Bits16 => Ok(self.read_u16()? as u32),
            AsnLength::Bits32 => self.read_u32(),
        }
    }

    fn read_afi(&mut self) -> Result<Afi, ParserError> {
        let afi = self.read_u16()?;
        Afi::try_from(afi).map_err(ParserError::from)
    }

    fn read_ipv4_address(&mut self) -> Result<Ipv4Addr, ParserError> {
        Ok(Ipv4Addr::from(self.read_u32()?))
    }

    fn read_ipv6_address(&mut self) -> Result<Ipv6Addr, ParserError> {
        self.has_n_remaining(16)?;
        let mut buf = [0u8; 16];
        self.copy_to_slice(&mut buf);
        Ok(Ipv6Addr::from(buf))
    }

    fn read_address(&mut self, afi: Afi) -> Result<IpAddr, ParserError> {
        match afi {
            Afi::Ipv4 => Ok(IpAddr::V4(self.read_ipv4_address()?)),
            Afi::Ipv6 => Ok(IpAddr::V6(self.read_ipv6_address()?)),
        }
    }
}

impl<T: Buf> ReadUtils for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_checked_reads() {
        let mut data = Bytes::from(vec![0x00, 0x01, 0x02]);
        assert_eq!(data.read_u16().unwrap(), 1);
        assert!(data.read_u16().is_err());
        assert_eq!(data.read_u8().unwrap(), 2);
        assert!(data.read_u8().is_err());
    }

    #[test]
    fn test_read_asn_widths() {
        let mut data = Bytes::from(vec![0xfd, 0xe9]);
        assert_eq!(data.read_asn(AsnLength::Bits16).unwrap(), 65001);
        let mut data = Bytes::from(vec![0x00, 0x01, 0x00, 0x00]);
        assert_eq!(data.read_asn(AsnLength::Bits32).unwrap(), 65536);
    }

    #[test]
    fn test_read_address() {
        let mut data = Bytes::from(vec![192, 0, 2, 1]);
        assert_eq!(
            data.read_address(Afi::Ipv4).unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
        );
    }
}
