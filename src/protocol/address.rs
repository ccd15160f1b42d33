//! Wire encoding for peer addresses: a one-octet tag (4 or 6) followed by
//! the address octets in network order. No textual form ever crosses the
//! wire; parsing/formatting only happens at the process boundary (logging).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::CodecError;

const TAG_V4: u8 = 4;
const TAG_V6: u8 = 6;

/// An [`IpAddr`] in its on-wire form: tag + 4 or 16 octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedAddress(pub IpAddr);

impl EncodedAddress {
    /// Total length of the encoded form, including the tag octet.
    pub fn encoded_len(&self) -> usize {
        match self.0 {
            IpAddr::V4(_) => 5,
            IpAddr::V6(_) => 17,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self.0 {
            IpAddr::V4(addr) => {
                out.write_u8(TAG_V4).expect("writing to a Vec never fails");
                out.extend_from_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                out.write_u8(TAG_V6).expect("writing to a Vec never fails");
                out.extend_from_slice(&addr.octets());
            }
        }
    }

    pub fn decode(mut bytes: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let tag = bytes.read_u8().map_err(|_| CodecError::Truncated)?;
        match tag {
            TAG_V4 => {
                if bytes.len() < 4 {
                    return Err(CodecError::Truncated);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[..4]);
                Ok((Self(IpAddr::V4(Ipv4Addr::from(octets))), &bytes[4..]))
            }
            TAG_V6 => {
                if bytes.len() < 16 {
                    return Err(CodecError::Truncated);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                Ok((Self(IpAddr::V6(Ipv6Addr::from(octets))), &bytes[16..]))
            }
            other => Err(CodecError::UnknownAddressTag(other)),
        }
    }
}

impl From<IpAddr> for EncodedAddress {
    fn from(addr: IpAddr) -> Self {
        Self(addr)
    }
}
