use std::io::{Error, ErrorKind, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::{checksum, FromBytestream, ToBytestream};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ipv4Packet {
    pub dscp: u8,
    pub ecn: u8,
    pub identification: u16,
    pub flags: Ipv4Flags,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,

    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Flags {
    pub df: bool,
    pub mf: bool,
}

impl Ipv4Packet {
    /// An empty packet headed back to the sender of `self`.
    #[must_use]
    pub fn response(&self, content: Vec<u8>) -> Ipv4Packet {
        Ipv4Packet {
            dscp: self.dscp,
            ecn: self.ecn,
            identification: self.identification,
            flags: Ipv4Flags {
                df: self.flags.df,
                mf: false,
            },
            fragment_offset: 0,
            ttl: 64,
            proto: self.proto,
            src: self.dest,
            dest: self.src,
            content,
        }
    }
}

impl ToBytestream for Ipv4Packet {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        let mut header = [0u8; 20];
        header[0] = 0b0100_0101;
        header[1] = (self.dscp << 2) | (self.ecn & 0b11);

        let len = 20 + self.content.len() as u16;
        header[2..4].copy_from_slice(&len.to_be_bytes());
        header[4..6].copy_from_slice(&self.identification.to_be_bytes());

        let fword = self.flags.as_u16() | (self.fragment_offset & 0x1fff);
        header[6..8].copy_from_slice(&fword.to_be_bytes());

        header[8] = self.ttl;
        header[9] = self.proto;
        header[12..16].copy_from_slice(&self.src.octets());
        header[16..20].copy_from_slice(&self.dest.octets());

        let csum = !checksum::data(&header);
        header[10..12].copy_from_slice(&csum.to_be_bytes());

        stream.write_all(&header)?;
        stream.write_all(&self.content)?;
        Ok(())
    }
}

impl FromBytestream for Ipv4Packet {
    type Error = Error;
    fn from_bytestream(stream: &mut std::io::Cursor<&[u8]>) -> Result<Self, Self::Error> {
        let start = stream.position() as usize;

        let byte0 = stream.read_u8()?;
        if byte0 >> 4 != 4 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "ipv4 packet expected, got different version",
            ));
        }
        let ihl = usize::from(byte0 & 0x0f) * 4;
        if ihl < 20 {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 header too short"));
        }

        let byte1 = stream.read_u8()?;
        let dscp = byte1 >> 2;
        let ecn = byte1 & 0b11;

        let len = stream.read_u16::<BE>()? as usize;
        let identification = stream.read_u16::<BE>()?;

        let fword = stream.read_u16::<BE>()?;
        let flags = Ipv4Flags {
            df: fword & (0b010 << 13) != 0,
            mf: fword & (0b001 << 13) != 0,
        };
        let fragment_offset = fword & 0x1fff;

        let ttl = stream.read_u8()?;
        let proto = stream.read_u8()?;
        let _checksum = stream.read_u16::<BE>()?;

        let mut addr = [0u8; 4];
        stream.read_exact(&mut addr)?;
        let src = Ipv4Addr::from(addr);
        stream.read_exact(&mut addr)?;
        let dest = Ipv4Addr::from(addr);

        let raw = *stream.get_ref();
        if raw.len() < start + len || len < ihl {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 length field invalid"));
        }
        if checksum::data(&raw[start..start + ihl]) != 0xffff {
            return Err(Error::new(ErrorKind::InvalidData, "ipv4 checksum mismatch"));
        }

        // options are skipped, the payload is bounded by the length field
        // (link-layer padding may trail it)
        stream.set_position((start + ihl) as u64);
        let mut content = vec![0u8; len - ihl];
        stream.read_exact(&mut content)?;

        Ok(Ipv4Packet {
            dscp,
            ecn,
            identification,
            flags,
            fragment_offset,
            ttl,
            proto,
            src,
            dest,
            content,
        })
    }
}

impl Ipv4Flags {
    fn as_u16(self) -> u16 {
        (u16::from(self.df) << 14) | (u16::from(self.mf) << 13)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> Ipv4Packet {
        Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 42,
            flags: Ipv4Flags { df: true, mf: false },
            fragment_offset: 0,
            ttl: 64,
            proto: 6,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dest: Ipv4Addr::new(10, 0, 0, 4),
            content: b"payload".to_vec(),
        }
    }

    #[test]
    fn emitted_checksum_verifies() {
        let bytes = packet().to_vec().unwrap();
        assert_eq!(checksum::data(&bytes[..20]), 0xffff);
        assert_eq!(Ipv4Packet::from_slice(&bytes).unwrap(), packet());
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let mut bytes = packet().to_vec().unwrap();
        bytes[8] = bytes[8].wrapping_add(1);
        assert!(Ipv4Packet::from_slice(&bytes).is_err());
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut bytes = packet().to_vec().unwrap();
        bytes.extend_from_slice(&[0; 18]);
        assert_eq!(Ipv4Packet::from_slice(&bytes).unwrap(), packet());
    }
}
