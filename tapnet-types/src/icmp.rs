use std::io::{Error, ErrorKind, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::{checksum, FromBytestream, ToBytestream};

pub const PROTO_ICMP: u8 = 1;

/// The echo pair is the only ICMP traffic this stack answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpPacket {
    EchoReply {
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
    },
    EchoRequest {
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
    },
}

impl ToBytestream for IcmpPacket {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        let (typ, identifier, sequence, payload) = match self {
            Self::EchoReply {
                identifier,
                sequence,
                payload,
            } => (0u8, identifier, sequence, payload),
            Self::EchoRequest {
                identifier,
                sequence,
                payload,
            } => (8u8, identifier, sequence, payload),
        };

        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.write_u8(typ)?;
        buf.write_u8(0)?;
        buf.write_u16::<BE>(0)?;
        buf.write_u16::<BE>(*identifier)?;
        buf.write_u16::<BE>(*sequence)?;
        buf.write_all(payload)?;

        let csum = !checksum::data(&buf);
        buf[2..4].copy_from_slice(&csum.to_be_bytes());
        stream.write_all(&buf)
    }
}

impl FromBytestream for IcmpPacket {
    type Error = Error;
    fn from_bytestream(stream: &mut std::io::Cursor<&[u8]>) -> Result<Self, Self::Error> {
        let start = stream.position() as usize;

        let typ = stream.read_u8()?;
        let code = stream.read_u8()?;
        let _checksum = stream.read_u16::<BE>()?;
        let identifier = stream.read_u16::<BE>()?;
        let sequence = stream.read_u16::<BE>()?;
        let mut payload = Vec::new();
        stream.read_to_end(&mut payload)?;

        if checksum::data(&stream.get_ref()[start..]) != 0xffff {
            return Err(Error::new(ErrorKind::InvalidData, "icmp checksum mismatch"));
        }

        match (typ, code) {
            (0, 0) => Ok(Self::EchoReply {
                identifier,
                sequence,
                payload,
            }),
            (8, 0) => Ok(Self::EchoRequest {
                identifier,
                sequence,
                payload,
            }),
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unsupported icmp type {typ} code {code}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_roundtrip() {
        let request = IcmpPacket::EchoRequest {
            identifier: 7,
            sequence: 3,
            payload: b"abcdefgh".to_vec(),
        };
        let bytes = request.to_vec().unwrap();
        assert_eq!(IcmpPacket::from_slice(&bytes).unwrap(), request);
    }

    #[test]
    fn corrupted_echo_is_rejected() {
        let mut bytes = IcmpPacket::EchoRequest {
            identifier: 7,
            sequence: 3,
            payload: Vec::new(),
        }
        .to_vec()
        .unwrap();
        bytes[4] ^= 0xff;
        assert!(IcmpPacket::from_slice(&bytes).is_err());
    }
}
