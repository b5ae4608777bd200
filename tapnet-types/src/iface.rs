use std::fmt::Display;
use std::io::{Error, ErrorKind, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::{FromBytestream, ToBytestream};

pub const KIND_IPV4: u16 = 0x0800;
pub const KIND_ARP: u16 = 0x0806;

/// The padded payload minimum of an Ethernet frame (without FCS).
const MIN_PAYLOAD: usize = 46;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const NULL: MacAddress = MacAddress([0; 6]);
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// A random locally administered unicast address.
    #[must_use]
    pub fn gen() -> MacAddress {
        let mut mac = rand::random::<[u8; 6]>();
        mac[0] &= 0b1111_1110;
        mac[0] |= 0b0000_0010;
        MacAddress(mac)
    }

    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        *self == MacAddress::NULL
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == MacAddress::BROADCAST
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        MacAddress(value)
    }
}

impl From<MacAddress> for [u8; 6] {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// An Ethernet II frame as read from or written to the tap device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dest: MacAddress,
    pub src: MacAddress,
    pub kind: u16,
    pub content: Vec<u8>,
}

impl ToBytestream for EthernetFrame {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        stream.write_all(self.dest.as_slice())?;
        stream.write_all(self.src.as_slice())?;
        stream.write_u16::<BE>(self.kind)?;
        stream.write_all(&self.content)?;
        for _ in self.content.len()..MIN_PAYLOAD {
            stream.write_u8(0)?;
        }
        Ok(())
    }
}

impl FromBytestream for EthernetFrame {
    type Error = Error;
    fn from_bytestream(stream: &mut std::io::Cursor<&[u8]>) -> Result<Self, Self::Error> {
        let mut dest = [0u8; 6];
        stream.read_exact(&mut dest)?;
        let mut src = [0u8; 6];
        stream.read_exact(&mut src)?;
        let kind = stream.read_u16::<BE>()?;
        if kind < 0x0600 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "802.3 length field instead of an ethertype",
            ));
        }

        let mut content = Vec::new();
        stream.read_to_end(&mut content)?;
        Ok(EthernetFrame {
            dest: MacAddress::from(dest),
            src: MacAddress::from(src),
            kind,
            content,
        })
    }
}
