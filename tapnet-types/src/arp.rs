use std::io::{Error, ErrorKind, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::iface::{MacAddress, KIND_IPV4};
use crate::{FromBytestream, ToBytestream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

/// An ARP packet for the one pairing this stack speaks,
/// Ethernet hardware addresses carrying IPv4.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub src_mac: MacAddress,
    pub src_ip: Ipv4Addr,
    pub dest_mac: MacAddress,
    pub dest_ip: Ipv4Addr,
}

impl ArpPacket {
    #[must_use]
    pub fn request(src_mac: MacAddress, src_ip: Ipv4Addr, dest_ip: Ipv4Addr) -> ArpPacket {
        ArpPacket {
            operation: ArpOperation::Request,
            src_mac,
            src_ip,
            dest_mac: MacAddress::NULL,
            dest_ip,
        }
    }

    /// The reply a host owning `mac` sends for this request.
    #[must_use]
    pub fn into_reply(&self, mac: MacAddress) -> ArpPacket {
        ArpPacket {
            operation: ArpOperation::Reply,
            src_mac: mac,
            src_ip: self.dest_ip,
            dest_mac: self.src_mac,
            dest_ip: self.src_ip,
        }
    }
}

impl ToBytestream for ArpPacket {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        stream.write_u16::<BE>(1)?;
        stream.write_u16::<BE>(KIND_IPV4)?;
        stream.write_u8(6)?;
        stream.write_u8(4)?;
        stream.write_u16::<BE>(self.operation as u16)?;
        stream.write_all(self.src_mac.as_slice())?;
        stream.write_all(&self.src_ip.octets())?;
        stream.write_all(self.dest_mac.as_slice())?;
        stream.write_all(&self.dest_ip.octets())?;
        Ok(())
    }
}

impl FromBytestream for ArpPacket {
    type Error = Error;
    fn from_bytestream(stream: &mut std::io::Cursor<&[u8]>) -> Result<Self, Self::Error> {
        let htype = stream.read_u16::<BE>()?;
        let ptype = stream.read_u16::<BE>()?;
        let haddrlen = stream.read_u8()?;
        let paddrlen = stream.read_u8()?;
        if (htype, ptype, haddrlen, paddrlen) != (1, KIND_IPV4, 6, 4) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "arp packet is not ethernet/ipv4",
            ));
        }

        let operation = match stream.read_u16::<BE>()? {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            op => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid arp operation {op}"),
                ))
            }
        };

        let mut mac = [0u8; 6];
        let mut ip = [0u8; 4];

        stream.read_exact(&mut mac)?;
        stream.read_exact(&mut ip)?;
        let src_mac = MacAddress::from(mac);
        let src_ip = Ipv4Addr::from(ip);

        stream.read_exact(&mut mac)?;
        stream.read_exact(&mut ip)?;
        let dest_mac = MacAddress::from(mac);
        let dest_ip = Ipv4Addr::from(ip);

        Ok(ArpPacket {
            operation,
            src_mac,
            src_ip,
            dest_mac,
            dest_ip,
        })
    }
}
