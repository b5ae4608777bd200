use std::fmt::Display;
use std::io::{Error, ErrorKind, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::{checksum, FromBytestream, ToBytestream};

pub const PROTO_TCP: u8 = 0x06;

/// A TCP segment associated with an end-to-end connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq_no: u32,
    pub ack_no: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_ptr: u16,
    pub options: Vec<TcpOption>,

    pub content: Vec<u8>,
}

/// Flags of a [`TcpPacket`], including the ECN nonce bit
/// carried in the data-offset byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct TcpFlags {
    pub ns: bool,
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

/// Options of a [`TcpPacket`]. Everything beyond the maximum segment
/// size is parsed but carries no meaning for this stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    MaximumSegmentSize(u16),
    WindowScaling(u8),
    SackPermitted,
    Sack(Vec<(u32, u32)>),
    Timestamp(u32, u32),
    EndOfOptionsList,
}

macro_rules! fimpl {
    ($i:ident) => {
        #[must_use]
        pub fn $i(mut self, value: bool) -> Self {
            self.$i = value;
            self
        }
    };
}

impl TcpPacket {
    /// A bare acknowledgment carrying `content`.
    #[must_use]
    pub fn new(
        src_port: u16,
        dest_port: u16,
        seq_no: u32,
        ack_no: u32,
        window: u16,
        content: Vec<u8>,
    ) -> TcpPacket {
        TcpPacket {
            src_port,
            dest_port,
            seq_no,
            ack_no,
            flags: TcpFlags::new().ack(true),
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content,
        }
    }

    #[must_use]
    pub fn syn(src_port: u16, dest_port: u16, seq_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port,
            dest_port,
            seq_no,
            ack_no: 0,
            flags: TcpFlags::new().syn(true),
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Vec::new(),
        }
    }

    #[must_use]
    pub fn syn_ack(syn: &TcpPacket, seq_no: u32, window: u16) -> TcpPacket {
        TcpPacket {
            src_port: syn.dest_port,
            dest_port: syn.src_port,
            seq_no,
            ack_no: syn.seq_no.wrapping_add(1),
            flags: TcpFlags::new().syn(true).ack(true),
            window,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Vec::new(),
        }
    }

    /// The reset answering a segment that reached no connection: it takes
    /// its sequence number from the acknowledgment if one was present and
    /// acknowledges the offending sequence number otherwise.
    #[must_use]
    pub fn rst_for(pkt: &TcpPacket) -> TcpPacket {
        TcpPacket {
            src_port: pkt.dest_port,
            dest_port: pkt.src_port,
            seq_no: if pkt.flags.ack { pkt.ack_no } else { 0 },
            ack_no: pkt.seq_no.wrapping_add(1),
            flags: TcpFlags::new().rst(true).ack(!pkt.flags.ack),
            window: 0,
            urgent_ptr: 0,
            options: Vec::new(),
            content: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mss(mut self, mss: u16) -> Self {
        if self.options.last() == Some(&TcpOption::EndOfOptionsList) {
            self.options.pop();
        }
        self.options.push(TcpOption::MaximumSegmentSize(mss));
        self
    }

    #[must_use]
    pub fn mss_option(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            TcpOption::MaximumSegmentSize(mss) => Some(*mss),
            _ => None,
        })
    }
}

impl TcpFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    fimpl!(ns);
    fimpl!(cwr);
    fimpl!(ece);
    fimpl!(urg);
    fimpl!(ack);
    fimpl!(psh);
    fimpl!(rst);
    fimpl!(syn);
    fimpl!(fin);
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.urg {
            write!(f, "URG")?;
        }
        if self.ack {
            write!(f, "ACK")?;
        }
        if self.psh {
            write!(f, "PSH")?;
        }
        if self.rst {
            write!(f, "RST")?;
        }
        if self.syn {
            write!(f, "SYN")?;
        }
        if self.fin {
            write!(f, "FIN")?;
        }
        Ok(())
    }
}

/// Verify the pseudo-header checksum of a raw segment received
/// between `src` and `dest`.
#[must_use]
pub fn verify_checksum(src: Ipv4Addr, dest: Ipv4Addr, segment: &[u8]) -> bool {
    if segment.len() < 20 {
        return false;
    }
    checksum::combine(&[checksum::data(segment), pseudo_header(src, dest, segment.len())])
        == 0xffff
}

/// Stamp the checksum field of a raw segment about to be sent
/// from `src` to `dest`.
pub fn apply_checksum(src: Ipv4Addr, dest: Ipv4Addr, segment: &mut [u8]) {
    segment[16] = 0;
    segment[17] = 0;
    let csum = !checksum::combine(&[
        checksum::data(segment),
        pseudo_header(src, dest, segment.len()),
    ]);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());
}

fn pseudo_header(src: Ipv4Addr, dest: Ipv4Addr, tcp_len: usize) -> u16 {
    checksum::combine(&[
        checksum::data(&src.octets()),
        checksum::data(&dest.octets()),
        u16::from(PROTO_TCP),
        tcp_len as u16,
    ])
}

impl ToBytestream for TcpPacket {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        let mut options = Vec::new();
        for option in &self.options {
            option.to_bytestream(&mut options)?;
        }
        while options.len() % 4 != 0 {
            options.push(0);
        }

        stream.write_u16::<BE>(self.src_port)?;
        stream.write_u16::<BE>(self.dest_port)?;
        stream.write_u32::<BE>(self.seq_no)?;
        stream.write_u32::<BE>(self.ack_no)?;

        let hlen = (20 + options.len()) / 4;
        stream.write_u8(((hlen as u8) << 4) | u8::from(self.flags.ns))?;
        self.flags.to_bytestream(stream)?;

        stream.write_u16::<BE>(self.window)?;
        stream.write_u16::<BE>(0)?;
        stream.write_u16::<BE>(self.urgent_ptr)?;

        stream.write_all(&options)?;
        stream.write_all(&self.content)?;
        Ok(())
    }
}

impl FromBytestream for TcpPacket {
    type Error = Error;
    fn from_bytestream(stream: &mut std::io::Cursor<&[u8]>) -> Result<Self, Self::Error> {
        let src_port = stream.read_u16::<BE>()?;
        let dest_port = stream.read_u16::<BE>()?;
        let seq_no = stream.read_u32::<BE>()?;
        let ack_no = stream.read_u32::<BE>()?;

        let offset = stream.read_u8()?;
        let hlen = usize::from(offset >> 4) * 4;
        if hlen < 20 {
            return Err(Error::new(ErrorKind::InvalidData, "tcp data offset too small"));
        }
        let mut flags = TcpFlags::from_bytestream(stream)?;
        flags.ns = offset & 0b1 != 0;

        let window = stream.read_u16::<BE>()?;
        let _checksum = stream.read_u16::<BE>()?;
        let urgent_ptr = stream.read_u16::<BE>()?;

        let mut raw_options = vec![0u8; hlen - 20];
        stream.read_exact(&mut raw_options)?;
        let options = parse_options(&raw_options);

        let mut content = Vec::new();
        stream.read_to_end(&mut content)?;

        Ok(TcpPacket {
            src_port,
            dest_port,
            seq_no,
            ack_no,
            flags,
            window,
            urgent_ptr,
            options,
            content,
        })
    }
}

/// Walk the options block: end-of-list terminates, no-ops are skipped and
/// an unknown kind silently ends the walk while the header stays usable.
fn parse_options(mut raw: &[u8]) -> Vec<TcpOption> {
    let mut options = Vec::new();
    while let Some(&kind) = raw.first() {
        if kind == 0 {
            options.push(TcpOption::EndOfOptionsList);
            break;
        }
        if kind == 1 {
            raw = &raw[1..];
            continue;
        }

        let Some(&len) = raw.get(1) else { break };
        let len = usize::from(len);
        if len < 2 || raw.len() < len {
            break;
        }
        let body = &raw[2..len];

        match (kind, body.len()) {
            (2, 2) => options.push(TcpOption::MaximumSegmentSize(u16::from_be_bytes([
                body[0], body[1],
            ]))),
            (3, 1) => options.push(TcpOption::WindowScaling(body[0])),
            (4, 0) => options.push(TcpOption::SackPermitted),
            (5, n) if n % 8 == 0 && n <= 32 => {
                let edges = body
                    .chunks_exact(8)
                    .map(|c| {
                        (
                            u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                            u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
                        )
                    })
                    .collect();
                options.push(TcpOption::Sack(edges));
            }
            (8, 8) => options.push(TcpOption::Timestamp(
                u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            )),
            _ => break,
        }
        raw = &raw[len..];
    }
    options
}

impl ToBytestream for TcpFlags {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        let mut byte = 0u8;
        if self.cwr {
            byte |= 0b1000_0000;
        }
        if self.ece {
            byte |= 0b0100_0000;
        }
        if self.urg {
            byte |= 0b0010_0000;
        }
        if self.ack {
            byte |= 0b0001_0000;
        }
        if self.psh {
            byte |= 0b0000_1000;
        }
        if self.rst {
            byte |= 0b0000_0100;
        }
        if self.syn {
            byte |= 0b0000_0010;
        }
        if self.fin {
            byte |= 0b0000_0001;
        }
        stream.write_u8(byte)
    }
}

impl FromBytestream for TcpFlags {
    type Error = Error;
    fn from_bytestream(stream: &mut std::io::Cursor<&[u8]>) -> Result<Self, Self::Error> {
        let byte = stream.read_u8()?;
        Ok(TcpFlags {
            ns: false,
            cwr: byte & 0b1000_0000 != 0,
            ece: byte & 0b0100_0000 != 0,
            urg: byte & 0b0010_0000 != 0,
            ack: byte & 0b0001_0000 != 0,
            psh: byte & 0b0000_1000 != 0,
            rst: byte & 0b0000_0100 != 0,
            syn: byte & 0b0000_0010 != 0,
            fin: byte & 0b0000_0001 != 0,
        })
    }
}

impl ToBytestream for TcpOption {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error> {
        match self {
            Self::MaximumSegmentSize(mss) => {
                stream.write_u8(2)?;
                stream.write_u8(4)?;
                stream.write_u16::<BE>(*mss)
            }
            Self::WindowScaling(cnt) => {
                stream.write_u8(3)?;
                stream.write_u8(3)?;
                stream.write_u8(*cnt)
            }
            Self::SackPermitted => {
                stream.write_u8(4)?;
                stream.write_u8(2)
            }
            Self::Sack(edges) => {
                stream.write_u8(5)?;
                stream.write_u8(2 + 8 * edges.len() as u8)?;
                for (left, right) in edges {
                    stream.write_u32::<BE>(*left)?;
                    stream.write_u32::<BE>(*right)?;
                }
                Ok(())
            }
            Self::Timestamp(send, recv) => {
                stream.write_u8(8)?;
                stream.write_u8(10)?;
                stream.write_u32::<BE>(*send)?;
                stream.write_u32::<BE>(*recv)
            }
            Self::EndOfOptionsList => stream.write_u8(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let pkt = TcpPacket::new(5501, 80, 0x0102_0304, 0x0a0b_0c0d, 4096, b"hi".to_vec());
        let bytes = pkt.to_vec().unwrap();

        assert_eq!(&bytes[0..2], &[0x15, 0x7d]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes[12], 5 << 4);
        assert_eq!(bytes[13], 0b0001_0000);
        assert_eq!(&bytes[14..16], &[0x10, 0x00]);
        assert_eq!(&bytes[20..], b"hi");
    }

    #[test]
    fn mss_option_roundtrip() {
        let pkt = TcpPacket::syn(5501, 80, 100, 4096).with_mss(1460);
        let bytes = pkt.to_vec().unwrap();
        assert_eq!(bytes[12], 6 << 4);

        let parsed = TcpPacket::from_slice(&bytes).unwrap();
        assert_eq!(parsed.mss_option(), Some(1460));
        assert!(parsed.flags.syn && !parsed.flags.ack);
    }

    #[test]
    fn unknown_option_terminates_parse() {
        // MSS, then kind 30 (unassigned), then a timestamp that must not
        // be reached
        let mut raw = vec![2, 4, 0x05, 0xb4];
        raw.extend_from_slice(&[30, 4, 0, 0]);
        raw.extend_from_slice(&[8, 10, 0, 0, 0, 1, 0, 0, 0, 2]);

        let options = parse_options(&raw);
        assert_eq!(options, vec![TcpOption::MaximumSegmentSize(1460)]);
    }

    #[test]
    fn nop_is_skipped() {
        let raw = [1, 1, 3, 3, 7, 0];
        let options = parse_options(&raw);
        assert_eq!(
            options,
            vec![TcpOption::WindowScaling(7), TcpOption::EndOfOptionsList]
        );
    }

    #[test]
    fn checksum_detects_corruption() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 4);

        let mut bytes = TcpPacket::new(80, 5501, 1, 101, 4096, b"Ping!".to_vec())
            .to_vec()
            .unwrap();
        apply_checksum(src, dest, &mut bytes);
        assert!(verify_checksum(src, dest, &bytes));

        bytes[22] ^= 0x01;
        assert!(!verify_checksum(src, dest, &bytes));
    }

    #[test]
    fn rst_shape_follows_offender() {
        let with_ack = TcpPacket::new(80, 5501, 400, 900, 1024, Vec::new());
        let rst = TcpPacket::rst_for(&with_ack);
        assert_eq!(rst.seq_no, 900);
        assert_eq!(rst.ack_no, 401);
        assert!(rst.flags.rst && !rst.flags.ack);

        let without_ack = TcpPacket::syn(80, 5501, 400, 1024);
        let rst = TcpPacket::rst_for(&without_ack);
        assert_eq!(rst.seq_no, 0);
        assert_eq!(rst.ack_no, 401);
        assert!(rst.flags.rst && rst.flags.ack);
    }
}
