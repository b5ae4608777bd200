//! The IPv4 layer: header framing, checksum gate and LAN-local routing.

use std::io::{self, Error, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tapnet_types::iface::KIND_IPV4;
use tapnet_types::ip::{Ipv4Flags, Ipv4Packet};
use tapnet_types::{FromBytestream, ToBytestream};

use crate::arp::Arp;
use crate::iface::Iface;

pub struct Ipv4 {
    iface: Arc<Iface>,
    arp: Arc<Arp>,
    ident: AtomicU16,
}

impl Ipv4 {
    #[must_use]
    pub fn new(iface: Arc<Iface>, arp: Arc<Arp>) -> Ipv4 {
        Ipv4 {
            iface,
            arp,
            ident: AtomicU16::new(0),
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> Ipv4Addr {
        self.iface.addr()
    }

    /// Decode an incoming frame payload. `None` means the packet is
    /// malformed, fragmented or not addressed to us.
    pub fn decode(&self, bytes: &[u8]) -> Option<Ipv4Packet> {
        let pkt = match Ipv4Packet::from_slice(bytes) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::trace!("dropping ipv4 packet: {e}");
                return None;
            }
        };
        if pkt.fragment_offset != 0 || pkt.flags.mf {
            tracing::trace!("dropping fragmented ipv4 packet from {}", pkt.src);
            return None;
        }
        if pkt.dest != self.iface.addr() && !pkt.dest.is_broadcast() {
            return None;
        }
        Some(pkt)
    }

    /// Wrap `content` in a header and deliver it to `dest`, which must
    /// live on the attached LAN. The source defaults to the interface
    /// address.
    pub fn send(
        &self,
        src: Option<Ipv4Addr>,
        dest: Ipv4Addr,
        proto: u8,
        content: Vec<u8>,
    ) -> io::Result<()> {
        if !self.iface.is_local(dest) {
            return Err(Error::new(
                ErrorKind::NetworkUnreachable,
                format!("no route to {dest}"),
            ));
        }

        let pkt = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: self.ident.fetch_add(1, Ordering::Relaxed),
            flags: Ipv4Flags {
                df: true,
                mf: false,
            },
            fragment_offset: 0,
            ttl: 64,
            proto,
            src: src.unwrap_or_else(|| self.iface.addr()),
            dest,
            content,
        };

        let mac = self.arp.resolve(dest)?;
        self.iface.send_frame(mac, KIND_IPV4, pkt.to_vec()?)
    }
}
