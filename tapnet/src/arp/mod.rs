//! Address resolution for the attached LAN.
//!
//! One table maps IPv4 neighbors to their hardware addresses. Lookups
//! block the calling thread: a miss broadcasts a request and waits on
//! the table until the reply lands or the retries run out. The ingress
//! thread feeds the table from every ARP packet it sees and answers
//! requests for the interface address.

use std::io::{self, Error, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use fxhash::FxHashMap;
use tapnet_types::arp::{ArpOperation, ArpPacket};
use tapnet_types::iface::{EthernetFrame, MacAddress, KIND_ARP};
use tapnet_types::{FromBytestream, ToBytestream};

use crate::iface::Iface;

const RESOLVE_ATTEMPTS: usize = 3;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Arp {
    iface: Arc<Iface>,
    table: Mutex<FxHashMap<Ipv4Addr, MacAddress>>,
    resolved: Condvar,
}

impl Arp {
    #[must_use]
    pub fn new(iface: Arc<Iface>) -> Arp {
        Arp {
            iface,
            table: Mutex::new(FxHashMap::default()),
            resolved: Condvar::new(),
        }
    }

    /// Gratuitous announcement so neighbors learn us without a
    /// round-trip.
    pub fn announce(&self) -> io::Result<()> {
        let addr = self.iface.addr();
        let request = ArpPacket::request(self.iface.mac(), addr, addr);
        self.iface
            .send_frame(MacAddress::BROADCAST, KIND_ARP, request.to_vec()?)
    }

    /// Blocking lookup of the hardware address owning `addr`.
    pub fn resolve(&self, addr: Ipv4Addr) -> io::Result<MacAddress> {
        if addr == self.iface.addr() {
            return Ok(self.iface.mac());
        }
        if addr.is_broadcast() {
            return Ok(MacAddress::BROADCAST);
        }

        let mut table = self.table.lock().unwrap();
        for attempt in 0..RESOLVE_ATTEMPTS {
            if let Some(mac) = table.get(&addr) {
                return Ok(*mac);
            }

            drop(table);
            if attempt > 0 {
                tracing::debug!("arp: retrying lookup for {addr} ({attempt})");
            }
            self.request(addr)?;
            table = self.table.lock().unwrap();

            let (guard, _) = self
                .resolved
                .wait_timeout_while(table, RESOLVE_TIMEOUT, |t| !t.contains_key(&addr))
                .unwrap();
            table = guard;
        }

        if let Some(mac) = table.get(&addr) {
            return Ok(*mac);
        }
        tracing::warn!("arp: no reply for {addr}, dropping");
        Err(Error::new(
            ErrorKind::HostUnreachable,
            format!("no arp reply from {addr}"),
        ))
    }

    /// Ingress handler for every ARP frame on the link.
    pub fn handle(&self, frame: &EthernetFrame) {
        let pkt = match ArpPacket::from_slice(&frame.content) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::trace!("dropping arp frame: {e}");
                return;
            }
        };

        // any sighting of a sender teaches us its mapping
        if !pkt.src_ip.is_unspecified() && !pkt.src_mac.is_unspecified() {
            let mut table = self.table.lock().unwrap();
            let known = table.insert(pkt.src_ip, pkt.src_mac);
            if known != Some(pkt.src_mac) {
                tracing::debug!("arp: learned {} is {}", pkt.src_ip, pkt.src_mac);
                self.resolved.notify_all();
            }
        }

        match pkt.operation {
            ArpOperation::Request => {
                if pkt.dest_ip == self.iface.addr() {
                    tracing::trace!(
                        "arp: answering request for {} from {}",
                        pkt.dest_ip,
                        pkt.src_ip
                    );
                    let reply = pkt.into_reply(self.iface.mac());
                    match reply.to_vec() {
                        Ok(bytes) => {
                            if let Err(e) =
                                self.iface.send_frame(pkt.src_mac, KIND_ARP, bytes)
                            {
                                tracing::warn!("arp: reply failed: {e}");
                            }
                        }
                        Err(e) => tracing::error!("arp: failed to encode reply: {e}"),
                    }
                }
            }
            ArpOperation::Reply => {
                tracing::trace!("arp: reply {} is {}", pkt.src_ip, pkt.src_mac);
            }
        }
    }

    fn request(&self, addr: Ipv4Addr) -> io::Result<()> {
        let request = ArpPacket::request(self.iface.mac(), self.iface.addr(), addr);
        self.iface
            .send_frame(MacAddress::BROADCAST, KIND_ARP, request.to_vec()?)
    }
}
