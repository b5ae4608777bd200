//! A user-space TCP/IPv4 stack attached to a TAP device.
//!
//! [`Stack::open`] brings the interface up and spawns the two service
//! threads: the link ingress dispatcher, which owns the device read
//! loop, and the TCP transmitter, which drains the retransmission
//! queue. Application threads talk to the stack through blocking
//! [`Socket`]s.

pub mod arp;
pub mod icmp;
pub mod iface;
pub mod ipv4;
pub mod tcp;

pub use tapnet_types as types;

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use crate::arp::Arp;
use crate::icmp::Icmp;
use crate::iface::{Iface, TapDevice};
use crate::ipv4::Ipv4;
use crate::tcp::{Config, Socket, Tcp};
use crate::types::iface::{EthernetFrame, KIND_ARP, KIND_IPV4};
use crate::types::icmp::PROTO_ICMP;
use crate::types::tcp::PROTO_TCP;
use crate::types::FromBytestream;

/// Upper bound for one link frame; TAP MTUs stay well below this.
const FRAME_BUFFER: usize = 4096;

/// A running stack instance bound to one TAP interface.
pub struct Stack {
    pub arp: Arc<Arp>,
    pub ipv4: Arc<Ipv4>,
    pub tcp: Arc<Tcp>,
}

impl Stack {
    /// Attach to the TAP interface `ifname` with the given address.
    pub fn open(ifname: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> io::Result<Stack> {
        Stack::open_with(ifname, addr, mask, Config::default())
    }

    pub fn open_with(
        ifname: &str,
        addr: Ipv4Addr,
        mask: Ipv4Addr,
        config: Config,
    ) -> io::Result<Stack> {
        let device = TapDevice::open(ifname)?;
        let iface = Arc::new(Iface::new(device, addr, mask));

        let arp = Arc::new(Arp::new(iface.clone()));
        let ipv4 = Arc::new(Ipv4::new(iface.clone(), arp.clone()));
        let icmp = Arc::new(Icmp::new(ipv4.clone()));
        let tcp = Arc::new(Tcp::new(ipv4.clone(), config));

        arp.announce()?;

        // both run for the process lifetime, no join needed
        let _ = tcp::rtx::spawn_transmitter(tcp.rtx(), ipv4.clone());
        let _ = spawn_ingress(iface, arp.clone(), ipv4.clone(), icmp, tcp.clone());

        Ok(Stack { arp, ipv4, tcp })
    }

    /// A fresh socket, to be shaped by `listen` or `connect`.
    #[must_use]
    pub fn socket(&self) -> Socket {
        Socket::new(self.tcp.clone())
    }

    /// Stop the transmitter; the ingress thread follows once the device
    /// closes.
    pub fn shutdown(&self) {
        self.tcp.rtx().close();
    }
}

/// The link ingress dispatcher: reads whole frames off the device and
/// routes them by ethertype; the protocol set is closed.
fn spawn_ingress(
    iface: Arc<Iface>,
    arp: Arc<Arp>,
    ipv4: Arc<Ipv4>,
    icmp: Arc<Icmp>,
    tcp: Arc<Tcp>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("link-rx".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; FRAME_BUFFER];
            loop {
                let n = match iface.device().recv(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!("link read failed: {e}, ingress exits");
                        return;
                    }
                };
                let frame = match EthernetFrame::from_slice(&buf[..n]) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::trace!("dropping frame: {e}");
                        continue;
                    }
                };

                match frame.kind {
                    KIND_ARP => arp.handle(&frame),
                    KIND_IPV4 => {
                        let Some(pkt) = ipv4.decode(&frame.content) else {
                            continue;
                        };
                        match pkt.proto {
                            PROTO_TCP => tcp.handle(&pkt),
                            PROTO_ICMP => icmp.handle(&pkt),
                            proto => {
                                tracing::trace!(
                                    "dropping ip packet with unhandled protocol {proto}"
                                );
                            }
                        }
                    }
                    kind => tracing::trace!("dropping frame with ethertype {kind:#06x}"),
                }
            }
        })
        .expect("failed to spawn link ingress thread")
}
