//! Cosmetic ICMP: the stack answers echo requests so it is pingable.

use std::sync::Arc;

use tapnet_types::icmp::{IcmpPacket, PROTO_ICMP};
use tapnet_types::ip::Ipv4Packet;
use tapnet_types::{FromBytestream, ToBytestream};

use crate::ipv4::Ipv4;

pub struct Icmp {
    ipv4: Arc<Ipv4>,
}

impl Icmp {
    #[must_use]
    pub fn new(ipv4: Arc<Ipv4>) -> Icmp {
        Icmp { ipv4 }
    }

    pub fn handle(&self, ip: &Ipv4Packet) {
        let pkt = match IcmpPacket::from_slice(&ip.content) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::trace!("dropping icmp packet from {}: {e}", ip.src);
                return;
            }
        };

        if let IcmpPacket::EchoRequest {
            identifier,
            sequence,
            payload,
        } = pkt
        {
            tracing::trace!("icmp: echo request from {} seq={sequence}", ip.src);
            let reply = IcmpPacket::EchoReply {
                identifier,
                sequence,
                payload,
            };
            match reply.to_vec() {
                Ok(bytes) => {
                    if let Err(e) = self.ipv4.send(None, ip.src, PROTO_ICMP, bytes) {
                        tracing::warn!("icmp: echo reply to {} failed: {e}", ip.src);
                    }
                }
                Err(e) => tracing::error!("icmp: failed to encode reply: {e}"),
            }
        }
    }
}
