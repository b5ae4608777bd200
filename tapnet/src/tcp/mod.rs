//! The TCP subsystem: connection tables, segment routing and the
//! blocking socket API on top.
//!
//! Ingress: the link dispatcher hands every TCP-protocol IPv4 packet to
//! [`Tcp::handle`], which validates the checksum, finds the owning
//! connection (established 4-tuple first, then a listener on the local
//! 2-tuple) and runs its state machine. Segments without a home are
//! answered with RST. Egress: state-machine emissions are collected per
//! call and routed after the connection lock is dropped; pure
//! acknowledgments and resets go straight to the IPv4 layer, everything
//! that occupies sequence space goes through the retransmission queue.

pub mod connection;
pub mod reassembly;
pub mod rtx;
pub mod seq;
pub mod socket;

#[cfg(test)]
mod tests;

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Error, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fxhash::FxHashMap;
use tapnet_types::ip::Ipv4Packet;
use tapnet_types::tcp::{self, TcpPacket, PROTO_TCP};
use tapnet_types::{FromBytestream, ToBytestream};

pub use connection::{Connection, PendingAccept, State};
pub use socket::Socket;

use crate::ipv4::Ipv4;
use crate::tcp::rtx::RetransmitQueue;
use crate::tcp::seq::SeqNo;

pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// The 4-tuple identifying a connection, `(address, port)` pairs for
/// both ends. Listeners leave the remote side unspecified.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub local: (Ipv4Addr, u16),
    pub remote: (Ipv4Addr, u16),
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <> {}:{}",
            self.local.0, self.local.1, self.remote.0, self.remote.1
        )
    }
}

impl fmt::Debug for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Collects the segments one state-machine step wants on the wire.
pub struct TcpTx<'a> {
    pub buffer: &'a mut VecDeque<TcpPacket>,
}

impl TcpTx<'_> {
    pub fn send(&mut self, pkt: TcpPacket) {
        self.buffer.push_back(pkt);
    }
}

/// TCP layer tunables.
#[derive(Clone)]
pub struct Config {
    pub mss: u16,
    pub window: u16,
    /// Fixed initial send sequence number; `None` derives one per quad.
    pub iss: Option<u32>,
    pub base_rto: Duration,
    pub syn_timeout: Duration,
    pub backlog_cap: usize,
    pub clock: Clock,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1460,
            window: u16::MAX,
            iss: None,
            base_rto: Duration::from_secs(1),
            syn_timeout: Duration::from_secs(30),
            backlog_cap: 32,
            clock: Arc::new(Instant::now),
        }
    }
}

impl Config {
    /// RFC 9293 S3.4.1: clock-driven initial sequence number selection,
    /// offset by a per-quad hash.
    #[must_use]
    pub fn iss_for(&self, quad: &Quad) -> u32 {
        self.iss.unwrap_or_else(|| {
            let clock = (SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros()
                / 4) as u32;

            let mut hasher = DefaultHasher::new();
            quad.hash(&mut hasher);
            clock.wrapping_add(hasher.finish() as u32)
        })
    }
}

/// A connection shared between the demux tables and its socket.
pub struct TcpHandle {
    pub conn: Mutex<Connection>,
    /// Signaled on every state change and parked SYN.
    pub events: Condvar,
}

impl TcpHandle {
    fn new(conn: Connection) -> Arc<TcpHandle> {
        Arc::new(TcpHandle {
            conn: Mutex::new(conn),
            events: Condvar::new(),
        })
    }

    /// Sleep until the state differs from `current` or the timeout
    /// elapses; returns the state seen last.
    pub fn wait_change(&self, current: State, timeout: Option<Duration>) -> State {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut conn = self.conn.lock().unwrap();
        while conn.state == current {
            match deadline {
                None => conn = self.events.wait(conn).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .events
                        .wait_timeout(conn, deadline - now)
                        .unwrap();
                    conn = guard;
                }
            }
        }
        conn.state
    }
}

struct Tables {
    established: FxHashMap<Quad, Arc<TcpHandle>>,
    listening: FxHashMap<(Ipv4Addr, u16), Arc<TcpHandle>>,
}

pub struct Tcp {
    ipv4: Arc<Ipv4>,
    rtx: Arc<RetransmitQueue>,
    tables: Mutex<Tables>,
    config: Config,
}

impl Tcp {
    #[must_use]
    pub fn new(ipv4: Arc<Ipv4>, config: Config) -> Tcp {
        let rtx = Arc::new(RetransmitQueue::new(config.base_rto, config.clock.clone()));
        Tcp {
            ipv4,
            rtx,
            tables: Mutex::new(Tables {
                established: FxHashMap::default(),
                listening: FxHashMap::default(),
            }),
            config,
        }
    }

    #[must_use]
    pub fn rtx(&self) -> Arc<RetransmitQueue> {
        self.rtx.clone()
    }

    #[must_use]
    pub fn config(&self) -> Config {
        self.config.clone()
    }

    #[must_use]
    pub fn local_addr(&self) -> Ipv4Addr {
        self.ipv4.local_addr()
    }

    /// Ingress entry point for every TCP segment the IPv4 layer accepted.
    pub fn handle(&self, ip: &Ipv4Packet) {
        if !tcp::verify_checksum(ip.src, ip.dest, &ip.content) {
            tracing::trace!("dropping segment with bad checksum from {}", ip.src);
            return;
        }
        let pkt = match TcpPacket::from_slice(&ip.content) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::trace!("dropping malformed segment from {}: {e}", ip.src);
                return;
            }
        };

        tracing::trace!(
            "recv {}:{} -> {}:{} seq={} ack={} win={} len={} [{}]",
            ip.src,
            pkt.src_port,
            ip.dest,
            pkt.dest_port,
            pkt.seq_no,
            pkt.ack_no,
            pkt.window,
            pkt.content.len(),
            pkt.flags,
        );

        let quad = Quad {
            local: (ip.dest, pkt.dest_port),
            remote: (ip.src, pkt.src_port),
        };

        let handle = {
            let tables = self.tables.lock().unwrap();
            if let Some(handle) = tables.established.get(&quad) {
                Some(handle.clone())
            } else if pkt.flags.syn && !pkt.flags.ack && !pkt.flags.rst && !pkt.flags.fin {
                tables.listening.get(&quad.local).cloned()
            } else {
                None
            }
        };

        let Some(handle) = handle else {
            // an orphan: answer with RST unless it is one itself
            if !pkt.flags.rst {
                tracing::debug!("{quad}: no matching connection, sending RST");
                self.send_raw(quad, TcpPacket::rst_for(&pkt));
            }
            return;
        };

        self.dispatch(&handle, quad, pkt);
    }

    fn dispatch(&self, handle: &Arc<TcpHandle>, quad: Quad, pkt: TcpPacket) {
        let mut buffer = VecDeque::new();
        let (state, una) = {
            let mut conn = handle.conn.lock().unwrap();
            if let Err(e) = conn.on_segment(&mut TcpTx { buffer: &mut buffer }, quad, pkt) {
                tracing::error!("{}: segment processing failed: {e}", conn.quad);
                conn.enter_closed();
            }
            (conn.state, conn.snd.una)
        };
        handle.events.notify_all();

        self.rtx.ack(&quad, una);
        if state == State::Closed {
            self.rtx.purge(&quad);
            let mut tables = self.tables.lock().unwrap();
            tables.established.remove(&quad);
        }
        self.flush(quad, buffer);
    }

    /// Route collected segments: pure acknowledgments and resets go
    /// straight out, anything occupying sequence space enters the
    /// retransmission queue (whose immediate deadline is the initial
    /// transmission).
    pub(crate) fn flush(&self, quad: Quad, mut buffer: VecDeque<TcpPacket>) {
        for pkt in buffer.drain(..) {
            let retransmittable =
                !pkt.flags.rst && (!pkt.content.is_empty() || pkt.flags.syn || pkt.flags.fin);
            if retransmittable {
                let seg_end = SeqNo(pkt.seq_no).add(
                    pkt.content.len() as u32
                        + u32::from(pkt.flags.syn)
                        + u32::from(pkt.flags.fin),
                );
                let mut bytes = match pkt.to_vec() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!("{quad}: failed to encode segment: {e}");
                        continue;
                    }
                };
                tcp::apply_checksum(quad.local.0, quad.remote.0, &mut bytes);
                self.rtx.enqueue(quad, seg_end, bytes);
            } else {
                self.send_raw(quad, pkt);
            }
        }
    }

    fn send_raw(&self, quad: Quad, pkt: TcpPacket) {
        let mut bytes = match pkt.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("{quad}: failed to encode segment: {e}");
                return;
            }
        };
        tcp::apply_checksum(quad.local.0, quad.remote.0, &mut bytes);
        if let Err(e) = self.ipv4.send(None, quad.remote.0, PROTO_TCP, bytes) {
            tracing::warn!("{quad}: send failed: {e}");
        }
    }

    /// Register a connection in the table its state selects.
    pub fn add_connection(&self, conn: Connection) -> io::Result<Arc<TcpHandle>> {
        let mut tables = self.tables.lock().unwrap();
        match conn.state {
            State::Closed => Err(Error::new(
                ErrorKind::NotConnected,
                "connection is already closed",
            )),
            State::Listen => {
                let key = conn.quad.local;
                if tables.listening.contains_key(&key) {
                    return Err(Error::new(ErrorKind::AddrInUse, "address already bound"));
                }
                let handle = TcpHandle::new(conn);
                tables.listening.insert(key, handle.clone());
                Ok(handle)
            }
            _ => {
                let key = conn.quad;
                if tables.established.contains_key(&key) {
                    return Err(Error::new(
                        ErrorKind::AddrInUse,
                        "connection already exists",
                    ));
                }
                let handle = TcpHandle::new(conn);
                tables.established.insert(key, handle.clone());
                Ok(handle)
            }
        }
    }

    /// Force a connection into `Closed`, wake everyone waiting on it and
    /// unregister it. The terminal reap of the lifecycle.
    pub fn deinit(&self, handle: &Arc<TcpHandle>) {
        let (quad, state) = {
            let mut conn = handle.conn.lock().unwrap();
            let snapshot = (conn.quad, conn.state);
            conn.enter_closed();
            snapshot
        };
        handle.events.notify_all();
        self.rtx.purge(&quad);

        let mut tables = self.tables.lock().unwrap();
        if state == State::Listen {
            tables.listening.remove(&quad.local);
        } else {
            tables.established.remove(&quad);
        }
    }

    /// Abortive teardown: a reset to the peer, then the reap.
    pub(crate) fn abort(&self, handle: &Arc<TcpHandle>) {
        let (quad, seq, synchronized) = {
            let conn = handle.conn.lock().unwrap();
            (conn.quad, conn.snd.nxt, conn.state.is_synchronized())
        };
        if synchronized {
            let mut rst = TcpPacket::new(quad.local.1, quad.remote.1, seq.0, 0, 0, Vec::new());
            rst.flags = rst.flags.ack(false).rst(true);
            self.send_raw(quad, rst);
        }
        self.deinit(handle);
    }
}
