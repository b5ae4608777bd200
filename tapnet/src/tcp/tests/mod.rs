//! Connection-level tests: the bare state machine driven against an
//! in-memory segment queue, no device and no threads involved.

mod handshake;

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;

use tapnet_types::tcp::TcpPacket;

use crate::tcp::connection::{Connection, PendingAccept};
use crate::tcp::seq::SeqNo;
use crate::tcp::{Config, Quad, State, TcpTx};

pub(crate) const WIN_4KB: u16 = 4096;

/// Endpoints used across the suite, our side and the peer's.
pub(crate) fn local() -> (Ipv4Addr, u16) {
    (Ipv4Addr::new(10, 0, 0, 4), 5501)
}

pub(crate) fn remote() -> (Ipv4Addr, u16) {
    (Ipv4Addr::new(10, 0, 0, 1), 1808)
}

/// One endpoint under test: a connection and the segments it wants to
/// send. Incoming segments run the invariant checks of the sequence
/// spaces on every step.
pub(crate) struct TcpTestUnit {
    pub tx: VecDeque<TcpPacket>,
    pub quad: Quad,
    pub con: Option<Connection>,
    pub cfg: Config,
    last_rcv_nxt: SeqNo,
}

impl TcpTestUnit {
    pub fn new(local: (Ipv4Addr, u16), remote: (Ipv4Addr, u16)) -> Self {
        Self {
            tx: VecDeque::new(),
            quad: Quad { local, remote },
            con: None,
            cfg: Config {
                window: WIN_4KB,
                iss: Some(0),
                ..Config::default()
            },
            last_rcv_nxt: SeqNo(0),
        }
    }

    pub fn con(&self) -> &Connection {
        self.con.as_ref().expect("no connection")
    }

    pub fn connect(&mut self) {
        assert!(self.con.is_none());
        self.con = Some(Connection::connect(
            &mut TcpTx {
                buffer: &mut self.tx,
            },
            self.quad,
            self.cfg.clone(),
        ));
    }

    pub fn listen(&mut self, backlog: usize) {
        assert!(self.con.is_none());
        self.con = Some(Connection::listen(
            self.quad.local,
            backlog,
            self.cfg.clone(),
        ));
    }

    /// Create the connection directly from a SYN, as `accept` would
    /// after popping it off a listener.
    pub fn accept_syn(&mut self, syn: TcpPacket) {
        assert!(self.con.is_none());
        let pending = PendingAccept {
            quad: self.quad,
            syn,
        };
        self.con = Some(Connection::accept(
            &mut TcpTx {
                buffer: &mut self.tx,
            },
            &pending,
            self.cfg.clone(),
        ));
        self.last_rcv_nxt = self.con().rcv.nxt;
    }

    /// Promote the next parked SYN of a listener into the connection
    /// under test.
    pub fn accept_pending(&mut self) {
        let pending = self
            .con
            .as_mut()
            .expect("no connection")
            .next_pending()
            .expect("no pending connection");
        self.con = Some(Connection::accept(
            &mut TcpTx {
                buffer: &mut self.tx,
            },
            &pending,
            self.cfg.clone(),
        ));
        self.last_rcv_nxt = self.con().rcv.nxt;
    }

    pub fn incoming(&mut self, pkt: TcpPacket) -> io::Result<()> {
        let quad = self.quad;
        let con = self.con.as_mut().expect("no connection");
        con.on_segment(
            &mut TcpTx {
                buffer: &mut self.tx,
            },
            quad,
            pkt,
        )?;

        // sequence space invariants hold after every step
        assert!(con.snd.una <= con.snd.nxt, "snd.una ran past snd.nxt");
        assert!(
            self.last_rcv_nxt <= con.rcv.nxt,
            "rcv.nxt moved backwards"
        );
        self.last_rcv_nxt = con.rcv.nxt;
        Ok(())
    }

    /// Passive establishment: SYN in, SYN-ACK out, ACK in.
    pub fn handshake(&mut self, peer_iss: u32, peer_win: u16) -> io::Result<()> {
        let r_port = self.quad.remote.1;
        let l_port = self.quad.local.1;

        self.accept_syn(TcpPacket::syn(r_port, l_port, peer_iss, peer_win));
        self.tx.clear();
        self.incoming(TcpPacket::new(
            r_port,
            l_port,
            peer_iss.wrapping_add(1),
            1,
            peer_win,
            Vec::new(),
        ))
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        let con = self.con.as_mut().expect("no connection");
        con.send_data(
            &mut TcpTx {
                buffer: &mut self.tx,
            },
            data,
        )
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.con().reassembly.try_read(buf)
    }

    pub fn close(&mut self) -> io::Result<()> {
        let con = self.con.as_mut().expect("no connection");
        con.close(&mut TcpTx {
            buffer: &mut self.tx,
        })
    }

    pub fn state(&self) -> State {
        self.con().state
    }

    pub fn assert_outgoing_eq(&mut self, expected: &[TcpPacket]) {
        let got: Vec<_> = self.tx.drain(..).collect();
        assert_eq!(got, expected);
    }

    /// Forward `n` queued segments to a peer unit.
    pub fn pipe(&mut self, peer: &mut Self, n: usize) -> io::Result<()> {
        let segments: Vec<_> = self.tx.drain(..n).collect();
        for pkt in segments {
            peer.incoming(pkt)?;
        }
        Ok(())
    }
}

/// Mark a packet pushed, as the last segment of every write is.
pub(crate) fn psh(mut pkt: TcpPacket) -> TcpPacket {
    pkt.flags = pkt.flags.psh(true);
    pkt
}
