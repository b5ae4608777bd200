//! Per-connection state: the TCB and the RFC 793 transition machine.
//!
//! A `Connection` is pure bookkeeping. It never blocks and never touches
//! the wire; every reaction pushes the segments it wants transmitted
//! into the [`TcpTx`] handed to it, and the caller routes them onward
//! once the connection lock is released.

use std::collections::VecDeque;
use std::io::{self, Error, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tapnet_types::tcp::{TcpFlags, TcpOption, TcpPacket};

use crate::tcp::reassembly::ReassemblyBuffer;
use crate::tcp::seq::SeqNo;
use crate::tcp::{Config, Quad, TcpTx};

/// The eleven RFC 793 connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            State::Closed | State::Listen | State::SynSent | State::SynRcvd
        )
    }
}

/// State of the send sequence space (RFC 793 S3.2 F4)
///
/// ```text
///            1         2          3          4
///       ----------|----------|----------|----------
///              SND.UNA    SND.NXT    SND.UNA
///                                   +SND.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers of unacknowledged data
/// 3 - sequence numbers allowed for new data transmission
/// 4 - future sequence numbers which are not yet allowed
/// ```
pub struct SendSequenceSpace {
    /// send unacknowledged
    pub una: SeqNo,
    /// send next
    pub nxt: SeqNo,
    /// send window
    pub wnd: u16,
    /// send urgent pointer
    pub up: u16,
    /// segment sequence number used for last window update
    pub wl1: SeqNo,
    /// segment acknowledgment number used for last window update
    pub wl2: SeqNo,
    /// initial send sequence number
    pub iss: SeqNo,
}

/// State of the receive sequence space (RFC 793 S3.2 F5)
///
/// ```text
///                1          2          3
///            ----------|----------|----------
///                   RCV.NXT    RCV.NXT
///                             +RCV.WND
///
/// 1 - old sequence numbers which have been acknowledged
/// 2 - sequence numbers allowed for new reception
/// 3 - future sequence numbers which are not yet allowed
/// ```
pub struct RecvSequenceSpace {
    /// receive next
    pub nxt: SeqNo,
    /// receive window
    pub wnd: u16,
    /// receive urgent pointer
    pub up: u16,
    /// initial receive sequence number
    pub irs: SeqNo,
}

/// A SYN parked on a listening connection until `accept` picks it up.
/// Owns its parsed header including the option list.
pub struct PendingAccept {
    pub quad: Quad,
    pub syn: TcpPacket,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SegmentKind {
    Syn,
    SynAck,
    Ack,
    Fin,
    Rst,
}
use SegmentKind::{Ack, Fin, Rst, Syn, SynAck};

pub struct Connection {
    pub state: State,
    pub quad: Quad,
    pub snd: SendSequenceSpace,
    pub rcv: RecvSequenceSpace,
    /// Negotiated maximum segment size.
    pub mss: u16,
    /// Sequence number of our FIN once one was sent.
    pub fin_at: Option<SeqNo>,
    pub reassembly: Arc<ReassemblyBuffer>,

    /// SYNs parked on a listener.
    pending: VecDeque<PendingAccept>,
    backlog: usize,

    /// Recorded from options, never applied.
    pub wscale: Option<u8>,
    pub sack_permitted: bool,

    pub cfg: Config,
}

impl Connection {
    fn with_state(state: State, quad: Quad, iss: SeqNo, cfg: Config) -> Connection {
        Connection {
            state,
            quad,
            snd: SendSequenceSpace {
                una: iss,
                nxt: iss,
                wnd: cfg.window,
                up: 0,
                wl1: SeqNo(0),
                wl2: SeqNo(0),
                iss,
            },
            rcv: RecvSequenceSpace {
                nxt: SeqNo(0),
                wnd: cfg.window,
                up: 0,
                irs: SeqNo(0),
            },
            mss: cfg.mss,
            fin_at: None,
            reassembly: Arc::new(ReassemblyBuffer::new(SeqNo(0))),
            pending: VecDeque::new(),
            backlog: 0,
            wscale: None,
            sack_permitted: false,
            cfg,
        }
    }

    /// A passive connection waiting for SYNs on `local`.
    #[must_use]
    pub fn listen(local: (Ipv4Addr, u16), backlog: usize, cfg: Config) -> Connection {
        let quad = Quad {
            local,
            remote: (Ipv4Addr::UNSPECIFIED, 0),
        };
        let mut c = Connection::with_state(State::Listen, quad, SeqNo(0), cfg);
        c.backlog = backlog;
        c
    }

    /// Active open: emits the SYN and enters `SynSent`.
    #[must_use]
    pub fn connect(tx: &mut TcpTx, quad: Quad, cfg: Config) -> Connection {
        let iss = SeqNo(cfg.iss_for(&quad));
        let mut c = Connection::with_state(State::SynSent, quad, iss, cfg);
        c.transmit(tx, Syn, iss, &[], false);
        tracing::debug!("{quad}: connecting, iss={iss}");
        c
    }

    /// Passive open from a parked SYN: seeds the receive space from the
    /// peer's header and answers SYN-ACK.
    #[must_use]
    pub fn accept(tx: &mut TcpTx, pending: &PendingAccept, cfg: Config) -> Connection {
        let iss = SeqNo(cfg.iss_for(&pending.quad));
        let mut c = Connection::with_state(State::SynRcvd, pending.quad, iss, cfg);

        let irs = SeqNo(pending.syn.seq_no);
        c.rcv.irs = irs;
        c.rcv.nxt = irs.add(1);
        c.snd.wnd = pending.syn.window;
        c.snd.wl1 = irs;
        c.snd.wl2 = iss;
        c.apply_options(&pending.syn);
        c.reassembly.bump(c.rcv.nxt);

        c.transmit(tx, SynAck, iss, &[], false);
        tracing::debug!("{}: accepting, iss={iss} irs={irs}", pending.quad);
        c
    }

    /// Window we currently advertise.
    fn recv_window(&self) -> u16 {
        (usize::from(self.cfg.window))
            .saturating_sub(self.reassembly.bytes_buffered()) as u16
    }

    /// Build and queue one segment. `seq` names its place in the stream;
    /// `snd.nxt` advances over newly reserved bytes, one phantom byte
    /// for a payload-free SYN or FIN included.
    pub(crate) fn transmit(
        &mut self,
        tx: &mut TcpTx,
        kind: SegmentKind,
        seq: SeqNo,
        payload: &[u8],
        psh: bool,
    ) {
        let flags = TcpFlags::new()
            .syn(matches!(kind, Syn | SynAck))
            .ack(matches!(kind, SynAck | Ack | Fin))
            .fin(matches!(kind, Fin))
            .rst(matches!(kind, Rst))
            .psh(psh);

        let window = self.recv_window();
        self.rcv.wnd = window;

        let pkt = TcpPacket {
            src_port: self.quad.local.1,
            dest_port: self.quad.remote.1,
            seq_no: seq.0,
            ack_no: if flags.ack { self.rcv.nxt.0 } else { 0 },
            flags,
            window,
            urgent_ptr: 0,
            options: if flags.syn {
                vec![TcpOption::MaximumSegmentSize(self.mss)]
            } else {
                Vec::new()
            },
            content: payload.to_vec(),
        };

        let mut end = seq.add(payload.len() as u32);
        if (flags.syn || flags.fin) && payload.is_empty() {
            end = end.add(1);
        }
        if !flags.rst && self.snd.nxt < end {
            self.snd.nxt = end;
        }

        tracing::trace!(
            "{}: send seq={} ack={} win={} len={} [{}]",
            self.quad,
            pkt.seq_no,
            pkt.ack_no,
            pkt.window,
            payload.len(),
            pkt.flags,
        );
        tx.send(pkt);
    }

    /// React to one incoming segment. `quad` is the segment's own
    /// 4-tuple; it differs from `self.quad` only on listeners.
    pub fn on_segment(&mut self, tx: &mut TcpTx, quad: Quad, pkt: TcpPacket) -> io::Result<()> {
        match self.state {
            State::Closed => Ok(()),
            State::Listen => self.on_segment_listen(tx, quad, pkt),
            State::SynSent => self.on_segment_syn_sent(tx, pkt),
            _ => self.on_segment_synchronized(tx, pkt),
        }
    }

    fn on_segment_listen(&mut self, tx: &mut TcpTx, quad: Quad, pkt: TcpPacket) -> io::Result<()> {
        if pkt.flags.rst || pkt.flags.fin {
            return Ok(());
        }
        if pkt.flags.ack {
            // nothing here could have been acknowledged
            tx.send(TcpPacket::rst_for(&pkt));
            return Ok(());
        }
        if pkt.flags.syn {
            if self.pending.len() >= self.backlog {
                tracing::debug!("{quad}: backlog full, dropping SYN");
                return Ok(());
            }
            tracing::debug!("{quad}: parking incoming connection");
            self.pending.push_back(PendingAccept { quad, syn: pkt });
        }
        Ok(())
    }

    fn on_segment_syn_sent(&mut self, tx: &mut TcpTx, pkt: TcpPacket) -> io::Result<()> {
        if pkt.flags.ack {
            let ack = SeqNo(pkt.ack_no);
            // the only thing in flight is our SYN
            if !(self.snd.iss < ack && ack <= self.snd.nxt) {
                if !pkt.flags.rst {
                    self.transmit(tx, Rst, ack, &[], false);
                }
                return Ok(());
            }
            if pkt.flags.rst {
                tracing::debug!("{}: connection refused", self.quad);
                self.enter_closed();
                return Ok(());
            }
            if pkt.flags.syn {
                self.rcv.irs = SeqNo(pkt.seq_no);
                self.rcv.nxt = self.rcv.irs.add(1);
                self.snd.una = ack;
                self.snd.wnd = pkt.window;
                self.snd.wl1 = self.rcv.irs;
                self.snd.wl2 = ack;
                self.apply_options(&pkt);
                self.reassembly.bump(self.rcv.nxt);

                self.state = State::Estab;
                tracing::debug!("{}: established (active open)", self.quad);
                self.transmit(tx, Ack, self.snd.nxt, &[], false);
            }
            return Ok(());
        }
        if pkt.flags.rst {
            // a reset that acknowledges nothing cannot be validated
            return Ok(());
        }
        if pkt.flags.syn {
            // simultaneous open: acknowledge the peer's SYN alongside ours
            self.rcv.irs = SeqNo(pkt.seq_no);
            self.rcv.nxt = self.rcv.irs.add(1);
            self.snd.wnd = pkt.window;
            self.snd.wl1 = self.rcv.irs;
            self.snd.wl2 = self.snd.una;
            self.apply_options(&pkt);
            self.reassembly.bump(self.rcv.nxt);

            self.state = State::SynRcvd;
            tracing::debug!("{}: simultaneous open", self.quad);
            self.transmit(tx, SynAck, self.snd.iss, &[], false);
        }
        Ok(())
    }

    fn on_segment_synchronized(&mut self, tx: &mut TcpTx, mut pkt: TcpPacket) -> io::Result<()> {
        let seq = SeqNo(pkt.seq_no);
        let payload_len = pkt.content.len() as u32;
        let seg_len = payload_len + u32::from(pkt.flags.syn) + u32::from(pkt.flags.fin);

        // a repeated SYN for this very connection means our SYN-ACK was
        // lost; its sequence number sits left of the window, so answer
        // before the acceptability test discards it
        if pkt.flags.syn && !pkt.flags.ack && !pkt.flags.rst {
            if self.state == State::SynRcvd && seq == self.rcv.irs {
                self.transmit(tx, SynAck, self.snd.iss, &[], false);
            }
            return Ok(());
        }

        // the SYN-ACK of a crossed open repeats the peer's SYN, so its
        // sequence number sits one left of the window
        let crossed_syn_ack = self.state == State::SynRcvd
            && pkt.flags.syn
            && pkt.flags.ack
            && seq == self.rcv.irs;

        if !crossed_syn_ack && !self.segment_acceptable(seq, seg_len) {
            if !pkt.flags.rst {
                tracing::trace!(
                    "{}: unacceptable segment seq={seq} len={seg_len}, re-acking",
                    self.quad
                );
                self.transmit(tx, Ack, self.snd.nxt, &[], false);
            }
            return Ok(());
        }

        if pkt.flags.rst {
            tracing::debug!("{}: reset by peer", self.quad);
            self.enter_closed();
            return Ok(());
        }

        if !pkt.flags.ack {
            return Ok(());
        }
        let ack = SeqNo(pkt.ack_no);

        if self.state == State::SynRcvd {
            if self.snd.una < ack && ack <= self.snd.nxt {
                self.snd.una = ack;
                self.snd.wnd = pkt.window;
                self.snd.wl1 = seq;
                self.snd.wl2 = ack;
                self.state = State::Estab;
                tracing::debug!("{}: established (passive open)", self.quad);
            } else {
                // RFC 793: <SEQ=SEG.ACK><CTL=RST>
                self.transmit(tx, Rst, ack, &[], false);
                return Ok(());
            }
        } else {
            if self.snd.una < ack && ack <= self.snd.nxt {
                self.snd.una = ack;
            }
            // window update, unless the segment is older than the last one
            // that updated it
            if self.snd.wl1 < seq || (self.snd.wl1 == seq && self.snd.wl2 <= ack) {
                self.snd.wnd = pkt.window;
                self.snd.wl1 = seq;
                self.snd.wl2 = ack;
            }
        }

        // does this acknowledge our FIN?
        if let Some(fin_at) = self.fin_at {
            if self.snd.una == fin_at.add(1) {
                let next = match self.state {
                    State::FinWait1 => State::FinWait2,
                    State::Closing => State::TimeWait,
                    State::LastAck => State::Closed,
                    state => state,
                };
                if next != self.state {
                    tracing::debug!("{}: fin acked ({:?} -> {:?})", self.quad, self.state, next);
                    if next == State::Closed {
                        self.enter_closed();
                        return Ok(());
                    }
                    self.state = next;
                }
            }
        }

        if pkt.flags.urg {
            self.rcv.up = pkt.urgent_ptr;
        }

        if !pkt.content.is_empty()
            && matches!(self.state, State::Estab | State::FinWait1 | State::FinWait2)
        {
            let content = std::mem::take(&mut pkt.content);
            self.reassembly.insert(seq, content, pkt.flags.psh);
            // acknowledge the gap-free prefix, never into a gap
            self.rcv.nxt = self.rcv.nxt.max(self.reassembly.contiguous_end());
            self.transmit(tx, Ack, self.snd.nxt, &[], false);
        }

        if pkt.flags.fin {
            self.on_fin(tx, seq.add(payload_len).add(u32::from(pkt.flags.syn)));
        }
        Ok(())
    }

    fn on_fin(&mut self, tx: &mut TcpTx, fin_seq: SeqNo) {
        if fin_seq == self.rcv.nxt {
            // in order: the FIN consumes one sequence number and ends the
            // stream for readers
            self.rcv.nxt = self.rcv.nxt.add(1);
            self.reassembly.insert(fin_seq, Vec::new(), true);
            self.transmit(tx, Ack, self.snd.nxt, &[], false);

            let next = match self.state {
                State::Estab => State::CloseWait,
                State::FinWait1 => State::Closing,
                State::FinWait2 => State::TimeWait,
                state => state,
            };
            if next != self.state {
                tracing::debug!("{}: peer closed ({:?} -> {:?})", self.quad, self.state, next);
                self.state = next;
            }
        } else if fin_seq < self.rcv.nxt {
            // a retransmitted FIN, its ack must have been lost
            self.transmit(tx, Ack, self.snd.nxt, &[], false);
        } else {
            // FIN beyond a gap; the missing bytes will come again with it
            self.transmit(tx, Ack, self.snd.nxt, &[], false);
        }
    }

    /// RFC 793 S3.3 segment acceptability. `len` counts the phantom
    /// bytes of SYN and FIN.
    fn segment_acceptable(&self, seq: SeqNo, len: u32) -> bool {
        let wnd = u32::from(self.rcv.wnd);
        let nxt = self.rcv.nxt;
        match (wnd == 0, len == 0) {
            (true, true) => seq == nxt,
            (false, true) => seq.in_window(nxt, wnd),
            (false, false) => {
                seq.in_window(nxt, wnd) || seq.add(len - 1).in_window(nxt, wnd)
            }
            (true, false) => false,
        }
    }

    fn apply_options(&mut self, pkt: &TcpPacket) {
        if let Some(mss) = pkt.mss_option() {
            if mss < self.mss {
                tracing::debug!("{}: negotiated mss {} -> {mss}", self.quad, self.mss);
                self.mss = mss;
            }
        }
        for opt in &pkt.options {
            match opt {
                TcpOption::WindowScaling(shift) => self.wscale = Some(*shift),
                TcpOption::SackPermitted => self.sack_permitted = true,
                _ => {}
            }
        }
    }

    /// Queue up to `buf.len()` bytes in MSS-sized segments, bounded by
    /// the usable send window. The final segment is pushed. Returns the
    /// number of bytes queued.
    pub fn send_data(&mut self, tx: &mut TcpTx, buf: &[u8]) -> usize {
        let in_flight = self.snd.nxt.since(self.snd.una);
        let usable = u32::from(self.snd.wnd).saturating_sub(in_flight) as usize;
        let n = buf.len().min(usable);

        let mut offset = 0;
        while offset < n {
            let take = (n - offset).min(usize::from(self.mss));
            let last = offset + take == n;
            let seq = self.snd.nxt;
            self.transmit(tx, Ack, seq, &buf[offset..offset + take], last);
            offset += take;
        }
        n
    }

    /// User-side close. Emits a FIN where the state machine calls for
    /// one; the caller awaits the resulting transitions.
    pub fn close(&mut self, tx: &mut TcpTx) -> io::Result<()> {
        match self.state {
            State::Listen | State::SynSent => {
                self.enter_closed();
                Ok(())
            }
            State::SynRcvd | State::Estab => {
                let fin_seq = self.snd.nxt;
                self.transmit(tx, Fin, fin_seq, &[], false);
                self.fin_at = Some(fin_seq);
                self.state = State::FinWait1;
                tracing::debug!("{}: closing (FIN_WAIT1)", self.quad);
                Ok(())
            }
            State::CloseWait => {
                let fin_seq = self.snd.nxt;
                self.transmit(tx, Fin, fin_seq, &[], false);
                self.fin_at = Some(fin_seq);
                self.state = State::LastAck;
                tracing::debug!("{}: closing (LAST_ACK)", self.quad);
                Ok(())
            }
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => Err(Error::new(
                ErrorKind::BrokenPipe,
                "connection is already closing",
            )),
            State::Closed => Err(Error::new(ErrorKind::NotConnected, "connection is closed")),
        }
    }

    /// One parked SYN, if any.
    pub fn next_pending(&mut self) -> Option<PendingAccept> {
        self.pending.pop_front()
    }

    /// Terminal transition. Wakes blocked readers and frees parked SYNs;
    /// the owner unregisters the connection and purges its queue entries.
    pub(crate) fn enter_closed(&mut self) {
        self.state = State::Closed;
        self.reassembly.close();
        self.pending.clear();
    }
}
