//! The blocking, socket-shaped user API over a connection handle.

use std::collections::VecDeque;
use std::io::{self, Error, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::tcp::connection::Connection;
use crate::tcp::{Quad, State, Tcp, TcpHandle, TcpTx};

/// One endpoint of the user API. Obtained from the stack, then shaped
/// by either `listen` or `connect`; `accept` mints connected children.
pub struct Socket {
    tcp: Arc<Tcp>,
    handle: Option<Arc<TcpHandle>>,
}

impl Socket {
    pub(crate) fn new(tcp: Arc<Tcp>) -> Socket {
        Socket { tcp, handle: None }
    }

    fn handle(&self) -> io::Result<&Arc<TcpHandle>> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "socket is not connected"))
    }

    /// Bind a listener to `host:port`. `backlog` bounds the SYNs parked
    /// between `accept` calls.
    pub fn listen(&mut self, host: &str, port: u16, backlog: usize) -> io::Result<()> {
        if self.handle.is_some() {
            return Err(Error::new(ErrorKind::AddrInUse, "socket is already in use"));
        }
        let addr = parse_host(host)?;
        let cfg = self.tcp.config();
        let backlog = backlog.clamp(1, cfg.backlog_cap);

        let conn = Connection::listen((addr, port), backlog, cfg);
        self.handle = Some(self.tcp.add_connection(conn)?);
        tracing::info!("listening on {addr}:{port} (backlog {backlog})");
        Ok(())
    }

    /// Block until an incoming connection completes its handshake.
    pub fn accept(&self) -> io::Result<Socket> {
        let handle = self.handle()?;

        let pending = {
            let mut conn = handle.conn.lock().unwrap();
            loop {
                if conn.state != State::Listen {
                    return Err(Error::new(
                        ErrorKind::NotConnected,
                        "socket is not listening",
                    ));
                }
                if let Some(pending) = conn.next_pending() {
                    break pending;
                }
                conn = handle.events.wait(conn).unwrap();
            }
        };

        let cfg = self.tcp.config();
        let mut buffer = VecDeque::new();
        let conn = Connection::accept(&mut TcpTx { buffer: &mut buffer }, &pending, cfg.clone());
        let quad = conn.quad;

        // register before the SYN-ACK leaves, the peer's ack must find us
        let child = self.tcp.add_connection(conn)?;
        self.tcp.flush(quad, buffer);

        match wait_handshake(&child, Instant::now() + cfg.syn_timeout) {
            State::Estab => Ok(Socket {
                tcp: self.tcp.clone(),
                handle: Some(child),
            }),
            state => {
                tracing::debug!("{quad}: accept failed in {state:?}");
                self.tcp.deinit(&child);
                Err(Error::new(ErrorKind::ConnectionAborted, "accept failed"))
            }
        }
    }

    /// Open a connection to `host:port`, blocking until the handshake
    /// completes or the deadline passes.
    pub fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        if self.handle.is_some() {
            return Err(Error::new(ErrorKind::AddrInUse, "socket is already in use"));
        }
        let remote = parse_host(host)?;
        let cfg = self.tcp.config();
        let local_addr = self.tcp.local_addr();

        // an ephemeral port, redrawn while the 4-tuple is taken
        let mut attempts = 0;
        let (handle, quad) = loop {
            let local_port = rand::thread_rng().gen_range(1025..=u16::MAX);
            let quad = Quad {
                local: (local_addr, local_port),
                remote: (remote, port),
            };

            let mut buffer = VecDeque::new();
            let conn = Connection::connect(&mut TcpTx { buffer: &mut buffer }, quad, cfg.clone());
            match self.tcp.add_connection(conn) {
                Ok(handle) => {
                    self.tcp.flush(quad, buffer);
                    break (handle, quad);
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse && attempts < 8 => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        };

        match wait_handshake(&handle, Instant::now() + cfg.syn_timeout) {
            State::Estab => {
                tracing::info!("connected to {remote}:{port} from port {}", quad.local.1);
                self.handle = Some(handle);
                Ok(())
            }
            state => {
                tracing::debug!("{quad}: connect failed in {state:?}");
                self.tcp.deinit(&handle);
                Err(Error::new(
                    ErrorKind::ConnectionRefused,
                    if state == State::Closed {
                        "connection refused"
                    } else {
                        "connect timed out"
                    },
                ))
            }
        }
    }

    /// Blocking read. Returns zero once the peer closed its side.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        loop {
            let (state, reassembly) = {
                let conn = handle.conn.lock().unwrap();
                (conn.state, conn.reassembly.clone())
            };
            return match state {
                State::SynSent | State::SynRcvd => {
                    handle.wait_change(state, None);
                    continue;
                }
                State::Estab | State::FinWait1 | State::FinWait2 => {
                    match reassembly.read(buf) {
                        Err(e) if e.kind() == ErrorKind::InvalidData => {
                            // corrupted reassembly state is unrecoverable
                            tracing::error!("{state:?}: {e}, aborting connection");
                            self.tcp.abort(handle);
                            Err(e)
                        }
                        other => other,
                    }
                }
                // only what is already buffered is still readable
                State::CloseWait => reassembly.try_read(buf),
                State::Listen => Err(Error::new(
                    ErrorKind::NotConnected,
                    "socket is listening, not connected",
                )),
                State::Closing | State::LastAck | State::TimeWait => Err(Error::new(
                    ErrorKind::BrokenPipe,
                    "connection is closing",
                )),
                State::Closed => Err(Error::new(
                    ErrorKind::NotConnected,
                    "connection is closed",
                )),
            };
        }
    }

    /// Queue bytes for transmission. Returns the number of bytes taken,
    /// which the current send window may cut short.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        loop {
            let mut conn = handle.conn.lock().unwrap();
            return match conn.state {
                State::SynSent | State::SynRcvd => {
                    let state = conn.state;
                    drop(conn);
                    handle.wait_change(state, None);
                    continue;
                }
                State::Estab | State::CloseWait => {
                    let mut buffer = VecDeque::new();
                    let n = conn.send_data(&mut TcpTx { buffer: &mut buffer }, buf);
                    let quad = conn.quad;
                    drop(conn);
                    self.tcp.flush(quad, buffer);
                    Ok(n)
                }
                State::Listen => Err(Error::new(
                    ErrorKind::NotConnected,
                    "socket is listening, not connected",
                )),
                State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck
                | State::TimeWait => Err(Error::new(
                    ErrorKind::BrokenPipe,
                    "connection is closing",
                )),
                State::Closed => Err(Error::new(
                    ErrorKind::NotConnected,
                    "connection is closed",
                )),
            };
        }
    }

    /// Close this side of the connection and drive the termination
    /// handshake as far as the peer cooperates.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let timeout = self.tcp.config().syn_timeout;

        let mut buffer = VecDeque::new();
        let (quad, prior) = {
            let mut conn = handle.conn.lock().unwrap();
            let prior = conn.state;
            if !matches!(prior, State::Closed) {
                // ignore "already closing", the wait below covers it
                let _ = conn.close(&mut TcpTx { buffer: &mut buffer });
            }
            (conn.quad, prior)
        };
        handle.events.notify_all();
        self.tcp.flush(quad, buffer);

        match prior {
            State::Closed | State::Listen | State::SynSent => {}
            State::CloseWait | State::LastAck => {
                // passive close: our FIN is out, await its acknowledgment
                handle.wait_change(State::LastAck, Some(timeout));
            }
            _ => {
                // active close: FIN_WAIT1 and onward; TIME_WAIT stands in
                // for the 2-MSL timer and is reaped below
                let deadline = Instant::now() + timeout;
                let mut state = handle.wait_change(State::FinWait1, Some(timeout));
                while !matches!(state, State::TimeWait | State::Closed) {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = handle.wait_change(state, Some(deadline - now));
                }
            }
        }

        self.tcp.deinit(&handle);
        tracing::debug!("{quad}: closed");
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.handle
            .as_ref()
            .map_or(State::Closed, |handle| handle.conn.lock().unwrap().state)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.tcp.deinit(&handle);
        }
    }
}

fn parse_host(host: &str) -> io::Result<Ipv4Addr> {
    host.parse()
        .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("invalid ipv4 address {host}")))
}

/// Wait out the handshake states, bounded by `deadline`.
fn wait_handshake(handle: &Arc<TcpHandle>, deadline: Instant) -> State {
    let mut state = {
        let conn = handle.conn.lock().unwrap();
        conn.state
    };
    while matches!(state, State::SynSent | State::SynRcvd) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        state = handle.wait_change(state, Some(deadline - now));
    }
    state
}
