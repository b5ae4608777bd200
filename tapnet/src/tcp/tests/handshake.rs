use std::io;

use tapnet_types::tcp::TcpPacket;

use super::{local, remote, TcpTestUnit, WIN_4KB};
use crate::tcp::State;

#[test]
fn passive_accept() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    test.listen(8);

    // SYN is parked on the listener, nothing goes out yet
    test.incoming(TcpPacket::syn(1808, 5501, 100, WIN_4KB))?;
    test.assert_outgoing_eq(&[]);
    assert_eq!(test.state(), State::Listen);

    // accept answers SYN-ACK with our MSS
    test.accept_pending();
    assert_eq!(test.state(), State::SynRcvd);
    let syn = TcpPacket::syn(1808, 5501, 100, WIN_4KB);
    test.assert_outgoing_eq(&[TcpPacket::syn_ack(&syn, 0, WIN_4KB).with_mss(1460)]);

    // the final ACK establishes
    test.incoming(TcpPacket::new(1808, 5501, 101, 1, WIN_4KB, Vec::new()))?;
    test.assert_outgoing_eq(&[]);
    assert_eq!(test.state(), State::Estab);
    Ok(())
}

#[test]
fn connect() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());

    // -> SYN
    test.connect();
    assert_eq!(test.state(), State::SynSent);
    test.assert_outgoing_eq(&[TcpPacket::syn(5501, 1808, 0, WIN_4KB).with_mss(1460)]);

    // <- SYN ACK
    // -> ACK
    let mut syn_ack = TcpPacket::syn_ack(&TcpPacket::syn(5501, 1808, 0, WIN_4KB), 4000, WIN_4KB);
    syn_ack.ack_no = 1;
    test.incoming(syn_ack)?;
    test.assert_outgoing_eq(&[TcpPacket::new(5501, 1808, 1, 4001, WIN_4KB, Vec::new())]);
    assert_eq!(test.state(), State::Estab);
    assert_eq!(test.con().snd.una, 1.into());
    Ok(())
}

#[test]
fn connect_negotiates_mss() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    test.connect();
    test.tx.clear();

    let mut syn_ack = TcpPacket::syn_ack(&TcpPacket::syn(5501, 1808, 0, WIN_4KB), 4000, WIN_4KB)
        .with_mss(400);
    syn_ack.ack_no = 1;
    test.incoming(syn_ack)?;
    assert_eq!(test.con().mss, 400);

    // a larger peer MSS never raises ours
    let mut other = TcpTestUnit::new(local(), remote());
    other.connect();
    other.tx.clear();
    let mut syn_ack = TcpPacket::syn_ack(&TcpPacket::syn(5501, 1808, 0, WIN_4KB), 4000, WIN_4KB)
        .with_mss(9000);
    syn_ack.ack_no = 1;
    other.incoming(syn_ack)?;
    assert_eq!(other.con().mss, 1460);
    Ok(())
}

#[test]
fn simultaneous_open() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    test.connect();
    test.tx.clear();

    // a SYN instead of a SYN-ACK: both sides opened at once
    test.incoming(TcpPacket::syn(1808, 5501, 4000, WIN_4KB))?;
    assert_eq!(test.state(), State::SynRcvd);
    let syn = TcpPacket::syn(1808, 5501, 4000, WIN_4KB);
    test.assert_outgoing_eq(&[TcpPacket::syn_ack(&syn, 0, WIN_4KB).with_mss(1460)]);

    test.incoming(TcpPacket::new(1808, 5501, 4001, 1, WIN_4KB, Vec::new()))?;
    assert_eq!(test.state(), State::Estab);
    Ok(())
}

#[test]
fn e2e_simultaneous_open() -> io::Result<()> {
    let mut client = TcpTestUnit::new(remote(), local());
    let mut server = TcpTestUnit::new(local(), remote());
    client.cfg.iss = Some(2000);
    server.cfg.iss = Some(8000);

    client.connect();
    server.connect();

    // SYNs cross
    client.pipe(&mut server, 1)?;
    server.pipe(&mut client, 1)?;
    assert_eq!(client.state(), State::SynRcvd);
    assert_eq!(server.state(), State::SynRcvd);

    // SYN-ACKs cross; no further ACK is owed
    client.pipe(&mut server, 1)?;
    server.pipe(&mut client, 1)?;
    assert_eq!(client.state(), State::Estab);
    assert_eq!(server.state(), State::Estab);
    client.assert_outgoing_eq(&[]);
    server.assert_outgoing_eq(&[]);
    Ok(())
}

#[test]
fn dup_syn_repeats_syn_ack() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    let syn = TcpPacket::syn(1808, 5501, 4000, WIN_4KB);

    // -> SYN, <- SYN ACK (lost on the way)
    test.accept_syn(syn.clone());
    test.assert_outgoing_eq(&[TcpPacket::syn_ack(&syn, 0, WIN_4KB).with_mss(1460)]);

    // -> SYN (resend), <- SYN ACK again
    test.incoming(syn.clone())?;
    test.assert_outgoing_eq(&[TcpPacket::syn_ack(&syn, 0, WIN_4KB).with_mss(1460)]);

    test.incoming(TcpPacket::new(1808, 5501, 4001, 1, WIN_4KB, Vec::new()))?;
    assert_eq!(test.state(), State::Estab);
    Ok(())
}

#[test]
fn listener_parks_up_to_backlog() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    test.listen(2);

    for port in [1808, 1809, 1810] {
        test.incoming(TcpPacket::syn(port, 5501, 100, WIN_4KB))?;
    }
    test.assert_outgoing_eq(&[]);

    // the third SYN fell off the backlog
    let con = test.con.as_mut().unwrap();
    assert_eq!(con.next_pending().unwrap().syn.src_port, 1808);
    assert_eq!(con.next_pending().unwrap().syn.src_port, 1809);
    assert!(con.next_pending().is_none());
    Ok(())
}

#[test]
fn listener_answers_stray_ack_with_rst() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    test.listen(8);

    let stray = TcpPacket::new(1808, 5501, 400, 900, WIN_4KB, Vec::new());
    test.incoming(stray.clone())?;
    test.assert_outgoing_eq(&[TcpPacket::rst_for(&stray)]);
    assert_eq!(test.state(), State::Listen);
    Ok(())
}

#[test]
fn listener_drops_fin_and_rst() -> io::Result<()> {
    let mut test = TcpTestUnit::new(local(), remote());
    test.listen(8);

    let mut fin = TcpPacket::new(1808, 5501, 400, 900, WIN_4KB, Vec::new());
    fin.flags = fin.flags.fin(true);
    test.incoming(fin)?;

    let mut rst = TcpPacket::new(1808, 5501, 400, 900, WIN_4KB, Vec::new());
    rst.flags = rst.flags.rst(true);
    test.incoming(rst)?;

    test.assert_outgoing_eq(&[]);
    assert!(test.con.as_mut().unwrap().next_pending().is_none());
    Ok(())
}

#[test]
fn phantom_bytes_reserve_sequence_space() {
    let mut active = TcpTestUnit::new(local(), remote());
    active.connect();
    assert_eq!(active.con().snd.nxt, 1.into());
    assert_eq!(active.con().snd.una, 0.into());

    let mut passive = TcpTestUnit::new(local(), remote());
    passive.accept_syn(TcpPacket::syn(1808, 5501, 100, WIN_4KB));
    assert_eq!(passive.con().snd.nxt, 1.into());
    assert_eq!(passive.con().rcv.nxt, 101.into());
}
