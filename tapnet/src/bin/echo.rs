//! Demo binary: brings the stack up on `tap0` at 10.0.0.4 and runs an
//! echo server on port 5501, or a single echo exchange against the
//! host side when invoked with `client`.

use std::io;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use tapnet::Stack;
use tracing_subscriber::EnvFilter;

const IFACE: &str = "tap0";
const ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 4);
const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PORT: u16 = 5501;

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let stack = Stack::open(IFACE, ADDR, MASK)?;

    if std::env::args().any(|arg| arg == "client") {
        client(&stack)
    } else {
        server(&stack)
    }
}

fn server(stack: &Stack) -> io::Result<()> {
    let mut listener = stack.socket();
    listener.listen(&ADDR.to_string(), PORT, 8)?;

    loop {
        let mut socket = listener.accept()?;
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            'conn: loop {
                match socket.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // write takes at most the usable send window, so
                        // keep going until the whole chunk is queued
                        let mut written = 0;
                        while written < n {
                            match socket.write(&buf[written..n]) {
                                Ok(0) => thread::sleep(Duration::from_millis(50)),
                                Ok(k) => written += k,
                                Err(e) => {
                                    tracing::debug!("echo write failed: {e}");
                                    break 'conn;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("echo read failed: {e}");
                        break;
                    }
                }
            }
            let _ = socket.close();
        });
    }
}

fn client(stack: &Stack) -> io::Result<()> {
    let mut socket = stack.socket();
    socket.connect(&PEER.to_string(), PORT)?;
    socket.write(b"Ping!")?;

    let mut buf = [0u8; 1024];
    let n = socket.read(&mut buf)?;
    println!("{}", String::from_utf8_lossy(&buf[..n]));

    socket.close()?;
    stack.shutdown();
    Ok(())
}
