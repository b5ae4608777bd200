//! Layer 2: the TAP character device and the interface bound to it.
//!
//! A TAP device delivers and accepts complete Ethernet frames, one per
//! read or write. The ingress thread owns the read loop; writers from
//! any thread hand a whole frame to a single `write` call.

use std::io::{self, Error, ErrorKind};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use tapnet_types::iface::{EthernetFrame, MacAddress};
use tapnet_types::ToBytestream;

static TAP_PATH: &[u8] = b"/dev/net/tun\0";

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Mirror of `struct ifreq` with the flags arm of its union.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// An open TAP file descriptor attached to a named interface.
pub struct TapDevice {
    fd: RawFd,
    name: String,
}

impl TapDevice {
    /// Open `/dev/net/tun` and attach it to the interface `name`,
    /// creating the interface if necessary.
    pub fn open(name: &str) -> io::Result<TapDevice> {
        if name.len() >= libc::IF_NAMESIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "interface name too long"));
        }

        let fd = unsafe { libc::open(TAP_PATH.as_ptr().cast(), libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let mut req = IfReq {
            ifr_name: [0; libc::IF_NAMESIZE],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }

        let res = unsafe { libc::ioctl(fd, TUNSETIFF, &mut req) };
        if res < 0 {
            let err = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        tracing::debug!("attached to tap interface {name}");
        Ok(TapDevice {
            fd,
            name: name.to_string(),
        })
    }

    /// Receive one complete frame, blocking until one arrives.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if len < 0 {
            return Err(Error::last_os_error());
        }
        Ok(len as usize)
    }

    /// Send one complete frame.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let len = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if len < 0 {
            return Err(Error::last_os_error());
        }
        Ok(len as usize)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The device coupled with its link and network identity.
pub struct Iface {
    device: TapDevice,
    mac: MacAddress,
    addr: Ipv4Addr,
    mask: Ipv4Addr,
}

impl Iface {
    #[must_use]
    pub fn new(device: TapDevice, addr: Ipv4Addr, mask: Ipv4Addr) -> Iface {
        let mac = MacAddress::gen();
        tracing::info!("interface {} up, {addr}/{mask} hw {mac}", device.name());
        Iface {
            device,
            mac,
            addr,
            mask,
        }
    }

    #[must_use]
    pub fn device(&self) -> &TapDevice {
        &self.device
    }

    #[must_use]
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Whether `dest` shares our subnet and is reachable without a
    /// gateway.
    #[must_use]
    pub fn is_local(&self, dest: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(dest) & mask) == (u32::from(self.addr) & mask)
    }

    /// Frame `content` and put it on the wire.
    pub fn send_frame(&self, dest: MacAddress, kind: u16, content: Vec<u8>) -> io::Result<()> {
        let frame = EthernetFrame {
            dest,
            src: self.mac,
            kind,
            content,
        };
        self.device.send(&frame.to_vec()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_membership() {
        let device = TapDevice {
            fd: -1,
            name: "test0".to_string(),
        };
        let iface = Iface::new(
            device,
            Ipv4Addr::new(10, 0, 0, 4),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert!(iface.is_local(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(iface.is_local(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!iface.is_local(Ipv4Addr::new(10, 0, 1, 1)));
        assert!(!iface.is_local(Ipv4Addr::new(192, 168, 0, 1)));
    }
}
