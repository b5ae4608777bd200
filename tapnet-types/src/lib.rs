#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions
)]

pub mod arp;
pub mod checksum;
pub mod icmp;
pub mod iface;
pub mod ip;
pub mod tcp;

use std::io::{Cursor, Write};

/// Serialization into a network-byte-order byte stream.
pub trait ToBytestream {
    type Error;

    fn to_bytestream(&self, stream: &mut impl Write) -> Result<(), Self::Error>;

    fn to_vec(&self) -> Result<Vec<u8>, Self::Error> {
        let mut buf = Vec::new();
        self.to_bytestream(&mut buf)?;
        Ok(buf)
    }
}

/// Deserialization from a network-byte-order byte stream.
pub trait FromBytestream: Sized {
    type Error;

    fn from_bytestream(stream: &mut Cursor<&[u8]>) -> Result<Self, Self::Error>;

    fn from_slice(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytestream(&mut Cursor::new(slice))
    }
}
