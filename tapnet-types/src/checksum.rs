//! RFC 1071 internet checksum arithmetic.

use byteorder::{ByteOrder, NetworkEndian};

fn propagate_carries(word: u32) -> u16 {
    let sum = (word >> 16) + (word & 0xffff);
    ((sum >> 16) as u16) + (sum as u16)
}

/// One's-complement sum over `data`, without the final complement.
/// An odd trailing byte is padded with zero on the right.
#[must_use]
pub fn data(mut data: &[u8]) -> u16 {
    let mut accum: u32 = 0;
    while data.len() >= 2 {
        accum += u32::from(NetworkEndian::read_u16(data));
        data = &data[2..];
    }
    if let Some(&value) = data.first() {
        accum += u32::from(value) << 8;
    }
    propagate_carries(accum)
}

/// Combine several partial sums produced by [`data`].
#[must_use]
pub fn combine(sums: &[u16]) -> u16 {
    let mut accum: u32 = 0;
    for &word in sums {
        accum += u32::from(word);
    }
    propagate_carries(accum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_reference_words() {
        // example sequence from RFC 1071 S3
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(data(&bytes), 0xddf2);
    }

    #[test]
    fn odd_byte_is_right_padded() {
        assert_eq!(data(&[0xab]), 0xab00);
        assert_eq!(data(&[0x12, 0x34, 0xab]), combine(&[0x1234, 0xab00]));
    }

    #[test]
    fn carries_fold_back() {
        assert_eq!(data(&[0xff, 0xff, 0x00, 0x01]), 0x0001);
        assert_eq!(combine(&[0xffff, 0xffff]), 0xffff);
    }
}
