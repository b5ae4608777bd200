//! By-sequence accumulation of received payload bytes.
//!
//! Segments may arrive out of order and overlapping. The buffer keeps
//! every received range sorted by sequence number and exposes the
//! gap-free prefix to a blocking reader. A range flagged PSH unblocks
//! the reader once it becomes contiguous; a zero-length PSH range marks
//! the end of the stream (a FIN), surfaced to the reader as a read of
//! zero bytes.

use std::io::{self, Error, ErrorKind};
use std::sync::{Condvar, Mutex};

use crate::tcp::seq::SeqNo;

#[derive(Debug)]
struct Entry {
    seq: SeqNo,
    bytes: Vec<u8>,
    psh: bool,
    contig: bool,
}

impl Entry {
    fn end(&self) -> SeqNo {
        self.seq.add(self.bytes.len() as u32)
    }
}

#[derive(Debug)]
struct Inner {
    /// Sorted by `seq`. Ranges may overlap, the reader skips bytes it
    /// has already consumed.
    entries: Vec<Entry>,
    /// Next byte the reader consumes.
    read_seq: SeqNo,
    /// End of the gap-free prefix. Monotone, survives draining.
    contig_end: SeqNo,
    /// Total bytes held, for the advertised-window calculation.
    buffered: usize,
    /// Contiguous PSH boundaries not yet crossed by the reader.
    psh_count: usize,
    closed: bool,
}

pub struct ReassemblyBuffer {
    inner: Mutex<Inner>,
    avail: Condvar,
}

impl ReassemblyBuffer {
    #[must_use]
    pub fn new(init: SeqNo) -> ReassemblyBuffer {
        ReassemblyBuffer {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                read_seq: init,
                contig_end: init,
                buffered: 0,
                psh_count: 0,
                closed: false,
            }),
            avail: Condvar::new(),
        }
    }

    /// Restart sequence accounting once the peer's ISN is known.
    pub fn bump(&self, seq: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.entries.is_empty());
        inner.entries.clear();
        inner.read_seq = seq;
        inner.contig_end = seq;
        inner.buffered = 0;
        inner.psh_count = 0;
    }

    /// Store a received range. A copy that is fully covered by an already
    /// buffered range is dropped; any other overlap is kept as-is and
    /// resolved by the reader.
    pub fn insert(&self, seq: SeqNo, bytes: Vec<u8>, psh: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let end = seq.add(bytes.len() as u32);
        if end < inner.read_seq || (end == inner.read_seq && !bytes.is_empty()) {
            // a stale retransmission, everything here was consumed already
            return;
        }

        let idx = inner.entries.partition_point(|e| e.seq <= seq);
        if idx > 0 {
            let prev = &inner.entries[idx - 1];
            if bytes.is_empty() {
                if prev.seq == seq && prev.bytes.is_empty() {
                    return;
                }
            } else if end <= prev.end() {
                return;
            }
        }

        inner.buffered += bytes.len();
        inner.entries.insert(
            idx,
            Entry {
                seq,
                bytes,
                psh,
                contig: false,
            },
        );

        // extend the gap-free prefix over anything the new range connects
        let mut contig_end = inner.contig_end;
        let mut i = 0;
        while i < inner.entries.len() {
            if !inner.entries[i].contig {
                if inner.entries[i].seq > contig_end {
                    break;
                }
                inner.entries[i].contig = true;
                contig_end = contig_end.max(inner.entries[i].end());
                if inner.entries[i].psh {
                    inner.psh_count += 1;
                }
            }
            i += 1;
        }
        inner.contig_end = contig_end;

        self.avail.notify_all();
    }

    /// Block until enough contiguous bytes for `buf` arrived, a push
    /// boundary became readable or the buffer was torn down. Returns the
    /// bytes copied; zero signals an end-of-stream marker.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let contig = inner.contig_end.since(inner.read_seq) as usize;
            if inner.psh_count > 0 || contig >= buf.len() {
                break;
            }
            if inner.closed {
                if contig > 0 {
                    break;
                }
                return Err(Error::new(ErrorKind::NotConnected, "no data, buffer torn down"));
            }
            inner = self.avail.wait(inner).unwrap();
        }
        consume(&mut inner, buf)
    }

    /// Drain without blocking, for connections that can no longer receive.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        consume(&mut inner, buf)
    }

    /// The highest sequence number the gap-free prefix allows us to
    /// acknowledge, if anything is buffered.
    pub fn ackable(&self) -> Option<SeqNo> {
        let inner = self.inner.lock().unwrap();
        (inner.contig_end != inner.read_seq || !inner.entries.is_empty())
            .then_some(inner.contig_end)
    }

    /// End of the gap-free prefix; monotone over the connection lifetime.
    #[must_use]
    pub fn contiguous_end(&self) -> SeqNo {
        self.inner.lock().unwrap().contig_end
    }

    #[must_use]
    pub fn contiguous_len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.contig_end.since(inner.read_seq) as usize
    }

    #[must_use]
    pub fn bytes_buffered(&self) -> usize {
        self.inner.lock().unwrap().buffered
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.buffered = 0;
        inner.psh_count = 0;
        let end = inner.contig_end;
        inner.read_seq = end;
    }

    /// Tear down: blocked and future readers observe the closed state.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.avail.notify_all();
    }
}

fn consume(inner: &mut Inner, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    loop {
        if n == buf.len() {
            break;
        }
        let read_seq = inner.read_seq;
        let Some(front) = inner.entries.first_mut() else {
            break;
        };
        if !front.contig {
            break;
        }

        if front.seq < read_seq {
            // overlap with bytes that are already delivered
            let skip = read_seq.since(front.seq) as usize;
            if skip >= front.bytes.len() {
                let stale = inner.entries.remove(0);
                inner.buffered -= stale.bytes.len();
                if stale.psh {
                    inner.psh_count = inner.psh_count.saturating_sub(1);
                }
            } else {
                front.bytes.drain(..skip);
                front.seq = read_seq;
                inner.buffered -= skip;
            }
            continue;
        }
        if front.seq > read_seq {
            debug_assert!(false, "gap inside the contiguous prefix");
            return Err(Error::new(
                ErrorKind::InvalidData,
                "reassembly buffer lost contiguity",
            ));
        }

        if front.bytes.is_empty() {
            // end-of-stream marker, deliver what we have (possibly nothing)
            let marker = inner.entries.remove(0);
            if marker.psh {
                inner.psh_count = inner.psh_count.saturating_sub(1);
            }
            break;
        }

        let take = (buf.len() - n).min(front.bytes.len());
        buf[n..n + take].copy_from_slice(&front.bytes[..take]);
        n += take;

        if take == front.bytes.len() {
            let done = inner.entries.remove(0);
            inner.buffered -= done.bytes.len();
            inner.read_seq = inner.read_seq.add(take as u32);
            if done.psh {
                inner.psh_count = inner.psh_count.saturating_sub(1);
                break;
            }
        } else {
            front.bytes.drain(..take);
            front.seq = front.seq.add(take as u32);
            inner.buffered -= take;
            inner.read_seq = inner.read_seq.add(take as u32);
            break;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_read() {
        let buffer = ReassemblyBuffer::new(SeqNo(1000));
        buffer.insert(SeqNo(1000), vec![1; 32], false);
        buffer.insert(SeqNo(1032), vec![2; 32], true);

        assert_eq!(buffer.contiguous_len(), 64);
        assert_eq!(buffer.bytes_buffered(), 64);
        assert_eq!(buffer.ackable(), Some(SeqNo(1064)));

        let mut buf = [0; 64];
        assert_eq!(buffer.read(&mut buf).unwrap(), 64);
        assert_eq!(&buf[..32], [1; 32]);
        assert_eq!(&buf[32..], [2; 32]);
        assert_eq!(buffer.bytes_buffered(), 0);
    }

    #[test]
    fn staggered_reads() {
        let buffer = ReassemblyBuffer::new(SeqNo(1000));
        buffer.insert(SeqNo(1000), vec![7; 64], false);

        let mut buf = [0; 24];
        assert_eq!(buffer.read(&mut buf).unwrap(), 24);
        assert_eq!(buffer.contiguous_len(), 40);

        let mut buf = [0; 40];
        assert_eq!(buffer.read(&mut buf).unwrap(), 40);
        assert_eq!(buffer.contiguous_len(), 0);
    }

    #[test]
    fn out_of_order_becomes_contiguous() {
        let buffer = ReassemblyBuffer::new(SeqNo(101));
        buffer.insert(SeqNo(101), b"AB".to_vec(), false);
        buffer.insert(SeqNo(105), b"EF".to_vec(), false);
        assert_eq!(buffer.contiguous_end(), SeqNo(103));
        assert_eq!(buffer.bytes_buffered(), 4);

        buffer.insert(SeqNo(103), b"CD".to_vec(), false);
        assert_eq!(buffer.contiguous_end(), SeqNo(107));

        let mut buf = [0; 6];
        assert_eq!(buffer.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"ABCDEF");
    }

    #[test]
    fn covered_duplicate_is_dropped() {
        let buffer = ReassemblyBuffer::new(SeqNo(0));
        buffer.insert(SeqNo(0), vec![1; 32], false);
        buffer.insert(SeqNo(8), vec![9; 8], false);
        assert_eq!(buffer.bytes_buffered(), 32);

        let mut buf = [0; 32];
        assert_eq!(buffer.read(&mut buf).unwrap(), 32);
        assert_eq!(buf, [1; 32]);
    }

    #[test]
    fn partial_overlap_is_delivered_once() {
        let buffer = ReassemblyBuffer::new(SeqNo(100));
        buffer.insert(SeqNo(100), vec![1; 10], false);
        buffer.insert(SeqNo(105), vec![2; 10], false);
        assert_eq!(buffer.contiguous_end(), SeqNo(115));

        let mut buf = [0; 15];
        assert_eq!(buffer.read(&mut buf).unwrap(), 15);
        assert_eq!(&buf[..10], [1; 10]);
        assert_eq!(&buf[10..], [2; 5]);
        assert_eq!(buffer.bytes_buffered(), 0);
    }

    #[test]
    fn psh_hands_over_early() {
        let buffer = ReassemblyBuffer::new(SeqNo(0));
        buffer.insert(SeqNo(0), vec![1; 8], true);
        buffer.insert(SeqNo(8), vec![2; 8], false);

        // a large read stops at the push boundary
        let mut buf = [0; 64];
        assert_eq!(buffer.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], [1; 8]);
    }

    #[test]
    fn eof_marker_reads_zero() {
        let buffer = ReassemblyBuffer::new(SeqNo(500));
        buffer.insert(SeqNo(500), b"last".to_vec(), true);
        buffer.insert(SeqNo(504), Vec::new(), true);

        let mut buf = [0; 16];
        assert_eq!(buffer.read(&mut buf).unwrap(), 4);
        assert_eq!(buffer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn duplicate_eof_marker_is_dropped() {
        let buffer = ReassemblyBuffer::new(SeqNo(500));
        buffer.insert(SeqNo(500), Vec::new(), true);
        buffer.insert(SeqNo(500), Vec::new(), true);

        let mut buf = [0; 16];
        assert_eq!(buffer.read(&mut buf).unwrap(), 0);
        assert_eq!(buffer.contiguous_len(), 0);
        let inner = buffer.inner.lock().unwrap();
        assert!(inner.entries.is_empty());
        assert_eq!(inner.psh_count, 0);
    }

    #[test]
    fn clear_discards_buffered_ranges() {
        let buffer = ReassemblyBuffer::new(SeqNo(0));
        buffer.insert(SeqNo(0), vec![1; 16], false);
        buffer.insert(SeqNo(32), vec![2; 16], true);

        buffer.clear();
        assert_eq!(buffer.bytes_buffered(), 0);
        assert_eq!(buffer.contiguous_len(), 0);
        assert_eq!(buffer.ackable(), None);
    }

    #[test]
    fn teardown_fails_empty_reads() {
        let buffer = ReassemblyBuffer::new(SeqNo(0));
        buffer.insert(SeqNo(0), vec![3; 4], true);
        buffer.close();

        // buffered bytes drain first, then the closed state surfaces
        let mut buf = [0; 4];
        assert_eq!(buffer.read(&mut buf).unwrap(), 4);
        let err = buffer.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn shuffled_chunks_reproduce_the_stream() {
        use rand::seq::SliceRandom;
        use rand::thread_rng;

        let stream: Vec<u8> = (0..=255).collect();
        let mut chunks: Vec<(u32, &[u8])> = stream.chunks(16).enumerate()
            .map(|(i, c)| (7000 + (i as u32) * 16, c))
            .collect();

        for _ in 0..8 {
            chunks.shuffle(&mut thread_rng());
            let buffer = ReassemblyBuffer::new(SeqNo(7000));
            for (seq, chunk) in &chunks {
                buffer.insert(SeqNo(*seq), chunk.to_vec(), false);
            }
            assert_eq!(buffer.contiguous_len(), stream.len());

            let mut buf = vec![0; stream.len()];
            assert_eq!(buffer.read(&mut buf).unwrap(), stream.len());
            assert_eq!(buf, stream);
        }
    }
}
