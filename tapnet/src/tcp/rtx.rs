//! The retransmission queue and the transmitter thread draining it.
//!
//! Every segment that occupies sequence space enters the queue with an
//! immediate deadline; its first firing is the initial transmission.
//! Each firing re-arms the entry with an exponentially grown timeout,
//! capped at eight times the base RTO, until a cumulative acknowledgment
//! covers the segment's end.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tapnet_types::tcp::PROTO_TCP;

use crate::ipv4::Ipv4;
use crate::tcp::seq::SeqNo;
use crate::tcp::{Clock, Quad};

/// Retry multiplier cap: deadlines grow no further than `8 * base_rto`.
pub const MAX_BACKOFF: u32 = 8;

struct Entry {
    deadline: Instant,
    /// Insertion order, the tie-break for equal deadlines.
    token: u64,
    quad: Quad,
    seg_end: SeqNo,
    retries: u32,
    bytes: Vec<u8>,
}

/// A due segment handed to the transmitter. The queue keeps the entry,
/// the transmitter gets its own copy of the bytes.
pub struct Retransmit {
    pub quad: Quad,
    pub retries: u32,
    pub bytes: Vec<u8>,
}

struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    next_token: u64,
    closed: bool,
}

pub struct RetransmitQueue {
    inner: Mutex<Inner>,
    pending: Condvar,
    base_rto: Duration,
    clock: Clock,
}

impl RetransmitQueue {
    #[must_use]
    pub fn new(base_rto: Duration, clock: Clock) -> RetransmitQueue {
        RetransmitQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_token: 0,
                closed: false,
            }),
            pending: Condvar::new(),
            base_rto,
            clock,
        }
    }

    /// Take ownership of a serialized segment; the deadline is now.
    pub fn enqueue(&self, quad: Quad, seg_end: SeqNo, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.heap.push(Reverse(Entry {
            deadline: (self.clock)(),
            token,
            quad,
            seg_end,
            retries: 0,
            bytes,
        }));
        self.pending.notify_all();
    }

    /// Block until the earliest deadline fires. The fired entry is
    /// re-armed with backed-off timing before a copy is returned.
    /// `None` means the queue was shut down.
    pub fn dequeue(&self) -> Option<Retransmit> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return None;
            }
            let now = (self.clock)();
            match inner.heap.peek() {
                None => inner = self.pending.wait(inner).unwrap(),
                Some(Reverse(entry)) if entry.deadline > now => {
                    let timeout = entry.deadline - now;
                    let (guard, _) = self.pending.wait_timeout(inner, timeout).unwrap();
                    inner = guard;
                }
                Some(_) => {
                    let Reverse(mut entry) = inner.heap.pop().unwrap();
                    entry.retries = (entry.retries + 1).min(MAX_BACKOFF);
                    entry.deadline = now + self.base_rto * entry.retries;
                    entry.token = inner.next_token;
                    inner.next_token += 1;

                    let fired = Retransmit {
                        quad: entry.quad,
                        retries: entry.retries,
                        bytes: entry.bytes.clone(),
                    };
                    inner.heap.push(Reverse(entry));
                    return Some(fired);
                }
            }
        }
    }

    /// Evict everything for `quad` that a cumulative ack covers.
    pub fn ack(&self, quad: &Quad, ack: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.heap.len();
        inner
            .heap
            .retain(|Reverse(e)| !(e.quad == *quad && e.seg_end <= ack));
        if inner.heap.len() != before {
            self.pending.notify_all();
        }
    }

    /// Drop every entry of a torn-down connection.
    pub fn purge(&self, quad: &Quad) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.heap.len();
        inner.heap.retain(|Reverse(e)| e.quad != *quad);
        if inner.heap.len() != before {
            self.pending.notify_all();
        }
    }

    #[must_use]
    pub fn pending_count(&self, quad: &Quad) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.iter().filter(|Reverse(e)| e.quad == *quad).count()
    }

    /// Drain everything and wake all waiters; they observe the closed
    /// state and return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.heap.clear();
        self.pending.notify_all();
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.token == other.token
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.token.cmp(&other.token))
    }
}

/// The transmitter: a dedicated thread handing due segments to the
/// IPv4 layer. A failed send is logged and the entry stays queued for
/// its next deadline.
pub fn spawn_transmitter(rtx: Arc<RetransmitQueue>, ipv4: Arc<Ipv4>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("tcp-tx".to_string())
        .spawn(move || {
            while let Some(seg) = rtx.dequeue() {
                if seg.retries > 1 {
                    tracing::debug!("{}: retransmitting (attempt {})", seg.quad, seg.retries);
                }
                if let Err(e) = ipv4.send(None, seg.quad.remote.0, PROTO_TCP, seg.bytes) {
                    tracing::warn!("{}: transmit failed: {e}", seg.quad);
                }
            }
            tracing::debug!("retransmit queue closed, transmitter exits");
        })
        .expect("failed to spawn tcp transmitter")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn quad(port: u16) -> Quad {
        Quad {
            local: (Ipv4Addr::new(10, 0, 0, 4), port),
            remote: (Ipv4Addr::new(10, 0, 0, 1), 80),
        }
    }

    /// A queue on a hand-driven clock.
    fn queue() -> (Arc<Mutex<Instant>>, RetransmitQueue) {
        let now = Arc::new(Mutex::new(Instant::now()));
        let reader = now.clone();
        let rtx = RetransmitQueue::new(
            Duration::from_millis(100),
            Arc::new(move || *reader.lock().unwrap()),
        );
        (now, rtx)
    }

    #[test]
    fn initial_fire_is_immediate() {
        let (_, rtx) = queue();
        rtx.enqueue(quad(1), SeqNo(101), vec![0xaa]);

        let fired = rtx.dequeue().unwrap();
        assert_eq!(fired.retries, 1);
        assert_eq!(fired.bytes, vec![0xaa]);
        assert_eq!(rtx.pending_count(&quad(1)), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let (now, rtx) = queue();
        rtx.enqueue(quad(1), SeqNo(101), vec![0xaa]);

        let mut last_gap = Duration::ZERO;
        for round in 1..=12u32 {
            let fired = rtx.dequeue().unwrap();
            assert_eq!(fired.retries, round.min(MAX_BACKOFF));

            // deadlines within one entry never shrink
            let gap = Duration::from_millis(100) * round.min(MAX_BACKOFF);
            assert!(gap >= last_gap);
            last_gap = gap;

            *now.lock().unwrap() += gap;
        }
    }

    #[test]
    fn cumulative_ack_evicts() {
        let (_, rtx) = queue();
        rtx.enqueue(quad(1), SeqNo(100), vec![1]);
        rtx.enqueue(quad(1), SeqNo(200), vec![2]);
        rtx.enqueue(quad(1), SeqNo(300), vec![3]);
        rtx.enqueue(quad(2), SeqNo(150), vec![4]);

        rtx.ack(&quad(1), SeqNo(200));
        assert_eq!(rtx.pending_count(&quad(1)), 1);
        assert_eq!(rtx.pending_count(&quad(2)), 1);

        // the survivor is the one beyond the ack
        let fired = rtx.dequeue().unwrap();
        let survivor = if fired.quad == quad(1) { fired } else { rtx.dequeue().unwrap() };
        assert_eq!(survivor.bytes, vec![3]);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let (_, rtx) = queue();
        rtx.enqueue(quad(1), SeqNo(100), vec![1]);
        rtx.enqueue(quad(1), SeqNo(200), vec![2]);
        rtx.enqueue(quad(1), SeqNo(300), vec![3]);

        assert_eq!(rtx.dequeue().unwrap().bytes, vec![1]);
        assert_eq!(rtx.dequeue().unwrap().bytes, vec![2]);
        assert_eq!(rtx.dequeue().unwrap().bytes, vec![3]);
    }

    #[test]
    fn purge_clears_one_connection() {
        let (_, rtx) = queue();
        rtx.enqueue(quad(1), SeqNo(100), vec![1]);
        rtx.enqueue(quad(2), SeqNo(100), vec![2]);

        rtx.purge(&quad(1));
        assert_eq!(rtx.pending_count(&quad(1)), 0);
        assert_eq!(rtx.pending_count(&quad(2)), 1);
    }

    #[test]
    fn close_wakes_with_none() {
        let (_, rtx) = queue();
        rtx.enqueue(quad(1), SeqNo(100), vec![1]);
        rtx.close();
        assert!(rtx.dequeue().is_none());
    }
}
