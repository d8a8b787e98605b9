//! Byte ring carrying frames for the single-process cooperative backend.
//!
//! Layout:
//!
//! ```text
//! +----------------------+--------------------------------------------+
//! | Header (32 bytes)    | Data region (capacity bytes, 8B aligned)   |
//! +----------------------+--------------------------------------------+
//!                          Record:
//!                          [u32 total_len][u8 tag][u8 ver][u16 flags]
//!                          [frame bytes ...][pad → 8 bytes]
//!                          Sentinel (wrap): total_len == 0xFFFF_FFFF
//! ```
//!
//! [`MsgRing`] itself is single-producer/single-consumer. [`EventQueue`] puts
//! it behind a mutex so any thread may post, and parks producers and the
//! consumer on two doorbells from [`crate::wait`].

use crate::region::{RegionInit, SharedRegion};
use crate::wait;
use crate::{TransportError, TransportResult};
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::Mutex;
use std::mem::size_of;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

const ALIGN: usize = 8;
const ENVELOPE_LEN: usize = 8;
const SENTINEL: u32 = u32::MAX;
const SENTINEL_BYTES: usize = 4;
const HEADER_SIZE: usize = size_of::<MsgRingHeader>();
const MIN_CAPACITY: usize = 64;

#[repr(C, align(8))]
struct MsgRingHeader {
    capacity_bytes: u32,
    head_bytes: AtomicU32,
    tail_bytes: AtomicU32,
    records: AtomicU32,
    reserved: [u64; 2],
}

/// Metadata stored in front of each record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Discriminant of the record (the frame's message kind).
    pub tag: u8,
    /// Wire version of the record.
    pub ver: u8,
    /// Reserved bitflags that travel with the record.
    pub flags: u16,
}

impl Envelope {
    /// Constructs an envelope with the given tag and version.
    pub const fn new(tag: u8, ver: u8) -> Self {
        Self { tag, ver, flags: 0 }
    }
}

/// Single-producer / single-consumer byte ring.
pub struct MsgRing {
    region: SharedRegion,
    capacity: u32,
}

impl MsgRing {
    /// Creates a ring with `capacity_bytes` usable for records.
    pub fn new(capacity_bytes: usize) -> TransportResult<Self> {
        let aligned_capacity = align_up(capacity_bytes.max(MIN_CAPACITY), ALIGN);
        if aligned_capacity >= u32::MAX as usize {
            return Err(TransportError::InvalidCapacity {
                requested: capacity_bytes,
                minimum: MIN_CAPACITY,
            });
        }

        let total_bytes = HEADER_SIZE + aligned_capacity;
        let mut region = SharedRegion::anonymous(total_bytes, 64, RegionInit::Zeroed)?;

        let header_ptr = region.as_mut_ptr() as *mut MsgRingHeader;
        // SAFETY: the region is at least HEADER_SIZE bytes and 64-byte aligned.
        unsafe {
            header_ptr.write(MsgRingHeader {
                capacity_bytes: aligned_capacity as u32,
                head_bytes: AtomicU32::new(0),
                tail_bytes: AtomicU32::new(0),
                records: AtomicU32::new(0),
                reserved: [0; 2],
            });
        }

        Ok(Self {
            region,
            capacity: aligned_capacity as u32,
        })
    }

    /// Usable capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity as usize
    }

    /// Number of records waiting to be consumed.
    pub fn len(&self) -> usize {
        self.header().records.load(Ordering::Acquire) as usize
    }

    /// True when no record is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest payload a single record can ever hold.
    pub fn max_payload(&self) -> usize {
        (self.capacity_bytes() / 2).saturating_sub(ENVELOPE_LEN + ALIGN)
    }

    /// Copies `payload` into the ring; `false` when there is no room right now.
    pub fn try_push(&mut self, envelope: Envelope, payload: &[u8]) -> bool {
        let total_len = ENVELOPE_LEN + payload.len();
        let record_len = align_up(total_len, ALIGN);
        if record_len >= self.capacity_bytes() {
            return false;
        }

        let capacity = self.capacity_bytes();
        let head = self.header().head_bytes.load(Ordering::Relaxed) as usize;
        let tail = self.header().tail_bytes.load(Ordering::Acquire) as usize;
        if head == tail && head != 0 {
            // Empty: rewind so a large record is not stuck behind the wrap point.
            let header = self.header();
            header.tail_bytes.store(0, Ordering::Release);
            header.head_bytes.store(0, Ordering::Release);
            return self.try_push(envelope, payload);
        }
        let Some((offset, new_head)) = self.reserve_offset(head, tail, record_len, capacity)
        else {
            return false;
        };

        let data = self.data_slice_mut();
        data[offset..offset + 4].copy_from_slice(&(total_len as u32).to_le_bytes());
        data[offset + 4] = envelope.tag;
        data[offset + 5] = envelope.ver;
        data[offset + 6..offset + 8].copy_from_slice(&envelope.flags.to_le_bytes());
        let body = offset + ENVELOPE_LEN;
        data[body..body + payload.len()].copy_from_slice(payload);
        data[body + payload.len()..offset + record_len].fill(0);

        let header = self.header();
        header.head_bytes.store(new_head as u32, Ordering::Release);
        header.records.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Pops the oldest record, appending its payload to `out`.
    pub fn pop_into(&mut self, out: &mut Vec<u8>) -> Option<Envelope> {
        let capacity = self.capacity_bytes();
        let mut tail = self.header().tail_bytes.load(Ordering::Relaxed) as usize;

        loop {
            let head = self.header().head_bytes.load(Ordering::Acquire) as usize;
            if head == tail {
                return None;
            }

            let data = self.data_slice();
            let total_len = read_u32(data, tail);
            if total_len == SENTINEL {
                tail = 0;
                self.header().tail_bytes.store(0, Ordering::Release);
                continue;
            }

            let total_len = total_len as usize;
            debug_assert!(total_len >= ENVELOPE_LEN && tail + total_len <= capacity);
            let envelope = Envelope {
                tag: data[tail + 4],
                ver: data[tail + 5],
                flags: u16::from_le_bytes([data[tail + 6], data[tail + 7]]),
            };
            out.extend_from_slice(&data[tail + ENVELOPE_LEN..tail + total_len]);

            let mut new_tail = tail + align_up(total_len, ALIGN);
            if new_tail >= capacity {
                new_tail -= capacity;
            }
            let header = self.header();
            header.tail_bytes.store(new_tail as u32, Ordering::Release);
            header.records.fetch_sub(1, Ordering::AcqRel);
            return Some(envelope);
        }
    }

    fn header(&self) -> &MsgRingHeader {
        // SAFETY: the header was written in `new` and lives as long as the region.
        unsafe { &*(self.region.as_ptr() as *const MsgRingHeader) }
    }

    fn data_slice(&self) -> &[u8] {
        // SAFETY: the region holds HEADER_SIZE + capacity contiguous bytes.
        unsafe {
            std::slice::from_raw_parts(self.region.as_ptr().add(HEADER_SIZE), self.capacity_bytes())
        }
    }

    fn data_slice_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity_bytes();
        // SAFETY: unique borrow of the ring; the slice covers the data section only.
        unsafe {
            std::slice::from_raw_parts_mut(self.region.as_mut_ptr().add(HEADER_SIZE), capacity)
        }
    }

    fn reserve_offset(
        &mut self,
        head: usize,
        tail: usize,
        record_len: usize,
        capacity: usize,
    ) -> Option<(usize, usize)> {
        if head >= capacity || tail >= capacity {
            return None;
        }

        if head >= tail {
            let space_at_end = capacity - head;
            if space_at_end >= record_len {
                let mut new_head = head + record_len;
                if new_head == capacity {
                    new_head = 0;
                }
                if new_head == tail {
                    return None;
                }
                Some((head, new_head))
            } else {
                if tail <= record_len || space_at_end < SENTINEL_BYTES {
                    return None;
                }
                let data = self.data_slice_mut();
                data[head..head + SENTINEL_BYTES].copy_from_slice(&SENTINEL.to_le_bytes());
                Some((0, record_len))
            }
        } else {
            if record_len >= tail - head {
                return None;
            }
            Some((head, head + record_len))
        }
    }
}

/// Multi-producer, single-consumer queue of frames with blocking ends.
pub struct EventQueue {
    ring: Mutex<MsgRing>,
    posted: AtomicU32,
    freed: AtomicU32,
    closed: AtomicBool,
}

impl EventQueue {
    /// Creates a queue holding up to `capacity_bytes` of records.
    pub fn new(capacity_bytes: usize) -> TransportResult<Self> {
        Ok(Self {
            ring: Mutex::new(MsgRing::new(capacity_bytes)?),
            posted: AtomicU32::new(0),
            freed: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Posts a frame, parking while the ring is full.
    ///
    /// Fails with [`TransportError::Destroyed`] once the queue is closed.
    pub fn push(&self, envelope: Envelope, frame: &[u8]) -> TransportResult<()> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Destroyed);
            }

            let observed = self.freed.load(Ordering::Acquire);
            {
                let mut ring = self.ring.lock();
                if frame.len() > ring.max_payload() {
                    return Err(TransportError::InvalidCapacity {
                        requested: frame.len(),
                        minimum: ring.max_payload(),
                    });
                }
                if ring.try_push(envelope, frame) {
                    drop(ring);
                    wait::ring(&self.posted);
                    return Ok(());
                }
            }
            wait::wait_u32(&self.freed, observed);
        }
    }

    /// Takes the oldest frame, parking while the ring is empty.
    ///
    /// Frames already queued are drained before a closed queue reports
    /// [`TransportError::Destroyed`].
    pub fn pop_blocking(&self) -> TransportResult<(Envelope, Vec<u8>)> {
        loop {
            let observed = self.posted.load(Ordering::Acquire);
            let mut out = Vec::new();
            let popped = self.ring.lock().pop_into(&mut out);
            if let Some(envelope) = popped {
                wait::ring(&self.freed);
                return Ok((envelope, out));
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Destroyed);
            }
            wait::wait_u32(&self.posted, observed);
        }
    }

    /// Number of frames waiting.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects further posts and wakes every parked thread.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        wait::ring(&self.posted);
        wait::ring(&self.freed);
    }
}

fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;

    const ENV: Envelope = Envelope::new(0x04, 1);

    proptest! {
        /// Any interleaving of pushes and pops behaves like a bounded FIFO.
        #[test]
        fn matches_a_fifo_model(ops in prop::collection::vec(prop::option::of(1usize..120), 0..200)) {
            let mut ring = MsgRing::new(256).unwrap();
            let mut model = VecDeque::new();
            let mut out = Vec::new();
            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Some(len) => {
                        let payload = vec![i as u8; len];
                        if ring.try_push(ENV, &payload) {
                            model.push_back(payload);
                        } else {
                            prop_assert!(!model.is_empty());
                        }
                    }
                    None => {
                        out.clear();
                        let popped = ring.pop_into(&mut out);
                        match model.pop_front() {
                            Some(want) => {
                                prop_assert_eq!(popped, Some(ENV));
                                prop_assert_eq!(&out, &want);
                            }
                            None => prop_assert!(popped.is_none()),
                        }
                    }
                }
                prop_assert_eq!(ring.len(), model.len());
            }
        }
    }

    #[test]
    fn records_come_back_in_order() {
        let mut ring = MsgRing::new(256).unwrap();
        assert!(ring.try_push(ENV, b"first"));
        assert!(ring.try_push(ENV, b"second"));
        assert_eq!(ring.len(), 2);

        let mut out = Vec::new();
        assert_eq!(ring.pop_into(&mut out), Some(ENV));
        assert_eq!(out, b"first");
        out.clear();
        ring.pop_into(&mut out);
        assert_eq!(out, b"second");
        assert!(ring.pop_into(&mut out).is_none());
    }

    /// Wrap test: the sentinel sends the consumer back to offset zero.
    #[test]
    fn sentinel_wrap_path() {
        let mut ring = MsgRing::new(128).unwrap();
        let mut out = Vec::new();
        assert!(ring.try_push(ENV, &[0xAA; 16]));
        ring.pop_into(&mut out);

        assert!(ring.try_push(ENV, &[0xBB; 24]));
        assert!(ring.try_push(ENV, &[0xCC; 24]));
        out.clear();
        ring.pop_into(&mut out);
        assert_eq!(out, vec![0xBB; 24]);

        assert!(ring.try_push(ENV, &[0xDD; 40]));
        out.clear();
        ring.pop_into(&mut out);
        assert_eq!(out, vec![0xCC; 24]);
        out.clear();
        ring.pop_into(&mut out);
        assert_eq!(out, vec![0xDD; 40]);
    }

    #[test]
    fn drained_ring_takes_its_largest_record() {
        let mut ring = MsgRing::new(128).unwrap();
        let mut out = Vec::new();
        assert!(ring.try_push(ENV, &[1; 32]));
        ring.pop_into(&mut out);
        let largest = vec![2u8; ring.max_payload()];
        assert!(ring.try_push(ENV, &largest));
    }

    #[test]
    fn full_ring_refuses_until_drained() {
        let mut ring = MsgRing::new(128).unwrap();
        let mut pushed = 0;
        while ring.try_push(ENV, &[0xAB; 40]) {
            pushed += 1;
        }
        assert!(pushed > 0);
        let mut out = Vec::new();
        ring.pop_into(&mut out);
        assert!(ring.try_push(ENV, &[0xAB; 40]));
    }

    #[test]
    fn varied_lengths_stay_fifo() {
        let mut ring = MsgRing::new(1024).unwrap();
        let mut expected = VecDeque::new();
        let mut out = Vec::new();
        for i in 0..2_000usize {
            let payload = vec![(i % 251) as u8; 1 + (i * 37) % 300];
            while !ring.try_push(ENV, &payload) {
                out.clear();
                ring.pop_into(&mut out).expect("ring cannot be empty here");
                assert_eq!(out, expected.pop_front().unwrap());
            }
            expected.push_back(payload);
        }
        while let Some(want) = expected.pop_front() {
            out.clear();
            ring.pop_into(&mut out).unwrap();
            assert_eq!(out, want);
        }
    }

    /// Producers block on a full queue and resume as the consumer drains it.
    #[test]
    fn queue_applies_backpressure() {
        let queue = Arc::new(EventQueue::new(256).unwrap());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0u8..64 {
                    queue.push(ENV, &[i; 32]).unwrap();
                }
            })
        };

        for i in 0u8..64 {
            let (_, frame) = queue.pop_blocking().unwrap();
            assert_eq!(frame, vec![i; 32]);
        }
        producer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn closed_queue_drains_then_reports_destroyed() {
        let queue = EventQueue::new(256).unwrap();
        queue.push(ENV, b"last").unwrap();
        queue.close();
        assert!(matches!(
            queue.push(ENV, b"late"),
            Err(TransportError::Destroyed)
        ));
        assert_eq!(queue.pop_blocking().unwrap().1, b"last");
        assert!(matches!(
            queue.pop_blocking(),
            Err(TransportError::Destroyed)
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let queue = EventQueue::new(128).unwrap();
        assert!(matches!(
            queue.push(ENV, &[0u8; 512]),
            Err(TransportError::InvalidCapacity { .. })
        ));
    }
}
