//! The sharded slot ring and its reservation/commit protocol.
//!
//! Per shard, three pieces of shared state drive the protocol:
//!
//! - `alloc`: monotonic (wrapping `u32`) reservation counter, bumped by
//!   producer groups with a CAS covering the whole group at once.
//! - `ready[slot]`: per-slot completion generations. Writing slot index `i`
//!   publishes generation `(i / capacity) + 1`; groups run concurrently, so
//!   completions land out of program order.
//! - `commit`: monotonic (wrapping `u32`) reuse boundary, advanced only by the
//!   drainer after it has copied a completed prefix out. Producers admit a
//!   reservation only while `alloc - commit + n <= capacity`, so a slot is
//!   never overwritten before the drainer has moved its record out, and a full
//!   shard stalls producers until the drainer catches up.
//!
//! Counters live on their own cache lines. All index arithmetic is wrapping
//! `u32` differences, so counter wraparound is harmless.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::fmt;

use warptrace_format::{decode, encode_into, DecodeError, EncodeError, Record};

use crate::layout::ShardLayout;

#[repr(align(64))]
struct ShardCounter(AtomicU32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    Encode(EncodeError),
    /// The encoded record does not fit the layout's slot size.
    SlotOverflow { len: usize, slot_bytes: usize },
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Encode(err) => write!(f, "record encoding failed: {err}"),
            WriteError::SlotOverflow { len, slot_bytes } => {
                write!(f, "{len}-byte record exceeds the {slot_bytes}-byte slot")
            }
        }
    }
}

impl std::error::Error for WriteError {}

impl From<EncodeError> for WriteError {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

/// A group's claim on `len` consecutive slots of one shard.
///
/// The whole lockstep group reserves as a single batch: either every member
/// gets a slot or the group waits together.
#[derive(Debug)]
pub struct Reservation {
    shard: usize,
    start: u32,
    len: u32,
}

impl Reservation {
    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity multi-producer/single-consumer ring, partitioned into
/// independent shards. See the module docs for the protocol.
pub struct ShardedRing {
    layout: ShardLayout,
    alloc: Box<[ShardCounter]>,
    commit: Box<[ShardCounter]>,
    stalls: Box<[AtomicU64]>,
    ready: Box<[AtomicU32]>,
    data_ptr: *mut u8,
    _storage: Box<[u8]>,
}

// The raw storage pointer is only ever dereferenced at slot granularity:
// producers touch slots they reserved, the drainer touches slots below the
// completed prefix. Those ranges never alias.
unsafe impl Send for ShardedRing {}
unsafe impl Sync for ShardedRing {}

impl ShardedRing {
    pub fn new(layout: ShardLayout) -> Self {
        let mut storage = vec![0u8; layout.total_bytes()].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr();
        let alloc = (0..layout.shards())
            .map(|_| ShardCounter(AtomicU32::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let commit = (0..layout.shards())
            .map(|_| ShardCounter(AtomicU32::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let stalls = (0..layout.shards())
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let ready = (0..layout.shards() * layout.slots_per_shard())
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            layout,
            alloc,
            commit,
            stalls,
            ready,
            data_ptr,
            _storage: storage,
        }
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    fn capacity(&self) -> u32 {
        self.layout.slots_per_shard() as u32
    }

    fn slot_mask(&self) -> u32 {
        self.capacity() - 1
    }

    fn slot_shift(&self) -> u32 {
        self.capacity().trailing_zeros()
    }

    fn ready_slot(&self, shard: usize, slot: u32) -> &AtomicU32 {
        &self.ready[shard * self.layout.slots_per_shard() + slot as usize]
    }

    fn slot_ptr(&self, shard: usize, slot: u32) -> *mut u8 {
        let offset = (shard * self.layout.slots_per_shard() + slot as usize)
            * self.layout.slot_bytes();
        unsafe { self.data_ptr.add(offset) }
    }

    /// Claim `n` consecutive slots if the shard has room, without waiting.
    pub fn try_reserve(&self, shard: usize, n: u32) -> Option<Reservation> {
        assert!(n >= 1 && n <= self.capacity());
        let alloc = &self.alloc[shard].0;
        let commit = &self.commit[shard].0;
        loop {
            let a = alloc.load(Ordering::Acquire);
            let c = commit.load(Ordering::Acquire);
            let used = a.wrapping_sub(c);
            if used > self.capacity() {
                // Raced with the drainer between the two loads; retry.
                continue;
            }
            if used + n > self.capacity() {
                return None;
            }
            if alloc
                .compare_exchange(a, a.wrapping_add(n), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Reservation {
                    shard,
                    start: a,
                    len: n,
                });
            }
        }
    }

    /// Claim `n` consecutive slots, spin-waiting while the shard is full.
    ///
    /// This is the sole producer-side suspension point; the wait ends when the
    /// drainer advances `commit`. Waits are counted per shard in [`Self::stalls`].
    pub fn reserve(&self, shard: usize, n: u32) -> Reservation {
        if let Some(reservation) = self.try_reserve(shard, n) {
            return reservation;
        }
        self.stalls[shard].fetch_add(1, Ordering::Relaxed);
        loop {
            core::hint::spin_loop();
            if let Some(reservation) = self.try_reserve(shard, n) {
                return reservation;
            }
        }
    }

    /// Encode `record` into the reservation's `i`-th slot and publish its
    /// completion.
    ///
    /// No other producer may touch the slot; the record becomes visible to the
    /// drainer once the completed prefix reaches it.
    pub fn write(&self, reservation: &Reservation, i: u32, record: &Record) -> Result<(), WriteError> {
        assert!(i < reservation.len, "slot index outside the reservation");
        let mut buf = Vec::with_capacity(self.layout.slot_bytes());
        encode_into(record, &mut buf)?;
        if buf.len() > self.layout.slot_bytes() {
            return Err(WriteError::SlotOverflow {
                len: buf.len(),
                slot_bytes: self.layout.slot_bytes(),
            });
        }
        self.write_bytes(reservation.shard, reservation.start.wrapping_add(i), &buf);
        Ok(())
    }

    fn write_bytes(&self, shard: usize, index: u32, bytes: &[u8]) {
        let slot = index & self.slot_mask();
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_ptr(shard, slot), bytes.len());
        }
        let generation = (index >> self.slot_shift()).wrapping_add(1);
        self.ready_slot(shard, slot).store(generation, Ordering::Release);
    }

    /// Reserve one slot per record and write them all, as one lockstep batch.
    ///
    /// Records are encoded before reserving, so a malformed record fails the
    /// whole batch instead of leaving a reserved slot permanently incomplete.
    pub fn reserve_and_write(
        &self,
        shard: usize,
        records: &[Record],
    ) -> Result<Reservation, WriteError> {
        assert!(!records.is_empty());
        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            let mut buf = Vec::with_capacity(self.layout.slot_bytes());
            encode_into(record, &mut buf)?;
            if buf.len() > self.layout.slot_bytes() {
                return Err(WriteError::SlotOverflow {
                    len: buf.len(),
                    slot_bytes: self.layout.slot_bytes(),
                });
            }
            encoded.push(buf);
        }
        let reservation = self.reserve(shard, records.len() as u32);
        for (i, buf) in encoded.iter().enumerate() {
            self.write_bytes(shard, reservation.start.wrapping_add(i as u32), buf);
        }
        Ok(reservation)
    }

    /// Drain up to `max` committed records from one shard, in reservation
    /// order, advancing `commit` past everything copied out.
    ///
    /// Only the session's drainer may call this. The scan stops at the first
    /// slot whose write has not completed, so records a concurrent group is
    /// still writing are picked up by a later pass.
    pub fn drain(
        &self,
        shard: usize,
        max: usize,
        out: &mut Vec<Record>,
    ) -> Result<usize, DecodeError> {
        let commit = &self.commit[shard].0;
        let mut index = commit.load(Ordering::Acquire);
        let start = index;
        let mut drained = 0usize;
        let mut buf = vec![0u8; self.layout.slot_bytes()];
        while drained < max {
            let slot = index & self.slot_mask();
            let expected = (index >> self.slot_shift()).wrapping_add(1);
            if self.ready_slot(shard, slot).load(Ordering::Acquire) != expected {
                break;
            }
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.slot_ptr(shard, slot) as *const u8,
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
            match decode(&buf) {
                Ok((record, _)) => out.push(record),
                Err(err) => {
                    // Free the slots already copied out before surfacing the
                    // corrupt one.
                    if index != start {
                        commit.store(index, Ordering::Release);
                    }
                    return Err(err);
                }
            }
            index = index.wrapping_add(1);
            drained += 1;
        }
        if index != start {
            commit.store(index, Ordering::Release);
        }
        Ok(drained)
    }

    /// Reservations not yet reclaimed by the drainer (committed writes waiting
    /// to be drained, plus writes still in flight). After a final drain this
    /// is exactly the number of records whose group never completed `write`.
    pub fn in_flight(&self, shard: usize) -> u32 {
        let a = self.alloc[shard].0.load(Ordering::Acquire);
        let c = self.commit[shard].0.load(Ordering::Acquire);
        a.wrapping_sub(c)
    }

    /// Times a `reserve` found its shard full and had to wait.
    pub fn stalls(&self, shard: usize) -> u64 {
        self.stalls[shard].load(Ordering::Relaxed)
    }

    pub fn total_stalls(&self) -> u64 {
        (0..self.layout.shards()).map(|shard| self.stalls(shard)).sum()
    }
}
