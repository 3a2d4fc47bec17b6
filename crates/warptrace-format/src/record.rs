//! Logical trace records.
//!
//! Producers hand these to the ring buffer; the drainer decodes them back out
//! of committed slots and forwards them to the trace stream. The enum mirrors
//! the wire tags one-to-one, so every variant round-trips through
//! [`crate::encode`] / [`crate::decode`].

/// What a traced instruction did to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Load,
    Store,
    Atomic,
}

/// Cooperative-thread-array coordinates, serialized high-to-low as
/// `x << 32 | y << 16 | z` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CtaId {
    pub x: u32,
    pub y: u16,
    pub z: u16,
}

impl CtaId {
    pub fn new(x: u32, y: u16, z: u16) -> Self {
        Self { x, y, z }
    }
}

/// One segment of an [`Record::AccessRun`]: `count` accesses starting at
/// `address`, each `offset` bytes after the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEntry {
    pub address: u64,
    pub offset: i32,
    pub count: u8,
}

/// One traced event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A single globally-visible memory access.
    MemoryAccess {
        kind: AccessKind,
        address: u64,
        size: u16,
        instruction_id: u32,
        warp_id: u16,
        cta_id: CtaId,
        clock: u64,
        sm_id: u8,
    },

    /// Several consecutive same-size accesses folded into one record.
    ///
    /// Each entry expands to `count` accesses at `address`, `address + offset`,
    /// `address + 2 * offset`, ... (wrapping). `entries` is never empty.
    AccessRun {
        kind: AccessKind,
        base_address: u64,
        unit_size: u16,
        entries: Vec<RunEntry>,
        instruction_id: u32,
        warp_id: u16,
        cta_id: CtaId,
        clock: u64,
        sm_id: u8,
    },

    /// A warp began executing on a streaming multiprocessor.
    ThreadExecute {
        cta_id: CtaId,
        warp_id: u16,
        clock: u64,
        sm_id: u8,
    },

    /// A lane of a warp returned from the kernel.
    ThreadReturn {
        lane_id: u32,
        cta_id: CtaId,
        warp_id: u16,
        clock: u64,
        sm_id: u8,
    },
}

impl Record {
    /// Cycle counter sampled when the event was produced. Cross-shard ordering
    /// is reconstructed from this; there is no other global order.
    pub fn clock(&self) -> u64 {
        match self {
            Record::MemoryAccess { clock, .. }
            | Record::AccessRun { clock, .. }
            | Record::ThreadExecute { clock, .. }
            | Record::ThreadReturn { clock, .. } => *clock,
        }
    }

    /// Streaming-multiprocessor id the producing warp ran on.
    pub fn sm_id(&self) -> u8 {
        match self {
            Record::MemoryAccess { sm_id, .. }
            | Record::AccessRun { sm_id, .. }
            | Record::ThreadExecute { sm_id, .. }
            | Record::ThreadReturn { sm_id, .. } => *sm_id,
        }
    }
}
