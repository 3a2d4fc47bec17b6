#![forbid(unsafe_code)]

//! Wire format for GPU kernel traces.
//!
//! This crate intentionally stays dependency-free and focuses on a stable
//! on-disk/in-buffer format shared by the device-side ring buffers and the
//! persisted trace file:
//!
//! - [`Record`]: the logical event model (memory accesses, thread scheduling).
//! - [`codec`]: the packed variable-length wire representation of one record.
//! - [`runs`]: folding consecutive same-size accesses into [`Record::AccessRun`]
//!   entries and expanding them back.
//! - [`TraceWriter`] / [`TraceReader`]: the framed trace stream (magic +
//!   kernel-announce frames + record frames).

mod codec;
mod record;
pub mod runs;
mod stream;

pub use codec::{
    decode, encode, encode_into, wire_len, DecodeError, EncodeError, KERNEL_SENTINEL,
    MAX_ACCESS_SIZE, MAX_INSTRUCTION_ID, MAX_RECORD_BYTES, MAX_RUN_ENTRIES, RECORD_FIXED_BYTES,
    RECORD_HEADER_BYTES, UNIT_BYTES,
};
pub use record::{AccessKind, CtaId, Record, RunEntry};
pub use stream::{
    Frame, TraceReadError, TraceReader, TraceWriteError, TraceWriter, Version, MAGIC_LEN,
};
