//! Packed wire representation of one [`Record`].
//!
//! Every record starts with three little-endian 64-bit words and one clock
//! word:
//!
//! - word0, high to low: tag (4 bits, never 0), address-unit count (6 bits),
//!   access size in bytes (10 bits), SM id (8 bits), warp id (16 bits),
//!   instruction id (20 bits).
//! - word1: primary address (accesses), lane id (thread return), or zero.
//! - word2: CTA id, `x << 32 | y << 16 | z`.
//! - word3: 64-bit clock.
//!
//! An access run appends one 16-byte unit per entry: an address word followed
//! by a meta word packing `offset << 8 | count` in its low 40 bits.
//!
//! Tags start at 1, so the most significant byte of word0 is non-zero for
//! every record; `0x00` there is reserved for the kernel-announce frame of the
//! trace stream ([`KERNEL_SENTINEL`]).

use core::fmt;

use crate::record::{AccessKind, CtaId, Record, RunEntry};

/// Fixed bytes of every record: three header words plus the clock word.
pub const RECORD_FIXED_BYTES: usize = 32;
/// The three packed header words.
pub const RECORD_HEADER_BYTES: usize = 24;
/// Bytes per access-run address unit.
pub const UNIT_BYTES: usize = 16;
/// Entries per run are capped at one per lane of a lockstep group; longer runs
/// must be split into multiple records.
pub const MAX_RUN_ENTRIES: usize = 32;
/// Largest wire form of a single record.
pub const MAX_RECORD_BYTES: usize = RECORD_FIXED_BYTES + MAX_RUN_ENTRIES * UNIT_BYTES;
/// Largest access size representable in word0 (10 bits).
pub const MAX_ACCESS_SIZE: u16 = 0x3FF;
/// Largest instruction id representable in word0 (20 bits).
pub const MAX_INSTRUCTION_ID: u32 = 0xF_FFFF;
/// Value of word0's most significant byte on a kernel-announce frame.
pub const KERNEL_SENTINEL: u8 = 0x00;

const TAG_SHIFT: u32 = 60;
const ALEN_SHIFT: u32 = 54;
const ALEN_MASK: u64 = 0x3F;
const SIZE_SHIFT: u32 = 44;
const SIZE_MASK: u64 = 0x3FF;
const SMID_SHIFT: u32 = 36;
const SMID_MASK: u64 = 0xFF;
const WARP_SHIFT: u32 = 20;
const WARP_MASK: u64 = 0xFFFF;
const INST_MASK: u64 = 0xF_FFFF;

const TAG_LOAD: u8 = 0x1;
const TAG_STORE: u8 = 0x2;
const TAG_ATOMIC: u8 = 0x3;
const TAG_EXECUTE: u8 = 0x4;
const TAG_RETURN: u8 = 0x5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// A scalar does not fit its word0 bit field. Never truncated silently.
    FieldOverflow {
        field: &'static str,
        value: u64,
        max: u64,
    },
    /// More run entries than [`MAX_RUN_ENTRIES`]; split the run instead.
    TooManyEntries(usize),
    /// An access run must carry at least one entry.
    EmptyRun,
    /// A run entry must repeat at least once.
    ZeroRepeat,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::FieldOverflow { field, value, max } => {
                write!(f, "{field} {value} exceeds field maximum {max}")
            }
            EncodeError::TooManyEntries(len) => {
                write!(f, "{len} run entries exceed the per-record maximum {MAX_RUN_ENTRIES}")
            }
            EncodeError::EmptyRun => write!(f, "access run has no entries"),
            EncodeError::ZeroRepeat => write!(f, "run entry has a zero repeat count"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is shorter than its own header implies.
    Truncated,
    /// Word0 carries a tag this decoder does not know.
    UnknownTag(u8),
    /// Structurally invalid record (e.g. a bogus unit).
    Corrupt(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "record truncated"),
            DecodeError::UnknownTag(tag) => write!(f, "unknown record tag {tag:#x}"),
            DecodeError::Corrupt(reason) => write!(f, "corrupt record: {reason}"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn kind_tag(kind: AccessKind) -> u8 {
    match kind {
        AccessKind::Load => TAG_LOAD,
        AccessKind::Store => TAG_STORE,
        AccessKind::Atomic => TAG_ATOMIC,
    }
}

fn kind_from_tag(tag: u8) -> Option<AccessKind> {
    Some(match tag {
        TAG_LOAD => AccessKind::Load,
        TAG_STORE => AccessKind::Store,
        TAG_ATOMIC => AccessKind::Atomic,
        _ => return None,
    })
}

fn pack_word0(
    tag: u8,
    unit_count: usize,
    size: u16,
    sm_id: u8,
    warp_id: u16,
    instruction_id: u32,
) -> Result<u64, EncodeError> {
    debug_assert!(tag != 0 && tag <= 0xF);
    debug_assert!(unit_count as u64 <= ALEN_MASK);
    if u64::from(size) > SIZE_MASK {
        return Err(EncodeError::FieldOverflow {
            field: "access size",
            value: u64::from(size),
            max: SIZE_MASK,
        });
    }
    if u64::from(instruction_id) > INST_MASK {
        return Err(EncodeError::FieldOverflow {
            field: "instruction id",
            value: u64::from(instruction_id),
            max: INST_MASK,
        });
    }
    Ok((u64::from(tag) << TAG_SHIFT)
        | ((unit_count as u64) << ALEN_SHIFT)
        | (u64::from(size) << SIZE_SHIFT)
        | (u64::from(sm_id) << SMID_SHIFT)
        | (u64::from(warp_id) << WARP_SHIFT)
        | u64::from(instruction_id))
}

fn pack_cta(cta: CtaId) -> u64 {
    (u64::from(cta.x) << 32) | (u64::from(cta.y) << 16) | u64::from(cta.z)
}

fn unpack_cta(word: u64) -> CtaId {
    CtaId {
        x: (word >> 32) as u32,
        y: (word >> 16) as u16,
        z: word as u16,
    }
}

fn push_fixed(out: &mut Vec<u8>, word0: u64, word1: u64, cta: CtaId, clock: u64) {
    out.extend_from_slice(&word0.to_le_bytes());
    out.extend_from_slice(&word1.to_le_bytes());
    out.extend_from_slice(&pack_cta(cta).to_le_bytes());
    out.extend_from_slice(&clock.to_le_bytes());
}

/// Encode one record into `out`.
pub fn encode_into(record: &Record, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match record {
        Record::MemoryAccess {
            kind,
            address,
            size,
            instruction_id,
            warp_id,
            cta_id,
            clock,
            sm_id,
        } => {
            let word0 = pack_word0(kind_tag(*kind), 0, *size, *sm_id, *warp_id, *instruction_id)?;
            push_fixed(out, word0, *address, *cta_id, *clock);
        }
        Record::AccessRun {
            kind,
            base_address,
            unit_size,
            entries,
            instruction_id,
            warp_id,
            cta_id,
            clock,
            sm_id,
        } => {
            if entries.is_empty() {
                return Err(EncodeError::EmptyRun);
            }
            if entries.len() > MAX_RUN_ENTRIES {
                return Err(EncodeError::TooManyEntries(entries.len()));
            }
            let word0 = pack_word0(
                kind_tag(*kind),
                entries.len(),
                *unit_size,
                *sm_id,
                *warp_id,
                *instruction_id,
            )?;
            push_fixed(out, word0, *base_address, *cta_id, *clock);
            for entry in entries {
                if entry.count == 0 {
                    return Err(EncodeError::ZeroRepeat);
                }
                out.extend_from_slice(&entry.address.to_le_bytes());
                let meta = (u64::from(entry.offset as u32) << 8) | u64::from(entry.count);
                out.extend_from_slice(&meta.to_le_bytes());
            }
        }
        Record::ThreadExecute {
            cta_id,
            warp_id,
            clock,
            sm_id,
        } => {
            let word0 = pack_word0(TAG_EXECUTE, 0, 0, *sm_id, *warp_id, 0)?;
            push_fixed(out, word0, 0, *cta_id, *clock);
        }
        Record::ThreadReturn {
            lane_id,
            cta_id,
            warp_id,
            clock,
            sm_id,
        } => {
            let word0 = pack_word0(TAG_RETURN, 0, 0, *sm_id, *warp_id, 0)?;
            push_fixed(out, word0, u64::from(*lane_id), *cta_id, *clock);
        }
    }
    Ok(())
}

/// Encode one record into a fresh buffer.
pub fn encode(record: &Record) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(RECORD_FIXED_BYTES);
    encode_into(record, &mut out)?;
    Ok(out)
}

pub(crate) fn record_total_len(word0: u64) -> usize {
    let units = ((word0 >> ALEN_SHIFT) & ALEN_MASK) as usize;
    RECORD_FIXED_BYTES + units * UNIT_BYTES
}

/// Wire size implied by a buffer's own leading word, without decoding it.
pub fn wire_len(bytes: &[u8]) -> Result<usize, DecodeError> {
    if bytes.len() < 8 {
        return Err(DecodeError::Truncated);
    }
    let word0 = read_u64(bytes, 0);
    let tag = (word0 >> TAG_SHIFT) as u8;
    if tag == 0 {
        return Err(DecodeError::UnknownTag(0));
    }
    Ok(record_total_len(word0))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Decode one record from the front of `bytes`.
///
/// Returns the record and its wire length. Exact left inverse of [`encode`]
/// for every representable record.
pub fn decode(bytes: &[u8]) -> Result<(Record, usize), DecodeError> {
    if bytes.len() < 8 {
        return Err(DecodeError::Truncated);
    }
    let word0 = read_u64(bytes, 0);
    let tag = (word0 >> TAG_SHIFT) as u8;
    if tag == 0 {
        return Err(DecodeError::UnknownTag(0));
    }
    let total = record_total_len(word0);
    if bytes.len() < total {
        return Err(DecodeError::Truncated);
    }

    let units = ((word0 >> ALEN_SHIFT) & ALEN_MASK) as usize;
    let size = ((word0 >> SIZE_SHIFT) & SIZE_MASK) as u16;
    let sm_id = ((word0 >> SMID_SHIFT) & SMID_MASK) as u8;
    let warp_id = ((word0 >> WARP_SHIFT) & WARP_MASK) as u16;
    let instruction_id = (word0 & INST_MASK) as u32;
    let word1 = read_u64(bytes, 8);
    let cta_id = unpack_cta(read_u64(bytes, 16));
    let clock = read_u64(bytes, 24);

    let record = match tag {
        TAG_LOAD | TAG_STORE | TAG_ATOMIC => {
            let kind = kind_from_tag(tag).unwrap();
            if units == 0 {
                Record::MemoryAccess {
                    kind,
                    address: word1,
                    size,
                    instruction_id,
                    warp_id,
                    cta_id,
                    clock,
                    sm_id,
                }
            } else {
                let mut entries = Vec::with_capacity(units);
                for unit in 0..units {
                    let base = RECORD_FIXED_BYTES + unit * UNIT_BYTES;
                    let address = read_u64(bytes, base);
                    let meta = read_u64(bytes, base + 8);
                    let count = (meta & 0xFF) as u8;
                    if count == 0 {
                        return Err(DecodeError::Corrupt("zero repeat count in address unit"));
                    }
                    let offset = ((meta >> 8) & 0xFFFF_FFFF) as u32 as i32;
                    entries.push(RunEntry {
                        address,
                        offset,
                        count,
                    });
                }
                Record::AccessRun {
                    kind,
                    base_address: word1,
                    unit_size: size,
                    entries,
                    instruction_id,
                    warp_id,
                    cta_id,
                    clock,
                    sm_id,
                }
            }
        }
        TAG_EXECUTE => {
            if units != 0 {
                return Err(DecodeError::Corrupt("address units on a scheduling record"));
            }
            Record::ThreadExecute {
                cta_id,
                warp_id,
                clock,
                sm_id,
            }
        }
        TAG_RETURN => {
            if units != 0 {
                return Err(DecodeError::Corrupt("address units on a scheduling record"));
            }
            Record::ThreadReturn {
                lane_id: word1 as u32,
                cta_id,
                warp_id,
                clock,
                sm_id,
            }
        }
        _ => return Err(DecodeError::UnknownTag(tag)),
    };
    Ok((record, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_load() -> Record {
        Record::MemoryAccess {
            kind: AccessKind::Load,
            address: 0xDEAD_BEEF_0123,
            size: 4,
            instruction_id: 7,
            warp_id: 3,
            cta_id: CtaId::new(2, 1, 0),
            clock: 0x1122_3344_5566_7788,
            sm_id: 9,
        }
    }

    #[test]
    fn word0_top_byte_is_never_the_kernel_sentinel() {
        let bytes = encode(&sample_load()).unwrap();
        // Little-endian word0: the tag lands in the word's most significant
        // byte, i.e. the eighth byte on the wire.
        assert_eq!(bytes[7], 0x10);
        assert_ne!(bytes[7], KERNEL_SENTINEL);
    }

    #[test]
    fn fixed_words_land_at_documented_offsets() {
        let bytes = encode(&sample_load()).unwrap();
        assert_eq!(bytes.len(), RECORD_FIXED_BYTES);
        assert_eq!(&bytes[8..16], &0xDEAD_BEEF_0123u64.to_le_bytes());
        let cta = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        assert_eq!(cta, (2u64 << 32) | (1u64 << 16));
        assert_eq!(&bytes[24..32], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn run_units_pack_offset_and_count() {
        let run = Record::AccessRun {
            kind: AccessKind::Store,
            base_address: 0x1000,
            unit_size: 8,
            entries: vec![RunEntry {
                address: 0x1000,
                offset: -8,
                count: 3,
            }],
            instruction_id: 0,
            warp_id: 0,
            cta_id: CtaId::default(),
            clock: 0,
            sm_id: 0,
        };
        let bytes = encode(&run).unwrap();
        assert_eq!(bytes.len(), RECORD_FIXED_BYTES + UNIT_BYTES);
        let meta = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
        assert_eq!(meta & 0xFF, 3);
        assert_eq!(((meta >> 8) & 0xFFFF_FFFF) as u32 as i32, -8);
    }

    #[test]
    fn every_truncated_prefix_fails_closed() {
        let bytes = encode(&sample_load()).unwrap();
        for len in 0..bytes.len() {
            assert_eq!(decode(&bytes[..len]), Err(DecodeError::Truncated), "len {len}");
        }
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let mut record = sample_load();
        if let Record::MemoryAccess { size, .. } = &mut record {
            *size = MAX_ACCESS_SIZE + 1;
        }
        assert!(matches!(
            encode(&record),
            Err(EncodeError::FieldOverflow { field: "access size", .. })
        ));

        let mut record = sample_load();
        if let Record::MemoryAccess { instruction_id, .. } = &mut record {
            *instruction_id = MAX_INSTRUCTION_ID + 1;
        }
        assert!(matches!(
            encode(&record),
            Err(EncodeError::FieldOverflow { field: "instruction id", .. })
        ));
    }
}
