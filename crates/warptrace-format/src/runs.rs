//! Folding consecutive accesses into runs and expanding them back.
//!
//! A compression-capable trace stream stores `K` consecutive same-size
//! accesses from one warp as a single [`Record::AccessRun`]; the drainer
//! applies [`compress`] host-side before persisting. [`expand`] is the
//! semantic inverse: an expanded run is indistinguishable from the individual
//! accesses it stood for, except that only the first access's clock survives
//! compression.

use crate::codec::MAX_RUN_ENTRIES;
use crate::record::{Record, RunEntry};

/// Expand a run into its individual accesses. Non-run records pass through.
pub fn expand(record: &Record) -> Vec<Record> {
    let Record::AccessRun {
        kind,
        unit_size,
        entries,
        instruction_id,
        warp_id,
        cta_id,
        clock,
        sm_id,
        ..
    } = record
    else {
        return vec![record.clone()];
    };

    let mut out = Vec::new();
    for entry in entries {
        let step = entry.offset as i64 as u64;
        let mut address = entry.address;
        for _ in 0..entry.count {
            out.push(Record::MemoryAccess {
                kind: *kind,
                address,
                size: *unit_size,
                instruction_id: *instruction_id,
                warp_id: *warp_id,
                cta_id: *cta_id,
                clock: *clock,
                sm_id: *sm_id,
            });
            address = address.wrapping_add(step);
        }
    }
    out
}

/// Split a run with more than `max_entries` entries into several records.
///
/// This is the fail-closed path for oversized runs: emit multiple smaller
/// records rather than truncate. Non-run records and runs within the limit
/// pass through unchanged.
pub fn split(record: &Record, max_entries: usize) -> Vec<Record> {
    assert!(max_entries >= 1);
    let Record::AccessRun {
        kind,
        base_address,
        unit_size,
        entries,
        instruction_id,
        warp_id,
        cta_id,
        clock,
        sm_id,
    } = record
    else {
        return vec![record.clone()];
    };
    if entries.len() <= max_entries {
        return vec![record.clone()];
    }

    entries
        .chunks(max_entries)
        .enumerate()
        .map(|(chunk_index, chunk)| Record::AccessRun {
            kind: *kind,
            base_address: if chunk_index == 0 {
                *base_address
            } else {
                chunk[0].address
            },
            unit_size: *unit_size,
            entries: chunk.to_vec(),
            instruction_id: *instruction_id,
            warp_id: *warp_id,
            cta_id: *cta_id,
            clock: *clock,
            sm_id: *sm_id,
        })
        .collect()
}

/// Greedily fold consecutive stride-`size` accesses from the same instruction,
/// warp and CTA into runs. Records that do not extend a run pass through in
/// their original order.
pub fn compress(records: &[Record]) -> Vec<Record> {
    let mut out = Vec::with_capacity(records.len());
    let mut index = 0;
    while index < records.len() {
        let &Record::MemoryAccess {
            kind,
            address,
            size,
            instruction_id,
            warp_id,
            cta_id,
            clock,
            sm_id,
        } = &records[index]
        else {
            out.push(records[index].clone());
            index += 1;
            continue;
        };
        if size == 0 {
            out.push(records[index].clone());
            index += 1;
            continue;
        }

        let mut len = 1usize;
        while index + len < records.len() {
            let &Record::MemoryAccess {
                kind: next_kind,
                address: next_address,
                size: next_size,
                instruction_id: next_instruction_id,
                warp_id: next_warp_id,
                cta_id: next_cta_id,
                sm_id: next_sm_id,
                ..
            } = &records[index + len]
            else {
                break;
            };
            let expected = address.wrapping_add(len as u64 * u64::from(size));
            if next_kind != kind
                || next_size != size
                || next_instruction_id != instruction_id
                || next_warp_id != warp_id
                || next_cta_id != cta_id
                || next_sm_id != sm_id
                || next_address != expected
            {
                break;
            }
            len += 1;
        }

        if len < 2 {
            out.push(records[index].clone());
            index += 1;
            continue;
        }

        let mut entries = Vec::new();
        let mut emitted = 0usize;
        while emitted < len {
            let count = (len - emitted).min(usize::from(u8::MAX));
            entries.push(RunEntry {
                address: address.wrapping_add(emitted as u64 * u64::from(size)),
                offset: i32::from(size),
                count: count as u8,
            });
            emitted += count;
        }
        let run = Record::AccessRun {
            kind,
            base_address: address,
            unit_size: size,
            entries,
            instruction_id,
            warp_id,
            cta_id,
            clock,
            sm_id,
        };
        out.extend(split(&run, MAX_RUN_ENTRIES));
        index += len;
    }
    out
}
