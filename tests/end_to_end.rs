//! Whole-pipeline test: threaded producer groups → sharded ring → drainer →
//! trace file → reader.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use warptrace_format::{AccessKind, CtaId, Frame, Record, TraceReader, Version};
use warptrace_ring::ShardLayout;
use warptrace_session::{SessionConfig, TraceSession};

const PRODUCERS: u64 = 8;
const GROUPS_PER_PRODUCER: u64 = 200;
const GROUP_SIZE: u64 = 4;

fn group_records(pid: u64, group: u64) -> Vec<Record> {
    (0..GROUP_SIZE)
        .map(|lane| {
            let seq = group * GROUP_SIZE + lane;
            Record::MemoryAccess {
                kind: AccessKind::Store,
                // Producer and sequence packed into the address for later
                // identification; strides are irregular so nothing folds.
                address: (pid << 48) | (seq << 8),
                size: 4,
                instruction_id: 9,
                warp_id: group as u16,
                cta_id: CtaId::new(pid as u32, 0, 0),
                clock: seq,
                sm_id: pid as u8,
            }
        })
        .collect()
}

#[test]
fn every_committed_record_is_persisted_exactly_once_in_shard_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.trace");

    let config = SessionConfig {
        layout: ShardLayout::new(4, 32),
        version: Version::V2,
        ..SessionConfig::default()
    };
    let session = TraceSession::create(&path, config).unwrap();
    session.announce_kernel("saxpy", 256);

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|pid| {
            let producer = session.producer(pid as u32);
            std::thread::spawn(move || {
                for group in 0..GROUPS_PER_PRODUCER {
                    producer.write_batch(&group_records(pid, group)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let summary = session.finish().unwrap();
    let total = PRODUCERS * GROUPS_PER_PRODUCER * GROUP_SIZE;
    assert_eq!(summary.records, total);
    assert_eq!(summary.kernels, 1);
    assert_eq!(summary.dropped, 0);

    let mut bytes = Vec::new();
    File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
    let mut reader = TraceReader::open(std::io::Cursor::new(bytes)).unwrap();

    assert_eq!(
        reader.next().unwrap(),
        Frame::Kernel {
            name: "saxpy".to_string(),
            block_size: 256,
        }
    );

    // Shards interleave arbitrarily in the file, but each producer writes to
    // a single shard and shards drain in reservation order, so every
    // producer's sequence numbers must appear strictly increasing.
    let mut next_seq: HashMap<u64, u64> = HashMap::new();
    let mut seen = 0u64;
    loop {
        match reader.next().unwrap() {
            Frame::Record(Record::MemoryAccess { address, .. }) => {
                let pid = address >> 48;
                let seq = (address >> 8) & 0xFFFF_FFFF_FF;
                let expected = next_seq.entry(pid).or_insert(0);
                assert_eq!(seq, *expected, "producer {pid} reordered or duplicated");
                *expected += 1;
                seen += 1;
            }
            Frame::Record(other) => panic!("unexpected record {other:?}"),
            Frame::Kernel { .. } => panic!("only one kernel was announced"),
            Frame::Eof => break,
        }
    }
    assert_eq!(seen, total);
    for pid in 0..PRODUCERS {
        assert_eq!(next_seq[&pid], GROUPS_PER_PRODUCER * GROUP_SIZE);
    }
}

#[test]
fn backpressured_producers_make_progress_under_a_slow_drainer() {
    // Shards far smaller than the workload: producers must repeatedly stall
    // on full shards and be released by the drainer.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.trace");

    let config = SessionConfig {
        layout: ShardLayout::new(1, 8),
        version: Version::V3,
        drain_budget: 2,
        ..SessionConfig::default()
    };
    let session = TraceSession::create(&path, config).unwrap();

    let producer = session.producer(0);
    let writer = std::thread::spawn(move || {
        for group in 0..500u64 {
            producer.write_batch(&group_records(1, group)).unwrap();
        }
    });
    writer.join().unwrap();

    let summary = session.finish().unwrap();
    assert_eq!(summary.records, 500 * GROUP_SIZE);
    assert_eq!(summary.dropped, 0);
    assert!(summary.stalls > 0, "an 8-slot shard never filled up");
}
