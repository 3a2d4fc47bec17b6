use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use warptrace_format::{AccessKind, CtaId, Frame, Record, TraceReader, Version};
use warptrace_ring::ShardLayout;
use warptrace_session::{SessionConfig, SessionError, TraceSession};

/// In-memory sink that stays readable after the drainer thread owns the
/// writer.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that fails after `limit` bytes, emulating a full disk.
struct FailingSink {
    written: usize,
    limit: usize,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() > self.limit {
            return Err(io::Error::other("disk full"));
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn access(address: u64, clock: u64) -> Record {
    Record::MemoryAccess {
        kind: AccessKind::Load,
        address,
        size: 4,
        instruction_id: 3,
        warp_id: 1,
        cta_id: CtaId::new(0, 0, 0),
        clock,
        sm_id: 0,
    }
}

fn wait_until_drained(session: &TraceSession) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let backlog: u32 = (0..session.ring().layout().shards())
            .map(|shard| session.ring().in_flight(shard))
            .sum();
        if backlog == 0 {
            return;
        }
        assert!(Instant::now() < deadline, "drainer did not catch up");
        std::thread::yield_now();
    }
}

#[test]
fn kernel_frames_partition_the_record_stream() {
    let sink = SharedBuf::default();
    let config = SessionConfig {
        layout: ShardLayout::new(2, 16),
        version: Version::V2,
        ..SessionConfig::default()
    };
    let session = TraceSession::spawn(sink.clone(), config).unwrap();
    let producer = session.producer(0);

    session.announce_kernel("vecadd", 128);
    producer
        .write_batch(&[access(0x100, 1), access(0x200, 2)])
        .unwrap();
    wait_until_drained(&session);

    session.announce_kernel("reduce", 256);
    producer.write(&access(0x300, 3)).unwrap();
    wait_until_drained(&session);

    let summary = session.finish().unwrap();
    assert_eq!(summary.records, 3);
    assert_eq!(summary.kernels, 2);
    assert_eq!(summary.dropped, 0);

    let mut reader = TraceReader::open(Cursor::new(sink.contents())).unwrap();
    let mut frames = Vec::new();
    loop {
        match reader.next().unwrap() {
            Frame::Eof => break,
            frame => frames.push(frame),
        }
    }
    assert_eq!(
        frames,
        vec![
            Frame::Kernel {
                name: "vecadd".to_string(),
                block_size: 128,
            },
            Frame::Record(access(0x100, 1)),
            Frame::Record(access(0x200, 2)),
            Frame::Kernel {
                name: "reduce".to_string(),
                block_size: 256,
            },
            Frame::Record(access(0x300, 3)),
        ]
    );
}

#[test]
fn incomplete_reservations_are_counted_dropped_on_clean_shutdown() {
    let sink = SharedBuf::default();
    let config = SessionConfig {
        layout: ShardLayout::new(1, 16),
        version: Version::V2,
        ..SessionConfig::default()
    };
    let session = TraceSession::spawn(sink.clone(), config).unwrap();
    let producer = session.producer(0);

    producer.write(&access(0x100, 1)).unwrap();
    wait_until_drained(&session);

    // A group reserves two slots and dies before writing them.
    let reservation = session.ring().reserve(0, 2);
    assert_eq!(reservation.len(), 2);

    let summary = session.finish().unwrap();
    assert_eq!(summary.records, 1);
    assert_eq!(summary.dropped, 2);

    // The completed record still made it out intact.
    let mut reader = TraceReader::open(Cursor::new(sink.contents())).unwrap();
    assert_eq!(reader.next().unwrap(), Frame::Record(access(0x100, 1)));
    assert_eq!(reader.next().unwrap(), Frame::Eof);
}

#[test]
fn compression_capable_sessions_fold_consecutive_accesses() {
    let sink = SharedBuf::default();
    let config = SessionConfig {
        layout: ShardLayout::new(1, 64),
        version: Version::V3,
        ..SessionConfig::default()
    };
    let session = TraceSession::spawn(sink.clone(), config).unwrap();
    let producer = session.producer(0);

    let accesses: Vec<Record> = (0..8).map(|i| access(0x1000 + i * 4, i)).collect();
    producer.write_batch(&accesses).unwrap();
    wait_until_drained(&session);
    let summary = session.finish().unwrap();
    assert_eq!(summary.records, 8);

    // The stream may carry runs; expanding them recovers the addresses in
    // order.
    let mut reader = TraceReader::open(Cursor::new(sink.contents())).unwrap();
    let mut addresses = Vec::new();
    let mut frames = 0;
    loop {
        match reader.next().unwrap() {
            Frame::Record(record) => {
                frames += 1;
                for expanded in warptrace_format::runs::expand(&record) {
                    match expanded {
                        Record::MemoryAccess { address, .. } => addresses.push(address),
                        other => panic!("unexpected record {other:?}"),
                    }
                }
            }
            Frame::Kernel { .. } => panic!("no kernel was announced"),
            Frame::Eof => break,
        }
    }
    assert!(frames < 8, "consecutive accesses were not folded");
    let expected: Vec<u64> = (0..8).map(|i| 0x1000 + i * 4).collect();
    assert_eq!(addresses, expected);
}

#[test]
fn drainer_io_failure_is_fatal_to_the_session() {
    // Room for the magic, nothing else.
    let sink = FailingSink {
        written: 0,
        limit: 16,
    };
    let session = TraceSession::spawn(
        sink,
        SessionConfig {
            layout: ShardLayout::new(1, 16),
            version: Version::V2,
            ..SessionConfig::default()
        },
    )
    .unwrap();
    let producer = session.producer(0);
    producer.write(&access(0x100, 1)).unwrap();

    match session.finish() {
        Err(SessionError::Stream(_)) => {}
        other => panic!("expected a fatal stream error, got {other:?}"),
    }
}

#[test]
fn spawning_on_an_unwritable_sink_fails_immediately() {
    let sink = FailingSink {
        written: 0,
        limit: 0,
    };
    assert!(matches!(
        TraceSession::spawn(sink, SessionConfig::default()),
        Err(SessionError::Stream(_))
    ));
}
