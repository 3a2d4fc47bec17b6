//! Session lifecycle: buffer allocation, the drainer thread, producer handles.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use warptrace_format::{Record, TraceWriter, Version};
use warptrace_ring::{ShardLayout, ShardedRing, WriteError};

use crate::drainer::{self, Control, Drainer, SessionSummary, DEFAULT_DRAIN_BUDGET};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub layout: ShardLayout,
    pub version: Version,
    /// Records drained per shard per pass.
    pub drain_budget: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            layout: ShardLayout::default(),
            version: Version::V3,
            drain_budget: DEFAULT_DRAIN_BUDGET,
        }
    }
}

/// One tracing session: a sharded ring allocated once, one drainer thread,
/// and any number of producer handles.
///
/// Stop all producers before calling [`finish`](Self::finish); reservations
/// still incomplete at that point are dropped (and counted), never persisted
/// half-written.
pub struct TraceSession {
    ring: Arc<ShardedRing>,
    control: Sender<Control>,
    handle: Option<JoinHandle<Result<SessionSummary>>>,
}

impl TraceSession {
    /// Allocate the session's buffers and spawn its drainer over `sink`.
    pub fn spawn<W: Write + Send + 'static>(sink: W, config: SessionConfig) -> Result<Self> {
        let writer = TraceWriter::new(sink, config.version)?;
        let ring = Arc::new(ShardedRing::new(config.layout));
        let (control, control_rx) = mpsc::channel();
        let drainer = Drainer::new(ring.clone(), writer, config.drain_budget);
        let handle = std::thread::Builder::new()
            .name("warptrace-drainer".into())
            .spawn(move || drainer::run(drainer, control_rx))?;
        tracing::info!(
            shards = config.layout.shards(),
            slots_per_shard = config.layout.slots_per_shard(),
            "trace session started"
        );
        Ok(Self {
            ring,
            control,
            handle: Some(handle),
        })
    }

    /// Spawn a session writing to a buffered file at `path`.
    pub fn create(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let file = File::create(path)?;
        Self::spawn(BufWriter::new(file), config)
    }

    pub fn ring(&self) -> &Arc<ShardedRing> {
        &self.ring
    }

    /// Handle for the producer groups of one hardware processor.
    pub fn producer(&self, processor_id: u32) -> Producer {
        Producer {
            ring: self.ring.clone(),
            shard: self.ring.layout().shard_for(processor_id),
        }
    }

    /// Signal a kernel switch.
    ///
    /// Call before launching the kernel's producers. Blocks until the drainer
    /// has persisted the previous kernel's backlog and the announce frame, so
    /// records produced after this call can never precede the frame in the
    /// stream.
    pub fn announce_kernel(&self, name: &str, block_size: u16) {
        let (ack, placed) = mpsc::channel();
        let announced = self.control.send(Control::Kernel {
            name: name.to_string(),
            block_size,
            ack,
        });
        if announced.is_err() {
            tracing::debug!(kernel = name, "kernel announced after drainer exit");
            return;
        }
        // A drainer that dies before placing the frame drops the ack sender,
        // which releases this wait.
        let _ = placed.recv();
    }

    /// Tear the session down: one final drain of every shard, then close the
    /// stream and report.
    ///
    /// Non-zero drop counts are reported (and logged) even on clean shutdown.
    pub fn finish(mut self) -> Result<SessionSummary> {
        let _ = self.control.send(Control::Stop);
        let handle = self
            .handle
            .take()
            .expect("finish consumes the session; the handle is present");
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(SessionError::DrainerPanicked),
        }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        // Finish not called: ask the drainer to wind down, but don't block.
        if self.handle.is_some() {
            let _ = self.control.send(Control::Stop);
        }
    }
}

/// Producer-side handle, pinned to one shard.
///
/// Cheap to clone; one handle is shared by all lockstep groups of a
/// processor.
#[derive(Clone)]
pub struct Producer {
    ring: Arc<ShardedRing>,
    shard: usize,
}

impl Producer {
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Append one lockstep group's records as a single all-or-nothing batch.
    ///
    /// Blocks (spinning) while the shard is full; the wait is counted in the
    /// session's stall diagnostics.
    pub fn write_batch(&self, records: &[Record]) -> std::result::Result<(), WriteError> {
        self.ring.reserve_and_write(self.shard, records).map(|_| ())
    }

    /// Append a single record.
    pub fn write(&self, record: &Record) -> std::result::Result<(), WriteError> {
        self.write_batch(std::slice::from_ref(record))
    }
}
