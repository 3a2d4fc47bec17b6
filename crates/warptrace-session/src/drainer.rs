//! The consumer side of a trace session.
//!
//! One drainer per session round-robins the shards, moving committed records
//! into the trace stream with a bounded budget per shard per pass, and weaves
//! kernel-announce frames into the stream at the points the host signals a
//! kernel switch.

use std::io::Write;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use warptrace_format::{runs, Record, TraceWriter, Version};
use warptrace_ring::ShardedRing;

use crate::error::Result;

/// Records drained per shard per pass before moving on to the next shard.
pub const DEFAULT_DRAIN_BUDGET: usize = 256;

/// How long an idle drainer blocks on the control channel before re-polling
/// the shards.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// End-of-session accounting, returned by [`crate::TraceSession::finish`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Committed records persisted to the stream. Each is written exactly once.
    pub records: u64,
    /// Kernel-announce frames written.
    pub kernels: u64,
    /// Reservations whose group never completed its writes by teardown.
    pub dropped: u64,
    /// Times a producer group found its shard full and had to wait.
    pub stalls: u64,
}

pub(crate) enum Control {
    Kernel {
        name: String,
        block_size: u16,
        /// Dropped (or signalled) once the frame is in the stream, releasing
        /// the announcing host thread.
        ack: Sender<()>,
    },
    Stop,
}

pub(crate) struct Drainer<W: Write> {
    ring: Arc<ShardedRing>,
    writer: TraceWriter<W>,
    budget: usize,
    scratch: Vec<Record>,
    records: u64,
    kernels: u64,
}

impl<W: Write> Drainer<W> {
    pub(crate) fn new(ring: Arc<ShardedRing>, writer: TraceWriter<W>, budget: usize) -> Self {
        Self {
            ring,
            writer,
            budget,
            scratch: Vec::new(),
            records: 0,
            kernels: 0,
        }
    }

    fn drain_shard(&mut self, shard: usize, max: usize) -> Result<usize> {
        self.scratch.clear();
        let drained = self.ring.drain(shard, max, &mut self.scratch)?;
        if drained == 0 {
            return Ok(0);
        }
        if self.writer.version() == Version::V3 {
            for record in runs::compress(&self.scratch) {
                self.writer.write_record(&record)?;
            }
        } else {
            for record in &self.scratch {
                self.writer.write_record(record)?;
            }
        }
        self.records += drained as u64;
        Ok(drained)
    }

    /// One budgeted round-robin over every shard.
    fn pass(&mut self) -> Result<usize> {
        let mut drained = 0;
        for shard in 0..self.ring.layout().shards() {
            drained += self.drain_shard(shard, self.budget)?;
        }
        Ok(drained)
    }

    /// Drain until every shard is empty (or stuck behind an incomplete slot).
    fn flush_backlog(&mut self) -> Result<()> {
        while self.pass()? > 0 {}
        Ok(())
    }

    /// Persist the backlog of the previous kernel, then mark the switch.
    fn announce(&mut self, name: &str, block_size: u16, ack: Sender<()>) -> Result<()> {
        self.flush_backlog()?;
        self.writer.write_kernel(name, block_size)?;
        self.kernels += 1;
        tracing::debug!(kernel = name, block_size, "kernel switch");
        let _ = ack.send(());
        Ok(())
    }

    /// Final drain of every shard, then summarize.
    ///
    /// Reservations still incomplete at this point are counted as dropped,
    /// never persisted half-written.
    fn finish(&mut self) -> Result<SessionSummary> {
        self.flush_backlog()?;
        self.writer.flush()?;
        let dropped = (0..self.ring.layout().shards())
            .map(|shard| u64::from(self.ring.in_flight(shard)))
            .sum();
        let summary = SessionSummary {
            records: self.records,
            kernels: self.kernels,
            dropped,
            stalls: self.ring.total_stalls(),
        };
        if summary.dropped > 0 {
            tracing::warn!(
                dropped = summary.dropped,
                "reservations incomplete at teardown were dropped"
            );
        }
        tracing::info!(
            records = summary.records,
            kernels = summary.kernels,
            stalls = summary.stalls,
            "trace session finished"
        );
        Ok(summary)
    }
}

pub(crate) fn run<W: Write>(
    mut drainer: Drainer<W>,
    control: Receiver<Control>,
) -> Result<SessionSummary> {
    match drive(&mut drainer, &control) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            // An I/O failure is fatal to the session; keep whatever part of
            // the stream already made it out.
            tracing::error!("trace drainer failed: {err}");
            let _ = drainer.writer.flush();
            Err(err)
        }
    }
}

fn drive<W: Write>(
    drainer: &mut Drainer<W>,
    control: &Receiver<Control>,
) -> Result<SessionSummary> {
    loop {
        loop {
            match control.try_recv() {
                Ok(Control::Kernel {
                    name,
                    block_size,
                    ack,
                }) => drainer.announce(&name, block_size, ack)?,
                Ok(Control::Stop) => return drainer.finish(),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return drainer.finish(),
            }
        }
        if drainer.pass()? == 0 {
            // Idle: block on the control channel instead of spinning on
            // empty shards.
            match control.recv_timeout(IDLE_WAIT) {
                Ok(Control::Kernel {
                    name,
                    block_size,
                    ack,
                }) => drainer.announce(&name, block_size, ack)?,
                Ok(Control::Stop) => return drainer.finish(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return drainer.finish(),
            }
        }
    }
}
