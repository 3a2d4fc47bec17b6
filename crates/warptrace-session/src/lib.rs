#![forbid(unsafe_code)]

//! Trace session lifecycle: one drainer per session.
//!
//! A [`TraceSession`] allocates the sharded ring once, spawns the single
//! drainer thread that moves committed records into a
//! [`warptrace_format::TraceWriter`], and hands out per-processor
//! [`Producer`] handles. Kernel switches announced by the host become
//! kernel frames at the right point in the stream; teardown drains every
//! shard one last time and accounts for anything a producer group left
//! incomplete.

mod drainer;
mod error;
mod session;

pub use drainer::{SessionSummary, DEFAULT_DRAIN_BUDGET};
pub use error::{Result, SessionError};
pub use session::{Producer, SessionConfig, TraceSession};
