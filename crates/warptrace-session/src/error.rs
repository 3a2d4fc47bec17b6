use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("trace stream write failed: {0}")]
    Stream(#[from] warptrace_format::TraceWriteError),

    #[error("corrupt slot while draining: {0}")]
    Drain(#[from] warptrace_format::DecodeError),

    #[error("drainer thread panicked")]
    DrainerPanicked,
}
