//! Framed trace stream: magic header, kernel-announce frames, record frames.
//!
//! Layout:
//! - 10-byte magic (version byte + identity bytes).
//! - Kernel frame: one little-endian 64-bit word whose most significant byte
//!   is [`KERNEL_SENTINEL`], packing `name_len << 48 | block_size << 32`,
//!   followed by `name_len` raw name bytes with no terminator.
//! - Record frame: the codec wire form (its leading word is never
//!   sentinel-tagged).
//!
//! The reader is lazy, forward-only and single-pass; reopen to restart.

use core::fmt;
use std::io::{self, Read, Write};

use crate::codec::{self, DecodeError, EncodeError, KERNEL_SENTINEL, RECORD_FIXED_BYTES};
use crate::record::Record;
use crate::runs;

pub const MAGIC_LEN: usize = 10;

const MAGIC_TAIL: &[u8; 9] = b"WARPTRACE";
const VERSION_BYTE_V2: u8 = 0x19;
const VERSION_BYTE_V3: u8 = 0x1A;

/// Trace stream format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Uncompressed: every access is an individual record.
    V2,
    /// Compression-capable: access runs are allowed.
    V3,
}

impl Version {
    pub fn magic(self) -> [u8; MAGIC_LEN] {
        let mut magic = [0u8; MAGIC_LEN];
        magic[0] = match self {
            Version::V2 => VERSION_BYTE_V2,
            Version::V3 => VERSION_BYTE_V3,
        };
        magic[1..].copy_from_slice(MAGIC_TAIL);
        magic
    }

    fn from_magic(magic: &[u8; MAGIC_LEN]) -> Option<Self> {
        if &magic[1..] != MAGIC_TAIL {
            return None;
        }
        match magic[0] {
            VERSION_BYTE_V2 => Some(Version::V2),
            VERSION_BYTE_V3 => Some(Version::V3),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum TraceWriteError {
    Io(io::Error),
    Encode(EncodeError),
    /// Kernel names are length-prefixed with a single byte.
    KernelNameTooLong(usize),
}

impl fmt::Display for TraceWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceWriteError::Io(err) => write!(f, "io error: {err}"),
            TraceWriteError::Encode(err) => write!(f, "record encoding failed: {err}"),
            TraceWriteError::KernelNameTooLong(len) => {
                write!(f, "kernel name of {len} bytes exceeds 255")
            }
        }
    }
}

impl std::error::Error for TraceWriteError {}

impl From<io::Error> for TraceWriteError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for TraceWriteError {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

#[derive(Debug)]
pub enum TraceReadError {
    Io(io::Error),
    /// The source does not start with a known magic.
    BadMagic,
    /// The source ended inside the frame starting at `offset`.
    Truncated { offset: u64 },
    /// The frame starting at `offset` is structurally invalid.
    Corrupt { offset: u64, reason: &'static str },
}

impl fmt::Display for TraceReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceReadError::Io(err) => write!(f, "io error: {err}"),
            TraceReadError::BadMagic => write!(f, "not a trace stream (bad magic)"),
            TraceReadError::Truncated { offset } => {
                write!(f, "truncated frame at byte {offset}")
            }
            TraceReadError::Corrupt { offset, reason } => {
                write!(f, "corrupt frame at byte {offset}: {reason}")
            }
        }
    }
}

impl std::error::Error for TraceReadError {}

/// One decoded stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// All records that follow belong to this kernel, until the next kernel
    /// frame.
    Kernel { name: String, block_size: u16 },
    Record(Record),
    /// Clean end of stream at a frame boundary.
    Eof,
}

/// Sequential trace writer over any byte sink.
pub struct TraceWriter<W: Write> {
    sink: W,
    version: Version,
    scratch: Vec<u8>,
}

impl<W: Write> TraceWriter<W> {
    /// Write the magic for `version` and return the writer.
    pub fn new(mut sink: W, version: Version) -> Result<Self, TraceWriteError> {
        sink.write_all(&version.magic())?;
        Ok(Self {
            sink,
            version,
            scratch: Vec::with_capacity(RECORD_FIXED_BYTES),
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Announce a kernel switch; subsequent records belong to it.
    pub fn write_kernel(&mut self, name: &str, block_size: u16) -> Result<(), TraceWriteError> {
        let name = name.as_bytes();
        if name.len() > 255 {
            return Err(TraceWriteError::KernelNameTooLong(name.len()));
        }
        debug_assert_eq!(KERNEL_SENTINEL, 0);
        let word = ((name.len() as u64) << 48) | (u64::from(block_size) << 32);
        self.sink.write_all(&word.to_le_bytes())?;
        self.sink.write_all(name)?;
        Ok(())
    }

    /// Persist one record.
    ///
    /// On an uncompressed (version 2) stream an access run is expanded into
    /// its individual accesses instead of being rejected.
    pub fn write_record(&mut self, record: &Record) -> Result<(), TraceWriteError> {
        if self.version == Version::V2 {
            if let Record::AccessRun { .. } = record {
                for access in runs::expand(record) {
                    self.write_one(&access)?;
                }
                return Ok(());
            }
        }
        self.write_one(record)
    }

    fn write_one(&mut self, record: &Record) -> Result<(), TraceWriteError> {
        self.scratch.clear();
        codec::encode_into(record, &mut self.scratch)?;
        self.sink.write_all(&self.scratch)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TraceWriteError> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Forward-only trace reader over any byte source.
pub struct TraceReader<R: Read> {
    source: R,
    version: Version,
    offset: u64,
}

impl<R: Read> TraceReader<R> {
    /// Validate the magic and return a reader positioned at the first frame.
    pub fn open(mut source: R) -> Result<Self, TraceReadError> {
        let mut magic = [0u8; MAGIC_LEN];
        if read_full(&mut source, &mut magic).map_err(TraceReadError::Io)? != MAGIC_LEN {
            return Err(TraceReadError::BadMagic);
        }
        let version = Version::from_magic(&magic).ok_or(TraceReadError::BadMagic)?;
        Ok(Self {
            source,
            version,
            offset: MAGIC_LEN as u64,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Byte offset of the next frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next frame.
    ///
    /// Returns [`Frame::Eof`] only at a clean frame boundary; a source that
    /// ends mid-frame fails with the byte offset of the offending frame.
    pub fn next(&mut self) -> Result<Frame, TraceReadError> {
        let frame_start = self.offset;
        let mut word = [0u8; 8];
        let got = read_full(&mut self.source, &mut word).map_err(TraceReadError::Io)?;
        if got == 0 {
            return Ok(Frame::Eof);
        }
        if got < word.len() {
            return Err(TraceReadError::Truncated {
                offset: frame_start,
            });
        }
        self.offset += word.len() as u64;
        let word0 = u64::from_le_bytes(word);

        if (word0 >> 56) as u8 == KERNEL_SENTINEL {
            let name_len = ((word0 >> 48) & 0xFF) as usize;
            let block_size = ((word0 >> 32) & 0xFFFF) as u16;
            let mut name = vec![0u8; name_len];
            self.read_frame_bytes(&mut name, frame_start)?;
            let name = String::from_utf8(name).map_err(|_| TraceReadError::Corrupt {
                offset: frame_start,
                reason: "kernel name is not UTF-8",
            })?;
            return Ok(Frame::Kernel { name, block_size });
        }

        let total = codec::record_total_len(word0);
        let mut buf = vec![0u8; total];
        buf[..8].copy_from_slice(&word);
        self.read_frame_bytes(&mut buf[8..], frame_start)?;
        let (record, _) = codec::decode(&buf).map_err(|err| match err {
            DecodeError::Truncated => TraceReadError::Truncated {
                offset: frame_start,
            },
            DecodeError::UnknownTag(_) => TraceReadError::Corrupt {
                offset: frame_start,
                reason: "unknown record tag",
            },
            DecodeError::Corrupt(reason) => TraceReadError::Corrupt {
                offset: frame_start,
                reason,
            },
        })?;
        if self.version == Version::V2 {
            if let Record::AccessRun { .. } = record {
                return Err(TraceReadError::Corrupt {
                    offset: frame_start,
                    reason: "access run in an uncompressed stream",
                });
            }
        }
        Ok(Frame::Record(record))
    }

    fn read_frame_bytes(
        &mut self,
        buf: &mut [u8],
        frame_start: u64,
    ) -> Result<(), TraceReadError> {
        let got = read_full(&mut self.source, buf).map_err(TraceReadError::Io)?;
        if got < buf.len() {
            return Err(TraceReadError::Truncated {
                offset: frame_start,
            });
        }
        self.offset += buf.len() as u64;
        Ok(())
    }
}

/// Read until `buf` is full or the source reaches EOF; returns bytes read.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
