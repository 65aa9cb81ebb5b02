use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::srd::SrdError;

/// Crate-level error for archive load/save and subfile mutation.
#[derive(Error, Debug)]
pub enum SpcError {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),
    #[error("Subfile table corrupt: {0}")]
    TableCorrupt(String),
    #[error("Truncated stream: {context} declares {declared} bytes, only {available} remain")]
    TruncatedStream {
        context:   String,
        declared:  u64,
        available: u64,
    },
    #[error("Corrupt payload in subfile '{name}': {source}")]
    CorruptPayload {
        name:   String,
        #[source]
        source: CodecError,
    },
    #[error("Subfile not found: {0}")]
    NotFound(String),
    #[error("Source {} still unavailable after {waited:?}: {source}", .path.display())]
    SourceUnavailable {
        path:   PathBuf,
        waited: Duration,
        #[source]
        source: io::Error,
    },
    #[error("Invalid subfile name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("SRD error: {0}")]
    Srd(#[from] SrdError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = SpcError> = std::result::Result<T, E>;
