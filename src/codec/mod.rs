//! Payload codecs for SPC subfiles.
//!
//! # Identity rules
//! A subfile's codec is chosen by its on-disk compression state, never by
//! sniffing the payload.  Only two states carry a codec this build can run:
//!
//!   - `Uncompressed` → [`StoredCodec`], bytes kept verbatim.
//!   - `Compressed`   → [`DeflateCodec`], raw deflate (no zlib/gzip framing).
//!
//! `ExternalOrUnsupported` and unknown states have no codec; their stored
//! bytes are carried untouched and [`get_codec`] returns `None` for them.
//!
//! # Size contract
//! Every decode is checked against the uncompressed size declared in the
//! subfile table.  A mismatch is corruption, not a warning.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::entry::CompressionState;

/// Default deflate level used when saving.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
/// Largest up-front output reservation, as a multiple of the input size.
const MAX_RESERVE_RATIO: usize = 4;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    /// The compressed stream is structurally invalid.
    #[error("Corrupt compressed stream: {0}")]
    CorruptStream(String),
    /// The stream decoded cleanly but to the wrong number of bytes.
    #[error("Decompressed length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn state(&self) -> CompressionState;
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct StoredCodec;
impl Codec for StoredCodec {
    fn state(&self) -> CompressionState { CompressionState::Uncompressed }
    fn compress(&self, data: &[u8], _: u32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        check_len(expected_len, data.len())?;
        Ok(data.to_vec())
    }
}

pub struct DeflateCodec;
impl Codec for DeflateCodec {
    fn state(&self) -> CompressionState { CompressionState::Compressed }
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
        compress(data, level)
    }
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        decompress(data, expected_len)
    }
}

/// Raw-deflate `data` at `level` (clamped to 0..=9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::new(level.min(9)),
    );
    encoder.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
}

/// Inflate `data`, failing unless it produces exactly `expected_len` bytes.
///
/// At most `expected_len + 1` bytes are ever materialised, so a hostile
/// stream that inflates far past its declared size is caught without
/// allocating the whole thing.  The up-front reservation is bounded by the
/// input size too, since `expected_len` comes from an untrusted table.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let reserve = expected_len.min(data.len().saturating_mul(MAX_RESERVE_RATIO).max(4096));
    let mut out = Vec::with_capacity(reserve);
    DeflateDecoder::new(data)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::CorruptStream(e.to_string()))?;
    check_len(expected_len, out.len())?;
    Ok(out)
}

fn check_len(expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::LengthMismatch { expected, actual });
    }
    Ok(())
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a compression state to a built-in codec.
///
/// Returns `None` for states whose bytes must be carried opaquely.
pub fn get_codec(state: CompressionState) -> Option<Box<dyn Codec>> {
    match state {
        CompressionState::Uncompressed => Some(Box::new(StoredCodec)),
        CompressionState::Compressed   => Some(Box::new(DeflateCodec)),
        CompressionState::ExternalOrUnsupported | CompressionState::UnknownVariant(_) => None,
    }
}
