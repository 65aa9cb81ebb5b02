use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Write};

use crate::error::SpcError;

/// Longest subfile name (in bytes) the table accepts.
pub const MAX_NAME_LEN: usize = 0xFF;
pub const DEFAULT_ENTRY_FLAGS: u16 = 4;
/// Smallest possible table row: fixed fields, reserved block, 16-byte name slot.
pub const MIN_ROW_SIZE: usize = 0x30;
pub const ALIGNMENT: usize = 0x10;

/// Zero bytes needed after `len` bytes to reach the next 16-byte boundary.
#[inline]
pub fn padding_for(len: usize) -> usize {
    (ALIGNMENT - len % ALIGNMENT) % ALIGNMENT
}

// ── CompressionState ─────────────────────────────────────────────────────────

/// Per-subfile storage code.  The raw value is not self-describing, so codes
/// this build does not know are kept as [`CompressionState::UnknownVariant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompressionState {
    Uncompressed,
    Compressed,
    ExternalOrUnsupported,
    UnknownVariant(u16),
}

impl CompressionState {
    pub fn raw(self) -> u16 {
        match self {
            CompressionState::Uncompressed          => 1,
            CompressionState::Compressed            => 2,
            CompressionState::ExternalOrUnsupported => 3,
            CompressionState::UnknownVariant(raw)   => raw,
        }
    }

    /// True when the stored bytes are decoded into the in-memory payload.
    pub fn is_decodable(self) -> bool {
        matches!(self, CompressionState::Uncompressed | CompressionState::Compressed)
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "uncompressed" => Some(CompressionState::Uncompressed),
            "deflate" | "compressed" => Some(CompressionState::Compressed),
            _ => None,
        }
    }
}

impl From<u16> for CompressionState {
    fn from(raw: u16) -> Self {
        match raw {
            1 => CompressionState::Uncompressed,
            2 => CompressionState::Compressed,
            3 => CompressionState::ExternalOrUnsupported,
            x => CompressionState::UnknownVariant(x),
        }
    }
}

impl fmt::Display for CompressionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionState::Uncompressed          => f.write_str("Uncompressed"),
            CompressionState::Compressed            => f.write_str("Compressed"),
            CompressionState::ExternalOrUnsupported => f.write_str("N/A (External)"),
            CompressionState::UnknownVariant(raw)   => write!(f, "N/A (Unknown: {raw})"),
        }
    }
}

// ── Table row ────────────────────────────────────────────────────────────────

/// One row of the subfile table, exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub state:             CompressionState,
    pub flags:             u16,
    pub stored_size:       u32,
    pub uncompressed_size: u32,
    pub name:              String,
}

impl TableRow {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let name = self.name.as_bytes();
        writer.write_u16::<LittleEndian>(self.state.raw())?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.stored_size)?;
        writer.write_u32::<LittleEndian>(self.uncompressed_size)?;
        writer.write_u32::<LittleEndian>(name.len() as u32)?;
        writer.write_all(&[0u8; 0x10])?;
        writer.write_all(name)?;
        writer.write_all(&[0u8; ALIGNMENT][..1 + padding_for(name.len() + 1)])?;
        Ok(())
    }

    /// Read row `index`.  Any short read or bad name is `TableCorrupt`.
    pub fn read<R: Read>(mut reader: R, index: usize) -> Result<Self, SpcError> {
        let corrupt = |what: String| SpcError::TableCorrupt(format!("row {index}: {what}"));
        let short = |e: io::Error| corrupt(format!("row cut short ({e})"));

        let state = CompressionState::from(reader.read_u16::<LittleEndian>().map_err(short)?);
        let flags = reader.read_u16::<LittleEndian>().map_err(short)?;
        let stored_size = reader.read_u32::<LittleEndian>().map_err(short)?;
        let uncompressed_size = reader.read_u32::<LittleEndian>().map_err(short)?;
        let name_len = reader.read_u32::<LittleEndian>().map_err(short)? as usize;
        let mut reserved = [0u8; 0x10];
        reader.read_exact(&mut reserved).map_err(short)?;

        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(corrupt(format!("name length {name_len} out of range")));
        }
        let mut slot = vec![0u8; name_len + 1 + padding_for(name_len + 1)];
        reader.read_exact(&mut slot).map_err(short)?;
        if slot[name_len] != 0 {
            return Err(corrupt("name is not NUL-terminated".into()));
        }
        slot.truncate(name_len);
        let name = String::from_utf8(slot).map_err(|_| corrupt("name is not valid UTF-8".into()))?;
        validate_name(&name).map_err(|e| corrupt(e.to_string()))?;

        Ok(Self { state, flags, stored_size, uncompressed_size, name })
    }

    /// Bytes this row occupies in the table.
    pub fn encoded_len(&self) -> usize {
        let n = self.name.len() + 1;
        0x20 + n + padding_for(n)
    }
}

/// Structural checks every stored name must pass.
pub fn validate_name(name: &str) -> Result<(), SpcError> {
    let invalid = |reason| SpcError::InvalidName { name: name.to_owned(), reason };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 255 bytes"));
    }
    if name.contains('\0') {
        return Err(invalid("contains NUL"));
    }
    Ok(())
}

// ── Subfile ──────────────────────────────────────────────────────────────────

/// One named payload owned by an [`Archive`](crate::archive::Archive).
///
/// `payload` is always the decoded content for `Uncompressed`/`Compressed`
/// entries and the raw stored bytes for every other state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subfile {
    pub(crate) name:    String,
    pub(crate) state:   CompressionState,
    pub(crate) flags:   u16,
    pub(crate) payload: Vec<u8>,
    /// Stored size from the last load or save.  `None` after a mutation,
    /// until the next save recomputes it.
    pub(crate) compressed_size: Option<u32>,
    /// Declared uncompressed size of an opaque entry, written back verbatim.
    pub(crate) opaque_size: Option<u32>,
}

impl Subfile {
    pub fn new(name: impl Into<String>, payload: Vec<u8>, state: CompressionState) -> Result<Self, SpcError> {
        let name = name.into();
        validate_name(&name)?;
        let opaque_size = opaque_size_for(&name, state, payload.len())?;
        Ok(Self {
            name,
            state,
            flags: DEFAULT_ENTRY_FLAGS,
            payload,
            compressed_size: None,
            opaque_size,
        })
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn state(&self) -> CompressionState { self.state }
    pub fn flags(&self) -> u16 { self.flags }
    pub fn payload(&self) -> &[u8] { &self.payload }
    pub fn compressed_size(&self) -> Option<u32> { self.compressed_size }

    /// Always the length of the in-memory payload.
    pub fn uncompressed_size(&self) -> usize { self.payload.len() }

    /// Replace the payload; the cached stored size is dropped.
    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<(), SpcError> {
        self.opaque_size = opaque_size_for(&self.name, self.state, payload.len())?;
        self.payload = payload;
        self.compressed_size = None;
        Ok(())
    }

    pub fn set_state(&mut self, state: CompressionState) -> Result<(), SpcError> {
        if state != self.state {
            self.opaque_size = opaque_size_for(&self.name, state, self.payload.len())?;
            self.state = state;
            self.compressed_size = None;
        }
        Ok(())
    }

    pub fn info(&self) -> SubfileInfo {
        SubfileInfo::from(self)
    }
}

/// Table size field for a payload of `len` bytes.
pub(crate) fn size_u32(name: &str, len: usize) -> Result<u32, SpcError> {
    u32::try_from(len).map_err(|_| SpcError::InvalidName {
        name: name.to_owned(),
        reason: "payload larger than 4 GiB",
    })
}

fn opaque_size_for(name: &str, state: CompressionState, len: usize) -> Result<Option<u32>, SpcError> {
    if state.is_decodable() {
        return Ok(None);
    }
    size_u32(name, len).map(Some)
}

// ── SubfileInfo ──────────────────────────────────────────────────────────────

/// Lightweight descriptor returned by [`Archive::list_subfiles`](crate::archive::Archive::list_subfiles).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubfileInfo {
    pub name:              String,
    pub state:             CompressionState,
    pub raw_state:         u16,
    pub compressed_size:   Option<u32>,
    pub uncompressed_size: usize,
}

impl From<&Subfile> for SubfileInfo {
    fn from(s: &Subfile) -> Self {
        SubfileInfo {
            name:              s.name.clone(),
            state:             s.state,
            raw_state:         s.state.raw(),
            compressed_size:   s.compressed_size,
            uncompressed_size: s.payload.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str) -> TableRow {
        TableRow {
            state:             CompressionState::Compressed,
            flags:             DEFAULT_ENTRY_FLAGS,
            stored_size:       10,
            uncompressed_size: 20,
            name:              name.to_owned(),
        }
    }

    #[test]
    fn state_codes_roundtrip_including_unknown() {
        for raw in [1u16, 2, 3, 0, 7, 0xFFFF] {
            assert_eq!(CompressionState::from(raw).raw(), raw);
        }
        assert_eq!(CompressionState::from(9), CompressionState::UnknownVariant(9));
        assert_eq!(CompressionState::from(9).to_string(), "N/A (Unknown: 9)");
    }

    #[test]
    fn row_name_slot_is_aligned() {
        for name in ["a", "abcdefghijklmno", "abcdefghijklmnop", "dir/file.wrd"] {
            let r = row(name);
            let mut buf = Vec::new();
            r.write(&mut buf).unwrap();
            assert_eq!(buf.len(), r.encoded_len());
            assert_eq!(buf.len() % ALIGNMENT, 0);
            assert_eq!(TableRow::read(&buf[..], 0).unwrap(), r);
        }
    }

    #[test]
    fn truncated_row_is_table_corrupt() {
        let mut buf = Vec::new();
        row("abc.txt").write(&mut buf).unwrap();
        for cut in [0, 4, 0x1F, buf.len() - 1] {
            assert!(matches!(TableRow::read(&buf[..cut], 0), Err(SpcError::TableCorrupt(_))));
        }
    }

    #[test]
    fn zero_and_oversized_name_lengths_are_rejected() {
        let mut buf = Vec::new();
        row("x").write(&mut buf).unwrap();
        buf[12..16].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(TableRow::read(&buf[..], 0), Err(SpcError::TableCorrupt(_))));
        buf[12..16].copy_from_slice(&0x7FFF_FFFFu32.to_le_bytes());
        assert!(matches!(TableRow::read(&buf[..], 0), Err(SpcError::TableCorrupt(_))));
    }

    #[test]
    fn payload_mutation_drops_cached_size() {
        let mut s = Subfile::new("a.txt", b"hi".to_vec(), CompressionState::Compressed).unwrap();
        s.compressed_size = Some(4);
        s.set_payload(b"bye".to_vec()).unwrap();
        assert_eq!(s.compressed_size(), None);
        assert_eq!(s.uncompressed_size(), 3);
    }

    #[test]
    fn opaque_size_tracks_state_changes() {
        let mut s = Subfile::new("x.ext", vec![1, 2], CompressionState::ExternalOrUnsupported).unwrap();
        assert_eq!(s.opaque_size, Some(2));
        s.set_payload(vec![1, 2, 3]).unwrap();
        assert_eq!(s.opaque_size, Some(3));
        s.set_state(CompressionState::Compressed).unwrap();
        assert_eq!(s.opaque_size, None);
        assert_eq!(opaque_size_for("x", CompressionState::Compressed, usize::MAX).unwrap(), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_opaque_payload_is_an_error() {
        let too_big = u32::MAX as usize + 1;
        assert!(matches!(
            opaque_size_for("huge.bin", CompressionState::UnknownVariant(9), too_big),
            Err(SpcError::InvalidName { .. })
        ));
        assert!(size_u32("huge.bin", too_big).is_err());
    }

    #[test]
    fn names_are_validated() {
        assert!(Subfile::new("", vec![], CompressionState::Uncompressed).is_err());
        assert!(Subfile::new("a\0b", vec![], CompressionState::Uncompressed).is_err());
        assert!(Subfile::new("x".repeat(256), vec![], CompressionState::Uncompressed).is_err());
        assert!(Subfile::new("x".repeat(255), vec![], CompressionState::Uncompressed).is_ok());
    }
}
