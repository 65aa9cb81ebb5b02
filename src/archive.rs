//! High-level [`Archive`] API, the primary embedding surface.
//!
//! ```no_run
//! use spcarc::archive::{Archive, SaveOptions};
//!
//! let mut ar = Archive::open("chap1.spc")?;
//! for info in ar.list_subfiles() {
//!     println!("{} {}", info.name, info.state);
//! }
//! ar.insert("readme.txt", b"Hello, world!".to_vec())?;
//! ar.save("chap1.spc", &SaveOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

use crate::codec::{self, DEFAULT_COMPRESSION_LEVEL};
use crate::entry::{
    padding_for, size_u32, validate_name, CompressionState, Subfile, SubfileInfo, TableRow,
    MIN_ROW_SIZE,
};
use crate::error::{Result, SpcError};
use crate::header::{ArchiveHeader, HEADER_SIZE};
use crate::srd::{SrdFile, SrdOptions};

// ── SaveOptions ──────────────────────────────────────────────────────────────

/// Configuration for [`Archive::save`] and friends.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Deflate level (0..=9) for `Compressed` entries.
    pub compression_level: u32,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self { compression_level: DEFAULT_COMPRESSION_LEVEL }
    }
}

// ── Archive ──────────────────────────────────────────────────────────────────

/// An SPC archive held fully in memory.
///
/// Subfiles form an ordered list, not a map: duplicate names are legal and
/// kept, and every by-name operation acts on the first match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Archive {
    header:   ArchiveHeader,
    subfiles: Vec<Subfile>,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn new() -> Self {
        Self::default()
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "opening archive");
        Self::from_bytes(&data)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(&data)
    }

    /// Parse an archive image.  Any structural fault, or any entry whose
    /// payload fails to decode, aborts the whole load.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = ArchiveHeader::read(&mut cursor)?;

        let count = header.subfile_count as usize;
        let table_room = data.len() - HEADER_SIZE;
        if count.saturating_mul(MIN_ROW_SIZE) > table_room {
            return Err(SpcError::TableCorrupt(format!(
                "{count} subfiles declared but only {table_room} bytes follow the header"
            )));
        }

        let mut rows = Vec::with_capacity(count);
        for index in 0..count {
            rows.push(TableRow::read(&mut cursor, index)?);
        }

        let mut pos = cursor.position() as usize;
        let mut subfiles = Vec::with_capacity(count);
        for row in rows {
            let stored_len = row.stored_size as usize;
            let available = data.len() - pos;
            if stored_len > available {
                return Err(SpcError::TruncatedStream {
                    context:   format!("subfile '{}'", row.name),
                    declared:  row.stored_size as u64,
                    available: available as u64,
                });
            }
            let stored = &data[pos..pos + stored_len];
            pos += stored_len;
            pos += padding_for(stored_len).min(data.len() - pos);

            subfiles.push(decode_entry(row, stored)?);
        }

        if pos < data.len() {
            tracing::debug!(trailing = data.len() - pos, "ignoring bytes after the payload region");
        }
        tracing::debug!(subfiles = subfiles.len(), "archive loaded");
        Ok(Self { header, subfiles })
    }

    // ── Save ─────────────────────────────────────────────────────────────────

    /// Write the archive to `path`, replacing any existing file.
    ///
    /// The image is fully encoded first and written to a sibling temporary
    /// file, which is then renamed over `path`.  On any error the previous
    /// file at `path` is left as it was.
    pub fn save<P: AsRef<Path>>(&mut self, path: P, opts: &SaveOptions) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes(opts)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "archive saved");
        Ok(())
    }

    pub fn to_bytes(&mut self, opts: &SaveOptions) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out, opts)?;
        Ok(out)
    }

    /// Encode every payload, then write header, table and payload region.
    /// Each entry's cached `compressed_size` is refreshed from the bytes
    /// actually written.
    pub fn write_to<W: Write>(&mut self, mut writer: W, opts: &SaveOptions) -> Result<()> {
        let mut rows = Vec::with_capacity(self.subfiles.len());
        let mut stored = Vec::with_capacity(self.subfiles.len());
        for sub in &self.subfiles {
            let (row, bytes) = encode_entry(sub, opts.compression_level)?;
            rows.push(row);
            stored.push(bytes);
        }

        self.header.subfile_count = u32::try_from(self.subfiles.len())
            .map_err(|_| SpcError::TableCorrupt("more than u32::MAX subfiles".into()))?;
        self.header.write(&mut writer)?;
        for row in &rows {
            row.write(&mut writer)?;
        }
        let zeros = [0u8; 0x10];
        for bytes in &stored {
            writer.write_all(bytes)?;
            writer.write_all(&zeros[..padding_for(bytes.len())])?;
        }

        for (sub, row) in self.subfiles.iter_mut().zip(&rows) {
            sub.compressed_size = Some(row.stored_size);
        }
        tracing::debug!(subfiles = rows.len(), "archive encoded");
        Ok(())
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    pub fn len(&self) -> usize { self.subfiles.len() }
    pub fn is_empty(&self) -> bool { self.subfiles.is_empty() }
    pub fn header(&self) -> &ArchiveHeader { &self.header }
    pub fn subfiles(&self) -> &[Subfile] { &self.subfiles }

    pub fn list_subfiles(&self) -> Vec<SubfileInfo> {
        self.subfiles.iter().map(SubfileInfo::from).collect()
    }

    /// First subfile named `name`.
    pub fn get(&self, name: &str) -> Option<&Subfile> {
        self.subfiles.iter().find(|s| s.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Subfile> {
        self.subfiles.iter_mut().find(|s| s.name == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.subfiles.iter().position(|s| s.name == name)
    }

    /// Parse a subfile's payload as an SRD block tree.
    pub fn read_srd(&self, name: &str, opts: &SrdOptions) -> Result<SrdFile> {
        let sub = self.get(name).ok_or_else(|| SpcError::NotFound(name.to_owned()))?;
        Ok(SrdFile::parse(&sub.payload, opts)?)
    }

    /// Serialize `srd` into the existing subfile `name`.
    pub fn write_srd(&mut self, name: &str, srd: &SrdFile) -> Result<()> {
        let bytes = srd.to_bytes()?;
        let sub = self.get_mut(name).ok_or_else(|| SpcError::NotFound(name.to_owned()))?;
        sub.set_payload(bytes)
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Replace the first entry named `name` in place, or append a new one.
    /// A replaced entry keeps its compression state and flags; a new entry
    /// is `Compressed`.
    pub fn insert(&mut self, name: &str, payload: Vec<u8>) -> Result<()> {
        let state = self
            .get(name)
            .map(|s| s.state)
            .unwrap_or(CompressionState::Compressed);
        self.insert_with_state(name, payload, state)
    }

    pub fn insert_with_state(&mut self, name: &str, payload: Vec<u8>, state: CompressionState) -> Result<()> {
        match self.position(name) {
            Some(idx) => {
                let sub = &mut self.subfiles[idx];
                sub.set_state(state)?;
                sub.set_payload(payload)?;
                tracing::debug!(name, index = idx, bytes = sub.payload.len(), "replaced subfile");
            }
            None => {
                let sub = Subfile::new(name, payload, state)?;
                tracing::debug!(name, bytes = sub.payload.len(), %state, "appended subfile");
                self.subfiles.push(sub);
            }
        }
        Ok(())
    }

    /// Remove and return the first entry named `name`.
    pub fn remove(&mut self, name: &str) -> Result<Subfile> {
        let idx = self.position(name).ok_or_else(|| SpcError::NotFound(name.to_owned()))?;
        Ok(self.subfiles.remove(idx))
    }

    // ── Extract ──────────────────────────────────────────────────────────────

    /// Write the payload of `name` into `dest_dir/name`, creating missing
    /// directories.  Returns the number of bytes written.  Nothing touches
    /// the filesystem when the name is absent or unsafe.
    pub fn extract<P: AsRef<Path>>(&self, name: &str, dest_dir: P) -> Result<u64> {
        let sub = self.get(name).ok_or_else(|| SpcError::NotFound(name.to_owned()))?;
        let target = safe_join(dest_dir.as_ref(), &sub.name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &sub.payload)?;
        tracing::debug!(name, path = %target.display(), bytes = sub.payload.len(), "extracted subfile");
        Ok(sub.payload.len() as u64)
    }

    pub fn extract_to_writer<W: Write>(&self, name: &str, mut writer: W) -> Result<u64> {
        let sub = self.get(name).ok_or_else(|| SpcError::NotFound(name.to_owned()))?;
        writer.write_all(&sub.payload)?;
        Ok(sub.payload.len() as u64)
    }

    /// Extract every entry into `dest_dir`, in table order.  When names
    /// repeat, the last entry wins on disk.  All names are checked before
    /// anything is written.
    pub fn extract_all<P: AsRef<Path>>(&self, dest_dir: P) -> Result<u64> {
        let dest_dir = dest_dir.as_ref();
        let targets = self
            .subfiles
            .iter()
            .map(|s| safe_join(dest_dir, &s.name))
            .collect::<Result<Vec<_>>>()?;
        fs::create_dir_all(dest_dir)?;
        let mut total = 0u64;
        for (sub, target) in self.subfiles.iter().zip(targets) {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &sub.payload)?;
            total += sub.payload.len() as u64;
        }
        Ok(total)
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn decode_entry(row: TableRow, stored: &[u8]) -> Result<Subfile> {
    let (payload, opaque_size) = match codec::get_codec(row.state) {
        Some(c) => {
            let payload = c
                .decompress(stored, row.uncompressed_size as usize)
                .map_err(|source| SpcError::CorruptPayload { name: row.name.clone(), source })?;
            (payload, None)
        }
        None => {
            tracing::debug!(name = %row.name, state = %row.state, "keeping stored bytes of opaque entry");
            (stored.to_vec(), Some(row.uncompressed_size))
        }
    };
    Ok(Subfile {
        name: row.name,
        state: row.state,
        flags: row.flags,
        payload,
        compressed_size: Some(row.stored_size),
        opaque_size,
    })
}

fn encode_entry(sub: &Subfile, level: u32) -> Result<(TableRow, Vec<u8>)> {
    validate_name(&sub.name)?;
    let (stored, uncompressed_size) = match codec::get_codec(sub.state) {
        Some(c) => {
            let stored = c
                .compress(&sub.payload, level)
                .map_err(|source| SpcError::CorruptPayload { name: sub.name.clone(), source })?;
            (stored, size_u32(&sub.name, sub.payload.len())?)
        }
        None => {
            let declared = match sub.opaque_size {
                Some(n) => n,
                None => size_u32(&sub.name, sub.payload.len())?,
            };
            (sub.payload.clone(), declared)
        }
    };
    let row = TableRow {
        state: sub.state,
        flags: sub.flags,
        stored_size: size_u32(&sub.name, stored.len())?,
        uncompressed_size,
        name: sub.name.clone(),
    };
    Ok((row, stored))
}

/// Join an untrusted subfile name onto `dir`, refusing anything that could
/// land outside it.
fn safe_join(dir: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    let escapes = rel.components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes || name.split('\\').any(|p| p == "..") {
        return Err(SpcError::InvalidName {
            name: name.to_owned(),
            reason: "escapes the destination directory",
        });
    }
    Ok(dir.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_entry_archive() -> Archive {
        let mut ar = Archive::new();
        ar.insert_with_state("a.txt", b"hi".to_vec(), CompressionState::Uncompressed).unwrap();
        ar.insert_with_state("b.bin", vec![0, 0, 0], CompressionState::Compressed).unwrap();
        ar
    }

    #[test]
    fn empty_archive_is_header_only() {
        let bytes = Archive::new().to_bytes(&SaveOptions::default()).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert!(Archive::from_bytes(&bytes).unwrap().is_empty());
    }

    #[test]
    fn save_refreshes_compressed_size() {
        let mut ar = two_entry_archive();
        assert_eq!(ar.get("a.txt").unwrap().compressed_size(), None);
        ar.to_bytes(&SaveOptions::default()).unwrap();
        assert_eq!(ar.get("a.txt").unwrap().compressed_size(), Some(2));
        assert!(ar.get("b.bin").unwrap().compressed_size().is_some());
    }

    #[test]
    fn layout_is_header_table_payloads() {
        let mut ar = two_entry_archive();
        let bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        // two rows with 16-byte name slots
        let payload_start = HEADER_SIZE + 2 * 0x30;
        assert_eq!(&bytes[payload_start..payload_start + 2], b"hi");
        assert!(bytes[payload_start + 2..payload_start + 16].iter().all(|&b| b == 0));
        assert_eq!(bytes.len() % 16, 0);
    }

    #[test]
    fn insert_replaces_in_place_or_appends() {
        let mut ar = two_entry_archive();
        ar.insert("a.txt", b"bye".to_vec()).unwrap();
        ar.insert("c.dat", b"new".to_vec()).unwrap();
        let names: Vec<_> = ar.list_subfiles().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["a.txt", "b.bin", "c.dat"]);
        assert_eq!(ar.get("a.txt").unwrap().state(), CompressionState::Uncompressed);
        assert_eq!(ar.get("c.dat").unwrap().state(), CompressionState::Compressed);
        assert_eq!(ar.get("a.txt").unwrap().payload(), b"bye");
    }

    #[test]
    fn duplicate_names_survive_and_lookup_hits_first() {
        let mut ar = Archive::new();
        ar.subfiles.push(Subfile::new("dup", b"one".to_vec(), CompressionState::Uncompressed).unwrap());
        ar.subfiles.push(Subfile::new("dup", b"two".to_vec(), CompressionState::Compressed).unwrap());
        let bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        let loaded = Archive::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("dup").unwrap().payload(), b"one");
        assert_eq!(loaded.subfiles()[1].payload(), b"two");
    }

    #[test]
    fn unknown_state_is_carried_not_decoded() {
        let mut ar = Archive::new();
        ar.insert_with_state("ext.bin", vec![9, 8, 7], CompressionState::UnknownVariant(42)).unwrap();
        ar.insert_with_state("x.ext", vec![1], CompressionState::ExternalOrUnsupported).unwrap();
        let bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        let loaded = Archive::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.get("ext.bin").unwrap().state(), CompressionState::UnknownVariant(42));
        assert_eq!(loaded.get("ext.bin").unwrap().payload(), &[9, 8, 7]);
        assert_eq!(loaded.list_subfiles()[1].raw_state, 3);
    }

    #[test]
    fn opaque_entry_keeps_declared_size() {
        let mut ar = Archive::new();
        ar.insert_with_state("far.bin", vec![1, 2], CompressionState::ExternalOrUnsupported).unwrap();
        let mut bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        // uncompressed_size field of row 0
        bytes[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&0x5000u32.to_le_bytes());
        let mut loaded = Archive::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.to_bytes(&SaveOptions::default()).unwrap(), bytes);
    }

    #[test]
    fn oversized_count_is_table_corrupt() {
        let mut bytes = Archive::new().to_bytes(&SaveOptions::default()).unwrap();
        bytes[0x28..0x2C].copy_from_slice(&1_000_000u32.to_le_bytes());
        assert!(matches!(Archive::from_bytes(&bytes), Err(SpcError::TableCorrupt(_))));
    }

    #[test]
    fn short_payload_is_truncation() {
        let mut ar = Archive::new();
        ar.insert_with_state("big.bin", vec![7u8; 100], CompressionState::Uncompressed).unwrap();
        let bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        let cut = &bytes[..bytes.len() - 40];
        assert!(matches!(Archive::from_bytes(cut), Err(SpcError::TruncatedStream { .. })));
    }

    #[test]
    fn corrupt_compressed_entry_aborts_load() {
        let mut ar = Archive::new();
        ar.insert_with_state("ok.txt", b"fine".to_vec(), CompressionState::Uncompressed).unwrap();
        ar.insert_with_state("bad.bin", vec![5u8; 64], CompressionState::Compressed).unwrap();
        let mut bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        // declare a bigger uncompressed size for row 1
        let row1 = HEADER_SIZE + 0x30;
        bytes[row1 + 8..row1 + 12].copy_from_slice(&65u32.to_le_bytes());
        match Archive::from_bytes(&bytes) {
            Err(SpcError::CorruptPayload { name, .. }) => assert_eq!(name, "bad.bin"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn huge_declared_size_is_corrupt_payload() {
        let mut ar = Archive::new();
        ar.insert_with_state("x.bin", vec![1, 2, 3], CompressionState::Compressed).unwrap();
        let mut bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        bytes[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        match Archive::from_bytes(&bytes) {
            Err(SpcError::CorruptPayload { name, .. }) => assert_eq!(name, "x.bin"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn failed_save_keeps_previous_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chap.spc");
        let mut ar = two_entry_archive();
        ar.save(&path, &SaveOptions::default()).unwrap();
        let before = fs::read(&path).unwrap();

        ar.subfiles[0].name = "x".repeat(300);
        assert!(matches!(
            ar.save(&path, &SaveOptions::default()),
            Err(SpcError::InvalidName { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn unsafe_names_are_refused() {
        let dir = Path::new("/tmp/out");
        assert!(safe_join(dir, "../evil").is_err());
        assert!(safe_join(dir, "/etc/passwd").is_err());
        assert!(safe_join(dir, "a\\..\\b").is_err());
        assert_eq!(safe_join(dir, "sub/ok.wrd").unwrap(), dir.join("sub/ok.wrd"));
    }

    #[test]
    fn srd_subfile_roundtrip() {
        use crate::srd::{Block, BlockPayload, BlockTag};
        let srd = SrdFile {
            blocks: vec![
                Block::container(BlockTag::CFH, BlockPayload::FileHeader, vec![]).unwrap(),
                Block::with_aux(BlockTag(*b"$VTX"), BlockPayload::Opaque(vec![1, 2]), vec![3]).unwrap(),
                Block::new(BlockTag::CT0, BlockPayload::Terminator).unwrap(),
            ],
        };
        let mut ar = Archive::new();
        ar.insert("model.srd", Vec::new()).unwrap();
        ar.write_srd("model.srd", &srd).unwrap();
        let bytes = ar.to_bytes(&SaveOptions::default()).unwrap();
        let loaded = Archive::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.read_srd("model.srd", &SrdOptions { strict: true }).unwrap(), srd);
        assert!(matches!(loaded.read_srd("none.srd", &SrdOptions::default()), Err(SpcError::NotFound(_))));
    }
}
