//! SRD block trees.
//!
//! # Layout
//! An SRD stream is a sequence of blocks running to the end of its buffer.
//! Each block is:
//!
//! ```text
//! [ tag (4) | primary len (u32 BE) | aux len (u32 BE) | flag (u32 BE) ]
//! [ primary bytes | zero pad to 16 ]
//! [ aux region    | zero pad to 16 ]
//! ```
//!
//! With flag `1` the aux region is itself a block sequence (the children);
//! with flag `0` it is an opaque auxiliary payload.  Lengths in the header
//! are always recomputed from content on write, so editing a deep child
//! updates every ancestor.  Padding is written as zeros unless a lenient
//! parse found non-zero padding after a region that has not been edited
//! since; those bytes are written back as read.

pub mod payload;
pub mod registry;

use std::borrow::Cow;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::entry::padding_for;
pub use payload::{BlockKind, BlockPayload, ResourceFolder, Texture};
pub use registry::{BlockParser, BlockRegistry};

pub const BLOCK_HEADER_SIZE: usize = 0x10;
pub const FLAG_LEAF: u32 = 0;
pub const FLAG_CONTAINER: u32 = 1;
/// Nesting limit for untrusted input.
pub const MAX_DEPTH: usize = 64;

// ── Tag ──────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockTag(pub [u8; 4]);

impl BlockTag {
    pub const CFH: BlockTag = BlockTag(*b"$CFH");
    pub const CT0: BlockTag = BlockTag(*b"$CT0");
    pub const RSF: BlockTag = BlockTag(*b"$RSF");
    pub const TXR: BlockTag = BlockTag(*b"$TXR");
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockTag({self})")
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SrdError {
    #[error("Truncated stream at offset {offset:#x}: {what} needs {needed} bytes, {available} available")]
    TruncatedStream {
        offset:    usize,
        what:      &'static str,
        needed:    u64,
        available: usize,
    },
    #[error("Block {tag} has container flag {value}, expected 0 or 1")]
    InvalidContainerFlag { tag: BlockTag, value: u32 },
    #[error("Block {tag} has non-zero padding at offset {offset:#x}")]
    InvalidPadding { tag: BlockTag, offset: usize },
    #[error("Block {tag} payload is invalid: {reason}")]
    InvalidPayload { tag: BlockTag, reason: String },
    #[error("Block {tag} cannot carry a {kind:?} payload")]
    PayloadMismatch { tag: BlockTag, kind: BlockKind },
    #[error("Block {tag} region of {len} bytes does not fit a u32 length")]
    LengthOverflow { tag: BlockTag, len: usize },
    #[error("Block nesting deeper than {}", MAX_DEPTH)]
    TooDeep,
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Parse configuration for [`SrdFile::parse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SrdOptions {
    /// Reject container flags other than 0/1, non-zero padding and missing
    /// trailing padding.  Off by default.
    pub strict: bool,
}

// ── Block ────────────────────────────────────────────────────────────────────

/// What the aux region of a block holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBody {
    /// Raw auxiliary bytes.  `flag` is 0 for ordinary leaves and keeps any
    /// out-of-domain value read in lenient mode.
    Leaf { flag: u32, aux: Vec<u8> },
    /// Nested blocks, written with flag 1.
    Container(Vec<Block>),
}

/// One node of an SRD tree.  The tag is fixed at construction; the payload
/// kind must be the one the registry assigns to that tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    tag:     BlockTag,
    payload: BlockPayload,
    body:    BlockBody,
    /// Non-zero alignment padding read in lenient mode, written back while
    /// the region it follows is unchanged.
    padding: KeptPadding,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct KeptPadding {
    data: Option<Vec<u8>>,
    aux:  Option<Vec<u8>>,
}

impl Block {
    /// A leaf with no aux payload.
    pub fn new(tag: BlockTag, payload: BlockPayload) -> Result<Self, SrdError> {
        check_kind(tag, &payload)?;
        Ok(Self::assemble(tag, payload, BlockBody::Leaf { flag: FLAG_LEAF, aux: Vec::new() }))
    }

    pub fn with_aux(tag: BlockTag, payload: BlockPayload, aux: Vec<u8>) -> Result<Self, SrdError> {
        check_kind(tag, &payload)?;
        Ok(Self::assemble(tag, payload, BlockBody::Leaf { flag: FLAG_LEAF, aux }))
    }

    pub fn container(tag: BlockTag, payload: BlockPayload, children: Vec<Block>) -> Result<Self, SrdError> {
        check_kind(tag, &payload)?;
        Ok(Self::assemble(tag, payload, BlockBody::Container(children)))
    }

    fn assemble(tag: BlockTag, payload: BlockPayload, body: BlockBody) -> Self {
        Self { tag, payload, body, padding: KeptPadding::default() }
    }

    pub fn tag(&self) -> BlockTag { self.tag }
    pub fn payload(&self) -> &BlockPayload { &self.payload }
    pub fn body(&self) -> &BlockBody { &self.body }

    /// Replace the primary payload, keeping the tag's payload kind.
    pub fn set_payload(&mut self, payload: BlockPayload) -> Result<(), SrdError> {
        check_kind(self.tag, &payload)?;
        self.payload = payload;
        self.padding.data = None;
        Ok(())
    }

    /// Flag value the header will carry.
    pub fn flag(&self) -> u32 {
        match &self.body {
            BlockBody::Leaf { flag, .. } => *flag,
            BlockBody::Container(_) => FLAG_CONTAINER,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.body, BlockBody::Container(_))
    }

    /// Aux payload of a leaf; `None` for containers and for empty aux.
    pub fn aux(&self) -> Option<&[u8]> {
        match &self.body {
            BlockBody::Leaf { aux, .. } if !aux.is_empty() => Some(aux),
            _ => None,
        }
    }

    pub fn set_aux(&mut self, aux: Vec<u8>) {
        let flag = match self.body {
            BlockBody::Leaf { flag, .. } => flag,
            BlockBody::Container(_) => FLAG_LEAF,
        };
        self.body = BlockBody::Leaf { flag, aux };
        self.padding.aux = None;
    }

    pub fn children(&self) -> &[Block] {
        match &self.body {
            BlockBody::Container(children) => children,
            BlockBody::Leaf { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Block>> {
        self.padding.aux = None;
        match &mut self.body {
            BlockBody::Container(children) => Some(children),
            BlockBody::Leaf { .. } => None,
        }
    }

    /// Depth-first, pre-order visit of this block and its descendants.
    pub fn walk<'a, F: FnMut(&'a Block, usize)>(&'a self, f: &mut F) {
        self.walk_at(0, f);
    }

    fn walk_at<'a, F: FnMut(&'a Block, usize)>(&'a self, depth: usize, f: &mut F) {
        f(self, depth);
        for child in self.children() {
            child.walk_at(depth + 1, f);
        }
    }

    /// Append this block's encoding to `out`.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), SrdError> {
        let parser = registry::resolve(self.tag);
        let mut data = Vec::new();
        (parser.write)(self.tag, &self.payload, &mut data)?;

        let aux: Cow<'_, [u8]> = match &self.body {
            BlockBody::Leaf { aux, .. } => Cow::Borrowed(aux.as_slice()),
            BlockBody::Container(children) => {
                let mut buf = Vec::new();
                for child in children {
                    child.write(&mut buf)?;
                }
                Cow::Owned(buf)
            }
        };

        let mut header = [0u8; BLOCK_HEADER_SIZE];
        header[..4].copy_from_slice(&self.tag.0);
        BigEndian::write_u32(&mut header[0x4..], len_u32(self.tag, data.len())?);
        BigEndian::write_u32(&mut header[0x8..], len_u32(self.tag, aux.len())?);
        BigEndian::write_u32(&mut header[0xC..], self.flag());

        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        write_padding(out, data.len(), self.padding.data.as_deref());
        out.extend_from_slice(&aux);
        write_padding(out, aux.len(), self.padding.aux.as_deref());
        Ok(())
    }
}

/// Pad `region_len` bytes to alignment, reusing `kept` when it still fits.
fn write_padding(out: &mut Vec<u8>, region_len: usize, kept: Option<&[u8]>) {
    let pad = padding_for(region_len);
    match kept {
        Some(bytes) if bytes.len() == pad => out.extend_from_slice(bytes),
        _ => out.resize(out.len() + pad, 0),
    }
}

fn check_kind(tag: BlockTag, payload: &BlockPayload) -> Result<(), SrdError> {
    if registry::resolve(tag).kind != payload.kind() {
        return Err(SrdError::PayloadMismatch { tag, kind: payload.kind() });
    }
    Ok(())
}

fn len_u32(tag: BlockTag, len: usize) -> Result<u32, SrdError> {
    u32::try_from(len).map_err(|_| SrdError::LengthOverflow { tag, len })
}

// ── Parser ───────────────────────────────────────────────────────────────────

struct BlockReader<'a> {
    data:   &'a [u8],
    /// Offset of `data[0]` within the outermost buffer, for diagnostics.
    base:   usize,
    pos:    usize,
    strict: bool,
}

impl<'a> BlockReader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: u64, what: &'static str) -> Result<&'a [u8], SrdError> {
        let available = self.remaining();
        if len > available as u64 {
            return Err(SrdError::TruncatedStream {
                offset: self.base + self.pos,
                what,
                needed: len,
                available,
            });
        }
        let data = self.data;
        let start = self.pos;
        self.pos += len as usize;
        Ok(&data[start..self.pos])
    }

    /// Consume the padding after a region.  Returns the padding bytes when
    /// they are complete but not all zero (lenient mode only).
    fn skip_padding(&mut self, tag: BlockTag, region_len: usize) -> Result<Option<Vec<u8>>, SrdError> {
        let pad = padding_for(region_len);
        let present = if self.strict { pad } else { pad.min(self.remaining()) };
        let offset = self.base + self.pos;
        let bytes = self.take(present as u64, "alignment padding")?;
        if bytes.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if self.strict {
            return Err(SrdError::InvalidPadding { tag, offset });
        }
        Ok((present == pad).then(|| bytes.to_vec()))
    }

    fn read_sequence(&mut self, depth: usize) -> Result<Vec<Block>, SrdError> {
        if depth > MAX_DEPTH {
            return Err(SrdError::TooDeep);
        }
        let mut blocks = Vec::new();
        while self.remaining() > 0 {
            blocks.push(self.read_block(depth)?);
        }
        Ok(blocks)
    }

    fn read_block(&mut self, depth: usize) -> Result<Block, SrdError> {
        let header = self.take(BLOCK_HEADER_SIZE as u64, "block header")?;
        let tag = BlockTag([header[0], header[1], header[2], header[3]]);
        let data_len = BigEndian::read_u32(&header[0x4..]);
        let aux_len = BigEndian::read_u32(&header[0x8..]);
        let flag = BigEndian::read_u32(&header[0xC..]);

        let data = self.take(data_len as u64, "primary payload")?;
        let data_pad = self.skip_padding(tag, data.len())?;
        let aux_base = self.base + self.pos;
        let aux = self.take(aux_len as u64, "aux region")?;
        let aux_pad = self.skip_padding(tag, aux.len())?;

        let parser = registry::resolve(tag);
        let payload = (parser.parse)(tag, data)?;

        let body = match flag {
            FLAG_CONTAINER => {
                let mut nested = BlockReader { data: aux, base: aux_base, pos: 0, strict: self.strict };
                BlockBody::Container(nested.read_sequence(depth + 1)?)
            }
            FLAG_LEAF => BlockBody::Leaf { flag, aux: aux.to_vec() },
            value if self.strict => return Err(SrdError::InvalidContainerFlag { tag, value }),
            value => {
                tracing::debug!(%tag, value, "preserving out-of-domain container flag");
                BlockBody::Leaf { flag: value, aux: aux.to_vec() }
            }
        };
        tracing::trace!(%tag, data_len, aux_len, flag, kind = ?parser.kind, "parsed block");
        let padding = KeptPadding { data: data_pad, aux: aux_pad };
        if padding != KeptPadding::default() {
            tracing::debug!(%tag, "keeping non-zero alignment padding");
        }
        Ok(Block { tag, payload, body, padding })
    }
}

// ── SrdFile ──────────────────────────────────────────────────────────────────

/// A parsed SRD stream: the ordered top-level blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SrdFile {
    pub blocks: Vec<Block>,
}

impl SrdFile {
    pub fn parse(data: &[u8], opts: &SrdOptions) -> Result<Self, SrdError> {
        let mut reader = BlockReader { data, base: 0, pos: 0, strict: opts.strict };
        let blocks = reader.read_sequence(0)?;
        tracing::debug!(blocks = blocks.len(), bytes = data.len(), "parsed SRD stream");
        Ok(Self { blocks })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SrdError> {
        let mut out = Vec::new();
        for block in &self.blocks {
            block.write(&mut out)?;
        }
        Ok(out)
    }

    /// Depth-first visit of every block in stream order.
    pub fn walk<'a, F: FnMut(&'a Block, usize)>(&'a self, mut f: F) {
        for block in &self.blocks {
            block.walk(&mut f);
        }
    }

    /// First block (depth-first) carrying `tag`.
    pub fn find(&self, tag: BlockTag) -> Option<&Block> {
        let mut found = None;
        self.walk(|b, _| {
            if found.is_none() && b.tag() == tag {
                found = Some(b);
            }
        });
        found
    }
}
