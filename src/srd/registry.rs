//! Tag → parser lookup for SRD blocks.
//!
//! The table is built once, on first use, and never mutated afterwards.
//! Tags without an entry resolve to [`OPAQUE`], which keeps the primary
//! payload as raw bytes so unknown blocks round-trip unchanged.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::payload::{self, BlockKind, BlockPayload};
use super::{BlockTag, SrdError};

pub type ParseFn = fn(BlockTag, &[u8]) -> Result<BlockPayload, SrdError>;
pub type WriteFn = fn(BlockTag, &BlockPayload, &mut Vec<u8>) -> Result<(), SrdError>;

/// Uniform parse/write pair for one payload kind.
#[derive(Clone, Copy)]
pub struct BlockParser {
    pub kind:  BlockKind,
    pub parse: ParseFn,
    pub write: WriteFn,
}

impl std::fmt::Debug for BlockParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockParser").field("kind", &self.kind).finish()
    }
}

pub const OPAQUE: BlockParser = BlockParser {
    kind:  BlockKind::Opaque,
    parse: payload::parse_opaque,
    write: payload::write_opaque,
};

pub struct BlockRegistry {
    parsers: HashMap<BlockTag, BlockParser>,
}

static REGISTRY: Lazy<BlockRegistry> = Lazy::new(BlockRegistry::builtin);

impl BlockRegistry {
    fn builtin() -> Self {
        let entries = [
            (BlockTag::CFH, BlockParser {
                kind:  BlockKind::FileHeader,
                parse: payload::parse_file_header,
                write: payload::write_file_header,
            }),
            (BlockTag::CT0, BlockParser {
                kind:  BlockKind::Terminator,
                parse: payload::parse_terminator,
                write: payload::write_terminator,
            }),
            (BlockTag::RSF, BlockParser {
                kind:  BlockKind::ResourceFolder,
                parse: payload::parse_resource_folder,
                write: payload::write_resource_folder,
            }),
            (BlockTag::TXR, BlockParser {
                kind:  BlockKind::Texture,
                parse: payload::parse_texture,
                write: payload::write_texture,
            }),
        ];
        Self { parsers: entries.into_iter().collect() }
    }

    /// The process-wide registry.
    pub fn global() -> &'static BlockRegistry {
        &REGISTRY
    }

    pub fn resolve(&self, tag: BlockTag) -> &BlockParser {
        self.parsers.get(&tag).unwrap_or(&OPAQUE)
    }

    pub fn is_known(&self, tag: BlockTag) -> bool {
        self.parsers.contains_key(&tag)
    }

    pub fn known_tags(&self) -> impl Iterator<Item = BlockTag> + '_ {
        self.parsers.keys().copied()
    }
}

/// Shorthand for `BlockRegistry::global().resolve(tag)`.
pub fn resolve(tag: BlockTag) -> &'static BlockParser {
    REGISTRY.resolve(tag)
}
