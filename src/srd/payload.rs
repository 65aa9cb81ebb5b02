//! Typed primary payloads for the block tags this build understands.
//!
//! Integers inside a payload are little-endian, unlike the big-endian block
//! header around them.

use byteorder::{ByteOrder, LittleEndian};

use super::{BlockTag, SrdError};

/// Which parser produced (or must write) a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    FileHeader,
    Terminator,
    ResourceFolder,
    Texture,
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPayload {
    /// `$CFH`, always empty.
    FileHeader,
    /// `$CT0`, always empty.
    Terminator,
    /// `$RSF`
    ResourceFolder(ResourceFolder),
    /// `$TXR`
    Texture(Texture),
    /// Any tag without a registered parser; bytes kept verbatim.
    Opaque(Vec<u8>),
}

impl BlockPayload {
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockPayload::FileHeader        => BlockKind::FileHeader,
            BlockPayload::Terminator        => BlockKind::Terminator,
            BlockPayload::ResourceFolder(_) => BlockKind::ResourceFolder,
            BlockPayload::Texture(_)        => BlockKind::Texture,
            BlockPayload::Opaque(_)         => BlockKind::Opaque,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFolder {
    pub unknown10:   u32,
    pub unknown14:   u32,
    pub unknown18:   u32,
    pub unknown1c:   u32,
    pub folder_name: String,
}

pub const TEXTURE_LEN: usize = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Texture {
    pub unknown10:      u32,
    pub swizzle:        u16,
    pub display_width:  u16,
    pub display_height: u16,
    pub scanline:       u16,
    pub format:         u8,
    pub unknown1d:      u8,
    pub palette:        u8,
    pub palette_id:     u8,
}

fn invalid(tag: BlockTag, reason: impl Into<String>) -> SrdError {
    SrdError::InvalidPayload { tag, reason: reason.into() }
}

fn mismatch(tag: BlockTag, payload: &BlockPayload) -> SrdError {
    SrdError::PayloadMismatch { tag, kind: payload.kind() }
}

// ── Parsers ──────────────────────────────────────────────────────────────────

pub(crate) fn parse_file_header(tag: BlockTag, data: &[u8]) -> Result<BlockPayload, SrdError> {
    if !data.is_empty() {
        return Err(invalid(tag, format!("expected empty payload, found {} bytes", data.len())));
    }
    Ok(BlockPayload::FileHeader)
}

pub(crate) fn parse_terminator(tag: BlockTag, data: &[u8]) -> Result<BlockPayload, SrdError> {
    if !data.is_empty() {
        return Err(invalid(tag, format!("expected empty payload, found {} bytes", data.len())));
    }
    Ok(BlockPayload::Terminator)
}

pub(crate) fn parse_resource_folder(tag: BlockTag, data: &[u8]) -> Result<BlockPayload, SrdError> {
    if data.len() < 0x11 {
        return Err(invalid(tag, format!("{} bytes is too short for a folder record", data.len())));
    }
    let name = &data[0x10..];
    let nul = name.iter().position(|&b| b == 0)
        .ok_or_else(|| invalid(tag, "folder name is not NUL-terminated"))?;
    if nul + 1 != name.len() {
        return Err(invalid(tag, "bytes follow the folder name terminator"));
    }
    let folder_name = std::str::from_utf8(&name[..nul])
        .map_err(|_| invalid(tag, "folder name is not valid UTF-8"))?
        .to_owned();
    Ok(BlockPayload::ResourceFolder(ResourceFolder {
        unknown10: LittleEndian::read_u32(&data[0x00..]),
        unknown14: LittleEndian::read_u32(&data[0x04..]),
        unknown18: LittleEndian::read_u32(&data[0x08..]),
        unknown1c: LittleEndian::read_u32(&data[0x0C..]),
        folder_name,
    }))
}

pub(crate) fn parse_texture(tag: BlockTag, data: &[u8]) -> Result<BlockPayload, SrdError> {
    if data.len() != TEXTURE_LEN {
        return Err(invalid(tag, format!("texture record is {} bytes, expected {TEXTURE_LEN}", data.len())));
    }
    Ok(BlockPayload::Texture(Texture {
        unknown10:      LittleEndian::read_u32(&data[0x00..]),
        swizzle:        LittleEndian::read_u16(&data[0x04..]),
        display_width:  LittleEndian::read_u16(&data[0x06..]),
        display_height: LittleEndian::read_u16(&data[0x08..]),
        scanline:       LittleEndian::read_u16(&data[0x0A..]),
        format:         data[0x0C],
        unknown1d:      data[0x0D],
        palette:        data[0x0E],
        palette_id:     data[0x0F],
    }))
}

pub(crate) fn parse_opaque(_: BlockTag, data: &[u8]) -> Result<BlockPayload, SrdError> {
    Ok(BlockPayload::Opaque(data.to_vec()))
}

// ── Writers ──────────────────────────────────────────────────────────────────

pub(crate) fn write_file_header(tag: BlockTag, payload: &BlockPayload, _: &mut Vec<u8>) -> Result<(), SrdError> {
    match payload {
        BlockPayload::FileHeader => Ok(()),
        other => Err(mismatch(tag, other)),
    }
}

pub(crate) fn write_terminator(tag: BlockTag, payload: &BlockPayload, _: &mut Vec<u8>) -> Result<(), SrdError> {
    match payload {
        BlockPayload::Terminator => Ok(()),
        other => Err(mismatch(tag, other)),
    }
}

pub(crate) fn write_resource_folder(tag: BlockTag, payload: &BlockPayload, out: &mut Vec<u8>) -> Result<(), SrdError> {
    let BlockPayload::ResourceFolder(rsf) = payload else {
        return Err(mismatch(tag, payload));
    };
    if rsf.folder_name.as_bytes().contains(&0) {
        return Err(invalid(tag, "folder name contains NUL"));
    }
    let mut fixed = [0u8; 0x10];
    LittleEndian::write_u32(&mut fixed[0x00..], rsf.unknown10);
    LittleEndian::write_u32(&mut fixed[0x04..], rsf.unknown14);
    LittleEndian::write_u32(&mut fixed[0x08..], rsf.unknown18);
    LittleEndian::write_u32(&mut fixed[0x0C..], rsf.unknown1c);
    out.extend_from_slice(&fixed);
    out.extend_from_slice(rsf.folder_name.as_bytes());
    out.push(0);
    Ok(())
}

pub(crate) fn write_texture(tag: BlockTag, payload: &BlockPayload, out: &mut Vec<u8>) -> Result<(), SrdError> {
    let BlockPayload::Texture(txr) = payload else {
        return Err(mismatch(tag, payload));
    };
    let mut buf = [0u8; TEXTURE_LEN];
    LittleEndian::write_u32(&mut buf[0x00..], txr.unknown10);
    LittleEndian::write_u16(&mut buf[0x04..], txr.swizzle);
    LittleEndian::write_u16(&mut buf[0x06..], txr.display_width);
    LittleEndian::write_u16(&mut buf[0x08..], txr.display_height);
    LittleEndian::write_u16(&mut buf[0x0A..], txr.scanline);
    buf[0x0C] = txr.format;
    buf[0x0D] = txr.unknown1d;
    buf[0x0E] = txr.palette;
    buf[0x0F] = txr.palette_id;
    out.extend_from_slice(&buf);
    Ok(())
}

pub(crate) fn write_opaque(tag: BlockTag, payload: &BlockPayload, out: &mut Vec<u8>) -> Result<(), SrdError> {
    match payload {
        BlockPayload::Opaque(bytes) => {
            out.extend_from_slice(bytes);
            Ok(())
        }
        other => Err(mismatch(tag, other)),
    }
}
