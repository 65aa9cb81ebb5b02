use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::SpcError;

pub const MAGIC: &[u8; 4] = b"CPS.";
/// Magic of the whole-file compressed variant, which this codec does not open.
pub const CMP_MAGIC: &[u8; 4] = b"$CMP";
pub const TABLE_MAGIC: &[u8; 4] = b"Root";
pub const RESERVED_LEN: usize = 0x24;
pub const DEFAULT_HEADER_FLAGS: u32 = 4;
/// Bytes from the start of the file to the first table row.
pub const HEADER_SIZE: usize = 0x50;

/// Fixed archive header.  The reserved bytes and flag word have no known
/// meaning; they are carried so a save reproduces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub reserved:      [u8; RESERVED_LEN],
    pub subfile_count: u32,
    pub flags:         u32,
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self {
            reserved:      [0u8; RESERVED_LEN],
            subfile_count: 0,
            flags:         DEFAULT_HEADER_FLAGS,
        }
    }
}

impl ArchiveHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&self.reserved)?;
        writer.write_u32::<LittleEndian>(self.subfile_count)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_all(&[0u8; 0x10])?;
        writer.write_all(TABLE_MAGIC)?;
        writer.write_all(&[0u8; 0x0C])?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, SpcError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(short_header)?;
        if &magic == CMP_MAGIC {
            return Err(SpcError::MalformedHeader(
                "whole-file compressed ($CMP) archives are not supported".into(),
            ));
        }
        if &magic != MAGIC {
            return Err(SpcError::MalformedHeader(format!("invalid magic {magic:02x?}")));
        }
        let mut reserved = [0u8; RESERVED_LEN];
        reader.read_exact(&mut reserved).map_err(short_header)?;
        let subfile_count = reader.read_u32::<LittleEndian>().map_err(short_header)?;
        let flags = reader.read_u32::<LittleEndian>().map_err(short_header)?;

        let mut pad = [0u8; 0x10];
        reader.read_exact(&mut pad).map_err(short_header)?;
        let mut table_magic = [0u8; 4];
        reader.read_exact(&mut table_magic).map_err(short_header)?;
        if &table_magic != TABLE_MAGIC {
            return Err(SpcError::MalformedHeader(format!(
                "invalid table magic {table_magic:02x?}"
            )));
        }
        reader.read_exact(&mut pad[..0x0C]).map_err(short_header)?;

        Ok(Self { reserved, subfile_count, flags })
    }
}

fn short_header(e: io::Error) -> SpcError {
    SpcError::MalformedHeader(format!("header shorter than {HEADER_SIZE} bytes ({e})"))
}
