pub mod error;
pub mod header;
pub mod codec;
pub mod entry;
pub mod archive;
pub mod retry;
pub mod srd;

pub use error::{Result, SpcError};
pub use header::ArchiveHeader;
pub use codec::{Codec, CodecError, get_codec};
pub use entry::{CompressionState, Subfile, SubfileInfo};
pub use archive::{Archive, SaveOptions};
pub use retry::RetryPolicy;
pub use srd::{Block, BlockPayload, BlockTag, SrdError, SrdFile, SrdOptions};
