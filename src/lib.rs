#![doc = include_str!("../README.md")]

mod chunk_sink;
mod io_utils;
pub mod read;
pub mod records;
pub mod sans_io;
pub mod write;

pub use read::{parse_record, LinearReader, MessageStream, RawMessage, RawMessageStream, Summary};
pub use write::{WriteOptions, Writer};

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use thiserror::Error;

/// The magic bytes that must open and close every MCAP file.
pub const MAGIC: &[u8; 8] = &[0x89, b'M', b'C', b'A', b'P', 0x30, b'\r', b'\n'];

/// Everything that can go wrong reading or writing an MCAP file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum McapError {
    #[error("Bad magic number")]
    BadMagic,
    #[error("Bad footer")]
    BadFooter,
    #[error("Bad index")]
    BadIndex,
    #[error("Record of type {opcode:#x} too long: {len} bytes")]
    RecordTooLarge { opcode: u8, len: u64 },
    #[error("Chunk too long: {0} bytes")]
    ChunkTooLarge(u64),
    #[error("schema data length ({header}) wasn't available ({available})")]
    BadSchemaLength { header: u32, available: u32 },
    #[error("chunk data length ({header}) wasn't available ({available})")]
    BadChunkLength { header: u64, available: u64 },
    #[error("attachment data length ({header}) wasn't available ({available})")]
    BadAttachmentLength { header: u64, available: u64 },
    #[error("Hit end of file inside of a chunk")]
    UnexpectedEoc,
    #[error("Read a start-of-file before expected")]
    UnexpectedEof,
    #[error("chunk offset {0} plus its length would overflow a u64")]
    BadChunkStartOffset(u64),
    #[error("bad CRC for chunk: {saved:08x} != {calculated:08x}")]
    BadChunkCrc { saved: u32, calculated: u32 },
    #[error("bad CRC for data section: {saved:08x} != {calculated:08x}")]
    BadDataCrc { saved: u32, calculated: u32 },
    #[error("bad CRC for summary section: {saved:08x} != {calculated:08x}")]
    BadSummaryCrc { saved: u32, calculated: u32 },
    #[error("bad CRC for attachment: {saved:08x} != {calculated:08x}")]
    BadAttachmentCrc { saved: u32, calculated: u32 },
    #[error("record or section was too long to represent in memory: {0} bytes")]
    TooLong(u64),
    #[error("chunk buffer grew larger than allowed: {0} bytes")]
    ChunkBufferTooLarge(u64),
    #[error("Schema with id 0 given to writer")]
    InvalidSchemaId,
    #[error("MCAP file already has a schema named {0} with different content")]
    ConflictingSchemas(String),
    #[error("MCAP file already has a channel on topic {0} with different content")]
    ConflictingChannels(String),
    #[error("Channel {0} referenced unknown schema {1}")]
    UnknownSchema(String, u16),
    #[error("Message {0} referenced unknown channel {1}")]
    UnknownChannel(u32, u16),
    #[error("Too many channels")]
    TooManyChannels,
    #[error("Too many schemas")]
    TooManySchemas,
    #[error("Unsupported compression format {0}")]
    UnsupportedCompression(String),
    #[error("Failed to decompress chunk: {0}")]
    DecompressionError(String),
    #[error("No attachment currently being written")]
    AttachmentNotInProgress,
    #[error("Wrote {excess} bytes more than the expected attachment length {attachment_length}")]
    AttachmentTooLarge { excess: u64, attachment_length: u64 },
    #[error("Attachment incomplete: expected {expected} bytes total, wrote {current}")]
    AttachmentIncomplete { expected: u64, current: u64 },
    #[error("schema {0} has an empty encoding but non-empty data")]
    SchemaDataWithoutEncoding(String),
    #[error("summary section is missing a statistics record")]
    MissingStatistics(Box<Summary>),
    #[error(transparent)]
    Parse(#[from] binrw::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type McapResult<T> = Result<T, McapError>;

/// A compressed (or not!) chunk of schemas, channels and messages in an MCAP file.
///
/// Chunks serve two purposes: they compress adjacent messages, and they
/// group messages in a way that can be indexed by time in the summary
/// section for fast random access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "lz4")]
    Lz4,
}

/// A schema referenced by zero or more [`Channel`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schema<'a> {
    pub id: u16,
    pub name: String,
    pub encoding: String,
    pub data: Cow<'a, [u8]>,
}

/// A channel that [`Message`]s are published and recorded on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel<'a> {
    pub id: u16,
    pub topic: String,
    pub schema: Option<Arc<Schema<'a>>>,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

/// A message published (or recorded) to a [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub channel: Arc<Channel<'a>>,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: Cow<'a, [u8]>,
}

/// An arbitrary file attached to an MCAP, e.g., a calibration file or video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment<'a> {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
    pub data: Cow<'a, [u8]>,
}
