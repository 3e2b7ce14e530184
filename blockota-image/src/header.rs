use std::fmt;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32},
};

/// Errors when reading a sparse image header.
#[derive(Debug, snafu::Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("sparse image is too small"))]
    TooSmall,

    #[snafu(display("invalid sparse magic {magic:#010x}"))]
    InvalidMagic { magic: u32 },

    #[snafu(display("unsupported sparse version {major}.{minor}"))]
    UnsupportedVersion { major: u16, minor: u16 },

    #[snafu(display("sparse header size must be {HEADER_SIZE}, found {size}"))]
    InvalidHeaderSize { size: u16 },

    #[snafu(display("chunk header size must be {CHUNK_HEADER_SIZE}, found {size}"))]
    InvalidChunkHeaderSize { size: u16 },

    #[snafu(display("block size must be a non-zero multiple of 4, found {size}"))]
    InvalidBlockSize { size: u32 },
}

type Result<T, E = ReadError> = std::result::Result<T, E>;

pub const SPARSE_MAGIC: u32 = 0xED26FF3A;
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

/// Size of the on-disk file header.
pub const HEADER_SIZE: usize = size_of::<SparseHeaderRaw>();

/// Size of the on-disk chunk header.
pub const CHUNK_HEADER_SIZE: usize = size_of::<ChunkHeaderRaw>();

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SparseHeaderRaw {
    /// 0x00: Magic, 0xED26FF3A
    pub magic: U32,
    /// 0x04: Major version
    pub major_version: U16,
    /// 0x06: Minor version
    pub minor_version: U16,
    /// 0x08: File header size, always 28
    pub file_hdr_sz: U16,
    /// 0x0A: Chunk header size, always 12
    pub chunk_hdr_sz: U16,
    /// 0x0C: Block size in bytes
    pub blk_sz: U32,
    /// 0x10: Blocks when unsparsed
    pub total_blks: U32,
    /// 0x14: Number of chunks
    pub total_chunks: U32,
    /// 0x18: Unused
    pub image_checksum: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ChunkHeaderRaw {
    pub chunk_type: U16,
    pub reserved: U16,
    /// Blocks covered
    pub chunk_sz: U32,
    /// Bytes including this header
    pub total_sz: U32,
}

/// Kind of a sparse chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl ChunkType {
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0xCAC1 => Some(Self::Raw),
            0xCAC2 => Some(Self::Fill),
            0xCAC3 => Some(Self::DontCare),
            0xCAC4 => Some(Self::Crc32),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Raw => 0xCAC1,
            Self::Fill => 0xCAC2,
            Self::DontCare => 0xCAC3,
            Self::Crc32 => 0xCAC4,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Fill => "fill",
            Self::DontCare => "don't care",
            Self::Crc32 => "crc32",
        };

        f.write_str(name)
    }
}

/// Parsed sparse image file header.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct SparseHeader {
    raw_header: SparseHeaderRaw,
}

impl SparseHeader {
    /// Builds a header for writing.
    pub fn new(block_size: u32, total_blocks: u32, total_chunks: u32) -> Self {
        Self {
            raw_header: SparseHeaderRaw {
                magic: SPARSE_MAGIC.into(),
                major_version: MAJOR_VERSION.into(),
                minor_version: MINOR_VERSION.into(),
                file_hdr_sz: (HEADER_SIZE as u16).into(),
                chunk_hdr_sz: (CHUNK_HEADER_SIZE as u16).into(),
                blk_sz: block_size.into(),
                total_blks: total_blocks.into(),
                total_chunks: total_chunks.into(),
                image_checksum: 0.into(),
            },
        }
    }

    /// Parses and validates a sparse header from the start of `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if any field differs from the values this format
    /// version requires.
    pub fn read(image: &[u8]) -> Result<Self> {
        let (raw_header, _) =
            SparseHeaderRaw::read_from_prefix(image).map_err(|_| TooSmallSnafu.build())?;

        let magic = raw_header.magic.get();
        snafu::ensure!(magic == SPARSE_MAGIC, InvalidMagicSnafu { magic });

        let (major, minor) = (
            raw_header.major_version.get(),
            raw_header.minor_version.get(),
        );
        snafu::ensure!(
            major == MAJOR_VERSION && minor == MINOR_VERSION,
            UnsupportedVersionSnafu { major, minor }
        );

        let size = raw_header.file_hdr_sz.get();
        snafu::ensure!(
            usize::from(size) == HEADER_SIZE,
            InvalidHeaderSizeSnafu { size }
        );

        let size = raw_header.chunk_hdr_sz.get();
        snafu::ensure!(
            usize::from(size) == CHUNK_HEADER_SIZE,
            InvalidChunkHeaderSizeSnafu { size }
        );

        let size = raw_header.blk_sz.get();
        snafu::ensure!(size != 0 && size % 4 == 0, InvalidBlockSizeSnafu { size });

        Ok(Self { raw_header })
    }

    /// Returns `true` if `image` starts with a valid sparse header.
    #[must_use]
    pub fn is_valid(image: &[u8]) -> bool {
        Self::read(image).is_ok()
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.raw_header.blk_sz.get()
    }

    #[must_use]
    pub const fn total_blocks(&self) -> u32 {
        self.raw_header.total_blks.get()
    }

    #[must_use]
    pub const fn total_chunks(&self) -> u32 {
        self.raw_header.total_chunks.get()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw_header.as_bytes()
    }
}

/// A chunk header as stored in the image.
///
/// Only the layout is checked here. Whether the sizes agree with the chunk
/// type is validated while indexing the image.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct ChunkHeader {
    raw_chunk: ChunkHeaderRaw,
}

impl ChunkHeader {
    /// Builds a header for writing.
    pub fn new(chunk_type: ChunkType, blocks: u32, body_size: u32) -> Self {
        Self {
            raw_chunk: ChunkHeaderRaw {
                chunk_type: chunk_type.as_u16().into(),
                reserved: 0.into(),
                chunk_sz: blocks.into(),
                total_sz: (body_size + CHUNK_HEADER_SIZE as u32).into(),
            },
        }
    }

    /// Reads a chunk header, returning `None` if `raw` is too short.
    #[must_use]
    pub fn read(raw: &[u8]) -> Option<Self> {
        let (raw_chunk, _) = ChunkHeaderRaw::read_from_prefix(raw).ok()?;

        Some(Self { raw_chunk })
    }

    /// Returns the raw type code.
    #[must_use]
    pub const fn type_code(&self) -> u16 {
        self.raw_chunk.chunk_type.get()
    }

    #[must_use]
    pub const fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_u16(self.type_code())
    }

    /// Returns the number of unsparsed blocks this chunk covers.
    #[must_use]
    pub const fn blocks(&self) -> u32 {
        self.raw_chunk.chunk_sz.get()
    }

    /// Returns the chunk size in bytes, header included.
    #[must_use]
    pub const fn total_size(&self) -> u32 {
        self.raw_chunk.total_sz.get()
    }

    /// Returns the body size, or `None` if the total size is smaller than a
    /// chunk header.
    #[must_use]
    pub const fn body_size(&self) -> Option<u32> {
        self.total_size().checked_sub(CHUNK_HEADER_SIZE as u32)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw_chunk.as_bytes()
    }
}
