//! A library for reading block images the way a block-based OTA generator
//! needs them.
//!
//! This crate parses Android-style sparse images (and plain raw images),
//! indexes their chunks for random block access, and splits the image into
//! named block sets using the block map produced alongside the image.
//!
//! # Features
//!
//! - Sparse header and chunk parsing with strict validation
//! - [`RangeSet`], an algebra over disjoint block ranges
//! - Random-access block reads that synthesize fill and don't-care chunks
//! - A [`FileMap`] with synthetic entries for zero, unclaimed and reserved
//!   blocks
//! - SHA-256 / SHA-384 content digests over arbitrary block sets
//!
//! # Example
//!
//! ```no_run
//! use blockota_image::{ImageOptions, RangeSet, SparseImage};
//!
//! let bytes = std::fs::read("system.img").unwrap();
//! let map = std::fs::read_to_string("system.map").unwrap();
//! let image = SparseImage::open(bytes, &map, &ImageOptions::default()).unwrap();
//!
//! for (name, ranges) in image.file_map().iter() {
//!     println!("{name}: {} blocks", ranges.size());
//! }
//!
//! let first = RangeSet::from_range(0, 1);
//! println!("{}", image.digest(&first, Default::default()).unwrap());
//! ```

use self::chunk::{ChunkData, ChunkIndex};
use self::header::SparseHeader;
use self::ranges::Ranges;
use snafu::{ResultExt, Snafu, ensure};
use std::borrow::Cow;
use std::io::Write;
use tracing::{debug, warn};

pub use self::digest::HashAlgorithm;
pub use self::map::FileMap;
pub use self::ranges::RangeSet;

use open_error::*;

pub mod chunk;
pub mod digest;
pub mod header;
pub mod map;
pub mod ranges;
pub mod writer;

/// Fill and don't-care data is synthesized at most this many blocks at a time.
const MAX_SYNTHESIZED_BLOCKS: u64 = 256;

/// Returns `true` if `image` starts with a valid sparse header.
#[must_use]
pub fn is_sparse(image: &[u8]) -> bool {
    SparseHeader::is_valid(image)
}

/// Options controlling how an image is split into files.
#[derive(Debug, Clone)]
#[must_use]
pub struct ImageOptions {
    extend_margin: u64,
    max_blocks_per_group: u64,
    reserved_blocks: RangeSet,
    raw_block_size: u32,
}

impl ImageOptions {
    /// Blocks of slack around the care blocks that get zeroed on the target.
    pub fn with_extend_margin(mut self, blocks: u64) -> Self {
        self.extend_margin = blocks;
        self
    }

    /// Size cap of every `__NONZERO-<n>` group.
    pub fn with_max_blocks_per_group(mut self, blocks: u64) -> Self {
        self.max_blocks_per_group = blocks;
        self
    }

    /// Blocks that are never diffed and always written as new data.
    pub fn with_reserved_blocks(mut self, blocks: RangeSet) -> Self {
        self.reserved_blocks = blocks;
        self
    }

    /// Block size assumed for images without a sparse header.
    pub fn with_raw_block_size(mut self, size: u32) -> Self {
        self.raw_block_size = size;
        self
    }

    #[must_use]
    pub fn extend_margin(&self) -> u64 {
        self.extend_margin
    }

    #[must_use]
    pub fn max_blocks_per_group(&self) -> u64 {
        self.max_blocks_per_group
    }

    pub fn reserved_blocks(&self) -> &RangeSet {
        &self.reserved_blocks
    }

    #[must_use]
    pub fn raw_block_size(&self) -> u32 {
        self.raw_block_size
    }
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            extend_margin: 512,
            max_blocks_per_group: 512,
            reserved_blocks: RangeSet::new(),
            raw_block_size: 4096,
        }
    }
}

/// A parsed block image together with its file map.
///
/// The image bytes are kept in whatever container `R` the caller supplies
/// (a `Vec<u8>`, a memory map, ...). All reads are served from it directly.
#[must_use]
pub struct SparseImage<R: AsRef<[u8]>> {
    raw: R,
    sparse: bool,
    block_size: u32,
    index: ChunkIndex,
    care: RangeSet,
    extended: RangeSet,
    file_map: FileMap,
}

impl<R: AsRef<[u8]>> std::fmt::Debug for SparseImage<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseImage")
            .field("sparse", &self.sparse)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks())
            .field("care", &self.care)
            .field("files", &self.file_map.len())
            .finish_non_exhaustive()
    }
}

impl<R: AsRef<[u8]>> SparseImage<R> {
    /// Opens a sparse or raw image, depending on whether `raw` starts with a
    /// sparse header.
    pub fn open(raw: R, block_map: &str, options: &ImageOptions) -> Result<Self, OpenError> {
        if is_sparse(raw.as_ref()) {
            Self::from_sparse(raw, block_map, options)
        } else {
            Self::from_raw(raw, block_map, options)
        }
    }

    /// Opens a sparse image.
    ///
    /// # Errors
    ///
    /// Fails if the header or any chunk is malformed, or if the block map
    /// claims blocks the image does not carry.
    pub fn from_sparse(raw: R, block_map: &str, options: &ImageOptions) -> Result<Self, OpenError> {
        let header = SparseHeader::read(raw.as_ref()).context(ReadHeaderFailedSnafu)?;
        let index = ChunkIndex::read(raw.as_ref(), &header).context(ReadChunksFailedSnafu)?;

        debug!(
            block_size = header.block_size(),
            total_blocks = header.total_blocks(),
            chunks = header.total_chunks(),
            "parsed sparse header"
        );

        Self::build(raw, true, header.block_size(), index, block_map, options)
    }

    /// Opens an image without a sparse header, treating the whole file as one
    /// raw chunk of `raw_block_size` blocks.
    pub fn from_raw(raw: R, block_map: &str, options: &ImageOptions) -> Result<Self, OpenError> {
        let size = options.raw_block_size;
        ensure!(size != 0 && size % 4 == 0, InvalidRawBlockSizeSnafu { size });

        let len = raw.as_ref().len() as u64;
        let total_blocks = len / u64::from(size);

        if len % u64::from(size) != 0 {
            warn!(
                trailing = len % u64::from(size),
                "ignoring partial block at the end of raw image"
            );
        }

        let index = ChunkIndex::raw(total_blocks);

        Self::build(raw, false, size, index, block_map, options)
    }

    fn build(
        raw: R,
        sparse: bool,
        block_size: u32,
        index: ChunkIndex,
        block_map: &str,
        options: &ImageOptions,
    ) -> Result<Self, OpenError> {
        let care = index.care_ranges();
        let all = RangeSet::from_range(0, index.total_blocks());
        let extended = care
            .extend_by(options.extend_margin)
            .intersect(&all)
            .subtract(&care);

        let mut image = Self {
            raw,
            sparse,
            block_size,
            index,
            care,
            extended,
            file_map: FileMap::new(),
        };

        let entries = map::parse_block_map(block_map).context(InvalidBlockMapSnafu)?;
        image.file_map = FileMap::build(
            entries,
            &image.care,
            &options.reserved_blocks,
            options.max_blocks_per_group,
            |block| image.is_zero_block(block),
        )
        .context(InvalidBlockMapSnafu)?;

        Ok(image)
    }

    /// Returns `true` if the image was parsed from a sparse file.
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Returns the number of blocks of the unsparsed image.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.index.total_blocks()
    }

    /// Returns the blocks backed by raw or fill chunks.
    pub fn care_ranges(&self) -> &RangeSet {
        &self.care
    }

    /// Returns don't-care blocks within the extend margin of the care blocks.
    pub fn extended_ranges(&self) -> &RangeSet {
        &self.extended
    }

    pub fn file_map(&self) -> &FileMap {
        &self.file_map
    }

    pub fn chunks(&self) -> &ChunkIndex {
        &self.index
    }

    /// Returns the underlying image bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_ref()
    }

    /// Returns an iterator over the content of `ranges`, in block order.
    ///
    /// Raw data is borrowed from the image. Fill and don't-care data is
    /// generated on the fly.
    ///
    /// # Errors
    ///
    /// Returns [`ReadRangeError::PastEnd`] if `ranges` extends past the
    /// last block of the image.
    pub fn read_range<'a>(
        &'a self,
        ranges: &'a RangeSet,
    ) -> Result<RangeReader<'a>, ReadRangeError> {
        let total_blocks = self.total_blocks();
        let end = ranges.end();

        ensure!(end <= total_blocks, PastEndSnafu { end, total_blocks });

        Ok(RangeReader {
            data: self.raw.as_ref(),
            index: &self.index,
            block_size: self.block_size as usize,
            ranges: ranges.iter(),
            current: None,
        })
    }

    /// Reads the content of `ranges` into one buffer.
    pub fn read_to_vec(&self, ranges: &RangeSet) -> Result<Vec<u8>, ReadRangeError> {
        let mut out = Vec::with_capacity((ranges.size() * u64::from(self.block_size)) as usize);

        for data in self.read_range(ranges)? {
            out.extend_from_slice(&data);
        }

        Ok(out)
    }

    /// Writes the content of `ranges` to `writer`, returning the number of
    /// bytes written.
    pub fn write_range_to<W: Write>(
        &self,
        ranges: &RangeSet,
        mut writer: W,
    ) -> Result<u64, WriteRangeError> {
        let mut written = 0;

        for data in self.read_range(ranges).context(write_range_error::ReadSnafu)? {
            writer
                .write_all(&data)
                .context(write_range_error::WriteSnafu)?;
            written += data.len() as u64;
        }

        Ok(written)
    }

    /// Digests the content of `ranges` and returns it as lowercase hex.
    pub fn digest(
        &self,
        ranges: &RangeSet,
        algorithm: HashAlgorithm,
    ) -> Result<String, ReadRangeError> {
        let mut hasher = algorithm.hasher();

        for data in self.read_range(ranges)? {
            hasher.update(&data);
        }

        Ok(hasher.finalize_hex())
    }

    fn is_zero_block(&self, block: u64) -> bool {
        let Some(chunk) = self.index.find(block).map(|i| self.index.chunks()[i]) else {
            return true;
        };

        match chunk.data() {
            ChunkData::Raw { offset } => {
                let bs = self.block_size as usize;
                let start = offset + (block - chunk.start()) as usize * bs;

                self.raw
                    .as_ref()
                    .get(start..start + bs)
                    .is_some_and(|data| data.iter().all(|&b| b == 0))
            }
            _ => chunk.is_zero_fill(),
        }
    }
}

/// Iterator over the content of a block set, returned by
/// [`SparseImage::read_range()`].
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct RangeReader<'a> {
    data: &'a [u8],
    index: &'a ChunkIndex,
    block_size: usize,
    ranges: Ranges<'a>,
    current: Option<(u64, u64)>,
}

impl std::fmt::Debug for RangeReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeReader")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl<'a> Iterator for RangeReader<'a> {
    type Item = Cow<'a, [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let (start, end) = loop {
            match self.current {
                Some((s, e)) if s < e => break (s, e),
                _ => self.current = Some(self.ranges.next()?),
            }
        };

        // Ranges were checked against the image size up front.
        let chunk = self.index.chunks()[self.index.find(start)?];
        let mut blocks = end.min(chunk.end()) - start;

        if !matches!(chunk.data(), ChunkData::Raw { .. }) {
            blocks = blocks.min(MAX_SYNTHESIZED_BLOCKS);
        }

        self.current = Some((start + blocks, end));
        let len = blocks as usize * self.block_size;

        Some(match chunk.data() {
            ChunkData::Raw { offset } => {
                let offset = offset + (start - chunk.start()) as usize * self.block_size;
                Cow::Borrowed(&self.data[offset..offset + len])
            }
            ChunkData::Fill(word) => Cow::Owned(word.repeat(len / 4)),
            ChunkData::DontCare => Cow::Owned(vec![0; len]),
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("invalid sparse header"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("invalid sparse chunk"))]
    ReadChunksFailed { source: chunk::ChunkError },

    #[snafu(display("raw block size must be a non-zero multiple of 4, found {size}"))]
    InvalidRawBlockSize { size: u32 },

    #[snafu(display("block map does not match the image"))]
    InvalidBlockMap { source: map::MapError },
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadRangeError {
    #[snafu(display("range ends at block {end} past the image end {total_blocks}"))]
    PastEnd { end: u64, total_blocks: u64 },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum WriteRangeError {
    #[snafu(display("cannot read blocks"))]
    Read { source: ReadRangeError },

    #[snafu(display("cannot write blocks"))]
    Write { source: std::io::Error },
}
