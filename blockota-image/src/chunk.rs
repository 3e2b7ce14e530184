//! Index of the chunks making up a sparse image.
//!
//! The index tiles `[0, total_blocks)` completely: don't-care chunks are
//! kept (they read back as zeros) and any blocks left uncovered after the
//! last stored chunk get a synthetic don't-care chunk. This lets every block
//! lookup be a single binary search over the chunk start blocks.

use crate::header::{CHUNK_HEADER_SIZE, ChunkHeader, ChunkType, HEADER_SIZE, SparseHeader};
use crate::ranges::RangeSet;
use snafu::{OptionExt, Snafu, ensure};

use chunk_error::*;

/// Where the content of a chunk comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// Bytes stored at this offset of the image file.
    Raw { offset: usize },
    /// A 4-byte word repeated over the whole chunk.
    Fill([u8; 4]),
    /// No content. Reads as zeros.
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    start: u64,
    blocks: u64,
    data: ChunkData,
}

impl Chunk {
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.blocks
    }

    #[must_use]
    pub const fn blocks(&self) -> u64 {
        self.blocks
    }

    #[must_use]
    pub const fn data(&self) -> ChunkData {
        self.data
    }

    /// Returns `true` for chunks that carry content (raw or fill).
    #[must_use]
    pub const fn is_care(&self) -> bool {
        !matches!(self.data, ChunkData::DontCare)
    }

    /// Returns `true` if every byte of this chunk is known to be zero
    /// without reading it.
    #[must_use]
    pub fn is_zero_fill(&self) -> bool {
        match self.data {
            ChunkData::Fill(word) => word == [0; 4],
            ChunkData::DontCare => true,
            ChunkData::Raw { .. } => false,
        }
    }
}

/// Binary-searchable list of chunks.
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    chunks: Vec<Chunk>,
    starts: Vec<u64>,
    total_blocks: u64,
}

impl ChunkIndex {
    /// Walks the chunk headers following the file header of `image`.
    ///
    /// # Errors
    ///
    /// Fails on the first chunk whose header is truncated, whose type is
    /// unknown or CRC32, whose body size disagrees with its type, whose data
    /// lies past the end of `image`, or which ends past the total block count.
    pub fn read(image: &[u8], header: &SparseHeader) -> Result<Self, ChunkError> {
        let block_size = u64::from(header.block_size());
        let total_blocks = u64::from(header.total_blocks());
        let mut chunks = Vec::with_capacity(header.total_chunks() as usize + 1);
        let mut offset = HEADER_SIZE;
        let mut block = 0u64;

        for index in 0..header.total_chunks() {
            let chunk = image
                .get(offset..)
                .and_then(ChunkHeader::read)
                .context(TruncatedHeaderSnafu { index })?;
            offset += CHUNK_HEADER_SIZE;

            let code = chunk.type_code();
            let kind = ChunkType::from_u16(code).context(UnknownTypeSnafu { index, code })?;
            let size = chunk.body_size().context(TotalSizeTooSmallSnafu {
                index,
                size: chunk.total_size(),
            })?;
            let blocks = u64::from(chunk.blocks());

            let data = match kind {
                ChunkType::Raw => {
                    let expected = blocks * block_size;
                    ensure!(
                        u64::from(size) == expected,
                        RawSizeMismatchSnafu {
                            index,
                            expected,
                            size,
                        }
                    );
                    ChunkData::Raw { offset }
                }
                ChunkType::Fill => {
                    ensure!(size == 4, FillSizeMismatchSnafu { index, size });
                    let word = image
                        .get(offset..offset + 4)
                        .context(DataOutOfBoundsSnafu { index, offset, size })?;
                    ChunkData::Fill([word[0], word[1], word[2], word[3]])
                }
                ChunkType::DontCare => {
                    ensure!(size == 0, DontCareNotEmptySnafu { index, size });
                    ChunkData::DontCare
                }
                ChunkType::Crc32 => return Crc32UnsupportedSnafu { index }.fail(),
            };

            ensure!(
                image.len() >= offset + size as usize,
                DataOutOfBoundsSnafu { index, offset, size }
            );

            let end_block = block + blocks;
            ensure!(
                end_block <= total_blocks,
                EndBlockExceedsTotalSnafu {
                    index,
                    end_block,
                    total_blocks,
                }
            );

            if blocks != 0 {
                chunks.push(Chunk {
                    start: block,
                    blocks,
                    data,
                });
            }

            offset += size as usize;
            block = end_block;
        }

        if block < total_blocks {
            chunks.push(Chunk {
                start: block,
                blocks: total_blocks - block,
                data: ChunkData::DontCare,
            });
        }

        Ok(Self::from_chunks(chunks, total_blocks))
    }

    /// Index for a plain image: one raw chunk starting at file offset 0.
    #[must_use]
    pub fn raw(total_blocks: u64) -> Self {
        let chunks = if total_blocks == 0 {
            Vec::new()
        } else {
            vec![Chunk {
                start: 0,
                blocks: total_blocks,
                data: ChunkData::Raw { offset: 0 },
            }]
        };

        Self::from_chunks(chunks, total_blocks)
    }

    fn from_chunks(chunks: Vec<Chunk>, total_blocks: u64) -> Self {
        let starts = chunks.iter().map(Chunk::start).collect();

        Self {
            chunks,
            starts,
            total_blocks,
        }
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[must_use]
    pub const fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Returns the position of the chunk holding `block`.
    #[must_use]
    pub fn find(&self, block: u64) -> Option<usize> {
        if block >= self.total_blocks {
            return None;
        }

        self.starts
            .partition_point(|&start| start <= block)
            .checked_sub(1)
    }

    /// Returns the blocks covered by raw and fill chunks.
    pub fn care_ranges(&self) -> RangeSet {
        let endpoints = self
            .chunks
            .iter()
            .filter(|c| c.is_care())
            .flat_map(|c| [c.start(), c.end()])
            .collect();

        RangeSet::from_endpoints(endpoints)
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ChunkError {
    #[snafu(display("chunk #{index} header is truncated"))]
    TruncatedHeader { index: u32 },

    #[snafu(display("chunk #{index} has unknown type {code:#06x}"))]
    UnknownType { index: u32, code: u16 },

    #[snafu(display("chunk #{index} is a CRC32 chunk, which is not supported"))]
    Crc32Unsupported { index: u32 },

    #[snafu(display("chunk #{index} total size {size} is smaller than its header"))]
    TotalSizeTooSmall { index: u32, size: u32 },

    #[snafu(display("raw chunk #{index} holds {size} bytes but covers {expected}"))]
    RawSizeMismatch { index: u32, expected: u64, size: u32 },

    #[snafu(display("fill chunk #{index} holds {size} bytes instead of 4"))]
    FillSizeMismatch { index: u32, size: u32 },

    #[snafu(display("don't care chunk #{index} holds {size} bytes"))]
    DontCareNotEmpty { index: u32, size: u32 },

    #[snafu(display("chunk #{index} data ({size} bytes at {offset:#x}) is past end of image"))]
    DataOutOfBounds { index: u32, offset: usize, size: u32 },

    #[snafu(display("chunk #{index} ends at block {end_block} past total blocks {total_blocks}"))]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u64,
        total_blocks: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SparseWriter;

    fn index_of(image: &[u8]) -> Result<ChunkIndex, ChunkError> {
        let header = SparseHeader::read(image).unwrap();
        ChunkIndex::read(image, &header)
    }

    #[test]
    fn tiles_every_block() {
        let image = SparseWriter::new(16, 12)
            .raw(&[1; 32])
            .dont_care(3)
            .fill([0; 4], 4)
            .finish();

        let index = index_of(&image).unwrap();
        let starts: Vec<u64> = index.chunks().iter().map(Chunk::start).collect();

        // 2 raw + 3 don't care + 4 fill + 3 trailing blocks.
        assert_eq!(starts, [0, 2, 5, 9]);
        assert_eq!(index.find(0), Some(0));
        assert_eq!(index.find(4), Some(1));
        assert_eq!(index.find(8), Some(2));
        assert_eq!(index.find(11), Some(3));
        assert_eq!(index.find(12), None);
        assert_eq!(index.care_ranges(), "0-1 5-8".parse().unwrap());
        assert!(index.chunks()[2].is_zero_fill());
    }

    #[test]
    fn rejects_chunk_past_total_blocks() {
        let image = SparseWriter::new(16, 4).dont_care(2).raw(&[7; 48]).finish();

        assert!(matches!(
            index_of(&image),
            Err(ChunkError::EndBlockExceedsTotal {
                index: 1,
                end_block: 5,
                total_blocks: 4
            })
        ));
    }

    #[test]
    fn rejects_crc32_chunks() {
        let image = SparseWriter::new(16, 4).raw(&[7; 16]).crc32(0).finish();

        assert!(matches!(
            index_of(&image),
            Err(ChunkError::Crc32Unsupported { index: 1 })
        ));
    }

    #[test]
    fn rejects_raw_size_mismatch() {
        let mut image = SparseWriter::new(16, 4).raw(&[7; 32]).finish();
        // Claim three blocks for a two block body.
        image[HEADER_SIZE + 4] = 3;

        assert!(matches!(
            index_of(&image),
            Err(ChunkError::RawSizeMismatch {
                index: 0,
                expected: 48,
                size: 32
            })
        ));
    }

    #[test]
    fn rejects_truncated_data() {
        let image = SparseWriter::new(16, 4).raw(&[7; 32]).finish();

        assert!(matches!(
            index_of(&image[..image.len() - 1]),
            Err(ChunkError::DataOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn raw_index_is_one_chunk() {
        let index = ChunkIndex::raw(8);

        assert_eq!(index.chunks().len(), 1);
        assert_eq!(index.find(7), Some(0));
        assert_eq!(index.care_ranges(), RangeSet::from_range(0, 8));
        assert!(ChunkIndex::raw(0).care_ranges().is_empty());
    }
}
