//! In-memory sparse image builder.
//!
//! Chunks are written exactly as requested. Nothing checks them against the
//! header, so malformed images can be produced on purpose.

use crate::header::{ChunkHeader, ChunkType, SparseHeader};

/// Builds a sparse image chunk by chunk.
///
/// # Example
///
/// ```
/// use blockota_image::writer::SparseWriter;
///
/// let image = SparseWriter::new(4096, 3)
///     .raw(&[0xAA; 4096])
///     .fill([0, 0, 0, 0], 2)
///     .finish();
///
/// assert!(blockota_image::is_sparse(&image));
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct SparseWriter {
    block_size: u32,
    total_blocks: u32,
    chunks: u32,
    body: Vec<u8>,
}

impl SparseWriter {
    pub fn new(block_size: u32, total_blocks: u32) -> Self {
        Self {
            block_size,
            total_blocks,
            chunks: 0,
            body: Vec::new(),
        }
    }

    /// Appends a raw chunk.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not a whole number of blocks.
    pub fn raw(mut self, data: &[u8]) -> Self {
        assert!(
            data.len() % self.block_size as usize == 0,
            "raw chunk data must be a whole number of blocks"
        );

        let blocks = (data.len() / self.block_size as usize) as u32;
        self.push(ChunkType::Raw, blocks, data);
        self
    }

    /// Appends a fill chunk repeating `word` over `blocks` blocks.
    pub fn fill(mut self, word: [u8; 4], blocks: u32) -> Self {
        self.push(ChunkType::Fill, blocks, &word);
        self
    }

    /// Appends a don't-care chunk.
    pub fn dont_care(mut self, blocks: u32) -> Self {
        self.push(ChunkType::DontCare, blocks, &[]);
        self
    }

    /// Appends a CRC32 chunk.
    pub fn crc32(mut self, crc: u32) -> Self {
        self.push(ChunkType::Crc32, 0, &crc.to_le_bytes());
        self
    }

    fn push(&mut self, kind: ChunkType, blocks: u32, body: &[u8]) {
        let header = ChunkHeader::new(kind, blocks, body.len() as u32);

        self.body.extend_from_slice(header.as_bytes());
        self.body.extend_from_slice(body);
        self.chunks += 1;
    }

    /// Returns the complete image.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let header = SparseHeader::new(self.block_size, self.total_blocks, self.chunks);
        let mut out = Vec::with_capacity(header.as_bytes().len() + self.body.len());

        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
