//! Segment Builder
//!
//! Streams a dense run of values into a segment file on local disk. Values
//! accumulate in an in-memory block; full blocks are compressed and written
//! straight to the file, so memory stays bounded by one block no matter how
//! large the segment grows.
//!
//! The header is written last: a zeroed placeholder reserves its space and is
//! overwritten by `seal()` once the key range and block count are known.
//! The CRC in the footer covers the final header followed by every block and
//! the index.
//!
//! A builder that is dropped without `seal()` leaves a partial file behind.
//! Readers reject it (no valid footer).

use bytes::{BufMut, BytesMut};
use linear_core::segment::Compression;
use linear_core::{varint, Error, Result};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    IndexEntry, BLOCK_SIZE_TARGET, FOOTER_SIZE, HEADER_SIZE, INDEX_ENTRY_SIZE, SEGMENT_MAGIC,
    SEGMENT_VERSION,
};

/// Rough number of values per block, used to presize the block index
const VALUES_PER_BLOCK_HINT: u64 = 1024;

/// Upper bound on index entries reserved up front
const MAX_PREALLOCATED_BLOCKS: u64 = 4096;

/// Result of sealing a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSegment {
    pub path: PathBuf,
    pub first_key: u64,
    pub last_key: u64,
    pub size_bytes: u64,
}

/// Builds a segment file with block compression and an index
pub struct SegmentBuilder {
    path: PathBuf,
    file: BufWriter<File>,
    compression: Compression,
    block_size_target: usize,

    first_key: u64,
    next_key: u64,

    /// Block being filled
    current_block: BytesMut,
    block_first_key: u64,
    block_records: u32,

    /// One entry per written block
    index: Vec<IndexEntry>,

    /// File position of the next block
    position: u64,

    /// CRC of everything after the header written so far
    body_crc: crc32fast::Hasher,
}

impl SegmentBuilder {
    /// Create (or truncate) `path` and start a segment whose first key is
    /// `first_key`. `count_hint` is the expected number of values.
    pub fn create(
        path: impl AsRef<Path>,
        first_key: u64,
        count_hint: u64,
        compression: Compression,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(&[0u8; HEADER_SIZE])?;

        let estimated_blocks =
            (count_hint / VALUES_PER_BLOCK_HINT + 1).min(MAX_PREALLOCATED_BLOCKS) as usize;

        Ok(Self {
            path,
            file,
            compression,
            block_size_target: BLOCK_SIZE_TARGET,
            first_key,
            next_key: first_key,
            current_block: BytesMut::with_capacity(BLOCK_SIZE_TARGET),
            block_first_key: first_key,
            block_records: 0,
            index: Vec::with_capacity(estimated_blocks),
            position: HEADER_SIZE as u64,
            body_crc: crc32fast::Hasher::new(),
        })
    }

    /// Override the uncompressed block size target
    pub fn with_block_size(mut self, block_size_target: usize) -> Self {
        self.block_size_target = block_size_target.max(1);
        self
    }

    /// Append the value for `key`. Keys must be dense and ascending.
    pub fn add(&mut self, key: u64, data: &[u8]) -> Result<()> {
        if key != self.next_key {
            return Err(Error::NonContiguousKey {
                expected: self.next_key,
                got: key,
            });
        }
        let next_key = key
            .checked_add(1)
            .ok_or_else(|| Error::InvalidSegment(format!("Key {} cannot be followed", key)))?;

        if self.current_block.len() >= self.block_size_target {
            self.flush_block()?;
        }

        if self.block_records == 0 {
            self.block_first_key = key;
        }

        varint::encode_varint_u64(&mut self.current_block, data.len() as u64);
        self.current_block.put_slice(data);

        self.block_records += 1;
        self.next_key = next_key;

        Ok(())
    }

    /// Compress the current block and write it out
    fn flush_block(&mut self) -> Result<()> {
        if self.block_records == 0 {
            return Ok(());
        }

        let stored = match self.compression {
            Compression::None => self.current_block.to_vec(),
            Compression::Lz4 => lz4_flex::compress_prepend_size(&self.current_block),
        };

        self.file.write_all(&stored)?;
        self.body_crc.update(&stored);

        self.index.push(IndexEntry {
            first_key: self.block_first_key,
            position: self.position,
            length: stored.len() as u32,
            record_count: self.block_records,
        });

        self.position += stored.len() as u64;
        self.current_block.clear();
        self.block_records = 0;

        Ok(())
    }

    /// Number of values added so far
    pub fn record_count(&self) -> u64 {
        self.next_key - self.first_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the last block, write index, footer and header, and fsync
    pub fn seal(mut self) -> Result<SealedSegment> {
        self.flush_block()?;

        if self.next_key == self.first_key {
            return Err(Error::InvalidSegment("No records written".to_string()));
        }
        let last_key = self.next_key - 1;

        // Index
        let index_position = self.position;
        let mut index = BytesMut::with_capacity(4 + self.index.len() * INDEX_ENTRY_SIZE);
        index.put_u32(self.index.len() as u32);
        for entry in &self.index {
            index.put_u64(entry.first_key);
            index.put_u64(entry.position);
            index.put_u32(entry.length);
            index.put_u32(entry.record_count);
        }
        self.file.write_all(&index)?;
        self.body_crc.update(&index);

        // Header, then CRC over header followed by the body
        let header = self.encode_header(last_key);
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.combine(&self.body_crc);

        // Footer
        let mut footer = BytesMut::with_capacity(FOOTER_SIZE);
        footer.put_u64(index_position);
        footer.put_u32(crc.finalize());
        footer.put_slice(&SEGMENT_MAGIC);
        footer.put_bytes(0, 16);
        self.file.write_all(&footer)?;

        let size_bytes = index_position + index.len() as u64 + FOOTER_SIZE as u64;

        let mut file = self
            .file
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(SealedSegment {
            path: self.path,
            first_key: self.first_key,
            last_key,
            size_bytes,
        })
    }

    fn encode_header(&self, last_key: u64) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(&SEGMENT_MAGIC); // 4 bytes
        buf.put_u16(SEGMENT_VERSION); // 2 bytes
        buf.put_u16(self.compression as u16); // 2 bytes
        buf.put_u64(self.first_key); // 8 bytes
        buf.put_u64(last_key); // 8 bytes
        buf.put_u64(self.next_key - self.first_key); // 8 bytes
        buf.put_u32(self.index.len() as u32); // 4 bytes

        // Reserved space (28 bytes)
        buf.put_bytes(0, 28);
        buf
    }
}
