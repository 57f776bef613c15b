//! Segment Reader
//!
//! Random access into a sealed segment file on local disk.
//!
//! `open()` validates the whole file once (magic bytes, version, CRC32,
//! index consistency) and keeps only the block index in memory. Each `read()`
//! locates the block holding the key with a binary search over block first
//! keys, reads and decompresses that one block, and keeps it as the current
//! block, so ascending scans decode every block exactly once.
//!
//! ## Errors
//!
//! - `InvalidMagic`: File doesn't start or end with "LNRB"
//! - `CrcMismatch`: Checksum mismatch, the file is corrupt or truncated
//! - `InvalidSegment`: Malformed header, index or block contents
//! - `KeyOutOfRange`: The key is not held by this segment

use bytes::{Buf, Bytes};
use linear_core::segment::Compression;
use linear_core::{varint, Error, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{
    IndexEntry, FOOTER_SIZE, HEADER_SIZE, INDEX_ENTRY_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION,
};

/// Chunk size used while verifying the checksum
const CRC_CHUNK_SIZE: usize = 64 * 1024;

/// Reads values from a sealed segment file
pub struct SegmentReader {
    path: PathBuf,
    compression: Compression,
    first_key: u64,
    last_key: u64,
    size_bytes: u64,
    index: Vec<IndexEntry>,
    state: Mutex<ReaderState>,
}

struct ReaderState {
    file: File,
    current: Option<DecodedBlock>,
}

struct DecodedBlock {
    block: usize,
    values: Vec<Bytes>,
}

struct Header {
    compression: Compression,
    first_key: u64,
    last_key: u64,
    record_count: u64,
    block_count: u32,
}

impl SegmentReader {
    /// Open and validate the segment at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let size_bytes = file.metadata()?.len();

        if size_bytes < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(Error::InvalidSegment("Segment too small".to_string()));
        }
        let footer_start = size_bytes - FOOTER_SIZE as u64;

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = Self::parse_header(&header_buf)?;

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(footer_start))?;
        file.read_exact(&mut footer_buf)?;
        let (index_position, stored_crc) = Self::parse_footer(&footer_buf)?;

        let computed_crc = Self::checksum(&mut file, footer_start)?;
        if stored_crc != computed_crc {
            return Err(Error::CrcMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }

        if index_position < HEADER_SIZE as u64 || index_position > footer_start {
            return Err(Error::InvalidSegment(format!(
                "Index position {} outside of segment body",
                index_position
            )));
        }
        let mut index_buf = vec![0u8; (footer_start - index_position) as usize];
        file.seek(SeekFrom::Start(index_position))?;
        file.read_exact(&mut index_buf)?;
        let index = Self::parse_index(&index_buf, &header, index_position)?;

        Ok(Self {
            path,
            compression: header.compression,
            first_key: header.first_key,
            last_key: header.last_key,
            size_bytes,
            index,
            state: Mutex::new(ReaderState {
                file,
                current: None,
            }),
        })
    }

    fn parse_header(mut buf: &[u8]) -> Result<Header> {
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SEGMENT_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = buf.get_u16();
        if version > SEGMENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let compression = Compression::try_from(buf.get_u16())?;
        let first_key = buf.get_u64();
        let last_key = buf.get_u64();
        let record_count = buf.get_u64();
        let block_count = buf.get_u32();

        let held = last_key
            .checked_sub(first_key)
            .and_then(|span| span.checked_add(1));
        if held != Some(record_count) {
            return Err(Error::InvalidSegment(format!(
                "Header range [{}, {}] does not hold {} records",
                first_key, last_key, record_count
            )));
        }

        Ok(Header {
            compression,
            first_key,
            last_key,
            record_count,
            block_count,
        })
    }

    fn parse_footer(mut buf: &[u8]) -> Result<(u64, u32)> {
        let index_position = buf.get_u64();
        let crc = buf.get_u32();

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SEGMENT_MAGIC {
            return Err(Error::InvalidMagic);
        }

        Ok((index_position, crc))
    }

    /// CRC32 of the first `len` bytes of the file
    fn checksum(file: &mut File, len: u64) -> Result<u32> {
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = len;
        let mut chunk = vec![0u8; CRC_CHUNK_SIZE];

        while remaining > 0 {
            let n = remaining.min(CRC_CHUNK_SIZE as u64) as usize;
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }

        Ok(hasher.finalize())
    }

    fn parse_index(mut buf: &[u8], header: &Header, index_position: u64) -> Result<Vec<IndexEntry>> {
        if buf.len() < 4 {
            return Err(Error::InvalidSegment("Index truncated".to_string()));
        }
        let count = buf.get_u32();
        if count != header.block_count || buf.len() != count as usize * INDEX_ENTRY_SIZE {
            return Err(Error::InvalidSegment(format!(
                "Index holds {} entries in {} bytes, header says {} blocks",
                count,
                buf.len(),
                header.block_count
            )));
        }

        let mut index = Vec::with_capacity(count as usize);
        let mut expected_key = header.first_key;
        for _ in 0..count {
            let entry = IndexEntry {
                first_key: buf.get_u64(),
                position: buf.get_u64(),
                length: buf.get_u32(),
                record_count: buf.get_u32(),
            };

            if entry.first_key != expected_key
                || entry.record_count == 0
                || entry.position < HEADER_SIZE as u64
                || entry.position + entry.length as u64 > index_position
            {
                return Err(Error::InvalidSegment(format!(
                    "Corrupt index entry for block starting at key {}",
                    entry.first_key
                )));
            }
            expected_key += entry.record_count as u64;
            index.push(entry);
        }

        if expected_key != header.first_key + header.record_count {
            return Err(Error::InvalidSegment(
                "Index does not cover the header range".to_string(),
            ));
        }

        Ok(index)
    }

    /// Read the value stored for `key`
    pub fn read(&self, key: u64) -> Result<Bytes> {
        if key < self.first_key || key > self.last_key {
            return Err(Error::KeyOutOfRange {
                key,
                first: self.first_key,
                last: self.last_key,
            });
        }

        let block = self.index.partition_point(|e| e.first_key <= key) - 1;
        let offset = (key - self.index[block].first_key) as usize;

        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            if current.block == block {
                return Ok(current.values[offset].clone());
            }
        }

        let values = self.load_block(&mut state.file, block)?;
        let value = values[offset].clone();
        state.current = Some(DecodedBlock { block, values });

        Ok(value)
    }

    fn load_block(&self, file: &mut File, block: usize) -> Result<Vec<Bytes>> {
        let entry = self.index[block];

        let mut stored = vec![0u8; entry.length as usize];
        file.seek(SeekFrom::Start(entry.position))?;
        file.read_exact(&mut stored)?;

        let mut data = match self.compression {
            Compression::None => Bytes::from(stored),
            Compression::Lz4 => Bytes::from(
                lz4_flex::decompress_size_prepended(&stored)
                    .map_err(|e| Error::Decompression(e.to_string()))?,
            ),
        };

        let mut values = Vec::with_capacity(entry.record_count as usize);
        for _ in 0..entry.record_count {
            let len = varint::decode_varint_u64(&mut data)? as usize;
            if data.remaining() < len {
                return Err(Error::InvalidSegment(format!(
                    "Value of {} bytes overruns block {}",
                    len, block
                )));
            }
            values.push(data.split_to(len));
        }

        if data.has_remaining() {
            return Err(Error::InvalidSegment(format!(
                "{} trailing bytes in block {}",
                data.remaining(),
                block
            )));
        }

        Ok(values)
    }

    pub fn first_key(&self) -> u64 {
        self.first_key
    }

    pub fn last_key(&self) -> u64 {
        self.last_key
    }

    pub fn record_count(&self) -> u64 {
        self.last_key - self.first_key + 1
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Size of the segment file in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the file handle
    pub fn close(self) {
        drop(self);
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("path", &self.path)
            .field("first_key", &self.first_key)
            .field("last_key", &self.last_key)
            .field("blocks", &self.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBuilder;
    use tempfile::TempDir;

    fn payload(key: u64) -> Vec<u8> {
        format!("value-{}", key).repeat((key % 7 + 1) as usize).into_bytes()
    }

    fn build(dir: &TempDir, first: u64, count: u64, compression: Compression) -> PathBuf {
        let path = dir.path().join(format!("seg-{}", first));
        let mut builder = SegmentBuilder::create(&path, first, count, compression)
            .unwrap()
            .with_block_size(256);
        for key in first..first + count {
            builder.add(key, &payload(key)).unwrap();
        }
        builder.seal().unwrap();
        path
    }

    #[test]
    fn test_roundtrip_lz4_multi_block() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 1000, 500, Compression::Lz4);

        let reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.first_key(), 1000);
        assert_eq!(reader.last_key(), 1499);
        assert_eq!(reader.record_count(), 500);
        assert!(reader.block_count() > 1);

        for key in 1000..1500 {
            assert_eq!(reader.read(key).unwrap(), Bytes::from(payload(key)));
        }
    }

    #[test]
    fn test_random_access_uncompressed() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 0, 300, Compression::None);
        let reader = SegmentReader::open(&path).unwrap();

        for key in [299, 0, 150, 1, 298, 150] {
            assert_eq!(reader.read(key).unwrap(), Bytes::from(payload(key)));
        }
    }

    #[test]
    fn test_empty_values_are_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let mut builder = SegmentBuilder::create(&path, 0, 3, Compression::Lz4).unwrap();
        builder.add(0, b"").unwrap();
        builder.add(1, b"x").unwrap();
        builder.add(2, b"").unwrap();
        builder.seal().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.read(0).unwrap(), Bytes::new());
        assert_eq!(reader.read(1).unwrap(), Bytes::from_static(b"x"));
        assert_eq!(reader.read(2).unwrap(), Bytes::new());
    }

    #[test]
    fn test_key_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 10, 5, Compression::Lz4);
        let reader = SegmentReader::open(&path).unwrap();

        assert!(matches!(
            reader.read(9),
            Err(Error::KeyOutOfRange {
                key: 9,
                first: 10,
                last: 14
            })
        ));
        assert!(reader.read(15).is_err());
    }

    #[test]
    fn test_corrupted_body_fails_crc() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 0, 50, Compression::None);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 3] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SegmentReader::open(&path),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_header_fails_crc() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 0, 50, Compression::Lz4);

        // Reserved header bytes are still covered by the checksum
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE - 1] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SegmentReader::open(&path),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 0, 50, Compression::Lz4);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(SegmentReader::open(&path).is_err());

        std::fs::write(&path, &bytes[..20]).unwrap();
        assert!(matches!(
            SegmentReader::open(&path),
            Err(Error::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_header_spanning_every_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 0, 5, Compression::None);

        // first_key, last_key and record_count follow magic, version and compression
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8..16].copy_from_slice(&0u64.to_be_bytes());
        bytes[16..24].copy_from_slice(&u64::MAX.to_be_bytes());
        bytes[24..32].copy_from_slice(&0u64.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SegmentReader::open(&path),
            Err(Error::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 0, 5, Compression::None);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0..4].copy_from_slice(b"NOPE");
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(SegmentReader::open(&path), Err(Error::InvalidMagic)));
    }
}
