//! Head Log - File-backed Local Log
//!
//! The head holds the most recent records of a dataset on local disk until
//! they are sealed into a segment and uploaded. After a successful upload the
//! archived prefix is purged.
//!
//! ## File Format
//!
//! `<dir>/head.log` is a sequence of frames (little endian):
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬──────────────┐
//! │ Size (4B)  │ CRC32 (4B) │ Index (8B) │ Data (N B)   │
//! └────────────┴────────────┴────────────┴──────────────┘
//! Size = 4 + 8 + N, CRC32 covers index and data
//! ```
//!
//! `<dir>/head.json` records `first_index`, the index of the first record not
//! yet purged. It keeps the gap rules intact when the head is empty: after
//! archiving `[0, 99]` the next append must be 100.
//!
//! ## Recovery
//!
//! `open()` replays the frames and rebuilds the position table:
//! - a partial frame at the end (torn write) is truncated away
//! - a CRC mismatch in the last frame is treated the same way
//! - a CRC mismatch anywhere else is corruption and fails the open
//! - frames below `first_index` were already archived and are skipped

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::log::LocalLog;

const LOG_FILE: &str = "head.log";
const META_FILE: &str = "head.json";

/// Size and CRC fields preceding every frame body
const FRAME_PREFIX: u64 = 8;

/// Index field at the start of every frame body
const INDEX_FIELD: u32 = 8;

/// Reserved so that the index after any held record is representable
pub const MAX_INDEX: u64 = u64::MAX;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Directory holding `head.log` and `head.json`
    pub directory: PathBuf,

    /// fsync after every append (default: true)
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_sync_writes() -> bool {
    true
}

impl HeadConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sync_writes: default_sync_writes(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeadMeta {
    first_index: Option<u64>,
}

/// Location of one frame in the log file
#[derive(Debug, Clone, Copy)]
struct Slot {
    position: u64,
    /// Frame size including the size and CRC fields
    frame_len: u64,
}

struct HeadState {
    file: File,

    /// Index of `slots[0]`, or of the next append when `slots` is empty
    base: Option<u64>,

    /// One slot per held record, dense from `base`
    slots: Vec<Slot>,

    /// End of the last valid frame
    end: u64,

    /// When the oldest held record was appended (approximate after restart)
    oldest_append: Option<Instant>,
}

impl HeadState {
    fn first(&self) -> Option<u64> {
        self.base.filter(|_| !self.slots.is_empty())
    }

    fn last(&self) -> Option<u64> {
        self.first().map(|first| first + self.slots.len() as u64 - 1)
    }

    fn size_bytes(&self) -> u64 {
        self.slots.iter().map(|s| s.frame_len).sum()
    }

    /// Check that `index` may be appended next
    fn check_next(&self, index: u64) -> Result<()> {
        let expected = match (self.last(), self.base) {
            (Some(last), _) => last.checked_add(1).ok_or(Error::IndexOutOfRange(index))?,
            (None, Some(base)) => base,
            (None, None) => return Ok(()),
        };

        if index < expected {
            Err(Error::IndexNotIncreasing {
                last: expected.saturating_sub(1),
                got: index,
            })
        } else if index > expected {
            Err(Error::IndexGap {
                expected,
                got: index,
            })
        } else {
            Ok(())
        }
    }
}

/// File-backed local log holding the unarchived records of a dataset
pub struct HeadLog {
    config: HeadConfig,
    state: Mutex<HeadState>,
}

impl HeadLog {
    /// Open or create the head log in `config.directory` and recover its state
    pub async fn open(config: HeadConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await?;

        let meta = read_meta(&config.directory).await?;
        let path = config.directory.join(LOG_FILE);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let (base, slots, end) = Self::recover(&mut file, &path, meta.first_index).await?;
        let file_len = file.metadata().await?.len();
        if file_len > end {
            warn!(path = ?path, valid = end, len = file_len, "Truncating torn tail of head log");
            file.set_len(end).await?;
            file.sync_all().await?;
        }

        let state = HeadState {
            file,
            base,
            oldest_append: (!slots.is_empty()).then(Instant::now),
            slots,
            end,
        };

        info!(
            path = ?path,
            first_index = ?state.first(),
            last_index = ?state.last(),
            size = state.size_bytes(),
            "Head log opened"
        );

        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    /// Replay frames, returning `(base, slots, end of last valid frame)`
    async fn recover(
        file: &mut File,
        path: &Path,
        purged_below: Option<u64>,
    ) -> Result<(Option<u64>, Vec<Slot>, u64)> {
        let len = file.metadata().await?.len();
        file.seek(SeekFrom::Start(0)).await?;
        let mut reader = BufReader::new(&mut *file);

        let mut base = purged_below;
        let mut slots: Vec<Slot> = Vec::new();
        let mut position = 0u64;

        loop {
            let mut size_buf = [0u8; 4];
            match reader.read_exact(&mut size_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let frame_size = u32::from_le_bytes(size_buf);
            if frame_size < 4 + INDEX_FIELD {
                warn!(path = ?path, position, "Invalid frame size in head log, truncating");
                break;
            }

            let mut frame = vec![0u8; frame_size as usize];
            match reader.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(path = ?path, position, "Partial record at end of head log, truncating");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let frame_len = 4 + frame_size as u64;
            let stored_crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            if stored_crc != crc32fast::hash(&frame[4..]) {
                if position + frame_len == len {
                    warn!(path = ?path, position, "Corrupted last record in head log, truncating");
                    break;
                }
                return Err(Error::CorruptedLog { position });
            }

            let mut index_buf = [0u8; 8];
            index_buf.copy_from_slice(&frame[4..12]);
            let index = u64::from_le_bytes(index_buf);

            let slot = Slot {
                position,
                frame_len,
            };
            position += frame_len;

            match (base, slots.is_empty()) {
                (Some(b), true) if index < b => {
                    debug!(index, "Skipping already archived record in head log");
                    continue;
                }
                (Some(b), true) if index > b => {
                    warn!(path = ?path, expected = b, got = index, "Head log starts after a gap");
                    base = Some(index);
                }
                (None, true) => base = Some(index),
                (Some(b), false) if index != b + slots.len() as u64 => {
                    return Err(Error::CorruptedLog {
                        position: slot.position,
                    });
                }
                _ => {}
            }
            slots.push(slot);
        }

        Ok((base, slots, position))
    }

    fn encode_frame(index: u64, data: &[u8]) -> Vec<u8> {
        let frame_size = 4 + INDEX_FIELD + data.len() as u32;
        let mut buffer = Vec::with_capacity(frame_size as usize + 4);

        let mut crc = crc32fast::Hasher::new();
        crc.update(&index.to_le_bytes());
        crc.update(data);

        buffer.extend_from_slice(&frame_size.to_le_bytes());
        buffer.extend_from_slice(&crc.finalize().to_le_bytes());
        buffer.extend_from_slice(&index.to_le_bytes());
        buffer.extend_from_slice(data);
        buffer
    }

    /// Append one record
    pub async fn append(&self, index: u64, data: &[u8]) -> Result<()> {
        self.append_batch(&[(index, Bytes::copy_from_slice(data))])
            .await
    }

    /// Append a run of records with one write. Either all are appended or none.
    pub async fn append_batch(&self, records: &[(u64, Bytes)]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        let mut buffer = Vec::new();
        let mut frames = Vec::with_capacity(records.len());
        let mut expected = None;
        for (index, data) in records {
            if *index == MAX_INDEX {
                return Err(Error::IndexOutOfRange(*index));
            }
            match expected {
                None => state.check_next(*index)?,
                Some(expected) if *index != expected => {
                    return Err(if *index < expected {
                        Error::IndexNotIncreasing {
                            last: expected - 1,
                            got: *index,
                        }
                    } else {
                        Error::IndexGap {
                            expected,
                            got: *index,
                        }
                    });
                }
                Some(_) => {}
            }
            expected = Some(index + 1);

            let frame = Self::encode_frame(*index, data);
            frames.push(frame.len() as u64);
            buffer.extend_from_slice(&frame);
        }

        let end = state.end;
        state.file.seek(SeekFrom::Start(end)).await?;
        state.file.write_all(&buffer).await?;
        state.file.flush().await?;
        if self.config.sync_writes {
            state.file.sync_data().await?;
        }

        if state.slots.is_empty() {
            state.base = Some(records[0].0);
            state.oldest_append = Some(Instant::now());
        }
        let mut position = end;
        for frame_len in frames {
            state.slots.push(Slot {
                position,
                frame_len,
            });
            position += frame_len;
        }
        state.end = position;

        Ok(())
    }

    /// Read the record stored for `index`
    pub async fn read(&self, index: u64) -> Result<Bytes> {
        let mut state = self.state.lock().await;

        let slot = match state.first() {
            Some(first) if index >= first && index - first < state.slots.len() as u64 => {
                state.slots[(index - first) as usize]
            }
            _ => return Err(Error::NotFound(index)),
        };

        let mut frame = vec![0u8; slot.frame_len as usize];
        state.file.seek(SeekFrom::Start(slot.position)).await?;
        state.file.read_exact(&mut frame).await?;

        let data_start = (FRAME_PREFIX + INDEX_FIELD as u64) as usize;
        Ok(Bytes::from(frame).slice(data_start..))
    }

    /// Drop every record up to and including `index`.
    ///
    /// Records after `index` are kept. The log file is rewritten so only held
    /// records remain on disk.
    pub async fn purge_through(&self, index: u64) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(first) = state.first() else {
            let next = index.saturating_add(1);
            if state.base.map_or(true, |base| base < next) {
                state.base = Some(next);
                write_meta(&self.config.directory, next).await?;
            }
            return Ok(());
        };
        if index < first {
            return Ok(());
        }

        let drop_count = usize::try_from(index - first)
            .map_or(usize::MAX, |n| n.saturating_add(1))
            .min(state.slots.len());
        let keep_from = state
            .slots
            .get(drop_count)
            .map(|s| s.position)
            .unwrap_or(state.end);

        // Persist the purge point first: frames below it are skipped on recovery
        let new_base = first + drop_count as u64;
        write_meta(&self.config.directory, new_base).await?;

        // Copy the kept tail into a fresh file and swap it in
        let path = self.config.directory.join(LOG_FILE);
        let tmp_path = self.config.directory.join(format!("{}.tmp", LOG_FILE));
        let mut tail = vec![0u8; (state.end - keep_from) as usize];
        state.file.seek(SeekFrom::Start(keep_from)).await?;
        state.file.read_exact(&mut tail).await?;

        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&tail).await?;
        tmp.sync_all().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &path).await?;

        state.file = OpenOptions::new().read(true).write(true).open(&path).await?;
        state.slots.drain(..drop_count);
        for slot in state.slots.iter_mut() {
            slot.position -= keep_from;
        }
        state.end -= keep_from;
        state.base = Some(new_base);
        if state.slots.is_empty() {
            state.oldest_append = None;
        }

        debug!(
            through = index,
            remaining = state.slots.len(),
            "Purged head log"
        );

        Ok(())
    }

    pub async fn first_index(&self) -> Option<u64> {
        self.state.lock().await.first()
    }

    pub async fn last_index(&self) -> Option<u64> {
        self.state.lock().await.last()
    }

    /// Index the next append must carry, when known
    pub async fn next_index(&self) -> Option<u64> {
        let state = self.state.lock().await;
        match state.last() {
            Some(last) => last.checked_add(1),
            None => state.base,
        }
    }

    /// Number of held records
    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes of held frames on disk
    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.size_bytes()
    }

    /// Age of the oldest held record
    pub async fn oldest_age(&self) -> Option<Duration> {
        self.state
            .lock()
            .await
            .oldest_append
            .map(|at| at.elapsed())
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }
}

#[async_trait]
impl LocalLog for HeadLog {
    async fn first_index(&self) -> Option<u64> {
        HeadLog::first_index(self).await
    }

    async fn last_index(&self) -> Option<u64> {
        HeadLog::last_index(self).await
    }

    async fn append(&self, index: u64, data: Bytes) -> Result<()> {
        self.append_batch(&[(index, data)]).await
    }

    async fn read(&self, index: u64) -> Result<Bytes> {
        HeadLog::read(self, index).await
    }
}

async fn read_meta(dir: &Path) -> Result<HeadMeta> {
    match tokio::fs::read(dir.join(META_FILE)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HeadMeta::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_meta(dir: &Path, first_index: u64) -> Result<()> {
    let meta = HeadMeta {
        first_index: Some(first_index),
    };
    let tmp = dir.join(format!("{}.tmp", META_FILE));
    tokio::fs::write(&tmp, serde_json::to_vec(&meta)?).await?;
    tokio::fs::rename(&tmp, dir.join(META_FILE)).await?;
    Ok(())
}
