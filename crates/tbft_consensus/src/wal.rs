//! Write-ahead log of the consensus engine.
//!
//! The log is a single file of length-delimited [`WalFrame`]s, each carrying its index and an
//! opaque payload (an encoded [`WalEntry`]). Indices start at 1 and are contiguous. A frame that
//! was only partially written when the process died is dropped when the log is reopened.

#[cfg(test)]
#[path = "wal_test.rs"]
mod wal_test;

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tbft_protobuf::codec::{FrameError, ProstFrameCodec};
use tbft_protobuf::consensus::WalEntry;
use tbft_protobuf::converters::ProtobufConversionError;
use tracing::{debug, info, warn};

const LOG_FILE_NAME: &str = "wal.log";
const TMP_FILE_NAME: &str = "wal.log.tmp";
const LOCK_FILE_NAME: &str = "LOCK";
// Index varint and the field tags around the payload.
const FRAME_OVERHEAD: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum WalError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Entry(#[from] ProtobufConversionError),
    #[error("WAL entry of {len} bytes exceeds the maximum of {max} bytes.")]
    EntryTooLarge { len: usize, max: usize },
    #[error("WAL index out of order: expected {expected}, found {found}.")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("WAL index {0} not found.")]
    NotFound(u64),
    #[error("WAL directory {0} is locked by another process.")]
    Locked(PathBuf),
}

#[derive(Clone, PartialEq, prost::Message)]
struct WalFrame {
    #[prost(uint64, tag = "1")]
    index: u64,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct FramePosition {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    file: File,
    // Held for the lifetime of the log.
    _lock: File,
    codec: ProstFrameCodec<WalFrame>,
    max_entry_size: usize,
    sync_on_write: bool,
    next_index: u64,
    positions: VecDeque<FramePosition>,
    end: usize,
}

impl Wal {
    /// Opens (or creates) the log in `dir`, taking an exclusive lock on the directory.
    pub fn open(dir: &Path, max_entry_size: usize, sync_on_write: bool) -> Result<Self, WalError> {
        fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE_NAME))?;
        lock.try_lock_exclusive().map_err(|_| WalError::Locked(dir.to_path_buf()))?;

        let mut wal = Self {
            dir: dir.to_path_buf(),
            file: open_log(&dir.join(LOG_FILE_NAME))?,
            _lock: lock,
            codec: ProstFrameCodec::new(max_entry_size.saturating_add(FRAME_OVERHEAD)),
            max_entry_size,
            sync_on_write,
            next_index: 1,
            positions: VecDeque::new(),
            end: 0,
        };
        wal.load()?;
        info!(
            dir = %wal.dir.display(),
            first_index = wal.first_index(),
            last_index = wal.last_index(),
            "Opened WAL."
        );
        Ok(wal)
    }

    fn load(&mut self) -> Result<(), WalError> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;

        self.positions.clear();
        let mut expected = None;
        let mut offset = 0;
        while offset < bytes.len() {
            let Some((frame, len)) = self.codec.decode(&bytes[offset..])? else {
                warn!(
                    dir = %self.dir.display(),
                    "Dropping {} bytes of a torn WAL frame.",
                    bytes.len() - offset
                );
                break;
            };
            if let Some(expected) = expected {
                if frame.index != expected {
                    return Err(WalError::OutOfOrder { expected, found: frame.index });
                }
            }
            expected = Some(frame.index + 1);
            self.positions.push_back(FramePosition { offset, len });
            offset += len;
        }

        if offset < bytes.len() {
            self.file.set_len(file_offset(offset)?)?;
        }
        self.file.seek(SeekFrom::Start(file_offset(offset)?))?;
        self.end = offset;
        self.next_index = expected.unwrap_or(1);
        Ok(())
    }

    /// Index of the oldest entry kept. Equals `last_index() + 1` when the log is empty.
    pub fn first_index(&self) -> u64 {
        self.next_index - self.len()
    }

    /// Index of the newest entry, 0 for a log that was never written.
    pub fn last_index(&self) -> u64 {
        self.next_index - 1
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn len(&self) -> u64 {
        u64::try_from(self.positions.len()).unwrap_or(u64::MAX)
    }

    /// Appends `data` and returns its index.
    pub fn write(&mut self, data: Vec<u8>) -> Result<u64, WalError> {
        if data.len() > self.max_entry_size {
            return Err(WalError::EntryTooLarge { len: data.len(), max: self.max_entry_size });
        }
        let index = self.next_index;
        let bytes = self.codec.encode(&WalFrame { index, data });
        self.file.write_all(&bytes)?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        self.positions.push_back(FramePosition { offset: self.end, len: bytes.len() });
        self.end += bytes.len();
        self.next_index += 1;
        Ok(index)
    }

    pub fn read(&mut self, index: u64) -> Result<Vec<u8>, WalError> {
        let position = index
            .checked_sub(self.first_index())
            .and_then(|relative| usize::try_from(relative).ok())
            .and_then(|relative| self.positions.get(relative).copied())
            .ok_or(WalError::NotFound(index))?;

        let mut bytes = vec![0; position.len];
        self.file.seek(SeekFrom::Start(file_offset(position.offset)?))?;
        let read = self.file.read_exact(&mut bytes);
        self.file.seek(SeekFrom::Start(file_offset(self.end)?))?;
        read?;

        let (frame, _) = self.codec.decode(&bytes)?.ok_or(WalError::NotFound(index))?;
        if frame.index != index {
            return Err(WalError::OutOfOrder { expected: index, found: frame.index });
        }
        Ok(frame.data)
    }

    pub fn write_entry(&mut self, entry: WalEntry) -> Result<u64, WalError> {
        self.write(entry.into())
    }

    pub fn read_entry(&mut self, index: u64) -> Result<WalEntry, WalError> {
        Ok(WalEntry::try_from(self.read(index)?)?)
    }

    /// Drops every entry before `index`. The newest entry is always kept so indices keep
    /// increasing across restarts.
    pub fn truncate_front(&mut self, index: u64) -> Result<(), WalError> {
        let index = index.min(self.last_index());
        if index <= self.first_index() {
            return Ok(());
        }
        let dropped = usize::try_from(index - self.first_index())
            .map_err(|_| WalError::NotFound(index))?;
        let base = self.positions.get(dropped).ok_or(WalError::NotFound(index))?.offset;

        let mut tail = Vec::with_capacity(self.end - base);
        self.file.seek(SeekFrom::Start(file_offset(base)?))?;
        self.file.read_to_end(&mut tail)?;

        let tmp_path = self.dir.join(TMP_FILE_NAME);
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&tail)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, self.dir.join(LOG_FILE_NAME))?;

        self.file = open_log(&self.dir.join(LOG_FILE_NAME))?;
        self.file.seek(SeekFrom::End(0))?;
        self.positions.drain(..dropped);
        for position in self.positions.iter_mut() {
            position.offset -= base;
        }
        self.end -= base;
        debug!(first_index = self.first_index(), last_index = self.last_index(), "Truncated WAL.");
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File, WalError> {
    Ok(OpenOptions::new().create(true).truncate(false).read(true).write(true).open(path)?)
}

fn file_offset(offset: usize) -> Result<u64, WalError> {
    u64::try_from(offset).map_err(|_| WalError::Io(io::Error::other("WAL offset overflow")))
}
