//! Write-ahead log. Every mutation is appended here before it touches the
//! memtable, so a crash can never lose an acknowledged write beyond the
//! durability granted by the configured sync policy.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::Result;

pub const WAL_FILE_NAME: &str = "wal.log";

/// When appended records are forced to disk.
///
/// `Always` fsyncs on every append. `Interval` fsyncs when at least the
/// given duration has passed since the last sync. `OnClose` defers all
/// syncing to rotation and close, trading durability to the kernel buffer
/// for append throughput. Rotation and close fsync under every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    Always,
    Interval(Duration),
    OnClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    Put = 1,
    Delete = 2,
}

/// One logged mutation. Record framing on disk:
/// `[timestamp: i64 LE][op: u8][key_len: u32 LE][key][value_len: u32 LE][value]`.
/// Delete records carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub timestamp: i64,
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

struct WalInner {
    writer: BufWriter<File>,
    last_sync: Instant,
}

pub struct Wal {
    path: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open (or create) the active log inside `data_dir`, appending to any
    /// existing records.
    pub fn open(data_dir: &Path, sync_policy: SyncPolicy) -> Result<Self> {
        let path = data_dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Wal {
            path,
            sync_policy,
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                last_sync: Instant::now(),
            }),
        })
    }

    /// Append one record. The buffered writer is flushed to the OS on every
    /// call; whether the call also fsyncs is governed by the sync policy.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        inner.writer.write_all(&entry.timestamp.to_le_bytes())?;
        inner.writer.write_all(&[entry.op as u8])?;
        inner.writer.write_all(&(entry.key.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&entry.key)?;
        inner.writer.write_all(&(entry.value.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&entry.value)?;
        inner.writer.flush()?;

        match self.sync_policy {
            SyncPolicy::Always => {
                inner.writer.get_ref().sync_all()?;
                inner.last_sync = Instant::now();
            }
            SyncPolicy::Interval(period) => {
                if inner.last_sync.elapsed() >= period {
                    inner.writer.get_ref().sync_all()?;
                    inner.last_sync = Instant::now();
                }
            }
            SyncPolicy::OnClose => {}
        }

        Ok(())
    }

    /// Read back every complete record in append order. A partial record at
    /// the tail is treated as a crash-truncated write and silently dropped.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        let _inner = self.inner.lock().unwrap();

        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        while let Some(entry) = read_entry(&mut reader)? {
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Truncate the active log after a successful memtable flush. The fresh
    /// empty file is fsynced before this returns.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        inner.writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;

        inner.writer = BufWriter::new(file);
        inner.last_sync = Instant::now();
        Ok(())
    }

    /// Flush and fsync outstanding records.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Returns `Ok(None)` at a clean end of file or a truncated trailing record.
fn read_entry(reader: &mut impl Read) -> Result<Option<WalEntry>> {
    let mut ts_buf = [0u8; 8];
    match reader.read_exact(&mut ts_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let timestamp = i64::from_le_bytes(ts_buf);

    let mut op_buf = [0u8; 1];
    if read_or_truncated(reader, &mut op_buf)?.is_none() {
        return Ok(None);
    }
    let op = match op_buf[0] {
        1 => WalOp::Put,
        2 => WalOp::Delete,
        // An unknown op byte means the tail was torn mid-record.
        _ => return Ok(None),
    };

    let mut len_buf = [0u8; 4];
    if read_or_truncated(reader, &mut len_buf)?.is_none() {
        return Ok(None);
    }
    let key_len = u32::from_le_bytes(len_buf) as usize;
    let mut key = vec![0u8; key_len];
    if read_or_truncated(reader, &mut key)?.is_none() {
        return Ok(None);
    }

    if read_or_truncated(reader, &mut len_buf)?.is_none() {
        return Ok(None);
    }
    let value_len = u32::from_le_bytes(len_buf) as usize;
    let mut value = vec![0u8; value_len];
    if read_or_truncated(reader, &mut value)?.is_none() {
        return Ok(None);
    }

    Ok(Some(WalEntry {
        timestamp,
        op,
        key,
        value,
    }))
}

fn read_or_truncated(reader: &mut impl Read, buf: &mut [u8]) -> Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
