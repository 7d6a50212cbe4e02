//! Immutable on-disk sorted tables.
//!
//! File layout, in order:
//!   data block    `[key_len: u32][key][value_len: u32][value]` per record,
//!                 ascending keys; a tombstone is written with the reserved
//!                 value length `u32::MAX` and no value bytes
//!   index block   `[key_len: u32][key][offset: u64]` per record
//!   bloom block   serialized Bloom filter
//!   footer        `index_offset: i64 | bloom_offset: i64 | bloom_len: u32 |
//!                  num_entries: u32 | magic: u32` (28 bytes, little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::bloom::BloomFilter;
use crate::storage::{Result, StoreError};

const MAGIC: u32 = 0xDEADBEEF;
const FOOTER_SIZE: u64 = 28;
/// Reserved value length marking a tombstone record.
const TOMBSTONE_LEN: u32 = u32::MAX;

/// Bloom sizing when the writer is not told the key count up front.
const DEFAULT_BLOOM_KEYS: usize = 10_000;
const DEFAULT_BLOOM_FPR: f64 = 0.01;

pub fn table_file_path(data_dir: &Path, table_id: u64) -> PathBuf {
    data_dir.join(format!("sstable_{}.db", table_id))
}

pub fn parse_table_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("sstable_")?
        .strip_suffix(".db")?
        .parse()
        .ok()
}

/// Outcome of a point lookup against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLookup {
    /// The Bloom filter answered "definitely absent"; no disk read happened.
    Filtered,
    /// The filter passed but the index has no such key (false positive).
    Missing,
    /// The key is present; `None` is a tombstone record.
    Found(Option<Vec<u8>>),
}

/// Stateful builder fed strictly-ascending keys.
pub struct SsTableWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    index: Vec<(Vec<u8>, u64)>,
    data_offset: u64,
    bloom: Option<BloomFilter>,
}

impl SsTableWriter {
    pub fn new(data_dir: &Path, table_id: u64) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = table_file_path(data_dir, table_id);
        let file = File::create(&path)?;

        Ok(SsTableWriter {
            writer: BufWriter::new(file),
            path,
            index: Vec::new(),
            data_offset: 0,
            bloom: None,
        })
    }

    /// Append one record. `None` writes a tombstone. Keys must arrive in
    /// strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let bloom = self
            .bloom
            .get_or_insert_with(|| BloomFilter::new(DEFAULT_BLOOM_KEYS, DEFAULT_BLOOM_FPR));
        bloom.add(key);

        self.index.push((key.to_vec(), self.data_offset));

        self.writer.write_all(&(key.len() as u32).to_le_bytes())?;
        self.writer.write_all(key)?;
        match value {
            Some(v) => {
                self.writer.write_all(&(v.len() as u32).to_le_bytes())?;
                self.writer.write_all(v)?;
                self.data_offset += 4 + key.len() as u64 + 4 + v.len() as u64;
            }
            None => {
                self.writer.write_all(&TOMBSTONE_LEN.to_le_bytes())?;
                self.data_offset += 4 + key.len() as u64 + 4;
            }
        }

        Ok(())
    }

    /// Append index, Bloom filter and footer, then fsync and close.
    pub fn finalize(mut self) -> Result<PathBuf> {
        let index_offset = self.data_offset;

        let mut index_len = 0u64;
        for (key, offset) in &self.index {
            self.writer.write_all(&(key.len() as u32).to_le_bytes())?;
            self.writer.write_all(key)?;
            self.writer.write_all(&offset.to_le_bytes())?;
            index_len += 4 + key.len() as u64 + 8;
        }

        let bloom_offset = index_offset + index_len;
        let bloom_data = match &self.bloom {
            Some(b) => b.serialize(),
            None => Vec::new(),
        };
        self.writer.write_all(&bloom_data)?;

        self.writer.write_all(&(index_offset as i64).to_le_bytes())?;
        self.writer.write_all(&(bloom_offset as i64).to_le_bytes())?;
        self.writer.write_all(&(bloom_data.len() as u32).to_le_bytes())?;
        self.writer.write_all(&(self.index.len() as u32).to_le_bytes())?;
        self.writer.write_all(&MAGIC.to_le_bytes())?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        Ok(self.path)
    }
}

/// Reader over one finalized table. The index and Bloom filter live in
/// memory; record reads seek into the data block on demand.
pub struct SsTable {
    path: PathBuf,
    id: u64,
    index: Vec<(Vec<u8>, u64)>,
    bloom: Option<BloomFilter>,
    data_len: u64,
    file_len: u64,
}

impl SsTable {
    pub fn open(path: &Path) -> Result<Self> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_table_id)
            .unwrap_or(0);

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_SIZE {
            return Err(StoreError::Corruption(format!(
                "{}: file shorter than footer",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;

        let index_offset = i64::from_le_bytes(footer[0..8].try_into().unwrap());
        let bloom_offset = i64::from_le_bytes(footer[8..16].try_into().unwrap());
        let bloom_len = u32::from_le_bytes(footer[16..20].try_into().unwrap());
        let num_entries = u32::from_le_bytes(footer[20..24].try_into().unwrap());
        let magic = u32::from_le_bytes(footer[24..28].try_into().unwrap());

        if magic != MAGIC {
            return Err(StoreError::Corruption(format!(
                "{}: bad magic number {:#x}",
                path.display(),
                magic
            )));
        }
        if index_offset < 0
            || bloom_offset < index_offset
            || bloom_offset as u64 + bloom_len as u64 > file_len - FOOTER_SIZE
        {
            return Err(StoreError::Corruption(format!(
                "{}: footer offsets out of range",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(index_offset as u64))?;
        let mut reader = BufReader::new(&mut file);
        let mut index = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let key_len = u32::from_le_bytes(len_buf) as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;
            let mut off_buf = [0u8; 8];
            reader.read_exact(&mut off_buf)?;
            index.push((key, u64::from_le_bytes(off_buf)));
        }

        let bloom = if bloom_len > 0 {
            file.seek(SeekFrom::Start(bloom_offset as u64))?;
            let mut bloom_data = vec![0u8; bloom_len as usize];
            file.read_exact(&mut bloom_data)?;
            Some(BloomFilter::deserialize(&bloom_data).ok_or_else(|| {
                StoreError::Corruption(format!("{}: unreadable Bloom filter", path.display()))
            })?)
        } else {
            None
        };

        Ok(SsTable {
            path: path.to_path_buf(),
            id,
            index,
            bloom,
            data_len: index_offset as u64,
            file_len,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Point lookup. Tombstone interpretation is the engine's job: a
    /// tombstone record is returned as `Found(None)`.
    pub fn get(&self, key: &[u8]) -> Result<TableLookup> {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                return Ok(TableLookup::Filtered);
            }
        }

        let idx = match self.index.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => i,
            Err(_) => return Ok(TableLookup::Missing),
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.index[idx].1))?;
        let mut reader = BufReader::new(file);

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let key_len = u32::from_le_bytes(len_buf) as u64;
        std::io::copy(&mut reader.by_ref().take(key_len), &mut std::io::sink())?;

        reader.read_exact(&mut len_buf)?;
        let value_len = u32::from_le_bytes(len_buf);
        if value_len == TOMBSTONE_LEN {
            return Ok(TableLookup::Found(None));
        }
        if self.index[idx].1 + 4 + key_len + 4 + value_len as u64 > self.data_len {
            return Err(StoreError::Corruption(format!(
                "{}: value length exceeds data block",
                self.path.display()
            )));
        }

        let mut value = vec![0u8; value_len as usize];
        reader.read_exact(&mut value)?;
        Ok(TableLookup::Found(Some(value)))
    }

    /// Sequential scan of the whole data block, tombstones included. Used by
    /// compaction so inputs are read once instead of point-read per key.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::with_capacity(self.index.len());
        let mut pos = 0u64;

        while pos < self.data_len {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let key_len = u32::from_le_bytes(len_buf) as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;

            reader.read_exact(&mut len_buf)?;
            let value_len = u32::from_le_bytes(len_buf);
            pos += 4 + key_len as u64 + 4;

            let value = if value_len == TOMBSTONE_LEN {
                None
            } else {
                if pos + value_len as u64 > self.data_len {
                    return Err(StoreError::Corruption(format!(
                        "{}: value length exceeds data block",
                        self.path.display()
                    )));
                }
                let mut value = vec![0u8; value_len as usize];
                reader.read_exact(&mut value)?;
                pos += value_len as u64;
                Some(value)
            };

            entries.push((key, value));
        }

        Ok(entries)
    }

    #[cfg(test)]
    pub(crate) fn has_bloom(&self) -> bool {
        self.bloom.is_some()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn build_table(dir: &Path, id: u64, entries: &[(&str, Option<&str>)]) -> SsTable {
        let mut writer = SsTableWriter::new(dir, id).unwrap();
        for (key, value) in entries {
            writer.add(key.as_bytes(), value.map(|v| v.as_bytes())).unwrap();
        }
        let path = writer.finalize().unwrap();
        SsTable::open(&path).unwrap()
    }

    #[test]
    fn test_write_open_get_round_trip() {
        let dir = tempdir().unwrap();
        let table = build_table(
            dir.path(),
            0,
            &[("apple", Some("1")), ("banana", Some("2")), ("cherry", Some("3"))],
        );

        assert_eq!(table.entry_count(), 3);
        assert!(table.has_bloom());
        assert_eq!(
            table.get(b"banana").unwrap(),
            TableLookup::Found(Some(b"2".to_vec()))
        );
        assert_eq!(
            table.get(b"cherry").unwrap(),
            TableLookup::Found(Some(b"3".to_vec()))
        );
    }

    #[test]
    fn test_tombstone_is_a_present_record() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 1, &[("alive", Some("v")), ("dead", None)]);

        assert_eq!(table.get(b"dead").unwrap(), TableLookup::Found(None));
        assert_eq!(
            table.get(b"alive").unwrap(),
            TableLookup::Found(Some(b"v".to_vec()))
        );
    }

    #[test]
    fn test_bloom_skip_is_observable() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 2, &[("only_key", Some("v"))]);

        // An absent key is almost always excluded by the filter without any
        // index search; a false positive surfaces as Missing instead.
        match table.get(b"definitely_absent_key").unwrap() {
            TableLookup::Filtered | TableLookup::Missing => {}
            other => panic!("unexpected lookup outcome: {:?}", other),
        }
    }

    #[test]
    fn test_bloom_soundness_against_index() {
        let dir = tempdir().unwrap();
        let entries: Vec<(String, Option<String>)> = (0..500)
            .map(|i| (format!("key_{:04}", i), Some(format!("value_{}", i))))
            .collect();
        let mut writer = SsTableWriter::new(dir.path(), 3).unwrap();
        for (k, v) in &entries {
            writer.add(k.as_bytes(), v.as_deref().map(|v| v.as_bytes())).unwrap();
        }
        let table = SsTable::open(&writer.finalize().unwrap()).unwrap();

        // If the filter says definitely absent, the index must agree.
        for i in 0..500 {
            let key = format!("missing_{:04}", i);
            if let TableLookup::Filtered = table.get(key.as_bytes()).unwrap() {
                assert!(table
                    .index
                    .binary_search_by(|(k, _)| k.as_slice().cmp(key.as_bytes()))
                    .is_err());
            }
        }
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 4, &[("k", Some("v"))]);
        let path = table.path().to_path_buf();
        drop(table);

        // Stamp over the magic number.
        let len = std::fs::metadata(&path).unwrap().len();
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(len - 4)).unwrap();
        file.write_all(&0xBADC0DEu32.to_le_bytes()).unwrap();
        drop(file);

        match SsTable::open(&path) {
            Err(StoreError::Corruption(_)) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_open_rejects_short_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sstable_9.db");
        std::fs::write(&path, b"tiny").unwrap();

        match SsTable::open(&path) {
            Err(StoreError::Corruption(_)) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_scan_returns_everything_in_order() {
        let dir = tempdir().unwrap();
        let table = build_table(
            dir.path(),
            5,
            &[("a", Some("1")), ("b", None), ("c", Some("3"))],
        );

        let entries = table.scan().unwrap();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"c".to_vec(), Some(b"3".to_vec())),
            ]
        );
    }

    #[test]
    fn test_parse_table_id() {
        assert_eq!(parse_table_id("sstable_0.db"), Some(0));
        assert_eq!(parse_table_id("sstable_42.db"), Some(42));
        assert_eq!(parse_table_id("sstable_.db"), None);
        assert_eq!(parse_table_id("wal.log"), None);
        assert_eq!(parse_table_id("sstable_12.data"), None);
    }
}
