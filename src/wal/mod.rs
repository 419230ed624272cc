//! Write-Ahead Log (WAL) for inserts that are not yet sealed into a segment
//!
//! Inserted records are logged here first. When enough records accumulate
//! the collection writes them to a Parquet segment and truncates the log.
//! On open, surviving entries are replayed into the in-memory index.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::IndexRecord;
use crate::{Error, Result};

/// WAL operation types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOperation {
    /// Insert (or overwrite, for an existing id) records
    Insert { records: Vec<IndexRecord> },
}

/// WAL entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number (monotonically increasing)
    pub sequence: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub operation: WalOperation,
}

/// WAL file format:
/// - Magic bytes: "SWAL" (4 bytes)
/// - Version: u32 (4 bytes)
/// - Entries: [Entry]*
///
/// Each entry:
/// - Length: u32 (4 bytes) - length of serialized entry
/// - Data: serialized WalEntry (msgpack)
/// - CRC32: u32 (4 bytes) - checksum of length + data
const WAL_MAGIC: &[u8; 4] = b"SWAL";
const WAL_VERSION: u32 = 1;
const WAL_FILE_NAME: &str = "wal.log";
const MAX_ENTRY_BYTES: u32 = 256 * 1024 * 1024;

/// Write-Ahead Log manager
pub struct WalManager {
    path: PathBuf,
    file: File,
    next_sequence: u64,
    /// Entries above this size are refused; never above what replay accepts
    max_entry_bytes: u32,
}

impl WalManager {
    /// Open (or create) the WAL in `wal_dir`
    pub async fn new<P: AsRef<Path>>(wal_dir: P) -> Result<Self> {
        let wal_dir = wal_dir.as_ref();
        tokio::fs::create_dir_all(wal_dir)
            .await
            .map_err(|e| Error::index_write(format!("Failed to create WAL directory: {}", e)))?;

        let path = wal_dir.join(WAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::index_write(format!("Failed to open WAL file: {}", e)))?;

        let len = file
            .metadata()
            .await
            .map_err(|e| Error::index_write(format!("Failed to get WAL metadata: {}", e)))?
            .len();

        let next_sequence = if len == 0 {
            write_header(&mut file).await?;
            0
        } else {
            read_wal_file(&path)
                .await?
                .last()
                .map(|e| e.sequence + 1)
                .unwrap_or(0)
        };

        Ok(Self {
            path,
            file,
            next_sequence,
            max_entry_bytes: MAX_ENTRY_BYTES,
        })
    }

    /// Lower the per-entry size limit
    pub fn with_max_entry_bytes(mut self, limit: u32) -> Self {
        self.max_entry_bytes = limit.min(MAX_ENTRY_BYTES);
        self
    }

    /// Append an operation; returns its sequence number
    pub async fn append(&mut self, operation: WalOperation) -> Result<u64> {
        let entry = WalEntry {
            sequence: self.next_sequence,
            timestamp: chrono::Utc::now(),
            operation,
        };

        let data = rmp_serde::to_vec(&entry)
            .map_err(|e| Error::index_write(format!("Failed to serialize WAL entry: {}", e)))?;

        // Replay stops at an oversized entry, so it must never be written
        let length = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= self.max_entry_bytes)
            .ok_or_else(|| {
                Error::index_write(format!(
                    "WAL entry of {} bytes exceeds the {} byte limit",
                    data.len(),
                    self.max_entry_bytes
                ))
            })?;

        let mut buffer = BytesMut::with_capacity(4 + data.len() + 4);
        buffer.put_u32(length);
        buffer.put_slice(&data);
        let crc = crc32fast::hash(&buffer);
        buffer.put_u32(crc);

        self.file
            .write_all(&buffer)
            .await
            .map_err(|e| Error::index_write(format!("Failed to write WAL entry: {}", e)))?;
        self.file
            .flush()
            .await
            .map_err(|e| Error::index_write(format!("Failed to flush WAL: {}", e)))?;

        let seq = self.next_sequence;
        self.next_sequence += 1;
        Ok(seq)
    }

    /// fsync the log
    pub async fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::index_write(format!("Failed to sync WAL: {}", e)))
    }

    /// Read all intact entries
    pub async fn read_all(&self) -> Result<Vec<WalEntry>> {
        read_wal_file(&self.path).await
    }

    /// Operations to replay after a restart
    pub async fn replay(&self) -> Result<Vec<WalOperation>> {
        let entries = self.read_all().await?;
        Ok(entries.into_iter().map(|e| e.operation).collect())
    }

    /// Drop every entry (after they were sealed into a segment)
    pub async fn truncate(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::index_write(format!("Failed to truncate WAL: {}", e)))?;
        write_header(&mut file).await?;
        drop(file);

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::index_write(format!("Failed to reopen WAL: {}", e)))?;
        self.next_sequence = 0;
        Ok(())
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

async fn write_header(file: &mut File) -> Result<()> {
    file.write_all(WAL_MAGIC)
        .await
        .map_err(|e| Error::index_write(format!("Failed to write WAL magic: {}", e)))?;
    file.write_u32(WAL_VERSION)
        .await
        .map_err(|e| Error::index_write(format!("Failed to write WAL version: {}", e)))?;
    file.flush()
        .await
        .map_err(|e| Error::index_write(format!("Failed to flush WAL: {}", e)))
}

/// Read entries, skipping any whose checksum or encoding is broken and
/// stopping at a truncated tail.
async fn read_wal_file(path: &Path) -> Result<Vec<WalEntry>> {
    let mut file = File::open(path)
        .await
        .map_err(|e| Error::IndexUnavailable(format!("Failed to open WAL file: {}", e)))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .await
        .map_err(|e| Error::IndexUnavailable(format!("Failed to read WAL magic: {}", e)))?;
    if &magic != WAL_MAGIC {
        return Err(Error::IndexUnavailable("Invalid WAL file: bad magic bytes".into()));
    }

    let version = file
        .read_u32()
        .await
        .map_err(|e| Error::IndexUnavailable(format!("Failed to read WAL version: {}", e)))?;
    if version != WAL_VERSION {
        return Err(Error::IndexUnavailable(format!(
            "Unsupported WAL version: {}",
            version
        )));
    }

    let mut entries = Vec::new();
    let mut entry_index = 0usize;
    loop {
        let length = match file.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!(entry = entry_index, error = %e, "WAL entry length unreadable, stopping recovery");
                break;
            }
        };

        if length > MAX_ENTRY_BYTES {
            tracing::warn!(entry = entry_index, length, "WAL entry has unreasonable length, stopping recovery");
            break;
        }

        let mut data = vec![0u8; length as usize];
        if let Err(e) = file.read_exact(&mut data).await {
            tracing::warn!(entry = entry_index, error = %e, "WAL entry truncated, stopping recovery");
            break;
        }

        let stored_crc = match file.read_u32().await {
            Ok(crc) => crc,
            Err(e) => {
                tracing::warn!(entry = entry_index, error = %e, "WAL entry missing CRC, stopping recovery");
                break;
            }
        };

        let mut crc_data = BytesMut::with_capacity(4 + data.len());
        crc_data.put_u32(length);
        crc_data.put_slice(&data);
        let calculated_crc = crc32fast::hash(&crc_data);
        if calculated_crc != stored_crc {
            tracing::warn!(
                entry = entry_index,
                expected = stored_crc,
                got = calculated_crc,
                "WAL entry CRC mismatch, skipping"
            );
            entry_index += 1;
            continue;
        }

        match rmp_serde::from_slice::<WalEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(entry = entry_index, error = %e, "WAL entry failed to deserialize, skipping");
            }
        }
        entry_index += 1;
    }

    if entry_index > entries.len() {
        tracing::warn!(
            recovered = entries.len(),
            total = entry_index,
            "Some WAL entries were corrupted"
        );
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WindowMetadata;
    use tempfile::TempDir;

    fn record(i: usize) -> IndexRecord {
        IndexRecord {
            id: format!("rec-{}", i),
            vector: vec![i as f32, 0.5],
            metadata: WindowMetadata {
                name: "AAPL".to_string(),
                start_date: "2024-01-01".to_string(),
                end_date: "2024-01-07".to_string(),
                start_idx: i,
                end_idx: i + 7,
                window_size: 7,
                document: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_wal_basic() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = WalManager::new(temp_dir.path()).await.unwrap();

        let seq = wal
            .append(WalOperation::Insert {
                records: vec![record(1)],
            })
            .await
            .unwrap();
        assert_eq!(seq, 0);

        let entries = wal.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 0);
    }

    #[tokio::test]
    async fn test_wal_rejects_oversized_entry() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = WalManager::new(temp_dir.path())
            .await
            .unwrap()
            .with_max_entry_bytes(512);

        let result = wal
            .append(WalOperation::Insert {
                records: (0..50).map(record).collect(),
            })
            .await;
        assert!(matches!(result, Err(Error::IndexWrite(_))));

        // The refused entry leaves no trace and does not consume a sequence
        let seq = wal
            .append(WalOperation::Insert {
                records: vec![record(1)],
            })
            .await
            .unwrap();
        assert_eq!(seq, 0);
        assert_eq!(wal.replay().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wal_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = WalManager::new(temp_dir.path()).await.unwrap();

        wal.append(WalOperation::Insert {
            records: vec![record(1)],
        })
        .await
        .unwrap();
        wal.truncate().await.unwrap();

        assert!(wal.read_all().await.unwrap().is_empty());

        // Still appendable after truncation
        wal.append(WalOperation::Insert {
            records: vec![record(2)],
        })
        .await
        .unwrap();
        assert_eq!(wal.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut wal = WalManager::new(temp_dir.path()).await.unwrap();
            for i in 0..5 {
                wal.append(WalOperation::Insert {
                    records: vec![record(i)],
                })
                .await
                .unwrap();
            }
        }

        let wal = WalManager::new(temp_dir.path()).await.unwrap();
        assert_eq!(wal.next_sequence(), 5);

        let ops = wal.replay().await.unwrap();
        assert_eq!(ops.len(), 5);
        let WalOperation::Insert { records } = &ops[3];
        assert_eq!(records[0], record(3));
    }

    #[tokio::test]
    async fn test_wal_skips_corrupted_entry() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut wal = WalManager::new(temp_dir.path()).await.unwrap();
            for i in 0..3 {
                wal.append(WalOperation::Insert {
                    records: vec![record(i)],
                })
                .await
                .unwrap();
            }
        }

        // Flip one byte inside the first entry's payload
        let path = temp_dir.path().join(WAL_FILE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8 + 4 + 2] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let wal = WalManager::new(temp_dir.path()).await.unwrap();
        let entries = wal.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
    }
}
