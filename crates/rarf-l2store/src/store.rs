//! File-backed, log-structured `L2Backend` (§6.3): an append-only segment
//! log per directory, rolled at `segment_size`, with an in-memory index
//! rebuilt on open from the latest `snapshot-<ts>.idx` plus only the
//! segments written after it, rather than by replaying the log from
//! genesis every time.
//!
//! Segment rotation and the manifest are append-only in this implementation
//! — nothing ever compacts old segments or removes tombstoned bytes from
//! disk. That's an acceptable simplification for a cache tier (losing
//! history costs nothing but disk space, never correctness); a production
//! rendition would need a compaction pass that rewrites live records into a
//! fresh segment and truncates the manifest.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rarf_core::cache::L2Backend;
use rarf_core::error::RarfError;

use crate::format::{self, Record};

#[derive(Clone, Copy)]
struct IndexEntry {
    segment_id: u32,
    offset: u64,
    length: u32,
    expires_at_epoch_ms: Option<i64>,
}

struct StoreState {
    dir: PathBuf,
    segment_size: u64,
    active_segment_id: u32,
    active_file: File,
    active_offset: u64,
    index: HashMap<Vec<u8>, IndexEntry>,
}

fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join("segments").join(format!("{id:06}.log"))
}

fn manifest_path(dir: &Path) -> PathBuf {
    dir.join("manifest")
}

fn snapshots_dir(dir: &Path) -> PathBuf {
    dir.join("snapshots")
}

fn snapshot_path(dir: &Path, taken_at_epoch_ms: i64) -> PathBuf {
    snapshots_dir(dir).join(format!("snapshot-{taken_at_epoch_ms:020}.idx"))
}

fn read_manifest(dir: &Path) -> std::io::Result<Vec<u32>> {
    let path = manifest_path(dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    BufRead::lines(BufReader::new(file)).map(|line| line.and_then(|l| l.trim().parse().map_err(std::io::Error::other))).collect()
}

fn append_manifest(dir: &Path, id: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(manifest_path(dir))?;
    writeln!(file, "{id}")
}

fn replay_segment(dir: &Path, id: u32, index: &mut HashMap<Vec<u8>, IndexEntry>) -> Result<u64, RarfError> {
    let path = segment_path(dir, id);
    let mut bytes = Vec::new();
    File::open(&path).and_then(|mut f| f.read_to_end(&mut bytes)).map_err(RarfError::internal)?;

    let mut offset = 0u64;
    while (offset as usize) < bytes.len() {
        let slice = &bytes[offset as usize..];
        let (record, consumed) = match format::decode(slice) {
            Ok(decoded) => decoded,
            Err(_) => {
                // A partial record at the tail (torn write from a crash);
                // stop replaying, the log is append-only so nothing follows.
                tracing::warn!(segment = id, offset, "stopping replay at corrupt/truncated trailing record");
                break;
            }
        };
        match &record.value {
            Some(_) => {
                index.insert(
                    record.key.clone(),
                    IndexEntry { segment_id: id, offset, length: consumed as u32, expires_at_epoch_ms: record.expires_at_epoch_ms },
                );
            }
            None => {
                index.remove(&record.key);
            }
        }
        offset += consumed as u64;
    }
    Ok(offset)
}

/// Reads the most recently written snapshot, if any, returning the highest
/// segment id its index already reflects plus the index itself. A snapshot
/// with a corrupt header or a torn trailing entry is treated as absent
/// rather than failing `open` — the full-log replay it would otherwise
/// trigger is always correct, just slower.
fn latest_snapshot(dir: &Path) -> Result<Option<(u32, HashMap<Vec<u8>, IndexEntry>)>, RarfError> {
    let dir = snapshots_dir(dir);
    if !dir.exists() {
        return Ok(None);
    }
    let mut names: Vec<String> =
        fs::read_dir(&dir).map_err(RarfError::internal)?.flatten().filter_map(|entry| entry.file_name().into_string().ok()).collect();
    names.sort();
    let Some(latest) = names.pop() else { return Ok(None) };

    let path = dir.join(&latest);
    let mut bytes = Vec::new();
    File::open(&path).and_then(|mut f| f.read_to_end(&mut bytes)).map_err(RarfError::internal)?;
    if bytes.len() < 8 {
        tracing::warn!(snapshot = %latest, "ignoring truncated snapshot header");
        return Ok(None);
    }
    let up_to_segment_id = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
    let header_crc = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes"));
    if crc32fast::hash(&bytes[0..4]) != header_crc {
        tracing::warn!(snapshot = %latest, "ignoring snapshot with a corrupt header");
        return Ok(None);
    }

    let mut index = HashMap::new();
    let mut offset = 8usize;
    while offset < bytes.len() {
        let (entry, consumed) = match format::decode_index_entry(&bytes[offset..]) {
            Ok(decoded) => decoded,
            Err(_) => {
                tracing::warn!(snapshot = %latest, offset, "stopping snapshot replay at a corrupt/truncated trailing entry");
                break;
            }
        };
        index.insert(
            entry.key,
            IndexEntry { segment_id: entry.segment_id, offset: entry.offset, length: entry.length, expires_at_epoch_ms: entry.expires_at_epoch_ms },
        );
        offset += consumed;
    }
    Ok(Some((up_to_segment_id, index)))
}

/// Writes a snapshot covering every segment up to and including
/// `up_to_segment_id`, then deletes older snapshots now that a newer one
/// is durable on disk.
fn write_snapshot(dir: &Path, up_to_segment_id: u32, index: &HashMap<Vec<u8>, IndexEntry>) -> Result<(), RarfError> {
    let dir_path = snapshots_dir(dir);
    fs::create_dir_all(&dir_path).map_err(RarfError::internal)?;
    let path = snapshot_path(dir, now_epoch_ms());

    let mut file = File::create(&path).map_err(RarfError::internal)?;
    file.write_all(&up_to_segment_id.to_le_bytes()).map_err(RarfError::internal)?;
    file.write_all(&crc32fast::hash(&up_to_segment_id.to_le_bytes()).to_le_bytes()).map_err(RarfError::internal)?;
    for (key, entry) in index {
        let encoded = format::encode_index_entry(&format::IndexSnapshotEntry {
            key: key.clone(),
            segment_id: entry.segment_id,
            offset: entry.offset,
            length: entry.length,
            expires_at_epoch_ms: entry.expires_at_epoch_ms,
        });
        file.write_all(&encoded).map_err(RarfError::internal)?;
    }
    file.flush().map_err(RarfError::internal)?;

    if let Ok(entries) = fs::read_dir(&dir_path) {
        for entry in entries.flatten() {
            if entry.path() != path {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

impl StoreState {
    fn open(dir: PathBuf, segment_size: u64) -> Result<Self, RarfError> {
        fs::create_dir_all(dir.join("segments")).map_err(RarfError::internal)?;
        let mut segment_ids = read_manifest(&dir).map_err(RarfError::internal)?;

        if segment_ids.is_empty() {
            append_manifest(&dir, 0).map_err(RarfError::internal)?;
            File::create(segment_path(&dir, 0)).map_err(RarfError::internal)?;
            segment_ids.push(0);
        }

        let snapshot = latest_snapshot(&dir)?;
        let mut index = snapshot.as_ref().map(|(_, index)| index.clone()).unwrap_or_default();
        let replay_from = snapshot.map(|(up_to, _)| up_to + 1).unwrap_or(0);

        let mut last_offset = 0u64;
        for &id in segment_ids.iter().filter(|&&id| id >= replay_from) {
            last_offset = replay_segment(&dir, id, &mut index)?;
        }

        let active_segment_id = *segment_ids.last().expect("at least one segment after initialization");
        let active_file = OpenOptions::new().append(true).open(segment_path(&dir, active_segment_id)).map_err(RarfError::internal)?;

        Ok(Self { dir, segment_size, active_segment_id, active_file, active_offset: last_offset, index })
    }

    /// Snapshots every segment strictly before the active one (§6.3); the
    /// active segment is still being appended to, so it is always replayed
    /// from scratch on the next `open` regardless of snapshot state.
    fn snapshot(&self) -> Result<(), RarfError> {
        if self.active_segment_id == 0 {
            return Ok(());
        }
        write_snapshot(&self.dir, self.active_segment_id - 1, &self.index)
    }

    fn roll_if_needed(&mut self, incoming_len: u64) -> Result<(), RarfError> {
        if self.active_offset > 0 && self.active_offset + incoming_len > self.segment_size {
            let next_id = self.active_segment_id + 1;
            File::create(segment_path(&self.dir, next_id)).map_err(RarfError::internal)?;
            append_manifest(&self.dir, next_id).map_err(RarfError::internal)?;
            self.active_file = OpenOptions::new().append(true).open(segment_path(&self.dir, next_id)).map_err(RarfError::internal)?;
            self.active_segment_id = next_id;
            self.active_offset = 0;
        }
        Ok(())
    }

    fn put(&mut self, record: &Record) -> Result<(), RarfError> {
        let encoded = format::encode(record);
        self.roll_if_needed(encoded.len() as u64)?;

        self.active_file.write_all(&encoded).map_err(RarfError::internal)?;
        let offset = self.active_offset;
        self.active_offset += encoded.len() as u64;

        match &record.value {
            Some(_) => {
                self.index.insert(
                    record.key.clone(),
                    IndexEntry {
                        segment_id: self.active_segment_id,
                        offset,
                        length: encoded.len() as u32,
                        expires_at_epoch_ms: record.expires_at_epoch_ms,
                    },
                );
            }
            None => {
                self.index.remove(&record.key);
            }
        }
        Ok(())
    }

    fn get(&mut self, key: &[u8], now_ms: i64) -> Result<Option<(Vec<u8>, Option<i64>)>, RarfError> {
        let Some(entry) = self.index.get(key).copied() else {
            return Ok(None);
        };
        if entry.expires_at_epoch_ms.is_some_and(|e| now_ms >= e) {
            self.index.remove(key);
            return Ok(None);
        }

        let mut file = File::open(segment_path(&self.dir, entry.segment_id)).map_err(RarfError::internal)?;
        file.seek(SeekFrom::Start(entry.offset)).map_err(RarfError::internal)?;
        let mut buf = vec![0u8; entry.length as usize];
        file.read_exact(&mut buf).map_err(RarfError::internal)?;
        let (record, _) = format::decode(&buf)?;
        Ok(record.value.map(|value| (value, record.expires_at_epoch_ms)))
    }
}

/// Handle to an open L2 store directory. Cheap to clone; every clone shares
/// the same underlying file handles and in-memory index.
#[derive(Clone)]
pub struct FileL2Store {
    state: Arc<Mutex<StoreState>>,
}

impl FileL2Store {
    pub fn open(dir: impl Into<PathBuf>, segment_size: u64) -> Result<Self, RarfError> {
        let state = StoreState::open(dir.into(), segment_size)?;
        Ok(Self { state: Arc::new(Mutex::new(state)) })
    }

    /// Number of keys currently indexed (live, non-expired entries may still
    /// include some that are expired but not yet lazily purged).
    pub fn indexed_key_count(&self) -> usize {
        self.state.lock().expect("l2 store mutex poisoned").index.len()
    }

    /// Writes a fresh `snapshot-<ts>.idx` over the current index so the next
    /// `open` can skip straight to the trailing segment (§6.3).
    pub async fn snapshot(&self) -> Result<(), RarfError> {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || state.lock().expect("l2 store mutex poisoned").snapshot()).await.map_err(RarfError::internal)?
    }
}

/// Owns the background task driving `FileL2Store::snapshot` on
/// `snapshot_interval`; dropping it aborts the task, matching
/// `CacheSweepHandle`/`IdempotencySweepHandle`.
pub struct SnapshotSweepHandle {
    task: tokio::task::JoinHandle<()>,
}

impl SnapshotSweepHandle {
    pub fn spawn(store: FileL2Store, interval: std::time::Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = store.snapshot().await {
                    tracing::warn!(error = %err, "l2 store snapshot failed");
                }
            }
        });
        Self { task }
    }
}

impl Drop for SnapshotSweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[async_trait]
impl L2Backend for FileL2Store {
    async fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<i64>)>, RarfError> {
        let state = self.state.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut state = state.lock().expect("l2 store mutex poisoned");
            state.get(&key, now_epoch_ms())
        })
        .await
        .map_err(RarfError::internal)?
    }

    async fn put(&self, key: &[u8], value: &[u8], expires_at_epoch_ms: Option<i64>) -> Result<(), RarfError> {
        let state = self.state.clone();
        let record = Record { key: key.to_vec(), value: Some(value.to_vec()), expires_at_epoch_ms };
        tokio::task::spawn_blocking(move || {
            let mut state = state.lock().expect("l2 store mutex poisoned");
            state.put(&record)
        })
        .await
        .map_err(RarfError::internal)?
    }

    async fn delete(&self, key: &[u8]) -> Result<(), RarfError> {
        let state = self.state.clone();
        let record = Record { key: key.to_vec(), value: None, expires_at_epoch_ms: None };
        tokio::task::spawn_blocking(move || {
            let mut state = state.lock().expect("l2 store mutex poisoned");
            state.put(&record)
        })
        .await
        .map_err(RarfError::internal)?
    }
}
