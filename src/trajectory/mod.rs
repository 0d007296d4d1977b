//! Trajectory stream manager (C3): a bounded in-memory window backed by
//! versioned, checksummed binary files, with a rollback-loop guard and
//! prune/migrate maintenance operations.
//!
//! Grounded in the teacher's `db/chunks.rs` (content-addressed record
//! store with a companion `ChunkStore`) for the "records + index +
//! store" shape, and `cache.rs` for the atomic JSON sidecar idiom used
//! here for `index.json` and `rollback-state.json`.

pub mod format;
pub mod metadata;

pub use format::{RollbackState, Trajectory};
pub use metadata::{DataFileSummary, TrajectoryIndex, TrajectoryMetadata};

use crate::config::TrajectoryStoreConfig;
use crate::error::{AgentDbError, Result};
use format::{codec_for_version, peek_version, FormatCodec};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, Semaphore};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Filter used by `prune`.
#[derive(Debug, Clone, Default)]
pub struct PruneFilter {
    pub older_than: Option<i64>,
    pub quality_below: Option<f32>,
    pub route: Option<String>,
    pub max_delete: Option<usize>,
    pub preserve_baselines: bool,
}

/// Options for `migrate`.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub target_version: u32,
    pub dry_run: bool,
    pub backup: bool,
}

struct Inner {
    memory_window: HashMap<String, Trajectory>,
    pending_writes: Vec<Trajectory>,
    metadata: HashMap<String, TrajectoryMetadata>,
    current_file_index: u32,
    total_trajectories: usize,
}

/// Manages the full lifecycle of trajectories: ingestion into the memory
/// window, eviction into pending writes, batched encoding to versioned
/// data files, and durable metadata/index bookkeeping.
pub struct TrajectoryStreamManager {
    data_dir: PathBuf,
    config: TrajectoryStoreConfig,
    inner: RwLock<Inner>,
    rollback_state: Mutex<RollbackState>,
    flush_mutex: Mutex<()>,
    query_semaphore: Semaphore,
}

impl TrajectoryStreamManager {
    pub fn new(config: TrajectoryStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let data_dir = config.data_dir.clone();
        let (index, rollback_state) = load_index_and_rollback(&data_dir)?;
        let metadata = index
            .metadata
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect::<HashMap<_, _>>();
        let current_file_index = index.data_files.len() as u32;
        let total_trajectories = index.total_trajectories;
        let max_concurrent = config.max_concurrent_queries.max(1);
        Ok(Self {
            data_dir,
            config,
            inner: RwLock::new(Inner {
                memory_window: HashMap::new(),
                pending_writes: Vec::new(),
                metadata,
                current_file_index,
                total_trajectories,
            }),
            rollback_state: Mutex::new(rollback_state),
            flush_mutex: Mutex::new(()),
            query_semaphore: Semaphore::new(max_concurrent),
        })
    }

    fn data_file_path(&self, index: u32) -> PathBuf {
        self.data_dir.join(format!("data_{index:06}.bin"))
    }

    fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.json")
    }

    fn rollback_state_path(&self) -> PathBuf {
        self.data_dir.join("rollback-state.json")
    }

    /// Inserts `t` into the memory window, evicting the oldest entry into
    /// pending writes if the window would overflow, and flushing if the
    /// pending batch has reached its threshold.
    pub async fn add(&self, t: Trajectory) -> Result<()> {
        if self.config.read_only {
            return Err(AgentDbError::ReadOnlyRefused);
        }
        let should_flush = {
            let mut inner = self.inner.write().await;
            inner.memory_window.insert(t.id.clone(), t.clone());
            inner.metadata.insert(
                t.id.clone(),
                TrajectoryMetadata {
                    id: t.id.clone(),
                    route: t.route.clone(),
                    quality: t.quality,
                    created_at: t.created_at,
                    file_index: -1,
                    offset: 0,
                    size: 0,
                    is_baseline: false,
                },
            );
            prune_metadata(&mut inner, self.config.max_metadata_entries);

            if inner.memory_window.len() > self.config.memory_window_size {
                if let Some(oldest_id) = inner
                    .memory_window
                    .values()
                    .min_by_key(|v| v.created_at)
                    .map(|v| v.id.clone())
                {
                    if let Some(evicted) = inner.memory_window.remove(&oldest_id) {
                        inner.pending_writes.push(evicted);
                    }
                }
            }
            inner.pending_writes.len() >= self.config.batch_write_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Returns a trajectory by id: memory window first, then a bounded
    /// disk read guarded by the query-concurrency semaphore.
    pub async fn get(&self, id: &str) -> Result<Option<Trajectory>> {
        {
            let inner = self.inner.read().await;
            if let Some(t) = inner.memory_window.get(id) {
                return Ok(Some(t.clone()));
            }
            if let Some(p) = inner.pending_writes.iter().find(|t| t.id == id) {
                return Ok(Some(p.clone()));
            }
        }
        let file_index = {
            let inner = self.inner.read().await;
            match inner.metadata.get(id) {
                Some(m) if m.file_index >= 0 => m.file_index as u32,
                Some(_) => return Ok(None),
                None => return Ok(None),
            }
        };
        let _permit = self
            .query_semaphore
            .acquire()
            .await
            .map_err(|_| AgentDbError::other("query semaphore closed"))?;
        let bytes = fs::read(self.data_file_path(file_index))?;
        let version = peek_version(&bytes)?;
        let codec = codec_for_version(version)?;
        let outcome = codec.decode(&bytes)?;
        Ok(outcome
            .records
            .into_iter()
            .map(|r| r.trajectory)
            .find(|t| t.id == id))
    }

    /// Encodes the pending writes (trajectories already evicted from the
    /// memory window) into the next data file and atomically renames it
    /// into place. The memory window itself is left untouched, so it
    /// keeps serving reads for the records it still holds. Serialized by
    /// `flush_mutex` so at most one flush is ever in flight.
    pub async fn flush(&self) -> Result<()> {
        if self.config.read_only {
            return Err(AgentDbError::ReadOnlyRefused);
        }
        let _guard = self.flush_mutex.lock().await;

        let (to_write, file_index, rollback_state) = {
            let mut inner = self.inner.write().await;
            let to_write = std::mem::take(&mut inner.pending_writes);
            let file_index = inner.current_file_index;
            (to_write, file_index, self.rollback_state.lock().await.clone())
        };

        if to_write.is_empty() {
            return Ok(());
        }

        let codec = codec_for_version(self.config.format_version)?;
        let bytes = codec.encode(&to_write, &rollback_state, self.config.compress)?;

        let final_path = self.data_file_path(file_index);
        let tmp_path = final_path.with_extension("bin.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &final_path)?;

        // Compute each record's on-disk offset/size by re-running the
        // record layout (cheap relative to the I/O above) so metadata
        // carries the true serialized length rather than an approximation.
        let header_len = match self.config.format_version {
            1 => 16,
            _ => 20,
        };
        let outcome = codec.decode(&bytes)?;

        {
            let mut inner = self.inner.write().await;
            let mut oldest = i64::MAX;
            let mut newest = i64::MIN;
            for record in &outcome.records {
                oldest = oldest.min(record.trajectory.created_at);
                newest = newest.max(record.trajectory.created_at);
                if let Some(meta) = inner.metadata.get_mut(&record.trajectory.id) {
                    meta.file_index = file_index as i64;
                    meta.offset = record.offset;
                    meta.size = record.size;
                }
            }
            inner.total_trajectories += to_write.len();
            inner.current_file_index += 1;
            let _ = header_len;

            persist_index(
                &self.index_path(),
                &inner,
                self.config.format_version,
                &self.data_dir,
                DataFileSummary {
                    file_index,
                    trajectory_count: to_write.len(),
                    size_bytes: bytes.len() as u64,
                    oldest: if oldest == i64::MAX { 0 } else { oldest },
                    newest: if newest == i64::MIN { 0 } else { newest },
                },
            )?;
        }
        Ok(())
    }

    /// Guards against oscillating between the same two checkpoints: the
    /// same id rolled back to twice consecutively is refused.
    pub async fn record_rollback(&self, checkpoint_id: &str) -> Result<()> {
        let mut state = self.rollback_state.lock().await;
        if state.last_checkpoint_id.as_deref() == Some(checkpoint_id) {
            return Err(AgentDbError::RollbackLoop(checkpoint_id.to_string()));
        }
        state.last_checkpoint_id = Some(checkpoint_id.to_string());
        state.last_at = Some(now_ms());
        state.count += 1;
        fs::write(self.rollback_state_path(), serde_json::to_vec_pretty(&*state)?)?;
        Ok(())
    }

    /// Removes a trajectory from the window, pending writes, and
    /// metadata. Baseline trajectories require `force`.
    pub async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let is_baseline = inner.metadata.get(id).map(|m| m.is_baseline).unwrap_or(false);
        if is_baseline && !force {
            return Err(AgentDbError::not_found(format!(
                "baseline trajectory {id} requires force to delete"
            )));
        }
        inner.memory_window.remove(id);
        inner.pending_writes.retain(|t| t.id != id);
        if inner.metadata.remove(id).is_some() {
            inner.total_trajectories = inner.total_trajectories.saturating_sub(1);
        }
        persist_index_snapshot(&self.index_path(), &inner, self.config.format_version)?;
        Ok(())
    }

    /// Marks a trajectory as a protected baseline (deletion then requires
    /// `force`).
    pub async fn mark_baseline(&self, id: &str, is_baseline: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let meta = inner
            .metadata
            .get_mut(id)
            .ok_or_else(|| AgentDbError::not_found(format!("trajectory {id}")))?;
        meta.is_baseline = is_baseline;
        Ok(())
    }

    /// Deletes every trajectory matching `filter`, skipping baselines
    /// unless `preserve_baselines` is false, bounded by `max_delete`.
    pub async fn prune(&self, filter: PruneFilter) -> Result<usize> {
        let candidates: Vec<(String, bool)> = {
            let inner = self.inner.read().await;
            inner
                .metadata
                .values()
                .filter(|m| !filter.preserve_baselines || !m.is_baseline)
                .filter(|m| filter.older_than.map(|t| m.created_at < t).unwrap_or(true))
                .filter(|m| filter.quality_below.map(|q| m.quality < q).unwrap_or(true))
                .filter(|m| filter.route.as_ref().map(|r| &m.route == r).unwrap_or(true))
                .map(|m| (m.id.clone(), m.is_baseline))
                .collect()
        };
        let limit = filter.max_delete.unwrap_or(usize::MAX);
        let mut deleted = 0;
        for (id, is_baseline) in candidates.into_iter().take(limit) {
            self.delete(&id, is_baseline).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Rewrites every data file from its current declared version into
    /// `options.target_version`. v1->v2 is the identity mapping applied
    /// through `FormatCodec`; future versions can transform records.
    pub async fn migrate(&self, options: MigrateOptions) -> Result<usize> {
        let _guard = self.flush_mutex.lock().await;
        let target_codec = codec_for_version(options.target_version)?;
        let mut migrated = 0;
        let file_count = { self.inner.read().await.current_file_index };
        for index in 0..file_count {
            let path = self.data_file_path(index);
            if !path.exists() {
                continue;
            }
            let bytes = fs::read(&path)?;
            let version = peek_version(&bytes)?;
            if version == options.target_version {
                continue;
            }
            let source_codec = codec_for_version(version)?;
            let outcome = source_codec.decode(&bytes)?;
            let records: Vec<Trajectory> = outcome.records.into_iter().map(|r| r.trajectory).collect();
            let rollback_state = outcome.rollback_state.unwrap_or_default();
            let new_bytes = target_codec.encode(&records, &rollback_state, self.config.compress)?;

            if options.dry_run {
                migrated += 1;
                continue;
            }
            if options.backup {
                fs::copy(&path, path.with_extension("bin.bak"))?;
            }
            let tmp = path.with_extension("bin.tmp");
            fs::write(&tmp, &new_bytes)?;
            fs::rename(&tmp, &path)?;
            migrated += 1;
        }
        if !options.dry_run && migrated > 0 {
            let mut inner = self.inner.write().await;
            persist_index(
                &self.index_path(),
                &inner,
                options.target_version,
                &self.data_dir,
                DataFileSummary {
                    file_index: file_count.saturating_sub(1),
                    trajectory_count: 0,
                    size_bytes: 0,
                    oldest: 0,
                    newest: 0,
                },
            )
            .ok();
            inner.current_file_index = file_count;
        }
        Ok(migrated)
    }

    pub async fn total_trajectories(&self) -> usize {
        self.inner.read().await.total_trajectories
    }

    pub async fn memory_window_len(&self) -> usize {
        self.inner.read().await.memory_window.len()
    }

    pub async fn pending_writes_len(&self) -> usize {
        self.inner.read().await.pending_writes.len()
    }

    pub async fn metadata_len(&self) -> usize {
        self.inner.read().await.metadata.len()
    }
}

fn prune_metadata(inner: &mut Inner, max_metadata_entries: usize) {
    if inner.metadata.len() <= max_metadata_entries {
        return;
    }
    let target = (max_metadata_entries as f64 * 0.9) as usize;
    let window_ids: std::collections::HashSet<String> =
        inner.memory_window.keys().cloned().collect();
    let mut evictable: Vec<(String, i64)> = inner
        .metadata
        .values()
        .filter(|m| !m.is_baseline && m.file_index >= 0 && !window_ids.contains(&m.id))
        .map(|m| (m.id.clone(), m.created_at))
        .collect();
    evictable.sort_by_key(|(_, created_at)| *created_at);
    let to_remove = inner.metadata.len().saturating_sub(target);
    for (id, _) in evictable.into_iter().take(to_remove) {
        inner.metadata.remove(&id);
    }
}

fn persist_index(
    path: &std::path::Path,
    inner: &Inner,
    format_version: u32,
    data_dir: &std::path::Path,
    new_file_summary: DataFileSummary,
) -> Result<()> {
    let mut index = load_index_only(path).unwrap_or_default();
    index.format_version = format_version;
    index.total_trajectories = inner.total_trajectories;
    index.metadata = inner.metadata.values().cloned().collect();
    if new_file_summary.trajectory_count > 0 {
        index.data_files.push(new_file_summary);
    }
    let _ = data_dir;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&index)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn persist_index_snapshot(path: &std::path::Path, inner: &Inner, format_version: u32) -> Result<()> {
    let mut index = load_index_only(path).unwrap_or_default();
    index.format_version = format_version;
    index.total_trajectories = inner.total_trajectories;
    index.metadata = inner.metadata.values().cloned().collect();
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&index)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_index_only(path: &std::path::Path) -> Option<TrajectoryIndex> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn load_index_and_rollback(data_dir: &std::path::Path) -> Result<(TrajectoryIndex, RollbackState)> {
    let index = load_index_only(&data_dir.join("index.json")).unwrap_or_default();
    let rollback_path = data_dir.join("rollback-state.json");
    let rollback_state = fs::read(&rollback_path)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .unwrap_or_default();
    Ok((index, rollback_state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trajectory(id: &str, created_at: i64, quality: f32) -> Trajectory {
        Trajectory {
            id: id.to_string(),
            route: "route-a".to_string(),
            patterns: vec![],
            context: vec![],
            created_at,
            quality,
            reward: None,
        }
    }

    fn config(tmp: &TempDir, memory_window: usize, batch_write: usize) -> TrajectoryStoreConfig {
        TrajectoryStoreConfig {
            data_dir: tmp.path().to_path_buf(),
            memory_window_size: memory_window,
            batch_write_size: batch_write,
            max_metadata_entries: 10_000,
            max_concurrent_queries: 4,
            format_version: 2,
            compress: false,
            read_only: false,
        }
    }

    #[tokio::test]
    async fn memory_window_evicts_oldest_on_overflow() {
        let tmp = TempDir::new().unwrap();
        let mgr = TrajectoryStreamManager::new(config(&tmp, 2, 2)).unwrap();
        mgr.add(trajectory("t1", 1, 0.5)).await.unwrap();
        mgr.add(trajectory("t2", 2, 0.5)).await.unwrap();
        mgr.add(trajectory("t3", 3, 0.5)).await.unwrap();
        assert_eq!(mgr.memory_window_len().await, 2);
        assert!(mgr.get("t1").await.unwrap().is_some()); // evicted into pending, still gettable
    }

    #[tokio::test]
    async fn flush_writes_v2_file_with_magic_and_count() {
        let tmp = TempDir::new().unwrap();
        let mgr = TrajectoryStreamManager::new(config(&tmp, 2, 2)).unwrap();
        mgr.add(trajectory("t1", 1, 0.5)).await.unwrap();
        mgr.add(trajectory("t2", 2, 0.5)).await.unwrap();
        mgr.add(trajectory("t3", 3, 0.5)).await.unwrap();
        mgr.add(trajectory("t4", 4, 0.5)).await.unwrap();

        let path = tmp.path().join("data_000000.bin");
        assert!(path.exists());
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], format::MAGIC);
        let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn rollback_loop_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = TrajectoryStreamManager::new(config(&tmp, 10, 10)).unwrap();
        mgr.record_rollback("ckpt-A").await.unwrap();
        let err = mgr.record_rollback("ckpt-A").await.unwrap_err();
        assert!(matches!(err, AgentDbError::RollbackLoop(_)));
    }

    #[tokio::test]
    async fn baseline_delete_requires_force() {
        let tmp = TempDir::new().unwrap();
        let mgr = TrajectoryStreamManager::new(config(&tmp, 10, 10)).unwrap();
        mgr.add(trajectory("t1", 1, 0.5)).await.unwrap();
        mgr.mark_baseline("t1", true).await.unwrap();
        assert!(mgr.delete("t1", false).await.is_err());
        assert!(mgr.delete("t1", true).await.is_ok());
    }

    #[tokio::test]
    async fn prune_respects_quality_and_baseline_filters() {
        let tmp = TempDir::new().unwrap();
        let mgr = TrajectoryStreamManager::new(config(&tmp, 10, 10)).unwrap();
        mgr.add(trajectory("low", 1, 0.1)).await.unwrap();
        mgr.add(trajectory("high", 2, 0.9)).await.unwrap();
        mgr.mark_baseline("low", true).await.unwrap();

        let deleted = mgr
            .prune(PruneFilter {
                quality_below: Some(0.5),
                preserve_baselines: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(deleted, 0); // "low" is a baseline, protected
        assert_eq!(mgr.metadata_len().await, 2);
    }

    #[tokio::test]
    async fn read_only_manager_refuses_add_and_flush() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, 10, 10);
        cfg.read_only = true;
        let mgr = TrajectoryStreamManager::new(cfg).unwrap();
        assert!(matches!(
            mgr.add(trajectory("t1", 1, 0.5)).await.unwrap_err(),
            AgentDbError::ReadOnlyRefused
        ));
        assert!(matches!(mgr.flush().await.unwrap_err(), AgentDbError::ReadOnlyRefused));
    }

    #[tokio::test]
    async fn migrate_is_a_no_op_identity_for_already_current_version() {
        let tmp = TempDir::new().unwrap();
        let mgr = TrajectoryStreamManager::new(config(&tmp, 10, 2)).unwrap();
        mgr.add(trajectory("t1", 1, 0.5)).await.unwrap();
        mgr.add(trajectory("t2", 2, 0.5)).await.unwrap();
        let migrated = mgr
            .migrate(MigrateOptions {
                target_version: 2,
                dry_run: false,
                backup: false,
            })
            .await
            .unwrap();
        assert_eq!(migrated, 0);
    }
}
