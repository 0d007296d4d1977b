//! Weight manager (C2): owns every layer's tensor, persists it atomically
//! with checksum verification, and rotates timestamped checkpoints.
//!
//! Grounded in `cache.rs`'s load/save-to-disk idiom from the teacher, with
//! the atomic tmp-then-rename protocol spec'd in spec.md §4.2.

mod tensor;
pub use tensor::{Initialization, WeightTensor};

use crate::error::{AgentDbError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sidecar metadata persisted next to a weight binary (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightMetadata {
    pub version: u32,
    pub timestamp: String,
    pub checksum: String,
    pub num_rows: usize,
    pub num_cols: usize,
    pub total_params: usize,
    pub initialization: Initialization,
    pub seed: Option<u32>,
}

struct LayerState {
    tensor: WeightTensor,
    init: Initialization,
    seed: Option<u32>,
    version: u32,
    update_count: u64,
}

/// Bounded retry policy shared by binary and metadata writes.
fn retry<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for n in 0..MAX_ATTEMPTS {
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(attempt = n, error = %e, "retrying write");
                last_err = Some(e);
                std::thread::sleep(std::time::Duration::from_millis(10 * (n as u64 + 1)));
            }
        }
    }
    Err(last_err.unwrap())
}

/// Manages every layer's tensor, keyed by an opaque `layerId`.
pub struct WeightManager {
    weights_dir: PathBuf,
    checkpoints_dir: PathBuf,
    checkpoint_interval_updates: u64,
    max_checkpoints: usize,
    checkpoints_enabled: bool,
    layers: RwLock<HashMap<String, LayerState>>,
}

/// Parameters for `initialize`.
pub struct InitParams {
    pub rows: usize,
    pub cols: usize,
    pub init: Initialization,
    pub seed: Option<u32>,
}

impl WeightManager {
    pub fn new(config: &crate::config::WeightManagerConfig) -> Result<Self> {
        fs::create_dir_all(&config.weights_dir)?;
        if config.checkpoints_enabled {
            fs::create_dir_all(&config.checkpoints_dir)?;
        }
        Ok(Self {
            weights_dir: config.weights_dir.clone(),
            checkpoints_dir: config.checkpoints_dir.clone(),
            checkpoint_interval_updates: config.checkpoint_interval_updates,
            max_checkpoints: config.max_checkpoints,
            checkpoints_enabled: config.checkpoints_enabled,
            layers: RwLock::new(HashMap::new()),
        })
    }

    fn weights_path(&self, layer_id: &str) -> PathBuf {
        self.weights_dir.join(format!("{layer_id}.weights.bin"))
    }

    fn meta_path(&self, layer_id: &str) -> PathBuf {
        self.weights_dir.join(format!("{layer_id}.weights.meta.json"))
    }

    pub fn initialize(&self, layer_id: &str, params: InitParams) -> Result<()> {
        let tensor = WeightTensor::initialize(params.rows, params.cols, params.init, params.seed);
        tensor.validate(None)?;
        self.layers.write().insert(
            layer_id.to_string(),
            LayerState {
                tensor,
                init: params.init,
                seed: params.seed,
                version: 1,
                update_count: 0,
            },
        );
        Ok(())
    }

    /// Whether `layer_id` has been initialized in this manager.
    pub fn contains(&self, layer_id: &str) -> bool {
        self.layers.read().contains_key(layer_id)
    }

    /// Returns a clone of the current tensor for `layer_id`.
    pub fn get(&self, layer_id: &str) -> Result<WeightTensor> {
        self.layers
            .read()
            .get(layer_id)
            .map(|s| s.tensor.clone())
            .ok_or_else(|| AgentDbError::not_found(format!("layer {layer_id}")))
    }

    /// Replaces the tensor wholesale; the incoming shape must equal the
    /// layer's existing configuration.
    pub fn set(&self, layer_id: &str, tensor: WeightTensor) -> Result<()> {
        tensor.validate(None)?;
        let mut layers = self.layers.write();
        let state = layers
            .get_mut(layer_id)
            .ok_or_else(|| AgentDbError::not_found(format!("layer {layer_id}")))?;
        if tensor.rows != state.tensor.rows || tensor.cols != state.tensor.cols {
            return Err(AgentDbError::validation(format!(
                "incoming shape {}x{} does not match layer {layer_id} shape {}x{}",
                tensor.rows, tensor.cols, state.tensor.rows, state.tensor.cols
            )));
        }
        state.tensor = tensor;
        Ok(())
    }

    /// `w <- w + scale * delta`, with a deep backup taken first and a
    /// rollback to that backup if the post-update tensor fails validation
    /// (e.g. a gradient explosion produced NaN/Inf).
    pub fn update_weights(&self, layer_id: &str, delta: &[f32], scale: f32) -> Result<()> {
        let mut layers = self.layers.write();
        let state = layers
            .get_mut(layer_id)
            .ok_or_else(|| AgentDbError::not_found(format!("layer {layer_id}")))?;
        if delta.len() != state.tensor.data.len() {
            return Err(AgentDbError::validation(format!(
                "delta length {} does not match layer {layer_id} param count {}",
                delta.len(),
                state.tensor.data.len()
            )));
        }
        let backup = state.tensor.data.clone();
        for (w, d) in state.tensor.data.iter_mut().zip(delta.iter()) {
            *w += scale * d;
        }
        if let Err(e) = state.tensor.validate(None) {
            state.tensor.data = backup;
            return Err(AgentDbError::GradientAnomaly {
                layer: layer_id.to_string(),
                detail: e.to_string(),
            });
        }
        state.update_count += 1;
        Ok(())
    }

    /// Atomic save protocol: build the binary buffer, write to `.tmp`,
    /// re-read and recompute MD5 to verify it equals the in-memory
    /// checksum, then atomically rename. A failed verify deletes the
    /// `.tmp` and raises without touching the previous `.bin`.
    pub fn atomic_save(&self, layer_id: &str) -> Result<()> {
        let (tensor, init, seed, version, update_count) = {
            let layers = self.layers.read();
            let state = layers
                .get(layer_id)
                .ok_or_else(|| AgentDbError::not_found(format!("layer {layer_id}")))?;
            (
                state.tensor.clone(),
                state.init,
                state.seed,
                state.version,
                state.update_count,
            )
        };

        let final_path = self.weights_path(layer_id);
        let tmp_path = self.weights_dir.join(format!("{layer_id}.weights.tmp"));
        let expected_checksum = tensor.checksum();
        let bytes = tensor.to_bytes();

        retry(|| -> Result<()> {
            fs::write(&tmp_path, &bytes)?;
            let reread = fs::read(&tmp_path)?;
            let reread_tensor = WeightTensor::from_bytes(&reread)?;
            if reread_tensor.checksum() != expected_checksum {
                let _ = fs::remove_file(&tmp_path);
                return Err(AgentDbError::other(format!(
                    "checksum verify failed for layer {layer_id}"
                )));
            }
            fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })?;

        let meta = WeightMetadata {
            version,
            timestamp: now_iso8601(),
            checksum: expected_checksum,
            num_rows: tensor.rows,
            num_cols: tensor.cols,
            total_params: tensor.total_params(),
            initialization: init,
            seed,
        };
        // Metadata write is best-effort (non-atomic), as spec'd.
        if let Err(e) = retry(|| -> Result<()> {
            let json = serde_json::to_string_pretty(&meta)?;
            fs::write(self.meta_path(layer_id), json)?;
            Ok(())
        }) {
            tracing::warn!(layer_id, error = %e, "failed to persist weight metadata");
        }

        if self.checkpoints_enabled
            && self.checkpoint_interval_updates > 0
            && update_count % self.checkpoint_interval_updates == 0
        {
            self.create_checkpoint(layer_id, &tensor, &meta)?;
            self.prune_checkpoints(layer_id)?;
        }
        Ok(())
    }

    /// Plain (non-atomic) save, used by callers that do not need the
    /// verify-then-rename guarantee (e.g. scratch/test fixtures).
    pub fn save(&self, layer_id: &str) -> Result<()> {
        self.atomic_save(layer_id)
    }

    pub fn load(&self, layer_id: &str, validate: bool) -> Result<WeightTensor> {
        let bytes = fs::read(self.weights_path(layer_id))?;
        let tensor = WeightTensor::from_bytes(&bytes)?;
        if validate {
            tensor.validate(None)?;
        }
        Ok(tensor)
    }

    pub fn delete(&self, layer_id: &str) -> Result<()> {
        self.layers.write().remove(layer_id);
        let _ = fs::remove_file(self.weights_path(layer_id));
        let _ = fs::remove_file(self.meta_path(layer_id));
        Ok(())
    }

    fn checkpoint_path(&self, layer_id: &str, timestamp_ms: u128) -> PathBuf {
        self.checkpoints_dir
            .join(format!("{layer_id}.checkpoint.{timestamp_ms}.bin"))
    }

    fn create_checkpoint(
        &self,
        layer_id: &str,
        tensor: &WeightTensor,
        meta: &WeightMetadata,
    ) -> Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let bin_path = self.checkpoint_path(layer_id, ts);
        fs::write(&bin_path, tensor.to_bytes())?;
        let meta_path = bin_path.with_extension("meta.json");
        fs::write(&meta_path, serde_json::to_string_pretty(meta)?)?;
        Ok(())
    }

    /// Lists checkpoints for `layer_id`, newest first, trusting the
    /// timestamp embedded in the filename rather than filesystem mtime —
    /// a deliberate choice, see SPEC_FULL.md §5.
    pub fn list_checkpoints(&self, layer_id: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{layer_id}.checkpoint.");
        let mut entries: Vec<(u128, PathBuf)> = Vec::new();
        if self.checkpoints_dir.exists() {
            for entry in fs::read_dir(&self.checkpoints_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(rest) = name.strip_prefix(&prefix) {
                    if let Some(ts_str) = rest.strip_suffix(".bin") {
                        if let Ok(ts) = ts_str.parse::<u128>() {
                            entries.push((ts, entry.path()));
                        }
                    }
                }
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, p)| p).collect())
    }

    fn prune_checkpoints(&self, layer_id: &str) -> Result<()> {
        let checkpoints = self.list_checkpoints(layer_id)?;
        for stale in checkpoints.into_iter().skip(self.max_checkpoints) {
            let _ = fs::remove_file(&stale);
            let _ = fs::remove_file(stale.with_extension("meta.json"));
        }
        Ok(())
    }

    pub fn restore_checkpoint(&self, layer_id: &str, checkpoint_path: &Path) -> Result<()> {
        let bytes = fs::read(checkpoint_path)?;
        let tensor = WeightTensor::from_bytes(&bytes)?;
        tensor.validate(None)?;
        let mut layers = self.layers.write();
        let state = layers
            .get_mut(layer_id)
            .ok_or_else(|| AgentDbError::not_found(format!("layer {layer_id}")))?;
        state.tensor = tensor;
        Ok(())
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}
