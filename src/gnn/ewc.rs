//! Online Elastic Weight Consolidation regularizer (C7).
//!
//! Tracks, per layer, a running Fisher-information diagonal and the
//! weights that were optimal for the last completed task, and applies a
//! quadratic penalty pulling weights back toward that optimum — scaled by
//! how important (per Fisher) each parameter was to the prior task.
//!
//! Persisted the same way `cache.rs` persists its JSON sidecars: one blob
//! per file, written with `fs::write` (best-effort, matching spec.md's
//! "logged and continues" tolerance for EWC state corruption).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EwcBlob {
    task_count: u64,
    layers: HashMap<String, Vec<f32>>,
}

/// Per-layer Fisher diagonal + optimal-weight snapshot, with online update
/// and persistence.
pub struct EwcRegularizer {
    ewc_dir: PathBuf,
    fisher_alpha: f32,
    fisher: parking_lot::RwLock<HashMap<String, Vec<f32>>>,
    optimal: parking_lot::RwLock<HashMap<String, Vec<f32>>>,
    task_count: parking_lot::RwLock<u64>,
    /// Per-layer gradients recorded since the last `complete_task`.
    pending_gradients: parking_lot::RwLock<HashMap<String, Vec<Vec<f32>>>>,
}

impl EwcRegularizer {
    pub fn new(ewc_dir: PathBuf, fisher_alpha: f32) -> Result<Self> {
        fs::create_dir_all(&ewc_dir)?;
        let fisher = load_blob(&ewc_dir.join("fisher.json"));
        let optimal = load_blob(&ewc_dir.join("optimal-weights.json"));
        Ok(Self {
            ewc_dir,
            fisher_alpha,
            task_count: parking_lot::RwLock::new(fisher.task_count.max(optimal.task_count)),
            fisher: parking_lot::RwLock::new(fisher.layers),
            optimal: parking_lot::RwLock::new(optimal.layers),
            pending_gradients: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    pub fn task_count(&self) -> u64 {
        *self.task_count.read()
    }

    /// Whether a prior task's optimum exists for `layer_id` (if none, the
    /// penalty is skipped per spec.md §4.5).
    pub fn has_prior_task(&self, layer_id: &str) -> bool {
        self.optimal.read().contains_key(layer_id)
    }

    /// Appends a per-batch weight gradient for `layer_id`, to be folded
    /// into the Fisher estimate at `complete_task`.
    pub fn record_batch_gradient(&self, layer_id: &str, gradient: &[f32]) {
        self.pending_gradients
            .write()
            .entry(layer_id.to_string())
            .or_default()
            .push(gradient.to_vec());
    }

    /// Applies `w <- w - lambda * F[i] * (w - w*[i])` in place. A no-op
    /// when no optimal snapshot exists yet for `layer_id`.
    pub fn apply_penalty(&self, layer_id: &str, weights: &mut [f32], lambda: f32) {
        let optimal = self.optimal.read();
        let Some(opt) = optimal.get(layer_id) else {
            return;
        };
        let fisher = self.fisher.read();
        let Some(f) = fisher.get(layer_id) else {
            return;
        };
        for i in 0..weights.len() {
            let fi = f.get(i).copied().unwrap_or(0.0);
            let oi = opt.get(i).copied().unwrap_or(weights[i]);
            weights[i] -= lambda * fi * (weights[i] - oi);
        }
    }

    /// Folds every layer's pending per-batch gradients into the running
    /// Fisher estimate (`F <- alpha*F + (1-alpha)*mean(g^2)`), snapshots
    /// `current_weights` as the new optimal point, persists both, clears
    /// the pending gradient history, and increments the task counter.
    pub fn complete_task(&self, current_weights: &HashMap<String, Vec<f32>>) -> Result<()> {
        let mut pending = self.pending_gradients.write();
        let mut fisher = self.fisher.write();

        for (layer_id, batches) in pending.iter() {
            if batches.is_empty() {
                continue;
            }
            let dim = batches[0].len();
            let mut mean_sq = vec![0.0_f32; dim];
            for batch in batches {
                for (m, g) in mean_sq.iter_mut().zip(batch.iter()) {
                    *m += g * g;
                }
            }
            let n = batches.len() as f32;
            for m in mean_sq.iter_mut() {
                *m /= n;
            }
            let entry = fisher.entry(layer_id.clone()).or_insert_with(|| vec![0.0; dim]);
            if entry.len() != dim {
                *entry = vec![0.0; dim];
            }
            for (f, g2) in entry.iter_mut().zip(mean_sq.iter()) {
                *f = self.fisher_alpha * *f + (1.0 - self.fisher_alpha) * g2;
            }
        }
        pending.clear();
        drop(pending);

        {
            let mut optimal = self.optimal.write();
            for (layer_id, weights) in current_weights {
                optimal.insert(layer_id.clone(), weights.clone());
            }
        }
        *self.task_count.write() += 1;

        self.persist(&fisher)?;
        Ok(())
    }

    fn persist(&self, fisher: &HashMap<String, Vec<f32>>) -> Result<()> {
        let task_count = *self.task_count.read();
        let fisher_blob = EwcBlob {
            task_count,
            layers: fisher.clone(),
        };
        let optimal_blob = EwcBlob {
            task_count,
            layers: self.optimal.read().clone(),
        };
        if let Err(e) = fs::write(
            self.ewc_dir.join("fisher.json"),
            serde_json::to_vec_pretty(&fisher_blob)?,
        ) {
            tracing::warn!(error = %e, "failed to persist EWC fisher diagonal");
        }
        if let Err(e) = fs::write(
            self.ewc_dir.join("optimal-weights.json"),
            serde_json::to_vec_pretty(&optimal_blob)?,
        ) {
            tracing::warn!(error = %e, "failed to persist EWC optimal weights");
        }
        Ok(())
    }

    /// Flattened length of the persisted Fisher/optimal vectors for
    /// `layer_id`, used by tests asserting the EWC-shape invariant.
    pub fn layer_shape(&self, layer_id: &str) -> Option<(usize, usize)> {
        let f_len = self.fisher.read().get(layer_id).map(|v| v.len());
        let o_len = self.optimal.read().get(layer_id).map(|v| v.len());
        match (f_len, o_len) {
            (Some(f), Some(o)) => Some((f, o)),
            _ => None,
        }
    }
}

fn load_blob(path: &std::path::Path) -> EwcBlob {
    fs::read(path)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn no_penalty_without_prior_task() {
        let tmp = TempDir::new().unwrap();
        let ewc = EwcRegularizer::new(tmp.path().to_path_buf(), 0.9).unwrap();
        let mut w = vec![1.0, 2.0];
        ewc.apply_penalty("layer0", &mut w, 1.0);
        assert_eq!(w, vec![1.0, 2.0]);
    }

    #[test]
    fn scenario_s6_ewc_penalty_pulls_only_important_coordinate() {
        let tmp = TempDir::new().unwrap();
        let ewc = EwcRegularizer::new(tmp.path().to_path_buf(), 0.0).unwrap();
        // Fisher after one task: F=[1,0]. With alpha=0, F <- (1-0)*mean(g^2),
        // so a single batch gradient of [1.0, 0.0] yields F=[1,0].
        ewc.record_batch_gradient("layer0", &[1.0, 0.0]);
        let mut optimal = HashMap::new();
        optimal.insert("layer0".to_string(), vec![0.5, 0.5]);
        ewc.complete_task(&optimal).unwrap();

        let mut w = vec![1.0, 1.0];
        ewc.apply_penalty("layer0", &mut w, 1.0);
        assert!((w[0] - 0.5).abs() < 1e-6);
        assert!((w[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn complete_task_increments_counter_and_clears_pending() {
        let tmp = TempDir::new().unwrap();
        let ewc = EwcRegularizer::new(tmp.path().to_path_buf(), 0.9).unwrap();
        ewc.record_batch_gradient("layer0", &[0.1, 0.2]);
        let mut optimal = HashMap::new();
        optimal.insert("layer0".to_string(), vec![0.0, 0.0]);
        ewc.complete_task(&optimal).unwrap();
        assert_eq!(ewc.task_count(), 1);
        assert!(ewc.pending_gradients.read().is_empty());
    }

    #[test]
    fn fisher_and_optimal_shapes_match_layer_param_count() {
        let tmp = TempDir::new().unwrap();
        let ewc = EwcRegularizer::new(tmp.path().to_path_buf(), 0.9).unwrap();
        ewc.record_batch_gradient("layer0", &[0.1, 0.2, 0.3]);
        let mut optimal = HashMap::new();
        optimal.insert("layer0".to_string(), vec![0.0, 0.0, 0.0]);
        ewc.complete_task(&optimal).unwrap();
        let (f_len, o_len) = ewc.layer_shape("layer0").unwrap();
        assert_eq!(f_len, 3);
        assert_eq!(o_len, 3);
    }

    #[test]
    fn persisted_state_reloads_across_instances() {
        let tmp = TempDir::new().unwrap();
        {
            let ewc = EwcRegularizer::new(tmp.path().to_path_buf(), 0.9).unwrap();
            ewc.record_batch_gradient("layer0", &[1.0]);
            let mut optimal = HashMap::new();
            optimal.insert("layer0".to_string(), vec![2.0]);
            ewc.complete_task(&optimal).unwrap();
        }
        let reloaded = EwcRegularizer::new(tmp.path().to_path_buf(), 0.9).unwrap();
        assert_eq!(reloaded.task_count(), 1);
        assert!(reloaded.has_prior_task("layer0"));
    }
}
