//! Trainer loop (C9): orchestrates forward/backward through the GNN
//! layers, contrastive triplet loss, Adam updates, and online EWC, with
//! epoch/batch scheduling, validation, early stopping, and checkpoints.
//!
//! Grounded in `research/worker.rs`'s bounded-orchestrator shape
//! (config-driven scheduling over a unit of work) generalized here into
//! an epoch/batch training schedule.

use crate::config::TrainerConfig;
use crate::error::{AgentDbError, Result};
use crate::gnn::contrastive::{ContrastiveLoss, EmbeddingSample};
use crate::gnn::ewc::EwcRegularizer;
use crate::gnn::network::{backward_through_cache, GnnLayer, LayerActivations};
use crate::gnn::optimizer::{AdamOptimizer, OptimizerState};
use crate::weights::WeightManager;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A query-embedding sample with an outcome quality, as consumed by the
/// trainer (distinct from `contrastive::EmbeddingSample` so the trainer's
/// public surface doesn't leak the contrastive module's internals).
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub id: String,
    pub embedding: Vec<f32>,
    pub enhanced_embedding: Option<Vec<f32>>,
    pub quality: f32,
}

impl TrainingSample {
    fn is_valid(&self) -> bool {
        self.quality.is_finite()
            && (0.0..=1.0).contains(&self.quality)
            && !self.embedding.is_empty()
    }
}

/// One recorded training step, appended to the trainer's (optional)
/// history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub id: String,
    pub epoch: usize,
    pub batch_index: usize,
    pub loss: f32,
    pub learning_rate: f32,
    pub samples_count: usize,
    pub created_at: i64,
}

/// Result of one full epoch.
#[derive(Debug, Clone)]
pub struct EpochResult {
    pub epoch: usize,
    pub average_loss: f32,
    pub validation_loss: Option<f32>,
    pub improved: bool,
    pub stopped_early: bool,
}

/// Summary returned by `train`.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub best_validation_loss: f32,
    pub stopped_early: bool,
}

const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Persisted trainer checkpoint, embedding the optimizer's moment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerCheckpoint {
    pub version: u32,
    pub epoch: usize,
    pub best_validation_loss: f32,
    pub epochs_without_improvement: usize,
    pub optimizer_state: OptimizerState,
    pub config: TrainerConfig,
    pub timestamp: String,
}

/// Orchestrates the GNN trainer: owns the layer stack (shared weights
/// live in `WeightManager`), the Adam optimizer, and EWC state, and
/// exposes batch/epoch/full-training entry points.
pub struct GnnTrainer {
    config: TrainerConfig,
    weight_manager: Arc<WeightManager>,
    ewc: Arc<EwcRegularizer>,
    optimizer: AdamOptimizer,
    layers: Vec<GnnLayer>,
    history: Vec<TrainingRecord>,
    epoch: usize,
    best_validation_loss: f32,
    epochs_without_improvement: usize,
    stopped_early: bool,
}

impl GnnTrainer {
    /// `layers` is the ordered list of `(layer_id, residual)` GNN layers
    /// the trainer refines embeddings through; every id must already be
    /// initialized in `weight_manager` (or this returns `NotFound`).
    pub fn new(
        config: TrainerConfig,
        weight_manager: Arc<WeightManager>,
        ewc: Arc<EwcRegularizer>,
        layers: Vec<(String, bool)>,
    ) -> Result<Self> {
        for (id, _) in &layers {
            if !weight_manager.contains(id) {
                return Err(AgentDbError::not_found(format!("GNN layer {id}")));
            }
        }
        let optimizer = AdamOptimizer::new(
            config.learning_rate,
            config.adam_beta1,
            config.adam_beta2,
            config.adam_epsilon,
        );
        let layers = layers
            .into_iter()
            .map(|(id, residual)| GnnLayer::new(id, residual))
            .collect();
        Ok(Self {
            config,
            weight_manager,
            ewc,
            optimizer,
            layers,
            history: Vec::new(),
            epoch: 0,
            best_validation_loss: f32::INFINITY,
            epochs_without_improvement: 0,
            stopped_early: false,
        })
    }

    pub fn history(&self) -> &[TrainingRecord] {
        &self.history
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    fn contrastive_loss(&self) -> ContrastiveLoss {
        ContrastiveLoss::new(
            self.config.triplet_margin,
            self.config.positive_quality_threshold,
            self.config.negative_quality_threshold,
            self.config.max_gradient_norm,
        )
    }

    /// Forwards one embedding through every layer, caching activations in
    /// forward order.
    fn forward(&self, embedding: &[f32]) -> Result<(Vec<f32>, Vec<LayerActivations>)> {
        let mut x = embedding.to_vec();
        let mut cache = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let weights = self.weight_manager.get(&layer.layer_id)?;
            let activ = layer.forward(&x, &weights, None);
            x = activ.output.clone();
            cache.push(activ);
        }
        Ok((x, cache))
    }

    fn residual_flags(&self) -> Vec<bool> {
        self.layers.iter().map(|l| l.residual).collect()
    }

    /// Computes the average contrastive loss over `samples` without
    /// updating any weights — used for validation.
    pub fn validate(&self, samples: &[TrainingSample]) -> Result<f32> {
        let valid: Vec<&TrainingSample> = samples.iter().filter(|s| s.is_valid()).collect();
        if valid.is_empty() {
            return Ok(0.0);
        }
        let mut refined = Vec::with_capacity(valid.len());
        for s in &valid {
            let (out, _) = self.forward(&s.embedding)?;
            refined.push(EmbeddingSample {
                id: s.id.clone(),
                embedding: out,
                enhanced_embedding: None,
                quality: s.quality,
            });
        }
        let loss = self.contrastive_loss();
        let result = loss.forward_backward(&refined);
        if result.active_count == 0 {
            Ok(0.0)
        } else {
            Ok(result.total_loss / result.active_count as f32)
        }
    }

    /// Trains one batch: forward every sample through the GNN, mine
    /// contrastive triplets on the refined embeddings, route gradients
    /// back through each sample's forward cache, record the aggregate
    /// weight gradient for EWC, then apply an Adam step (+ EWC penalty if
    /// a prior task exists).
    pub fn train_batch(
        &mut self,
        samples: &[TrainingSample],
        epoch: usize,
        batch_index: usize,
    ) -> Result<TrainingRecord> {
        let valid: Vec<&TrainingSample> = samples.iter().filter(|s| s.is_valid()).collect();
        let mut refined_embeddings = Vec::with_capacity(valid.len());
        let mut caches = Vec::with_capacity(valid.len());
        for s in &valid {
            let (out, cache) = self.forward(&s.embedding)?;
            refined_embeddings.push(out);
            caches.push(cache);
        }
        let refined_samples: Vec<EmbeddingSample> = valid
            .iter()
            .zip(refined_embeddings.iter())
            .map(|(s, e)| EmbeddingSample {
                id: s.id.clone(),
                embedding: e.clone(),
                enhanced_embedding: None,
                quality: s.quality,
            })
            .collect();

        let loss = self.contrastive_loss();
        let scored = loss.forward_backward(&refined_samples);
        let record_loss = if scored.active_count == 0 {
            0.0
        } else {
            scored.total_loss / scored.active_count as f32
        };

        if scored.active_count > 0 && scored.total_loss > 0.0 && !valid.is_empty() {
            let (total_query_grad, indexed) = loss.mine_triplets_indexed(&refined_samples);
            let dim = total_query_grad.len();
            let mut sum_query_grad = vec![0.0_f32; dim];
            for g in &indexed {
                for (s, v) in sum_query_grad.iter_mut().zip(g.gradient.d_query.iter()) {
                    *s += v;
                }
            }
            let n = valid.len() as f32;
            let mut d_refined: Vec<Vec<f32>> = (0..valid.len())
                .map(|_| sum_query_grad.iter().map(|v| v / n).collect())
                .collect();
            for g in &indexed {
                for (d, v) in d_refined[g.positive_index]
                    .iter_mut()
                    .zip(g.gradient.d_positive.iter())
                {
                    *d += v;
                }
                for (d, v) in d_refined[g.negative_index]
                    .iter_mut()
                    .zip(g.gradient.d_negative.iter())
                {
                    *d += v;
                }
            }

            let residual_flags = self.residual_flags();
            let mut layer_grads: HashMap<String, Vec<f32>> = HashMap::new();
            for (cache, d_out) in caches.iter().zip(d_refined.iter()) {
                for (layer_id, grads) in backward_through_cache(cache, d_out, &residual_flags) {
                    let entry = layer_grads
                        .entry(layer_id)
                        .or_insert_with(|| vec![0.0; grads.d_weights.len()]);
                    if entry.len() != grads.d_weights.len() {
                        *entry = vec![0.0; grads.d_weights.len()];
                    }
                    for (e, v) in entry.iter_mut().zip(grads.d_weights.iter()) {
                        *e += v;
                    }
                }
            }

            for (layer_id, grad) in &layer_grads {
                self.ewc.record_batch_gradient(layer_id, grad);
                let mut weights_vec = self.weight_manager.get(layer_id)?.data;
                self.optimizer.step(layer_id, &mut weights_vec, grad);
                if self.ewc.has_prior_task(layer_id) {
                    self.ewc
                        .apply_penalty(layer_id, &mut weights_vec, self.config.ewc_lambda);
                }
                let original = self.weight_manager.get(layer_id)?.data;
                let delta: Vec<f32> = weights_vec
                    .iter()
                    .zip(original.iter())
                    .map(|(new, old)| new - old)
                    .collect();
                self.weight_manager.update_weights(layer_id, &delta, 1.0)?;
            }
        }

        let record = TrainingRecord {
            id: Uuid::new_v4().to_string(),
            epoch,
            batch_index,
            loss: record_loss,
            learning_rate: self.optimizer.learning_rate,
            samples_count: valid.len(),
            created_at: now_ms(),
        };
        self.history.push(record.clone());
        Ok(record)
    }

    /// Runs one epoch over `samples`, optionally shuffled, batched by
    /// `config.batch_size`. When `validation` is supplied, early-stop
    /// bookkeeping uses validation loss; otherwise it uses training loss.
    pub fn train_epoch(
        &mut self,
        samples: &[TrainingSample],
        validation: Option<&[TrainingSample]>,
    ) -> Result<EpochResult> {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut rand::thread_rng());
        }
        let epoch = self.epoch;
        let mut losses = Vec::new();
        for (batch_idx, chunk) in order.chunks(self.config.batch_size.max(1)).enumerate() {
            let batch: Vec<TrainingSample> = chunk.iter().map(|&i| samples[i].clone()).collect();
            let record = self.train_batch(&batch, epoch, batch_idx)?;
            losses.push(record.loss);
        }
        let average_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        };

        let validation_loss = match validation {
            Some(v) => Some(self.validate(v)?),
            None => None,
        };
        let judged_loss = validation_loss.unwrap_or(average_loss);

        let improved = self.best_validation_loss - judged_loss >= self.config.min_improvement;
        if improved {
            self.best_validation_loss = judged_loss;
            self.epochs_without_improvement = 0;
            for layer in &self.layers {
                self.weight_manager.atomic_save(&layer.layer_id)?;
            }
        } else {
            self.epochs_without_improvement += 1;
        }
        if self.epochs_without_improvement >= self.config.early_stopping_patience {
            self.stopped_early = true;
        }
        self.epoch += 1;

        Ok(EpochResult {
            epoch,
            average_loss,
            validation_loss,
            improved,
            stopped_early: self.stopped_early,
        })
    }

    /// Runs up to `config.max_epochs`, splitting off a validation tail by
    /// `config.validation_split` when `validation` is not supplied
    /// explicitly, stopping early on `stopped_early`.
    pub fn train(
        &mut self,
        samples: &[TrainingSample],
        validation: Option<&[TrainingSample]>,
    ) -> Result<TrainingSummary> {
        let (train_set, val_set): (Vec<TrainingSample>, Option<Vec<TrainingSample>>) = match validation {
            Some(v) => (samples.to_vec(), Some(v.to_vec())),
            None => {
                let split = self.config.validation_split.clamp(0.0, 0.9);
                let val_len = ((samples.len() as f32) * split).round() as usize;
                if val_len == 0 || samples.len() < 2 {
                    (samples.to_vec(), None)
                } else {
                    let train_len = samples.len() - val_len;
                    (samples[..train_len].to_vec(), Some(samples[train_len..].to_vec()))
                }
            }
        };

        let mut epochs_run = 0;
        for _ in 0..self.config.max_epochs {
            let result = self.train_epoch(&train_set, val_set.as_deref())?;
            epochs_run += 1;
            if result.stopped_early {
                break;
            }
        }
        Ok(TrainingSummary {
            epochs_run,
            best_validation_loss: self.best_validation_loss,
            stopped_early: self.stopped_early,
        })
    }

    /// Folds this task's accumulated batch gradients into the EWC Fisher
    /// estimate, snapshots current weights as the new optimum, and
    /// advances the EWC task counter.
    pub fn complete_task(&self, task_id: &str) -> Result<()> {
        let mut snapshot = HashMap::new();
        for layer in &self.layers {
            snapshot.insert(layer.layer_id.clone(), self.weight_manager.get(&layer.layer_id)?.data);
        }
        tracing::info!(task_id, layers = snapshot.len(), "completing EWC task");
        self.ewc.complete_task(&snapshot)
    }

    pub fn reset(&mut self) {
        self.optimizer.reset();
        self.history.clear();
        self.epoch = 0;
        self.best_validation_loss = f32::INFINITY;
        self.epochs_without_improvement = 0;
        self.stopped_early = false;
    }

    /// Atomically writes a `TrainerCheckpoint` to `path`.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let checkpoint = TrainerCheckpoint {
            version: CHECKPOINT_FORMAT_VERSION,
            epoch: self.epoch,
            best_validation_loss: self.best_validation_loss,
            epochs_without_improvement: self.epochs_without_improvement,
            optimizer_state: self.optimizer.export_state(),
            config: self.config.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&checkpoint)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restores trainer state from a checkpoint. A format-version
    /// mismatch is logged and the checkpoint is applied anyway, per
    /// spec.md §4.7.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let checkpoint: TrainerCheckpoint = serde_json::from_slice(&bytes)?;
        if checkpoint.version != CHECKPOINT_FORMAT_VERSION {
            tracing::warn!(
                found = checkpoint.version,
                expected = CHECKPOINT_FORMAT_VERSION,
                "trainer checkpoint version mismatch, applying anyway"
            );
        }
        self.epoch = checkpoint.epoch;
        self.best_validation_loss = checkpoint.best_validation_loss;
        self.epochs_without_improvement = checkpoint.epochs_without_improvement;
        self.optimizer.import_state(checkpoint.optimizer_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrainerConfig, WeightManagerConfig};
    use crate::weights::{InitParams, Initialization, WeightManager};
    use tempfile::TempDir;

    fn sample(id: &str, embedding: Vec<f32>, quality: f32) -> TrainingSample {
        TrainingSample {
            id: id.to_string(),
            embedding,
            enhanced_embedding: None,
            quality,
        }
    }

    fn trainer(tmp: &TempDir) -> GnnTrainer {
        let wcfg = WeightManagerConfig {
            weights_dir: tmp.path().join("weights"),
            checkpoints_dir: tmp.path().join("checkpoints"),
            checkpoint_interval_updates: 1000,
            max_checkpoints: 3,
            checkpoints_enabled: true,
        };
        let wm = Arc::new(WeightManager::new(&wcfg).unwrap());
        wm.initialize(
            "layer0",
            InitParams {
                rows: 4,
                cols: 4,
                init: Initialization::Xavier,
                seed: Some(3),
            },
        )
        .unwrap();
        let ewc = Arc::new(EwcRegularizer::new(tmp.path().join("ewc"), 0.9).unwrap());
        let cfg = TrainerConfig {
            batch_size: 4,
            max_epochs: 2,
            ..TrainerConfig::default()
        };
        GnnTrainer::new(cfg, wm, ewc, vec![("layer0".to_string(), true)]).unwrap()
    }

    #[test]
    fn new_rejects_uninitialized_layer() {
        let tmp = TempDir::new().unwrap();
        let wcfg = WeightManagerConfig {
            weights_dir: tmp.path().join("weights"),
            checkpoints_dir: tmp.path().join("checkpoints"),
            checkpoint_interval_updates: 1000,
            max_checkpoints: 3,
            checkpoints_enabled: false,
        };
        let wm = Arc::new(WeightManager::new(&wcfg).unwrap());
        let ewc = Arc::new(EwcRegularizer::new(tmp.path().join("ewc"), 0.9).unwrap());
        let result = GnnTrainer::new(
            TrainerConfig::default(),
            wm,
            ewc,
            vec![("missing".to_string(), true)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn train_batch_updates_weights_when_loss_is_active() {
        let tmp = TempDir::new().unwrap();
        let mut t = trainer(&tmp);
        let before = t.weight_manager.get("layer0").unwrap().data;
        let batch = vec![
            sample("p1", vec![1.0, 0.0, 0.0, 0.0], 0.9),
            sample("p2", vec![0.9, 0.1, 0.0, 0.0], 0.85),
            sample("n1", vec![0.0, 1.0, 0.0, 0.0], 0.1),
            sample("n2", vec![0.0, 0.9, 0.1, 0.0], 0.05),
        ];
        let record = t.train_batch(&batch, 0, 0).unwrap();
        assert_eq!(record.samples_count, 4);
        let after = t.weight_manager.get("layer0").unwrap().data;
        assert_ne!(before, after);
    }

    #[test]
    fn train_batch_skips_update_with_no_active_triplets() {
        let tmp = TempDir::new().unwrap();
        let mut t = trainer(&tmp);
        let before = t.weight_manager.get("layer0").unwrap().data;
        // All mid-quality: no positives, no negatives, no triplets.
        let batch = vec![
            sample("m1", vec![1.0, 0.0, 0.0, 0.0], 0.5),
            sample("m2", vec![0.0, 1.0, 0.0, 0.0], 0.5),
        ];
        t.train_batch(&batch, 0, 0).unwrap();
        let after = t.weight_manager.get("layer0").unwrap().data;
        assert_eq!(before, after);
    }

    #[test]
    fn complete_task_advances_ewc_task_count() {
        let tmp = TempDir::new().unwrap();
        let t = trainer(&tmp);
        assert_eq!(t.ewc.task_count(), 0);
        t.complete_task("task-1").unwrap();
        assert_eq!(t.ewc.task_count(), 1);
        assert!(t.ewc.has_prior_task("layer0"));
    }

    #[test]
    fn checkpoint_round_trips_optimizer_state() {
        let tmp = TempDir::new().unwrap();
        let mut t = trainer(&tmp);
        let batch = vec![
            sample("p1", vec![1.0, 0.0, 0.0, 0.0], 0.9),
            sample("n1", vec![0.0, 1.0, 0.0, 0.0], 0.1),
        ];
        t.train_batch(&batch, 0, 0).unwrap();
        let path = tmp.path().join("trainer.checkpoint.json");
        t.save_checkpoint(&path).unwrap();

        let mut t2 = trainer(&tmp);
        t2.load_checkpoint(&path).unwrap();
        assert_eq!(t2.best_validation_loss, t.best_validation_loss);
    }

    #[test]
    fn reset_clears_history_and_optimizer() {
        let tmp = TempDir::new().unwrap();
        let mut t = trainer(&tmp);
        let batch = vec![
            sample("p1", vec![1.0, 0.0, 0.0, 0.0], 0.9),
            sample("n1", vec![0.0, 1.0, 0.0, 0.0], 0.1),
        ];
        t.train_batch(&batch, 0, 0).unwrap();
        assert!(!t.history().is_empty());
        t.reset();
        assert!(t.history().is_empty());
        assert_eq!(t.best_validation_loss, f32::INFINITY);
    }
}
