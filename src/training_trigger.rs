//! Training trigger (C10): an autonomic threshold-plus-cooldown gate that
//! buffers trajectories and decides when to fire a training run, with a
//! persisted buffer so pending samples survive a restart.
//!
//! Grounded in `db/queue.rs`'s stage/priority buffering idiom and
//! `cost_tracker.rs`'s threshold/budget bookkeeping, generalized into the
//! sample-density + cooldown policy of spec.md §4.8.

use crate::config::TrainingTriggerConfig;
use crate::error::{AgentDbError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

const BUFFER_FORMAT_VERSION: &str = "1.0.0";

/// A trajectory waiting in the trigger's pending buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedTrajectory {
    pub id: String,
    pub embedding: Vec<f32>,
    pub enhanced_embedding: Option<Vec<f32>>,
    pub quality: f32,
}

/// The dataset handed to a training run: every buffered trajectory plus
/// the batch centroid query, computed the same way `ContrastiveLoss`
/// computes its batch query.
#[derive(Debug, Clone)]
pub struct TrainingDataset {
    pub trajectories: Vec<BufferedTrajectory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BufferStats {
    total_added: u64,
    successful_trainings: u64,
    failed_trainings: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedBuffer {
    version: String,
    timestamp: String,
    trajectories: Vec<BufferedTrajectory>,
    stats: BufferStats,
}

/// Outcome of a completed training run, as reported back by a
/// `TrainerHandle`.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub loss: f32,
    pub samples_count: usize,
    pub reason: String,
}

/// Why `check_and_train` did or didn't execute a training run.
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Refused(String),
    Executed(TrainingOutcome),
}

/// Abstraction over "run a training pass on this dataset", implemented by
/// whatever owns the actual `GnnTrainer` (kept out of this module so the
/// trigger doesn't need to know about layers, Adam, or EWC).
pub trait TrainerHandle: Send + Sync {
    fn run_training(&self, dataset: &TrainingDataset) -> Result<TrainingOutcome>;
}

struct State {
    buffer: Vec<BufferedTrajectory>,
    stats: BufferStats,
    last_training_time: Option<i64>,
    last_training_loss: Option<f32>,
}

/// Gates training runs behind a sample-density threshold and a cooldown,
/// with a persisted pending buffer and a bounded force-training wait.
pub struct TrainingTrigger {
    config: TrainingTriggerConfig,
    state: Mutex<State>,
    training_in_progress: std::sync::atomic::AtomicBool,
    training_done: Notify,
}

impl TrainingTrigger {
    pub fn new(config: TrainingTriggerConfig) -> Result<Self> {
        if let Some(parent) = config.buffer_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let loaded = load_buffer(&config.buffer_path);
        Ok(Self {
            config,
            state: Mutex::new(State {
                buffer: loaded.as_ref().map(|b| b.trajectories.clone()).unwrap_or_default(),
                stats: loaded.map(|b| b.stats).unwrap_or_default(),
                last_training_time: None,
                last_training_loss: None,
            }),
            training_in_progress: std::sync::atomic::AtomicBool::new(false),
            training_done: Notify::new(),
        })
    }

    pub async fn buffer_len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    pub fn is_training_in_progress(&self) -> bool {
        self.training_in_progress.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Validates and appends a trajectory sample to the pending buffer,
    /// persisting the buffer best-effort. Returns `true` if the buffer has
    /// reached `max_pending_samples` and a force-drain is warranted.
    pub async fn add_trajectory(&self, sample: BufferedTrajectory) -> Result<bool> {
        if sample.id.is_empty() {
            return Err(AgentDbError::validation("trajectory id must not be empty"));
        }
        if !sample.quality.is_finite() || !(0.0..=1.0).contains(&sample.quality) {
            return Err(AgentDbError::validation("trajectory quality must be finite and in [0,1]"));
        }
        let should_force = {
            let mut state = self.state.lock().await;
            state.buffer.push(sample);
            state.stats.total_added += 1;
            if let Err(e) = persist_buffer(&self.config.buffer_path, &state.buffer, &state.stats) {
                tracing::warn!(error = %e, "failed to persist training buffer");
            }
            state.buffer.len() >= self.config.max_pending_samples
        };
        Ok(should_force)
    }

    /// `false` while training is in progress, within cooldown, or below
    /// the sample threshold; `true` otherwise.
    pub async fn should_trigger(&self) -> bool {
        if self.is_training_in_progress() {
            return false;
        }
        let state = self.state.lock().await;
        if let Some(last) = state.last_training_time {
            if (now_ms() - last) < self.config.cooldown_ms as i64 {
                return false;
            }
        }
        state.buffer.len() >= self.config.min_samples
    }

    /// Runs `executeTraining('threshold')` if `should_trigger` allows it,
    /// otherwise returns a refusal reason.
    pub async fn check_and_train(&self, trainer: &dyn TrainerHandle) -> Result<TriggerOutcome> {
        if self.is_training_in_progress() {
            return Ok(TriggerOutcome::Refused("training already in progress".to_string()));
        }
        let buffer_len = self.state.lock().await.buffer.len();
        if buffer_len < self.config.min_samples {
            return Ok(TriggerOutcome::Refused(format!(
                "buffer has {buffer_len} samples, below threshold {}",
                self.config.min_samples
            )));
        }
        if !self.should_trigger().await {
            return Ok(TriggerOutcome::Refused("within cooldown window".to_string()));
        }
        Ok(TriggerOutcome::Executed(self.execute_training(trainer, "threshold").await?))
    }

    /// Waits (bounded ~60s) for any in-flight training to finish, then
    /// runs `executeTraining('force')` regardless of threshold/cooldown.
    pub async fn force_training(&self, trainer: &dyn TrainerHandle) -> Result<TrainingOutcome> {
        if self.is_training_in_progress() {
            let waited = tokio::time::timeout(Duration::from_secs(60), self.training_done.notified()).await;
            if waited.is_err() {
                return Err(AgentDbError::TimeoutExceeded("force-training wait".to_string()));
            }
        }
        self.execute_training(trainer, "force").await
    }

    async fn execute_training(&self, trainer: &dyn TrainerHandle, reason: &str) -> Result<TrainingOutcome> {
        self.training_in_progress.store(true, std::sync::atomic::Ordering::SeqCst);
        let dataset = {
            let state = self.state.lock().await;
            TrainingDataset {
                trajectories: state.buffer.clone(),
            }
        };

        let result = trainer.run_training(&dataset);

        self.training_in_progress.store(false, std::sync::atomic::Ordering::SeqCst);
        self.training_done.notify_waiters();

        match result {
            Ok(mut outcome) => {
                outcome.reason = reason.to_string();
                let mut state = self.state.lock().await;
                state.last_training_time = Some(now_ms());
                state.last_training_loss = Some(outcome.loss);
                state.stats.successful_trainings += 1;
                state.buffer.clear();
                if let Err(e) = persist_buffer(&self.config.buffer_path, &state.buffer, &state.stats) {
                    tracing::warn!(error = %e, "failed to persist cleared training buffer");
                }
                Ok(outcome)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.stats.failed_trainings += 1;
                tracing::warn!(error = %e, reason, "training run failed, buffer retained");
                Err(e)
            }
        }
    }

    pub async fn last_training_loss(&self) -> Option<f32> {
        self.state.lock().await.last_training_loss
    }

    /// Drains the buffer via a forced training run, intended for a clean
    /// shutdown path.
    pub async fn shutdown(&self, trainer: &dyn TrainerHandle) -> Result<()> {
        if self.buffer_len().await > 0 {
            self.force_training(trainer).await?;
        }
        Ok(())
    }
}

fn persist_buffer(path: &std::path::Path, buffer: &[BufferedTrajectory], stats: &BufferStats) -> Result<()> {
    let payload = PersistedBuffer {
        version: BUFFER_FORMAT_VERSION.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        trajectories: buffer.to_vec(),
        stats: stats.clone(),
    };
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&payload)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_buffer(path: &std::path::Path) -> Option<PersistedBuffer> {
    let bytes = fs::read(path).ok()?;
    let parsed: PersistedBuffer = serde_json::from_slice(&bytes).ok()?;
    if parsed.version != BUFFER_FORMAT_VERSION {
        tracing::warn!(found = %parsed.version, "training buffer version mismatch, skipping load");
        return None;
    }
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(tmp: &TempDir, min_samples: usize, max_pending: usize, cooldown_ms: u64) -> TrainingTriggerConfig {
        TrainingTriggerConfig {
            buffer_path: tmp.path().join("buffer.json"),
            min_samples,
            cooldown_ms,
            max_pending_samples: max_pending,
            auto_check_interval_ms: 60_000,
        }
    }

    fn sample(id: &str) -> BufferedTrajectory {
        BufferedTrajectory {
            id: id.to_string(),
            embedding: vec![0.1, 0.2],
            enhanced_embedding: None,
            quality: 0.8,
        }
    }

    struct StubTrainer {
        calls: AtomicUsize,
        loss: f32,
    }

    impl TrainerHandle for StubTrainer {
        fn run_training(&self, dataset: &TrainingDataset) -> Result<TrainingOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TrainingOutcome {
                loss: self.loss,
                samples_count: dataset.trajectories.len(),
                reason: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn should_not_trigger_below_threshold() {
        let tmp = TempDir::new().unwrap();
        let trigger = TrainingTrigger::new(config(&tmp, 5, 100, 0)).unwrap();
        trigger.add_trajectory(sample("a")).await.unwrap();
        assert!(!trigger.should_trigger().await);
    }

    #[tokio::test]
    async fn triggers_once_threshold_reached() {
        let tmp = TempDir::new().unwrap();
        let trigger = TrainingTrigger::new(config(&tmp, 2, 100, 0)).unwrap();
        trigger.add_trajectory(sample("a")).await.unwrap();
        trigger.add_trajectory(sample("b")).await.unwrap();
        assert!(trigger.should_trigger().await);
    }

    #[tokio::test]
    async fn check_and_train_clears_buffer_on_success() {
        let tmp = TempDir::new().unwrap();
        let trigger = TrainingTrigger::new(config(&tmp, 2, 100, 0)).unwrap();
        trigger.add_trajectory(sample("a")).await.unwrap();
        trigger.add_trajectory(sample("b")).await.unwrap();
        let trainer = StubTrainer {
            calls: AtomicUsize::new(0),
            loss: 0.4,
        };
        let outcome = trigger.check_and_train(&trainer).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Executed(_)));
        assert_eq!(trigger.buffer_len().await, 0);
        assert_eq!(trigger.last_training_loss().await, Some(0.4));
    }

    #[tokio::test]
    async fn check_and_train_refuses_below_threshold_with_reason() {
        let tmp = TempDir::new().unwrap();
        let trigger = TrainingTrigger::new(config(&tmp, 5, 100, 0)).unwrap();
        trigger.add_trajectory(sample("a")).await.unwrap();
        let trainer = StubTrainer {
            calls: AtomicUsize::new(0),
            loss: 0.1,
        };
        let outcome = trigger.check_and_train(&trainer).await.unwrap();
        match outcome {
            TriggerOutcome::Refused(reason) => assert!(reason.contains("threshold")),
            TriggerOutcome::Executed(_) => panic!("expected refusal"),
        }
    }

    #[tokio::test]
    async fn add_trajectory_signals_force_at_max_pending() {
        let tmp = TempDir::new().unwrap();
        let trigger = TrainingTrigger::new(config(&tmp, 100, 2, 0)).unwrap();
        assert!(!trigger.add_trajectory(sample("a")).await.unwrap());
        assert!(trigger.add_trajectory(sample("b")).await.unwrap());
    }

    #[tokio::test]
    async fn add_trajectory_rejects_invalid_quality() {
        let tmp = TempDir::new().unwrap();
        let trigger = TrainingTrigger::new(config(&tmp, 5, 100, 0)).unwrap();
        let mut bad = sample("a");
        bad.quality = f32::NAN;
        assert!(trigger.add_trajectory(bad).await.is_err());
    }

    #[tokio::test]
    async fn buffer_persists_and_reloads_across_instances() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, 5, 100, 0);
        {
            let trigger = TrainingTrigger::new(cfg.clone()).unwrap();
            trigger.add_trajectory(sample("a")).await.unwrap();
        }
        let reloaded = TrainingTrigger::new(cfg).unwrap();
        assert_eq!(reloaded.buffer_len().await, 1);
    }
}
