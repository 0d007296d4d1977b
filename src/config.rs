//! Process-wide configuration.
//!
//! Assembled once at startup from environment variables (with `dotenvy`
//! loading a `.env` file first, same as the teacher's `Config::load`), then
//! passed by reference into every component. There is no global mutable
//! configuration singleton.

use std::path::{Path, PathBuf};

/// Root directory for all persisted state, default `.agentdb`.
fn default_root_dir() -> PathBuf {
    std::env::var("AGENTDB_ROOT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".agentdb"))
}

/// Top-level, immutable configuration for the whole substrate.
#[derive(Debug, Clone)]
pub struct AgentDbConfig {
    pub root_dir: PathBuf,
    pub trajectory: TrajectoryStoreConfig,
    pub weights: WeightManagerConfig,
    pub trainer: TrainerConfig,
    pub trigger: TrainingTriggerConfig,
    pub patterns: PatternStoreConfig,
    pub routing: RoutingConfig,
    pub capability_cache: CapabilityCacheConfig,
}

impl Default for AgentDbConfig {
    fn default() -> Self {
        let root_dir = default_root_dir();
        Self {
            trajectory: TrajectoryStoreConfig::default_under(&root_dir),
            weights: WeightManagerConfig::default_under(&root_dir),
            trainer: TrainerConfig::default(),
            trigger: TrainingTriggerConfig::default_under(&root_dir),
            patterns: PatternStoreConfig::default(),
            routing: RoutingConfig::default(),
            capability_cache: CapabilityCacheConfig::default_under(&root_dir),
            root_dir,
        }
    }
}

impl AgentDbConfig {
    /// Load from environment, falling back to defaults rooted at
    /// `AGENTDB_ROOT_DIR` (or `.agentdb`).
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::default()
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// §4.1 — trajectory stream manager.
#[derive(Debug, Clone)]
pub struct TrajectoryStoreConfig {
    pub data_dir: PathBuf,
    pub memory_window_size: usize,
    pub batch_write_size: usize,
    pub max_metadata_entries: usize,
    pub max_concurrent_queries: usize,
    pub format_version: u32,
    pub compress: bool,
    pub read_only: bool,
}

impl TrajectoryStoreConfig {
    fn default_under(root: &Path) -> Self {
        Self {
            data_dir: root.join("sona").join("trajectories"),
            memory_window_size: env_usize("AGENTDB_MEMORY_WINDOW_SIZE", 1000),
            batch_write_size: env_usize("AGENTDB_BATCH_WRITE_SIZE", 100),
            max_metadata_entries: env_usize("AGENTDB_MAX_METADATA_ENTRIES", 50_000),
            max_concurrent_queries: env_usize("AGENTDB_MAX_CONCURRENT_QUERIES", 8),
            format_version: 2,
            compress: false,
            read_only: false,
        }
    }
}

/// §4.2 — weight manager.
#[derive(Debug, Clone)]
pub struct WeightManagerConfig {
    pub weights_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub checkpoint_interval_updates: u64,
    pub max_checkpoints: usize,
    pub checkpoints_enabled: bool,
}

impl WeightManagerConfig {
    fn default_under(root: &Path) -> Self {
        Self {
            weights_dir: root.join("gnn").join("weights"),
            checkpoints_dir: root.join("gnn").join("checkpoints"),
            checkpoint_interval_updates: env_u64("AGENTDB_CHECKPOINT_INTERVAL", 100),
            max_checkpoints: env_usize("AGENTDB_MAX_CHECKPOINTS", 5),
            checkpoints_enabled: true,
        }
    }
}

/// §4.7 — trainer loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub max_epochs: usize,
    pub learning_rate: f32,
    pub validation_split: f32,
    pub min_improvement: f32,
    pub early_stopping_patience: usize,
    pub shuffle: bool,
    pub ewc_lambda: f32,
    pub max_gradient_norm: f32,
    /// §4.4 — quality at or above this is a contrastive "positive".
    pub positive_quality_threshold: f32,
    /// §4.4 — quality at or below this is a contrastive "negative".
    pub negative_quality_threshold: f32,
    /// §4.4 — triplet margin.
    pub triplet_margin: f32,
    /// §4.5 — online Fisher running-mean decay.
    pub ewc_fisher_alpha: f32,
    /// §4.6 — Adam hyperparameters.
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub adam_epsilon: f32,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_epochs: 50,
            learning_rate: 1e-3,
            validation_split: 0.1,
            min_improvement: 1e-4,
            early_stopping_patience: 5,
            shuffle: true,
            ewc_lambda: 0.4,
            max_gradient_norm: 5.0,
            positive_quality_threshold: 0.7,
            negative_quality_threshold: 0.3,
            triplet_margin: 0.2,
            ewc_fisher_alpha: 0.9,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
        }
    }
}

/// §4.8 — training trigger.
#[derive(Debug, Clone)]
pub struct TrainingTriggerConfig {
    pub buffer_path: PathBuf,
    pub min_samples: usize,
    pub cooldown_ms: u64,
    pub max_pending_samples: usize,
    pub auto_check_interval_ms: u64,
}

pub const COLD_START_THRESHOLD: usize = 50;

impl TrainingTriggerConfig {
    fn default_under(root: &Path) -> Self {
        Self {
            buffer_path: root.join("training").join("training_buffer.json"),
            min_samples: env_usize("AGENTDB_MIN_SAMPLES", COLD_START_THRESHOLD),
            cooldown_ms: env_u64("AGENTDB_COOLDOWN_MS", 5 * 60 * 1000),
            max_pending_samples: env_usize("AGENTDB_MAX_PENDING_SAMPLES", 500),
            auto_check_interval_ms: env_u64("AGENTDB_AUTO_CHECK_INTERVAL_MS", 60 * 1000),
        }
    }
}

/// §4.9 — pattern store.
#[derive(Debug, Clone)]
pub struct PatternStoreConfig {
    pub embedding_dim: usize,
    pub min_success_rate: f32,
    pub max_similarity: f32,
    pub storage_key: String,
}

impl Default for PatternStoreConfig {
    fn default() -> Self {
        Self {
            embedding_dim: env_usize("AGENTDB_EMBEDDING_DIM", 1536),
            min_success_rate: 0.8,
            max_similarity: 0.95,
            storage_key: "patterns".to_string(),
        }
    }
}

/// §4.10/4.12 — routing engine cold-start schedule.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub keyword_only_ceiling: usize,
    pub blended_ceiling: usize,
    pub cold_start_confidence_cap: f32,
    pub domain_match_weight: f32,
    pub max_alternatives: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            keyword_only_ceiling: 25,
            blended_ceiling: 100,
            cold_start_confidence_cap: 0.6,
            domain_match_weight: 0.05,
            max_alternatives: 3,
        }
    }
}

/// §4.10 — capability index cache.
#[derive(Debug, Clone)]
pub struct CapabilityCacheConfig {
    pub cache_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub embedding_dim: usize,
    pub cache_format_version: u32,
}

impl CapabilityCacheConfig {
    fn default_under(root: &Path) -> Self {
        Self {
            cache_dir: root.join("capability-cache"),
            agents_dir: PathBuf::from("agents"),
            embedding_dim: env_usize("AGENTDB_EMBEDDING_DIM", 1536),
            cache_format_version: 1,
        }
    }
}
