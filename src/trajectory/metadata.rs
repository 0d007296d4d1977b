//! Trajectory metadata and the `index.json` sidecar (spec.md §3).

use serde::{Deserialize, Serialize};

/// Per-trajectory bookkeeping: where it lives (in memory or on disk) and
/// enough to locate/validate it without touching the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryMetadata {
    pub id: String,
    pub route: String,
    pub quality: f32,
    pub created_at: i64,
    /// `-1` while the trajectory is only in the memory window.
    pub file_index: i64,
    pub offset: usize,
    /// Serialized on-disk length as written at flush time (post-compression
    /// if applicable) — see SPEC_FULL.md open-question decision #2.
    pub size: usize,
    pub is_baseline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileSummary {
    pub file_index: u32,
    pub trajectory_count: usize,
    pub size_bytes: u64,
    pub oldest: i64,
    pub newest: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryIndex {
    pub version: u32,
    pub format_version: u32,
    pub total_trajectories: usize,
    pub data_files: Vec<DataFileSummary>,
    pub metadata: Vec<TrajectoryMetadata>,
    pub baseline_checkpoint_ids: Option<Vec<String>>,
}

impl Default for TrajectoryIndex {
    fn default() -> Self {
        Self {
            version: 1,
            format_version: 2,
            total_trajectories: 0,
            data_files: Vec::new(),
            metadata: Vec::new(),
            baseline_checkpoint_ids: None,
        }
    }
}
