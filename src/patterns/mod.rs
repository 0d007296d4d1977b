//! Pattern store (C4): UUID-keyed reusable-template records, one in-memory
//! index per task type, ANN-by-cosine-similarity retrieval, duplicate
//! suppression, and a durable JSON snapshot.
//!
//! Grounded in the teacher's `db/queue.rs` record/store shape and
//! `cache.rs`'s snapshot-to-a-single-blob persistence idiom — here the
//! blob lives behind a caller-provided key-value engine rather than a
//! fixed file, per spec.md §4.9.

use crate::config::PatternStoreConfig;
use crate::error::{AgentDbError, Result};
use crate::primitives::cosine_similarity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A reusable reasoning pattern with its retrieval embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub task_type: String,
    pub template: String,
    pub embedding: Vec<f32>,
    pub success_rate: f32,
    pub sona_weight: f32,
    pub usage_count: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: Option<serde_json::Value>,
}

/// Parameters accepted by `add`.
pub struct NewPatternParams {
    pub task_type: String,
    pub template: String,
    pub embedding: Vec<f32>,
    pub success_rate: f32,
    pub metadata: Option<serde_json::Value>,
}

/// A partial update accepted by `update`.
#[derive(Debug, Clone, Default)]
pub struct PatternPatch {
    pub task_type: Option<String>,
    pub template: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub success_rate: Option<f32>,
    pub sona_weight: Option<f32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatternStats {
    pub counts_by_type: HashMap<String, usize>,
    pub average_success_rate: f32,
    pub highest_success_rate: f32,
    pub high_quality_count: usize,
    pub low_quality_count: usize,
    pub most_used_id: Option<String>,
    pub estimated_bytes: usize,
}

/// A byte-addressed key-value engine the caller owns; the pattern store
/// persists a single JSON blob under `storage_key` within it.
pub trait KeyValueEngine: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// In-memory engine for tests and simple embedders.
#[derive(Default)]
pub struct InMemoryEngine {
    data: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
}

impl KeyValueEngine for InMemoryEngine {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }
}

impl<T: KeyValueEngine> KeyValueEngine for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        (**self).set(key, value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Snapshot {
    patterns: Vec<Pattern>,
}

pub struct PatternStore<E: KeyValueEngine> {
    config: PatternStoreConfig,
    engine: E,
    patterns: parking_lot::RwLock<HashMap<String, Pattern>>,
    by_task_type: parking_lot::RwLock<HashMap<String, Vec<String>>>,
}

fn retry<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut last_err = None;
    for n in 0..MAX_ATTEMPTS {
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(std::time::Duration::from_millis(10 * (n as u64 + 1)));
            }
        }
    }
    Err(last_err.unwrap())
}

impl<E: KeyValueEngine> PatternStore<E> {
    pub fn new(config: PatternStoreConfig, engine: E) -> Result<Self> {
        let store = Self {
            config,
            engine,
            patterns: parking_lot::RwLock::new(HashMap::new()),
            by_task_type: parking_lot::RwLock::new(HashMap::new()),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let Some(bytes) = self.engine.get(&self.config.storage_key)? else {
            return Ok(());
        };
        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse pattern snapshot, starting empty");
                return Ok(());
            }
        };
        let mut patterns = self.patterns.write();
        let mut by_type = self.by_task_type.write();
        for p in snapshot.patterns {
            by_type.entry(p.task_type.clone()).or_default().push(p.id.clone());
            patterns.insert(p.id.clone(), p);
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let snapshot = Snapshot {
            patterns: self.patterns.read().values().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        retry(|| self.engine.set(&self.config.storage_key, bytes.clone()))
    }

    /// Inserts a new pattern. Rejects a success rate below the minimum
    /// threshold, a dimension mismatch, and any pattern whose embedding is
    /// too similar (cosine > `max_similarity`) to an existing pattern of
    /// the same task type.
    pub fn add(&self, params: NewPatternParams) -> Result<Pattern> {
        if params.success_rate < self.config.min_success_rate {
            return Err(AgentDbError::validation(format!(
                "success rate {} is below minimum threshold {}",
                params.success_rate, self.config.min_success_rate
            )));
        }
        if params.embedding.len() != self.config.embedding_dim {
            return Err(AgentDbError::validation(format!(
                "embedding dimension {} does not match configured {}",
                params.embedding.len(),
                self.config.embedding_dim
            )));
        }

        {
            let patterns = self.patterns.read();
            let by_type = self.by_task_type.read();
            if let Some(ids) = by_type.get(&params.task_type) {
                for id in ids {
                    if let Some(existing) = patterns.get(id) {
                        if cosine_similarity(&existing.embedding, &params.embedding)
                            > self.config.max_similarity
                        {
                            return Err(AgentDbError::validation(format!(
                                "pattern too similar to existing pattern {id} (cosine > {})",
                                self.config.max_similarity
                            )));
                        }
                    }
                }
            }
        }

        let now = now_ms();
        let pattern = Pattern {
            id: Uuid::new_v4().to_string(),
            task_type: params.task_type.clone(),
            template: params.template,
            embedding: params.embedding,
            success_rate: params.success_rate,
            sona_weight: 1.0,
            usage_count: 0,
            created_at: now,
            updated_at: now,
            metadata: params.metadata,
        };

        self.patterns.write().insert(pattern.id.clone(), pattern.clone());
        self.by_task_type
            .write()
            .entry(params.task_type)
            .or_default()
            .push(pattern.id.clone());
        self.persist()?;
        Ok(pattern)
    }

    pub fn get(&self, id: &str) -> Option<Pattern> {
        self.patterns.read().get(id).cloned()
    }

    pub fn by_task_type(&self, task_type: &str) -> Vec<Pattern> {
        let patterns = self.patterns.read();
        self.by_task_type
            .read()
            .get(task_type)
            .map(|ids| ids.iter().filter_map(|id| patterns.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Pattern> {
        self.patterns.read().values().cloned().collect()
    }

    /// Approximate nearest-neighbor search by cosine similarity within an
    /// optional task type, returning the `top_k` closest patterns.
    pub fn search(&self, query_embedding: &[f32], task_type: Option<&str>, top_k: usize) -> Vec<(Pattern, f32)> {
        let candidates: Vec<Pattern> = match task_type {
            Some(t) => self.by_task_type(t),
            None => self.all(),
        };
        let mut scored: Vec<(Pattern, f32)> = candidates
            .into_iter()
            .map(|p| {
                let score = cosine_similarity(query_embedding, &p.embedding);
                (p, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    pub fn update(&self, id: &str, patch: PatternPatch) -> Result<Pattern> {
        let mut patterns = self.patterns.write();
        let pattern = patterns
            .get_mut(id)
            .ok_or_else(|| AgentDbError::not_found(format!("pattern {id}")))?;

        if let Some(embedding) = &patch.embedding {
            if embedding.len() != self.config.embedding_dim {
                return Err(AgentDbError::validation(format!(
                    "embedding dimension {} does not match configured {}",
                    embedding.len(),
                    self.config.embedding_dim
                )));
            }
        }
        if let Some(rate) = patch.success_rate {
            if rate < self.config.min_success_rate {
                return Err(AgentDbError::validation(format!(
                    "success rate {rate} is below minimum threshold {}",
                    self.config.min_success_rate
                )));
            }
        }

        let old_task_type = pattern.task_type.clone();
        if let Some(t) = patch.task_type {
            pattern.task_type = t;
        }
        if let Some(t) = patch.template {
            pattern.template = t;
        }
        if let Some(e) = patch.embedding {
            pattern.embedding = e;
        }
        if let Some(r) = patch.success_rate {
            pattern.success_rate = r;
        }
        if let Some(w) = patch.sona_weight {
            pattern.sona_weight = w;
        }
        if let Some(m) = patch.metadata {
            pattern.metadata = Some(m);
        }
        pattern.updated_at = now_ms();
        let new_task_type = pattern.task_type.clone();
        let updated = pattern.clone();
        drop(patterns);

        if old_task_type != new_task_type {
            let mut by_type = self.by_task_type.write();
            if let Some(ids) = by_type.get_mut(&old_task_type) {
                ids.retain(|i| i != id);
            }
            by_type.entry(new_task_type).or_default().push(id.to_string());
        }

        self.persist()?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self.patterns.write().remove(id);
        if let Some(p) = removed {
            if let Some(ids) = self.by_task_type.write().get_mut(&p.task_type) {
                ids.retain(|i| i != id);
            }
            self.persist()?;
            Ok(())
        } else {
            Err(AgentDbError::not_found(format!("pattern {id}")))
        }
    }

    pub fn record_usage(&self, id: &str) -> Result<()> {
        let mut patterns = self.patterns.write();
        let pattern = patterns
            .get_mut(id)
            .ok_or_else(|| AgentDbError::not_found(format!("pattern {id}")))?;
        pattern.usage_count += 1;
        drop(patterns);
        self.persist()
    }

    pub fn stats(&self) -> PatternStats {
        let patterns = self.patterns.read();
        let mut counts_by_type = HashMap::new();
        let mut total_rate = 0.0f32;
        let mut highest = 0.0f32;
        let mut high_quality = 0;
        let mut low_quality = 0;
        let mut most_used: Option<&Pattern> = None;
        let mut estimated_bytes = 0usize;

        for p in patterns.values() {
            *counts_by_type.entry(p.task_type.clone()).or_insert(0) += 1;
            total_rate += p.success_rate;
            highest = highest.max(p.success_rate);
            if p.success_rate >= 0.9 {
                high_quality += 1;
            }
            if p.success_rate < 0.8 {
                low_quality += 1;
            }
            if most_used.map(|m| p.usage_count > m.usage_count).unwrap_or(true) {
                most_used = Some(p);
            }
            estimated_bytes += p.template.len() + p.embedding.len() * 4 + 128;
        }

        let count = patterns.len();
        PatternStats {
            counts_by_type,
            average_success_rate: if count == 0 { 0.0 } else { total_rate / count as f32 },
            highest_success_rate: highest,
            high_quality_count: high_quality,
            low_quality_count: low_quality,
            most_used_id: most_used.map(|p| p.id.clone()),
            estimated_bytes,
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PatternStore<InMemoryEngine> {
        let cfg = PatternStoreConfig {
            embedding_dim: 4,
            min_success_rate: 0.8,
            max_similarity: 0.95,
            storage_key: "patterns".to_string(),
        };
        PatternStore::new(cfg, InMemoryEngine::default()).unwrap()
    }

    fn embedding(bias: f32) -> Vec<f32> {
        vec![1.0 + bias, 0.1, 0.0, 0.0]
    }

    #[test]
    fn s1_quality_routing_scenario() {
        let store = store();
        store
            .add(NewPatternParams {
                task_type: "T".to_string(),
                template: "a".to_string(),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                success_rate: 0.82,
                metadata: None,
            })
            .unwrap();
        store
            .add(NewPatternParams {
                task_type: "T".to_string(),
                template: "b".to_string(),
                embedding: vec![0.0, 1.0, 0.0, 0.0],
                success_rate: 0.91,
                metadata: None,
            })
            .unwrap();
        store
            .add(NewPatternParams {
                task_type: "T".to_string(),
                template: "c".to_string(),
                embedding: vec![0.0, 0.0, 1.0, 0.0],
                success_rate: 0.99,
                metadata: None,
            })
            .unwrap();

        assert_eq!(store.by_task_type("T").len(), 3);
        assert!((store.stats().highest_success_rate - 0.99).abs() < 1e-6);

        let rejected = store.add(NewPatternParams {
            task_type: "T".to_string(),
            template: "d".to_string(),
            embedding: vec![0.0, 0.0, 0.0, 1.0],
            success_rate: 0.75,
            metadata: None,
        });
        assert!(rejected.is_err());
    }

    #[test]
    fn duplicate_suppression_rejects_near_identical_embeddings() {
        let store = store();
        store
            .add(NewPatternParams {
                task_type: "T".to_string(),
                template: "a".to_string(),
                embedding: embedding(0.0),
                success_rate: 0.9,
                metadata: None,
            })
            .unwrap();
        let dup = store.add(NewPatternParams {
            task_type: "T".to_string(),
            template: "b".to_string(),
            embedding: embedding(0.001),
            success_rate: 0.9,
            metadata: None,
        });
        assert!(dup.is_err());
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let store = store();
        let res = store.add(NewPatternParams {
            task_type: "T".to_string(),
            template: "a".to_string(),
            embedding: vec![1.0, 0.0],
            success_rate: 0.9,
            metadata: None,
        });
        assert!(res.is_err());
    }

    #[test]
    fn update_moves_between_task_type_indexes() {
        let store = store();
        let p = store
            .add(NewPatternParams {
                task_type: "A".to_string(),
                template: "a".to_string(),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                success_rate: 0.9,
                metadata: None,
            })
            .unwrap();
        store
            .update(
                &p.id,
                PatternPatch {
                    task_type: Some("B".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.by_task_type("A").len(), 0);
        assert_eq!(store.by_task_type("B").len(), 1);
    }

    #[test]
    fn snapshot_persists_across_store_instances() {
        let engine = std::sync::Arc::new(InMemoryEngine::default());
        let cfg = PatternStoreConfig {
            embedding_dim: 4,
            min_success_rate: 0.8,
            max_similarity: 0.95,
            storage_key: "patterns".to_string(),
        };

        let added_id = {
            let store = PatternStore::new(cfg.clone(), engine.clone()).unwrap();
            let pattern = store
                .add(NewPatternParams {
                    task_type: "T".to_string(),
                    template: "a".to_string(),
                    embedding: vec![1.0, 0.0, 0.0, 0.0],
                    success_rate: 0.9,
                    metadata: None,
                })
                .unwrap();
            pattern.id
        };

        let reloaded = PatternStore::new(cfg, engine).unwrap();
        let pattern = reloaded.get(&added_id).expect("pattern should survive reload");
        assert_eq!(pattern.template, "a");
        assert_eq!(reloaded.by_task_type("T").len(), 1);
        assert_eq!(reloaded.by_task_type("T")[0].id, added_id);
    }
}
