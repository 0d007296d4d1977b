//! Capability index cache (C11): a content-addressed cache of per-agent
//! capability embeddings, rebuilt whenever the agent definition corpus
//! changes.
//!
//! Grounded in `cache.rs`'s SHA-256 content-hash cache-validity idiom,
//! generalized from a single content hash per file to one hash over the
//! whole sorted corpus, plus the weight manager's atomic
//! `.tmp`-then-rename save protocol (`weights/mod.rs::atomic_save`).

use crate::config::CapabilityCacheConfig;
use crate::error::{AgentDbError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Produces an embedding vector for an agent's definition text. Kept as a
/// narrow trait so the cache never has to know how embeddings are
/// computed (LLM call, local model, or deterministic stub in tests).
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic fallback embedding provider used in tests and as a
/// last-resort default: seeds `Mulberry32` from a hash of the input text.
pub struct HashEmbeddingProvider {
    pub dim: usize,
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let seed = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let mut rng = crate::primitives::Mulberry32::new(seed);
        let mut raw: Vec<f32> = (0..self.dim).map(|_| rng.next_f32() * 2.0 - 1.0).collect();
        crate::primitives::l2_normalize(&mut raw);
        raw
    }
}

/// A single agent definition file on disk, read for corpus hashing.
#[derive(Debug, Clone)]
pub struct AgentDefinitionFile {
    pub path: String,
    pub content: String,
}

/// Parsed metadata extracted from an agent definition file, prior to
/// embedding.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub key: String,
    pub name: String,
    pub description: String,
    pub domains: Vec<String>,
    pub keywords: Vec<String>,
}

/// A cached agent capability entry, as persisted in `embeddings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub key: String,
    pub name: String,
    pub description: String,
    pub domains: Vec<String>,
    pub keywords: Vec<String>,
    pub embedding: Vec<f32>,
    pub success_rate: f32,
    pub task_count: u64,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingsFile {
    agents: Vec<AgentCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMetadata {
    cache_format_version: u32,
    agent_count: usize,
    built_at: i64,
}

/// Content-addressed cache of agent capability embeddings.
pub struct CapabilityIndexCache {
    config: CapabilityCacheConfig,
    agents: Vec<AgentCapability>,
}

impl CapabilityIndexCache {
    /// Loads the cache from disk if valid (rules V1-V7), otherwise
    /// returns `None` so the caller can `rebuild`.
    pub fn load(config: CapabilityCacheConfig, current_files: &[AgentDefinitionFile]) -> Option<Self> {
        let hash_path = config.cache_dir.join("hash.txt");
        let embeddings_path = config.cache_dir.join("embeddings.json");
        let metadata_path = config.cache_dir.join("metadata.json");

        // V1
        let stored_hash = fs::read_to_string(&hash_path).ok()?.trim().to_string();
        if stored_hash.is_empty() {
            return None;
        }
        // V2
        let current_hash = corpus_hash(current_files);
        if current_hash != stored_hash {
            tracing::debug!("capability cache miss: corpus hash changed");
            return None;
        }
        // V3
        let embeddings_raw = fs::read_to_string(&embeddings_path).ok()?;
        let embeddings: EmbeddingsFile = serde_json::from_str(&embeddings_raw).ok()?;
        // V4
        if embeddings.agents.iter().any(|a| a.embedding.len() != config.embedding_dim) {
            tracing::warn!("capability cache miss: embedding dimension mismatch");
            return None;
        }
        // V6
        let metadata_raw = fs::read_to_string(&metadata_path).ok()?;
        let metadata: CacheMetadata = serde_json::from_str(&metadata_raw).ok()?;
        // V5
        if metadata.agent_count != embeddings.agents.len() {
            tracing::warn!("capability cache miss: agent count mismatch");
            return None;
        }
        // V7
        if metadata.cache_format_version != config.cache_format_version {
            tracing::warn!("capability cache miss: format version mismatch");
            return None;
        }

        Some(Self {
            config,
            agents: embeddings.agents,
        })
    }

    /// Rebuilds the cache from scratch: embeds every agent definition
    /// file, then persists `hash.txt`, `embeddings.json`, `metadata.json`
    /// atomically.
    pub fn rebuild(
        config: CapabilityCacheConfig,
        files: &[AgentDefinitionFile],
        descriptors: &[AgentDescriptor],
        embedder: &dyn EmbeddingProvider,
        now: i64,
    ) -> Result<Self> {
        if descriptors.len() != files.len() {
            return Err(AgentDbError::validation("descriptor count must match file count"));
        }
        fs::create_dir_all(&config.cache_dir)?;
        clean_stale_tmp_files(&config.cache_dir)?;

        let agents: Vec<AgentCapability> = descriptors
            .iter()
            .map(|d| {
                let text = format!("{} {} {}", d.name, d.description, d.keywords.join(" "));
                AgentCapability {
                    key: d.key.clone(),
                    name: d.name.clone(),
                    description: d.description.clone(),
                    domains: d.domains.clone(),
                    keywords: d.keywords.clone(),
                    embedding: embedder.embed(&text),
                    success_rate: 0.0,
                    task_count: 0,
                    indexed_at: now,
                }
            })
            .collect();

        let hash = corpus_hash(files);
        atomic_write(&config.cache_dir, "hash.txt", hash.as_bytes())?;
        atomic_write(
            &config.cache_dir,
            "embeddings.json",
            &serde_json::to_vec_pretty(&EmbeddingsFile { agents: agents.clone() })?,
        )?;
        atomic_write(
            &config.cache_dir,
            "metadata.json",
            &serde_json::to_vec_pretty(&CacheMetadata {
                cache_format_version: config.cache_format_version,
                agent_count: agents.len(),
                built_at: now,
            })?,
        )?;

        Ok(Self { config, agents })
    }

    pub fn agents(&self) -> &[AgentCapability] {
        &self.agents
    }

    pub fn find(&self, key: &str) -> Option<&AgentCapability> {
        self.agents.iter().find(|a| a.key == key)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }
}

/// SHA-256 of the sorted-by-path concatenation of `(path, content)` pairs.
fn corpus_hash(files: &[AgentDefinitionFile]) -> String {
    let mut sorted: Vec<&AgentDefinitionFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.path.as_bytes());
        hasher.update(file.content.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn atomic_write(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let pid = std::process::id();
    let tmp = dir.join(format!("{name}.{pid}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

fn clean_stale_tmp_files(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".tmp") {
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!(file = %name, error = %e, "failed to clean stale capability cache tmp file");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> CapabilityCacheConfig {
        CapabilityCacheConfig {
            cache_dir: tmp.path().join("capability-cache"),
            agents_dir: tmp.path().join("agents"),
            embedding_dim: 8,
            cache_format_version: 1,
        }
    }

    fn sample_files() -> Vec<AgentDefinitionFile> {
        vec![
            AgentDefinitionFile {
                path: "agents/rust.md".to_string(),
                content: "Rust specialist".to_string(),
            },
            AgentDefinitionFile {
                path: "agents/docs.md".to_string(),
                content: "Documentation specialist".to_string(),
            },
        ]
    }

    fn sample_descriptors() -> Vec<AgentDescriptor> {
        vec![
            AgentDescriptor {
                key: "rust".to_string(),
                name: "Rust Agent".to_string(),
                description: "writes rust code".to_string(),
                domains: vec!["backend".to_string()],
                keywords: vec!["rust".to_string(), "cargo".to_string()],
            },
            AgentDescriptor {
                key: "docs".to_string(),
                name: "Docs Agent".to_string(),
                description: "writes documentation".to_string(),
                domains: vec!["docs".to_string()],
                keywords: vec!["markdown".to_string()],
            },
        ]
    }

    #[test]
    fn load_returns_none_when_no_cache_exists() {
        let tmp = TempDir::new().unwrap();
        assert!(CapabilityIndexCache::load(config(&tmp), &sample_files()).is_none());
    }

    #[test]
    fn rebuild_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let embedder = HashEmbeddingProvider { dim: 8 };
        let files = sample_files();
        let descriptors = sample_descriptors();
        CapabilityIndexCache::rebuild(config(&tmp), &files, &descriptors, &embedder, 1000).unwrap();

        let loaded = CapabilityIndexCache::load(config(&tmp), &files).unwrap();
        assert_eq!(loaded.agents().len(), 2);
        assert!(loaded.find("rust").is_some());
    }

    #[test]
    fn load_misses_when_corpus_content_changes() {
        let tmp = TempDir::new().unwrap();
        let embedder = HashEmbeddingProvider { dim: 8 };
        let mut files = sample_files();
        let descriptors = sample_descriptors();
        CapabilityIndexCache::rebuild(config(&tmp), &files, &descriptors, &embedder, 1000).unwrap();

        files[0].content = "Rust specialist, updated".to_string();
        assert!(CapabilityIndexCache::load(config(&tmp), &files).is_none());
    }

    #[test]
    fn rebuild_cleans_stale_tmp_files() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        fs::create_dir_all(&cfg.cache_dir).unwrap();
        fs::write(cfg.cache_dir.join("leftover.123.tmp"), b"stale").unwrap();

        let embedder = HashEmbeddingProvider { dim: 8 };
        CapabilityIndexCache::rebuild(config(&tmp), &sample_files(), &sample_descriptors(), &embedder, 1000).unwrap();

        assert!(!cfg.cache_dir.join("leftover.123.tmp").exists());
    }

    #[test]
    fn load_misses_on_embedding_dimension_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        let embedder = HashEmbeddingProvider { dim: 8 };
        CapabilityIndexCache::rebuild(cfg.clone(), &sample_files(), &sample_descriptors(), &embedder, 1000).unwrap();

        cfg.embedding_dim = 16;
        assert!(CapabilityIndexCache::load(cfg, &sample_files()).is_none());
    }
}
