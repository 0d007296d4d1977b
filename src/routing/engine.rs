//! Routing engine (C12): cold-start keyword/capability blend that picks
//! one agent per task, with an always-populated explanation.
//!
//! Grounded in `prompt_router.rs`'s scoring-then-explain shape, rebuilt
//! around the three-phase cold-start schedule and confidence-to-
//! confirmation-level mapping of spec.md §4.10.

use crate::config::RoutingConfig;
use crate::primitives::cosine_similarity;
use crate::routing::capability_cache::AgentCapability;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Input to a single routing decision.
#[derive(Debug, Clone)]
pub struct RoutingAnalysis {
    pub task: String,
    pub domain: Option<String>,
    pub complexity: Option<String>,
    pub primary_verb: Option<String>,
    pub verbs: Vec<String>,
    pub required_capabilities: Vec<String>,
    /// L2-normalized task embedding.
    pub embedding: Vec<f32>,
    pub is_multi_step: bool,
    pub preferred_agent: Option<String>,
}

/// Cold-start phase, derived from the total number of routes served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStartPhase {
    KeywordOnly,
    Blended,
    Learned,
}

impl ColdStartPhase {
    fn as_str(self) -> &'static str {
        match self {
            ColdStartPhase::KeywordOnly => "keyword-only",
            ColdStartPhase::Blended => "blended",
            ColdStartPhase::Learned => "learned",
        }
    }
}

/// A confidence-to-confirmation-level mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationLevel {
    Auto,
    Show,
    Confirm,
    Select,
}

impl ConfirmationLevel {
    fn as_str(self) -> &'static str {
        match self {
            ConfirmationLevel::Auto => "auto",
            ConfirmationLevel::Show => "show",
            ConfirmationLevel::Confirm => "confirm",
            ConfirmationLevel::Select => "select",
        }
    }

    fn from_confidence(c: f32) -> Self {
        if c >= 0.9 {
            ConfirmationLevel::Auto
        } else if c >= 0.7 {
            ConfirmationLevel::Show
        } else if c >= 0.5 {
            ConfirmationLevel::Confirm
        } else {
            ConfirmationLevel::Select
        }
    }
}

/// One scoring factor that contributed to the final confidence.
#[derive(Debug, Clone)]
pub struct RoutingFactor {
    pub name: String,
    pub score: f32,
    pub weight: f32,
    pub description: String,
}

/// A runner-up agent, with a human-readable reason for the score gap.
#[derive(Debug, Clone)]
pub struct RoutingAlternative {
    pub agent_key: String,
    pub score: f32,
    pub reason: String,
}

/// The outcome of `RoutingEngine::route`.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub selected_agent: String,
    pub confidence: f32,
    pub is_cold_start: bool,
    pub phase: &'static str,
    pub factors: Vec<RoutingFactor>,
    pub alternatives: Vec<RoutingAlternative>,
    pub explanation: String,
    pub confirmation_level: &'static str,
    pub requires_confirmation: bool,
    pub used_preference: bool,
    pub routing_id: String,
    pub routed_at: i64,
    pub routing_time_ms: u64,
}

struct Candidate {
    key: String,
    combined: f32,
    keyword: f32,
    capability: f32,
    domain: f32,
}

/// Selects one agent per task by blending keyword overlap with learned
/// capability-embedding similarity, following a cold-start schedule that
/// leans on keywords until enough executions have accrued.
pub struct RoutingEngine {
    config: RoutingConfig,
    execution_count: AtomicU64,
}

impl RoutingEngine {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            execution_count: AtomicU64::new(0),
        }
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::SeqCst)
    }

    fn phase_for(&self, n: u64) -> (ColdStartPhase, f32, f32) {
        if n <= self.config.keyword_only_ceiling as u64 {
            (ColdStartPhase::KeywordOnly, 1.0, 0.0)
        } else if n <= self.config.blended_ceiling as u64 {
            (ColdStartPhase::Blended, 0.7, 0.3)
        } else {
            (ColdStartPhase::Learned, 0.2, 0.8)
        }
    }

    /// Routes `analysis` to one of `candidates`, in under 150ms P95 when
    /// warm (no I/O, no network calls).
    pub fn route(
        &self,
        analysis: &RoutingAnalysis,
        candidates: &[AgentCapability],
        routing_id: String,
        now: i64,
    ) -> RoutingResult {
        let started = std::time::Instant::now();

        if let Some(preferred) = &analysis.preferred_agent {
            return RoutingResult {
                selected_agent: preferred.clone(),
                confidence: 1.0,
                is_cold_start: false,
                phase: "preference",
                factors: vec![RoutingFactor {
                    name: "user_preference".to_string(),
                    score: 1.0,
                    weight: 1.0,
                    description: "caller specified a preferred agent".to_string(),
                }],
                alternatives: Vec::new(),
                explanation: format!("Routed to {preferred} explicitly requested"),
                confirmation_level: "auto",
                requires_confirmation: false,
                used_preference: true,
                routing_id,
                routed_at: now,
                routing_time_ms: started.elapsed().as_millis() as u64,
            };
        }

        let n = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        let (phase, keyword_weight, capability_weight) = self.phase_for(n);
        let is_cold_start = n <= self.config.blended_ceiling as u64;

        let task_tokens = token_set(&analysis.task, &analysis.verbs, &analysis.primary_verb);

        let mut scored: Vec<Candidate> = candidates
            .iter()
            .map(|agent| {
                let keyword = keyword_score(&task_tokens, analysis.domain.as_deref(), agent);
                let capability = if agent.embedding.len() == analysis.embedding.len() && !analysis.embedding.is_empty() {
                    cosine_similarity(&analysis.embedding, &agent.embedding).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let domain_match = analysis
                    .domain
                    .as_ref()
                    .map(|d| agent.domains.iter().any(|ad| ad.eq_ignore_ascii_case(d)))
                    .unwrap_or(false);
                let domain = if domain_match { 1.0 } else { 0.0 };
                let combined = keyword_weight * keyword + capability_weight * capability + self.config.domain_match_weight * domain;
                Candidate {
                    key: agent.key.clone(),
                    combined,
                    keyword,
                    capability,
                    domain,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.combined.partial_cmp(&a.combined).unwrap_or(std::cmp::Ordering::Equal));

        let routing_time_ms = started.elapsed().as_millis() as u64;

        let Some(best) = scored.first() else {
            return RoutingResult {
                selected_agent: String::new(),
                confidence: 0.0,
                is_cold_start,
                phase: phase.as_str(),
                factors: Vec::new(),
                alternatives: Vec::new(),
                explanation: "no candidate agents available".to_string(),
                confirmation_level: "select",
                requires_confirmation: true,
                used_preference: false,
                routing_id,
                routed_at: now,
                routing_time_ms,
            };
        };

        let mut confidence = best.combined.clamp(0.0, 1.0);
        if is_cold_start {
            confidence = confidence.min(self.config.cold_start_confidence_cap);
        }

        let confirmation_level = ConfirmationLevel::from_confidence(confidence);

        let mut factors = vec![
            RoutingFactor {
                name: "keyword_score".to_string(),
                score: best.keyword,
                weight: keyword_weight,
                description: "verb and domain token overlap".to_string(),
            },
            RoutingFactor {
                name: "capability_match".to_string(),
                score: best.capability,
                weight: capability_weight,
                description: "cosine similarity to agent capability embedding".to_string(),
            },
        ];
        if best.domain > 0.0 {
            factors.push(RoutingFactor {
                name: "domain_match".to_string(),
                score: best.domain,
                weight: self.config.domain_match_weight,
                description: "declared domain intersects task domain".to_string(),
            });
        }

        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(best.key.clone());
        let alternatives = scored
            .iter()
            .skip(1)
            .filter(|c| seen.insert(c.key.clone()))
            .take(self.config.max_alternatives)
            .map(|c| RoutingAlternative {
                agent_key: c.key.clone(),
                score: c.combined,
                reason: format!("{:.0}% combined score", c.combined * 100.0),
            })
            .collect();

        let primary_factor = if best.capability >= best.keyword { "capability_match" } else { "keyword_score" };
        let mut explanation = format!(
            "Routed to {} with {:.0}% confidence, primary factor {}",
            best.key,
            confidence * 100.0,
            primary_factor
        );
        if is_cold_start {
            explanation.push_str(&format!(" (cold-start phase: {})", phase.as_str()));
        }

        RoutingResult {
            selected_agent: best.key.clone(),
            confidence,
            is_cold_start,
            phase: phase.as_str(),
            factors,
            alternatives,
            explanation,
            confirmation_level: confirmation_level.as_str(),
            requires_confirmation: confirmation_level != ConfirmationLevel::Auto,
            used_preference: false,
            routing_id,
            routed_at: now,
            routing_time_ms,
        }
    }
}

fn token_set(task: &str, verbs: &[String], primary_verb: &Option<String>) -> HashSet<String> {
    let mut tokens: HashSet<String> = task
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    tokens.extend(verbs.iter().map(|v| v.to_lowercase()));
    if let Some(v) = primary_verb {
        tokens.insert(v.to_lowercase());
    }
    tokens
}

fn keyword_score(task_tokens: &HashSet<String>, domain: Option<&str>, agent: &AgentCapability) -> f32 {
    let mut agent_tokens: HashSet<String> = agent.keywords.iter().map(|k| k.to_lowercase()).collect();
    agent_tokens.extend(agent.domains.iter().map(|d| d.to_lowercase()));
    if let Some(d) = domain {
        agent_tokens.insert(d.to_lowercase());
    }
    if agent_tokens.is_empty() {
        return 0.0;
    }
    let overlap = task_tokens.intersection(&agent_tokens).count();
    (overlap as f32 / agent_tokens.len() as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(key: &str, domains: &[&str], keywords: &[&str], embedding: Vec<f32>) -> AgentCapability {
        AgentCapability {
            key: key.to_string(),
            name: key.to_string(),
            description: String::new(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            embedding,
            success_rate: 0.0,
            task_count: 0,
            indexed_at: 0,
        }
    }

    fn analysis(task: &str, domain: Option<&str>, embedding: Vec<f32>) -> RoutingAnalysis {
        RoutingAnalysis {
            task: task.to_string(),
            domain: domain.map(|s| s.to_string()),
            complexity: None,
            primary_verb: None,
            verbs: Vec::new(),
            required_capabilities: Vec::new(),
            embedding,
            is_multi_step: false,
            preferred_agent: None,
        }
    }

    #[test]
    fn preference_bypass_short_circuits_scoring() {
        let engine = RoutingEngine::new(RoutingConfig::default());
        let mut a = analysis("refactor the parser", None, vec![]);
        a.preferred_agent = Some("rust-agent".to_string());
        let result = engine.route(&a, &[], "r1".to_string(), 1000);
        assert_eq!(result.selected_agent, "rust-agent");
        assert_eq!(result.confidence, 1.0);
        assert!(result.used_preference);
        assert_eq!(result.confirmation_level, "auto");
    }

    #[test]
    fn scenario_s4_cold_start_schedule_transitions() {
        let engine = RoutingEngine::new(RoutingConfig::default());
        let candidates = vec![agent("a", &[], &["rust"], vec![1.0, 0.0])];
        let a = analysis("write rust", None, vec![1.0, 0.0]);

        for i in 1..=25 {
            let r = engine.route(&a, &candidates, format!("r{i}"), 0);
            assert_eq!(r.phase, "keyword-only");
        }
        let r26 = engine.route(&a, &candidates, "r26".to_string(), 0);
        assert_eq!(r26.phase, "blended");

        for i in 27..=100 {
            engine.route(&a, &candidates, format!("r{i}"), 0);
        }
        let r101 = engine.route(&a, &candidates, "r101".to_string(), 0);
        assert_eq!(r101.phase, "learned");
        assert!(!r101.is_cold_start);
    }

    #[test]
    fn cold_start_invariant_caps_confidence_and_flags_cold_start() {
        let engine = RoutingEngine::new(RoutingConfig::default());
        let candidates = vec![agent("a", &["backend"], &["rust", "cargo"], vec![1.0, 0.0])];
        let a = analysis("rust cargo backend task", Some("backend"), vec![1.0, 0.0]);
        let result = engine.route(&a, &candidates, "r1".to_string(), 0);
        assert!(result.is_cold_start);
        assert!(result.confidence <= 0.6 + 1e-6);
    }

    #[test]
    fn explanation_and_factors_always_populated() {
        let engine = RoutingEngine::new(RoutingConfig::default());
        let candidates = vec![agent("a", &[], &["docs"], vec![0.0, 1.0])];
        let a = analysis("write some docs", None, vec![0.0, 1.0]);
        let result = engine.route(&a, &candidates, "r1".to_string(), 0);
        assert!(!result.explanation.is_empty());
        assert!(!result.factors.is_empty());
    }

    #[test]
    fn alternatives_limited_to_max_and_exclude_selected() {
        let mut config = RoutingConfig::default();
        config.max_alternatives = 2;
        let engine = RoutingEngine::new(config);
        let candidates = vec![
            agent("a", &[], &["rust"], vec![1.0, 0.0]),
            agent("b", &[], &["rust"], vec![0.9, 0.1]),
            agent("c", &[], &["rust"], vec![0.8, 0.2]),
            agent("d", &[], &["rust"], vec![0.7, 0.3]),
        ];
        let a = analysis("rust task", None, vec![1.0, 0.0]);
        let result = engine.route(&a, &candidates, "r1".to_string(), 0);
        assert!(result.alternatives.len() <= 2);
        assert!(result.alternatives.iter().all(|alt| alt.agent_key != result.selected_agent));
    }

    #[test]
    fn no_candidates_returns_select_confirmation() {
        let engine = RoutingEngine::new(RoutingConfig::default());
        let a = analysis("anything", None, vec![]);
        let result = engine.route(&a, &[], "r1".to_string(), 0);
        assert_eq!(result.confirmation_level, "select");
        assert!(result.requires_confirmation);
    }
}
