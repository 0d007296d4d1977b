//! Capability routing (C11, C12): a content-addressed cache of agent
//! capability embeddings, and the cold-start keyword/capability blend
//! that picks an agent for a task.

pub mod capability_cache;
pub mod engine;

pub use capability_cache::{AgentCapability, CapabilityIndexCache};
pub use engine::{ConfirmationLevel, RoutingAlternative, RoutingAnalysis, RoutingEngine, RoutingFactor, RoutingResult};
