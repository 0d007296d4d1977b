//! # agentdb-core
//!
//! A self-learning agent substrate: durable trajectory streams, a vector
//! pattern store, a graph neural network trained online via contrastive
//! loss with Elastic Weight Consolidation, and a capability-based task
//! router with a cold-start schedule.
//!
//! ## Components
//!
//! - **Trajectory stream** (`trajectory`): bounded in-memory window over a
//!   durable, versioned, checksummed on-disk log of task trajectories.
//! - **Weight manager** (`weights`): layer-keyed tensor storage with
//!   atomic checkpointed saves and NaN/Inf-guarded updates.
//! - **Pattern store** (`patterns`): reusable reasoning templates,
//!   retrieved by cosine-similarity ANN search.
//! - **GNN trainer** (`gnn`): contrastive triplet loss, backprop, online
//!   EWC, and Adam, wired into a batch/epoch training loop.
//! - **Training trigger** (`training_trigger`): buffers incoming
//!   trajectories and decides when enough evidence has accrued to train.
//! - **Routing** (`routing`): a content-addressed capability index cache
//!   plus the cold-start keyword/capability blend that selects an agent.
//!
//! All of the above sit on shared math/codec primitives (`primitives`),
//! process configuration (`config`), and a common error type (`error`).

pub mod config;
pub mod error;
pub mod gnn;
pub mod patterns;
pub mod primitives;
pub mod routing;
pub mod trajectory;
pub mod training_trigger;
pub mod weights;

pub use config::AgentDbConfig;
pub use error::{AgentDbError, Result};
pub use gnn::{ContrastiveLoss, EwcRegularizer, GnnLayer, GnnTrainer, Triplet, TripletBatchResult};
pub use patterns::{
    InMemoryEngine, KeyValueEngine, NewPatternParams, Pattern, PatternPatch, PatternStats, PatternStore,
};
pub use routing::{
    AgentCapability, CapabilityIndexCache, ConfirmationLevel, RoutingAlternative, RoutingAnalysis, RoutingEngine,
    RoutingFactor, RoutingResult,
};
pub use trajectory::{MigrateOptions, PruneFilter, RollbackState, Trajectory, TrajectoryStreamManager};
pub use training_trigger::{BufferedTrajectory, TrainerHandle, TrainingDataset, TrainingOutcome, TrainingTrigger, TriggerOutcome};
pub use weights::{InitParams, Initialization, WeightManager, WeightMetadata, WeightTensor};

/// Re-export of the most commonly used types, mirroring the module
/// layout above.
pub mod prelude {
    pub use crate::config::AgentDbConfig;
    pub use crate::error::{AgentDbError, Result};
    pub use crate::gnn::{ContrastiveLoss, EwcRegularizer, GnnLayer, GnnTrainer};
    pub use crate::patterns::{Pattern, PatternStore};
    pub use crate::routing::{CapabilityIndexCache, RoutingEngine};
    pub use crate::trajectory::TrajectoryStreamManager;
    pub use crate::training_trigger::TrainingTrigger;
    pub use crate::weights::WeightManager;
}
