//! The GNN trainer subsystem (C5-C9): triplet mining + margin loss,
//! layered forward/backprop, online EWC, Adam, and the orchestrating
//! trainer loop.
//!
//! Grounded in `src/weights` for tensor storage/persistence and in
//! `research/worker.rs` for the bounded-concurrency orchestrator shape
//! that `trainer` generalizes into an epoch/batch scheduler.

pub mod contrastive;
pub mod ewc;
pub mod network;
pub mod optimizer;
pub mod trainer;

pub use contrastive::{ContrastiveLoss, Triplet, TripletBatchResult};
pub use ewc::EwcRegularizer;
pub use network::{GnnLayer, LayerActivations, LayerGradients};
pub use optimizer::AdamOptimizer;
pub use trainer::{GnnTrainer, TrainingRecord, TrainingSample};
