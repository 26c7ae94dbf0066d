//! Core engine of the SHGAT procedural-memory layer
//!
//! Ranks reusable capabilities against a user intent with a learned
//! attention network over a hierarchical hypergraph of tools and
//! capabilities: hierarchy computation, multi-level incidence, multi-pass
//! message passing, K-head scoring, and an online back-propagation trainer.

pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod forward;
pub mod graph;
pub mod math;
pub mod params;
pub mod protocol;
pub mod replay;
pub mod scorer;
pub mod store;
pub mod trainer;

pub use config::{EngineConfig, TrainingConfig};
pub use engine::{SharedEngine, ShgatEngine};
pub use error::{Error, Result};
pub use graph::{Capability, GraphStore, Member, Tool};
pub use replay::{ReplayBuffer, TrainingExample};
pub use scorer::ScoreItem;
pub use trainer::TrainResult;
