//! Test-particle Monte Carlo transport for rarefied gas (molecular flow)
//! vacuum systems. Particles desorb from source facets, fly in straight
//! lines between planar polygonal facets, interact probabilistically with
//! surfaces (sticking, reflection, teleportation, decay) and leave their
//! statistics in per-worker accumulators that are periodically folded into
//! one shared global state.

pub mod anglemap;
pub mod counters;
pub mod intersect;
pub mod math;
pub mod mesher;
pub mod model;
pub mod rng;
pub mod sampling;
pub mod simulation;

pub use counters::GlobalState;
pub use simulation::{sanity_check_model, Particle, RunSummary, SeedMode, Simulation};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("geometry load failed: {0}")]
    Load(String),

    #[error("model validation failed with {count} error(s):\n{log}")]
    Validation { count: usize, log: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed model file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("reduction mutex timed out")]
    ReductionTimeout,

    #[error("runtime error: {0}")]
    Runtime(String),
}
