mod driver;
mod particle;

pub use driver::{sanity_check_model, RunSummary, SeedMode, Simulation};
pub use particle::{Particle, ParticleLogEntry};
