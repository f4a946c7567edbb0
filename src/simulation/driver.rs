//! Simulation lifecycle: model validation, per-worker state allocation, the
//! worker pool and cancellation. Workers run identical transport loops on
//! their own particle and thread state; the driver only touches shared
//! state between step batches.

use crate::counters::{new_simu_state, GlobalHitBuffer, GlobalState, HitBuffer};
use crate::intersect::build_oracles;
use crate::model::Model;
use crate::rng::{generate_seed, FIXED_SEED_BASE};
use crate::simulation::particle::Particle;
use crate::SimulationError;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cap on the sanity-check error log, matching the historical report size.
const ERROR_LOG_CAP: usize = 1920;

/// Merge attempts before a reduction timeout is escalated to the caller.
const MERGE_RETRIES: u32 = 4;

/// Base backoff between merge attempts; grows linearly per retry.
const MERGE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub enum SeedMode {
    /// Fresh entropy per worker.
    Random,
    /// `42424242 + worker id`, for reproducibility tests.
    Fixed,
    /// User-supplied base seed, worker `k` gets `base ^ k`.
    Base(u64),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub total_desorbed: u64,
    pub cancelled: bool,
}

/// Validate a model before it is frozen for a run. Returns the error count
/// and, when nonzero, an aggregated log. Untextured facets carrying texture
/// counter flags are silently corrected (cleared) with one warning each;
/// `strict` promotes those corrections to errors.
pub fn sanity_check_model(model: &mut Model, strict: bool) -> (usize, Option<String>) {
    let mut error_log = String::from("[Error Log on Check]\n");
    let mut errors_on_check = 0usize;
    let mut append = |log: &mut String, line: String| {
        if log.len() < ERROR_LOG_CAP {
            log.push_str(&line);
            log.truncate(ERROR_LOG_CAP);
        }
    };

    if !model.initialized {
        append(&mut error_log, "Model not initialized\n".into());
        errors_on_check += 1;
    }
    if model.vertices.is_empty() {
        append(&mut error_log, "Loaded empty vertex list\n".into());
        errors_on_check += 1;
    }
    if model.facets.is_empty() {
        append(&mut error_log, "Loaded empty facet list\n".into());
        errors_on_check += 1;
    }
    for (index, facet) in model.facets.iter().enumerate() {
        if facet.global_id != index {
            append(
                &mut error_log,
                format!(
                    "Facet arena not properly initialized, id mismatch: {} / {}\n",
                    facet.global_id, index
                ),
            );
            errors_on_check += 1;
        }
    }
    for facet in model.facets.iter_mut() {
        if !facet.is_textured && facet.tex_width * facet.tex_height > 0 {
            append(
                &mut error_log,
                format!("[Fac #{}] Untextured facet with texture size\n", facet.global_id),
            );
            errors_on_check += 1;
        } else if !facet.is_textured && !facet.count_flags.is_empty() {
            facet.count_flags = Default::default();
            warn!(
                "facet #{}: texture counters on an untextured facet, flags cleared",
                facet.global_id
            );
            append(
                &mut error_log,
                format!(
                    "[Fac #{}] Untextured facet with texture counters\n",
                    facet.global_id
                ),
            );
            if strict {
                errors_on_check += 1;
            }
        }
    }
    if model.wp.enable_decay && model.wp.half_life <= 0.0 {
        append(
            &mut error_log,
            format!(
                "Particle decay is set, but half life was not set [= {:e}]\n",
                model.wp.half_life
            ),
        );
        errors_on_check += 1;
    }

    if errors_on_check > 0 {
        (errors_on_check, Some(error_log))
    } else {
        (errors_on_check, None)
    }
}

pub struct Simulation {
    model: Arc<Model>,
    oracles: Arc<Vec<crate::intersect::LinearOracle>>,
    pub global_state: Arc<GlobalState>,
    pub particles: Vec<Particle>,
    pub total_desorbed: u64,
}

impl Simulation {
    /// Validate the model, freeze it and build the per-structure oracles and
    /// the global state. Refuses invalid models with the aggregated log.
    pub fn new(mut model: Model) -> Result<Self, SimulationError> {
        let (errors, log) = sanity_check_model(&mut model, false);
        if errors > 0 {
            return Err(SimulationError::Validation {
                count: errors,
                log: log.unwrap_or_default(),
            });
        }
        let model = Arc::new(model);
        let oracles = Arc::new(build_oracles(&model));
        let global_state = Arc::new(GlobalState::new(new_simu_state(&model)));
        Ok(Simulation {
            model,
            oracles,
            global_state,
            particles: Vec::new(),
            total_desorbed: 0,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Build `n` workers with their generators seeded per `seed_mode`.
    pub fn set_n_particles(&mut self, n: usize, seed_mode: SeedMode) {
        self.particles.clear();
        for particle_id in 0..n {
            let seed = match seed_mode {
                SeedMode::Random => generate_seed(particle_id),
                SeedMode::Fixed => FIXED_SEED_BASE + particle_id as u64,
                SeedMode::Base(base) => base ^ particle_id as u64,
            };
            self.particles.push(Particle::new(
                particle_id,
                seed,
                Arc::clone(&self.model),
                Arc::clone(&self.oracles),
            ));
        }
    }

    /// Allocate every worker's observable buffers and scratch to the model
    /// dimensions and report the snapshot sizes.
    pub fn load_simulation(&mut self) {
        let start = Instant::now();
        let nb_process = self.particles.len().max(1);
        let log_capacity = if self.model.otf.enable_logging {
            self.model.otf.log_limit / nb_process
        } else {
            0
        };
        for particle in self.particles.iter_mut() {
            particle.log_capacity = log_capacity;
            particle.allocate();
        }

        info!("  Load {} successful", self.model.name);
        info!(
            "  Geometry: {} vertex {} facets",
            self.model.vertices.len(),
            self.model.facets.len()
        );
        info!("  Number of structures: {}", self.model.structures.len());
        info!("  Global Hit: {} bytes", std::mem::size_of::<GlobalHitBuffer>());
        info!(
            "  Facet Hit : {} bytes",
            self.model.facets.len() * std::mem::size_of::<HitBuffer>()
        );
        info!("  Total     : {} bytes", self.get_hits_size());
        for particle in &self.particles {
            info!(
                "  Seed for {:2}: {}",
                particle.particle_id,
                particle.rng.seed()
            );
        }
        info!("  Loading time: {:.3} ms", start.elapsed().as_secs_f64() * 1e3);
    }

    /// Rebuild the intersection oracles while the global state is held, so
    /// no worker can observe a half-built structure.
    pub fn rebuild_accel_structure(&mut self) {
        let _guard = self.global_state.state.lock();
        let start = Instant::now();
        self.oracles = Arc::new(build_oracles(&self.model));
        for particle in self.particles.iter_mut() {
            particle.rebind(Arc::clone(&self.model), Arc::clone(&self.oracles));
        }
        info!(
            "Rebuilt acceleration structure in {:.3} ms",
            start.elapsed().as_secs_f64() * 1e3
        );
    }

    /// Zero all worker observables; the global state is left untouched.
    pub fn reset_simulation(&mut self) {
        for particle in self.particles.iter_mut() {
            particle.reset();
        }
        self.total_desorbed = 0;
    }

    /// Re-clear worker scratch and accumulators after a model rebind.
    pub fn clear_simulation(&mut self) {
        for particle in self.particles.iter_mut() {
            particle.allocate();
            particle.total_desorbed = 0;
        }
        self.total_desorbed = 0;
    }

    /// Analytic size of one global snapshot, for transport to external
    /// consumers.
    pub fn get_hits_size(&self) -> usize {
        std::mem::size_of::<GlobalHitBuffer>()
            + self.model.wp.global_histogram_params.data_size() * (1 + self.model.nb_moments())
            + self.model.facets.len()
                * std::mem::size_of::<HitBuffer>()
                * (1 + self.model.nb_moments())
    }

    /// Run every worker until its desorption budget is exhausted or `cancel`
    /// is raised. Each worker alternates `steps_per_batch` bounce events with
    /// one merge into the global state (retried with backoff on lock
    /// timeout). A persistent merge timeout aborts the run.
    pub fn run(
        &mut self,
        steps_per_batch: usize,
        cancel: &AtomicBool,
        merge_timeout: Duration,
    ) -> Result<RunSummary, SimulationError> {
        let desorption_limit = self.model.otf.desorption_limit;
        let nb_workers = self.particles.len().max(1) as u64;
        let per_worker_budget = if desorption_limit == 0 {
            u64::MAX
        } else {
            desorption_limit / nb_workers
        };

        let timed_out = AtomicBool::new(false);
        let global_state = Arc::clone(&self.global_state);

        rayon::scope(|scope| {
            for particle in self.particles.iter_mut() {
                let global = Arc::clone(&global_state);
                let timed_out = &timed_out;
                scope.spawn(move |_| loop {
                    if cancel.load(Ordering::Relaxed) || timed_out.load(Ordering::Relaxed) {
                        break;
                    }
                    let remaining = if per_worker_budget == u64::MAX {
                        u64::MAX
                    } else {
                        per_worker_budget.saturating_sub(particle.total_desorbed)
                    };
                    let keep_going = particle.simulation_mc_step(steps_per_batch, remaining);

                    let mut merged = false;
                    for attempt in 0..MERGE_RETRIES {
                        if particle.update_hits(&global, merge_timeout) {
                            merged = true;
                            break;
                        }
                        std::thread::sleep(MERGE_BACKOFF * (attempt + 1));
                    }
                    if !merged {
                        timed_out.store(true, Ordering::Relaxed);
                        break;
                    }
                    if !keep_going {
                        break;
                    }
                });
            }
        });

        self.total_desorbed = self.particles.iter().map(|p| p.total_desorbed).sum();
        if timed_out.load(Ordering::Relaxed) {
            return Err(SimulationError::ReductionTimeout);
        }
        Ok(RunSummary {
            total_desorbed: self.total_desorbed,
            cancelled: cancel.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{model_from_description, ModelDescription};

    fn small_model() -> Model {
        let description: ModelDescription = serde_json::from_str(
            r#"{
                "vertices": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]],
                "facets": [{"indices": [0,1,2,3], "desorb_type": "cosine", "outgassing": 1e-3}]
            }"#,
        )
        .unwrap();
        model_from_description(description).unwrap()
    }

    #[test]
    fn empty_model_is_refused() {
        let mut model = Model::default();
        let (errors, log) = sanity_check_model(&mut model, false);
        assert!(errors >= 2);
        assert!(log.unwrap().contains("empty"));
    }

    #[test]
    fn decay_without_half_life_is_an_error() {
        let mut model = small_model();
        model.wp.enable_decay = true;
        model.wp.half_life = 0.0;
        let (errors, log) = sanity_check_model(&mut model, false);
        assert_eq!(errors, 1);
        assert!(log.unwrap().contains("half life"));
    }

    #[test]
    fn untextured_counter_flags_are_cleared_silently() {
        let mut model = small_model();
        model.facets[0].count_flags |= crate::model::CountFlag::Reflect;
        let (errors, _) = sanity_check_model(&mut model, false);
        assert_eq!(errors, 0, "silent correction must not refuse the run");
        assert!(model.facets[0].count_flags.is_empty());
    }

    #[test]
    fn error_log_is_capped() {
        let mut model = Model::default();
        // hundreds of facets with bad ids would overflow an unbounded log
        let template = small_model().facets.remove(0);
        for _ in 0..500 {
            let mut facet = template.clone();
            facet.global_id = 9999;
            model.facets.push(facet);
        }
        let (_, log) = sanity_check_model(&mut model, false);
        assert!(log.unwrap().len() <= ERROR_LOG_CAP);
    }

    #[test]
    fn workers_get_distinct_fixed_seeds() {
        let mut simulation = Simulation::new(small_model()).unwrap();
        simulation.set_n_particles(3, SeedMode::Fixed);
        let seeds: Vec<u64> = simulation.particles.iter().map(|p| p.rng.seed()).collect();
        assert_eq!(seeds, vec![42424242, 42424243, 42424244]);
    }

    #[test]
    fn hits_size_scales_with_moments() {
        let mut model = small_model();
        let base = Simulation::new(model.clone()).unwrap().get_hits_size();
        model.td.moments = vec![crate::model::Moment { time: 0.05, window: 0.01 }];
        let with_moment = Simulation::new(model).unwrap().get_hits_size();
        assert!(with_moment > base);
    }
}
