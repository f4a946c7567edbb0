//! The per-worker particle state machine: source sampling, transport,
//! surface interaction and observable recording, plus the reduction that
//! folds the worker's accumulator into the shared global state.
//!
//! Everything here is thread-local except `update_mc_hits`, which is the
//! only place a worker touches shared memory.

use crate::counters::{
    new_simu_state, GlobalState, HitEvent, HitEventKind, LeakEvent, SimuState, PROFILE_SIZE,
};
use crate::intersect::{FacetScratch, LinearOracle};
use crate::math::{cartesian_to_polar, cumulative_bin, polar_to_cartesian, Vec3};
use crate::model::{CountFlag, DesorbType, Facet, Model, ProfileType, Teleport};
use crate::rng::RandomGenerator;
use crate::sampling::{
    generate_velocity, mean_thermal_speed, BOLTZMANN, INV_LN2, WALL_MOMENT_CORRECTION,
    WALL_SPEED_SQ_FACTOR,
};
use cgmath::{InnerSpace, Vector3};
use log::error;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// Gas constant [J/mol/K] used by the sojourn-time Frenkel law.
const GAS_CONSTANT: f64 = 8.31;

/// Attempts at rejection-sampling a point inside a facet before falling back
/// to the cell or facet centre.
const MAX_PLACEMENT_TRIES: usize = 1000;

/// One row of the optional per-facet particle log.
#[derive(Debug, Clone, Copy)]
pub struct ParticleLogEntry {
    pub facet_hit_position: (f64, f64),
    pub hit_theta: f64,
    pub hit_phi: f64,
    pub ori_ratio: f64,
    pub particle_decay_moment: f64,
    pub time: f64,
    pub velocity: f64,
}

pub struct Particle {
    pub particle_id: usize,

    pub position: Vec3,
    pub direction: Vec3,
    /// Speed [m/s]; geometry distances are in cm.
    pub velocity: f64,
    pub particle_time: f64,
    pub generation_time: f64,
    pub expected_decay_moment: f64,
    /// Statistical weight, mutated only by low-flux splitting.
    pub ori_ratio: f64,
    pub nb_bounces: u64,
    pub distance_traveled: f64,
    pub structure_id: usize,
    pub teleported_from: Option<usize>,
    pub last_hit_facet: Option<usize>,
    /// Cache for the moment-window search; resets on respawn.
    pub last_moment_index: usize,

    pub scratch: Vec<FacetScratch>,
    pub transparent_hit_buffer: Vec<usize>,
    pub rng: RandomGenerator,
    pub tmp_state: SimuState,
    pub tmp_particle_log: Vec<ParticleLogEntry>,
    pub log_capacity: usize,
    /// Desorptions merged into the global state so far.
    pub total_desorbed: u64,

    model: Arc<Model>,
    oracles: Arc<Vec<LinearOracle>>,
}

impl Particle {
    pub fn new(
        particle_id: usize,
        seed: u64,
        model: Arc<Model>,
        oracles: Arc<Vec<LinearOracle>>,
    ) -> Self {
        Particle {
            particle_id,
            position: Vector3::new(0.0, 0.0, 0.0),
            direction: Vector3::new(0.0, 0.0, 0.0),
            velocity: 0.0,
            particle_time: 0.0,
            generation_time: 0.0,
            expected_decay_moment: 0.0,
            ori_ratio: 0.0,
            nb_bounces: 0,
            distance_traveled: 0.0,
            structure_id: 0,
            teleported_from: None,
            last_hit_facet: None,
            last_moment_index: 0,
            scratch: Vec::new(),
            transparent_hit_buffer: Vec::new(),
            rng: RandomGenerator::new(seed),
            tmp_state: SimuState::default(),
            tmp_particle_log: Vec::new(),
            log_capacity: 0,
            total_desorbed: 0,
            model,
            oracles,
        }
    }

    /// Size the scratch buffers and the thread-local accumulator to the
    /// bound model. Called at load and after a model rebind.
    pub fn allocate(&mut self) {
        let model = Arc::clone(&self.model);
        self.scratch = vec![FacetScratch::default(); model.facets.len()];
        self.tmp_state = new_simu_state(&model);
        self.tmp_particle_log.clear();
        if model.otf.enable_logging {
            self.tmp_particle_log.reserve(self.log_capacity);
        }
    }

    pub fn rebind(&mut self, model: Arc<Model>, oracles: Arc<Vec<LinearOracle>>) {
        self.model = model;
        self.oracles = oracles;
    }

    /// Full state reset; keeps the rng seed and the model binding.
    pub fn reset(&mut self) {
        self.position = Vector3::new(0.0, 0.0, 0.0);
        self.direction = Vector3::new(0.0, 0.0, 0.0);
        self.velocity = 0.0;
        self.particle_time = 0.0;
        self.generation_time = 0.0;
        self.expected_decay_moment = 0.0;
        self.ori_ratio = 0.0;
        self.nb_bounces = 0;
        self.distance_traveled = 0.0;
        self.structure_id = 0;
        self.teleported_from = None;
        self.last_hit_facet = None;
        self.last_moment_index = 0;
        self.transparent_hit_buffer.clear();
        self.tmp_particle_log.clear();
        self.total_desorbed = 0;
        self.tmp_state.reset();
        for s in self.scratch.iter_mut() {
            *s = FacetScratch::default();
        }
    }

    /// Run up to `nb_step` bounce events. Returns `false` when the worker's
    /// desorption budget is exhausted or no source is available; a particle
    /// that fits the budget is always transported to its terminal state
    /// before the budget check bites.
    pub fn simulation_mc_step(&mut self, nb_step: usize, mut remaining_des: u64) -> bool {
        let model = Arc::clone(&self.model);
        let model = model.as_ref();
        let oracles = Arc::clone(&self.oracles);

        // resume mid-flight unless the previous particle terminated
        let mut insert_new_particle = self.last_hit_facet.is_none();
        for _ in 0..nb_step {
            if insert_new_particle {
                if remaining_des == 0 || !self.start_from_source(model) {
                    return false;
                }
                insert_new_particle = false;
                remaining_des -= 1;
            }

            let hit = oracles[self.structure_id].trace(
                model,
                self.position,
                self.direction,
                self.particle_time,
                self.last_hit_facet,
                &mut self.rng,
                &mut self.scratch,
                &mut self.transparent_hit_buffer,
            );

            let Some((facet_id, d)) = hit else {
                // no intersection: leak
                self.tmp_state.global_hits.nb_leak_total += 1;
                self.record_leak_pos();
                insert_new_particle = true;
                self.last_hit_facet = None;
                continue;
            };

            // score the partial-opacity crossings of this segment
            let passes = std::mem::take(&mut self.transparent_hit_buffer);
            for &pass_id in &passes {
                self.register_transparent_pass(model, pass_id);
            }
            self.transparent_hit_buffer = passes;
            self.transparent_hit_buffer.clear();

            self.position += d * self.direction;
            let last_particle_time = self.particle_time;
            self.particle_time += d / 100.0 / self.velocity; // cm -> m

            let out_of_time =
                !model.wp.calc_constant_flow && self.particle_time > model.wp.latest_moment;
            let decayed =
                model.wp.enable_decay && self.expected_decay_moment < self.particle_time;
            if out_of_time || decayed {
                // flight ends mid-segment: charge the distance up to the
                // end of the measured period or the decay point
                let remainder_flight_path = self.velocity
                    * 100.0
                    * (model.wp.latest_moment - last_particle_time)
                        .min(self.expected_decay_moment - last_particle_time);
                self.tmp_state.global_hits.dist_traveled_total +=
                    remainder_flight_path * self.ori_ratio;
                self.record_hit(HitEventKind::Last);
                insert_new_particle = true;
                self.last_hit_facet = None;
                continue;
            }

            let facet = &model.facets[facet_id];
            self.increase_distance_counters(d * self.ori_ratio);
            if facet.teleport_dest != Teleport::None {
                self.perform_teleport(model, facet_id);
            } else {
                let sticking_probability = model.sticking_at(facet, self.particle_time);
                if !model.otf.low_flux_mode {
                    if sticking_probability == 1.0
                        || (sticking_probability > 0.0
                            && self.rng.rnd() < sticking_probability)
                    {
                        self.record_absorb(model, facet_id);
                        insert_new_particle = true;
                        self.last_hit_facet = None;
                    } else {
                        self.perform_bounce(model, facet_id);
                    }
                } else {
                    // weight splitting: score the sticking share, continue
                    // with the reflected share until it falls under the cutoff
                    if sticking_probability > 0.0 {
                        let ori_ratio_before = self.ori_ratio;
                        self.ori_ratio *= sticking_probability;
                        self.record_absorb(model, facet_id);
                        self.ori_ratio = ori_ratio_before * (1.0 - sticking_probability);
                    } else {
                        self.ori_ratio *= 1.0 - sticking_probability;
                    }
                    if self.ori_ratio > model.otf.low_flux_cutoff {
                        self.perform_bounce(model, facet_id);
                    } else {
                        insert_new_particle = true;
                        self.last_hit_facet = None;
                    }
                }
            }
        }
        true
    }

    fn increase_distance_counters(&mut self, distance_increment: f64) {
        self.tmp_state.global_hits.dist_traveled_total += distance_increment;
        self.tmp_state.global_hits.dist_traveled_full_hits_only += distance_increment;
        self.distance_traveled += distance_increment;
    }

    /// Launch a new ray from a source facet, sampled across the total
    /// outgassing. Returns `false` when no source exists or the chosen facet
    /// cannot desorb.
    fn start_from_source(&mut self, model: &Model) -> bool {
        let src_rnd = self.rng.rnd() * model.wp.total_desorbed_molecules;
        let mut sum_a = 0.0;
        let mut src_id = None;
        let mut found_in_map = false;
        let mut map_position_w = 0usize;
        let mut map_position_h = 0usize;

        for facet in &model.facets {
            if facet.desorb_type == DesorbType::None {
                continue;
            }
            let share = model.desorption_weight(facet);
            if share <= 0.0 {
                continue;
            }
            if src_rnd >= sum_a && src_rnd < sum_a + share {
                src_id = Some(facet.global_id);
                if let Some(map) = &facet.outgassing_map {
                    // locate the exact map cell with the leftover randomness
                    let remainder = (src_rnd - sum_a) / model.wp.latest_moment
                        * (BOLTZMANN * facet.temperature);
                    let cell = cumulative_bin(remainder, &map.cumulative);
                    map_position_h = cell / map.width;
                    map_position_w = cell - map_position_h * map.width;
                    found_in_map = true;
                }
                break;
            }
            sum_a += share;
        }

        let Some(src_id) = src_id else {
            error!("No starting point, aborting");
            return false;
        };
        let src = &model.facets[src_id];
        let reverse = if src.two_sided {
            self.rng.rnd() > 0.5
        } else {
            false
        };

        self.last_hit_facet = Some(src_id);
        self.particle_time = self.generate_desorption_time(model, src);
        self.generation_time = self.particle_time;
        self.last_moment_index = 0;
        self.velocity = if model.wp.use_maxwell_distribution {
            generate_velocity(&model.td.cdfs[src.cdf_id], self.rng.rnd())
        } else {
            mean_thermal_speed(src.temperature, model.wp.gas_mass)
        };
        self.ori_ratio = 1.0;
        self.expected_decay_moment = if model.wp.enable_decay {
            self.particle_time + model.wp.half_life * INV_LN2 * -self.rng.rnd().ln()
        } else {
            1e100
        };
        self.nb_bounces = 0;
        self.distance_traveled = 0.0;

        // choose a starting point inside the facet outline
        let mut placed = false;
        let mut nb_try = 0;
        while !placed && nb_try < MAX_PLACEMENT_TRIES {
            let (u, v) = if found_in_map {
                let map = src.outgassing_map.as_ref().unwrap();
                let u = if map_position_w < map.width - 1 {
                    (map_position_w as f64 + self.rng.rnd()) / map.width_d
                } else {
                    // last cell: keep the sample inside the facet extent
                    (map_position_w as f64
                        + self.rng.rnd() * (map.width_d - (map.width - 1) as f64))
                        / map.width_d
                };
                let v = if map_position_h < map.height - 1 {
                    (map_position_h as f64 + self.rng.rnd()) / map.height_d
                } else {
                    (map_position_h as f64
                        + self.rng.rnd() * (map.height_d - (map.height - 1) as f64))
                        / map.height_d
                };
                (u, v)
            } else {
                (self.rng.rnd(), self.rng.rnd())
            };
            if src.is_in_facet(u, v) {
                self.position = src.local_to_world(u, v);
                self.scratch[src_id].col_u = u;
                self.scratch[src_id].col_v = v;
                placed = true;
            }
            nb_try += 1;
        }
        if !placed {
            // rare: fall back to the map cell centre, else the facet centre
            if let Some(map) = &src.outgassing_map {
                let u = (map_position_w as f64 + 0.5) / map.width_d;
                let v = (map_position_h as f64 + 0.5) / map.height_d;
                self.position = src.local_to_world(u, v);
                self.scratch[src_id].col_u = u;
                self.scratch[src_id].col_v = v;
            } else {
                self.scratch[src_id].col_u = 0.5;
                self.scratch[src_id].col_v = 0.5;
                self.position = src.center;
            }
        }

        if src.is_moving && model.wp.motion_type != crate::model::MotionType::None {
            self.record_hit(HitEventKind::Moving);
        } else {
            self.record_hit(HitEventKind::Desorption);
        }

        self.direction = match src.desorb_type {
            DesorbType::Uniform => polar_to_cartesian(
                src.nu,
                src.nv,
                src.n,
                self.rng.rnd().acos(),
                self.rng.rnd() * 2.0 * PI,
                reverse,
            ),
            DesorbType::None | DesorbType::Cosine => polar_to_cartesian(
                src.nu,
                src.nv,
                src.n,
                self.rng.rnd().sqrt().acos(),
                self.rng.rnd() * 2.0 * PI,
                reverse,
            ),
            DesorbType::CosineN => polar_to_cartesian(
                src.nu,
                src.nv,
                src.n,
                self.rng.rnd().powf(1.0 / (src.desorb_type_n + 1.0)).acos(),
                self.rng.rnd() * 2.0 * PI,
                reverse,
            ),
            DesorbType::AngleMap => {
                let Some(sampler) = &src.anglemap else {
                    error!("Facet {} desorbs from an angle map but has none", src_id + 1);
                    return false;
                };
                let (theta, phi) = sampler.sample(&mut self.rng);
                // the map stores incident angles, emission mirrors them
                polar_to_cartesian(src.nu, src.nv, src.n, PI - theta, phi, false)
            }
        };

        let Some(super_idx) = src.super_idx else {
            error!(
                "Facet {} is in all structures, it shouldn't desorb.",
                src_id + 1
            );
            return false;
        };
        self.structure_id = super_idx;
        self.teleported_from = None;

        // one-shot absorbers re-arm with every new particle
        if model.has_volatile {
            for s in self.scratch.iter_mut() {
                s.volatile_ready = true;
            }
        }

        self.scratch[src_id].is_hit = true;
        self.tmp_state.global_hits.global_hits.nb_desorbed += 1;

        if src.is_moving {
            self.treat_moving_facet(model);
        }

        let ort_velocity = self.velocity * self.direction.dot(src.n).abs();
        self.increase_facet_counter(
            model,
            src_id,
            self.particle_time,
            0,
            1,
            0,
            2.0 / ort_velocity,
            maxwell_factor(model) * ort_velocity,
        );
        self.profile_facet(model, src_id, self.particle_time, false, 2.0, 1.0);
        self.log_hit(model, src_id);
        if src.count_flags.contains(CountFlag::Desorb) {
            self.record_hit_on_texture(model, src_id, self.particle_time, true, 2.0, 1.0);
        }

        true
    }

    fn generate_desorption_time(&mut self, model: &Model, src: &Facet) -> f64 {
        match src.id_id {
            Some(id) => {
                // time-dependent outgassing: invert the integrated curve
                let table = &model.td.ids[id];
                let last_y = table.last().map(|&(_, y)| y).unwrap_or(0.0);
                crate::math::interpolate_x(self.rng.rnd() * last_y, table, true)
            }
            None => self.rng.rnd() * model.wp.latest_moment,
        }
    }

    /// Reflect, pass through a link facet, or trigger a one-shot absorber.
    fn perform_bounce(&mut self, model: &Model, facet_id: usize) {
        let facet = &model.facets[facet_id];
        self.tmp_state.global_hits.global_hits.nb_mc_hit += 1;
        self.tmp_state.global_hits.global_hits.nb_hit_equiv += self.ori_ratio;

        // link facet: change structure, no direction change
        if let Some(dest_structure) = facet.super_dest {
            self.increase_facet_counter(model, facet_id, self.particle_time, 1, 0, 0, 0.0, 0.0);
            self.structure_id = dest_structure;
            if facet.is_moving {
                // link facets can act as transparent but moving surfaces
                self.record_hit(HitEventKind::Moving);
                self.treat_moving_facet(model);
            } else {
                self.record_hit(HitEventKind::Transparent);
            }
            self.log_hit(model, facet_id);
            self.profile_facet(model, facet_id, self.particle_time, true, 2.0, 2.0);
            if facet.anglemap_params.record {
                self.record_angle_map(model, facet_id);
            }
            if facet.count_flags.contains(CountFlag::Transparent) {
                self.record_hit_on_texture(model, facet_id, self.particle_time, true, 2.0, 2.0);
            }
            if facet.count_flags.contains(CountFlag::Direction) {
                self.record_direction_vector(model, facet_id, self.particle_time);
            }
            return;
        }

        // one-shot absorber
        if facet.is_volatile {
            if self.scratch[facet_id].volatile_ready {
                self.increase_facet_counter(model, facet_id, self.particle_time, 0, 0, 1, 0.0, 0.0);
                self.scratch[facet_id].volatile_ready = false;
                self.log_hit(model, facet_id);
                self.profile_facet(model, facet_id, self.particle_time, true, 2.0, 1.0);
                if facet.count_flags.contains(CountFlag::Absorb) {
                    self.record_hit_on_texture(model, facet_id, self.particle_time, true, 2.0, 1.0);
                }
                if facet.count_flags.contains(CountFlag::Direction) {
                    self.record_direction_vector(model, facet_id, self.particle_time);
                }
            }
            return;
        }

        // 2-sided facets may need the normal reverted for the back side
        let revert = facet.two_sided && self.direction.dot(facet.n) > 0.0;

        // incoming
        let ort_velocity = self.velocity * self.direction.dot(facet.n).abs();
        self.increase_facet_counter(
            model,
            facet_id,
            self.particle_time,
            1,
            0,
            0,
            1.0 / ort_velocity,
            maxwell_factor(model) * ort_velocity,
        );
        self.nb_bounces += 1;
        if facet.count_flags.contains(CountFlag::Reflect) {
            self.record_hit_on_texture(model, facet_id, self.particle_time, true, 1.0, 1.0);
        }
        if facet.count_flags.contains(CountFlag::Direction) {
            self.record_direction_vector(model, facet_id, self.particle_time);
        }
        self.log_hit(model, facet_id);
        self.profile_facet(model, facet_id, self.particle_time, true, 1.0, 1.0);
        if facet.anglemap_params.record {
            self.record_angle_map(model, facet_id);
        }

        self.update_velocity(model, facet);
        if facet.enable_sojourn_time {
            // Frenkel residence: tau = 1/(nu0*exp(-E/RT))
            let a = (-facet.sojourn_e / (GAS_CONSTANT * facet.temperature)).exp();
            self.particle_time += -self.rng.rnd().ln() / (a * facet.sojourn_freq);
        }

        if facet.reflection.diffuse_part > 0.999999 {
            // speedup branch for the common pure-diffuse case
            self.direction = polar_to_cartesian(
                facet.nu,
                facet.nv,
                facet.n,
                self.rng.rnd().sqrt().acos(),
                self.rng.rnd() * 2.0 * PI,
                revert,
            );
        } else {
            let refl_type_rnd = self.rng.rnd();
            if refl_type_rnd < facet.reflection.diffuse_part {
                self.direction = polar_to_cartesian(
                    facet.nu,
                    facet.nv,
                    facet.n,
                    self.rng.rnd().sqrt().acos(),
                    self.rng.rnd() * 2.0 * PI,
                    revert,
                );
            } else if refl_type_rnd
                < facet.reflection.diffuse_part + facet.reflection.specular_part
            {
                let (in_theta, in_phi) =
                    cartesian_to_polar(self.direction, facet.nu, facet.nv, facet.n);
                self.direction =
                    polar_to_cartesian(facet.nu, facet.nv, facet.n, PI - in_theta, in_phi, false);
            } else {
                self.direction = polar_to_cartesian(
                    facet.nu,
                    facet.nv,
                    facet.n,
                    self.rng
                        .rnd()
                        .powf(1.0 / (facet.reflection.cosine_exponent + 1.0))
                        .acos(),
                    self.rng.rnd() * 2.0 * PI,
                    revert,
                );
            }
        }

        if facet.is_moving {
            self.treat_moving_facet(model);
        }

        // outgoing
        let ort_velocity = self.velocity * self.direction.dot(facet.n).abs();
        self.increase_facet_counter(
            model,
            facet_id,
            self.particle_time,
            0,
            0,
            0,
            1.0 / ort_velocity,
            maxwell_factor(model) * ort_velocity,
        );
        if facet.count_flags.contains(CountFlag::Reflect) {
            // count again for the outward velocity
            self.record_hit_on_texture(model, facet_id, self.particle_time, false, 1.0, 1.0);
        }
        self.profile_facet(model, facet_id, self.particle_time, false, 1.0, 1.0);
        // no direction count on outgoing, no angle map either

        if facet.is_moving && model.wp.motion_type != crate::model::MotionType::None {
            self.record_hit(HitEventKind::Moving);
        } else {
            self.record_hit(HitEventKind::Reflection);
        }
        self.last_hit_facet = Some(facet_id);
    }

    /// Non-physical transport to a paired facet, preserving local (u,v) and
    /// incidence angles. Counted as a local hit but not a global one, so the
    /// mean free path stays meaningful.
    fn perform_teleport(&mut self, model: &Model, facet_id: usize) {
        let facet = &model.facets[facet_id];

        let dest_index = match facet.teleport_dest {
            Teleport::To(dest) => dest,
            Teleport::Back => match self.teleported_from {
                Some(from) => from,
                None => {
                    // nowhere to return to: soft failure, the ray goes on
                    self.record_hit(HitEventKind::Reflection);
                    self.last_hit_facet = Some(facet_id);
                    return;
                }
            },
            Teleport::None => return,
        };
        let Some(destination) = model.facets.get(dest_index) else {
            self.record_hit(HitEventKind::Reflection);
            self.last_hit_facet = Some(facet_id);
            return;
        };
        if let Some(super_idx) = destination.super_idx {
            // universal destinations leave the current structure unchanged
            self.structure_id = super_idx;
        }
        self.teleported_from = Some(facet_id);

        // the source facet counts this as a transparent pass
        self.record_hit(HitEventKind::TeleportSource);
        if facet.count_flags.contains(CountFlag::Transparent) {
            self.record_hit_on_texture(model, facet_id, self.particle_time, true, 2.0, 2.0);
        }
        if facet.count_flags.contains(CountFlag::Direction) {
            self.record_direction_vector(model, facet_id, self.particle_time);
        }
        self.profile_facet(model, facet_id, self.particle_time, true, 2.0, 2.0);
        self.log_hit(model, facet_id);
        if facet.anglemap_params.record {
            self.record_angle_map(model, facet_id);
        }

        // relaunch from the destination at the same local angles and position
        let (in_theta, in_phi) = cartesian_to_polar(self.direction, facet.nu, facet.nv, facet.n);
        self.direction = polar_to_cartesian(
            destination.nu,
            destination.nv,
            destination.n,
            in_theta,
            in_phi,
            false,
        );
        let u = self.scratch[facet_id].col_u;
        let v = self.scratch[facet_id].col_v;
        self.position = destination.local_to_world(u, v);
        self.record_hit(HitEventKind::TeleportDest);

        if !destination.is_in_facet(u, v) {
            // source and destination shapes differ; resample or accept a leak
            self.record_hit(HitEventKind::Absorption);
            let mut placed = false;
            let mut nb_try = 0;
            while !placed && nb_try < MAX_PLACEMENT_TRIES {
                let u = self.rng.rnd();
                let v = self.rng.rnd();
                if destination.is_in_facet(u, v) {
                    placed = true;
                    self.position = destination.local_to_world(u, v);
                    self.record_hit(HitEventKind::Desorption);
                }
                nb_try += 1;
            }
        }

        self.last_hit_facet = Some(dest_index);

        let ort_velocity = self.velocity * self.direction.dot(facet.n).abs();
        self.increase_facet_counter(
            model,
            facet_id,
            self.particle_time,
            1,
            0,
            0,
            2.0 / ort_velocity,
            2.0 * maxwell_factor(model) * ort_velocity,
        );
        self.scratch[facet_id].is_hit = true;
    }

    fn record_absorb(&mut self, model: &Model, facet_id: usize) {
        let facet = &model.facets[facet_id];
        self.tmp_state.global_hits.global_hits.nb_mc_hit += 1;
        self.tmp_state.global_hits.global_hits.nb_hit_equiv += self.ori_ratio;
        self.tmp_state.global_hits.global_hits.nb_abs_equiv += self.ori_ratio;

        self.record_histograms(model, facet_id);

        self.record_hit(HitEventKind::Absorption);
        let ort_velocity = self.velocity * self.direction.dot(facet.n).abs();
        self.increase_facet_counter(
            model,
            facet_id,
            self.particle_time,
            1,
            0,
            1,
            2.0 / ort_velocity,
            maxwell_factor(model) * ort_velocity,
        );
        self.log_hit(model, facet_id);
        self.profile_facet(model, facet_id, self.particle_time, true, 2.0, 1.0);
        if facet.anglemap_params.record {
            self.record_angle_map(model, facet_id);
        }
        if facet.count_flags.contains(CountFlag::Absorb) {
            self.record_hit_on_texture(model, facet_id, self.particle_time, true, 2.0, 1.0);
        }
        if facet.count_flags.contains(CountFlag::Direction) {
            self.record_direction_vector(model, facet_id, self.particle_time);
        }
    }

    /// Score a facet crossed with `rnd > opacity` during the last segment.
    fn register_transparent_pass(&mut self, model: &Model, facet_id: usize) {
        let facet = &model.facets[facet_id];
        let direction_factor = self.direction.dot(facet.n).abs();
        let pass_time = self.particle_time
            + self.scratch[facet_id].col_dist_transp_pass / 100.0 / self.velocity;
        self.increase_facet_counter(
            model,
            facet_id,
            pass_time,
            1,
            0,
            0,
            2.0 / (self.velocity * direction_factor),
            2.0 * maxwell_factor(model) * self.velocity * direction_factor,
        );
        self.scratch[facet_id].is_hit = true;
        if facet.count_flags.contains(CountFlag::Transparent) {
            self.record_hit_on_texture(model, facet_id, pass_time, true, 2.0, 2.0);
        }
        if facet.count_flags.contains(CountFlag::Direction) {
            self.record_direction_vector(model, facet_id, pass_time);
        }
        self.log_hit(model, facet_id);
        self.profile_facet(model, facet_id, pass_time, true, 2.0, 2.0);
        if facet.anglemap_params.record {
            self.record_angle_map(model, facet_id);
        }
    }

    /// Thermalize against the wall: full thermal re-draw for accommodation
    /// close to 1, else blend the squared speeds.
    fn update_velocity(&mut self, model: &Model, facet: &Facet) {
        if facet.accomodation_factor > 0.9999 {
            self.velocity = if model.wp.use_maxwell_distribution {
                generate_velocity(&model.td.cdfs[facet.cdf_id], self.rng.rnd())
            } else {
                mean_thermal_speed(facet.temperature, model.wp.gas_mass)
            };
        } else {
            let old_speed_sq = self.velocity * self.velocity;
            let new_speed_sq = if model.wp.use_maxwell_distribution {
                let v = generate_velocity(&model.td.cdfs[facet.cdf_id], self.rng.rnd());
                v * v
            } else {
                WALL_SPEED_SQ_FACTOR * facet.temperature / model.wp.gas_mass
            };
            self.velocity = (old_speed_sq
                + (new_speed_sq - old_speed_sq) * facet.accomodation_factor)
                .sqrt();
        }
    }

    /// Add the wall velocity of a moving facet to the particle and
    /// renormalize.
    fn treat_moving_facet(&mut self, model: &Model) {
        let velocity_to_add = match model.wp.motion_type {
            crate::model::MotionType::None => return,
            crate::model::MotionType::Translation => model.wp.motion_vector2,
            crate::model::MotionType::Rotation => {
                // omega x r, with the lever arm converted cm -> m
                let distance = 0.01 * (self.position - model.wp.motion_vector1);
                model.wp.motion_vector2.cross(distance)
            }
        };
        let new_velocity = self.direction * self.velocity + velocity_to_add;
        self.direction = new_velocity.normalize();
        self.velocity = new_velocity.magnitude();
    }

    /// Moment slices an event at `time` accumulates into: always the
    /// steady-state slice 0, plus the matched moment window if any. Advances
    /// the moment-search hint on a match.
    #[inline]
    fn moment_slices(&mut self, model: &Model, time: f64) -> ([usize; 2], usize) {
        match model.lookup_moment_index(time, self.last_moment_index) {
            Some(m) => {
                self.last_moment_index = m - 1;
                ([0, m], 2)
            }
            None => ([0, 0], 1)
        }
    }

    /// Add an event to one facet's counters, in the steady-state slice and,
    /// when the event time falls in a moment window, in that moment's slice.
    #[allow(clippy::too_many_arguments)]
    fn increase_facet_counter(
        &mut self,
        model: &Model,
        facet_id: usize,
        time: f64,
        hit: u64,
        desorb: u64,
        absorb: u64,
        sum_1_per_v: f64,
        sum_v_ort: f64,
    ) {
        let hit_equiv = hit as f64 * self.ori_ratio;
        let (slices, nb_slices) = self.moment_slices(model, time);
        for &slice in &slices[..nb_slices] {
            let hits =
                &mut self.tmp_state.facet_states[facet_id].moment_results[slice].hits;
            hits.nb_mc_hit += hit;
            hits.nb_hit_equiv += hit_equiv;
            hits.nb_desorbed += desorb;
            hits.nb_abs_equiv += absorb as f64 * self.ori_ratio;
            hits.sum_1_per_ort_velocity += self.ori_ratio * sum_1_per_v;
            hits.sum_v_ort += self.ori_ratio * sum_v_ort;
            hits.sum_1_per_velocity += (hit_equiv + desorb as f64) / self.velocity;
        }
    }

    fn record_hit_on_texture(
        &mut self,
        model: &Model,
        facet_id: usize,
        time: f64,
        count_hit: bool,
        velocity_factor: f64,
        ort_speed_factor: f64,
    ) {
        let facet = &model.facets[facet_id];
        let add = facet.texture_cell(self.scratch[facet_id].col_u, self.scratch[facet_id].col_v);
        // surface-orthogonal velocity component
        let ort_velocity =
            maxwell_factor(model) * self.velocity * self.direction.dot(facet.n).abs();
        let increment = facet.texture_cell_increments[add];

        let (slices, nb_slices) = self.moment_slices(model, time);
        for &slice in &slices[..nb_slices] {
            let texture =
                &mut self.tmp_state.facet_states[facet_id].moment_results[slice].texture[add];
            if count_hit {
                texture.count_equiv += self.ori_ratio;
            }
            texture.sum_1_per_ort_velocity += self.ori_ratio * velocity_factor / ort_velocity;
            // sum of ortho velocity [m/s] per cell area [cm2]
            texture.sum_v_ort_per_area +=
                self.ori_ratio * ort_speed_factor * ort_velocity * increment;
        }
    }

    fn record_direction_vector(&mut self, model: &Model, facet_id: usize, time: f64) {
        let facet = &model.facets[facet_id];
        let add = facet.texture_cell(self.scratch[facet_id].col_u, self.scratch[facet_id].col_v);

        let (slices, nb_slices) = self.moment_slices(model, time);
        for &slice in &slices[..nb_slices] {
            let cell =
                &mut self.tmp_state.facet_states[facet_id].moment_results[slice].direction[add];
            cell.dir += self.ori_ratio * self.direction * self.velocity;
            cell.count += 1;
        }
    }

    fn profile_facet(
        &mut self,
        model: &Model,
        facet_id: usize,
        time: f64,
        count_hit: bool,
        velocity_factor: f64,
        ort_speed_factor: f64,
    ) {
        let facet = &model.facets[facet_id];

        match facet.profile_type {
            ProfileType::None => {}
            ProfileType::Angular => {
                if !count_hit {
                    return;
                }
                let dot = facet.n.dot(self.direction);
                let theta = dot.abs().acos(); // angle to the normal
                let pos = ((theta / (PI / 2.0) * PROFILE_SIZE as f64) as usize)
                    .min(PROFILE_SIZE - 1);
                let (slices, nb_slices) = self.moment_slices(model, time);
                for &slice in &slices[..nb_slices] {
                    self.tmp_state.facet_states[facet_id].moment_results[slice].profile[pos]
                        .count_equiv += self.ori_ratio;
                }
            }
            ProfileType::U | ProfileType::V => {
                let coord = if facet.profile_type == ProfileType::U {
                    self.scratch[facet_id].col_u
                } else {
                    self.scratch[facet_id].col_v
                };
                let pos = (coord * PROFILE_SIZE as f64) as usize;
                if pos >= PROFILE_SIZE {
                    return;
                }
                let ort_velocity = self.velocity * facet.n.dot(self.direction).abs();
                let (slices, nb_slices) = self.moment_slices(model, time);
                for &slice in &slices[..nb_slices] {
                    let profile = &mut self.tmp_state.facet_states[facet_id].moment_results
                        [slice]
                        .profile[pos];
                    if count_hit {
                        profile.count_equiv += self.ori_ratio;
                    }
                    profile.sum_1_per_ort_velocity +=
                        self.ori_ratio * velocity_factor / ort_velocity;
                    profile.sum_v_ort += self.ori_ratio
                        * ort_speed_factor
                        * maxwell_factor(model)
                        * ort_velocity;
                }
            }
            ProfileType::Velocity | ProfileType::OrtVelocity | ProfileType::TanVelocity => {
                if !count_hit {
                    return;
                }
                let dot = match facet.profile_type {
                    ProfileType::Velocity => 1.0,
                    ProfileType::OrtVelocity => facet.n.dot(self.direction).abs(),
                    _ => {
                        let ort = facet.n.dot(self.direction).abs();
                        (1.0 - ort * ort).sqrt()
                    }
                };
                let pos =
                    (dot * self.velocity / facet.max_speed * PROFILE_SIZE as f64) as usize;
                if pos >= PROFILE_SIZE {
                    return;
                }
                let (slices, nb_slices) = self.moment_slices(model, time);
                for &slice in &slices[..nb_slices] {
                    self.tmp_state.facet_states[facet_id].moment_results[slice].profile[pos]
                        .count_equiv += self.ori_ratio;
                }
            }
        }
    }

    fn record_angle_map(&mut self, model: &Model, facet_id: usize) {
        let facet = &model.facets[facet_id];
        let (mut in_theta, in_phi) =
            cartesian_to_polar(self.direction, facet.nu, facet.nv, facet.n);
        // theta is measured against N; fold onto [0, PI/2]
        if in_theta > PI / 2.0 {
            in_theta = (PI - in_theta).abs();
        }
        if let Some(theta_index) = facet.anglemap_params.theta_bin(in_theta) {
            let phi_index = facet.anglemap_params.phi_bin(in_phi);
            let map = &mut self.tmp_state.facet_states[facet_id].recorded_angle_map_pdf;
            map[theta_index * facet.anglemap_params.phi_width + phi_index] += 1;
        }
    }

    /// Record the terminal event into the global and per-facet histograms,
    /// into the steady-state slice and any matched moment slice.
    fn record_histograms(&mut self, model: &Model, facet_id: usize) {
        let glob_params = &model.wp.global_histogram_params;
        let facet_params = &model.facets[facet_id].histogram_params;
        let (slices, nb_slices) = self.moment_slices(model, self.particle_time);
        for &slice in &slices[..nb_slices] {
            if glob_params.record_bounce && glob_params.bounce_bins > 0 {
                let bin = ((self.nb_bounces / glob_params.bounce_binsize.max(1)) as usize)
                    .min(glob_params.bounce_bins - 1);
                self.tmp_state.global_histograms[slice].nb_hits[bin] += self.ori_ratio;
            }
            if glob_params.record_distance && glob_params.distance_bins > 0 {
                let bin = ((self.distance_traveled / glob_params.distance_binsize) as usize)
                    .min(glob_params.distance_bins - 1);
                self.tmp_state.global_histograms[slice].distance[bin] += self.ori_ratio;
            }
            if glob_params.record_time && glob_params.time_bins > 0 {
                let bin = (((self.particle_time - self.generation_time)
                    / glob_params.time_binsize) as usize)
                    .min(glob_params.time_bins - 1);
                self.tmp_state.global_histograms[slice].time[bin] += self.ori_ratio;
            }
            let facet_histogram =
                &mut self.tmp_state.facet_states[facet_id].moment_results[slice].histogram;
            if facet_params.record_bounce && facet_params.bounce_bins > 0 {
                let bin = ((self.nb_bounces / facet_params.bounce_binsize.max(1)) as usize)
                    .min(facet_params.bounce_bins - 1);
                facet_histogram.nb_hits[bin] += self.ori_ratio;
            }
            if facet_params.record_distance && facet_params.distance_bins > 0 {
                let bin = ((self.distance_traveled / facet_params.distance_binsize) as usize)
                    .min(facet_params.distance_bins - 1);
                facet_histogram.distance[bin] += self.ori_ratio;
            }
            if facet_params.record_time && facet_params.time_bins > 0 {
                let bin = (((self.particle_time - self.generation_time)
                    / facet_params.time_binsize) as usize)
                    .min(facet_params.time_bins - 1);
                facet_histogram.time[bin] += self.ori_ratio;
            }
        }
    }

    fn log_hit(&mut self, model: &Model, facet_id: usize) {
        if model.otf.enable_logging
            && model.otf.log_facet_id == facet_id
            && self.tmp_particle_log.len() < self.log_capacity
        {
            let facet = &model.facets[facet_id];
            let (hit_theta, hit_phi) =
                cartesian_to_polar(self.direction, facet.nu, facet.nv, facet.n);
            self.tmp_particle_log.push(ParticleLogEntry {
                facet_hit_position: (
                    self.scratch[facet_id].col_u,
                    self.scratch[facet_id].col_v,
                ),
                hit_theta,
                hit_phi,
                ori_ratio: self.ori_ratio,
                particle_decay_moment: self.expected_decay_moment,
                time: self.particle_time,
                velocity: self.velocity,
            });
        }
    }

    /// Append to the visualization hit cache (worker 0 feeds the display).
    fn record_hit(&mut self, kind: HitEventKind) {
        if self.particle_id != 0 {
            return;
        }
        self.tmp_state.global_hits.hit_cache.record(HitEvent {
            pos: self.position,
            kind,
        });
    }

    fn record_leak_pos(&mut self) {
        if self.particle_id != 0 {
            return;
        }
        self.record_hit(HitEventKind::Reflection);
        self.record_hit(HitEventKind::Last);
        self.tmp_state.global_hits.leak_cache.record(LeakEvent {
            pos: self.position,
            dir: self.direction,
        });
    }

    /// Fold this worker's accumulator into the global state under the timed
    /// mutex. Returns `false` on lock timeout; nothing is merged then and
    /// the thread state is kept for a retry.
    pub fn update_mc_hits(
        &mut self,
        global: &GlobalState,
        nb_moments: usize,
        timeout: Duration,
    ) -> bool {
        let Some(mut global_state) = global.state.try_lock_for(timeout) else {
            return false;
        };
        let tmp = &self.tmp_state;
        let batch_desorbed = tmp.global_hits.global_hits.nb_desorbed;

        global_state.global_hits.global_hits += &tmp.global_hits.global_hits;
        global_state.global_hits.dist_traveled_total += tmp.global_hits.dist_traveled_total;
        global_state.global_hits.dist_traveled_full_hits_only +=
            tmp.global_hits.dist_traveled_full_hits_only;

        global_state
            .global_hits
            .leak_cache
            .merge_from(tmp.global_hits.leak_cache.entries());
        global_state.global_hits.nb_leak_total += tmp.global_hits.nb_leak_total;

        // the hit cache is a deterministic visualizer feed from worker 0 only
        if self.particle_id == 0 && !tmp.global_hits.hit_cache.is_empty() {
            global_state
                .global_hits
                .hit_cache
                .merge_from(tmp.global_hits.hit_cache.entries());
            let pen_up = HitEvent {
                pos: tmp.global_hits.hit_cache.entries().last().unwrap().pos,
                kind: HitEventKind::Last,
            };
            global_state.global_hits.hit_cache.place_marker(pen_up);
        }

        for (global_histogram, thread_histogram) in global_state
            .global_histograms
            .iter_mut()
            .zip(&tmp.global_histograms)
        {
            global_histogram.add(thread_histogram);
        }
        for (global_facet, thread_facet) in
            global_state.facet_states.iter_mut().zip(&tmp.facet_states)
        {
            global_facet.add(thread_facet);
        }

        self.total_desorbed += batch_desorbed;

        if self.particle_id == 0 {
            let limits = compute_texture_limits(self.model.as_ref(), &global_state, nb_moments);
            global_state.global_hits.texture_limits = limits;
        }

        true
    }

    /// Merge and, on success, reset the thread-local accumulator so the next
    /// batch starts clean.
    pub fn update_hits(&mut self, global: &GlobalState, timeout: Duration) -> bool {
        let nb_moments = self.model.nb_moments();
        let ok = self.update_mc_hits(global, nb_moments, timeout);
        if ok {
            self.tmp_state.reset();
            self.tmp_particle_log.clear();
        }
        ok
    }
}

#[inline]
fn maxwell_factor(model: &Model) -> f64 {
    if model.wp.use_maxwell_distribution {
        1.0
    } else {
        WALL_MOMENT_CORRECTION
    }
}

/// Scan every textured facet and every moment for the per-cell physical
/// values (pressure, impingement rate, density) and keep the global min/max
/// for colormap autoscaling. Minima only consider positive values.
fn compute_texture_limits(
    model: &Model,
    state: &SimuState,
    nb_moments: usize,
) -> [crate::counters::TextureMinMax; 3] {
    use crate::counters::TextureMinMax;
    let mut limits = [TextureMinMax::default(); 3];

    for facet in model.facets.iter().filter(|f| f.is_textured) {
        for m in 0..=nb_moments {
            let snapshot = &state.facet_states[facet.global_id].moment_results[m];
            // skip facets never hit in this moment
            if snapshot.hits.nb_mc_hit == 0 && snapshot.hits.nb_desorbed == 0 {
                continue;
            }
            // required to compare constant-flow values with moment values
            let time_correction = if m == 0 {
                model.wp.final_outgassing_rate
            } else {
                model.wp.total_desorbed_molecules / model.td.moments[m - 1].window
            };
            for (cell_index, cell) in snapshot.texture.iter().enumerate() {
                if !facet.large_enough[cell_index] {
                    continue;
                }
                let increment = facet.texture_cell_increments[cell_index];
                let values = [
                    cell.sum_v_ort_per_area * time_correction, // pressure
                    cell.count_equiv * increment * time_correction, // impingement rate
                    increment * cell.sum_1_per_ort_velocity * time_correction, // density
                ];
                for (limit, &value) in limits.iter_mut().zip(&values) {
                    limit.max.all = limit.max.all.max(value);
                    if value > 0.0 {
                        limit.min.all = limit.min.all.min(value);
                    }
                    if m != 0 {
                        limit.max.moments_only = limit.max.moments_only.max(value);
                        if value > 0.0 {
                            limit.min.moments_only = limit.min.moments_only.min(value);
                        }
                    }
                }
            }
        }
    }
    limits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intersect::build_oracles;
    use crate::model::{model_from_description, ModelDescription};

    fn test_particle(extra_world: &str) -> Particle {
        let json = format!(
            r#"{{
                "vertices": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]],
                "facets": [{{"indices": [0,1,2,3], "desorb_type": "cosine", "outgassing": 1e-3}}],
                "world": {{{}}}
            }}"#,
            extra_world
        );
        let description: ModelDescription = serde_json::from_str(&json).unwrap();
        let model = Arc::new(model_from_description(description).unwrap());
        let oracles = Arc::new(build_oracles(&model));
        let mut particle = Particle::new(0, 42, Arc::clone(&model), oracles);
        particle.allocate();
        particle
    }

    #[test]
    fn translating_facet_adds_the_wall_velocity() {
        let mut particle =
            test_particle(r#""motion_type": "translation", "motion_vector2": [1.0, 0.0, 0.0]"#);
        particle.velocity = 500.0;
        particle.direction = Vector3::new(0.0, 0.0, -1.0);
        let model = Arc::clone(&particle.model);
        particle.treat_moving_facet(&model);
        assert!((particle.velocity - (500.0f64 * 500.0 + 1.0).sqrt()).abs() < 1e-9);
        assert!(particle.direction.z < 0.0);
        assert!((particle.direction.magnitude() - 1.0).abs() < 1e-12);
        assert!((particle.direction.x - 1.0 / particle.velocity).abs() < 1e-9);
    }

    #[test]
    fn rotating_facet_uses_the_lever_arm() {
        let mut particle = test_particle(
            r#""motion_type": "rotation",
               "motion_vector1": [0.0, 0.0, 0.0],
               "motion_vector2": [0.0, 0.0, 1.0]"#,
        );
        // 100 cm from the axis along x: omega x r = 1 m/s along y
        particle.position = Vector3::new(100.0, 0.0, 0.0);
        particle.velocity = 500.0;
        particle.direction = Vector3::new(0.0, 0.0, -1.0);
        let model = Arc::clone(&particle.model);
        particle.treat_moving_facet(&model);
        assert!((particle.velocity - (500.0f64 * 500.0 + 1.0).sqrt()).abs() < 1e-9);
        assert!((particle.direction.y - 1.0 / particle.velocity).abs() < 1e-9);
    }

    #[test]
    fn motionless_world_leaves_the_particle_alone() {
        let mut particle = test_particle("");
        particle.velocity = 321.0;
        particle.direction = Vector3::new(0.0, 0.0, -1.0);
        let model = Arc::clone(&particle.model);
        particle.treat_moving_facet(&model);
        assert_eq!(particle.velocity, 321.0);
        assert_eq!(particle.direction, Vector3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn accommodation_blends_squared_speeds() {
        let mut particle = test_particle(r#""use_maxwell_distribution": false"#);
        let model = Arc::clone(&particle.model);
        let mut facet = model.facets[0].clone();
        facet.accomodation_factor = 0.5;
        particle.velocity = 100.0;
        particle.update_velocity(&model, &facet);
        let wall_speed_sq = WALL_SPEED_SQ_FACTOR * facet.temperature / model.wp.gas_mass;
        let expected = (100.0f64 * 100.0 + (wall_speed_sq - 100.0 * 100.0) * 0.5).sqrt();
        assert!((particle.velocity - expected).abs() < 1e-9);
    }

    #[test]
    fn full_accommodation_rethermalizes() {
        let mut particle = test_particle(r#""use_maxwell_distribution": false"#);
        let model = Arc::clone(&particle.model);
        let facet = model.facets[0].clone();
        particle.velocity = 9999.0;
        particle.update_velocity(&model, &facet);
        let expected = mean_thermal_speed(facet.temperature, model.wp.gas_mass);
        assert!((particle.velocity - expected).abs() < 1e-9);
    }

    #[test]
    fn budget_zero_spawns_nothing() {
        let mut particle = test_particle("");
        assert!(!particle.simulation_mc_step(100, 0));
        assert_eq!(particle.tmp_state.global_hits.global_hits.nb_desorbed, 0);
    }

    #[test]
    fn every_budgeted_particle_is_transported() {
        // single facet into vacuum: every particle desorbs, then leaks
        let mut particle = test_particle("");
        assert!(!particle.simulation_mc_step(1000, 10));
        let hits = &particle.tmp_state.global_hits;
        assert_eq!(hits.global_hits.nb_desorbed, 10);
        assert_eq!(hits.nb_leak_total, 10);
        assert_eq!(hits.global_hits.nb_abs_equiv, 0.0);
    }
}
