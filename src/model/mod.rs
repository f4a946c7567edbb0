//! The immutable model snapshot: geometry, surface properties and world
//! parameters, assembled once before a run and shared read-only between all
//! workers. Facets live in one flat arena indexed by `global_id`; structures
//! reference them by index, so there are no cyclic links.

mod facet;
mod loader;

pub use facet::{CountFlag, Facet, OutgassingMap, Reflection, Teleport};
pub use loader::{load_model, load_moments, model_from_description, ModelDescription};

use crate::math::interpolate_y;
use crate::sampling::BOLTZMANN;
use cgmath::Vector3;
use serde::Deserialize;
use strum_macros::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesorbType {
    #[default]
    None,
    Uniform,
    Cosine,
    CosineN,
    AngleMap,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    #[default]
    None,
    Angular,
    U,
    V,
    Velocity,
    OrtVelocity,
    TanVelocity,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionType {
    #[default]
    None,
    Translation,
    Rotation,
}

/// One observation window: times in `[time - window/2, time + window/2)`
/// accumulate into this moment's slice.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Moment {
    pub time: f64,
    pub window: f64,
}

/// Histogram configuration shared by the global and per-facet histograms.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct HistogramParams {
    pub record_bounce: bool,
    pub bounce_binsize: u64,
    pub bounce_bins: usize,
    pub record_distance: bool,
    pub distance_binsize: f64,
    pub distance_bins: usize,
    pub record_time: bool,
    pub time_binsize: f64,
    pub time_bins: usize,
}

impl HistogramParams {
    /// Bytes of one histogram buffer, for snapshot size reporting.
    pub fn data_size(&self) -> usize {
        let doubles = if self.record_bounce { self.bounce_bins } else { 0 }
            + if self.record_distance { self.distance_bins } else { 0 }
            + if self.record_time { self.time_bins } else { 0 };
        doubles * std::mem::size_of::<f64>()
    }
}

/// A time-dependent parameter as a `(time, value)` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParameterTable {
    #[serde(default)]
    pub name: String,
    pub values: Vec<(f64, f64)>,
}

impl ParameterTable {
    pub fn value_at(&self, time: f64) -> f64 {
        interpolate_y(time, &self.values)
    }
}

/// Tabulated time-dependent inputs: speed CDFs per temperature, integrated
/// desorption curves per time-dependent outgassing parameter, moments.
#[derive(Debug, Clone, Default)]
pub struct TimeDependentParams {
    pub cdfs: Vec<Vec<(f64, f64)>>,
    pub ids: Vec<Vec<(f64, f64)>>,
    pub moments: Vec<Moment>,
    pub parameters: Vec<ParameterTable>,
}

/// World-level physics switches.
#[derive(Debug, Clone)]
pub struct WorldParams {
    /// Molar gas mass [g/mol].
    pub gas_mass: f64,
    pub use_maxwell_distribution: bool,
    /// End of the measured period [s].
    pub latest_moment: f64,
    pub half_life: f64,
    pub enable_decay: bool,
    pub motion_type: MotionType,
    /// Rotation base point (rotation mode).
    pub motion_vector1: Vector3<f64>,
    /// Translation velocity [m/s] or rotation axis*omega [rad/s].
    pub motion_vector2: Vector3<f64>,
    /// Normalizer of the source-selection integral.
    pub total_desorbed_molecules: f64,
    /// Steady-state outgassing rate, time-normalizer of moment slice 0.
    pub final_outgassing_rate: f64,
    pub calc_constant_flow: bool,
    pub global_histogram_params: HistogramParams,
}

impl Default for WorldParams {
    fn default() -> Self {
        WorldParams {
            gas_mass: 28.0,
            use_maxwell_distribution: true,
            latest_moment: 0.1,
            half_life: 0.0,
            enable_decay: false,
            motion_type: MotionType::None,
            motion_vector1: Vector3::new(0.0, 0.0, 0.0),
            motion_vector2: Vector3::new(0.0, 0.0, 0.0),
            total_desorbed_molecules: 0.0,
            final_outgassing_rate: 0.0,
            calc_constant_flow: true,
            global_histogram_params: HistogramParams::default(),
        }
    }
}

/// Runtime knobs that do not touch the geometry.
#[derive(Debug, Clone)]
pub struct OntheflyParams {
    /// Total desorption budget; 0 means unlimited.
    pub desorption_limit: u64,
    pub low_flux_mode: bool,
    pub low_flux_cutoff: f64,
    pub enable_logging: bool,
    pub log_facet_id: usize,
    pub log_limit: usize,
}

impl Default for OntheflyParams {
    fn default() -> Self {
        OntheflyParams {
            desorption_limit: 0,
            low_flux_mode: false,
            low_flux_cutoff: 1e-7,
            enable_logging: false,
            log_facet_id: 0,
            log_limit: 0,
        }
    }
}

/// A spatial region; the intersection oracle of a structure only sees the
/// facets listed here (universal facets appear in every structure).
#[derive(Debug, Clone, Default)]
pub struct Structure {
    pub name: String,
    pub facet_ids: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    pub name: String,
    pub vertices: Vec<Vector3<f64>>,
    pub structures: Vec<Structure>,
    pub facets: Vec<Facet>,
    pub td: TimeDependentParams,
    pub wp: WorldParams,
    pub otf: OntheflyParams,
    pub has_volatile: bool,
    pub initialized: bool,
}

impl Model {
    pub fn nb_moments(&self) -> usize {
        self.td.moments.len()
    }

    /// Sticking probability of `facet` at `time`.
    pub fn sticking_at(&self, facet: &Facet, time: f64) -> f64 {
        match facet.sticking_param {
            Some(id) => self.td.parameters[id].value_at(time),
            None => facet.sticking,
        }
    }

    /// Opacity of `facet` at `time`.
    pub fn opacity_at(&self, facet: &Facet, time: f64) -> f64 {
        match facet.opacity_param {
            Some(id) => self.td.parameters[id].value_at(time),
            None => facet.opacity,
        }
    }

    /// Integrated desorption share of a facet in the source-selection
    /// integral (molecules over the measured period).
    pub fn desorption_weight(&self, facet: &Facet) -> f64 {
        if facet.desorb_type == DesorbType::None {
            return 0.0;
        }
        let kt = BOLTZMANN * facet.temperature;
        if let Some(map) = &facet.outgassing_map {
            if map.total() > 0.0 {
                return self.wp.latest_moment * map.total() / kt;
            }
            return 0.0;
        }
        match facet.id_id {
            Some(id) => self.td.ids[id].last().map(|&(_, y)| y).unwrap_or(0.0) / kt,
            None => self.wp.latest_moment * facet.outgassing / kt,
        }
    }

    /// Find the moment slice containing `time`, searching forward from
    /// `start_hint` (particle time is monotone within a lifetime, and the
    /// hint resets on respawn). Returns the 1-based moment index.
    pub fn lookup_moment_index(&self, time: f64, start_hint: usize) -> Option<usize> {
        let moments = &self.td.moments;
        if moments.is_empty() {
            return None;
        }
        let start = start_hint.min(moments.len());
        let offset = moments[start..].partition_point(|m| m.time - 0.5 * m.window <= time);
        if offset == 0 {
            return None;
        }
        let idx = start + offset - 1;
        let m = &moments[idx];
        if time < m.time + 0.5 * m.window {
            Some(idx + 1)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_moments(moments: Vec<Moment>) -> Model {
        Model {
            td: TimeDependentParams {
                moments,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn moment_lookup_hits_the_centered_window() {
        let model = model_with_moments(vec![
            Moment { time: 1.0, window: 0.2 },
            Moment { time: 2.0, window: 0.2 },
        ]);
        assert_eq!(model.lookup_moment_index(1.0, 0), Some(1));
        assert_eq!(model.lookup_moment_index(1.05, 0), Some(1));
        assert_eq!(model.lookup_moment_index(2.05, 0), Some(2));
        assert_eq!(model.lookup_moment_index(1.5, 0), None);
        assert_eq!(model.lookup_moment_index(0.1, 0), None);
        assert_eq!(model.lookup_moment_index(9.0, 0), None);
    }

    #[test]
    fn moment_lookup_respects_the_forward_hint() {
        let model = model_with_moments(vec![
            Moment { time: 1.0, window: 0.2 },
            Moment { time: 2.0, window: 0.2 },
        ]);
        // hint past the first moment: earlier windows are no longer seen
        assert_eq!(model.lookup_moment_index(1.0, 1), None);
        assert_eq!(model.lookup_moment_index(2.0, 1), Some(2));
    }

    #[test]
    fn parameter_table_interpolates() {
        let p = ParameterTable {
            name: "opacity".into(),
            values: vec![(0.0, 1.0), (1.0, 0.0)],
        };
        assert!((p.value_at(0.25) - 0.75).abs() < 1e-12);
    }
}
