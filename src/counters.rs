//! Observable buffers. Worker threads accumulate into a private `SimuState`
//! and periodically fold it into the shared `GlobalState` under a timed
//! mutex; every merge below is a commutative addition so worker ordering
//! never matters.

use crate::math::Vec3;
use crate::model::{CountFlag, HistogramParams, Model};
use cgmath::Vector3;
use parking_lot::Mutex;
use std::ops::AddAssign;
use strum_macros::Display;

pub const PROFILE_SIZE: usize = 100;
pub const HIT_CACHE_SIZE: usize = 2048;
pub const LEAK_CACHE_SIZE: usize = 2048;

/// Sentinel for texture autoscale minima searches.
pub const HIT_MAX: f64 = 1e100;

/// Event kinds stored in the hit cache, a debug/visualization feed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum HitEventKind {
    Desorption,
    Absorption,
    Reflection,
    Transparent,
    TeleportSource,
    TeleportDest,
    Moving,
    /// Pen-up separator between runs of hits from one particle.
    Last,
}

#[derive(Debug, Clone, Copy)]
pub struct HitEvent {
    pub pos: Vec3,
    pub kind: HitEventKind,
}

#[derive(Debug, Clone, Copy)]
pub struct LeakEvent {
    pub pos: Vec3,
    pub dir: Vec3,
}

/// Bounded append-only cache on the worker side, ring buffer on the global
/// side. Workers stop recording when full and start over after each merge.
#[derive(Debug, Clone, Default)]
pub struct EventCache<T> {
    entries: Vec<T>,
    write_index: usize,
    capacity: usize,
}

impl<T: Clone> EventCache<T> {
    pub fn new(capacity: usize) -> Self {
        EventCache {
            entries: Vec::new(),
            write_index: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    /// Worker-side append; silently drops once the cache is full.
    pub fn record(&mut self, event: T) {
        if self.entries.len() < self.capacity {
            self.entries.push(event);
        }
    }

    /// Global-side ring append at the current write index, saturating the
    /// size at capacity.
    pub fn merge_from(&mut self, events: &[T]) {
        for event in events {
            self.put(event.clone());
            self.write_index = (self.write_index + 1) % self.capacity;
        }
    }

    /// Overwrite the slot at the write index without advancing it; the next
    /// merge will overwrite the marker again.
    pub fn place_marker(&mut self, event: T) {
        self.put(event);
    }

    fn put(&mut self, event: T) {
        if self.write_index == self.entries.len() && self.entries.len() < self.capacity {
            self.entries.push(event);
        } else {
            self.entries[self.write_index] = event;
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.write_index = 0;
    }
}

/// Scalar hit counters; used globally and per facet per moment. The only
/// integer counters in the whole state are `nb_mc_hit` and `nb_desorbed`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HitBuffer {
    pub nb_mc_hit: u64,
    pub nb_hit_equiv: f64,
    pub nb_abs_equiv: f64,
    pub nb_desorbed: u64,
    pub sum_1_per_ort_velocity: f64,
    pub sum_v_ort: f64,
    pub sum_1_per_velocity: f64,
}

impl AddAssign<&HitBuffer> for HitBuffer {
    fn add_assign(&mut self, rhs: &HitBuffer) {
        self.nb_mc_hit += rhs.nb_mc_hit;
        self.nb_hit_equiv += rhs.nb_hit_equiv;
        self.nb_abs_equiv += rhs.nb_abs_equiv;
        self.nb_desorbed += rhs.nb_desorbed;
        self.sum_1_per_ort_velocity += rhs.sum_1_per_ort_velocity;
        self.sum_v_ort += rhs.sum_v_ort;
        self.sum_1_per_velocity += rhs.sum_1_per_velocity;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextureCell {
    pub count_equiv: f64,
    pub sum_1_per_ort_velocity: f64,
    pub sum_v_ort_per_area: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DirectionCell {
    /// Sum of `ori_ratio * direction * velocity` over recorded hits.
    pub dir: Vec3,
    pub count: u64,
}

impl Default for DirectionCell {
    fn default() -> Self {
        DirectionCell {
            dir: Vector3::new(0.0, 0.0, 0.0),
            count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileSlice {
    pub count_equiv: f64,
    pub sum_1_per_ort_velocity: f64,
    pub sum_v_ort: f64,
}

/// Bounce/distance/flight-time histogram, sized by `HistogramParams`.
#[derive(Debug, Clone, Default)]
pub struct HistogramBuffer {
    pub nb_hits: Vec<f64>,
    pub distance: Vec<f64>,
    pub time: Vec<f64>,
}

impl HistogramBuffer {
    pub fn sized_for(params: &HistogramParams) -> Self {
        HistogramBuffer {
            nb_hits: vec![0.0; if params.record_bounce { params.bounce_bins } else { 0 }],
            distance: vec![0.0; if params.record_distance { params.distance_bins } else { 0 }],
            time: vec![0.0; if params.record_time { params.time_bins } else { 0 }],
        }
    }

    pub fn add(&mut self, rhs: &HistogramBuffer) {
        for (a, b) in self.nb_hits.iter_mut().zip(&rhs.nb_hits) {
            *a += b;
        }
        for (a, b) in self.distance.iter_mut().zip(&rhs.distance) {
            *a += b;
        }
        for (a, b) in self.time.iter_mut().zip(&rhs.time) {
            *a += b;
        }
    }

    pub fn reset(&mut self) {
        self.nb_hits.iter_mut().for_each(|v| *v = 0.0);
        self.distance.iter_mut().for_each(|v| *v = 0.0);
        self.time.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Everything recorded on one facet for one moment slice.
#[derive(Debug, Clone, Default)]
pub struct FacetMomentSnapshot {
    pub hits: HitBuffer,
    pub profile: Vec<ProfileSlice>,
    pub texture: Vec<TextureCell>,
    pub direction: Vec<DirectionCell>,
    pub histogram: HistogramBuffer,
}

impl FacetMomentSnapshot {
    fn add(&mut self, rhs: &FacetMomentSnapshot) {
        self.hits += &rhs.hits;
        for (a, b) in self.profile.iter_mut().zip(&rhs.profile) {
            a.count_equiv += b.count_equiv;
            a.sum_1_per_ort_velocity += b.sum_1_per_ort_velocity;
            a.sum_v_ort += b.sum_v_ort;
        }
        for (a, b) in self.texture.iter_mut().zip(&rhs.texture) {
            a.count_equiv += b.count_equiv;
            a.sum_1_per_ort_velocity += b.sum_1_per_ort_velocity;
            a.sum_v_ort_per_area += b.sum_v_ort_per_area;
        }
        for (a, b) in self.direction.iter_mut().zip(&rhs.direction) {
            a.dir += b.dir;
            a.count += b.count;
        }
        self.histogram.add(&rhs.histogram);
    }

    fn reset(&mut self) {
        self.hits = HitBuffer::default();
        self.profile.iter_mut().for_each(|p| *p = ProfileSlice::default());
        self.texture.iter_mut().for_each(|t| *t = TextureCell::default());
        self.direction.iter_mut().for_each(|d| *d = DirectionCell::default());
        self.histogram.reset();
    }
}

/// Per-facet state: one snapshot per moment (index 0 is the steady-state
/// accumulator) plus the recorded incidence angle map.
#[derive(Debug, Clone, Default)]
pub struct FacetState {
    pub moment_results: Vec<FacetMomentSnapshot>,
    pub recorded_angle_map_pdf: Vec<u64>,
}

impl FacetState {
    pub fn add(&mut self, rhs: &FacetState) {
        for (a, b) in self.moment_results.iter_mut().zip(&rhs.moment_results) {
            a.add(b);
        }
        for (a, b) in self.recorded_angle_map_pdf.iter_mut().zip(&rhs.recorded_angle_map_pdf) {
            *a += b;
        }
    }

    pub fn reset(&mut self) {
        self.moment_results.iter_mut().for_each(|m| m.reset());
        self.recorded_angle_map_pdf.iter_mut().for_each(|v| *v = 0);
    }
}

/// One min/max pair tracked across all moments and across moments-only.
#[derive(Debug, Clone, Copy)]
pub struct ScaleBound {
    pub all: f64,
    pub moments_only: f64,
}

/// Physical-value bounds (pressure, impingement rate, density) driving the
/// texture colormap autoscale.
#[derive(Debug, Clone, Copy)]
pub struct TextureMinMax {
    pub min: ScaleBound,
    pub max: ScaleBound,
}

impl Default for TextureMinMax {
    fn default() -> Self {
        TextureMinMax {
            min: ScaleBound {
                all: HIT_MAX,
                moments_only: HIT_MAX,
            },
            max: ScaleBound {
                all: 0.0,
                moments_only: 0.0,
            },
        }
    }
}

/// Global counters plus the hit/leak visualization caches.
#[derive(Debug, Clone)]
pub struct GlobalHitBuffer {
    pub global_hits: HitBuffer,
    pub dist_traveled_total: f64,
    pub dist_traveled_full_hits_only: f64,
    pub nb_leak_total: u64,
    pub hit_cache: EventCache<HitEvent>,
    pub leak_cache: EventCache<LeakEvent>,
    /// Pressure / impingement rate / density bounds, recomputed on merge.
    pub texture_limits: [TextureMinMax; 3],
}

impl Default for GlobalHitBuffer {
    fn default() -> Self {
        GlobalHitBuffer {
            global_hits: HitBuffer::default(),
            dist_traveled_total: 0.0,
            dist_traveled_full_hits_only: 0.0,
            nb_leak_total: 0,
            hit_cache: EventCache::new(HIT_CACHE_SIZE),
            leak_cache: EventCache::new(LEAK_CACHE_SIZE),
            texture_limits: [TextureMinMax::default(); 3],
        }
    }
}

/// Full simulation state: used both as the per-worker scratch accumulator
/// and, wrapped in `GlobalState`, as the authoritative aggregate.
#[derive(Debug, Clone, Default)]
pub struct SimuState {
    pub global_hits: GlobalHitBuffer,
    /// One histogram per moment slice, `1 + nb_moments` entries.
    pub global_histograms: Vec<HistogramBuffer>,
    pub facet_states: Vec<FacetState>,
    pub initialized: bool,
}

impl SimuState {
    pub fn reset(&mut self) {
        self.global_hits.global_hits = HitBuffer::default();
        self.global_hits.dist_traveled_total = 0.0;
        self.global_hits.dist_traveled_full_hits_only = 0.0;
        self.global_hits.nb_leak_total = 0;
        self.global_hits.hit_cache.reset();
        self.global_hits.leak_cache.reset();
        self.global_hits.texture_limits = [TextureMinMax::default(); 3];
        self.global_histograms.iter_mut().for_each(|h| h.reset());
        self.facet_states.iter_mut().for_each(|f| f.reset());
    }
}

/// The authoritative aggregate behind the single timed mutex of the
/// reduction protocol.
pub struct GlobalState {
    pub state: Mutex<SimuState>,
}

impl GlobalState {
    pub fn new(state: SimuState) -> Self {
        GlobalState {
            state: Mutex::new(state),
        }
    }
}

/// Allocate a zeroed state matching the model's dimensions: one moment slice
/// per facet per observation moment (plus the steady-state slice 0), buffers
/// sized by what each facet actually records.
pub fn new_simu_state(model: &Model) -> SimuState {
    let nb_slices = 1 + model.td.moments.len();
    let facet_states = model
        .facets
        .iter()
        .map(|facet| {
            let template = FacetMomentSnapshot {
                hits: HitBuffer::default(),
                profile: vec![
                    ProfileSlice::default();
                    if facet.is_profile() { PROFILE_SIZE } else { 0 }
                ],
                texture: vec![
                    TextureCell::default();
                    if facet.is_textured { facet.texture_size() } else { 0 }
                ],
                direction: vec![
                    DirectionCell::default();
                    if facet.count_flags.contains(CountFlag::Direction) {
                        facet.texture_size()
                    } else {
                        0
                    }
                ],
                histogram: HistogramBuffer::sized_for(&facet.histogram_params),
            };
            FacetState {
                moment_results: vec![template; nb_slices],
                recorded_angle_map_pdf: vec![
                    0;
                    if facet.anglemap_params.record {
                        facet.anglemap_params.map_size()
                    } else {
                        0
                    }
                ],
            }
        })
        .collect();

    SimuState {
        global_hits: GlobalHitBuffer::default(),
        global_histograms: vec![
            HistogramBuffer::sized_for(&model.wp.global_histogram_params);
            nb_slices
        ],
        facet_states,
        initialized: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    fn hit(x: f64) -> HitEvent {
        HitEvent {
            pos: Vector3::new(x, 0.0, 0.0),
            kind: HitEventKind::Reflection,
        }
    }

    #[test]
    fn hit_buffer_merge_is_additive() {
        let mut a = HitBuffer {
            nb_mc_hit: 3,
            nb_hit_equiv: 3.0,
            ..Default::default()
        };
        let b = HitBuffer {
            nb_mc_hit: 2,
            nb_hit_equiv: 1.5,
            nb_desorbed: 7,
            ..Default::default()
        };
        a += &b;
        assert_eq!(a.nb_mc_hit, 5);
        assert_eq!(a.nb_desorbed, 7);
        assert!((a.nb_hit_equiv - 4.5).abs() < 1e-12);
    }

    #[test]
    fn worker_cache_saturates_at_capacity() {
        let mut cache = EventCache::new(4);
        for i in 0..10 {
            cache.record(hit(i as f64));
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn ring_merge_wraps_and_saturates() {
        let mut global = EventCache::new(4);
        global.merge_from(&[hit(0.0), hit(1.0), hit(2.0)]);
        assert_eq!(global.len(), 3);
        global.merge_from(&[hit(3.0), hit(4.0)]);
        // wrapped: oldest entry overwritten, size saturated
        assert_eq!(global.len(), 4);
        assert!((global.entries()[0].pos.x - 4.0).abs() < 1e-12);
    }

    #[test]
    fn marker_does_not_advance_the_ring() {
        let mut global = EventCache::new(4);
        global.merge_from(&[hit(0.0)]);
        global.place_marker(HitEvent {
            pos: Vector3::new(0.0, 0.0, 0.0),
            kind: HitEventKind::Last,
        });
        assert_eq!(global.entries()[1].kind, HitEventKind::Last);
        global.merge_from(&[hit(9.0)]);
        // the next merge overwrote the marker slot
        assert!((global.entries()[1].pos.x - 9.0).abs() < 1e-12);
        assert_eq!(global.entries()[1].kind, HitEventKind::Reflection);
    }

    #[test]
    fn reset_zeroes_everything_but_keeps_layout() {
        let mut state = SimuState {
            global_histograms: vec![HistogramBuffer {
                nb_hits: vec![1.0, 2.0],
                ..Default::default()
            }],
            facet_states: vec![FacetState {
                moment_results: vec![FacetMomentSnapshot {
                    texture: vec![TextureCell {
                        count_equiv: 5.0,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                recorded_angle_map_pdf: vec![3],
            }],
            ..Default::default()
        };
        state.global_hits.global_hits.nb_mc_hit = 10;
        state.reset();
        assert_eq!(state.global_hits.global_hits.nb_mc_hit, 0);
        assert_eq!(state.global_histograms[0].nb_hits, vec![0.0, 0.0]);
        assert_eq!(state.facet_states[0].moment_results[0].texture.len(), 1);
        assert!((state.facet_states[0].moment_results[0].texture[0].count_equiv).abs() < 1e-12);
        assert_eq!(state.facet_states[0].recorded_angle_map_pdf[0], 0);
    }
}
