//! Ray-facet intersection. The transport loop consumes this through the
//! narrow `trace` interface; the reference implementation scans the facet
//! list of one structure linearly. Partially transparent facets are decided
//! here by sampling against their opacity, and the ones passed through are
//! queued for the particle loop to score.

use crate::math::Vec3;
use crate::model::Model;
use crate::rng::RandomGenerator;
use cgmath::InnerSpace;

/// Numerical floor keeping a particle from re-hitting the surface it just
/// left (distances are in cm).
const MIN_HIT_DISTANCE: f64 = 1e-9;

/// Per-facet per-particle scratch: collision coordinates of the current ray
/// segment plus the one-shot absorber state. Sized to the facet count once,
/// never reallocated during transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacetScratch {
    pub col_u: f64,
    pub col_v: f64,
    pub col_dist: f64,
    pub col_dist_transp_pass: f64,
    pub is_hit: bool,
    /// One-shot absorbers: armed at particle spawn, cleared on first hit.
    pub volatile_ready: bool,
}

/// Linear-scan intersection oracle of one structure.
///
/// Acceleration structures are external collaborators; everything the
/// transport loop needs is the contract of [`LinearOracle::trace`].
#[derive(Debug, Clone, Default)]
pub struct LinearOracle {
    facet_ids: Vec<usize>,
}

impl LinearOracle {
    /// Closest facet hit by the semi-infinite ray, or `None` for a leak.
    ///
    /// Facets with opacity below 1 are sampled: with probability
    /// `1 - opacity(t)` the crossing is queued in `transparent_hits` (with
    /// its distance in `col_dist_transp_pass`) instead of competing for the
    /// hit. Only crossings closer than the winning hit are kept queued.
    #[allow(clippy::too_many_arguments)]
    pub fn trace(
        &self,
        model: &Model,
        origin: Vec3,
        direction: Vec3,
        time: f64,
        last_hit: Option<usize>,
        rng: &mut RandomGenerator,
        scratch: &mut [FacetScratch],
        transparent_hits: &mut Vec<usize>,
    ) -> Option<(usize, f64)> {
        transparent_hits.clear();
        let mut best: Option<(usize, f64)> = None;

        for &id in &self.facet_ids {
            if last_hit == Some(id) {
                continue;
            }
            let facet = &model.facets[id];
            let denom = direction.dot(facet.n);
            if denom.abs() < 1e-12 {
                continue;
            }
            // one-sided facets are invisible from behind
            if !facet.two_sided && denom > 0.0 {
                continue;
            }
            let d = (facet.o - origin).dot(facet.n) / denom;
            if d < MIN_HIT_DISTANCE {
                continue;
            }
            let rel = (origin + d * direction) - facet.o;
            let u = rel.dot(facet.u) / facet.u.magnitude2();
            let v = rel.dot(facet.v) / facet.v.magnitude2();
            if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
                continue;
            }
            if !facet.is_in_facet(u, v) {
                continue;
            }

            let opacity = model.opacity_at(facet, time);
            let hard_hit = opacity >= 1.0 || (opacity > 0.0 && rng.rnd() < opacity);
            if hard_hit {
                if best.map_or(true, |(_, best_d)| d < best_d) {
                    scratch[id].col_u = u;
                    scratch[id].col_v = v;
                    scratch[id].col_dist = d;
                    best = Some((id, d));
                }
            } else {
                scratch[id].col_u = u;
                scratch[id].col_v = v;
                scratch[id].col_dist_transp_pass = d;
                transparent_hits.push(id);
            }
        }

        if let Some((_, best_d)) = best {
            transparent_hits.retain(|&id| scratch[id].col_dist_transp_pass < best_d);
        }
        best
    }
}

/// One oracle per structure, over that structure's facet list (universal
/// facets are listed in every structure).
pub fn build_oracles(model: &Model) -> Vec<LinearOracle> {
    model
        .structures
        .iter()
        .map(|s| LinearOracle {
            facet_ids: s.facet_ids.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{model_from_description, ModelDescription};
    use cgmath::Vector3;

    fn single_facet_model(extra: &str) -> Model {
        let json = format!(
            r#"{{
                "vertices": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]],
                "facets": [{{"indices": [0,1,2,3]{}}}]
            }}"#,
            extra
        );
        let description: ModelDescription = serde_json::from_str(&json).unwrap();
        model_from_description(description).unwrap()
    }

    fn trace_once(
        model: &Model,
        origin: Vec3,
        direction: Vec3,
        rng: &mut RandomGenerator,
    ) -> Option<(usize, f64)> {
        let oracle = &build_oracles(model)[0];
        let mut scratch = vec![FacetScratch::default(); model.facets.len()];
        let mut passes = Vec::new();
        oracle.trace(
            model,
            origin,
            direction,
            0.0,
            None,
            rng,
            &mut scratch,
            &mut passes,
        )
    }

    #[test]
    fn frontal_ray_hits_at_the_right_distance() {
        let model = single_facet_model("");
        let mut rng = RandomGenerator::new(1);
        let hit = trace_once(
            &model,
            Vector3::new(0.5, 0.5, 2.0),
            Vector3::new(0.0, 0.0, -1.0),
            &mut rng,
        );
        let (id, d) = hit.expect("ray straight at the facet must hit");
        assert_eq!(id, 0);
        assert!((d - 2.0).abs() < 1e-12);
    }

    #[test]
    fn one_sided_facet_is_invisible_from_behind() {
        let model = single_facet_model("");
        let mut rng = RandomGenerator::new(1);
        let hit = trace_once(
            &model,
            Vector3::new(0.5, 0.5, -2.0),
            Vector3::new(0.0, 0.0, 1.0),
            &mut rng,
        );
        assert!(hit.is_none());
    }

    #[test]
    fn two_sided_facet_is_hit_from_behind() {
        let model = single_facet_model(r#", "two_sided": true"#);
        let mut rng = RandomGenerator::new(1);
        let hit = trace_once(
            &model,
            Vector3::new(0.5, 0.5, -2.0),
            Vector3::new(0.0, 0.0, 1.0),
            &mut rng,
        );
        assert!(hit.is_some());
    }

    #[test]
    fn ray_missing_the_polygon_leaks() {
        let model = single_facet_model("");
        let mut rng = RandomGenerator::new(1);
        let hit = trace_once(
            &model,
            Vector3::new(3.0, 3.0, 2.0),
            Vector3::new(0.0, 0.0, -1.0),
            &mut rng,
        );
        assert!(hit.is_none());
    }

    #[test]
    fn semi_transparent_facet_passes_roughly_its_transparency() {
        let model = single_facet_model(r#", "opacity": 0.3"#);
        let oracle = &build_oracles(&model)[0];
        let mut rng = RandomGenerator::new(77);
        let mut scratch = vec![FacetScratch::default(); 1];
        let mut passes = Vec::new();
        let mut hard = 0;
        let mut through = 0;
        for _ in 0..10_000 {
            let hit = oracle.trace(
                &model,
                Vector3::new(0.5, 0.5, 1.0),
                Vector3::new(0.0, 0.0, -1.0),
                0.0,
                None,
                &mut rng,
                &mut scratch,
                &mut passes,
            );
            match hit {
                Some(_) => hard += 1,
                None => {
                    through += 1;
                    assert_eq!(passes.len(), 1);
                    assert!((scratch[0].col_dist_transp_pass - 1.0).abs() < 1e-12);
                }
            }
        }
        let fraction = hard as f64 / (hard + through) as f64;
        assert!((fraction - 0.3).abs() < 0.02, "hard fraction {}", fraction);
    }

    #[test]
    fn the_resting_facet_is_skipped() {
        let model = single_facet_model("");
        let oracle = &build_oracles(&model)[0];
        let mut rng = RandomGenerator::new(1);
        let mut scratch = vec![FacetScratch::default(); 1];
        let mut passes = Vec::new();
        let hit = oracle.trace(
            &model,
            Vector3::new(0.5, 0.5, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
            0.0,
            Some(0),
            &mut rng,
            &mut scratch,
            &mut passes,
        );
        assert!(hit.is_none());
    }
}
