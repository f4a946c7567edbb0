//! Incidence angle maps: recording bins and the inverse-CDF sampler used by
//! angle-map desorption. Theta resolution is split at `theta_limit` so the
//! near-normal range can be refined independently of grazing angles.

use crate::rng::RandomGenerator;
use serde::Deserialize;
use std::f64::consts::PI;

/// Shift used when folding phi from `[-PI, PI)` onto `[0, 2PI)` bins; kept
/// slightly below PI so a phi of exactly -PI lands in bin 0.
const PHI_SHIFT: f64 = 3.1415926;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct AnglemapParams {
    /// Record the incidence angles of hits on this facet.
    pub record: bool,
    /// Number of phi bins across `[-PI, PI)`.
    pub phi_width: usize,
    /// Theta value splitting the lower/higher resolution ranges.
    pub theta_limit: f64,
    /// Theta bins below `theta_limit`.
    pub theta_lower_res: usize,
    /// Theta bins between `theta_limit` and PI/2.
    pub theta_higher_res: usize,
}

impl AnglemapParams {
    pub fn theta_bins(&self) -> usize {
        self.theta_lower_res + self.theta_higher_res
    }

    pub fn map_size(&self) -> usize {
        self.theta_bins() * self.phi_width
    }

    pub fn has_map(&self) -> bool {
        self.map_size() > 0
    }

    /// Recording bin for an incidence angle already folded into `[0, PI/2]`.
    /// `None` when the matching resolution range is disabled.
    pub fn theta_bin(&self, theta: f64) -> Option<usize> {
        if theta < self.theta_limit {
            if self.theta_lower_res > 0 {
                let idx = (theta / self.theta_limit * self.theta_lower_res as f64) as usize;
                Some(idx.min(self.theta_lower_res - 1))
            } else {
                None
            }
        } else if self.theta_higher_res > 0 {
            let idx = (self.theta_lower_res as f64
                + (theta - self.theta_limit) / (PI / 2.0 - self.theta_limit)
                    * self.theta_higher_res as f64) as usize;
            Some(idx.min(self.theta_bins() - 1))
        } else {
            None
        }
    }

    /// Recording bin for phi in `[-PI, PI)`.
    pub fn phi_bin(&self, phi: f64) -> usize {
        let idx = ((phi + PHI_SHIFT) / (2.0 * PI) * self.phi_width as f64) as usize;
        idx.min(self.phi_width - 1)
    }

    /// Theta at fractional position `frac` within bin `bin`.
    fn theta_at(&self, bin: usize, frac: f64) -> f64 {
        if bin < self.theta_lower_res {
            (bin as f64 + frac) * self.theta_limit / self.theta_lower_res as f64
        } else {
            self.theta_limit
                + ((bin - self.theta_lower_res) as f64 + frac) * (PI / 2.0 - self.theta_limit)
                    / self.theta_higher_res as f64
        }
    }
}

/// Inverse-CDF sampler over a recorded (or imported) angle map PDF.
///
/// Theta is drawn from the marginal over the split-resolution rows, phi from
/// the conditional distribution of the selected row; both use linear
/// interpolation inside the chosen bin.
#[derive(Debug, Clone)]
pub struct AngleMapSampler {
    params: AnglemapParams,
    /// Cumulative per-row sums, length `theta_bins`.
    theta_cdf: Vec<f64>,
    /// Cumulative per-cell sums within each row, length `theta_bins * phi_width`.
    phi_cdf: Vec<f64>,
    total: f64,
}

impl AngleMapSampler {
    /// `pdf` holds one weight per `(theta, phi)` cell, row-major by theta.
    /// Returns `None` if the map carries no weight at all.
    pub fn new(pdf: &[f64], params: AnglemapParams) -> Option<Self> {
        if pdf.len() != params.map_size() || params.phi_width == 0 {
            return None;
        }
        let mut theta_cdf = Vec::with_capacity(params.theta_bins());
        let mut phi_cdf = vec![0.0; pdf.len()];
        let mut total = 0.0;
        for row in 0..params.theta_bins() {
            let mut row_sum = 0.0;
            for col in 0..params.phi_width {
                let idx = row * params.phi_width + col;
                row_sum += pdf[idx];
                phi_cdf[idx] = row_sum;
            }
            total += row_sum;
            theta_cdf.push(total);
        }
        if total <= 0.0 {
            return None;
        }
        Some(AngleMapSampler {
            params,
            theta_cdf,
            phi_cdf,
            total,
        })
    }

    /// Draw `(theta, phi)`; theta is the stored incidence angle in
    /// `[0, PI/2]`, phi in `[-PI, PI)`.
    pub fn sample(&self, rng: &mut RandomGenerator) -> (f64, f64) {
        let target = rng.rnd() * self.total;
        let row = self
            .theta_cdf
            .partition_point(|&c| c <= target)
            .min(self.theta_cdf.len() - 1);
        let row_start = if row == 0 { 0.0 } else { self.theta_cdf[row - 1] };
        let row_sum = self.theta_cdf[row] - row_start;
        let overshoot = if row_sum > 0.0 {
            (target - row_start) / row_sum
        } else {
            rng.rnd()
        };
        let theta = self.params.theta_at(row, overshoot);

        let phi_target = rng.rnd() * row_sum;
        let row_cells = &self.phi_cdf[row * self.params.phi_width..(row + 1) * self.params.phi_width];
        let col = row_cells
            .partition_point(|&c| c <= phi_target)
            .min(self.params.phi_width - 1);
        let cell_start = if col == 0 { 0.0 } else { row_cells[col - 1] };
        let cell_weight = row_cells[col] - cell_start;
        let frac = if cell_weight > 0.0 {
            (phi_target - cell_start) / cell_weight
        } else {
            rng.rnd()
        };
        let phi = -PHI_SHIFT + (col as f64 + frac) * 2.0 * PI / self.params.phi_width as f64;
        (theta, phi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnglemapParams {
        AnglemapParams {
            record: true,
            phi_width: 8,
            theta_limit: PI / 4.0,
            theta_lower_res: 4,
            theta_higher_res: 2,
            ..Default::default()
        }
    }

    #[test]
    fn theta_bins_split_at_the_limit() {
        let p = params();
        assert_eq!(p.theta_bin(0.0), Some(0));
        assert_eq!(p.theta_bin(PI / 4.0 - 1e-9), Some(3));
        assert_eq!(p.theta_bin(PI / 4.0), Some(4));
        assert_eq!(p.theta_bin(PI / 2.0), Some(5));
    }

    #[test]
    fn phi_bins_cover_the_full_turn() {
        let p = params();
        assert_eq!(p.phi_bin(-PI), 0);
        assert_eq!(p.phi_bin(PI - 1e-9), p.phi_width - 1);
    }

    #[test]
    fn sampler_rejects_empty_maps() {
        let p = params();
        assert!(AngleMapSampler::new(&vec![0.0; p.map_size()], p).is_none());
    }

    #[test]
    fn sampler_reproduces_a_single_loaded_cell() {
        let p = params();
        let mut pdf = vec![0.0; p.map_size()];
        // all weight in theta row 1, phi column 5
        pdf[p.phi_width + 5] = 1.0;
        let sampler = AngleMapSampler::new(&pdf, p).unwrap();
        let mut rng = RandomGenerator::new(99);
        for _ in 0..200 {
            let (theta, phi) = sampler.sample(&mut rng);
            assert_eq!(p.theta_bin(theta), Some(1), "theta = {}", theta);
            assert_eq!(p.phi_bin(phi), 5, "phi = {}", phi);
        }
    }

    #[test]
    fn sampler_marginal_follows_row_weights() {
        let p = params();
        let mut pdf = vec![0.0; p.map_size()];
        for col in 0..p.phi_width {
            pdf[col] = 3.0; // row 0 three times as likely
            pdf[p.phi_width + col] = 1.0;
        }
        let sampler = AngleMapSampler::new(&pdf, p).unwrap();
        let mut rng = RandomGenerator::new(7);
        let mut row0 = 0;
        let n = 20_000;
        for _ in 0..n {
            let (theta, _) = sampler.sample(&mut rng);
            if p.theta_bin(theta) == Some(0) {
                row0 += 1;
            }
        }
        let fraction = row0 as f64 / n as f64;
        assert!((fraction - 0.75).abs() < 0.02, "fraction = {}", fraction);
    }
}
