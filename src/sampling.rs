//! Physical constants and the inverse-CDF samplers used by desorption:
//! Maxwell-Boltzmann speed distributions tabulated per temperature,
//! integrated desorption curves for time-dependent outgassing, and the
//! analytic mean-speed shortcut used when the Maxwell distribution is off.
//!
//! The numeric literals are kept exactly as established by long-standing
//! regression data; see the comments at each constant.

use crate::math::{interpolate_x, interpolate_y};

/// Boltzmann constant [J/K].
pub const BOLTZMANN: f64 = 1.38e-23;

/// sqrt(8*R/PI/0.001): mean thermal speed is `145.469 * sqrt(T/m)` with the
/// molar mass `m` in g/mol.
pub const MEAN_SPEED_FACTOR: f64 = 145.469;

/// `145.469^2 * (PI/8) * (3*PI/8)^2`-derived wall-collision constant: the
/// squared speed drawn for accommodation blending is `29369.939 * T/m`.
pub const WALL_SPEED_SQ_FACTOR: f64 = 29369.939;

/// 3*PI/8 / (PI/2): corrects volumetric speed moments to wall-collision
/// moments when sampling from the mean-speed shortcut instead of Maxwell.
pub const WALL_MOMENT_CORRECTION: f64 = 1.1781;

/// 1/ln(2), used to turn a half-life into an exponential decay draw.
pub const INV_LN2: f64 = 1.44269;

/// Number of support points tabulated per speed CDF.
const CDF_SIZE: usize = 100;

/// Mean thermal speed [m/s] for temperature `t` [K] and molar gas mass
/// `gas_mass` [g/mol].
#[inline]
pub fn mean_thermal_speed(t: f64, gas_mass: f64) -> f64 {
    MEAN_SPEED_FACTOR * (t / gas_mass).sqrt()
}

/// Tabulate the cumulative Maxwell-Boltzmann speed distribution for wall
/// collisions at temperature `t` [K]. Returns `(speed [m/s], cdf)` pairs with
/// cdf monotonically increasing to 1.
///
/// The distribution is integrated numerically; the support spans four times
/// the most probable speed, which carries >99.9% of the probability mass.
pub fn maxwell_speed_cdf(t: f64, gas_mass: f64) -> Vec<(f64, f64)> {
    // most probable speed: sqrt(2RT/M), with M in kg/mol
    let molar_mass = gas_mass * 1e-3;
    let v_p = (2.0 * 8.31446 * t / molar_mass).sqrt();
    let v_max = 4.0 * v_p;
    let dv = v_max / CDF_SIZE as f64;

    let pdf = |v: f64| {
        let a = molar_mass / (2.0 * 8.31446 * t);
        v * v * (-a * v * v).exp()
    };

    let mut table = Vec::with_capacity(CDF_SIZE);
    let mut cumulated = 0.0;
    let mut prev = 0.0;
    for i in 0..CDF_SIZE {
        let v = (i + 1) as f64 * dv;
        let density = pdf(v);
        cumulated += 0.5 * (prev + density) * dv;
        prev = density;
        table.push((v, cumulated));
    }
    // normalize so the inverse lookup sees a proper CDF
    let total = table[CDF_SIZE - 1].1;
    for entry in &mut table {
        entry.1 /= total;
    }
    table
}

/// Draw a speed from a tabulated CDF; the upper tail is extrapolated so a
/// random value of exactly 1 cannot truncate the distribution.
#[inline]
pub fn generate_velocity(cdf: &[(f64, f64)], r: f64) -> f64 {
    interpolate_x(r, cdf, true)
}

/// Integrate a time-dependent outgassing parameter into a cumulative
/// desorption curve over `[0, latest_moment]`: `(time, integrated outgassing)`
/// pairs, trapezoid rule over the parameter's own support points plus the
/// interval ends.
pub fn integrated_desorption(parameter: &[(f64, f64)], latest_moment: f64) -> Vec<(f64, f64)> {
    let mut times: Vec<f64> = vec![0.0];
    for &(t, _) in parameter {
        if t > 0.0 && t < latest_moment {
            times.push(t);
        }
    }
    times.push(latest_moment);
    times.sort_by(|a, b| a.partial_cmp(b).unwrap());
    times.dedup();

    let mut curve = Vec::with_capacity(times.len());
    let mut cumulated = 0.0;
    let mut prev_t = times[0];
    let mut prev_rate = interpolate_y(prev_t, parameter);
    curve.push((prev_t, 0.0));
    for &t in &times[1..] {
        let rate = interpolate_y(t, parameter);
        cumulated += 0.5 * (prev_rate + rate) * (t - prev_t);
        curve.push((t, cumulated));
        prev_t = t;
        prev_rate = rate;
    }
    curve
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maxwell_cdf_is_monotone_and_normalized() {
        let cdf = maxwell_speed_cdf(293.15, 28.0);
        for pair in cdf.windows(2) {
            assert!(pair[1].1 >= pair[0].1);
            assert!(pair[1].0 > pair[0].0);
        }
        assert!((cdf.last().unwrap().1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn maxwell_median_is_near_most_probable_speed() {
        // nitrogen at room temperature: most probable speed ~417 m/s,
        // the median of the wall distribution sits in the same range
        let cdf = maxwell_speed_cdf(293.15, 28.0);
        let median = generate_velocity(&cdf, 0.5);
        assert!(median > 300.0 && median < 700.0, "median = {}", median);
    }

    #[test]
    fn mean_speed_shortcut_matches_the_literal() {
        let v = mean_thermal_speed(293.15, 28.0);
        assert!((v - 145.469 * (293.15f64 / 28.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn integrated_desorption_of_constant_rate_is_linear() {
        let param = [(0.0, 2.0), (10.0, 2.0)];
        let id = integrated_desorption(&param, 10.0);
        let (t_end, total) = *id.last().unwrap();
        assert!((t_end - 10.0).abs() < 1e-12);
        assert!((total - 20.0).abs() < 1e-9);
    }
}
