//! Small numeric helpers shared by the samplers, the mesher and the
//! transport loop: table interpolation, direction transforms and 2D
//! polygon tests in facet-local (u,v) coordinates.

use cgmath::{InnerSpace, Point2, Vector3};

pub type Vec3 = Vector3<f64>;

/// Index of the cumulative bin that `value` falls into.
///
/// `cumulative` is a running sum; bin `i` covers `(cumulative[i-1], cumulative[i]]`.
pub fn cumulative_bin(value: f64, cumulative: &[f64]) -> usize {
    cumulative.partition_point(|&c| c <= value).min(cumulative.len().saturating_sub(1))
}

/// Inverse table lookup: given a value on the Y axis of a monotone `(x, y)`
/// table, interpolate the corresponding X. Used to invert cumulative
/// distributions (speed CDFs, integrated desorption curves).
///
/// Below the table the first X is returned; above it the last segment is
/// extrapolated when `allow_extrapolate` is set, otherwise the last X.
pub fn interpolate_x(look_up_y: f64, table: &[(f64, f64)], allow_extrapolate: bool) -> f64 {
    assert!(!table.is_empty());
    if table.len() == 1 || look_up_y <= table[0].1 {
        return table[0].0;
    }
    let last = table.len() - 1;
    if look_up_y >= table[last].1 {
        if allow_extrapolate {
            let (x0, y0) = table[last - 1];
            let (x1, y1) = table[last];
            if (y1 - y0).abs() < f64::EPSILON {
                return x1;
            }
            return x1 + (look_up_y - y1) * (x1 - x0) / (y1 - y0);
        }
        return table[last].0;
    }
    let upper = table.partition_point(|&(_, y)| y < look_up_y).max(1);
    let (x0, y0) = table[upper - 1];
    let (x1, y1) = table[upper];
    if (y1 - y0).abs() < f64::EPSILON {
        return x0;
    }
    x0 + (look_up_y - y0) * (x1 - x0) / (y1 - y0)
}

/// Forward table lookup: interpolate Y for a given X in a table sorted by X.
/// Used to evaluate time-dependent parameters (sticking, opacity, outgassing).
pub fn interpolate_y(look_up_x: f64, table: &[(f64, f64)]) -> f64 {
    assert!(!table.is_empty());
    if table.len() == 1 || look_up_x <= table[0].0 {
        return table[0].1;
    }
    let last = table.len() - 1;
    if look_up_x >= table[last].0 {
        return table[last].1;
    }
    let upper = table.partition_point(|&(x, _)| x < look_up_x).max(1);
    let (x0, y0) = table[upper - 1];
    let (x1, y1) = table[upper];
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (look_up_x - x0) * (y1 - y0) / (x1 - x0)
}

/// Build a world-space unit vector from polar angles in a facet frame.
///
/// `theta` is measured from the normal, `phi` around it in the (nu, nv)
/// plane. `reverse` flips the normal component for emission from the back
/// side of a two-sided facet.
pub fn polar_to_cartesian(nu: Vec3, nv: Vec3, n: Vec3, theta: f64, phi: f64, reverse: bool) -> Vec3 {
    let u = theta.sin() * phi.cos();
    let v = theta.sin() * phi.sin();
    let mut w = theta.cos();
    if reverse {
        w = -w;
    }
    (u * nu + v * nv + w * n).normalize()
}

/// Decompose a world-space direction into `(theta, phi)` in a facet frame.
/// `theta` in `[0, PI]` from the normal, `phi` in `[-PI, PI]`.
pub fn cartesian_to_polar(direction: Vec3, nu: Vec3, nv: Vec3, n: Vec3) -> (f64, f64) {
    let u = direction.dot(nu);
    let v = direction.dot(nv);
    let w = direction.dot(n).clamp(-1.0, 1.0);
    (w.acos(), v.atan2(u))
}

/// Crossing-number point-in-polygon test in (u,v) coordinates.
pub fn is_in_poly(u: f64, v: f64, pts: &[Point2<f64>]) -> bool {
    let mut inside = false;
    let n = pts.len();
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (pts[i], pts[j]);
        if (pi.y > v) != (pj.y > v) {
            let slope_u = (pj.x - pi.x) * (v - pi.y) / (pj.y - pi.y) + pi.x;
            if u < slope_u {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Unsigned shoelace area.
pub fn polygon_area(pts: &[Point2<f64>]) -> f64 {
    if pts.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    let mut j = pts.len() - 1;
    for i in 0..pts.len() {
        twice_area += (pts[j].x + pts[i].x) * (pts[j].y - pts[i].y);
        j = i;
    }
    (twice_area * 0.5).abs()
}

/// Area centroid of a simple polygon. Falls back to the vertex mean for
/// degenerate (zero-area) input.
pub fn polygon_centroid(pts: &[Point2<f64>]) -> Point2<f64> {
    let mut signed_area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    let mut j = pts.len() - 1;
    for i in 0..pts.len() {
        let cross = pts[j].x * pts[i].y - pts[i].x * pts[j].y;
        signed_area += cross;
        cx += (pts[j].x + pts[i].x) * cross;
        cy += (pts[j].y + pts[i].y) * cross;
        j = i;
    }
    if signed_area.abs() < 1e-30 {
        let inv = 1.0 / pts.len() as f64;
        let mut mx = 0.0;
        let mut my = 0.0;
        for p in pts {
            mx += p.x;
            my += p.y;
        }
        return Point2::new(mx * inv, my * inv);
    }
    signed_area *= 0.5;
    Point2::new(cx / (6.0 * signed_area), cy / (6.0 * signed_area))
}
