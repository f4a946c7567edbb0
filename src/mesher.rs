//! Texture mesh construction for textured facets: a regular `tex_width x
//! tex_height` grid is clipped against the facet polygon so every cell knows
//! its exposed area and a representative interior point. Counters recorded
//! per cell are later normalized by these areas.

use crate::math::{is_in_poly, polygon_area, polygon_centroid};
use cgmath::Point2;

/// Tolerance for "clipped area exceeds the cell" detection; beyond it the
/// clip result cannot be trusted and the cell is re-measured by sampling.
const AREA_EXCESS_TOLERANCE: f64 = 1e-10;

/// Sub-sampling resolution of the brute-force fallback.
const BRUTE_FORCE_SAMPLES: usize = 50;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeshCell {
    /// Exposed cell area in world units (cm2).
    pub area: f64,
    /// Representative point inside the clipped cell, facet-normalized u.
    pub u_center: f64,
    /// Representative point inside the clipped cell, facet-normalized v.
    pub v_center: f64,
    /// Whether the cell lies entirely inside the facet polygon.
    pub full: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TextureMesh {
    pub cells: Vec<MeshCell>,
    /// Clipped cell outline in (u,v), for consumers that render the mesh.
    /// `None` for cells entirely outside the facet.
    pub cell_polygons: Vec<Option<Vec<Point2<f64>>>>,
    pub nb_elem: usize,
}

impl TextureMesh {
    pub fn total_area(&self) -> f64 {
        self.cells.iter().map(|c| c.area).sum()
    }
}

/// Clip `subject` against the half-plane `keep(p) >= 0`, where the boundary
/// point between an inside and an outside vertex is found by linear
/// interpolation. One pass of Sutherland-Hodgman.
fn clip_against_edge<F, G>(subject: &[Point2<f64>], keep: F, intersect: G) -> Vec<Point2<f64>>
where
    F: Fn(Point2<f64>) -> bool,
    G: Fn(Point2<f64>, Point2<f64>) -> Point2<f64>,
{
    let mut output = Vec::with_capacity(subject.len() + 4);
    if subject.is_empty() {
        return output;
    }
    let mut prev = subject[subject.len() - 1];
    let mut prev_in = keep(prev);
    for &current in subject {
        let current_in = keep(current);
        if current_in {
            if !prev_in {
                output.push(intersect(prev, current));
            }
            output.push(current);
        } else if prev_in {
            output.push(intersect(prev, current));
        }
        prev = current;
        prev_in = current_in;
    }
    output
}

/// Clip a polygon against the axis-aligned rectangle `[u0,u1] x [v0,v1]`.
pub fn clip_to_rect(subject: &[Point2<f64>], u0: f64, v0: f64, u1: f64, v1: f64) -> Vec<Point2<f64>> {
    let lerp_u = |a: Point2<f64>, b: Point2<f64>, u: f64| {
        let t = (u - a.x) / (b.x - a.x);
        Point2::new(u, a.y + t * (b.y - a.y))
    };
    let lerp_v = |a: Point2<f64>, b: Point2<f64>, v: f64| {
        let t = (v - a.y) / (b.y - a.y);
        Point2::new(a.x + t * (b.x - a.x), v)
    };

    let mut poly = clip_against_edge(subject, |p| p.x >= u0, |a, b| lerp_u(a, b, u0));
    poly = clip_against_edge(&poly, |p| p.x <= u1, |a, b| lerp_u(a, b, u1));
    poly = clip_against_edge(&poly, |p| p.y >= v0, |a, b| lerp_v(a, b, v0));
    poly = clip_against_edge(&poly, |p| p.y <= v1, |a, b| lerp_v(a, b, v1));
    poly
}

/// Dense-sampling area and centroid estimate of `polygon ∩ cell`, used when
/// the clip result is inconsistent (self-intersecting facet outline).
fn brute_force_cell_area(
    polygon: &[Point2<f64>],
    u0: f64,
    v0: f64,
    u1: f64,
    v1: f64,
) -> (f64, f64, f64) {
    let mut inside = 0usize;
    let mut cu = 0.0;
    let mut cv = 0.0;
    let inv = 1.0 / BRUTE_FORCE_SAMPLES as f64;
    for j in 0..BRUTE_FORCE_SAMPLES {
        let v = v0 + (j as f64 + 0.5) * inv * (v1 - v0);
        for i in 0..BRUTE_FORCE_SAMPLES {
            let u = u0 + (i as f64 + 0.5) * inv * (u1 - u0);
            if is_in_poly(u, v, polygon) {
                inside += 1;
                cu += u;
                cv += v;
            }
        }
    }
    if inside == 0 {
        return (0.0, 0.0, 0.0);
    }
    let fraction = inside as f64 * inv * inv;
    (
        fraction * (u1 - u0) * (v1 - v0),
        cu / inside as f64,
        cv / inside as f64,
    )
}

/// Build the texture mesh of a facet.
///
/// `vertices2` is the facet outline in normalized (u,v) in `[0,1]`;
/// `u_length`/`v_length` are the world-space lengths of the spanning vectors,
/// so a full cell has area `u_length*v_length/(tex_width_d*tex_height_d)`.
pub fn build_mesh(
    vertices2: &[Point2<f64>],
    u_length: f64,
    v_length: f64,
    tex_width: usize,
    tex_height: usize,
    tex_width_d: f64,
    tex_height_d: f64,
) -> TextureMesh {
    let iw = 1.0 / tex_width_d;
    let ih = 1.0 / tex_height_d;
    let rw = u_length * iw;
    let rh = v_length * ih;
    let full_cell_area_uv = iw * ih;

    let mut mesh = TextureMesh {
        cells: vec![MeshCell::default(); tex_width * tex_height],
        cell_polygons: vec![None; tex_width * tex_height],
        nb_elem: 0,
    };

    for j in 0..tex_height {
        for i in 0..tex_width {
            let u0 = i as f64 * iw;
            let v0 = j as f64 * ih;
            let u1 = (i as f64 + 1.0) * iw;
            let v1 = (j as f64 + 1.0) * ih;
            let idx = i + j * tex_width;

            // quad/triangle facets: all four corners inside means full cell
            let all_inside = vertices2.len() <= 4
                && is_in_poly(u0, v0, vertices2)
                && is_in_poly(u0, v1, vertices2)
                && is_in_poly(u1, v0, vertices2)
                && is_in_poly(u1, v1, vertices2);

            if all_inside {
                mesh.cells[idx] = MeshCell {
                    area: rw * rh,
                    u_center: 0.5 * (u0 + u1),
                    v_center: 0.5 * (v0 + v1),
                    full: true,
                };
                mesh.cell_polygons[idx] = Some(vec![
                    Point2::new(u0, v0),
                    Point2::new(u1, v0),
                    Point2::new(u1, v1),
                    Point2::new(u0, v1),
                ]);
                mesh.nb_elem += 1;
                continue;
            }

            let clipped = clip_to_rect(vertices2, u0, v0, u1, v1);
            let mut area_uv = polygon_area(&clipped);
            if area_uv < 1e-30 {
                continue;
            }

            if area_uv > full_cell_area_uv + AREA_EXCESS_TOLERANCE {
                // clipping produced an impossible area, re-measure
                let (a, cu, cv) = brute_force_cell_area(vertices2, u0, v0, u1, v1);
                area_uv = a;
                if area_uv < 1e-30 {
                    continue;
                }
                mesh.cells[idx] = MeshCell {
                    area: area_uv * (rw * rh) / (iw * ih),
                    u_center: cu,
                    v_center: cv,
                    full: (full_cell_area_uv - area_uv).abs() < AREA_EXCESS_TOLERANCE,
                };
            } else {
                let centroid = polygon_centroid(&clipped);
                mesh.cells[idx] = MeshCell {
                    area: area_uv * (rw * rh) / (iw * ih),
                    u_center: centroid.x,
                    v_center: centroid.y,
                    full: (full_cell_area_uv - area_uv).abs() < AREA_EXCESS_TOLERANCE,
                };
                mesh.cell_polygons[idx] = Some(clipped);
            }
            mesh.nb_elem += 1;
        }
    }

    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point2<f64>> {
        vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ]
    }

    fn triangle() -> Vec<Point2<f64>> {
        vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ]
    }

    #[test]
    fn square_mesh_cells_are_all_full() {
        let mesh = build_mesh(&square(), 2.0, 2.0, 4, 4, 4.0, 4.0);
        assert_eq!(mesh.nb_elem, 16);
        for cell in &mesh.cells {
            assert!(cell.full);
            assert!((cell.area - 4.0 / 16.0).abs() < 1e-12);
        }
        assert!((mesh.total_area() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn triangle_mesh_area_matches_polygon_area() {
        let mesh = build_mesh(&triangle(), 3.0, 3.0, 8, 8, 8.0, 8.0);
        // triangle covers half the unit square -> half the facet plane area
        assert!((mesh.total_area() - 0.5 * 9.0).abs() < 1e-6);
    }

    #[test]
    fn diagonal_cells_are_partial() {
        let mesh = build_mesh(&triangle(), 1.0, 1.0, 4, 4, 4.0, 4.0);
        // a cell crossed by the hypotenuse keeps half its area
        let cell = mesh.cells[3 + 0 * 4]; // top-right of the bottom row
        assert!(!cell.full);
        assert!(cell.area < 1.0 / 16.0);
    }

    #[test]
    fn representative_points_lie_inside_the_facet() {
        let poly = triangle();
        let mesh = build_mesh(&poly, 1.0, 1.0, 6, 6, 6.0, 6.0);
        for cell in mesh.cells.iter().filter(|c| c.area > 0.0) {
            assert!(
                is_in_poly(cell.u_center, cell.v_center, &poly),
                "({}, {}) escaped the polygon",
                cell.u_center,
                cell.v_center
            );
        }
    }

    #[test]
    fn clip_to_rect_keeps_interior() {
        let clipped = clip_to_rect(&square(), 0.25, 0.25, 0.75, 0.75);
        assert!((polygon_area(&clipped) - 0.25).abs() < 1e-12);
    }
}
