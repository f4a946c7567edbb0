//! Model snapshot loading. The simulator consumes a JSON model description
//! (geometry parsers for interchange formats live outside the core); the
//! loader computes everything derived: facet frames and 2D projections,
//! texture meshes, speed CDFs per temperature and integrated desorption
//! curves for time-dependent outgassing.

use crate::anglemap::{AngleMapSampler, AnglemapParams};
use crate::math::{polygon_area, polygon_centroid, Vec3};
use crate::mesher::build_mesh;
use crate::model::{
    DesorbType, Facet, HistogramParams, Model, Moment, MotionType, OntheflyParams, OutgassingMap,
    ParameterTable, ProfileType, Reflection, Structure, Teleport, TimeDependentParams, WorldParams,
};
use crate::sampling::{integrated_desorption, maxwell_speed_cdf, mean_thermal_speed, BOLTZMANN};
use crate::SimulationError;
use cgmath::{InnerSpace, Point2, Vector3};
use enumflags2::BitFlags;
use log::info;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn default_opacity() -> f64 {
    1.0
}

fn default_temperature() -> f64 {
    293.15
}

fn default_accomodation() -> f64 {
    1.0
}

fn default_diffuse() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionDescription {
    #[serde(default = "default_diffuse")]
    pub diffuse: f64,
    #[serde(default)]
    pub specular: f64,
    #[serde(default)]
    pub cosine_exponent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextureDescription {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub count_desorb: bool,
    #[serde(default)]
    pub count_absorb: bool,
    #[serde(default)]
    pub count_reflect: bool,
    #[serde(default)]
    pub count_transparent: bool,
    #[serde(default)]
    pub count_ac_density: bool,
    #[serde(default)]
    pub count_direction: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutgassingMapDescription {
    pub width: usize,
    pub height: usize,
    /// Per-cell outgassing [Pa·m3/s], row-major.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SojournDescription {
    pub frequency: f64,
    pub binding_energy: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnglemapDescription {
    #[serde(flatten)]
    pub params: AnglemapParams,
    /// Imported incidence PDF for angle-map desorption, row-major by theta.
    #[serde(default)]
    pub pdf: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacetDescription {
    pub indices: Vec<usize>,
    #[serde(default)]
    pub sticking: f64,
    #[serde(default)]
    pub sticking_param: Option<usize>,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub opacity_param: Option<usize>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_accomodation")]
    pub accomodation_factor: f64,
    #[serde(default)]
    pub two_sided: bool,
    #[serde(default)]
    pub is_moving: bool,
    #[serde(default)]
    pub desorb_type: DesorbType,
    #[serde(default)]
    pub desorb_type_n: f64,
    #[serde(default)]
    pub reflection: Option<ReflectionDescription>,
    #[serde(default)]
    pub outgassing: f64,
    #[serde(default)]
    pub outgassing_param: Option<usize>,
    #[serde(default)]
    pub outgassing_map: Option<OutgassingMapDescription>,
    /// Owning structure index; -1 puts the facet in every structure.
    #[serde(default)]
    pub structure: i64,
    /// Link facet destination structure.
    #[serde(default)]
    pub link_to: Option<usize>,
    /// 0 = ordinary, -1 = back to the previous teleport source,
    /// n = teleport to facet n (1-based, the on-disk convention).
    #[serde(default)]
    pub teleport: i64,
    #[serde(default)]
    pub is_volatile: bool,
    #[serde(default)]
    pub texture: Option<TextureDescription>,
    #[serde(default)]
    pub profile: ProfileType,
    #[serde(default)]
    pub sojourn: Option<SojournDescription>,
    #[serde(default)]
    pub anglemap: Option<AnglemapDescription>,
    #[serde(default)]
    pub histogram: HistogramParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorldDescription {
    pub gas_mass: f64,
    pub use_maxwell_distribution: bool,
    pub latest_moment: f64,
    pub half_life: f64,
    pub enable_decay: bool,
    pub motion_type: MotionType,
    pub motion_vector1: [f64; 3],
    pub motion_vector2: [f64; 3],
    pub calc_constant_flow: bool,
    pub histogram: HistogramParams,
}

impl Default for WorldDescription {
    fn default() -> Self {
        WorldDescription {
            gas_mass: 28.0,
            use_maxwell_distribution: true,
            latest_moment: 0.1,
            half_life: 0.0,
            enable_decay: false,
            motion_type: MotionType::None,
            motion_vector1: [0.0; 3],
            motion_vector2: [0.0; 3],
            calc_constant_flow: true,
            histogram: HistogramParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OntheflyDescription {
    pub desorption_limit: u64,
    pub low_flux_mode: bool,
    pub low_flux_cutoff: Option<f64>,
    pub enable_logging: bool,
    pub log_facet_id: usize,
    pub log_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescription {
    #[serde(default)]
    pub name: String,
    pub vertices: Vec<[f64; 3]>,
    #[serde(default)]
    pub structures: Vec<String>,
    pub facets: Vec<FacetDescription>,
    #[serde(default)]
    pub parameters: Vec<ParameterTable>,
    #[serde(default)]
    pub moments: Vec<Moment>,
    #[serde(default)]
    pub world: WorldDescription,
    #[serde(default)]
    pub onthefly: OntheflyDescription,
}

pub fn load_model(path: &Path) -> Result<Model, SimulationError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let description: ModelDescription = serde_json::from_reader(reader)?;
    model_from_description(description)
}

/// Load a moments override file: a JSON array of `{time, window}`.
pub fn load_moments(path: &Path) -> Result<Vec<Moment>, SimulationError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

struct FacetFrame {
    o: Vec3,
    u: Vec3,
    v: Vec3,
    n: Vec3,
    nu: Vec3,
    nv: Vec3,
    vertices2: Vec<Point2<f64>>,
    area: f64,
    center: Vec3,
}

/// Compute the local frame of a facet polygon: Newell normal, first edge as
/// the u direction, bounding rectangle in the plane as the (U, V) span, and
/// the outline normalized to [0,1]^2.
fn compute_frame(vertices: &[Vec3], facet_id: usize) -> Result<FacetFrame, SimulationError> {
    if vertices.len() < 3 {
        return Err(SimulationError::Load(format!(
            "facet #{} has fewer than 3 vertices",
            facet_id + 1
        )));
    }
    let mut normal = Vector3::new(0.0, 0.0, 0.0);
    for i in 0..vertices.len() {
        let a = vertices[i];
        let b = vertices[(i + 1) % vertices.len()];
        normal.x += (a.y - b.y) * (a.z + b.z);
        normal.y += (a.z - b.z) * (a.x + b.x);
        normal.z += (a.x - b.x) * (a.y + b.y);
    }
    if normal.magnitude() < 1e-12 {
        return Err(SimulationError::Load(format!(
            "facet #{} is degenerate (zero normal)",
            facet_id + 1
        )));
    }
    let n = normal.normalize();

    let first_edge = vertices[1] - vertices[0];
    let eu = (first_edge - n * first_edge.dot(n)).normalize();
    let ev = n.cross(eu);

    let origin = vertices[0];
    let projected: Vec<Point2<f64>> = vertices
        .iter()
        .map(|&p| {
            let d = p - origin;
            Point2::new(d.dot(eu), d.dot(ev))
        })
        .collect();

    let (mut u_min, mut u_max) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut v_min, mut v_max) = (f64::INFINITY, f64::NEG_INFINITY);
    for p in &projected {
        u_min = u_min.min(p.x);
        u_max = u_max.max(p.x);
        v_min = v_min.min(p.y);
        v_max = v_max.max(p.y);
    }
    let u_extent = u_max - u_min;
    let v_extent = v_max - v_min;
    if u_extent < 1e-12 || v_extent < 1e-12 {
        return Err(SimulationError::Load(format!(
            "facet #{} collapses to a line in its plane",
            facet_id + 1
        )));
    }

    let vertices2: Vec<Point2<f64>> = projected
        .iter()
        .map(|p| Point2::new((p.x - u_min) / u_extent, (p.y - v_min) / v_extent))
        .collect();
    let area = polygon_area(&projected);
    let o = origin + u_min * eu + v_min * ev;
    let u = eu * u_extent;
    let v = ev * v_extent;
    let centroid = polygon_centroid(&vertices2);
    let center = o + centroid.x * u + centroid.y * v;

    Ok(FacetFrame {
        o,
        u,
        v,
        n,
        nu: eu,
        nv: ev,
        vertices2,
        area,
        center,
    })
}

/// Speed-CDF arena: one table per distinct facet temperature.
#[derive(Default)]
struct CdfArena {
    temperatures: Vec<f64>,
    tables: Vec<Vec<(f64, f64)>>,
}

impl CdfArena {
    fn id_for(&mut self, temperature: f64, gas_mass: f64) -> usize {
        if let Some(pos) = self
            .temperatures
            .iter()
            .position(|&t| (t - temperature).abs() < 1e-9)
        {
            return pos;
        }
        self.temperatures.push(temperature);
        self.tables.push(maxwell_speed_cdf(temperature, gas_mass));
        self.tables.len() - 1
    }
}

pub fn model_from_description(description: ModelDescription) -> Result<Model, SimulationError> {
    let vertices: Vec<Vec3> = description
        .vertices
        .iter()
        .map(|v| Vector3::new(v[0], v[1], v[2]))
        .collect();

    let structure_names = if description.structures.is_empty() {
        vec!["structure 1".to_string()]
    } else {
        description.structures.clone()
    };
    let nb_structures = structure_names.len();

    let wp = WorldParams {
        gas_mass: description.world.gas_mass,
        use_maxwell_distribution: description.world.use_maxwell_distribution,
        latest_moment: description.world.latest_moment,
        half_life: description.world.half_life,
        enable_decay: description.world.enable_decay,
        motion_type: description.world.motion_type,
        motion_vector1: Vector3::from(description.world.motion_vector1),
        motion_vector2: Vector3::from(description.world.motion_vector2),
        total_desorbed_molecules: 0.0,
        final_outgassing_rate: 0.0,
        calc_constant_flow: description.world.calc_constant_flow,
        global_histogram_params: description.world.histogram,
    };

    let default_otf = OntheflyParams::default();
    let otf = OntheflyParams {
        desorption_limit: description.onthefly.desorption_limit,
        low_flux_mode: description.onthefly.low_flux_mode,
        low_flux_cutoff: description
            .onthefly
            .low_flux_cutoff
            .unwrap_or(default_otf.low_flux_cutoff),
        enable_logging: description.onthefly.enable_logging,
        log_facet_id: description.onthefly.log_facet_id,
        log_limit: description.onthefly.log_limit,
    };

    let mut cdf_arena = CdfArena::default();
    let mut ids: Vec<Vec<(f64, f64)>> = Vec::new();
    let mut id_of_param: Vec<Option<usize>> = vec![None; description.parameters.len()];
    let mut facets = Vec::with_capacity(description.facets.len());
    let nb_facets = description.facets.len();

    for (facet_id, fd) in description.facets.into_iter().enumerate() {
        for &index in &fd.indices {
            if index >= vertices.len() {
                return Err(SimulationError::Load(format!(
                    "facet #{} references vertex {} out of {}",
                    facet_id + 1,
                    index,
                    vertices.len()
                )));
            }
        }
        let corner_points: Vec<Vec3> = fd.indices.iter().map(|&i| vertices[i]).collect();
        let frame = compute_frame(&corner_points, facet_id)?;

        let super_idx = if fd.structure < 0 {
            None
        } else {
            let s = fd.structure as usize;
            if s >= nb_structures {
                return Err(SimulationError::Load(format!(
                    "facet #{} references structure {} out of {}",
                    facet_id + 1,
                    s,
                    nb_structures
                )));
            }
            Some(s)
        };
        if let Some(dest) = fd.link_to {
            if dest >= nb_structures {
                return Err(SimulationError::Load(format!(
                    "facet #{} links to structure {} out of {}",
                    facet_id + 1,
                    dest,
                    nb_structures
                )));
            }
        }
        let teleport_dest = match fd.teleport {
            0 => Teleport::None,
            -1 => Teleport::Back,
            n if n > 0 && (n as usize) <= nb_facets => Teleport::To(n as usize - 1),
            n => {
                return Err(SimulationError::Load(format!(
                    "facet #{} teleports to nonexistent facet {}",
                    facet_id + 1,
                    n
                )))
            }
        };
        if teleport_dest != Teleport::None && fd.link_to.is_some() {
            return Err(SimulationError::Load(format!(
                "facet #{} is both a teleport and a link facet",
                facet_id + 1
            )));
        }

        // texture mesh
        let (is_textured, tex_width, tex_height, tex_width_d, tex_height_d) = match &fd.texture {
            Some(t) if t.width * t.height > 0.0000001 => (
                true,
                // cut rounding error 1.00000001 to 1, not 2
                (t.width * 0.9999999).ceil() as usize,
                (t.height * 0.9999999).ceil() as usize,
                t.width,
                t.height,
            ),
            _ => (false, 0, 0, 0.0, 0.0),
        };
        let mut count_flags = BitFlags::<crate::model::CountFlag>::empty();
        if let Some(t) = &fd.texture {
            use crate::model::CountFlag::*;
            if t.count_desorb {
                count_flags |= Desorb;
            }
            if t.count_absorb {
                count_flags |= Absorb;
            }
            if t.count_reflect {
                count_flags |= Reflect;
            }
            if t.count_transparent {
                count_flags |= Transparent;
            }
            if t.count_ac_density {
                count_flags |= AcDensity;
            }
            if t.count_direction {
                count_flags |= Direction;
            }
        }

        let (mesh, texture_cell_increments, large_enough) = if is_textured {
            let mesh = build_mesh(
                &frame.vertices2,
                frame.u.magnitude(),
                frame.v.magnitude(),
                tex_width,
                tex_height,
                tex_width_d,
                tex_height_d,
            );
            let full_size_inc =
                (tex_width_d * tex_height_d) / (frame.u.magnitude() * frame.v.magnitude());
            let increments: Vec<f64> = mesh
                .cells
                .iter()
                .map(|c| if c.area > 0.0 { 1.0 / c.area } else { 0.0 })
                .collect();
            let large: Vec<bool> = increments
                .iter()
                .map(|&inc| inc > 0.0 && inc < 5.0 * full_size_inc)
                .collect();
            (Some(mesh), increments, large)
        } else {
            (None, Vec::new(), Vec::new())
        };

        let outgassing_map = match fd.outgassing_map {
            Some(m) => {
                if m.values.len() != m.width * m.height {
                    return Err(SimulationError::Load(format!(
                        "facet #{} outgassing map size mismatch: {} cells for {}x{}",
                        facet_id + 1,
                        m.values.len(),
                        m.width,
                        m.height
                    )));
                }
                let mut cumulative = Vec::with_capacity(m.values.len());
                let mut sum = 0.0;
                for v in &m.values {
                    sum += v.max(0.0);
                    cumulative.push(sum);
                }
                Some(OutgassingMap {
                    width: m.width,
                    height: m.height,
                    width_d: m.width as f64,
                    height_d: m.height as f64,
                    cumulative,
                })
            }
            None => None,
        };
        let total_outgassing = outgassing_map.as_ref().map(|m| m.total()).unwrap_or(0.0);

        // integrated desorption for time-dependent outgassing
        let id_id = match fd.outgassing_param {
            Some(param_id) => {
                if param_id >= description.parameters.len() {
                    return Err(SimulationError::Load(format!(
                        "facet #{} references parameter {} out of {}",
                        facet_id + 1,
                        param_id,
                        description.parameters.len()
                    )));
                }
                Some(*id_of_param[param_id].get_or_insert_with(|| {
                    ids.push(integrated_desorption(
                        &description.parameters[param_id].values,
                        wp.latest_moment,
                    ));
                    ids.len() - 1
                }))
            }
            None => None,
        };

        let anglemap_params = fd
            .anglemap
            .as_ref()
            .map(|a| a.params)
            .unwrap_or_default();
        let anglemap = match (&fd.anglemap, fd.desorb_type) {
            (Some(a), DesorbType::AngleMap) => {
                match AngleMapSampler::new(&a.pdf, a.params) {
                    Some(sampler) => Some(sampler),
                    None => {
                        return Err(SimulationError::Load(format!(
                            "facet #{} desorbs from an angle map but its map is empty",
                            facet_id + 1
                        )))
                    }
                }
            }
            (None, DesorbType::AngleMap) => {
                return Err(SimulationError::Load(format!(
                    "facet #{} desorbs from an angle map but has none",
                    facet_id + 1
                )))
            }
            _ => None,
        };

        let reflection = fd
            .reflection
            .map(|r| Reflection {
                diffuse_part: r.diffuse,
                specular_part: r.specular,
                cosine_exponent: r.cosine_exponent,
            })
            .unwrap_or_default();

        let cdf_id = cdf_arena.id_for(fd.temperature, wp.gas_mass);

        facets.push(Facet {
            global_id: facet_id,
            o: frame.o,
            u: frame.u,
            v: frame.v,
            n: frame.n,
            nu: frame.nu,
            nv: frame.nv,
            center: frame.center,
            area: frame.area,
            vertices2: frame.vertices2,
            sticking: fd.sticking,
            sticking_param: fd.sticking_param,
            opacity: fd.opacity.clamp(0.0, 1.0),
            opacity_param: fd.opacity_param,
            temperature: fd.temperature,
            accomodation_factor: fd.accomodation_factor,
            two_sided: fd.two_sided,
            is_moving: fd.is_moving,
            desorb_type: fd.desorb_type,
            desorb_type_n: fd.desorb_type_n,
            reflection,
            enable_sojourn_time: fd.sojourn.is_some(),
            sojourn_freq: fd.sojourn.as_ref().map(|s| s.frequency).unwrap_or(0.0),
            sojourn_e: fd.sojourn.as_ref().map(|s| s.binding_energy).unwrap_or(0.0),
            outgassing: fd.outgassing,
            outgassing_param: fd.outgassing_param,
            id_id,
            outgassing_map,
            total_outgassing,
            cdf_id,
            super_idx,
            super_dest: fd.link_to,
            teleport_dest,
            is_volatile: fd.is_volatile,
            is_textured,
            tex_width,
            tex_height,
            tex_width_d,
            tex_height_d,
            count_flags,
            mesh,
            texture_cell_increments,
            large_enough,
            profile_type: fd.profile,
            max_speed: 4.0 * mean_thermal_speed(fd.temperature, wp.gas_mass),
            anglemap_params,
            anglemap,
            histogram_params: fd.histogram,
        });
    }

    let structures: Vec<Structure> = structure_names
        .into_iter()
        .enumerate()
        .map(|(s, name)| Structure {
            name,
            facet_ids: facets
                .iter()
                .filter(|f| f.super_idx.is_none() || f.super_idx == Some(s))
                .map(|f| f.global_id)
                .collect(),
        })
        .collect();

    let has_volatile = facets.iter().any(|f| f.is_volatile);

    let mut model = Model {
        name: description.name,
        vertices,
        structures,
        facets,
        td: TimeDependentParams {
            cdfs: cdf_arena.tables,
            ids,
            moments: description.moments,
            parameters: description.parameters,
        },
        wp,
        otf,
        has_volatile,
        initialized: true,
    };

    model.wp.total_desorbed_molecules = model
        .facets
        .iter()
        .map(|f| model.desorption_weight(f))
        .sum();
    model.wp.final_outgassing_rate = model
        .facets
        .iter()
        .filter(|f| f.desorb_type != DesorbType::None)
        .map(|f| {
            let kt = BOLTZMANN * f.temperature;
            if let Some(map) = &f.outgassing_map {
                map.total() / kt
            } else if let Some(param_id) = f.outgassing_param {
                model.td.parameters[param_id].value_at(model.wp.latest_moment) / kt
            } else {
                f.outgassing / kt
            }
        })
        .sum();

    info!(
        "model '{}': {} vertices, {} facets, {} structures, {} moments",
        model.name,
        model.vertices.len(),
        model.facets.len(),
        model.structures.len(),
        model.td.moments.len()
    );

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::InnerSpace;

    fn square_facet_description() -> ModelDescription {
        serde_json::from_str(
            r#"{
                "vertices": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]],
                "facets": [{"indices": [0,1,2,3], "desorb_type": "cosine", "outgassing": 1e-3}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn square_facet_frame_is_orthonormal_and_unit() {
        let model = model_from_description(square_facet_description()).unwrap();
        let f = &model.facets[0];
        assert!((f.n.magnitude() - 1.0).abs() < 1e-12);
        assert!(f.n.dot(f.nu).abs() < 1e-12);
        assert!(f.nu.dot(f.nv).abs() < 1e-12);
        assert!((f.area - 1.0).abs() < 1e-12);
        assert!((f.u.magnitude() - 1.0).abs() < 1e-12);
        for p in &f.vertices2 {
            assert!((-1e-12..=1.0 + 1e-12).contains(&p.x));
            assert!((-1e-12..=1.0 + 1e-12).contains(&p.y));
        }
    }

    #[test]
    fn desorbing_facet_contributes_to_the_normalizer() {
        let model = model_from_description(square_facet_description()).unwrap();
        let expected =
            model.wp.latest_moment * 1e-3 / (BOLTZMANN * model.facets[0].temperature);
        assert!((model.wp.total_desorbed_molecules - expected).abs() < expected * 1e-12);
        assert!(model.wp.final_outgassing_rate > 0.0);
    }

    #[test]
    fn bad_vertex_reference_is_refused() {
        let description: ModelDescription = serde_json::from_str(
            r#"{
                "vertices": [[0,0,0],[1,0,0],[1,1,0]],
                "facets": [{"indices": [0,1,9]}]
            }"#,
        )
        .unwrap();
        assert!(model_from_description(description).is_err());
    }

    #[test]
    fn teleport_and_link_are_mutually_exclusive() {
        let description: ModelDescription = serde_json::from_str(
            r#"{
                "vertices": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]],
                "structures": ["a", "b"],
                "facets": [{"indices": [0,1,2,3], "teleport": 1, "link_to": 1}]
            }"#,
        )
        .unwrap();
        assert!(model_from_description(description).is_err());
    }

    #[test]
    fn textured_facet_gets_mesh_and_increments() {
        let description: ModelDescription = serde_json::from_str(
            r#"{
                "vertices": [[0,0,0],[2,0,0],[2,2,0],[0,2,0]],
                "facets": [{"indices": [0,1,2,3],
                            "texture": {"width": 4, "height": 4, "count_reflect": true}}]
            }"#,
        )
        .unwrap();
        let model = model_from_description(description).unwrap();
        let f = &model.facets[0];
        assert!(f.is_textured);
        assert_eq!(f.tex_width, 4);
        assert_eq!(f.texture_cell_increments.len(), 16);
        // full cell of a 2x2 facet on a 4x4 grid has area 0.25
        for (inc, cell) in f
            .texture_cell_increments
            .iter()
            .zip(&f.mesh.as_ref().unwrap().cells)
        {
            assert!((inc * cell.area - 1.0).abs() < 1e-9);
        }
        assert!(f.large_enough.iter().all(|&l| l));
    }
}
