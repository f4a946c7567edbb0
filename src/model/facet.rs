//! The facet: a planar polygon with an orthonormal local frame, surface
//! interaction properties and optional recording equipment (texture mesh,
//! profile, direction field, angle map, outgassing map).

use crate::anglemap::{AngleMapSampler, AnglemapParams};
use crate::math::{is_in_poly, Vec3};
use crate::mesher::TextureMesh;
use crate::model::{DesorbType, HistogramParams, ProfileType};
use cgmath::Point2;
use enumflags2::{bitflags, BitFlags};

/// What a textured facet records per cell.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CountFlag {
    Desorb = 1 << 0,
    Absorb = 1 << 1,
    Reflect = 1 << 2,
    Transparent = 1 << 3,
    AcDensity = 1 << 4,
    Direction = 1 << 5,
}

/// Where a hit on this facet sends the particle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Teleport {
    /// Ordinary facet.
    #[default]
    None,
    /// Back to the facet the particle last teleported from.
    Back,
    /// To the facet with this global id.
    To(usize),
}

/// Reflection mixture: diffuse and specular fractions, remainder cos^N.
#[derive(Debug, Clone, Copy)]
pub struct Reflection {
    pub diffuse_part: f64,
    pub specular_part: f64,
    pub cosine_exponent: f64,
}

impl Default for Reflection {
    fn default() -> Self {
        Reflection {
            diffuse_part: 1.0,
            specular_part: 0.0,
            cosine_exponent: 0.0,
        }
    }
}

/// Imported per-cell outgassing strengths, pre-summed for sampling.
#[derive(Debug, Clone)]
pub struct OutgassingMap {
    pub width: usize,
    pub height: usize,
    pub width_d: f64,
    pub height_d: f64,
    /// Row-major cumulative sum of the per-cell outgassing [Pa·m3/s].
    pub cumulative: Vec<f64>,
}

impl OutgassingMap {
    pub fn total(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Facet {
    pub global_id: usize,

    // Local frame: position = o + u*U + v*V for (u,v) in [0,1]^2,
    // n = U x V / |U x V|, nu/nv the unit spanning directions.
    pub o: Vec3,
    pub u: Vec3,
    pub v: Vec3,
    pub n: Vec3,
    pub nu: Vec3,
    pub nv: Vec3,
    pub center: Vec3,
    pub area: f64,
    /// Outline in normalized (u,v) coordinates.
    pub vertices2: Vec<Point2<f64>>,

    // Surface interaction
    pub sticking: f64,
    pub sticking_param: Option<usize>,
    pub opacity: f64,
    pub opacity_param: Option<usize>,
    pub temperature: f64,
    pub accomodation_factor: f64,
    pub two_sided: bool,
    pub is_moving: bool,
    pub desorb_type: DesorbType,
    pub desorb_type_n: f64,
    pub reflection: Reflection,
    pub enable_sojourn_time: bool,
    pub sojourn_freq: f64,
    pub sojourn_e: f64,

    // Outgassing
    pub outgassing: f64,
    pub outgassing_param: Option<usize>,
    /// Integrated desorption curve index when outgassing is time-dependent.
    pub id_id: Option<usize>,
    pub outgassing_map: Option<OutgassingMap>,
    pub total_outgassing: f64,

    /// Speed CDF index for this facet's temperature.
    pub cdf_id: usize,

    // Topology
    /// Owning structure; `None` means present in all structures.
    pub super_idx: Option<usize>,
    /// Link facet: hit switches the particle to this structure.
    pub super_dest: Option<usize>,
    pub teleport_dest: Teleport,
    pub is_volatile: bool,

    // Recording
    pub is_textured: bool,
    pub tex_width: usize,
    pub tex_height: usize,
    pub tex_width_d: f64,
    pub tex_height_d: f64,
    pub count_flags: BitFlags<CountFlag>,
    pub mesh: Option<TextureMesh>,
    /// Precomputed 1/area per texture cell (0 for empty cells).
    pub texture_cell_increments: Vec<f64>,
    /// Cells big enough to take part in the colormap autoscale.
    pub large_enough: Vec<bool>,
    pub profile_type: ProfileType,
    /// Upper speed bound of the velocity profile bins.
    pub max_speed: f64,
    pub anglemap_params: AnglemapParams,
    pub anglemap: Option<AngleMapSampler>,
    pub histogram_params: HistogramParams,
}

impl Facet {
    #[inline]
    pub fn is_in_facet(&self, u: f64, v: f64) -> bool {
        is_in_poly(u, v, &self.vertices2)
    }

    #[inline]
    pub fn is_profile(&self) -> bool {
        self.profile_type != ProfileType::None
    }

    /// World-space point at local coordinates (u, v).
    #[inline]
    pub fn local_to_world(&self, u: f64, v: f64) -> Vec3 {
        self.o + u * self.u + v * self.v
    }

    /// Texture cell index for a local hit position.
    #[inline]
    pub fn texture_cell(&self, col_u: f64, col_v: f64) -> usize {
        let tu = ((col_u * self.tex_width_d) as usize).min(self.tex_width - 1);
        let tv = ((col_v * self.tex_height_d) as usize).min(self.tex_height - 1);
        tu + tv * self.tex_width
    }

    pub fn texture_size(&self) -> usize {
        self.tex_width * self.tex_height
    }
}
