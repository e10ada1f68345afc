//! Simulation-grid ("user") parameters.

use serde::{Deserialize, Serialize};

use crate::value::{check_finite, impl_param_identity, ParamStruct, ParamValue};
use crate::{ParamError, Result};

/// Halo mass function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Hmf {
    #[serde(rename = "PS")]
    PressSchechter,
    #[default]
    #[serde(rename = "ST")]
    ShethTormen,
    #[serde(rename = "WATSON")]
    Watson,
    #[serde(rename = "WATSON-Z")]
    WatsonZ,
    #[serde(rename = "DELOS")]
    Delos,
}

impl Hmf {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hmf::PressSchechter => "PS",
            Hmf::ShethTormen => "ST",
            Hmf::Watson => "WATSON",
            Hmf::WatsonZ => "WATSON-Z",
            Hmf::Delos => "DELOS",
        }
    }
}

/// Box geometry and numerical switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct UserParams {
    /// Side length of the box in comoving Mpc.
    pub box_len: f64,
    /// High-resolution cells per side. `None` means `3 * HII_DIM`.
    pub dim: Option<u32>,
    /// Low-resolution cells per side.
    pub hii_dim: u32,
    /// Line-of-sight elongation of the box.
    pub non_cubic_factor: f64,
    pub hmf: Hmf,
    pub use_relative_velocities: bool,
    pub power_spectrum: u8,
    pub perturb_on_high_res: bool,
    pub no_rng: bool,
    pub use_interpolation_tables: bool,
    #[serde(rename = "USE_2LPT")]
    pub use_2lpt: bool,
    pub minimize_memory: bool,
    #[serde(rename = "KEEP_3D_VELOCITIES")]
    pub keep_3d_velocities: bool,
    pub sampler_min_mass: f64,
    /// Lowest redshift the halo sampler descends to. `None` means "first box".
    pub stoc_minimum_z: Option<f64>,
    pub sample_method: u8,
}

impl Default for UserParams {
    fn default() -> Self {
        Self {
            box_len: 300.0,
            dim: None,
            hii_dim: 200,
            non_cubic_factor: 1.0,
            hmf: Hmf::default(),
            use_relative_velocities: false,
            power_spectrum: 0,
            perturb_on_high_res: false,
            no_rng: false,
            use_interpolation_tables: true,
            use_2lpt: true,
            minimize_memory: false,
            keep_3d_velocities: false,
            sampler_min_mass: 5e7,
            stoc_minimum_z: None,
            sample_method: 0,
        }
    }
}

impl ParamStruct for UserParams {
    const NAME: &'static str = "UserParams";

    fn fields(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("BOX_LEN", self.box_len.into()),
            // Persisted resolved, so `None` and `Some(3 * HII_DIM)` are one identity.
            ("DIM", self.dim().into()),
            ("HII_DIM", self.hii_dim.into()),
            ("NON_CUBIC_FACTOR", self.non_cubic_factor.into()),
            ("HMF", ParamValue::Text(self.hmf.as_str())),
            ("USE_RELATIVE_VELOCITIES", self.use_relative_velocities.into()),
            ("POWER_SPECTRUM", self.power_spectrum.into()),
            ("PERTURB_ON_HIGH_RES", self.perturb_on_high_res.into()),
            ("NO_RNG", self.no_rng.into()),
            ("USE_INTERPOLATION_TABLES", self.use_interpolation_tables.into()),
            ("USE_2LPT", self.use_2lpt.into()),
            ("MINIMIZE_MEMORY", self.minimize_memory.into()),
            ("KEEP_3D_VELOCITIES", self.keep_3d_velocities.into()),
            ("SAMPLER_MIN_MASS", self.sampler_min_mass.into()),
            ("STOC_MINIMUM_Z", self.stoc_minimum_z.into()),
            ("SAMPLE_METHOD", self.sample_method.into()),
        ]
    }
}

impl_param_identity!(UserParams);

impl UserParams {
    pub fn validate(&self) -> Result<()> {
        check_finite(self)?;
        if self.box_len <= 0.0 {
            return Err(ParamError::validation("UserParams.BOX_LEN", "must be > 0"));
        }
        if self.hii_dim == 0 {
            return Err(ParamError::validation("UserParams.HII_DIM", "must be > 0"));
        }
        if self.dim() < self.hii_dim {
            return Err(ParamError::validation(
                "UserParams.DIM",
                format!("DIM ({}) must be >= HII_DIM ({})", self.dim(), self.hii_dim),
            ));
        }
        if self.non_cubic_factor <= 0.0 {
            return Err(ParamError::validation(
                "UserParams.NON_CUBIC_FACTOR",
                "must be > 0",
            ));
        }
        let is_int = |n: u32| {
            let v = self.non_cubic_factor * n as f64;
            (v - v.round()).abs() < 1e-9
        };
        if !is_int(self.dim()) || !is_int(self.hii_dim) {
            return Err(ParamError::validation(
                "UserParams.NON_CUBIC_FACTOR",
                "NON_CUBIC_FACTOR * DIM and NON_CUBIC_FACTOR * HII_DIM must be integers",
            ));
        }
        Ok(())
    }

    pub fn dim(&self) -> u32 {
        self.dim.unwrap_or(3 * self.hii_dim)
    }

    /// Low-resolution cell size in Mpc.
    pub fn cell_size(&self) -> f64 {
        self.box_len / self.hii_dim as f64
    }

    /// High-resolution cell size in Mpc.
    pub fn cell_size_hires(&self) -> f64 {
        self.box_len / self.dim() as f64
    }

    /// Number of low-resolution cells along the line of sight.
    pub fn hii_d_para(&self) -> usize {
        (self.non_cubic_factor * self.hii_dim as f64).round() as usize
    }

    /// Number of high-resolution cells along the line of sight.
    pub fn d_para(&self) -> usize {
        (self.non_cubic_factor * self.dim() as f64).round() as usize
    }

    pub fn hii_shape(&self) -> [usize; 3] {
        let n = self.hii_dim as usize;
        [n, n, self.hii_d_para()]
    }

    pub fn hires_shape(&self) -> [usize; 3] {
        let n = self.dim() as usize;
        [n, n, self.d_para()]
    }

    pub fn hii_tot_num_pixels(&self) -> usize {
        self.hii_shape().iter().product()
    }

    pub fn tot_fft_num_pixels(&self) -> usize {
        self.hires_shape().iter().product()
    }
}
