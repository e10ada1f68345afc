//! Static registry of output kinds and their fields.
//!
//! Every output kind has a fixed table of named fields with a shape class.
//! Generic tooling (lightcone quantity validation, cache queries, the CLI)
//! reads these tables instead of inspecting entities at runtime.

use std::fmt;
use std::str::FromStr;

use reionize_params::{GlobalParams, UserParams};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The nine kinds of computed box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutputKind {
    InitialConditions,
    PerturbedField,
    HaloField,
    PerturbHaloField,
    HaloBox,
    XraySourceBox,
    TsBox,
    IonizedBox,
    BrightnessTemp,
}

impl OutputKind {
    /// Pipeline order.
    pub const ALL: [OutputKind; 9] = [
        OutputKind::InitialConditions,
        OutputKind::PerturbedField,
        OutputKind::HaloField,
        OutputKind::PerturbHaloField,
        OutputKind::HaloBox,
        OutputKind::XraySourceBox,
        OutputKind::TsBox,
        OutputKind::IonizedBox,
        OutputKind::BrightnessTemp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::InitialConditions => "InitialConditions",
            OutputKind::PerturbedField => "PerturbedField",
            OutputKind::HaloField => "HaloField",
            OutputKind::PerturbHaloField => "PerturbHaloField",
            OutputKind::HaloBox => "HaloBox",
            OutputKind::XraySourceBox => "XraySourceBox",
            OutputKind::TsBox => "TsBox",
            OutputKind::IonizedBox => "IonizedBox",
            OutputKind::BrightnessTemp => "BrightnessTemp",
        }
    }

    /// Name of the stage operation that produces this kind.
    pub fn stage(&self) -> &'static str {
        match self {
            OutputKind::InitialConditions => "initial_conditions",
            OutputKind::PerturbedField => "perturb_field",
            OutputKind::HaloField => "determine_halo_list",
            OutputKind::PerturbHaloField => "perturb_halo_list",
            OutputKind::HaloBox => "compute_halo_grid",
            OutputKind::XraySourceBox => "compute_xray_source_field",
            OutputKind::TsBox => "spin_temperature",
            OutputKind::IonizedBox => "ionize_box",
            OutputKind::BrightnessTemp => "brightness_temperature",
        }
    }

    /// Whether astro params and flag options are part of the identity.
    pub fn uses_astro(&self) -> bool {
        !matches!(
            self,
            OutputKind::InitialConditions | OutputKind::PerturbedField
        )
    }

    /// Whether the identity carries a redshift.
    pub fn has_redshift(&self) -> bool {
        !matches!(self, OutputKind::InitialConditions)
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            OutputKind::InitialConditions => INITIAL_CONDITIONS,
            OutputKind::PerturbedField => PERTURBED_FIELD,
            OutputKind::HaloField | OutputKind::PerturbHaloField => HALO_LIST,
            OutputKind::HaloBox => HALO_BOX,
            OutputKind::XraySourceBox => XRAY_SOURCE_BOX,
            OutputKind::TsBox => TS_BOX,
            OutputKind::IonizedBox => IONIZED_BOX,
            OutputKind::BrightnessTemp => BRIGHTNESS_TEMP,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Array fields only.
    pub fn array_fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.fields().iter().filter(|f| f.shape.is_array())
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OutputKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.stage().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Config(format!("unknown output kind: {s}")))
    }
}

/// Shape class of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// `HII_DIM x HII_DIM x HII_D_PARA`.
    LowRes,
    /// `DIM x DIM x D_PARA`.
    HiRes,
    /// One entry per halo; sized by the engine.
    HaloList,
    /// `n_halos x 3`; sized by the engine.
    HaloCoords,
    /// One low-res box per filter shell.
    FilterShells,
    /// One value per filter shell.
    ShellSeries,
    /// A single float kept alongside the arrays.
    Scalar,
}

impl FieldShape {
    pub fn is_array(&self) -> bool {
        !matches!(self, FieldShape::Scalar)
    }

    /// Allocation shape, or `None` when the engine decides the length.
    pub fn dims(&self, user: &UserParams, globals: &GlobalParams) -> Option<Vec<usize>> {
        let shells = globals.num_filter_steps_for_ts;
        match self {
            FieldShape::LowRes => Some(user.hii_shape().to_vec()),
            FieldShape::HiRes => Some(user.hires_shape().to_vec()),
            FieldShape::FilterShells => {
                let [x, y, z] = user.hii_shape();
                Some(vec![shells, x, y, z])
            }
            FieldShape::ShellSeries => Some(vec![shells]),
            FieldShape::HaloList | FieldShape::HaloCoords | FieldShape::Scalar => None,
        }
    }
}

/// One named field of an output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub shape: FieldShape,
    pub description: &'static str,
}

const fn field(name: &'static str, shape: FieldShape, description: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        shape,
        description,
    }
}

use FieldShape::*;

const INITIAL_CONDITIONS: &[FieldSpec] = &[
    field("lowres_density", LowRes, "linear density contrast, low resolution"),
    field("lowres_vx", LowRes, "x velocity, low resolution"),
    field("lowres_vy", LowRes, "y velocity, low resolution"),
    field("lowres_vz", LowRes, "z velocity, low resolution"),
    field("hires_density", HiRes, "linear density contrast, high resolution"),
    field("hires_vx", HiRes, "x velocity, high resolution"),
    field("hires_vy", HiRes, "y velocity, high resolution"),
    field("hires_vz", HiRes, "z velocity, high resolution"),
    field("lowres_vcb", LowRes, "relative baryon-DM velocity"),
];

const PERTURBED_FIELD: &[FieldSpec] = &[
    field("density", LowRes, "evolved density contrast"),
    field("velocity_x", LowRes, "peculiar velocity along x, Mpc/s"),
    field("velocity_y", LowRes, "peculiar velocity along y, Mpc/s"),
    field("velocity_z", LowRes, "peculiar velocity along z, Mpc/s"),
];

const HALO_LIST: &[FieldSpec] = &[
    field("halo_masses", HaloList, "halo mass, Msun"),
    field("halo_coords", HaloCoords, "halo position, cell units"),
    field("star_rng", HaloList, "stellar-mass scatter draw"),
    field("sfr_rng", HaloList, "star-formation scatter draw"),
    field("xray_rng", HaloList, "X-ray luminosity scatter draw"),
    field("n_halos", Scalar, "number of halos in the list"),
];

const HALO_BOX: &[FieldSpec] = &[
    field("halo_mass", LowRes, "gridded halo mass"),
    field("halo_stars", LowRes, "gridded stellar mass"),
    field("halo_stars_mini", LowRes, "gridded minihalo stellar mass"),
    field("count", LowRes, "halo count per cell"),
    field("n_ion", LowRes, "ionising photon count"),
    field("halo_sfr", LowRes, "star-formation rate"),
    field("halo_sfr_mini", LowRes, "minihalo star-formation rate"),
    field("halo_xray", LowRes, "X-ray emissivity"),
    field("whalo_sfr", LowRes, "weighted star-formation rate"),
    field("log10_Mcrit_LW_ave", Scalar, "mean Lyman-Werner critical mass"),
];

const XRAY_SOURCE_BOX: &[FieldSpec] = &[
    field("filtered_sfr", FilterShells, "shell-filtered star formation"),
    field("filtered_sfr_mini", FilterShells, "shell-filtered minihalo star formation"),
    field("filtered_xray", FilterShells, "shell-filtered X-ray emissivity"),
    field("mean_sfr", ShellSeries, "shell mean star formation"),
    field("mean_sfr_mini", ShellSeries, "shell mean minihalo star formation"),
    field("mean_log10_Mcrit_LW", ShellSeries, "shell mean Lyman-Werner critical mass"),
];

const TS_BOX: &[FieldSpec] = &[
    field("spin_temperature", LowRes, "spin temperature, K"),
    field("xray_ionised_fraction", LowRes, "X-ray ionised fraction"),
    field("kinetic_temp_neutral", LowRes, "neutral gas kinetic temperature, K"),
    field("J_21_LW", LowRes, "Lyman-Werner background"),
];

const IONIZED_BOX: &[FieldSpec] = &[
    field("xH_box", LowRes, "neutral fraction"),
    field("Gamma12_box", LowRes, "photoionisation rate, 1e-12/s"),
    field("MFP_box", LowRes, "mean free path, Mpc"),
    field("z_re_box", LowRes, "reionisation redshift"),
    field("dNrec_box", LowRes, "cumulative recombinations"),
    field("temp_kinetic_all_gas", LowRes, "gas kinetic temperature, K"),
    field("Fcoll", LowRes, "collapsed fraction"),
    field("Fcoll_MINI", LowRes, "minihalo collapsed fraction"),
    field("mean_f_coll", Scalar, "mean collapsed fraction"),
    field("mean_f_coll_MINI", Scalar, "mean minihalo collapsed fraction"),
    field("log10_Mturnover_ave", Scalar, "mean log10 turnover mass"),
    field("log10_Mturnover_MINI_ave", Scalar, "mean log10 minihalo turnover mass"),
];

const BRIGHTNESS_TEMP: &[FieldSpec] =
    &[field("brightness_temp", LowRes, "21-cm brightness temperature, mK")];

/// Every field name with the kind that owns it, in pipeline order.
///
/// `arrays_only` drops scalar fields. `lightcone_only` keeps only low-res
/// boxes of evolving kinds, which are the quantities a lightcone can slice.
pub fn get_all_fieldnames(arrays_only: bool, lightcone_only: bool) -> Vec<(&'static str, OutputKind)> {
    let mut out = Vec::new();
    for kind in OutputKind::ALL {
        for spec in kind.fields() {
            if arrays_only && !spec.shape.is_array() {
                continue;
            }
            if lightcone_only
                && (kind == OutputKind::InitialConditions || spec.shape != FieldShape::LowRes)
            {
                continue;
            }
            if out.iter().any(|(n, _)| *n == spec.name) {
                continue;
            }
            out.push((spec.name, kind));
        }
    }
    out
}

/// Kind owning a lightcone-able field.
pub fn lightcone_field_kind(name: &str) -> Option<OutputKind> {
    get_all_fieldnames(true, true)
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, k)| k)
}
