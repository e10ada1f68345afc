//! Feature flags selecting which physics the pipeline runs.

use serde::{Deserialize, Serialize};

use crate::value::{impl_param_identity, ParamStruct, ParamValue};
use crate::{GlobalParams, ParamError, Result};

/// Photon-conservation correction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhotonConsType {
    #[default]
    #[serde(rename = "no-photoncons")]
    None,
    #[serde(rename = "z-photoncons")]
    Redshift,
    #[serde(rename = "alpha-photoncons")]
    Alpha,
    #[serde(rename = "f-photoncons")]
    Fesc,
}

impl PhotonConsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotonConsType::None => "no-photoncons",
            PhotonConsType::Redshift => "z-photoncons",
            PhotonConsType::Alpha => "alpha-photoncons",
            PhotonConsType::Fesc => "f-photoncons",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, PhotonConsType::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FlagOptions {
    pub use_halo_field: bool,
    pub use_mini_halos: bool,
    #[serde(rename = "USE_CMB_HEATING")]
    pub use_cmb_heating: bool,
    #[serde(rename = "USE_LYA_HEATING")]
    pub use_lya_heating: bool,
    pub use_mass_dependent_zeta: bool,
    #[serde(rename = "SUBCELL_RSD")]
    pub subcell_rsd: bool,
    #[serde(rename = "APPLY_RSDS")]
    pub apply_rsds: bool,
    pub inhomo_reco: bool,
    pub use_ts_fluct: bool,
    /// `None` means "same as `USE_MASS_DEPENDENT_ZETA`".
    #[serde(rename = "M_MIN_in_Mass")]
    pub m_min_in_mass: Option<bool>,
    pub fix_vcb_avg: bool,
    pub halo_stochasticity: bool,
    pub use_exp_filter: bool,
    pub fixed_halo_grids: bool,
    pub cell_recomb: bool,
    pub photon_cons_type: PhotonConsType,
}

impl Default for FlagOptions {
    fn default() -> Self {
        Self {
            use_halo_field: false,
            use_mini_halos: false,
            use_cmb_heating: true,
            use_lya_heating: true,
            use_mass_dependent_zeta: false,
            subcell_rsd: false,
            apply_rsds: true,
            inhomo_reco: false,
            use_ts_fluct: false,
            m_min_in_mass: None,
            fix_vcb_avg: false,
            halo_stochasticity: false,
            use_exp_filter: false,
            fixed_halo_grids: false,
            cell_recomb: false,
            photon_cons_type: PhotonConsType::None,
        }
    }
}

impl ParamStruct for FlagOptions {
    const NAME: &'static str = "FlagOptions";

    fn fields(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("USE_HALO_FIELD", self.use_halo_field.into()),
            ("USE_MINI_HALOS", self.use_mini_halos.into()),
            ("USE_CMB_HEATING", self.use_cmb_heating.into()),
            ("USE_LYA_HEATING", self.use_lya_heating.into()),
            ("USE_MASS_DEPENDENT_ZETA", self.use_mass_dependent_zeta.into()),
            ("SUBCELL_RSD", self.subcell_rsd.into()),
            ("APPLY_RSDS", self.apply_rsds.into()),
            ("INHOMO_RECO", self.inhomo_reco.into()),
            ("USE_TS_FLUCT", self.use_ts_fluct.into()),
            ("M_MIN_in_Mass", self.m_min_in_mass().into()),
            ("FIX_VCB_AVG", self.fix_vcb_avg.into()),
            ("HALO_STOCHASTICITY", self.halo_stochasticity.into()),
            ("USE_EXP_FILTER", self.use_exp_filter.into()),
            ("FIXED_HALO_GRIDS", self.fixed_halo_grids.into()),
            ("CELL_RECOMB", self.cell_recomb.into()),
            ("PHOTON_CONS_TYPE", ParamValue::Text(self.photon_cons_type.as_str())),
        ]
    }
}

impl_param_identity!(FlagOptions);

fn invalid(message: &str) -> ParamError {
    ParamError::validation("FlagOptions", message)
}

impl FlagOptions {
    pub fn m_min_in_mass(&self) -> bool {
        self.m_min_in_mass.unwrap_or(self.use_mass_dependent_zeta)
    }

    /// Whether the pipeline needs evolutionary history below `Z_HEAT_MAX`.
    pub fn needs_history(&self) -> bool {
        self.inhomo_reco || self.use_ts_fluct
    }

    /// Check flag combinations. `HII_FILTER` comes from the globals.
    pub fn validate(&self, globals: &GlobalParams) -> Result<()> {
        if self.subcell_rsd && !self.apply_rsds {
            return Err(invalid(
                "The SUBCELL_RSD flag is only effective if APPLY_RSDS is True.",
            ));
        }
        if self.use_halo_field && !self.use_mass_dependent_zeta {
            return Err(invalid(
                "You have set USE_MASS_DEPENDENT_ZETA to False but USE_HALO_FIELD is True!",
            ));
        }
        if self.use_mini_halos {
            if !self.use_mass_dependent_zeta {
                return Err(invalid(
                    "You have set USE_MINI_HALOS to True but USE_MASS_DEPENDENT_ZETA is False!",
                ));
            }
            if !self.inhomo_reco {
                return Err(invalid(
                    "You have set USE_MINI_HALOS to True but INHOMO_RECO is False!",
                ));
            }
            if !self.use_ts_fluct {
                return Err(invalid(
                    "You have set USE_MINI_HALOS to True but USE_TS_FLUCT is False!",
                ));
            }
        }
        if self.use_mass_dependent_zeta && !self.m_min_in_mass() {
            return Err(invalid(
                "M_MIN_in_Mass must be true if USE_MASS_DEPENDENT_ZETA is true.",
            ));
        }
        if self.photon_cons_type == PhotonConsType::Redshift
            && (self.use_mini_halos || self.use_halo_field)
        {
            return Err(invalid(
                "USE_MINI_HALOS and USE_HALO_FIELD are not compatible with the redshift-based photon conservation corrections",
            ));
        }
        if self.halo_stochasticity && !self.use_halo_field {
            return Err(invalid("HALO_STOCHASTICITY is True but USE_HALO_FIELD is False"));
        }
        if self.use_exp_filter {
            if !self.cell_recomb {
                return Err(invalid("USE_EXP_FILTER is True but CELL_RECOMB is False"));
            }
            if globals.hii_filter != 0 {
                return Err(invalid(
                    "USE_EXP_FILTER can only be used with a real-space tophat HII_FILTER==0",
                ));
            }
        }
        Ok(())
    }
}
