//! Astrophysical parameters.

use serde::{Deserialize, Serialize};

use crate::value::{check_finite, impl_param_identity, ParamStruct, ParamValue};
use crate::{FlagOptions, ParamError, Result};

/// Default maximum ionizing bubble radius with inhomogeneous recombinations.
pub const R_BUBBLE_MAX_INHOMO: f64 = 50.0;
/// Default maximum ionizing bubble radius otherwise.
pub const R_BUBBLE_MAX_DEFAULT: f64 = 15.0;

/// Source-population parameters (log10 quantities where noted).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AstroParams {
    pub hii_eff_factor: f64,
    #[serde(rename = "F_STAR10")]
    pub f_star10: f64,
    #[serde(rename = "F_STAR7_MINI")]
    pub f_star7_mini: f64,
    pub alpha_star: f64,
    pub alpha_star_mini: f64,
    #[serde(rename = "F_ESC10")]
    pub f_esc10: f64,
    #[serde(rename = "F_ESC7_MINI")]
    pub f_esc7_mini: f64,
    pub alpha_esc: f64,
    pub m_turn: f64,
    /// Maximum bubble radius in Mpc. `None` picks a default from `INHOMO_RECO`.
    pub r_bubble_max: Option<f64>,
    #[serde(rename = "ION_Tvir_MIN")]
    pub ion_tvir_min: f64,
    #[serde(rename = "L_X")]
    pub l_x: f64,
    #[serde(rename = "L_X_MINI")]
    pub l_x_mini: f64,
    #[serde(rename = "NU_X_THRESH")]
    pub nu_x_thresh: f64,
    #[serde(rename = "X_RAY_SPEC_INDEX")]
    pub x_ray_spec_index: f64,
    /// `None` means "same as `ION_Tvir_MIN`".
    #[serde(rename = "X_RAY_Tvir_MIN")]
    pub x_ray_tvir_min: Option<f64>,
    #[serde(rename = "F_H2_SHIELD")]
    pub f_h2_shield: f64,
    #[serde(rename = "t_STAR")]
    pub t_star: f64,
    #[serde(rename = "N_RSD_STEPS")]
    pub n_rsd_steps: u32,
    #[serde(rename = "A_LW")]
    pub a_lw: f64,
    #[serde(rename = "BETA_LW")]
    pub beta_lw: f64,
    #[serde(rename = "A_VCB")]
    pub a_vcb: f64,
    #[serde(rename = "BETA_VCB")]
    pub beta_vcb: f64,
    pub sigma_star: f64,
    #[serde(rename = "SIGMA_SFR_LIM")]
    pub sigma_sfr_lim: f64,
    pub corr_star: f64,
    #[serde(rename = "CORR_SFR")]
    pub corr_sfr: f64,
}

impl Default for AstroParams {
    fn default() -> Self {
        Self {
            hii_eff_factor: 30.0,
            f_star10: -1.3,
            f_star7_mini: -2.0,
            alpha_star: 0.5,
            alpha_star_mini: 0.5,
            f_esc10: -1.0,
            f_esc7_mini: -2.0,
            alpha_esc: -0.5,
            m_turn: 8.7,
            r_bubble_max: None,
            ion_tvir_min: 4.69897,
            l_x: 40.0,
            l_x_mini: 40.0,
            nu_x_thresh: 500.0,
            x_ray_spec_index: 1.0,
            x_ray_tvir_min: None,
            f_h2_shield: 0.0,
            t_star: 0.5,
            n_rsd_steps: 20,
            a_lw: 2.0,
            beta_lw: 0.6,
            a_vcb: 1.0,
            beta_vcb: 1.8,
            sigma_star: 0.25,
            sigma_sfr_lim: 0.19,
            corr_star: 0.5,
            corr_sfr: 0.2,
        }
    }
}

impl ParamStruct for AstroParams {
    const NAME: &'static str = "AstroParams";

    fn fields(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("HII_EFF_FACTOR", self.hii_eff_factor.into()),
            ("F_STAR10", self.f_star10.into()),
            ("F_STAR7_MINI", self.f_star7_mini.into()),
            ("ALPHA_STAR", self.alpha_star.into()),
            ("ALPHA_STAR_MINI", self.alpha_star_mini.into()),
            ("F_ESC10", self.f_esc10.into()),
            ("F_ESC7_MINI", self.f_esc7_mini.into()),
            ("ALPHA_ESC", self.alpha_esc.into()),
            ("M_TURN", self.m_turn.into()),
            ("R_BUBBLE_MAX", self.r_bubble_max.into()),
            ("ION_Tvir_MIN", self.ion_tvir_min.into()),
            ("L_X", self.l_x.into()),
            ("L_X_MINI", self.l_x_mini.into()),
            ("NU_X_THRESH", self.nu_x_thresh.into()),
            ("X_RAY_SPEC_INDEX", self.x_ray_spec_index.into()),
            ("X_RAY_Tvir_MIN", self.x_ray_tvir_min().into()),
            ("F_H2_SHIELD", self.f_h2_shield.into()),
            ("t_STAR", self.t_star.into()),
            ("N_RSD_STEPS", self.n_rsd_steps.into()),
            ("A_LW", self.a_lw.into()),
            ("BETA_LW", self.beta_lw.into()),
            ("A_VCB", self.a_vcb.into()),
            ("BETA_VCB", self.beta_vcb.into()),
            ("SIGMA_STAR", self.sigma_star.into()),
            ("SIGMA_SFR_LIM", self.sigma_sfr_lim.into()),
            ("CORR_STAR", self.corr_star.into()),
            ("CORR_SFR", self.corr_sfr.into()),
        ]
    }
}

impl_param_identity!(AstroParams);

impl AstroParams {
    pub fn validate(&self) -> Result<()> {
        check_finite(self)?;
        if let Some(r) = self.r_bubble_max {
            if r <= 0.0 {
                return Err(ParamError::validation(
                    "AstroParams.R_BUBBLE_MAX",
                    "must be > 0",
                ));
            }
        }
        if self.t_star <= 0.0 || self.t_star > 1.0 {
            return Err(ParamError::validation(
                "AstroParams.t_STAR",
                format!("must lie in (0, 1], got {}", self.t_star),
            ));
        }
        Ok(())
    }

    pub fn x_ray_tvir_min(&self) -> f64 {
        self.x_ray_tvir_min.unwrap_or(self.ion_tvir_min)
    }

    /// Bubble radius, falling back to the flag-dependent default.
    pub fn r_bubble_max(&self, flags: &FlagOptions) -> f64 {
        self.r_bubble_max.unwrap_or(if flags.inhomo_reco {
            R_BUBBLE_MAX_INHOMO
        } else {
            R_BUBBLE_MAX_DEFAULT
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r_bubble_max_default_follows_inhomo() {
        let a = AstroParams::default();
        let mut f = FlagOptions::default();
        assert_eq!(a.r_bubble_max(&f), R_BUBBLE_MAX_DEFAULT);
        f.inhomo_reco = true;
        assert_eq!(a.r_bubble_max(&f), R_BUBBLE_MAX_INHOMO);
    }

    #[test]
    fn test_x_ray_tvir_defaults_to_ion() {
        let a = AstroParams::default();
        let b = AstroParams {
            x_ray_tvir_min: Some(a.ion_tvir_min),
            ..Default::default()
        };
        assert_eq!(a, b);
    }
}
