//! Overridable global scalars.
//!
//! These are settings the native engine reads from process-wide state. Here
//! they are a plain value threaded through every stage call; temporary
//! overrides go through [`GlobalParams::scoped`], which restores the previous
//! values when the guard drops.

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

use crate::{ParamError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalParams {
    /// Logarithmic step between successive redshifts of a scroll.
    #[serde(rename = "ZPRIME_STEP_FACTOR")]
    pub zprime_step_factor: f64,
    /// Redshift above which evolutionary history is not tracked.
    #[serde(rename = "Z_HEAT_MAX")]
    pub z_heat_max: f64,
    /// Number of filter shells used by the spin-temperature integral.
    #[serde(rename = "NUM_FILTER_STEPS_FOR_Ts")]
    pub num_filter_steps_for_ts: usize,
    /// Outer shell radius of the spin-temperature integral, in Mpc.
    #[serde(rename = "R_XLy_MAX")]
    pub r_xly_max: f64,
    /// Lowest redshift the photon-conservation calibration supports.
    #[serde(rename = "PhotonConsEndCalibz")]
    pub photon_cons_end_calibz: f64,
    #[serde(rename = "MAXHALO_FACTOR")]
    pub maxhalo_factor: f64,
    /// 0: real-space top-hat, 1: k-space top-hat, 2: Gaussian.
    #[serde(rename = "HII_FILTER")]
    pub hii_filter: u8,
    #[serde(rename = "AVG_BELOW_SAMPLER")]
    pub avg_below_sampler: bool,
    /// Clip for the velocity gradient in the RSD correction.
    #[serde(rename = "MAX_DVDR")]
    pub max_dvdr: f64,
    #[serde(rename = "Pop2_ion")]
    pub pop2_ion: f64,
    #[serde(rename = "Pop3_ion")]
    pub pop3_ion: f64,
    #[serde(rename = "DELTA_R_HII_FACTOR")]
    pub delta_r_hii_factor: f64,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            zprime_step_factor: 1.02,
            z_heat_max: 35.0,
            num_filter_steps_for_ts: 40,
            r_xly_max: 500.0,
            photon_cons_end_calibz: 3.5,
            maxhalo_factor: 2.0,
            hii_filter: 1,
            avg_below_sampler: false,
            max_dvdr: 0.2,
            pop2_ion: 5000.0,
            pop3_ion: 44021.0,
            delta_r_hii_factor: 1.1,
        }
    }
}

/// Canonical names, in declaration order.
pub const GLOBAL_NAMES: &[&str] = &[
    "ZPRIME_STEP_FACTOR",
    "Z_HEAT_MAX",
    "NUM_FILTER_STEPS_FOR_Ts",
    "R_XLy_MAX",
    "PhotonConsEndCalibz",
    "MAXHALO_FACTOR",
    "HII_FILTER",
    "AVG_BELOW_SAMPLER",
    "MAX_DVDR",
    "Pop2_ion",
    "Pop3_ion",
    "DELTA_R_HII_FACTOR",
];

fn canonical(name: &str) -> Result<&'static str> {
    GLOBAL_NAMES
        .iter()
        .copied()
        .find(|n| n.eq_ignore_ascii_case(name))
        .ok_or_else(|| ParamError::UnknownGlobal(name.to_string()))
}

fn as_count(name: &str, value: f64) -> Result<f64> {
    if value < 0.0 || value.fract() != 0.0 {
        return Err(ParamError::validation(
            name,
            format!("must be a non-negative integer, got {value}"),
        ));
    }
    Ok(value)
}

impl GlobalParams {
    /// Read a global by case-insensitive name.
    pub fn get(&self, name: &str) -> Result<f64> {
        Ok(match canonical(name)? {
            "ZPRIME_STEP_FACTOR" => self.zprime_step_factor,
            "Z_HEAT_MAX" => self.z_heat_max,
            "NUM_FILTER_STEPS_FOR_Ts" => self.num_filter_steps_for_ts as f64,
            "R_XLy_MAX" => self.r_xly_max,
            "PhotonConsEndCalibz" => self.photon_cons_end_calibz,
            "MAXHALO_FACTOR" => self.maxhalo_factor,
            "HII_FILTER" => self.hii_filter as f64,
            "AVG_BELOW_SAMPLER" => {
                if self.avg_below_sampler {
                    1.0
                } else {
                    0.0
                }
            }
            "MAX_DVDR" => self.max_dvdr,
            "Pop2_ion" => self.pop2_ion,
            "Pop3_ion" => self.pop3_ion,
            _ => self.delta_r_hii_factor,
        })
    }

    /// Set a global by case-insensitive name.
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        let name = canonical(name)?;
        if !value.is_finite() {
            return Err(ParamError::validation(name, "must be finite"));
        }
        match name {
            "ZPRIME_STEP_FACTOR" => {
                if value <= 1.0 {
                    return Err(ParamError::validation(name, "must be > 1"));
                }
                self.zprime_step_factor = value;
            }
            "Z_HEAT_MAX" => self.z_heat_max = value,
            "NUM_FILTER_STEPS_FOR_Ts" => {
                self.num_filter_steps_for_ts = as_count(name, value)? as usize
            }
            "R_XLy_MAX" => self.r_xly_max = value,
            "PhotonConsEndCalibz" => self.photon_cons_end_calibz = value,
            "MAXHALO_FACTOR" => self.maxhalo_factor = value,
            "HII_FILTER" => {
                let v = as_count(name, value)?;
                if v > 2.0 {
                    return Err(ParamError::validation(name, "must be 0, 1 or 2"));
                }
                self.hii_filter = v as u8;
            }
            "AVG_BELOW_SAMPLER" => self.avg_below_sampler = value != 0.0,
            "MAX_DVDR" => self.max_dvdr = value,
            "Pop2_ion" => self.pop2_ion = value,
            "Pop3_ion" => self.pop3_ion = value,
            _ => self.delta_r_hii_factor = value,
        }
        Ok(())
    }

    /// Apply `overrides` until the returned guard drops.
    ///
    /// If any override is invalid, nothing stays applied and the error is
    /// returned.
    pub fn scoped<S: AsRef<str>>(
        &mut self,
        overrides: &[(S, f64)],
    ) -> Result<ScopedGlobals<'_>> {
        let saved = self.clone();
        let mut guard = ScopedGlobals {
            target: self,
            saved: Some(saved),
        };
        for (name, value) in overrides {
            guard.set(name.as_ref(), *value)?;
        }
        Ok(guard)
    }

    /// Parse `NAME=VALUE`.
    pub fn parse_override(s: &str) -> Result<(String, f64)> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| ParamError::validation(s, "expected NAME=VALUE"))?;
        let name = canonical(name.trim())?;
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| ParamError::validation(name, format!("not a number: {value}")))?;
        Ok((name.to_string(), value))
    }
}

/// Guard returned by [`GlobalParams::scoped`].
#[derive(Debug)]
pub struct ScopedGlobals<'a> {
    target: &'a mut GlobalParams,
    saved: Option<GlobalParams>,
}

impl Deref for ScopedGlobals<'_> {
    type Target = GlobalParams;

    fn deref(&self) -> &GlobalParams {
        self.target
    }
}

impl DerefMut for ScopedGlobals<'_> {
    fn deref_mut(&mut self) -> &mut GlobalParams {
        self.target
    }
}

impl Drop for ScopedGlobals<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.target = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_restores() {
        let mut g = GlobalParams::default();
        {
            let scoped = g.scoped(&[("Pop2_ion", 1000.0)]).unwrap();
            assert_eq!(scoped.pop2_ion, 1000.0);
        }
        assert_eq!(g.pop2_ion, 5000.0);
    }

    #[test]
    fn test_nested_scopes() {
        let mut g = GlobalParams::default();
        {
            let mut outer = g.scoped(&[("Z_HEAT_MAX", 20.0)]).unwrap();
            {
                let inner = outer.scoped(&[("z_heat_max", 10.0)]).unwrap();
                assert_eq!(inner.z_heat_max, 10.0);
            }
            assert_eq!(outer.z_heat_max, 20.0);
        }
        assert_eq!(g.z_heat_max, 35.0);
    }

    #[test]
    fn test_failed_override_restores() {
        let mut g = GlobalParams::default();
        let err = g
            .scoped(&[("MAX_DVDR", 0.5), ("NOT_A_GLOBAL", 1.0)])
            .unwrap_err();
        assert!(matches!(err, ParamError::UnknownGlobal(_)));
        assert_eq!(g.max_dvdr, 0.2);
    }

    #[test]
    fn test_case_insensitive_get() {
        let g = GlobalParams::default();
        assert_eq!(g.get("zprime_step_factor").unwrap(), 1.02);
        assert_eq!(g.get("num_filter_steps_for_ts").unwrap(), 40.0);
    }

    #[test]
    fn test_parse_override() {
        let (name, value) = GlobalParams::parse_override("z_heat_max=25").unwrap();
        assert_eq!(name, "Z_HEAT_MAX");
        assert_eq!(value, 25.0);
        assert!(GlobalParams::parse_override("Z_HEAT_MAX").is_err());
    }
}
