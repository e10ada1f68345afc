//! Cosmological parameters and distance helpers.

use serde::{Deserialize, Serialize};

use crate::value::{check_finite, impl_param_identity, ParamStruct, ParamValue};
use crate::{ParamError, Result};

/// Speed of light in km/s.
pub const C_KMS: f64 = 299_792.458;

const DISTANCE_STEPS: usize = 2048;

/// Flat ΛCDM cosmology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CosmoParams {
    #[serde(rename = "SIGMA_8")]
    pub sigma_8: f64,
    /// H0 / (100 km/s/Mpc).
    #[serde(rename = "hlittle")]
    pub hlittle: f64,
    #[serde(rename = "OMm")]
    pub omm: f64,
    #[serde(rename = "OMb")]
    pub omb: f64,
    #[serde(rename = "POWER_INDEX")]
    pub power_index: f64,
}

impl Default for CosmoParams {
    fn default() -> Self {
        Self {
            sigma_8: 0.8102,
            hlittle: 0.6766,
            omm: 0.30964,
            omb: 0.04897,
            power_index: 0.9665,
        }
    }
}

impl ParamStruct for CosmoParams {
    const NAME: &'static str = "CosmoParams";

    fn fields(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("SIGMA_8", self.sigma_8.into()),
            ("hlittle", self.hlittle.into()),
            ("OMm", self.omm.into()),
            ("OMb", self.omb.into()),
            ("POWER_INDEX", self.power_index.into()),
        ]
    }
}

impl_param_identity!(CosmoParams);

impl CosmoParams {
    pub fn validate(&self) -> Result<()> {
        check_finite(self)?;
        if !(0.0..=1.0).contains(&self.omm) || self.omm == 0.0 {
            return Err(ParamError::validation(
                "CosmoParams.OMm",
                format!("must lie in (0, 1], got {}", self.omm),
            ));
        }
        if self.omb < 0.0 || self.omb > self.omm {
            return Err(ParamError::validation(
                "CosmoParams.OMb",
                format!("must lie in [0, OMm], got {}", self.omb),
            ));
        }
        if self.hlittle <= 0.0 {
            return Err(ParamError::validation("CosmoParams.hlittle", "must be > 0"));
        }
        if self.sigma_8 <= 0.0 {
            return Err(ParamError::validation("CosmoParams.SIGMA_8", "must be > 0"));
        }
        Ok(())
    }

    /// Dark-energy density, derived from flatness.
    pub fn oml(&self) -> f64 {
        1.0 - self.omm
    }

    /// Hubble rate at `z` in km/s/Mpc.
    pub fn hubble(&self, z: f64) -> f64 {
        100.0 * self.hlittle * self.efunc(z)
    }

    fn efunc(&self, z: f64) -> f64 {
        (self.omm * (1.0 + z).powi(3) + self.oml()).sqrt()
    }

    /// Line-of-sight comoving distance to `z` in Mpc (Simpson's rule).
    pub fn comoving_distance(&self, z: f64) -> f64 {
        if z <= 0.0 {
            return 0.0;
        }
        let n = DISTANCE_STEPS;
        let h = z / n as f64;
        let mut sum = 1.0 / self.efunc(0.0) + 1.0 / self.efunc(z);
        for i in 1..n {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += w / self.efunc(i as f64 * h);
        }
        C_KMS / (100.0 * self.hlittle) * sum * h / 3.0
    }

    /// Inverse of [`comoving_distance`](Self::comoving_distance), by bisection.
    pub fn z_at_comoving_distance(&self, distance: f64) -> f64 {
        if distance <= 0.0 {
            return 0.0;
        }
        let mut hi = 1.0;
        while self.comoving_distance(hi) < distance && hi < 1e4 {
            hi *= 2.0;
        }
        let mut lo = 0.0;
        for _ in 0..80 {
            let mid = 0.5 * (lo + hi);
            if self.comoving_distance(mid) < distance {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(c: &CosmoParams) -> u64 {
        let mut h = DefaultHasher::new();
        c.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_constructed_the_same() {
        let a = CosmoParams {
            sigma_8: 0.8,
            ..Default::default()
        };
        let b = CosmoParams {
            sigma_8: 0.8,
            ..Default::default()
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_diff_names_field() {
        let a = CosmoParams::default();
        let b = CosmoParams {
            sigma_8: 0.9,
            ..Default::default()
        };
        assert_ne!(a, b);
        assert_ne!(hash_of(&a), hash_of(&b));
        let (field, _, _) = a.diff(&b).unwrap();
        assert_eq!(field, "SIGMA_8");
    }

    #[test]
    fn test_describe_contains_field() {
        let c = CosmoParams {
            sigma_8: 0.8,
            ..Default::default()
        };
        assert!(c.to_string().contains("SIGMA_8=0.8"));
    }

    #[test]
    fn test_comoving_distance_round_trip() {
        let c = CosmoParams::default();
        let d = c.comoving_distance(8.0);
        // Roughly 9 Gpc for Planck-like parameters.
        assert!(d > 8500.0 && d < 9700.0, "d = {d}");
        let z = c.z_at_comoving_distance(d);
        assert!((z - 8.0).abs() < 1e-6, "z = {z}");
    }

    #[test]
    fn test_rejects_non_finite() {
        let c = CosmoParams {
            hlittle: f64::NAN,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
