//! The bundle of parameters that fully determines a run.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::astro::R_BUBBLE_MAX_INHOMO;
use crate::templates::load_template;
use crate::value::ParamStruct;
use crate::{
    AstroParams, CosmoParams, FlagOptions, GlobalParams, ParamError, Result, UserParams,
};

/// Random seed plus the four parameter structs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputParameters {
    /// `None` means "any seed": a cached record with any seed matches, and a
    /// fresh seed is drawn if initial conditions have to be computed.
    pub random_seed: Option<u64>,
    pub cosmo_params: CosmoParams,
    pub user_params: UserParams,
    pub astro_params: AstroParams,
    pub flag_options: FlagOptions,
}

impl InputParameters {
    /// Build and check every rule that does not depend on the globals.
    pub fn new(
        random_seed: Option<u64>,
        cosmo_params: CosmoParams,
        user_params: UserParams,
        astro_params: AstroParams,
        flag_options: FlagOptions,
    ) -> Result<Self> {
        cosmo_params.validate()?;
        user_params.validate()?;
        astro_params.validate()?;
        Ok(Self {
            random_seed,
            cosmo_params,
            user_params,
            astro_params,
            flag_options,
        })
    }

    /// Defaults everywhere except the seed.
    pub fn with_seed(random_seed: u64) -> Self {
        Self {
            random_seed: Some(random_seed),
            ..Default::default()
        }
    }

    /// Load a built-in template alias or a TOML file.
    pub fn from_template(name: &str, random_seed: Option<u64>) -> Result<Self> {
        let doc = load_template(name)?;
        Self::new(
            random_seed,
            doc.cosmo_params,
            doc.user_params,
            doc.astro_params,
            doc.flag_options,
        )
    }

    /// Copy with changes applied by `f`, re-validated.
    pub fn evolve(&self, f: impl FnOnce(&mut Self)) -> Result<Self> {
        let mut next = self.clone();
        f(&mut next);
        Self::new(
            next.random_seed,
            next.cosmo_params,
            next.user_params,
            next.astro_params,
            next.flag_options,
        )
    }

    /// Full validation, including rules that read `HII_FILTER`.
    pub fn validate(&self, globals: &GlobalParams) -> Result<()> {
        self.cosmo_params.validate()?;
        self.user_params.validate()?;
        self.astro_params.validate()?;
        self.flag_options.validate(globals)?;

        let r_bubble_max = self.astro_params.r_bubble_max(&self.flag_options);
        let box_len = self.user_params.box_len;
        if globals.hii_filter == 2 && r_bubble_max > box_len {
            return Err(ParamError::validation(
                "AstroParams.R_BUBBLE_MAX",
                format!(
                    "R_BUBBLE_MAX is larger than BOX_LEN ({r_bubble_max} > {box_len}). This is not allowed."
                ),
            ));
        }
        if globals.hii_filter == 1 && r_bubble_max > box_len / 3.0 {
            return Err(ParamError::validation(
                "AstroParams.R_BUBBLE_MAX",
                format!(
                    "Your R_BUBBLE_MAX is > BOX_LEN/3 ({r_bubble_max} > {}). This is not allowed.",
                    box_len / 3.0
                ),
            ));
        }
        if self.flag_options.inhomo_reco && r_bubble_max != R_BUBBLE_MAX_INHOMO {
            warn!(
                r_bubble_max,
                "INHOMO_RECO is set with R_BUBBLE_MAX != 50. This is non-standard (but allowed), and usually occurs upon manual update of INHOMO_RECO"
            );
        }
        Ok(())
    }

    /// Whether the photon-conservation correction is active.
    pub fn photon_cons(&self) -> bool {
        self.flag_options.photon_cons_type.is_enabled()
    }
}

/// Merge one parameter struct from an explicit argument and from predecessors.
///
/// Every supplied value must agree; the first disagreement is reported with
/// the struct and field name. Returns `None` if nothing supplied it.
pub fn merge_strict<T: ParamStruct + Clone>(
    explicit: Option<&T>,
    carried: &[&T],
) -> Result<Option<T>> {
    let mut merged: Option<&T> = explicit;
    for &candidate in carried {
        match merged {
            None => merged = Some(candidate),
            Some(current) => {
                if let Some((field, a, b)) = current.diff(candidate) {
                    return Err(ParamError::conflict(
                        format!("{}.{}", T::NAME, field),
                        format!("{a} (given) != {b} (from predecessor)"),
                    ));
                }
            }
        }
    }
    Ok(merged.cloned())
}

/// Like [`merge_strict`], failing when nothing supplied the struct.
pub fn merge_required<T: ParamStruct + Clone>(explicit: Option<&T>, carried: &[&T]) -> Result<T> {
    merge_strict(explicit, carried)?.ok_or_else(|| ParamError::Missing(T::NAME.to_string()))
}

/// Merge the random seed. `None` on either side never conflicts.
pub fn merge_seed(explicit: Option<u64>, carried: &[Option<u64>]) -> Result<Option<u64>> {
    let mut merged = explicit;
    for seed in carried.iter().flatten() {
        match merged {
            None => merged = Some(*seed),
            Some(current) if current != *seed => {
                return Err(ParamError::conflict(
                    "random_seed",
                    format!("{current} (given) != {seed} (from predecessor)"),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(merged)
}
