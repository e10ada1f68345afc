//! Stage resolvers, one per output kind.
//!
//! Every stage follows the same pattern:
//!
//! 1. Merge the explicit [`ParamArgs`] with the parameters carried by the
//!    supplied predecessors (strictly: any disagreement is an error), and
//!    resolve the redshift the same way.
//! 2. Probe the cache for the output identity. A hit returns immediately,
//!    before any predecessor is touched.
//! 3. On a miss, resolve every missing predecessor: read or compute it at the
//!    same redshift, recurse one step back in redshift for history, or stand
//!    in a placeholder when the history ends or the feature is off.
//! 4. Call the engine and run the post-compute hooks.

use std::borrow::Cow;

use reionize_foundation::redshifts_match;
use reionize_params::{
    merge_seed, merge_strict, AstroParams, CosmoParams, FlagOptions, GlobalParams,
    InputParameters, UserParams,
};
use tracing::debug;

use crate::context::StageContext;
use crate::outputs::{BoxData, BoxState, InitialConditions, OutputStruct};
use crate::registry::OutputKind;
use crate::{Error, Result};

mod radiation;
mod structure;

pub use radiation::{
    brightness_temperature, compute_halo_grid, compute_xray_source_field, ionize_box,
    spin_temperature, BrightnessTempArgs, HaloBoxArgs, IonizeArgs, SpinTempArgs,
    XraySourceArgs,
};
pub use structure::{
    determine_halo_list, initial_conditions, perturb_field, perturb_halo_list, HaloListArgs,
    PerturbFieldArgs, PerturbHaloArgs,
};

/// Parameters given explicitly to a stage. Anything left `None` is taken from
/// the predecessors, or defaults if no predecessor carries it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamArgs {
    pub random_seed: Option<u64>,
    pub cosmo_params: Option<CosmoParams>,
    pub user_params: Option<UserParams>,
    pub astro_params: Option<AstroParams>,
    pub flag_options: Option<FlagOptions>,
}

impl From<&InputParameters> for ParamArgs {
    fn from(inputs: &InputParameters) -> Self {
        Self {
            random_seed: inputs.random_seed,
            cosmo_params: Some(inputs.cosmo_params.clone()),
            user_params: Some(inputs.user_params.clone()),
            astro_params: Some(inputs.astro_params.clone()),
            flag_options: Some(inputs.flag_options.clone()),
        }
    }
}

impl ParamArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Strict merge against `carriers`, then full validation.
    pub(crate) fn resolve(
        &self,
        carriers: &[&BoxData],
        globals: &GlobalParams,
    ) -> Result<InputParameters> {
        let ids: Vec<_> = carriers.iter().map(|c| c.identity()).collect();
        let seeds: Vec<_> = ids.iter().map(|i| i.random_seed).collect();
        let cosmo: Vec<_> = ids.iter().map(|i| &i.cosmo_params).collect();
        let user: Vec<_> = ids.iter().map(|i| &i.user_params).collect();
        let astro: Vec<_> = ids.iter().filter_map(|i| i.astro_params.as_ref()).collect();
        let flags: Vec<_> = ids.iter().filter_map(|i| i.flag_options.as_ref()).collect();

        let inputs = InputParameters::new(
            merge_seed(self.random_seed, &seeds)?,
            merge_strict(self.cosmo_params.as_ref(), &cosmo)?.unwrap_or_default(),
            merge_strict(self.user_params.as_ref(), &user)?.unwrap_or_default(),
            merge_strict(self.astro_params.as_ref(), &astro)?.unwrap_or_default(),
            merge_strict(self.flag_options.as_ref(), &flags)?.unwrap_or_default(),
        )?;
        inputs.validate(globals)?;
        Ok(inputs)
    }
}

/// Whether a supplied box can be used as-is (computed, or purged with a
/// record to reload from).
pub(crate) fn is_usable(data: &BoxData) -> bool {
    matches!(data.state(), BoxState::Computed | BoxState::Purged)
}

pub(crate) fn usable<T: OutputStruct>(given: Option<&T>) -> Option<&T> {
    given.filter(|t| is_usable(t))
}

/// Non-placeholder boxes among `boxes`.
pub(crate) fn carriers<'b>(boxes: &[Option<&'b BoxData>]) -> Vec<&'b BoxData> {
    boxes
        .iter()
        .flatten()
        .copied()
        .filter(|b| !b.is_placeholder())
        .collect()
}

/// Merge an explicit redshift with those of same-redshift predecessors.
///
/// Values within tolerance are normalised to the predecessor's.
pub(crate) fn resolve_redshift(explicit: Option<f64>, carriers: &[&BoxData]) -> Result<Option<f64>> {
    let mut redshift = explicit;
    for carrier in carriers {
        let Some(z) = carrier.redshift() else {
            continue;
        };
        match redshift {
            Some(current) if !redshifts_match(current, z) => {
                return Err(Error::Redshift(format!(
                    "{} is at z={z} but z={current} was requested",
                    carrier.kind()
                )));
            }
            _ => redshift = Some(z),
        }
    }
    if let Some(z) = redshift {
        check_redshift(z)?;
    }
    Ok(redshift)
}

pub(crate) fn require_redshift(redshift: Option<f64>, kind: OutputKind) -> Result<f64> {
    redshift.ok_or_else(|| {
        Error::Redshift(format!(
            "{} needs a redshift, either given or from a predecessor",
            kind.stage()
        ))
    })
}

pub(crate) fn check_redshift(z: f64) -> Result<()> {
    if !z.is_finite() || z < 0.0 {
        return Err(Error::Redshift(format!("{z} is not a valid redshift")));
    }
    Ok(())
}

/// One step back in redshift, or `None` past the heating ceiling.
pub fn step_back(z: f64, globals: &GlobalParams) -> Option<f64> {
    let prev = (1.0 + z) * globals.zprime_step_factor - 1.0;
    (prev <= globals.z_heat_max).then_some(prev)
}

/// Resolve a history predecessor: use the given box, stand in a placeholder,
/// or recurse to `prev_z`.
///
/// `enabled` is false when the feature that needs the history is off (dummy);
/// `prev_z` is `None` when stepping back passes the heating ceiling
/// (zero-filled initial box).
pub(crate) fn resolve_prior<'g, T: OutputStruct + Clone>(
    given: Option<&'g T>,
    enabled: bool,
    prev_z: Option<f64>,
    inputs: &InputParameters,
    globals: &GlobalParams,
    recurse: impl FnOnce(f64) -> Result<T>,
) -> Result<Cow<'g, T>> {
    if let Some(given) = usable(given) {
        return Ok(Cow::Borrowed(given));
    }
    if !enabled {
        return Ok(Cow::Owned(T::dummy(inputs)));
    }
    match prev_z {
        Some(z) => {
            debug!(kind = %T::KIND, redshift = z, "Resolving predecessor");
            recurse(z).map(Cow::Owned)
        }
        None => Ok(Cow::Owned(T::initial(inputs, None, globals))),
    }
}

/// A supplied same-redshift predecessor, or one resolved on demand.
pub(crate) fn given_or<'g, T: OutputStruct + Clone>(
    given: Option<&'g T>,
    resolve: impl FnOnce() -> Result<T>,
) -> Result<Cow<'g, T>> {
    match usable(given) {
        Some(t) => Ok(Cow::Borrowed(t)),
        None => resolve().map(Cow::Owned),
    }
}

/// Initial conditions, resolved at most once per stage call.
pub(crate) struct LazyInit<'i> {
    given: Option<&'i InitialConditions>,
    owned: Option<InitialConditions>,
}

impl<'i> LazyInit<'i> {
    pub fn new(given: Option<&'i InitialConditions>) -> Self {
        Self {
            given: usable(given),
            owned: None,
        }
    }

    /// The initial conditions, reading or computing them on first use.
    ///
    /// Fills in `inputs.random_seed` if it was unknown.
    pub fn get(
        &mut self,
        ctx: &mut StageContext<'_>,
        inputs: &mut InputParameters,
    ) -> Result<&InitialConditions> {
        if self.given.is_none() && self.owned.is_none() {
            self.owned = Some(initial_conditions(ctx, &ParamArgs::from(&*inputs))?);
        }
        let ics = self
            .given
            .or(self.owned.as_ref())
            .ok_or_else(|| Error::NotComputed {
                kind: OutputKind::InitialConditions,
                message: "initial conditions could not be resolved".into(),
            })?;
        if inputs.random_seed.is_none() {
            inputs.random_seed = ics.random_seed();
        }
        Ok(ics)
    }
}

/// Give `out` the resolved seed if it was built before the seed was known.
pub(crate) fn adopt_seed(out: &mut BoxData, inputs: &InputParameters) {
    if out.random_seed().is_none() {
        if let Some(seed) = inputs.random_seed {
            out.set_random_seed(seed);
        }
    }
}
