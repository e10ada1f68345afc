//! Matter stages: initial conditions, perturbed fields and halo catalogs.

use rand::Rng;
use reionize_foundation::REDSHIFT_ATOL;
use reionize_params::{GlobalParams, ParamError, UserParams};
use tracing::{debug, info};

use super::{
    adopt_seed, carriers, check_redshift, require_redshift, resolve_redshift, usable, LazyInit,
    ParamArgs,
};
use crate::context::{CallArgs, StageContext};
use crate::outputs::{
    BoxData, HaloField, Identity, InitialConditions, OutputStruct, PerturbHaloField, PerturbedField,
};
use crate::Result;

/// Minimum halo buffer for sampled catalogs.
const MIN_HALO_BUFFER: f64 = 1e6;
/// Minimum halo buffer for perturbed catalogs.
const MIN_PERTURBED_HALO_BUFFER: f64 = 1e3;

/// Compute (or read) the initial conditions.
///
/// With no seed anywhere, a cached record with any seed is accepted; on a
/// miss a fresh seed is drawn.
pub fn initial_conditions(ctx: &mut StageContext<'_>, params: &ParamArgs) -> Result<InitialConditions> {
    let mut inputs = params.resolve(&[], ctx.globals())?;
    let mut ics = InitialConditions::uncomputed(&inputs, None);
    if ctx.try_read(&mut ics)? {
        return Ok(ics);
    }
    if inputs.random_seed.is_none() {
        let seed = u64::from(rand::thread_rng().gen::<u32>());
        info!(seed, "No random seed given, drew a new one");
        inputs.random_seed = Some(seed);
        ics = InitialConditions::uncomputed(&inputs, None);
    }
    ctx.compute(&inputs, &mut ics, &[], CallArgs::default())?;
    Ok(ics)
}

#[derive(Debug, Clone, Default)]
pub struct PerturbFieldArgs<'a> {
    pub redshift: f64,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
}

/// Evolve the initial density and velocity fields to `redshift`.
pub fn perturb_field(ctx: &mut StageContext<'_>, args: PerturbFieldArgs<'_>) -> Result<PerturbedField> {
    let given_ics = usable(args.initial_conditions);
    let mut inputs = args
        .params
        .resolve(&carriers(&[given_ics.map(|i| i.data())]), ctx.globals())?;
    check_redshift(args.redshift)?;

    let mut field = PerturbedField::uncomputed(&inputs, Some(args.redshift));
    if ctx.try_read(&mut field)? {
        return Ok(field);
    }

    let mut init = LazyInit::new(given_ics);
    let ics = init.get(ctx, &mut inputs)?;
    adopt_seed(&mut field, &inputs);
    field.check_compatible(&[ics.data()], &["redshift"])?;
    ctx.compute(&inputs, &mut field, &[("init_boxes", ics.data())], CallArgs::default())?;
    Ok(field)
}

#[derive(Debug, Clone, Default)]
pub struct HaloListArgs<'a> {
    pub redshift: f64,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
    /// Catalog at the next-lower redshift these halos are progenitors of.
    pub descendant_halos: Option<&'a HaloField>,
}

/// Redshift of the descendant catalog, or `None` for the first box.
fn descendant_redshift(z: f64, user: &UserParams, globals: &GlobalParams) -> Option<f64> {
    let minimum = user.stoc_minimum_z?;
    let desc = (1.0 + z) / globals.zprime_step_factor - 1.0;
    (desc >= minimum - REDSHIFT_ATOL).then_some(desc)
}

fn halo_buffer(expected: f64, factor: f64, floor: f64) -> usize {
    ((expected + 1.0) * factor).max(floor) as usize
}

/// Sample the halo catalog at `redshift`, conditioned on its descendants.
///
/// Without a descendant the chain is walked down to `STOC_MINIMUM_Z`; if that
/// is unset this is the first box of the chain.
pub fn determine_halo_list(ctx: &mut StageContext<'_>, args: HaloListArgs<'_>) -> Result<HaloField> {
    let given_ics = usable(args.initial_conditions);
    let given_desc = usable(args.descendant_halos);
    let mut inputs = args.params.resolve(
        &carriers(&[given_ics.map(|i| i.data()), given_desc.map(|d| d.data())]),
        ctx.globals(),
    )?;
    if !inputs.flag_options.use_halo_field {
        return Err(ParamError::validation(
            "FlagOptions.USE_HALO_FIELD",
            "halo catalogs need USE_HALO_FIELD",
        )
        .into());
    }
    let z = args.redshift;
    check_redshift(z)?;

    let desc_z = match given_desc {
        Some(desc) => {
            let dz = require_redshift(desc.redshift(), desc.kind())?;
            if dz >= z {
                return Err(crate::Error::Redshift(format!(
                    "descendant halos at z={dz} are not below z={z}"
                )));
            }
            Some(dz)
        }
        None => descendant_redshift(z, &inputs.user_params, ctx.globals()),
    };

    let mut halos = HaloField::from_data(BoxData::new(
        Identity::new(HaloField::KIND, &inputs, Some(z)).with_lineage("desc_redshift", desc_z),
    ));
    if ctx.try_read(&mut halos)? {
        return Ok(halos);
    }

    let mut init = LazyInit::new(given_ics);
    let ics = init.get(ctx, &mut inputs)?;
    adopt_seed(&mut halos, &inputs);

    let owned_desc;
    let desc = match (given_desc, desc_z) {
        (Some(desc), _) => desc,
        (None, Some(dz)) => {
            debug!(redshift = z, descendant = dz, "Sampling descendant catalog first");
            owned_desc = determine_halo_list(
                ctx,
                HaloListArgs {
                    redshift: dz,
                    params: ParamArgs::from(&inputs),
                    initial_conditions: Some(ics),
                    descendant_halos: None,
                },
            )?;
            &owned_desc
        }
        (None, None) => {
            owned_desc = HaloField::dummy(&inputs);
            &owned_desc
        }
    };
    halos.check_compatible(&[ics.data(), desc.data()], &["redshift"])?;

    let globals = ctx.globals();
    let expected = ctx.engine().expected_n_halos(z, &inputs, globals);
    let buffer = halo_buffer(expected, globals.maxhalo_factor, MIN_HALO_BUFFER);
    debug!(redshift = z, expected, buffer, "Halo buffer sized");
    ctx.compute(
        &inputs,
        &mut halos,
        &[("init_boxes", ics.data()), ("halos_desc", desc.data())],
        CallArgs {
            halo_buffer: Some(buffer),
            ..Default::default()
        },
    )?;
    Ok(halos)
}

#[derive(Debug, Clone, Default)]
pub struct PerturbHaloArgs<'a> {
    pub redshift: Option<f64>,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
    pub halo_field: Option<&'a HaloField>,
}

/// Move a halo catalog to its perturbed positions.
pub fn perturb_halo_list(
    ctx: &mut StageContext<'_>,
    args: PerturbHaloArgs<'_>,
) -> Result<PerturbHaloField> {
    let given_ics = usable(args.initial_conditions);
    let given_halos = usable(args.halo_field);
    let halo_data = given_halos.map(|h| h.data());
    let mut inputs = args
        .params
        .resolve(&carriers(&[given_ics.map(|i| i.data()), halo_data]), ctx.globals())?;
    let z = require_redshift(
        resolve_redshift(args.redshift, &carriers(&[halo_data]))?,
        PerturbHaloField::KIND,
    )?;
    let desc_z = match given_halos {
        Some(h) => h.identity().lineage.get("desc_redshift").copied(),
        None => descendant_redshift(z, &inputs.user_params, ctx.globals()),
    };

    let mut pt_halos = PerturbHaloField::from_data(BoxData::new(
        Identity::new(PerturbHaloField::KIND, &inputs, Some(z)).with_lineage("desc_redshift", desc_z),
    ));
    if ctx.try_read(&mut pt_halos)? {
        return Ok(pt_halos);
    }

    let mut init = LazyInit::new(given_ics);
    let ics = init.get(ctx, &mut inputs)?;
    adopt_seed(&mut pt_halos, &inputs);
    let owned_halos;
    let halos = match given_halos {
        Some(h) => h,
        None => {
            owned_halos = determine_halo_list(
                ctx,
                HaloListArgs {
                    redshift: z,
                    params: ParamArgs::from(&inputs),
                    initial_conditions: Some(ics),
                    descendant_halos: None,
                },
            )?;
            &owned_halos
        }
    };
    pt_halos.check_compatible(&[ics.data(), halos.data()], &[])?;

    let n_halos = halos.scalar("n_halos").unwrap_or(0.0);
    let buffer = halo_buffer(n_halos, ctx.globals().maxhalo_factor, MIN_PERTURBED_HALO_BUFFER);
    ctx.compute(
        &inputs,
        &mut pt_halos,
        &[("init_boxes", ics.data()), ("halo_field", halos.data())],
        CallArgs {
            halo_buffer: Some(buffer),
            ..Default::default()
        },
    )?;
    Ok(pt_halos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytic::AnalyticEngine;
    use crate::config::IoOptions;
    use reionize_params::{AstroParams, FlagOptions, InputParameters};

    fn inputs(seed: u64) -> InputParameters {
        let mut inputs = InputParameters::with_seed(seed);
        inputs.user_params.hii_dim = 6;
        inputs.user_params.dim = Some(12);
        inputs.user_params.box_len = 30.0;
        inputs.astro_params = AstroParams {
            r_bubble_max: Some(5.0),
            ..Default::default()
        };
        inputs
    }

    fn halo_inputs() -> InputParameters {
        let mut inputs = inputs(5);
        inputs.flag_options = FlagOptions {
            use_halo_field: true,
            use_mass_dependent_zeta: true,
            ..Default::default()
        };
        inputs
    }

    #[test]
    fn test_perturb_field_reads_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = GlobalParams::default();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let params = ParamArgs::from(&inputs(7));

        let first = perturb_field(
            &mut ctx,
            PerturbFieldArgs {
                redshift: 9.0,
                params: params.clone(),
                initial_conditions: None,
            },
        )
        .unwrap();
        let second = perturb_field(
            &mut ctx,
            PerturbFieldArgs {
                redshift: 9.0,
                params,
                initial_conditions: None,
            },
        )
        .unwrap();
        assert_eq!(first.arrays(), second.arrays());
        assert!(second.path().is_some());
    }

    #[test]
    fn test_initial_conditions_draws_seed() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = GlobalParams::default();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let mut params = ParamArgs::from(&inputs(1));
        params.random_seed = None;
        let ics = initial_conditions(&mut ctx, &params).unwrap();
        let seed = ics.random_seed().unwrap();

        // Reading back with an unknown seed finds the same record.
        let again = initial_conditions(&mut ctx, &params).unwrap();
        assert_eq!(again.random_seed(), Some(seed));
    }

    #[test]
    fn test_halo_chain_walks_to_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let mut globals = GlobalParams::default();
        globals.zprime_step_factor = 1.5;
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let mut inputs = halo_inputs();
        inputs.user_params.stoc_minimum_z = Some(6.0);

        let halos = determine_halo_list(
            &mut ctx,
            HaloListArgs {
                redshift: 9.5,
                params: ParamArgs::from(&inputs),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(halos.identity().lineage.get("desc_redshift"), Some(&6.0));

        let first = HaloField::from_data(BoxData::new(Identity::new(
            HaloField::KIND,
            &inputs,
            Some(6.0),
        )));
        assert!(first.exists(dir.path()));
    }

    #[test]
    fn test_halo_list_requires_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = GlobalParams::default();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let err = determine_halo_list(
            &mut ctx,
            HaloListArgs {
                redshift: 8.0,
                params: ParamArgs::from(&inputs(1)),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("USE_HALO_FIELD"));
    }

    #[test]
    fn test_perturb_halo_list_from_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = GlobalParams::default();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = halo_inputs();
        let halos = determine_halo_list(
            &mut ctx,
            HaloListArgs {
                redshift: 8.0,
                params: ParamArgs::from(&inputs),
                ..Default::default()
            },
        )
        .unwrap();
        let pt = perturb_halo_list(
            &mut ctx,
            PerturbHaloArgs {
                halo_field: Some(&halos),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pt.redshift(), Some(8.0));
        assert_eq!(pt.scalar("n_halos"), halos.scalar("n_halos"));
        assert_eq!(pt.array("halo_masses"), halos.array("halo_masses"));
    }
}
