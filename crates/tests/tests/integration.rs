//! End-to-end tests of the orchestration core against the analytic engine.
//!
//! Each test gets its own temporary cache directory through [`TestHarness`].

use std::cell::Cell;

use reionize_params::{FlagOptions, InputParameters};
use reionize_runtime::stages::{
    initial_conditions, ionize_box, perturb_field, step_back, IonizeArgs, PerturbFieldArgs,
};
use reionize_runtime::{
    coeval_required_redshifts, logscroll, query_cache, read_lightcone, AngularLightconer,
    CacheQuery, CallbackSchedule, Error, Identity, IonizedBox, Lightcone, LightconeOptions,
    OutputKind, OutputStruct, ParamArgs, RectilinearLightconer, BRIGHTNESS_TEMP_WITH_RSDS,
    LOS_VELOCITY,
};
use reionize_tests::{small_inputs, TestHarness, TEST_SEED};

fn history_flags() -> FlagOptions {
    FlagOptions {
        inhomo_reco: true,
        ..Default::default()
    }
}

fn fast_overrides() -> Vec<(String, f64)> {
    vec![
        ("Z_HEAT_MAX".to_string(), 11.0),
        ("ZPRIME_STEP_FACTOR".to_string(), 1.05),
    ]
}

/// Halo grids feeding the X-ray sources of a fluctuating spin temperature.
fn halo_ts_flags() -> FlagOptions {
    FlagOptions {
        use_halo_field: true,
        use_mass_dependent_zeta: true,
        use_ts_fluct: true,
        ..Default::default()
    }
}

fn halo_ts_overrides() -> Vec<(String, f64)> {
    let mut overrides = fast_overrides();
    overrides.push(("NUM_FILTER_STEPS_FOR_Ts".to_string(), 6.0));
    overrides
}

fn assert_same_lightcone(a: &Lightcone, b: &Lightcone) {
    assert_eq!(a.node_redshifts, b.node_redshifts);
    assert_eq!(a.lightcones, b.lightcones);
    assert_eq!(a.global_quantities, b.global_quantities);
    assert_eq!(a.log10_mturnovers, b.log10_mturnovers);
    assert_eq!(a.current_index, b.current_index);
}

fn lightconer(inputs: &InputParameters) -> RectilinearLightconer {
    RectilinearLightconer::with_equal_cdist_slices(
        7.0,
        9.0,
        inputs.user_params.cell_size(),
        &inputs.cosmo_params,
        &["brightness_temp", "xH_box"],
        None,
        false,
    )
    .unwrap()
}

// ============================================================================
// Cache
// ============================================================================

/// Same identity twice with writing on: the second call is a cache hit.
#[test]
fn test_cache_idempotence() {
    let mut harness = TestHarness::new();
    let params = harness.params();

    let first = initial_conditions(&mut harness.ctx(), &params).unwrap();
    let field = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 8.0,
            params: params.clone(),
            initial_conditions: Some(&first),
        },
    )
    .unwrap();
    assert_eq!(harness.engine.calls(OutputKind::InitialConditions), 1);
    assert_eq!(harness.engine.calls(OutputKind::PerturbedField), 1);

    harness.engine.reset();
    let second = initial_conditions(&mut harness.ctx(), &params).unwrap();
    let again = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 8.0,
            params,
            initial_conditions: None,
        },
    )
    .unwrap();

    assert_eq!(harness.engine.total_calls(), 0);
    assert_eq!(first.arrays(), second.arrays());
    assert_eq!(field.arrays(), again.arrays());
}

#[test]
fn test_purge_read_round_trip() {
    let mut harness = TestHarness::new();
    let params = harness.params();
    let mut field = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 9.0,
            params,
            initial_conditions: None,
        },
    )
    .unwrap();
    let before = field.arrays().clone();

    field.purge(&[], false).unwrap();
    assert!(field.array("density").is_none());

    field.read(harness.direc()).unwrap();
    assert_eq!(field.arrays(), &before);
}

#[test]
fn test_purge_without_write_needs_force() {
    let mut harness = TestHarness::new();
    let params = harness.params();
    let io = harness.io().with_write(false);
    let mut field = perturb_field(
        &mut harness.ctx_with(io),
        PerturbFieldArgs {
            redshift: 9.0,
            params,
            initial_conditions: None,
        },
    )
    .unwrap();

    let err = field.purge(&[], false).unwrap_err();
    assert!(matches!(err, Error::UnsafePurge(OutputKind::PerturbedField)));
    field.purge(&[], true).unwrap();
}

// ============================================================================
// Parameter and redshift resolution
// ============================================================================

#[test]
fn test_strict_merge_law() {
    let mut harness = TestHarness::new();
    let params = harness.params();
    let ics = initial_conditions(&mut harness.ctx(), &params).unwrap();

    // Same value both ways.
    let field = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 8.0,
            params: params.clone(),
            initial_conditions: Some(&ics),
        },
    )
    .unwrap();
    assert_eq!(field.identity().user_params.box_len, 30.0);

    // Disagreeing value given explicitly.
    let mut other = small_inputs(TEST_SEED);
    other.user_params.box_len = 45.0;
    let err = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 8.0,
            params: ParamArgs::from(&other),
            initial_conditions: Some(&ics),
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");

    // Disagreeing seed.
    let err = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 8.0,
            params: ParamArgs::from(&small_inputs(TEST_SEED + 1)),
            initial_conditions: Some(&ics),
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");
}

#[test]
fn test_redshift_disagreement_rejected() {
    let mut harness = TestHarness::new();
    let params = harness.params();
    let field = perturb_field(
        &mut harness.ctx(),
        PerturbFieldArgs {
            redshift: 8.1,
            params: params.clone(),
            initial_conditions: None,
        },
    )
    .unwrap();

    let err = ionize_box(
        &mut harness.ctx(),
        IonizeArgs {
            redshift: Some(8.0),
            params: params.clone(),
            perturbed_field: Some(&field),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Redshift(_)), "got {err:?}");

    // Within tolerance the predecessor's redshift wins.
    let ionized = ionize_box(
        &mut harness.ctx(),
        IonizeArgs {
            redshift: Some(8.1 + 1e-7),
            params,
            perturbed_field: Some(&field),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(ionized.redshift(), Some(8.1));
}

// ============================================================================
// Schedules
// ============================================================================

#[test]
fn test_schedule_monotonicity() {
    for &(min_z, max_z, factor) in &[(6.0, 35.0, 1.02), (5.5, 12.0, 1.3), (7.0, 7.5, 1.01)] {
        let zs = logscroll(min_z, max_z, factor).unwrap();
        assert!(zs.windows(2).all(|w| w[0] > w[1]), "{zs:?}");
        let lowest = *zs.last().unwrap();
        assert!(lowest <= min_z + 1e-9);
        assert!(zs[0] >= max_z);
        for w in zs.windows(2) {
            let stepped = (1.0 + w[1]) * factor - 1.0;
            assert!((stepped - w[0]).abs() < 1e-9, "{} -> {}", w[1], w[0]);
        }
    }
}

/// An ionised box with recombinations and no previous box computes and
/// caches the one a step back first.
#[test]
fn test_missing_predecessor_forces_recursion() {
    let mut harness = TestHarness::new().with_flags(history_flags());
    harness.globals.z_heat_max = 10.0;
    let params = harness.params();

    let ionized = ionize_box(
        &mut harness.ctx(),
        IonizeArgs {
            redshift: Some(8.0),
            params,
            ..Default::default()
        },
    )
    .unwrap();

    let prev_z = (1.0 + 8.0) * harness.globals.zprime_step_factor - 1.0;
    assert_eq!(
        ionized.identity().lineage.get("prev_ionize_redshift"),
        Some(&prev_z)
    );
    assert!(harness.engine.calls(OutputKind::IonizedBox) > 1);

    let hits = query_cache(
        harness.direc(),
        &CacheQuery {
            kind: Some(OutputKind::IonizedBox),
            redshift: Some(prev_z),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(hits.len(), 1);

    let expected = IonizedBox::from_data(reionize_runtime::BoxData::new(
        Identity::new(OutputKind::IonizedBox, &harness.inputs, Some(prev_z))
            .with_lineage("prev_ionize_redshift", step_back(prev_z, &harness.globals)),
    ));
    assert!(expected.exists(harness.direc()));
}

// ============================================================================
// Coeval driver
// ============================================================================

#[test]
fn test_coeval_determinism() {
    let xh = || {
        let mut harness = TestHarness::new();
        let coeval = harness
            .coeval(&[8.0], Default::default())
            .unwrap()
            .single()
            .unwrap();
        assert_eq!(coeval.inputs().random_seed, Some(TEST_SEED));
        coeval.get("xH_box").unwrap().clone()
    };
    assert_eq!(xh(), xh());
}

#[test]
fn test_halo_spin_coeval_determinism() {
    let run = || {
        let mut harness = TestHarness::new().with_flags(halo_ts_flags());
        harness.globals.z_heat_max = 11.0;
        harness.globals.zprime_step_factor = 1.05;
        harness.globals.num_filter_steps_for_ts = 6;
        let steps =
            coeval_required_redshifts(&[8.0], &harness.inputs.flag_options, &harness.globals)
                .unwrap();
        assert_eq!(steps[0], 11.0);

        let coeval = harness
            .coeval(&[8.0], Default::default())
            .unwrap()
            .single()
            .unwrap();
        // One halo grid per step, each feeding the next step's X-ray filter.
        assert_eq!(harness.engine.calls(OutputKind::HaloBox), steps.len());
        assert!(harness.engine.calls(OutputKind::XraySourceBox) > 0);
        assert_eq!(harness.engine.calls(OutputKind::TsBox), steps.len());
        assert!(coeval.ts_box.is_some() && coeval.halobox.is_some());

        let xray = query_cache(
            harness.direc(),
            &CacheQuery {
                kind: Some(OutputKind::XraySourceBox),
                redshift: Some(8.0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(xray.len(), 1);
        assert_eq!(xray[0].1.identity().lineage.get("oldest_halo_redshift"), Some(&11.0));

        (
            coeval.get("spin_temperature").unwrap().clone(),
            coeval.get("xH_box").unwrap().clone(),
            coeval.get("brightness_temp").unwrap().clone(),
        )
    };
    let first = run();
    assert!(first.0.iter().all(|t| t.is_finite() && *t > 0.0));
    assert_eq!(first, run());
}

#[test]
fn test_coeval_reuses_cache() {
    let mut harness = TestHarness::new().with_flags(history_flags());
    let options = || reionize_runtime::CoevalOptions {
        global_overrides: fast_overrides(),
        ..Default::default()
    };
    let first = harness.coeval(&[8.0, 9.0], options()).unwrap().into_vec();
    assert!(harness.engine.calls(OutputKind::IonizedBox) >= 2);

    harness.engine.reset();
    let second = harness.coeval(&[8.0, 9.0], options()).unwrap().into_vec();
    assert_eq!(harness.engine.total_calls(), 0);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.brightness_temp.arrays(), b.brightness_temp.arrays());
    }
    // Overrides do not outlive the call.
    assert_eq!(harness.globals.z_heat_max, 35.0);
}

// ============================================================================
// Lightcone driver
// ============================================================================

#[test]
fn test_lightcone_resume_matches_single_pass() {
    let inputs = small_inputs(TEST_SEED);
    let lc = lightconer(&inputs);

    let mut single = TestHarness::with_inputs(inputs.clone()).with_flags(history_flags());
    let reference = single
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                global_overrides: fast_overrides(),
                ..Default::default()
            },
        )
        .unwrap()
        .lightcone;
    assert!(reference.is_complete());

    let mut split = TestHarness::with_inputs(inputs).with_flags(history_flags());
    let checkpoint = split.direc().join("lightcone.ckpt");
    let partial = split
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                global_overrides: fast_overrides(),
                checkpoint: Some(checkpoint.clone()),
                return_at_z: Some(8.0),
                ..Default::default()
            },
        )
        .unwrap()
        .lightcone;
    assert!(!partial.is_complete());
    let stopped_at = partial.current_redshift.unwrap();
    let remaining = partial
        .node_redshifts
        .iter()
        .filter(|&&z| z < stopped_at)
        .count();
    assert!(remaining > 0);

    split.engine.reset();
    let resumed = split
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                global_overrides: fast_overrides(),
                checkpoint: Some(checkpoint),
                ..Default::default()
            },
        )
        .unwrap()
        .lightcone;

    assert_eq!(split.engine.calls(OutputKind::IonizedBox), remaining);
    assert_eq!(split.engine.calls(OutputKind::InitialConditions), 0);
    assert_eq!(resumed.node_redshifts, reference.node_redshifts);
    assert_eq!(resumed.lightcones, reference.lightcones);
    assert_eq!(resumed.global_quantities, reference.global_quantities);
    assert_eq!(resumed.log10_mturnovers, reference.log10_mturnovers);
    assert_eq!(resumed.current_index, reference.current_index);
}

/// A run stopped by a failing first callback resumes to the same lightcone,
/// with the halo-grid history read back from the cache.
#[test]
fn test_halo_spin_lightcone_resume_after_interruption() {
    let inputs = small_inputs(TEST_SEED);
    let lc = lightconer(&inputs);

    let mut single = TestHarness::with_inputs(inputs.clone()).with_flags(halo_ts_flags());
    let reference = single
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                global_overrides: halo_ts_overrides(),
                ..Default::default()
            },
        )
        .unwrap()
        .lightcone;
    assert!(reference.is_complete());
    assert!(single.engine.calls(OutputKind::XraySourceBox) > 0);

    let mut split = TestHarness::with_inputs(inputs).with_flags(halo_ts_flags());
    let checkpoint = split.direc().join("halo_ts.ckpt");
    let err = split
        .lightcone(
            &lc,
            LightconeOptions {
                global_overrides: halo_ts_overrides(),
                checkpoint: Some(checkpoint.clone()),
                callback_schedule: CallbackSchedule::At(vec![8.0]),
                coeval_callback: Some(Box::new(|_: &reionize_runtime::Coeval| -> anyhow::Result<()> {
                    anyhow::bail!("interrupted")
                })),
                ..Default::default()
            },
        )
        .unwrap_err();
    let Error::Callback { redshift: stopped_at, .. } = err else {
        panic!("expected a callback error, got {err:?}");
    };

    let partial = read_lightcone(&checkpoint).unwrap();
    assert_eq!(partial.current_redshift, Some(stopped_at));
    assert!(!partial.is_complete());
    let remaining = reference
        .node_redshifts
        .iter()
        .filter(|&&z| z < stopped_at)
        .count();
    assert!(remaining > 0);

    split.engine.reset();
    let resumed = split
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                global_overrides: halo_ts_overrides(),
                checkpoint: Some(checkpoint),
                ..Default::default()
            },
        )
        .unwrap()
        .lightcone;

    assert_eq!(split.engine.calls(OutputKind::IonizedBox), remaining);
    assert_eq!(split.engine.calls(OutputKind::HaloBox), remaining);
    assert_eq!(split.engine.calls(OutputKind::TsBox), remaining);
    assert_same_lightcone(&resumed, &reference);
}

/// The RSD-corrected brightness temperature appears once, when the angular
/// lightcone is complete, and survives in the checkpoint.
#[test]
fn test_angular_lightcone_rsds_at_completion() {
    let mut inputs = small_inputs(TEST_SEED);
    inputs.user_params.keep_3d_velocities = true;
    let mut harness = TestHarness::with_inputs(inputs);
    let lc = AngularLightconer::with_equal_cdist_slices(
        7.0,
        9.0,
        harness.inputs.user_params.cell_size(),
        &harness.inputs.cosmo_params,
        &[0.0, 0.3, -0.4],
        &[0.0, 1.2, 2.5],
        &["brightness_temp"],
        true,
    )
    .unwrap();
    let checkpoint = harness.direc().join("angular.ckpt");
    let options = |return_at_z| LightconeOptions::<()> {
        checkpoint: Some(checkpoint.clone()),
        return_at_z,
        ..Default::default()
    };

    let partial = harness.lightcone(&lc, options(Some(8.0))).unwrap().lightcone;
    assert!(!partial.is_complete());
    assert!(partial.lightcones.contains_key(LOS_VELOCITY));
    assert!(!partial.lightcones.contains_key(BRIGHTNESS_TEMP_WITH_RSDS));
    assert!(read_lightcone(&checkpoint).unwrap().derived_fields.is_empty());

    let mut done = harness.lightcone(&lc, options(None)).unwrap().lightcone;
    assert!(done.is_complete());
    assert_eq!(done.derived_fields, vec![BRIGHTNESS_TEMP_WITH_RSDS.to_string()]);
    let rsd = done.lightcones[BRIGHTNESS_TEMP_WITH_RSDS].clone();
    assert_eq!(rsd.shape(), done.lightcones["brightness_temp"].shape());
    assert!(rsd.iter().all(|v| v.is_finite()));

    let stored = read_lightcone(&checkpoint).unwrap();
    assert_eq!(stored.derived_fields, done.derived_fields);
    assert_eq!(stored.lightcones[BRIGHTNESS_TEMP_WITH_RSDS], rsd);

    // Neither a finished checkpoint nor a second pass recomputes it.
    harness.engine.reset();
    let again = harness.lightcone(&lc, options(None)).unwrap().lightcone;
    assert_eq!(harness.engine.total_calls(), 0);
    assert_eq!(again.derived_fields.len(), 1);
    done.compute_rsds(harness.inputs.astro_params.n_rsd_steps).unwrap();
    assert_eq!(done.derived_fields.len(), 1);
    assert_eq!(done.lightcones[BRIGHTNESS_TEMP_WITH_RSDS], rsd);
}

#[test]
fn test_complete_checkpoint_returns_without_compute() {
    let mut harness = TestHarness::new();
    let lc = lightconer(&harness.inputs);
    let checkpoint = harness.direc().join("done.ckpt");
    let options = || LightconeOptions::<()> {
        checkpoint: Some(checkpoint.clone()),
        ..Default::default()
    };

    let first = harness.lightcone(&lc, options()).unwrap().lightcone;
    assert!(first.is_complete());
    assert!(first.current_index < first.n_slices());

    harness.engine.reset();
    let again = harness.lightcone(&lc, options()).unwrap().lightcone;
    assert_eq!(harness.engine.total_calls(), 0);
    assert_eq!(again.lightcones, first.lightcones);
}

#[test]
fn test_checkpoint_rejects_other_parameters() {
    let mut harness = TestHarness::new();
    let lc = lightconer(&harness.inputs);
    let checkpoint = harness.direc().join("lc.ckpt");
    harness
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                checkpoint: Some(checkpoint.clone()),
                return_at_z: Some(8.5),
                ..Default::default()
            },
        )
        .unwrap();

    harness.inputs.astro_params.hii_eff_factor = 45.0;
    let err = harness
        .lightcone::<()>(
            &lc,
            LightconeOptions {
                checkpoint: Some(checkpoint),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Incompatible { .. }), "got {err:?}");
}

#[test]
fn test_lightcone_callbacks() {
    let mut harness = TestHarness::new();
    let lc = lightconer(&harness.inputs);
    let calls = Cell::new(0usize);

    let run = harness
        .lightcone(
            &lc,
            LightconeOptions {
                callback_schedule: CallbackSchedule::Every(2),
                coeval_callback: Some(Box::new(|coeval: &reionize_runtime::Coeval| {
                    calls.set(calls.get() + 1);
                    if calls.get() == 2 {
                        anyhow::bail!("flaky callback");
                    }
                    Ok(coeval.redshift)
                })),
                ..Default::default()
            },
        )
        .unwrap();

    let n_nodes = run.lightcone.node_redshifts.len();
    assert_eq!(calls.get(), n_nodes.div_ceil(2));
    // The failing second call is skipped, the rest are kept.
    assert_eq!(run.callback_outputs.len(), calls.get() - 1);
    for (z, out) in &run.callback_outputs {
        assert_eq!(z, out);
    }
}

#[test]
fn test_first_callback_failure_is_fatal() {
    let mut harness = TestHarness::new();
    let lc = lightconer(&harness.inputs);
    let err = harness
        .lightcone(
            &lc,
            LightconeOptions {
                coeval_callback: Some(Box::new(|_: &reionize_runtime::Coeval| -> anyhow::Result<()> {
                    anyhow::bail!("broken")
                })),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Callback { .. }), "got {err:?}");
}

#[test]
fn test_return_at_z_requires_write() {
    let mut harness = TestHarness::new();
    let lc = lightconer(&harness.inputs);
    let io = harness.io().with_write(false);
    let err = reionize_runtime::run_lightcone::<()>(
        &mut harness.engine,
        &mut harness.globals,
        io,
        &lc,
        LightconeOptions {
            params: ParamArgs::from(&harness.inputs),
            return_at_z: Some(8.0),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");
    assert_eq!(harness.engine.total_calls(), 0);
}
