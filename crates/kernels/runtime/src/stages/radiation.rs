//! Radiative stages: halo grids, X-ray sources, spin temperature, ionisation
//! and the brightness temperature.

use std::borrow::Cow;

use ndarray::{ArrayD, Zip};
use reionize_foundation::redshifts_match;
use reionize_params::{InputParameters, ParamError};
use tracing::debug;

use super::structure::{perturb_field, perturb_halo_list, PerturbFieldArgs, PerturbHaloArgs};
use super::{
    adopt_seed, carriers, check_redshift, given_or, require_redshift, resolve_prior,
    resolve_redshift, step_back, usable, LazyInit, ParamArgs,
};
use crate::context::{CallArgs, StageContext};
use crate::outputs::{
    BoxData, BrightnessTemp, HaloBox, Identity, InitialConditions, IonizedBox, OutputStruct,
    PerturbHaloField, PerturbedField, TsBox, XraySourceBox,
};
use crate::schedule::heating_scroll;
use crate::{Error, Result};

/// Halo-grid fields the X-ray stage interpolates in time.
const INTERPOLATED_FIELDS: [&str; 3] = ["halo_sfr", "halo_sfr_mini", "halo_xray"];

fn require_halo_field(inputs: &InputParameters) -> Result<()> {
    if inputs.flag_options.use_halo_field {
        Ok(())
    } else {
        Err(ParamError::validation(
            "FlagOptions.USE_HALO_FIELD",
            "halo grids and X-ray source fields need USE_HALO_FIELD",
        )
        .into())
    }
}

fn data_of<T: OutputStruct>(t: Option<&T>) -> Option<&BoxData> {
    t.map(|t| t.data())
}

#[derive(Debug, Clone, Default)]
pub struct HaloBoxArgs<'a> {
    pub redshift: Option<f64>,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
    pub perturbed_field: Option<&'a PerturbedField>,
    pub perturbed_halo_list: Option<&'a PerturbHaloField>,
    pub previous_spin_temp: Option<&'a TsBox>,
    pub previous_ionize_box: Option<&'a IonizedBox>,
}

/// Grid halo properties onto the low-res box.
///
/// The perturbed field is only needed with `FIXED_HALO_GRIDS` or
/// `AVG_BELOW_SAMPLER`; the halo list only without `FIXED_HALO_GRIDS`. The
/// previous spin temperature and ionised box feed the Lyman-Werner feedback
/// on minihalos and are dummies otherwise.
pub fn compute_halo_grid(ctx: &mut StageContext<'_>, args: HaloBoxArgs<'_>) -> Result<HaloBox> {
    let given_ics = usable(args.initial_conditions);
    let given_field = usable(args.perturbed_field);
    let given_halos = usable(args.perturbed_halo_list);
    let same_z = carriers(&[data_of(given_field), data_of(given_halos)]);
    let mut all = same_z.clone();
    all.extend(carriers(&[
        data_of(given_ics),
        data_of(usable(args.previous_spin_temp)),
        data_of(usable(args.previous_ionize_box)),
    ]));
    let mut inputs = args.params.resolve(&all, ctx.globals())?;
    require_halo_field(&inputs)?;
    let z = require_redshift(resolve_redshift(args.redshift, &same_z)?, HaloBox::KIND)?;

    let globals = ctx.globals();
    let flags = inputs.flag_options.clone();
    let prev_z = step_back(z, globals);
    // Minihalo feedback makes the grid depend on the previous step.
    let feedback_z = |given: Option<&BoxData>| {
        flags
            .use_mini_halos
            .then(|| given.map_or(prev_z, |g| g.redshift()))
            .flatten()
    };
    let mut hbox = HaloBox::from_data(BoxData::new(
        Identity::new(HaloBox::KIND, &inputs, Some(z))
            .with_lineage(
                "prev_spin_redshift",
                feedback_z(data_of(usable(args.previous_spin_temp))),
            )
            .with_lineage(
                "prev_ionize_redshift",
                feedback_z(data_of(usable(args.previous_ionize_box))),
            ),
    ));
    if ctx.try_read(&mut hbox)? {
        return Ok(hbox);
    }

    let mut init = LazyInit::new(given_ics);
    let ics = init.get(ctx, &mut inputs)?;
    adopt_seed(&mut hbox, &inputs);
    let params = ParamArgs::from(&inputs);

    let field: Cow<'_, PerturbedField> = if flags.fixed_halo_grids || globals.avg_below_sampler {
        given_or(given_field, || {
            perturb_field(
                ctx,
                PerturbFieldArgs {
                    redshift: z,
                    params: params.clone(),
                    initial_conditions: Some(ics),
                },
            )
        })?
    } else {
        Cow::Owned(PerturbedField::dummy(&inputs))
    };

    let pt_halos: Cow<'_, PerturbHaloField> = if flags.fixed_halo_grids {
        Cow::Owned(PerturbHaloField::dummy(&inputs))
    } else {
        given_or(given_halos, || {
            perturb_halo_list(
                ctx,
                PerturbHaloArgs {
                    redshift: Some(z),
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    halo_field: None,
                },
            )
        })?
    };

    let feedback = flags.use_mini_halos && prev_z.is_some();
    let prev_spin = resolve_prior(
        args.previous_spin_temp,
        feedback,
        prev_z,
        &inputs,
        globals,
        |pz| {
            spin_temperature(
                ctx,
                SpinTempArgs {
                    redshift: Some(pz),
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    ..Default::default()
                },
            )
        },
    )?;
    let prev_ion = resolve_prior(
        args.previous_ionize_box,
        feedback,
        prev_z,
        &inputs,
        globals,
        |pz| {
            ionize_box(
                ctx,
                IonizeArgs {
                    redshift: Some(pz),
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    ..Default::default()
                },
            )
        },
    )?;

    hbox.check_compatible(
        &[
            ics.data(),
            field.data(),
            pt_halos.data(),
            prev_spin.data(),
            prev_ion.data(),
        ],
        &["redshift"],
    )?;
    ctx.compute(
        &inputs,
        &mut hbox,
        &[
            ("init_boxes", ics.data()),
            ("perturbed_field", field.data()),
            ("pt_halos", pt_halos.data()),
            ("previous_spin_temp", prev_spin.data()),
            ("previous_ionize_box", prev_ion.data()),
        ],
        CallArgs::default(),
    )?;
    Ok(hbox)
}

#[derive(Debug, Clone, Default)]
pub struct XraySourceArgs<'a> {
    pub redshift: f64,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
    /// Halo grids at this and higher redshifts, in any order. Computed over
    /// the log scroll up to `Z_HEAT_MAX` when not given.
    pub hboxes: Option<&'a [HaloBox]>,
}

fn array_of(data: &BoxData, name: &str) -> Result<ArrayD<f32>> {
    match data.array(name) {
        Some(a) => Ok(a.clone()),
        None => Ok(data.loaded()?.require(name)?.clone()),
    }
}

/// Halo grid at `z_shell`, linearly interpolated between the two bracketing
/// grids of the history (sorted by ascending redshift).
///
/// `None` when the shell lies beyond the history or has no star formation.
fn interpolate_halo_grid(history: &[&HaloBox], z_shell: f64) -> Result<Option<BoxData>> {
    let zs: Vec<f64> = history.iter().map(|h| h.redshift().unwrap_or(0.0)).collect();
    let Some(prog) = zs.iter().position(|&z| z >= z_shell) else {
        return Ok(None);
    };
    let (desc, t) = if prog == 0 {
        (0, 0.0)
    } else {
        let desc = prog - 1;
        (desc, (z_shell - zs[desc]) / (zs[prog] - zs[desc]))
    };

    let mut identity: Identity = history[desc].identity().clone();
    identity.redshift = Some(z_shell);
    let mut out = BoxData::new(identity);
    let tf = t as f32;
    for name in INTERPOLATED_FIELDS {
        let a = array_of(history[desc], name)?;
        let b = array_of(history[prog], name)?;
        if a.shape() != b.shape() {
            return Err(Error::Incompatible {
                field: format!("HaloBox.{name}"),
                this: format!("{:?}", a.shape()),
                other: format!("{:?}", b.shape()),
            });
        }
        let mixed = Zip::from(&a).and(&b).map_collect(|x, y| x * (1.0 - tf) + y * tf);
        out.set_array(name, mixed);
    }
    let mcrit = |i: usize| history[i].scalar("log10_Mcrit_LW_ave").unwrap_or(0.0);
    out.set_scalar("log10_Mcrit_LW_ave", mcrit(desc) * (1.0 - t) + mcrit(prog) * t);

    let silent = ["halo_sfr", "halo_sfr_mini"]
        .iter()
        .all(|name| out.array(name).is_some_and(|a| a.iter().all(|v| *v == 0.0)));
    if silent {
        return Ok(None);
    }
    out.mark_computed();
    Ok(Some(out))
}

/// Halo grids at each of `redshifts`.
fn halo_grid_history(
    ctx: &mut StageContext<'_>,
    redshifts: &[f64],
    inputs: &InputParameters,
    ics: &InitialConditions,
) -> Result<Vec<HaloBox>> {
    debug!(n = redshifts.len(), "Building halo grid history");
    redshifts
        .iter()
        .copied()
        .map(|zz| {
            compute_halo_grid(
                ctx,
                HaloBoxArgs {
                    redshift: Some(zz),
                    params: ParamArgs::from(inputs),
                    initial_conditions: Some(ics),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Nearest halo grid above `z` and the highest one in the history.
fn history_bounds(history_zs: &[f64], z: f64) -> (Option<f64>, Option<f64>) {
    let above = || {
        history_zs
            .iter()
            .copied()
            .filter(move |&hz| hz > z && !redshifts_match(hz, z))
    };
    (above().reduce(f64::min), above().reduce(f64::max))
}

/// Filter the star formation history over the spin-temperature shells.
///
/// Shell `i` spans radii `[R_i, R_{i+1})` with `R` log-spaced from the cell
/// size to `R_XLy_MAX`; its look-back redshift is read off the comoving
/// distance to the shell midpoint. Shells past `Z_HEAT_MAX` or the halo
/// history, or with no star formation, stay zero.
pub fn compute_xray_source_field(
    ctx: &mut StageContext<'_>,
    args: XraySourceArgs<'_>,
) -> Result<XraySourceBox> {
    let given_ics = usable(args.initial_conditions);
    let mut boxes = vec![data_of(given_ics)];
    if let Some(hboxes) = args.hboxes {
        boxes.extend(hboxes.iter().map(|h| Some(h.data())));
    }
    let mut inputs = args.params.resolve(&carriers(&boxes), ctx.globals())?;
    require_halo_field(&inputs)?;
    let z = args.redshift;
    check_redshift(z)?;

    let globals = ctx.globals();
    let given_hboxes = args.hboxes.filter(|h| !h.is_empty());
    let history_zs: Vec<f64> = match given_hboxes {
        Some(h) => h.iter().filter_map(|h| h.redshift()).collect(),
        None => heating_scroll(z, globals)?,
    };
    let (prev_halo_z, oldest_halo_z) = history_bounds(&history_zs, z);
    let mut xray = XraySourceBox::from_data(BoxData::new(
        Identity::new(XraySourceBox::KIND, &inputs, Some(z))
            .with_lineage("prev_halo_redshift", prev_halo_z)
            .with_lineage("oldest_halo_redshift", oldest_halo_z),
    ));
    if ctx.try_read(&mut xray)? {
        return Ok(xray);
    }

    let mut init = LazyInit::new(given_ics);
    let owned;
    let hboxes: &[HaloBox] = match given_hboxes {
        Some(h) => h,
        None => {
            let ics = init.get(ctx, &mut inputs)?;
            owned = halo_grid_history(ctx, &history_zs, &inputs, ics)?;
            &owned
        }
    };
    adopt_seed(&mut xray, &inputs);

    let mut history: Vec<&HaloBox> = hboxes.iter().collect();
    history.sort_by(|a, b| {
        a.redshift()
            .unwrap_or(0.0)
            .total_cmp(&b.redshift().unwrap_or(0.0))
    });
    for hbox in &history {
        xray.check_compatible(&[hbox.data()], &["redshift"])?;
    }
    let z_oldest = history.last().and_then(|h| h.redshift()).unwrap_or(z);

    let cosmo = &inputs.cosmo_params;
    let cell = inputs.user_params.cell_size();
    let shells = globals.num_filter_steps_for_ts;
    let factor = (globals.r_xly_max / cell).max(1.0).powf(1.0 / shells as f64);
    let distance = cosmo.comoving_distance(z);

    xray.allocate(globals);
    let mut filled = 0usize;
    for ct in 0..shells {
        let r_inner = if ct == 0 {
            0.0
        } else {
            cell * factor.powi(ct as i32)
        };
        let r_outer = cell * factor.powi(ct as i32 + 1);
        let z_shell = cosmo.z_at_comoving_distance(distance + 0.5 * (r_inner + r_outer));
        if z_shell > globals.z_heat_max || z_shell > z_oldest {
            continue;
        }
        let Some(grid) = interpolate_halo_grid(&history, z_shell)? else {
            continue;
        };
        ctx.invoke(
            &inputs,
            &mut xray,
            &[("halobox", &grid)],
            CallArgs {
                scalars: vec![
                    ("R_inner", r_inner),
                    ("R_outer", r_outer),
                    ("R_ct", ct as f64),
                ],
                halo_buffer: None,
            },
        )?;
        filled += 1;
    }
    debug!(redshift = z, filled, shells, "Filtered X-ray source shells");
    ctx.complete(&mut xray)?;
    Ok(xray)
}

#[derive(Debug, Clone, Default)]
pub struct SpinTempArgs<'a> {
    pub redshift: Option<f64>,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
    /// Defaults to the box's redshift. A field at a lower redshift is used
    /// as-is for every step (interpolated perturbed-field mode).
    pub perturbed_field: Option<&'a PerturbedField>,
    pub xray_source_box: Option<&'a XraySourceBox>,
    pub previous_spin_temp: Option<&'a TsBox>,
}

/// Spin temperature at `redshift`, evolved from the previous step.
pub fn spin_temperature(ctx: &mut StageContext<'_>, args: SpinTempArgs<'_>) -> Result<TsBox> {
    let given_ics = usable(args.initial_conditions);
    let given_field = usable(args.perturbed_field);
    let given_xray = usable(args.xray_source_box);
    let given_prev = usable(args.previous_spin_temp);
    let mut inputs = args.params.resolve(
        &carriers(&[
            data_of(given_ics),
            data_of(given_field),
            data_of(given_xray),
            data_of(given_prev),
        ]),
        ctx.globals(),
    )?;
    let z = require_redshift(
        resolve_redshift(args.redshift, &carriers(&[data_of(given_xray)]))?
            .or_else(|| given_field.and_then(|f| f.redshift())),
        TsBox::KIND,
    )?;
    let globals = ctx.globals();
    let field_z = given_field.and_then(|f| f.redshift()).unwrap_or(z);
    if field_z < z && !redshifts_match(field_z, z) {
        debug!(redshift = z, field_redshift = field_z, "Using interpolated perturbed field");
    } else if !redshifts_match(field_z, z) {
        return Err(Error::Redshift(format!(
            "perturbed field at z={field_z} is above the spin temperature redshift {z}"
        )));
    }
    let prev_z = match given_prev {
        Some(p) => p.redshift(),
        None => step_back(z, globals),
    };

    let mut ts = TsBox::from_data(BoxData::new(
        Identity::new(TsBox::KIND, &inputs, Some(z))
            .with_lineage("prev_spin_redshift", prev_z)
            .with_lineage("perturbed_field_redshift", Some(field_z)),
    ));
    if ctx.try_read(&mut ts)? {
        return Ok(ts);
    }

    let mut init = LazyInit::new(given_ics);
    let ics = init.get(ctx, &mut inputs)?;
    adopt_seed(&mut ts, &inputs);
    let params = ParamArgs::from(&inputs);

    let field = given_or(given_field, || {
        perturb_field(
            ctx,
            PerturbFieldArgs {
                redshift: z,
                params: params.clone(),
                initial_conditions: Some(ics),
            },
        )
    })?;
    let xray: Cow<'_, XraySourceBox> = if inputs.flag_options.use_halo_field {
        given_or(given_xray, || {
            compute_xray_source_field(
                ctx,
                XraySourceArgs {
                    redshift: z,
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    hboxes: None,
                },
            )
        })?
    } else {
        Cow::Owned(XraySourceBox::dummy(&inputs))
    };
    let carried_field = (!redshifts_match(field_z, z)).then_some(&*field);
    let prev = resolve_prior(given_prev, true, prev_z, &inputs, globals, |pz| {
        spin_temperature(
            ctx,
            SpinTempArgs {
                redshift: Some(pz),
                params: params.clone(),
                initial_conditions: Some(ics),
                perturbed_field: carried_field,
                ..Default::default()
            },
        )
    })?;

    ts.check_compatible(
        &[ics.data(), field.data(), xray.data(), prev.data()],
        &["redshift"],
    )?;
    ctx.compute(
        &inputs,
        &mut ts,
        &[
            ("init_boxes", ics.data()),
            ("perturbed_field", field.data()),
            ("xray_source_box", xray.data()),
            ("previous_spin_temp", prev.data()),
        ],
        CallArgs::default(),
    )?;
    Ok(ts)
}

#[derive(Debug, Clone, Default)]
pub struct IonizeArgs<'a> {
    pub redshift: Option<f64>,
    pub params: ParamArgs,
    pub initial_conditions: Option<&'a InitialConditions>,
    pub perturbed_field: Option<&'a PerturbedField>,
    /// Only used with minihalos.
    pub previous_perturbed_field: Option<&'a PerturbedField>,
    pub previous_ionize_box: Option<&'a IonizedBox>,
    pub spin_temp: Option<&'a TsBox>,
    pub halobox: Option<&'a HaloBox>,
}

/// Ionisation state at `redshift`.
///
/// With `INHOMO_RECO` or `USE_TS_FLUCT` the previous ionised box is resolved
/// one step back (recursively, down from `Z_HEAT_MAX`); otherwise it is a
/// dummy.
pub fn ionize_box(ctx: &mut StageContext<'_>, args: IonizeArgs<'_>) -> Result<IonizedBox> {
    let given_ics = usable(args.initial_conditions);
    let given_field = usable(args.perturbed_field);
    let given_spin = usable(args.spin_temp);
    let given_halobox = usable(args.halobox);
    let given_prev = usable(args.previous_ionize_box);
    let given_prev_field = usable(args.previous_perturbed_field);

    let same_z = carriers(&[
        data_of(given_field),
        data_of(given_spin),
        data_of(given_halobox),
    ]);
    let mut all = same_z.clone();
    all.extend(carriers(&[
        data_of(given_ics),
        data_of(given_prev),
        data_of(given_prev_field),
    ]));
    let mut inputs = args.params.resolve(&all, ctx.globals())?;
    let z = require_redshift(resolve_redshift(args.redshift, &same_z)?, IonizedBox::KIND)?;

    let globals = ctx.globals();
    let flags = inputs.flag_options.clone();
    let step = step_back(z, globals);
    let prev_z = match given_prev {
        Some(p) => p.redshift(),
        None if flags.needs_history() => step,
        None => None,
    };

    let mut ionized = IonizedBox::from_data(BoxData::new(
        Identity::new(IonizedBox::KIND, &inputs, Some(z))
            .with_lineage("prev_ionize_redshift", prev_z),
    ));
    if ctx.try_read(&mut ionized)? {
        return Ok(ionized);
    }

    let mut init = LazyInit::new(given_ics);
    let ics = init.get(ctx, &mut inputs)?;
    adopt_seed(&mut ionized, &inputs);
    let params = ParamArgs::from(&inputs);

    let field = given_or(given_field, || {
        perturb_field(
            ctx,
            PerturbFieldArgs {
                redshift: z,
                params: params.clone(),
                initial_conditions: Some(ics),
            },
        )
    })?;
    let prev = resolve_prior(given_prev, flags.needs_history(), step, &inputs, globals, |pz| {
        ionize_box(
            ctx,
            IonizeArgs {
                redshift: Some(pz),
                params: params.clone(),
                initial_conditions: Some(ics),
                ..Default::default()
            },
        )
    })?;
    let prev_field = resolve_prior(
        given_prev_field,
        flags.use_mini_halos,
        step,
        &inputs,
        globals,
        |pz| {
            perturb_field(
                ctx,
                PerturbFieldArgs {
                    redshift: pz,
                    params: params.clone(),
                    initial_conditions: Some(ics),
                },
            )
        },
    )?;
    let spin: Cow<'_, TsBox> = if flags.use_ts_fluct {
        given_or(given_spin, || {
            spin_temperature(
                ctx,
                SpinTempArgs {
                    redshift: Some(z),
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    perturbed_field: Some(field.as_ref()),
                    ..Default::default()
                },
            )
        })?
    } else {
        Cow::Owned(TsBox::dummy(&inputs))
    };
    let halobox: Cow<'_, HaloBox> = if flags.use_halo_field {
        given_or(given_halobox, || {
            compute_halo_grid(
                ctx,
                HaloBoxArgs {
                    redshift: Some(z),
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    perturbed_field: Some(field.as_ref()),
                    ..Default::default()
                },
            )
        })?
    } else {
        Cow::Owned(HaloBox::dummy(&inputs))
    };
    ctx.ensure_photon_cons(&inputs)?;

    ionized.check_compatible(
        &[
            ics.data(),
            field.data(),
            prev.data(),
            prev_field.data(),
            spin.data(),
            halobox.data(),
        ],
        &["redshift"],
    )?;
    ctx.compute(
        &inputs,
        &mut ionized,
        &[
            ("init_boxes", ics.data()),
            ("perturbed_field", field.data()),
            ("previous_perturbed_field", prev_field.data()),
            ("previous_ionize_box", prev.data()),
            ("spin_temp", spin.data()),
            ("halobox", halobox.data()),
        ],
        CallArgs::default(),
    )?;
    Ok(ionized)
}

#[derive(Debug, Clone)]
pub struct BrightnessTempArgs<'a> {
    pub params: ParamArgs,
    pub ionized_box: &'a IonizedBox,
    pub perturbed_field: &'a PerturbedField,
    /// Resolved at the same redshift when spin-temperature fluctuations are
    /// on and it is not given.
    pub spin_temp: Option<&'a TsBox>,
}

/// The 21-cm brightness temperature from a matching ionised box and field.
pub fn brightness_temperature(
    ctx: &mut StageContext<'_>,
    args: BrightnessTempArgs<'_>,
) -> Result<BrightnessTemp> {
    for data in [args.ionized_box.data(), args.perturbed_field.data()] {
        if !super::is_usable(data) || data.is_placeholder() {
            return Err(Error::NotComputed {
                kind: data.kind(),
                message: "brightness temperature needs a computed box".into(),
            });
        }
    }
    let given_spin = usable(args.spin_temp);
    let same_z = carriers(&[
        Some(args.ionized_box.data()),
        Some(args.perturbed_field.data()),
        data_of(given_spin),
    ]);
    let inputs = args.params.resolve(&same_z, ctx.globals())?;
    let z = require_redshift(resolve_redshift(None, &same_z)?, BrightnessTemp::KIND)?;

    // Keyed by the ionised box's history.
    let prev_ionize_z = args.ionized_box.identity().lineage.get("prev_ionize_redshift").copied();
    let mut bt = BrightnessTemp::from_data(BoxData::new(
        Identity::new(BrightnessTemp::KIND, &inputs, Some(z))
            .with_lineage("prev_ionize_redshift", prev_ionize_z),
    ));
    if ctx.try_read(&mut bt)? {
        return Ok(bt);
    }

    let spin: Cow<'_, TsBox> = if inputs.flag_options.use_ts_fluct {
        given_or(given_spin, || {
            spin_temperature(
                ctx,
                SpinTempArgs {
                    redshift: Some(z),
                    params: ParamArgs::from(&inputs),
                    perturbed_field: Some(args.perturbed_field),
                    ..Default::default()
                },
            )
        })?
    } else {
        Cow::Owned(TsBox::dummy(&inputs))
    };

    ctx.compute(
        &inputs,
        &mut bt,
        &[
            ("ionized_box", args.ionized_box.data()),
            ("perturbed_field", args.perturbed_field.data()),
            ("spin_temp", spin.data()),
        ],
        CallArgs::default(),
    )?;
    Ok(bt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytic::AnalyticEngine;
    use crate::config::IoOptions;
    use crate::registry::OutputKind;
    use reionize_params::{AstroParams, FlagOptions, GlobalParams};

    fn inputs(flags: FlagOptions) -> InputParameters {
        let mut inputs = InputParameters::with_seed(21);
        inputs.user_params.hii_dim = 6;
        inputs.user_params.dim = Some(12);
        inputs.user_params.box_len = 30.0;
        inputs.astro_params = AstroParams {
            r_bubble_max: Some(5.0),
            ..Default::default()
        };
        inputs.flag_options = flags;
        inputs
    }

    fn fast_globals() -> GlobalParams {
        let mut globals = GlobalParams::default();
        globals.zprime_step_factor = 1.3;
        globals.z_heat_max = 12.0;
        globals.num_filter_steps_for_ts = 6;
        globals
    }

    #[test]
    fn test_ionize_recurses_for_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions {
            inhomo_reco: true,
            ..Default::default()
        });

        let ionized = ionize_box(
            &mut ctx,
            IonizeArgs {
                redshift: Some(8.0),
                params: ParamArgs::from(&inputs),
                ..Default::default()
            },
        )
        .unwrap();
        let prev_z = 9.0 * globals.zprime_step_factor - 1.0;
        assert_eq!(
            ionized.identity().lineage.get("prev_ionize_redshift"),
            Some(&prev_z)
        );

        let prev = IonizedBox::from_data(BoxData::new(
            Identity::new(IonizedBox::KIND, &inputs, Some(prev_z)).with_lineage(
                "prev_ionize_redshift",
                step_back(prev_z, &globals),
            ),
        ));
        assert!(prev.exists(dir.path()));
    }

    #[test]
    fn test_ionize_without_history_uses_dummy() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions::default());
        let ionized = ionize_box(
            &mut ctx,
            IonizeArgs {
                redshift: Some(8.0),
                params: ParamArgs::from(&inputs),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(ionized.identity().lineage.is_empty());
        assert_eq!(crate::cache::query_cache(dir.path(), &Default::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_redshift_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions::default());
        let field = perturb_field(
            &mut ctx,
            PerturbFieldArgs {
                redshift: 8.0,
                params: ParamArgs::from(&inputs),
                initial_conditions: None,
            },
        )
        .unwrap();
        let err = ionize_box(
            &mut ctx,
            IonizeArgs {
                redshift: Some(8.5),
                perturbed_field: Some(&field),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Redshift(_)));
    }

    #[test]
    fn test_spin_temperature_with_halos() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions {
            use_halo_field: true,
            use_mass_dependent_zeta: true,
            use_ts_fluct: true,
            ..Default::default()
        });
        let ts = spin_temperature(
            &mut ctx,
            SpinTempArgs {
                redshift: Some(10.0),
                params: ParamArgs::from(&inputs),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(ts.is_computed());
        let ts_field = ts.require("spin_temperature").unwrap();
        assert!(ts_field.iter().all(|t| t.is_finite() && *t > 0.0));

        // Halo grids at 10 and at the ceiling.
        let xray = XraySourceBox::from_data(BoxData::new(
            Identity::new(XraySourceBox::KIND, &inputs, Some(10.0))
                .with_lineage("prev_halo_redshift", Some(12.0))
                .with_lineage("oldest_halo_redshift", Some(12.0)),
        ));
        assert!(xray.exists(dir.path()));
    }

    #[test]
    fn test_interpolate_halo_grid() {
        let inputs = inputs(FlagOptions {
            use_halo_field: true,
            use_mass_dependent_zeta: true,
            ..Default::default()
        });
        let globals = GlobalParams::default();
        let grid = |z: f64, value: f32| {
            let mut hb = HaloBox::uncomputed(&inputs, Some(z));
            hb.allocate(&globals);
            for name in INTERPOLATED_FIELDS {
                hb.array_mut(name).unwrap().fill(value);
            }
            hb.mark_computed();
            hb
        };
        let low = grid(8.0, 1.0);
        let high = grid(10.0, 3.0);
        let history = [&low, &high];

        let mid = interpolate_halo_grid(&history, 9.0).unwrap().unwrap();
        assert!(mid.array("halo_sfr").unwrap().iter().all(|v| (*v - 2.0).abs() < 1e-6));
        assert!(interpolate_halo_grid(&history, 11.0).unwrap().is_none());

        let empty = grid(12.0, 0.0);
        let history = [&high, &empty];
        assert!(interpolate_halo_grid(&history, 12.0).unwrap().is_none());
    }

    fn halo_query() -> crate::cache::CacheQuery {
        crate::cache::CacheQuery {
            kind: Some(OutputKind::HaloBox),
            ..Default::default()
        }
    }

    #[test]
    fn test_halo_grid_keyed_by_feedback_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions {
            use_halo_field: true,
            use_mass_dependent_zeta: true,
            use_ts_fluct: true,
            inhomo_reco: true,
            use_mini_halos: true,
            ..Default::default()
        });

        let mut grids = Vec::new();
        for prev_z in [9.0, 10.0] {
            let spin = TsBox::initial(&inputs, Some(prev_z), &globals);
            let ionized = IonizedBox::initial(&inputs, Some(prev_z), &globals);
            let hbox = compute_halo_grid(
                &mut ctx,
                HaloBoxArgs {
                    redshift: Some(8.0),
                    params: ParamArgs::from(&inputs),
                    previous_spin_temp: Some(&spin),
                    previous_ionize_box: Some(&ionized),
                    ..Default::default()
                },
            )
            .unwrap();
            assert_eq!(hbox.identity().lineage.get("prev_spin_redshift"), Some(&prev_z));
            assert_eq!(hbox.identity().lineage.get("prev_ionize_redshift"), Some(&prev_z));
            grids.push(hbox);
        }
        assert_ne!(grids[0].identity().key(), grids[1].identity().key());
        let at_8 = crate::cache::query_cache(
            dir.path(),
            &crate::cache::CacheQuery {
                redshift: Some(8.0),
                ..halo_query()
            },
        )
        .unwrap();
        assert_eq!(at_8.len(), 2);
    }

    #[test]
    fn test_halo_grid_without_minihalos_has_no_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions {
            use_halo_field: true,
            use_mass_dependent_zeta: true,
            ..Default::default()
        });
        let hbox = compute_halo_grid(
            &mut ctx,
            HaloBoxArgs {
                redshift: Some(8.0),
                params: ParamArgs::from(&inputs),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(hbox.identity().lineage.is_empty());
    }

    #[test]
    fn test_xray_source_keyed_by_halo_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = fast_globals();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = inputs(FlagOptions {
            use_halo_field: true,
            use_mass_dependent_zeta: true,
            use_ts_fluct: true,
            ..Default::default()
        });
        let grid = |z: f64| {
            let mut hb = HaloBox::uncomputed(&inputs, Some(z));
            hb.allocate(&globals);
            for name in INTERPOLATED_FIELDS {
                hb.array_mut(name).unwrap().fill(1.0);
            }
            hb.mark_computed();
            hb
        };

        let fine = [grid(8.0), grid(8.5), grid(9.0), grid(12.0)];
        let coarse = [grid(8.0), grid(9.0), grid(12.0)];
        let mut keys = Vec::new();
        for history in [&fine[..], &coarse[..]] {
            let xray = compute_xray_source_field(
                &mut ctx,
                XraySourceArgs {
                    redshift: 8.0,
                    params: ParamArgs::from(&inputs),
                    initial_conditions: None,
                    hboxes: Some(history),
                },
            )
            .unwrap();
            assert_eq!(xray.identity().lineage.get("oldest_halo_redshift"), Some(&12.0));
            keys.push(xray.identity().key());
        }
        assert_ne!(keys[0], keys[1]);
        assert!(keys[0].contains("8.5"));

        assert_eq!(history_bounds(&[8.0, 9.0, 12.0], 8.0), (Some(9.0), Some(12.0)));
        assert_eq!(history_bounds(&[8.0], 8.0), (None, None));
    }
}
