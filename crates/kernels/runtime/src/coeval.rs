//! Coeval driver: every stage scrolled down to one or more target redshifts.
//!
//! The per-step machinery ([`History`], [`evolve`]) is shared with the
//! lightcone driver.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::ArrayD;
use reionize_foundation::redshifts_match;
use reionize_params::{FlagOptions, GlobalParams, InputParameters, PhotonConsType};
use tracing::{debug, info, warn};

use crate::config::IoOptions;
use crate::context::{Hook, StageContext};
use crate::engine::{Engine, PhotonConsData};
use crate::outputs::{
    BoxData, BoxState, BrightnessTemp, HaloBox, HaloField, InitialConditions, IonizedBox, OutputStruct,
    PerturbHaloField, PerturbedField, TsBox,
};
use crate::schedule::coeval_required_redshifts;
use crate::stages::{
    brightness_temperature, compute_halo_grid, compute_xray_source_field, determine_halo_list,
    initial_conditions, ionize_box, perturb_field, perturb_halo_list, spin_temperature,
    BrightnessTempArgs, HaloBoxArgs, HaloListArgs, IonizeArgs, ParamArgs, PerturbFieldArgs,
    PerturbHaloArgs, SpinTempArgs, XraySourceArgs,
};
use crate::{Error, Result};

/// Halo-grid fields the X-ray source filter reads from the history.
pub(crate) const HBOX_HISTORY_FIELDS: [&str; 3] = ["halo_sfr", "halo_sfr_mini", "halo_xray"];

/// Cache records touched per stage, as `(redshift, path)`.
pub type CacheFiles = IndexMap<String, Vec<(f64, PathBuf)>>;

/// All outputs at one redshift.
#[derive(Debug, Clone)]
pub struct Coeval {
    pub redshift: f64,
    pub initial_conditions: Arc<InitialConditions>,
    pub perturbed_field: PerturbedField,
    pub ionized_box: IonizedBox,
    pub brightness_temp: BrightnessTemp,
    pub ts_box: Option<TsBox>,
    pub halobox: Option<HaloBox>,
    pub photon_nonconservation_data: Option<PhotonConsData>,
    pub cache_files: CacheFiles,
}

impl Coeval {
    pub fn inputs(&self) -> InputParameters {
        self.ionized_box.identity().inputs()
    }

    fn boxes(&self) -> impl Iterator<Item = &BoxData> {
        [
            Some(self.brightness_temp.data()),
            Some(self.ionized_box.data()),
            self.ts_box.as_ref().map(|b| b.data()),
            self.halobox.as_ref().map(|b| b.data()),
            Some(self.perturbed_field.data()),
            Some(self.initial_conditions.data()),
        ]
        .into_iter()
        .flatten()
    }

    /// Any array field of any box in the bundle, by name.
    pub fn get(&self, field: &str) -> Option<&ArrayD<f32>> {
        self.boxes().find_map(|b| b.array(field))
    }

    /// Any scalar field of any box in the bundle, by name.
    pub fn scalar(&self, field: &str) -> Option<f64> {
        self.boxes().find_map(|b| b.scalar(field))
    }
}

/// What [`run_coeval`] returns: one bundle when one redshift was requested.
#[derive(Debug, Clone)]
pub enum CoevalResult {
    Single(Box<Coeval>),
    Multiple(Vec<Coeval>),
}

impl CoevalResult {
    pub fn into_vec(self) -> Vec<Coeval> {
        match self {
            CoevalResult::Single(c) => vec![*c],
            CoevalResult::Multiple(cs) => cs,
        }
    }

    pub fn single(self) -> Option<Coeval> {
        match self {
            CoevalResult::Single(c) => Some(*c),
            CoevalResult::Multiple(mut cs) if cs.len() == 1 => cs.pop(),
            CoevalResult::Multiple(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoevalOptions {
    /// Target redshifts. Taken from `perturbed_fields` when empty.
    pub redshifts: Vec<f64>,
    pub params: ParamArgs,
    pub initial_conditions: Option<InitialConditions>,
    /// Pre-computed perturbed fields, one per target redshift.
    pub perturbed_fields: Vec<PerturbedField>,
    /// Drive every spin-temperature step from the lowest-redshift field.
    pub use_interp_perturb_field: bool,
    /// Purge even boxes that were never written.
    pub always_purge: bool,
    pub hooks: Vec<Hook>,
    /// Global overrides for the duration of the call.
    pub global_overrides: Vec<(String, f64)>,
}

/// Log and drop the purge errors the drivers tolerate.
pub(crate) fn advisory(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_advisory() => {
            warn!(error = %e, "Skipping purge");
            Ok(())
        }
        other => other,
    }
}

pub(crate) fn record(files: &mut CacheFiles, stage: &str, data: &BoxData) {
    if let Some(path) = data.path() {
        files
            .entry(stage.to_string())
            .or_default()
            .push((data.redshift().unwrap_or(0.0), path.to_path_buf()));
    }
}

/// Given initial conditions, or ones read or computed for `inputs`.
pub(crate) fn resolve_initial_conditions(
    ctx: &mut StageContext<'_>,
    given: Option<InitialConditions>,
    inputs: &mut InputParameters,
) -> Result<InitialConditions> {
    let ics = match given.filter(|ic| !ic.is_placeholder() && ic.state() != BoxState::Uninitialized) {
        Some(ics) => ics,
        None => initial_conditions(ctx, &ParamArgs::from(&*inputs))?,
    };
    if inputs.random_seed.is_none() {
        inputs.random_seed = ics.random_seed();
    }
    Ok(ics)
}

/// Perturbed fields at every scroll redshift, reusing the supplied ones.
pub(crate) fn perturbed_fields(
    ctx: &mut StageContext<'_>,
    inputs: &InputParameters,
    ics: &InitialConditions,
    redshifts: &[f64],
    mut given: Vec<PerturbedField>,
    always_purge: bool,
) -> Result<Vec<Option<PerturbedField>>> {
    let mut fields = Vec::with_capacity(redshifts.len());
    for &z in redshifts {
        let reuse = given
            .iter()
            .position(|p| p.redshift().is_some_and(|pz| redshifts_match(pz, z)));
        let mut field = match reuse {
            Some(i) => given.swap_remove(i),
            None => perturb_field(
                ctx,
                PerturbFieldArgs {
                    redshift: z,
                    params: ParamArgs::from(inputs),
                    initial_conditions: Some(ics),
                },
            )?,
        };
        if inputs.user_params.minimize_memory {
            advisory(field.purge(&[], always_purge))?;
        }
        fields.push(Some(field));
    }
    Ok(fields)
}

/// Perturbed halo catalogs for `redshifts` (descending), sampled from the
/// lowest redshift up so each catalog conditions on its descendant.
pub(crate) fn perturbed_halo_chain(
    ctx: &mut StageContext<'_>,
    inputs: &InputParameters,
    ics: &InitialConditions,
    redshifts: &[f64],
    always_purge: bool,
) -> Result<Vec<Option<PerturbHaloField>>> {
    let mut chain: Vec<Option<PerturbHaloField>> = vec![None; redshifts.len()];
    if !inputs.flag_options.use_halo_field || inputs.flag_options.fixed_halo_grids {
        return Ok(chain);
    }
    let mut descendant: Option<HaloField> = None;
    for (i, &z) in redshifts.iter().enumerate().rev() {
        let halos = determine_halo_list(
            ctx,
            HaloListArgs {
                redshift: z,
                params: ParamArgs::from(inputs),
                initial_conditions: Some(ics),
                descendant_halos: descendant.as_ref(),
            },
        )?;
        let mut pt_halos = perturb_halo_list(
            ctx,
            PerturbHaloArgs {
                redshift: Some(z),
                params: ParamArgs::from(inputs),
                initial_conditions: Some(ics),
                halo_field: Some(&halos),
            },
        )?;
        advisory(pt_halos.purge(&[], always_purge))?;
        chain[i] = Some(pt_halos);
        descendant = Some(halos);
    }
    Ok(chain)
}

/// Boxes carried from one scroll step to the next.
#[derive(Debug, Default)]
pub(crate) struct History {
    pub ionized: Option<IonizedBox>,
    pub field: Option<PerturbedField>,
    pub spin: Option<TsBox>,
    /// Halo grids of every step so far, for the X-ray source filter.
    pub hboxes: Vec<HaloBox>,
}

/// Outputs of one scroll step.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub field: PerturbedField,
    pub halobox: Option<HaloBox>,
    pub spin: Option<TsBox>,
    pub ionized: IonizedBox,
}

/// Run the radiative stages at `field`'s redshift against `history`.
///
/// Pushes the new halo grid onto `history.hboxes` (purged down to what the
/// X-ray filter reads); the rest of `history` is the caller's to update.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evolve(
    ctx: &mut StageContext<'_>,
    inputs: &InputParameters,
    ics: &InitialConditions,
    mut field: PerturbedField,
    pt_halos: Option<&PerturbHaloField>,
    interp_field: Option<&PerturbedField>,
    history: &mut History,
    always_purge: bool,
) -> Result<Step> {
    let z = field
        .redshift()
        .ok_or_else(|| Error::Redshift("perturbed field has no redshift".into()))?;
    if field.state() == BoxState::Purged {
        field.load_all()?;
    }
    let flags: &FlagOptions = &inputs.flag_options;
    let params = ParamArgs::from(inputs);

    let halobox = if flags.use_halo_field {
        let hbox = compute_halo_grid(
            ctx,
            HaloBoxArgs {
                redshift: Some(z),
                params: params.clone(),
                initial_conditions: Some(ics),
                perturbed_field: Some(&field),
                perturbed_halo_list: pt_halos,
                previous_spin_temp: history.spin.as_ref().filter(|_| flags.use_mini_halos),
                previous_ionize_box: history.ionized.as_ref().filter(|_| flags.use_mini_halos),
            },
        )?;
        let mut kept = hbox.clone();
        advisory(kept.purge(&HBOX_HISTORY_FIELDS, always_purge))?;
        history.hboxes.push(kept);
        Some(hbox)
    } else {
        None
    };

    let spin = if flags.use_ts_fluct {
        let xray = if flags.use_halo_field {
            Some(compute_xray_source_field(
                ctx,
                XraySourceArgs {
                    redshift: z,
                    params: params.clone(),
                    initial_conditions: Some(ics),
                    hboxes: Some(&history.hboxes),
                },
            )?)
        } else {
            None
        };
        Some(spin_temperature(
            ctx,
            SpinTempArgs {
                redshift: Some(z),
                params: params.clone(),
                initial_conditions: Some(ics),
                perturbed_field: Some(interp_field.unwrap_or(&field)),
                xray_source_box: xray.as_ref(),
                previous_spin_temp: history.spin.as_ref(),
            },
        )?)
    } else {
        None
    };

    let ionized = ionize_box(
        ctx,
        IonizeArgs {
            redshift: Some(z),
            params,
            initial_conditions: Some(ics),
            perturbed_field: Some(&field),
            previous_perturbed_field: history.field.as_ref().filter(|_| flags.use_mini_halos),
            previous_ionize_box: history.ionized.as_ref().filter(|_| flags.needs_history()),
            spin_temp: spin.as_ref(),
            halobox: halobox.as_ref(),
        },
    )?;

    Ok(Step {
        field,
        halobox,
        spin,
        ionized,
    })
}

/// Collected photon-conservation diagnostics, then release engine memory.
pub(crate) fn finish_engine(ctx: &mut StageContext<'_>, inputs: &InputParameters) -> Option<PhotonConsData> {
    let engine = ctx.engine();
    let data = if inputs.photon_cons() {
        engine.photon_cons_data()
    } else {
        None
    };
    engine.free_photon_cons_memory();
    engine.free_scratch();
    data
}

/// Compute coeval bundles at every requested redshift.
///
/// Scrolls down from `Z_HEAT_MAX` when the flags need history, keeping only
/// the previous step's boxes resident. Any stage failure aborts the call.
pub fn run_coeval(
    engine: &mut dyn Engine,
    globals: &mut GlobalParams,
    io: IoOptions,
    options: CoevalOptions,
) -> Result<CoevalResult> {
    let CoevalOptions {
        mut redshifts,
        params,
        initial_conditions: given_ics,
        perturbed_fields: given_fields,
        use_interp_perturb_field,
        always_purge,
        hooks,
        global_overrides,
    } = options;

    let scoped = globals.scoped(&global_overrides)?;
    let globals: &GlobalParams = &scoped;

    if !given_fields.is_empty() {
        let field_zs: Vec<f64> = given_fields.iter().filter_map(|p| p.redshift()).collect();
        if redshifts.is_empty() {
            redshifts = field_zs;
        } else if redshifts.len() != field_zs.len()
            || redshifts
                .iter()
                .zip(&field_zs)
                .any(|(z, pz)| !redshifts_match(*z, *pz))
        {
            return Err(Error::Redshift(
                "requested redshifts do not match the perturbed field redshifts".into(),
            ));
        }
    }
    let Some(min_z) = redshifts.iter().copied().reduce(f64::min) else {
        return Err(Error::Redshift("no redshifts requested".into()));
    };
    let singleton = redshifts.len() == 1;

    let mut carriers: Vec<&BoxData> = given_fields.iter().map(|p| p.data()).collect();
    if let Some(ics) = &given_ics {
        carriers.push(ics.data());
    }
    carriers.retain(|c| !c.is_placeholder() && c.state() != BoxState::Uninitialized);
    let mut inputs = params.resolve(&carriers, globals)?;
    let flags = inputs.flag_options.clone();

    if use_interp_perturb_field && flags.use_mini_halos {
        return Err(reionize_params::ParamError::validation(
            "use_interp_perturb_field",
            "an interpolated perturbed field cannot be used with minihalos",
        )
        .into());
    }
    if flags.photon_cons_type == PhotonConsType::Redshift && min_z < globals.photon_cons_end_calibz {
        return Err(Error::Redshift(format!(
            "z={min_z} is below the end of the photon non-conservation calibration \
             (PhotonConsEndCalibz={}); lower PhotonConsEndCalibz to allow it",
            globals.photon_cons_end_calibz
        )));
    }
    let scroll = coeval_required_redshifts(&redshifts, &flags, globals)?;
    info!(
        targets = ?redshifts,
        steps = scroll.len(),
        "Starting coeval run"
    );

    let mut ctx = StageContext::new(engine, globals, io);
    for hook in hooks {
        ctx = ctx.with_hook(hook);
    }

    let mut ics = resolve_initial_conditions(&mut ctx, given_ics, &mut inputs)?;
    advisory(ics.prepare_for_perturb(&flags, always_purge))?;
    ctx.ensure_photon_cons(&inputs)?;

    let mut fields = perturbed_fields(&mut ctx, &inputs, &ics, &scroll, given_fields, always_purge)?;
    let interp_field = if use_interp_perturb_field {
        let lowest = scroll
            .iter()
            .position(|z| redshifts_match(*z, min_z))
            .and_then(|i| fields[i].clone());
        lowest.map(|mut f| -> Result<PerturbedField> {
            if f.state() == BoxState::Purged {
                f.load_all()?;
            }
            Ok(f)
        })
        .transpose()?
    } else {
        None
    };

    advisory(ics.prepare_for_halos(&flags, always_purge))?;
    let mut pt_halos = perturbed_halo_chain(&mut ctx, &inputs, &ics, &scroll, always_purge)?;
    advisory(ics.prepare_for_spin_temp(&flags, globals, always_purge))?;

    let mut files = CacheFiles::new();
    record(&mut files, "init", ics.data());
    let ics = Arc::new(ics);

    let mut history = History::default();
    let mut done: Vec<(f64, Step, BrightnessTemp)> = Vec::with_capacity(redshifts.len());
    for (i, &z) in scroll.iter().enumerate() {
        let field = fields[i].take().ok_or_else(|| Error::NotComputed {
            kind: crate::registry::OutputKind::PerturbedField,
            message: format!("no perturbed field at z={z}"),
        })?;
        let ph = pt_halos[i].take();
        let step = evolve(
            &mut ctx,
            &inputs,
            &ics,
            field,
            ph.as_ref(),
            interp_field.as_ref(),
            &mut history,
            always_purge,
        )?;

        record(&mut files, "perturb_field", step.field.data());
        if let Some(ph) = &ph {
            record(&mut files, "pt_halos", ph.data());
        }
        if let Some(hb) = &step.halobox {
            record(&mut files, "halobox", hb.data());
        }
        if let Some(ts) = &step.spin {
            record(&mut files, "spin_temp", ts.data());
        }
        record(&mut files, "ionized_box", step.ionized.data());

        if redshifts.iter().any(|t| redshifts_match(*t, z)) {
            debug!(redshift = z, "Computing brightness temperature");
            let bt = brightness_temperature(
                &mut ctx,
                BrightnessTempArgs {
                    params: ParamArgs::from(&inputs),
                    ionized_box: &step.ionized,
                    perturbed_field: &step.field,
                    spin_temp: step.spin.as_ref(),
                },
            )?;
            record(&mut files, "brightness_temp", bt.data());
            done.push((z, step, bt));
        } else {
            history.ionized = Some(step.ionized);
            history.field = Some(step.field);
            if step.spin.is_some() {
                history.spin = step.spin;
            }
        }
    }

    let photon_cons = finish_engine(&mut ctx, &inputs);
    let mut coevals = Vec::with_capacity(redshifts.len());
    for &target in &redshifts {
        let Some(pos) = done.iter().position(|(z, _, _)| redshifts_match(*z, target)) else {
            return Err(Error::Redshift(format!("z={target} was not reached by the scroll")));
        };
        let repeated = redshifts.iter().filter(|t| redshifts_match(**t, target)).count() > 1;
        let (z, step, bt) = if repeated {
            done[pos].clone()
        } else {
            done.swap_remove(pos)
        };
        coevals.push(Coeval {
            redshift: z,
            initial_conditions: ics.clone(),
            perturbed_field: step.field,
            ionized_box: step.ionized,
            brightness_temp: bt,
            ts_box: step.spin,
            halobox: step.halobox,
            photon_nonconservation_data: photon_cons.clone(),
            cache_files: files.clone(),
        });
    }
    info!(n = coevals.len(), "Finished coeval run");

    Ok(if singleton {
        match coevals.pop() {
            Some(c) => CoevalResult::Single(Box::new(c)),
            None => CoevalResult::Multiple(Vec::new()),
        }
    } else {
        CoevalResult::Multiple(coevals)
    })
}
