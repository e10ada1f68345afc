//! Lightcone driver.
//!
//! Scrolls the coeval pipeline down a fixed node schedule and, after every
//! node, asks a [`Lightconer`] to slice the (current, previous) pair of
//! coeval bundles onto the lightcone's distance axis. With a checkpoint file
//! set, every node is persisted as soon as it is done and an interrupted run
//! resumes below the last finished node.

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, Slice, Zip};
use reionize_foundation::redshifts_match;
use reionize_params::{GlobalParams, InputParameters, ParamError, PhotonConsType};
use tracing::{debug, info, warn};

use crate::analytic::MPC_KM;
use crate::cache::get_boxes_at_redshift;
use crate::checkpoint::LightconeCheckpoint;
use crate::coeval::{
    advisory, evolve, finish_engine, perturbed_fields, perturbed_halo_chain, record,
    resolve_initial_conditions, CacheFiles, Coeval, History, HBOX_HISTORY_FIELDS,
};
use crate::config::IoOptions;
use crate::context::{Hook, StageContext};
use crate::engine::{Engine, PhotonConsData};
use crate::lightconer::{Geometry, Lightconer, LOS_VELOCITY};
use crate::outputs::{
    BoxData, BoxState, BrightnessTemp, HaloBox, Identity, InitialConditions, IonizedBox,
    OutputStruct, PerturbedField, TsBox,
};
use crate::registry::{lightcone_field_kind, OutputKind};
use crate::schedule::lightcone_node_redshifts;
use crate::stages::{brightness_temperature, step_back, BrightnessTempArgs, ParamArgs};
use crate::{Error, Result};

/// Name of the redshift-space-distorted brightness temperature.
pub const BRIGHTNESS_TEMP_WITH_RSDS: &str = "brightness_temp_with_rsds";

/// A lightcone and the state needed to keep filling it.
#[derive(Debug, Clone)]
pub struct Lightcone {
    pub geometry: Geometry,
    pub inputs: InputParameters,
    /// Globals in force when the lightcone was started.
    pub globals: GlobalParams,
    /// Comoving distance of each slice, ascending.
    pub distances: Vec<f64>,
    /// Redshifts of the coeval nodes, descending.
    pub node_redshifts: Vec<f64>,
    /// Arrays whose last axis runs over `distances`.
    pub lightcones: IndexMap<String, ArrayD<f32>>,
    /// Volume averages, one entry per node.
    pub global_quantities: IndexMap<String, Vec<f64>>,
    pub log10_mturnovers: Vec<f64>,
    pub log10_mturnovers_mini: Vec<f64>,
    pub photon_nonconservation_data: Option<PhotonConsData>,
    pub cache_files: CacheFiles,
    /// Arrays computed after the scroll rather than sliced from coevals.
    pub derived_fields: Vec<String>,
    /// Redshift of the last finished node.
    pub current_redshift: Option<f64>,
    /// Lowest filled slice; `n_slices()` when nothing is filled.
    pub current_index: usize,
}

impl Lightcone {
    fn new(
        lightconer: &dyn Lightconer,
        inputs: InputParameters,
        globals: &GlobalParams,
        node_redshifts: Vec<f64>,
        global_quantities: &[String],
    ) -> Self {
        let shape = lightconer.shape(&inputs.user_params);
        let mut lightcones = IndexMap::new();
        for quantity in lightconer.quantities() {
            lightcones.insert(quantity.clone(), ArrayD::zeros(shape.clone()));
        }
        if lightconer.get_los_velocity() {
            lightcones.insert(LOS_VELOCITY.to_string(), ArrayD::zeros(shape));
        }
        let n_nodes = node_redshifts.len();
        let distances = lightconer.lc_distances().to_vec();
        Self {
            geometry: lightconer.geometry(),
            inputs,
            globals: globals.clone(),
            current_index: distances.len(),
            distances,
            node_redshifts,
            lightcones,
            global_quantities: global_quantities
                .iter()
                .map(|q| (q.clone(), vec![0.0; n_nodes]))
                .collect(),
            log10_mturnovers: vec![0.0; n_nodes],
            log10_mturnovers_mini: vec![0.0; n_nodes],
            photon_nonconservation_data: None,
            cache_files: CacheFiles::new(),
            derived_fields: Vec::new(),
            current_redshift: None,
        }
    }

    pub fn n_slices(&self) -> usize {
        self.distances.len()
    }

    /// Shape of each lightcone array.
    pub fn shape(&self) -> Option<&[usize]> {
        self.lightcones.values().next().map(|a| a.shape())
    }

    pub fn lightcone_redshifts(&self) -> Vec<f64> {
        let cosmo = &self.inputs.cosmo_params;
        self.distances
            .iter()
            .map(|&d| cosmo.z_at_comoving_distance(d))
            .collect()
    }

    /// Line-of-sight coordinates relative to the first slice, in Mpc.
    pub fn lightcone_coords(&self) -> Vec<f64> {
        let d0 = self.distances.first().copied().unwrap_or(0.0);
        self.distances.iter().map(|d| d - d0).collect()
    }

    /// Voxel size; angular lightcones have none.
    pub fn cell_size(&self) -> Option<f64> {
        match self.geometry {
            Geometry::Rectilinear => Some(self.inputs.user_params.cell_size()),
            Geometry::Angular => None,
        }
    }

    pub fn brightness_temp(&self) -> Option<&ArrayD<f32>> {
        self.lightcones.get("brightness_temp")
    }

    /// Global neutral fraction per node, if tracked.
    pub fn global_xhi(&self) -> Option<&[f64]> {
        self.global_quantities.get("xH_box").map(|v| v.as_slice())
    }

    /// True once the lowest node has been processed.
    pub fn is_complete(&self) -> bool {
        match (self.current_redshift, self.node_redshifts.last()) {
            (Some(z), Some(&last)) => redshifts_match(z, last) || z < last,
            _ => false,
        }
    }

    /// Apply redshift-space distortions to the brightness temperature using
    /// the line-of-sight velocity lightcone.
    ///
    /// `T_b / (1 + dv/dr / H)`, with the gradient clipped at `MAX_DVDR`, then
    /// each cell split into `n_subcells` pieces moved by their displacement.
    /// Stored as `brightness_temp_with_rsds`.
    pub fn compute_rsds(&mut self, n_subcells: u32) -> Result<()> {
        if self.lightcones.contains_key(BRIGHTNESS_TEMP_WITH_RSDS) {
            warn!("Lightcone already has {BRIGHTNESS_TEMP_WITH_RSDS}, not recomputing");
            return Ok(());
        }
        let los = self.lightcones.get(LOS_VELOCITY).ok_or_else(|| Error::NotComputed {
            kind: OutputKind::PerturbedField,
            message: "lightcone has no los_velocity, cannot compute RSDs".into(),
        })?;
        let tb = self.lightcones.get("brightness_temp").ok_or_else(|| Error::NotComputed {
            kind: OutputKind::BrightnessTemp,
            message: "lightcone has no brightness_temp, cannot compute RSDs".into(),
        })?;

        let cosmo = &self.inputs.cosmo_params;
        let distances = &self.distances;
        let hubble: Vec<f64> = distances
            .iter()
            .map(|&d| cosmo.hubble(cosmo.z_at_comoving_distance(d)) / MPC_KM)
            .collect();
        let spacing = match distances.len() {
            0 | 1 => 1.0,
            n => (distances[n - 1] - distances[0]) / (n - 1) as f64,
        };
        let max_dvdr = self.globals.max_dvdr;

        let axis = Axis(tb.ndim() - 1);
        let mut out = ArrayD::<f32>::zeros(tb.shape());
        Zip::from(out.lanes_mut(axis))
            .and(tb.lanes(axis))
            .and(los.lanes(axis))
            .for_each(|mut out, tb, v| {
                let displacement: Vec<f64> = v
                    .iter()
                    .zip(&hubble)
                    .map(|(&v, h)| -(v as f64) / h)
                    .collect();
                let dvdr = gradient(&displacement, distances);
                let corrected: Vec<f64> = tb
                    .iter()
                    .zip(&dvdr)
                    .map(|(&t, g)| t as f64 / (1.0 + g.clamp(-max_dvdr, max_dvdr)))
                    .collect();
                if n_subcells == 0 {
                    for (o, c) in out.iter_mut().zip(&corrected) {
                        *o = *c as f32;
                    }
                } else {
                    let shifts: Vec<f64> = displacement.iter().map(|d| d / spacing).collect();
                    let moved = redistribute(&corrected, &shifts, n_subcells);
                    for (o, c) in out.iter_mut().zip(&moved) {
                        *o = *c as f32;
                    }
                }
            });

        debug!(n_subcells, max_dvdr, "Applied redshift-space distortions");
        self.lightcones.insert(BRIGHTNESS_TEMP_WITH_RSDS.to_string(), out);
        self.derived_fields.push(BRIGHTNESS_TEMP_WITH_RSDS.to_string());
        Ok(())
    }

    fn write_slab(&mut self, quantity: &str, indices: &Range<usize>, data: &ArrayD<f32>) -> Result<()> {
        let array = self.lightcones.get_mut(quantity).ok_or_else(|| {
            Error::Checkpoint(format!("lightcone has no {quantity} array to fill"))
        })?;
        let axis = Axis(array.ndim() - 1);
        let mut target = array.slice_axis_mut(axis, Slice::from(indices.clone()));
        if target.shape() != data.shape() {
            return Err(Error::Checkpoint(format!(
                "{quantity} slab has shape {:?}, expected {:?}",
                data.shape(),
                target.shape()
            )));
        }
        target.assign(data);
        Ok(())
    }
}

/// Central differences in the interior, one-sided at the ends.
fn gradient(f: &[f64], x: &[f64]) -> Vec<f64> {
    let n = f.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| {
            let (a, b) = match i {
                0 => (0, 1),
                i if i == n - 1 => (n - 2, n - 1),
                i => (i - 1, i + 1),
            };
            (f[b] - f[a]) / (x[b] - x[a])
        })
        .collect()
}

/// Split every cell into `n_subcells` pieces, shift each by `shifts` (in
/// cells) and deposit it in the nearest cell. Pieces leaving the line of
/// sight are dropped.
fn redistribute(values: &[f64], shifts: &[f64], n_subcells: u32) -> Vec<f64> {
    let n = values.len();
    let sub = n_subcells as f64;
    let mut out = vec![0.0; n];
    for (i, (&value, &shift)) in values.iter().zip(shifts).enumerate() {
        for s in 0..n_subcells {
            let pos = i as f64 + (s as f64 + 0.5) / sub - 0.5 + shift;
            let j = pos.round();
            if j >= 0.0 && (j as usize) < n {
                out[j as usize] += value / sub;
            }
        }
    }
    out
}

/// Which nodes the coeval callback runs at.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackSchedule {
    /// Every n-th node, starting with the first.
    Every(usize),
    /// The node nearest each redshift.
    At(Vec<f64>),
}

impl Default for CallbackSchedule {
    fn default() -> Self {
        CallbackSchedule::Every(1)
    }
}

impl CallbackSchedule {
    /// Node indices the callback runs at.
    pub fn node_indices(&self, nodes: &[f64]) -> BTreeSet<usize> {
        match self {
            CallbackSchedule::Every(n) => (0..nodes.len()).step_by((*n).max(1)).collect(),
            CallbackSchedule::At(zs) => {
                let mut picked = BTreeSet::new();
                for &z in zs {
                    let nearest = nodes
                        .iter()
                        .enumerate()
                        .min_by(|a, b| (a.1 - z).abs().total_cmp(&(b.1 - z).abs()))
                        .map(|(i, _)| i);
                    if let Some(i) = nearest {
                        if !picked.insert(i) {
                            warn!(
                                redshift = z,
                                node = nodes[i],
                                "Two callback redshifts map to the same node; running once"
                            );
                        }
                    }
                }
                picked
            }
        }
    }
}

pub type CoevalCallback<'c, R> = Box<dyn FnMut(&Coeval) -> anyhow::Result<R> + 'c>;

pub struct LightconeOptions<'c, R = ()> {
    pub params: ParamArgs,
    pub initial_conditions: Option<InitialConditions>,
    /// Pre-computed perturbed fields; their redshifts become the nodes.
    pub perturbed_fields: Vec<PerturbedField>,
    /// Fields to record the volume average of at every node.
    pub global_quantities: Vec<String>,
    pub always_purge: bool,
    pub hooks: Vec<Hook>,
    pub global_overrides: Vec<(String, f64)>,
    /// Checkpoint file, created if missing and resumed from if present.
    pub checkpoint: Option<PathBuf>,
    /// Stop after the first node at or below this redshift.
    pub return_at_z: Option<f64>,
    pub coeval_callback: Option<CoevalCallback<'c, R>>,
    pub callback_schedule: CallbackSchedule,
}

impl<R> Default for LightconeOptions<'_, R> {
    fn default() -> Self {
        Self {
            params: ParamArgs::default(),
            initial_conditions: None,
            perturbed_fields: Vec::new(),
            global_quantities: vec!["brightness_temp".into(), "xH_box".into()],
            always_purge: false,
            hooks: Vec::new(),
            global_overrides: Vec::new(),
            checkpoint: None,
            return_at_z: None,
            coeval_callback: None,
            callback_schedule: CallbackSchedule::default(),
        }
    }
}

/// A lightcone plus whatever the coeval callback returned, by node redshift.
#[derive(Debug, Clone)]
pub struct LightconeRun<R = ()> {
    pub lightcone: Lightcone,
    pub callback_outputs: Vec<(f64, R)>,
}

/// Expected identity of a box produced at node `c`.
fn node_identity(
    kind: OutputKind,
    inputs: &InputParameters,
    nodes: &[f64],
    c: usize,
    globals: &GlobalParams,
) -> Identity {
    let z = nodes[c];
    let prev = if c > 0 {
        Some(nodes[c - 1])
    } else {
        step_back(z, globals)
    };
    let flags = &inputs.flag_options;
    let identity = Identity::new(kind, inputs, Some(z));
    match kind {
        OutputKind::IonizedBox | OutputKind::BrightnessTemp => {
            identity.with_lineage("prev_ionize_redshift", prev.filter(|_| flags.needs_history()))
        }
        OutputKind::TsBox => identity
            .with_lineage("prev_spin_redshift", prev)
            .with_lineage("perturbed_field_redshift", Some(z)),
        OutputKind::HaloBox => {
            let feedback = prev.filter(|_| flags.use_mini_halos);
            identity
                .with_lineage("prev_spin_redshift", feedback)
                .with_lineage("prev_ionize_redshift", feedback)
        }
        _ => identity,
    }
}

/// Read the box written for `expected` out of `candidates`.
fn cached_box<T: OutputStruct>(
    direc: &Path,
    candidates: &IndexMap<OutputKind, Vec<BoxData>>,
    expected: &Identity,
) -> Result<T> {
    let found = candidates
        .get(&T::KIND)
        .and_then(|boxes| boxes.iter().find(|b| b.identity().matches(expected)));
    let Some(found) = found else {
        return Err(Error::Checkpoint(format!(
            "no cached {} at z={:?} in {}; resuming needs the boxes the interrupted run wrote",
            T::KIND,
            expected.redshift,
            direc.display()
        )));
    };
    let mut data = found.clone();
    data.read(direc)?;
    Ok(T::from_data(data))
}

fn volume_mean(coeval: &Coeval, quantity: &str) -> Result<f64> {
    let array = coeval.get(quantity).ok_or_else(|| Error::NotComputed {
        kind: lightcone_field_kind(quantity).unwrap_or(OutputKind::BrightnessTemp),
        message: format!("coeval at z={} has no {quantity}", coeval.redshift),
    })?;
    let n = array.len().max(1) as f64;
    Ok(array.iter().map(|&v| v as f64).sum::<f64>() / n)
}

fn check_nodes(nodes: &[f64], lc_redshifts: &[f64]) -> Result<()> {
    if nodes.windows(2).any(|w| w[1] >= w[0]) {
        return Err(Error::Redshift(
            "node redshifts must be strictly descending".into(),
        ));
    }
    let (Some(&top), Some(&bottom)) = (nodes.first(), nodes.last()) else {
        return Err(Error::Redshift("no node redshifts".into()));
    };
    // The lightcone redshifts come from inverting the distance integral.
    let inside = lc_redshifts
        .iter()
        .all(|&z| bottom * 0.99 < z && z < top * 1.01);
    if !inside {
        return Err(Error::Redshift(format!(
            "lightcone redshifts span [{:?}, {:?}] but the nodes only cover [{bottom}, {top}]",
            lc_redshifts.first(),
            lc_redshifts.last()
        )));
    }
    Ok(())
}

/// Build a lightcone over the lightconer's redshift range.
///
/// With `options.checkpoint` pointing at an existing file, only the nodes
/// below its last finished redshift are computed; the boxes of that node are
/// read back from the cache to seed the history.
pub fn run_lightcone<R>(
    engine: &mut dyn Engine,
    globals: &mut GlobalParams,
    io: IoOptions,
    lightconer: &dyn Lightconer,
    options: LightconeOptions<'_, R>,
) -> Result<LightconeRun<R>> {
    let LightconeOptions {
        params,
        initial_conditions: given_ics,
        perturbed_fields: given_fields,
        global_quantities,
        always_purge,
        hooks,
        global_overrides,
        checkpoint,
        return_at_z,
        mut coeval_callback,
        callback_schedule,
    } = options;

    let scoped = globals.scoped(&global_overrides)?;
    let globals: &GlobalParams = &scoped;

    let mut carriers: Vec<&BoxData> = given_fields.iter().map(|p| p.data()).collect();
    if let Some(ics) = &given_ics {
        carriers.push(ics.data());
    }
    carriers.retain(|c| !c.is_placeholder() && c.state() != BoxState::Uninitialized);
    let mut inputs = params.resolve(&carriers, globals)?;
    let flags = inputs.flag_options.clone();
    lightconer.validate_options(&inputs.user_params, &flags)?;
    for quantity in &global_quantities {
        if lightcone_field_kind(quantity).is_none() {
            return Err(ParamError::validation(quantity, "not a lightcone quantity").into());
        }
    }

    let lc_redshifts = lightconer.lc_redshifts();
    let nodes = if given_fields.is_empty() {
        let (Some(&min_z), Some(&max_z)) = (lc_redshifts.first(), lc_redshifts.last()) else {
            return Err(Error::Redshift("lightconer has no slices".into()));
        };
        lightcone_node_redshifts(min_z, max_z, &flags, globals)?
    } else {
        given_fields
            .iter()
            .map(|p| {
                p.redshift()
                    .ok_or_else(|| Error::Redshift("perturbed field has no redshift".into()))
            })
            .collect::<Result<Vec<_>>>()?
    };
    check_nodes(&nodes, lc_redshifts)?;

    let min_node = nodes.last().copied().unwrap_or_default();
    if flags.photon_cons_type == PhotonConsType::Redshift && min_node < globals.photon_cons_end_calibz {
        return Err(Error::Redshift(format!(
            "z={min_node} is below the end of the photon non-conservation calibration \
             (PhotonConsEndCalibz={}); lower PhotonConsEndCalibz to allow it",
            globals.photon_cons_end_calibz
        )));
    }
    if inputs.user_params.minimize_memory && !io.write {
        return Err(ParamError::validation(
            "UserParams.MINIMIZE_MEMORY",
            "purged boxes are reloaded from the cache, so writing must be enabled",
        )
        .into());
    }
    if return_at_z.is_some() && !io.write {
        return Err(ParamError::validation(
            "return_at_z",
            "an early return can only be resumed from cached boxes, so writing must be enabled",
        )
        .into());
    }

    // Resume, or hand back a lightcone that is already complete.
    let mut resumed: Option<(LightconeCheckpoint, Lightcone)> = None;
    if let Some(path) = checkpoint.as_deref().filter(|p| p.exists()) {
        let (ckpt, lc) = LightconeCheckpoint::open(path)?;
        if inputs.random_seed.is_none() {
            inputs.random_seed = lc.inputs.random_seed;
        }
        if lc.inputs != inputs {
            return Err(Error::Incompatible {
                field: "inputs".into(),
                this: path.display().to_string(),
                other: "the requested parameters".into(),
            });
        }
        let same_nodes = lc.node_redshifts.len() == nodes.len()
            && lc
                .node_redshifts
                .iter()
                .zip(&nodes)
                .all(|(a, b)| redshifts_match(*a, *b));
        if !same_nodes {
            return Err(Error::Incompatible {
                field: "node_redshifts".into(),
                this: format!("{} nodes in {}", lc.node_redshifts.len(), path.display()),
                other: format!("{} requested", nodes.len()),
            });
        }
        if lc.is_complete() {
            info!(redshift = ?lc.current_redshift, "Lightcone already complete, returning it");
            return Ok(LightconeRun {
                lightcone: lc,
                callback_outputs: Vec::new(),
            });
        }
        resumed = Some((ckpt, lc));
    }
    let start = match resumed.as_ref().and_then(|(_, lc)| lc.current_redshift) {
        Some(done) => nodes.iter().take_while(|&&z| z >= done || redshifts_match(z, done)).count(),
        None => 0,
    };
    let remaining = &nodes[start..];
    info!(
        nodes = nodes.len(),
        remaining = remaining.len(),
        slices = lightconer.lc_distances().len(),
        "Starting lightcone run"
    );

    let mut ctx = StageContext::new(engine, globals, io);
    for hook in hooks {
        ctx = ctx.with_hook(hook);
    }

    let mut ics = resolve_initial_conditions(&mut ctx, given_ics, &mut inputs)?;
    advisory(ics.prepare_for_perturb(&flags, always_purge))?;
    ctx.ensure_photon_cons(&inputs)?;

    let mut fields = perturbed_fields(&mut ctx, &inputs, &ics, remaining, given_fields, always_purge)?;
    advisory(ics.prepare_for_halos(&flags, always_purge))?;
    let mut pt_halos = perturbed_halo_chain(&mut ctx, &inputs, &ics, remaining, always_purge)?;
    advisory(ics.prepare_for_spin_temp(&flags, globals, always_purge))?;

    let mut files = CacheFiles::new();
    record(&mut files, "init", ics.data());
    let ics = Arc::new(ics);

    let (mut ckpt, mut lc) = match resumed {
        Some((ckpt, lc)) => (Some(ckpt), lc),
        None => {
            let lc = Lightcone::new(lightconer, inputs.clone(), globals, nodes.clone(), &global_quantities);
            let ckpt = match checkpoint.as_deref() {
                Some(path) => Some(LightconeCheckpoint::create(path, &lc)?),
                None => None,
            };
            (ckpt, lc)
        }
    };

    // Seed the history from the cache when resuming.
    let mut history = History::default();
    let mut prev_coeval: Option<Coeval> = None;
    if start > 0 {
        let c = start - 1;
        let z = nodes[c];
        let direc = ctx.io().direc.clone();
        info!(redshift = z, direc = %direc.display(), "Reading boxes to resume from");
        let boxes = get_boxes_at_redshift(&direc, z, inputs.random_seed, Some(&inputs))?;
        let expect = |kind| node_identity(kind, &inputs, &nodes, c, globals);

        let field: PerturbedField = cached_box(&direc, &boxes, &expect(OutputKind::PerturbedField))?;
        let ionized: IonizedBox = cached_box(&direc, &boxes, &expect(OutputKind::IonizedBox))?;
        let bt: BrightnessTemp = cached_box(&direc, &boxes, &expect(OutputKind::BrightnessTemp))?;
        let spin: Option<TsBox> = if flags.use_ts_fluct {
            Some(cached_box(&direc, &boxes, &expect(OutputKind::TsBox))?)
        } else {
            None
        };
        let halobox: Option<HaloBox> = if flags.use_halo_field {
            Some(cached_box(&direc, &boxes, &expect(OutputKind::HaloBox))?)
        } else {
            None
        };
        if flags.use_halo_field && flags.use_ts_fluct {
            for (j, &zj) in nodes[..start].iter().enumerate() {
                let mut hbox: HaloBox = if j == c {
                    halobox.clone().ok_or_else(|| Error::Checkpoint("missing halo grid".into()))?
                } else {
                    let found = get_boxes_at_redshift(&direc, zj, inputs.random_seed, Some(&inputs))?;
                    cached_box(&direc, &found, &node_identity(OutputKind::HaloBox, &inputs, &nodes, j, globals))?
                };
                advisory(hbox.purge(&HBOX_HISTORY_FIELDS, true))?;
                history.hboxes.push(hbox);
            }
        }

        history.ionized = Some(ionized.clone());
        history.spin = spin.clone();
        if flags.use_mini_halos {
            history.field = Some(field.clone());
        }
        prev_coeval = Some(Coeval {
            redshift: z,
            initial_conditions: ics.clone(),
            perturbed_field: field,
            ionized_box: ionized,
            brightness_temp: bt,
            ts_box: spin,
            halobox,
            photon_nonconservation_data: None,
            cache_files: CacheFiles::new(),
        });
    }

    let callback_nodes = callback_schedule.node_indices(&nodes);
    let mut callback_outputs = Vec::new();
    let mut callback_called = false;

    for (k, &z) in remaining.iter().enumerate() {
        let node = start + k;
        info!(redshift = z, node = node + 1, of = nodes.len(), "Computing lightcone node");

        let field = fields[k].take().ok_or_else(|| Error::NotComputed {
            kind: OutputKind::PerturbedField,
            message: format!("no perturbed field at z={z}"),
        })?;
        let ph = pt_halos[k].take();
        let step = evolve(
            &mut ctx,
            &inputs,
            &ics,
            field,
            ph.as_ref(),
            None,
            &mut history,
            always_purge,
        )?;
        let bt = brightness_temperature(
            &mut ctx,
            BrightnessTempArgs {
                params: ParamArgs::from(&inputs),
                ionized_box: &step.ionized,
                perturbed_field: &step.field,
                spin_temp: step.spin.as_ref(),
            },
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
        record(&mut files, "brightness_temp", bt.data());

        lc.log10_mturnovers[node] = step.ionized.scalar("log10_Mturnover_ave").unwrap_or(0.0);
        lc.log10_mturnovers_mini[node] =
            step.ionized.scalar("log10_Mturnover_MINI_ave").unwrap_or(0.0);

        history.ionized = Some(step.ionized.clone());
        if flags.use_mini_halos {
            history.field = Some(step.field.clone());
        }
        if step.spin.is_some() {
            history.spin = step.spin.clone();
        }

        let coeval = Coeval {
            redshift: z,
            initial_conditions: ics.clone(),
            perturbed_field: step.field,
            ionized_box: step.ionized,
            brightness_temp: bt,
            ts_box: step.spin,
            halobox: step.halobox,
            photon_nonconservation_data: None,
            cache_files: CacheFiles::new(),
        };

        for quantity in &global_quantities {
            let mean = volume_mean(&coeval, quantity)?;
            if let Some(series) = lc.global_quantities.get_mut(quantity) {
                series[node] = mean;
            }
        }

        let mut filled: Range<usize> = 0..0;
        if let Some(prev) = &prev_coeval {
            for slab in lightconer.make_lightcone_slices(&coeval, prev)? {
                lc.write_slab(&slab.quantity, &slab.indices, &slab.data)?;
                filled = slab.indices.clone();
            }
        }
        if !filled.is_empty() {
            lc.current_index = lc.current_index.min(filled.start);
            debug!(redshift = z, slices = ?filled, "Filled lightcone slices");
        }
        lc.current_redshift = Some(z);
        if let Some(ckpt) = ckpt.as_mut() {
            ckpt.record_node(&lc, node, filled)?;
        }

        if let Some(callback) = coeval_callback.as_mut().filter(|_| callback_nodes.contains(&node)) {
            let first = !callback_called;
            callback_called = true;
            match callback(&coeval) {
                Ok(out) => callback_outputs.push((z, out)),
                Err(e) if first => {
                    return Err(Error::Callback {
                        redshift: z,
                        message: format!("{e:#}"),
                    })
                }
                Err(e) => warn!(redshift = z, error = %format!("{e:#}"), "Coeval callback failed, skipping"),
            }
        }

        prev_coeval = Some(coeval);

        if return_at_z.is_some_and(|rz| z <= rz) && node + 1 < nodes.len() {
            info!(redshift = z, "Returning early");
            break;
        }
    }

    lc.photon_nonconservation_data = finish_engine(&mut ctx, &inputs);
    for (stage, entries) in files {
        lc.cache_files.entry(stage).or_default().extend(entries);
    }

    if lc.is_complete() && lc.geometry == Geometry::Angular && lightconer.get_los_velocity() {
        lc.compute_rsds(inputs.astro_params.n_rsd_steps)?;
    }
    if let Some(ckpt) = ckpt {
        ckpt.finalize(&lc)?;
    }
    info!(redshift = ?lc.current_redshift, complete = lc.is_complete(), "Finished lightcone run");

    Ok(LightconeRun {
        lightcone: lc,
        callback_outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_gradient_linear() {
        let x = [0.0, 1.0, 2.0, 4.0];
        let f: Vec<f64> = x.iter().map(|v| 3.0 * v + 1.0).collect();
        for g in gradient(&f, &x) {
            assert!((g - 3.0).abs() < 1e-12);
        }
        assert_eq!(gradient(&[5.0], &[0.0]), vec![0.0]);
    }

    #[test]
    fn test_redistribute_conserves_without_shift() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let out = redistribute(&values, &[0.0; 4], 4);
        for (a, b) in out.iter().zip(values) {
            assert!((a - b).abs() < 1e-12);
        }
        let shifted = redistribute(&values, &[1.0; 4], 2);
        assert_eq!(shifted[0], 0.0);
        assert!((shifted[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_callback_schedule() {
        let nodes = [10.0, 9.0, 8.0, 7.0, 6.0];
        assert_eq!(
            CallbackSchedule::Every(2).node_indices(&nodes).into_iter().collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
        let at = CallbackSchedule::At(vec![8.1, 7.9, 6.2]).node_indices(&nodes);
        assert_eq!(at.into_iter().collect::<Vec<_>>(), vec![2, 4]);
    }

    fn angular_lightcone(velocity: f32) -> Lightcone {
        let mut inputs = InputParameters::with_seed(1);
        inputs.user_params.hii_dim = 4;
        let distances: Vec<f64> = (0..8).map(|i| 9000.0 + 2.0 * i as f64).collect();
        let mut lightcones = IndexMap::new();
        lightcones.insert(
            "brightness_temp".to_string(),
            Array2::<f32>::from_elem((3, 8), 10.0).into_dyn(),
        );
        lightcones.insert(
            LOS_VELOCITY.to_string(),
            Array2::<f32>::from_elem((3, 8), velocity).into_dyn(),
        );
        Lightcone {
            geometry: Geometry::Angular,
            inputs,
            globals: GlobalParams::default(),
            distances,
            node_redshifts: vec![9.0, 8.0],
            lightcones,
            global_quantities: IndexMap::new(),
            log10_mturnovers: vec![0.0; 2],
            log10_mturnovers_mini: vec![0.0; 2],
            photon_nonconservation_data: None,
            cache_files: CacheFiles::new(),
            derived_fields: Vec::new(),
            current_redshift: Some(8.0),
            current_index: 0,
        }
    }

    #[test]
    fn test_rsds_identity_for_zero_velocity() {
        let mut lc = angular_lightcone(0.0);
        lc.compute_rsds(0).unwrap();
        let rsd = &lc.lightcones[BRIGHTNESS_TEMP_WITH_RSDS];
        assert!(rsd.iter().all(|&v| (v - 10.0).abs() < 1e-5));
        assert_eq!(lc.derived_fields, vec![BRIGHTNESS_TEMP_WITH_RSDS.to_string()]);
        assert!(lc.cell_size().is_none());

        // A second call keeps the first result.
        lc.compute_rsds(4).unwrap();
        assert_eq!(lc.derived_fields.len(), 1);
    }

    #[test]
    fn test_rsds_need_velocity() {
        let mut lc = angular_lightcone(0.0);
        lc.lightcones.shift_remove(LOS_VELOCITY);
        assert!(matches!(lc.compute_rsds(0), Err(Error::NotComputed { .. })));
    }

    #[test]
    fn test_check_nodes() {
        assert!(check_nodes(&[9.0, 8.0, 7.0], &[7.0, 8.5]).is_ok());
        assert!(check_nodes(&[7.0, 8.0], &[7.5]).is_err());
        assert!(check_nodes(&[9.0, 8.0], &[7.0, 8.5]).is_err());
        assert!(check_nodes(&[], &[7.0]).is_err());
    }

    #[test]
    fn test_halo_grid_resume_identity() {
        let globals = GlobalParams::default();
        let nodes = [36.0, 30.0, 25.0];
        let mut inputs = InputParameters::with_seed(3);
        inputs.flag_options.use_halo_field = true;
        inputs.flag_options.use_mass_dependent_zeta = true;
        let plain = node_identity(OutputKind::HaloBox, &inputs, &nodes, 1, &globals);
        assert!(plain.lineage.is_empty());

        inputs.flag_options.inhomo_reco = true;
        inputs.flag_options.use_ts_fluct = true;
        inputs.flag_options.use_mini_halos = true;
        let fed = node_identity(OutputKind::HaloBox, &inputs, &nodes, 1, &globals);
        assert_eq!(fed.lineage.get("prev_spin_redshift"), Some(&36.0));
        assert_eq!(fed.lineage.get("prev_ionize_redshift"), Some(&36.0));
        // Above the heating ceiling there is nothing to feed back.
        let top = node_identity(OutputKind::HaloBox, &inputs, &nodes, 0, &globals);
        assert!(top.lineage.is_empty());
    }
}
