//! Output entities.
//!
//! [`BoxData`] is the one concrete representation of every computed box: an
//! [`Identity`] plus named arrays and scalars. The nine typed wrappers
//! ([`InitialConditions`], [`PerturbedField`], ...) only fix the kind so stage
//! signatures can't mix them up.
//!
//! Lifecycle: uninitialized -> allocated -> computed -> (purged -> computed).
//! Arrays are owned exclusively by the entity and dropped with it; purging is
//! an explicit, separate operation that keeps identity and scalars.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use ndarray::ArrayD;
use reionize_foundation::{fnv1a64_str, redshifts_match};
use reionize_params::{
    AstroParams, CosmoParams, FlagOptions, GlobalParams, InputParameters, ParamStruct, UserParams,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache;
use crate::registry::OutputKind;
use crate::{Error, Result};

/// Everything that determines the contents of a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub kind: OutputKind,
    pub random_seed: Option<u64>,
    pub cosmo_params: CosmoParams,
    pub user_params: UserParams,
    /// Only for kinds where [`OutputKind::uses_astro`] holds.
    pub astro_params: Option<AstroParams>,
    pub flag_options: Option<FlagOptions>,
    pub redshift: Option<f64>,
    /// Redshifts of the predecessors this box was evolved from.
    pub lineage: BTreeMap<String, f64>,
}

impl Identity {
    pub fn new(kind: OutputKind, inputs: &InputParameters, redshift: Option<f64>) -> Self {
        let (astro_params, flag_options) = if kind.uses_astro() {
            (
                Some(inputs.astro_params.clone()),
                Some(inputs.flag_options.clone()),
            )
        } else {
            (None, None)
        };
        Self {
            kind,
            random_seed: inputs.random_seed,
            cosmo_params: inputs.cosmo_params.clone(),
            user_params: inputs.user_params.clone(),
            astro_params,
            flag_options,
            redshift: if kind.has_redshift() { redshift } else { None },
            lineage: BTreeMap::new(),
        }
    }

    pub fn with_lineage(mut self, name: &str, redshift: Option<f64>) -> Self {
        if let Some(z) = redshift {
            self.lineage.insert(name.to_string(), z);
        }
        self
    }

    /// Parameters as a full bundle; astro and flags default when absent.
    pub fn inputs(&self) -> InputParameters {
        InputParameters {
            random_seed: self.random_seed,
            cosmo_params: self.cosmo_params.clone(),
            user_params: self.user_params.clone(),
            astro_params: self.astro_params.clone().unwrap_or_default(),
            flag_options: self.flag_options.clone().unwrap_or_default(),
        }
    }

    /// Canonical JSON of the persisted identity, without the seed.
    pub fn key(&self) -> String {
        fn table<P: ParamStruct>(p: &P) -> serde_json::Value {
            serde_json::Value::Object(
                p.fields()
                    .into_iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect(),
            )
        }
        let mut key = serde_json::Map::new();
        key.insert("kind".into(), self.kind.as_str().into());
        key.insert("cosmo_params".into(), table(&self.cosmo_params));
        key.insert("user_params".into(), table(&self.user_params));
        if let Some(astro) = &self.astro_params {
            key.insert("astro_params".into(), table(astro));
        }
        if let Some(flags) = &self.flag_options {
            key.insert("flag_options".into(), table(flags));
        }
        if let Some(z) = self.redshift {
            key.insert("redshift".into(), z.into());
        }
        for (name, z) in &self.lineage {
            key.insert(name.clone(), (*z).into());
        }
        serde_json::Value::Object(key).to_string()
    }

    pub fn key_hash(&self) -> u64 {
        fnv1a64_str(&self.key())
    }

    /// Same key, and seeds agree wherever both are known.
    pub fn matches(&self, other: &Identity) -> bool {
        let seeds_agree = match (self.random_seed, other.random_seed) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        seeds_agree && self.key() == other.key()
    }

    /// Fail on the first shared parameter that differs.
    ///
    /// `ignore` may name `"redshift"`, `"random_seed"` or a struct
    /// (`"astro_params"`, `"flag_options"`, ...).
    pub fn check_compatible(&self, other: &Identity, ignore: &[&str]) -> Result<()> {
        let skip = |name: &str| ignore.iter().any(|i| i.eq_ignore_ascii_case(name));

        if !skip("random_seed") {
            if let (Some(a), Some(b)) = (self.random_seed, other.random_seed) {
                if a != b {
                    return Err(incompatible("random_seed", a, b));
                }
            }
        }
        if !skip("cosmo_params") {
            diff_struct(&self.cosmo_params, &other.cosmo_params)?;
        }
        if !skip("user_params") {
            diff_struct(&self.user_params, &other.user_params)?;
        }
        if !skip("astro_params") {
            if let (Some(a), Some(b)) = (&self.astro_params, &other.astro_params) {
                diff_struct(a, b)?;
            }
        }
        if !skip("flag_options") {
            if let (Some(a), Some(b)) = (&self.flag_options, &other.flag_options) {
                diff_struct(a, b)?;
            }
        }
        if !skip("redshift") {
            if let (Some(a), Some(b)) = (self.redshift, other.redshift) {
                if !redshifts_match(a, b) {
                    return Err(incompatible("redshift", a, b));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        if let Some(z) = self.redshift {
            write!(f, "redshift={z}, ")?;
        }
        match self.random_seed {
            Some(seed) => write!(f, "random_seed={seed}, ")?,
            None => write!(f, "random_seed=None, ")?,
        }
        for (name, z) in &self.lineage {
            write!(f, "{name}={z}, ")?;
        }
        write!(f, "{}, {}", self.cosmo_params, self.user_params)?;
        if let Some(astro) = &self.astro_params {
            write!(f, ", {astro}")?;
        }
        if let Some(flags) = &self.flag_options {
            write!(f, ", {flags}")?;
        }
        write!(f, ")")
    }
}

fn incompatible(field: &str, this: impl ToString, other: impl ToString) -> Error {
    Error::Incompatible {
        field: field.to_string(),
        this: this.to_string(),
        other: other.to_string(),
    }
}

fn diff_struct<P: ParamStruct>(a: &P, b: &P) -> Result<()> {
    match a.diff(b) {
        Some((name, x, y)) => Err(incompatible(&format!("{}.{}", P::NAME, name), x, y)),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxState {
    Uninitialized,
    Allocated,
    Computed,
    Purged,
}

/// Stand-ins used where a predecessor does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Zero-filled start of an evolutionary chain.
    Initial,
    /// The feature that would produce this input is off.
    Dummy,
}

/// Identity plus owned arrays and scalars.
#[derive(Debug, Clone)]
pub struct BoxData {
    identity: Identity,
    arrays: IndexMap<String, ArrayD<f32>>,
    scalars: IndexMap<String, f64>,
    state: BoxState,
    placeholder: Option<Placeholder>,
    path: Option<PathBuf>,
}

impl BoxData {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            arrays: IndexMap::new(),
            scalars: IndexMap::new(),
            state: BoxState::Uninitialized,
            placeholder: None,
            path: None,
        }
    }

    /// A zero-filled box standing in for "before the first step".
    pub fn initial(identity: Identity, globals: &GlobalParams) -> Self {
        let mut data = Self::new(identity);
        data.allocate(globals);
        data.state = BoxState::Computed;
        data.placeholder = Some(Placeholder::Initial);
        data
    }

    /// An empty box passed where a disabled feature's input would go.
    pub fn dummy(identity: Identity) -> Self {
        let mut data = Self::new(identity);
        data.placeholder = Some(Placeholder::Dummy);
        data
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn kind(&self) -> OutputKind {
        self.identity.kind
    }

    pub fn redshift(&self) -> Option<f64> {
        self.identity.redshift
    }

    pub fn random_seed(&self) -> Option<u64> {
        self.identity.random_seed
    }

    pub fn state(&self) -> BoxState {
        self.state
    }

    pub fn placeholder(&self) -> Option<Placeholder> {
        self.placeholder
    }

    pub fn is_computed(&self) -> bool {
        self.state == BoxState::Computed
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder.is_some()
    }

    /// Cache record this box was last read from or written to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn array(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.arrays.get(name)
    }

    /// Like [`array`](Self::array) but reports why it is missing.
    pub fn require(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.arrays.get(name).ok_or_else(|| Error::NotComputed {
            kind: self.kind(),
            message: format!("field {name} is not loaded (state {:?})", self.state),
        })
    }

    pub fn array_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.arrays.get_mut(name)
    }

    pub fn set_array(&mut self, name: &str, array: ArrayD<f32>) {
        self.arrays.insert(name.to_string(), array);
    }

    pub fn arrays(&self) -> &IndexMap<String, ArrayD<f32>> {
        &self.arrays
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) {
        self.scalars.insert(name.to_string(), value);
    }

    pub fn scalars(&self) -> &IndexMap<String, f64> {
        &self.scalars
    }

    /// Zero-fill every fixed-shape array field of this kind.
    pub fn allocate(&mut self, globals: &GlobalParams) {
        let user = &self.identity.user_params;
        for spec in self.identity.kind.array_fields() {
            if let Some(dims) = spec.shape.dims(user, globals) {
                self.arrays
                    .entry(spec.name.to_string())
                    .or_insert_with(|| ArrayD::zeros(dims));
            }
        }
        if self.state == BoxState::Uninitialized {
            self.state = BoxState::Allocated;
        }
    }

    pub(crate) fn mark_computed(&mut self) {
        self.state = BoxState::Computed;
    }

    pub(crate) fn set_random_seed(&mut self, seed: u64) {
        self.identity.random_seed = Some(seed);
    }

    pub(crate) fn fill(
        &mut self,
        arrays: IndexMap<String, ArrayD<f32>>,
        scalars: IndexMap<String, f64>,
        path: PathBuf,
    ) {
        self.arrays = arrays;
        self.scalars = scalars;
        self.path = Some(path);
        self.state = BoxState::Computed;
    }

    /// True if a record with this identity is in `direc`.
    pub fn exists(&self, direc: &Path) -> bool {
        cache::find_record(direc, &self.identity).is_some()
    }

    /// Populate from the matching record in `direc`.
    ///
    /// Fails with [`Error::NotFound`] on a cache miss. A box with no seed
    /// adopts the seed of the record it was read from.
    pub fn read(&mut self, direc: &Path) -> Result<()> {
        let path = cache::find_record(direc, &self.identity).ok_or_else(|| Error::NotFound {
            kind: self.kind(),
            path: direc.to_path_buf(),
        })?;
        let (header, arrays) = cache::read_record(&path)?;
        if !header.identity.matches(&self.identity) {
            return Err(Error::NotFound {
                kind: self.kind(),
                path,
            });
        }
        if let Some(seed) = header.identity.random_seed {
            self.set_random_seed(seed);
        }
        self.placeholder = None;
        self.fill(arrays, header.scalars, path);
        debug!(kind = %self.kind(), redshift = ?self.redshift(), "Read from cache");
        Ok(())
    }

    /// Write a record to `direc`, returning its path.
    ///
    /// If a record for this identity already exists this only records its
    /// path, unless `overwrite` is set.
    pub fn write(&mut self, direc: &Path, overwrite: bool) -> Result<PathBuf> {
        if self.state != BoxState::Computed || self.is_placeholder() {
            return Err(Error::NotComputed {
                kind: self.kind(),
                message: "only computed boxes can be written".into(),
            });
        }
        let path = cache::record_path(direc, &self.identity)?;
        if path.exists() && !overwrite {
            debug!(path = %path.display(), "Record already exists, not rewriting");
        } else {
            cache::write_record(&path, self)?;
            info!(kind = %self.kind(), redshift = ?self.redshift(), path = %path.display(), "Wrote box");
        }
        self.path = Some(path.clone());
        Ok(path)
    }

    /// Refill purged arrays from the record this box was written to.
    pub fn load_all(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or_else(|| Error::NotComputed {
            kind: self.kind(),
            message: "no cache record to load from".into(),
        })?;
        if self.state == BoxState::Computed {
            return Ok(());
        }
        let (header, arrays) = cache::read_record(&path)?;
        self.fill(arrays, header.scalars, path);
        debug!(kind = %self.kind(), redshift = ?self.redshift(), "Reloaded purged arrays");
        Ok(())
    }

    /// This box with every array loaded, reading a copy back from the cache
    /// if it has been purged.
    pub fn loaded(&self) -> Result<Cow<'_, BoxData>> {
        if self.state != BoxState::Purged {
            return Ok(Cow::Borrowed(self));
        }
        let mut copy = self.clone();
        copy.load_all()?;
        Ok(Cow::Owned(copy))
    }

    /// Release every array not named in `keep`.
    ///
    /// Fails with [`Error::NothingToPurge`] if there is nothing computed to
    /// release, and with [`Error::UnsafePurge`] if the box was never written.
    /// With `force` both cases are silent.
    pub fn purge(&mut self, keep: &[&str], force: bool) -> Result<()> {
        let computed = matches!(self.state, BoxState::Computed | BoxState::Purged);
        if !computed || self.is_placeholder() {
            return if force {
                Ok(())
            } else {
                Err(Error::NothingToPurge(self.kind()))
            };
        }
        if self.path.is_none() && !force {
            return Err(Error::UnsafePurge(self.kind()));
        }
        let before = self.arrays.len();
        self.arrays.retain(|name, _| keep.contains(&name.as_str()));
        if self.arrays.len() == before {
            if self.state == BoxState::Purged && !force {
                return Err(Error::NothingToPurge(self.kind()));
            }
            return Ok(());
        }
        self.state = BoxState::Purged;
        debug!(
            kind = %self.kind(),
            redshift = ?self.redshift(),
            released = before - self.arrays.len(),
            "Purged arrays"
        );
        Ok(())
    }

    /// Check shared parameters against every non-placeholder `other`.
    pub fn check_compatible(&self, others: &[&BoxData], ignore: &[&str]) -> Result<()> {
        for other in others.iter().filter(|o| !o.is_placeholder()) {
            self.identity.check_compatible(&other.identity, ignore)?;
        }
        Ok(())
    }
}

/// Common shape of the typed wrappers.
pub trait OutputStruct: Deref<Target = BoxData> + DerefMut + Sized {
    const KIND: OutputKind;

    fn from_data(data: BoxData) -> Self;

    fn into_data(self) -> BoxData;

    fn data(&self) -> &BoxData {
        self
    }

    /// Wrap `data`, checking its kind.
    fn try_from_data(data: BoxData) -> Result<Self> {
        if data.kind() != Self::KIND {
            return Err(incompatible("kind", Self::KIND, data.kind()));
        }
        Ok(Self::from_data(data))
    }

    fn uncomputed(inputs: &InputParameters, redshift: Option<f64>) -> Self {
        Self::from_data(BoxData::new(Identity::new(Self::KIND, inputs, redshift)))
    }

    fn initial(inputs: &InputParameters, redshift: Option<f64>, globals: &GlobalParams) -> Self {
        Self::from_data(BoxData::initial(
            Identity::new(Self::KIND, inputs, redshift),
            globals,
        ))
    }

    fn dummy(inputs: &InputParameters) -> Self {
        Self::from_data(BoxData::dummy(Identity::new(Self::KIND, inputs, None)))
    }
}

macro_rules! output_struct {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name(BoxData);

        impl OutputStruct for $name {
            const KIND: OutputKind = OutputKind::$name;

            fn from_data(data: BoxData) -> Self {
                Self(data)
            }

            fn into_data(self) -> BoxData {
                self.0
            }
        }

        impl Deref for $name {
            type Target = BoxData;

            fn deref(&self) -> &BoxData {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut BoxData {
                &mut self.0
            }
        }
    };
}

output_struct!(
    /// Gaussian random fields the whole run is seeded from.
    InitialConditions
);
output_struct!(
    /// Density and velocity evolved to one redshift.
    PerturbedField
);
output_struct!(
    /// Halo catalog sampled at one redshift.
    HaloField
);
output_struct!(
    /// Halo catalog moved to Lagrangian-perturbed positions.
    PerturbHaloField
);
output_struct!(
    /// Halo properties gridded onto the low-res box.
    HaloBox
);
output_struct!(
    /// Star formation filtered over the spin-temperature shells.
    XraySourceBox
);
output_struct!(
    /// Spin temperature and IGM thermal state.
    TsBox
);
output_struct!(
    /// Neutral fraction and ionisation state.
    IonizedBox
);
output_struct!(BrightnessTemp);

impl InitialConditions {
    fn prepare(&mut self, keep: &[&str], force: bool) -> Result<()> {
        self.purge(keep, force)
    }

    /// Keep only what perturbing the fields needs.
    pub fn prepare_for_perturb(&mut self, flags: &FlagOptions, force: bool) -> Result<()> {
        let user = self.identity().user_params.clone();
        let mut keep = Vec::new();
        if user.perturb_on_high_res {
            keep.extend(["hires_density", "hires_vx", "hires_vy", "hires_vz"]);
        } else {
            keep.extend(["lowres_density", "lowres_vx", "lowres_vy", "lowres_vz"]);
            if flags.use_halo_field {
                keep.push("hires_density");
            }
        }
        if user.use_relative_velocities {
            keep.push("lowres_vcb");
        }
        self.prepare(&keep, force)
    }

    /// Keep only what sampling halos needs.
    pub fn prepare_for_halos(&mut self, flags: &FlagOptions, force: bool) -> Result<()> {
        let mut keep = Vec::new();
        if flags.use_halo_field {
            keep.push("hires_density");
        }
        if self.identity().user_params.use_relative_velocities {
            keep.push("lowres_vcb");
        }
        self.prepare(&keep, force)
    }

    /// Keep only what the radiative stages need.
    pub fn prepare_for_spin_temp(
        &mut self,
        flags: &FlagOptions,
        globals: &GlobalParams,
        force: bool,
    ) -> Result<()> {
        let mut keep = Vec::new();
        if flags.use_halo_field && globals.avg_below_sampler {
            keep.push("lowres_density");
        }
        if self.identity().user_params.use_relative_velocities {
            keep.push("lowres_vcb");
        }
        self.prepare(&keep, force)
    }
}

/// Check every output against a parameter bundle.
pub fn check_output_compatibility(inputs: &InputParameters, outputs: &[&BoxData]) -> Result<()> {
    for output in outputs.iter().filter(|o| !o.is_placeholder()) {
        let reference = Identity::new(output.kind(), inputs, output.redshift());
        reference.check_compatible(output.identity(), &["redshift"])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn small_inputs() -> InputParameters {
        InputParameters {
            random_seed: Some(7),
            user_params: UserParams {
                hii_dim: 4,
                box_len: 8.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn computed_field(inputs: &InputParameters) -> PerturbedField {
        let mut pf = PerturbedField::uncomputed(inputs, Some(8.0));
        pf.allocate(&GlobalParams::default());
        pf.array_mut("density").unwrap().fill(1.5);
        pf.mark_computed();
        pf
    }

    #[test]
    fn test_identity_key_ignores_seed_and_astro_for_density() {
        let a = small_inputs();
        let b = a.evolve(|p| p.random_seed = Some(8)).unwrap();
        let c = a.evolve(|p| p.astro_params.hii_eff_factor = 40.0).unwrap();
        let ka = Identity::new(OutputKind::PerturbedField, &a, Some(8.0)).key();
        assert_eq!(ka, Identity::new(OutputKind::PerturbedField, &b, Some(8.0)).key());
        assert_eq!(ka, Identity::new(OutputKind::PerturbedField, &c, Some(8.0)).key());
        assert_ne!(
            Identity::new(OutputKind::IonizedBox, &a, Some(8.0)).key(),
            Identity::new(OutputKind::IonizedBox, &c, Some(8.0)).key()
        );
    }

    #[test]
    fn test_lineage_is_part_of_key() {
        let inputs = small_inputs();
        let a = Identity::new(OutputKind::IonizedBox, &inputs, Some(8.0))
            .with_lineage("prev_ionize_redshift", Some(8.18));
        let b = Identity::new(OutputKind::IonizedBox, &inputs, Some(8.0))
            .with_lineage("prev_ionize_redshift", Some(0.0));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_check_compatible_names_field() {
        let a = Identity::new(OutputKind::IonizedBox, &small_inputs(), Some(8.0));
        let other = small_inputs()
            .evolve(|p| p.user_params.box_len = 12.0)
            .unwrap();
        let b = Identity::new(OutputKind::PerturbedField, &other, Some(9.0));
        let err = a.check_compatible(&b, &["redshift"]).unwrap_err();
        assert!(err.to_string().contains("UserParams.BOX_LEN"), "{err}");

        let c = Identity::new(OutputKind::PerturbedField, &small_inputs(), Some(9.0));
        a.check_compatible(&c, &["redshift"]).unwrap();
        assert!(a.check_compatible(&c, &[]).is_err());
    }

    #[test]
    fn test_purge_requires_write_or_force() {
        let inputs = small_inputs();
        let mut pf = computed_field(&inputs);
        assert!(matches!(pf.purge(&[], false), Err(Error::UnsafePurge(_))));
        pf.purge(&[], true).unwrap();
        assert_eq!(pf.state(), BoxState::Purged);
        assert!(pf.array("density").is_none());
    }

    #[test]
    fn test_purge_uncomputed_is_advisory() {
        let mut pf = PerturbedField::uncomputed(&small_inputs(), Some(8.0));
        let err = pf.purge(&[], false).unwrap_err();
        assert!(err.is_advisory());
        pf.purge(&[], true).unwrap();
    }

    #[test]
    fn test_purge_then_load_all_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = small_inputs();
        let mut pf = computed_field(&inputs);
        pf.array_mut("velocity_z").unwrap()[IxDyn(&[1, 2, 3])] = -0.25;
        let before = pf.arrays().clone();

        pf.write(dir.path(), false).unwrap();
        pf.purge(&["velocity_x"], false).unwrap();
        assert!(pf.array("density").is_none());
        assert!(pf.array("velocity_x").is_some());

        let loaded = pf.loaded().unwrap();
        assert_eq!(loaded.arrays(), &before);
        drop(loaded);

        pf.load_all().unwrap();
        assert_eq!(pf.arrays(), &before);
        assert!(pf.is_computed());
    }

    #[test]
    fn test_read_adopts_seed() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = small_inputs();
        let mut pf = computed_field(&inputs);
        pf.write(dir.path(), false).unwrap();

        let anon = inputs.evolve(|p| p.random_seed = None).unwrap();
        let mut other = PerturbedField::uncomputed(&anon, Some(8.0));
        assert!(other.exists(dir.path()));
        other.read(dir.path()).unwrap();
        assert_eq!(other.random_seed(), Some(7));
        assert_eq!(other.array("density"), pf.array("density"));

        let mut missing = PerturbedField::uncomputed(&inputs, Some(9.0));
        assert!(missing.read(dir.path()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_initial_is_zero_filled() {
        let inputs = small_inputs();
        let ib = IonizedBox::initial(&inputs, Some(0.0), &GlobalParams::default());
        assert!(ib.is_computed());
        assert_eq!(ib.placeholder(), Some(Placeholder::Initial));
        assert!(ib.require("xH_box").unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_prepare_for_perturb_keeps_lowres() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = small_inputs();
        let mut ic = InitialConditions::uncomputed(&inputs, None);
        ic.allocate(&GlobalParams::default());
        ic.mark_computed();
        ic.write(dir.path(), false).unwrap();

        ic.prepare_for_perturb(&inputs.flag_options, false).unwrap();
        assert!(ic.array("lowres_density").is_some());
        assert!(ic.array("hires_density").is_none());

        ic.prepare_for_spin_temp(&inputs.flag_options, &GlobalParams::default(), false)
            .unwrap();
        assert!(ic.arrays().is_empty());
    }

    #[test]
    fn test_check_output_compatibility() {
        let inputs = small_inputs();
        let pf = computed_field(&inputs);
        check_output_compatibility(&inputs, &[&pf]).unwrap();
        let other = inputs.evolve(|p| p.cosmo_params.hlittle = 0.7).unwrap();
        assert!(check_output_compatibility(&other, &[&pf]).is_err());
    }
}
