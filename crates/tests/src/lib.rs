//! Integration test harness for the orchestration core.
//!
//! Every harness owns a fresh temporary cache directory, small-grid
//! parameters, and an engine spy counting compute calls per output kind, so
//! tests can tell a cache hit from a recomputation.

use std::path::Path;
use std::sync::Once;

use indexmap::IndexMap;
use reionize_params::{AstroParams, FlagOptions, GlobalParams, InputParameters};
use reionize_runtime::{
    run_coeval, run_lightcone, AnalyticEngine, BoxData, CoevalOptions, CoevalResult,
    ComputeRequest, Engine, IoOptions, LightconeOptions, LightconeRun, Lightconer, OutputKind,
    ParamArgs, PhotonConsData, StageContext,
};
use tempfile::TempDir;
use tracing::info_span;
use tracing_subscriber::EnvFilter;

/// Seed used by every harness unless told otherwise.
pub const TEST_SEED: u64 = 12345;

static LOGGING: Once = Once::new();

/// Route runtime logs through the test writer, filtered by `RUST_LOG`.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Engine wrapper counting compute calls by output kind.
#[derive(Debug, Default)]
pub struct CountingEngine<E> {
    inner: E,
    calls: IndexMap<OutputKind, usize>,
    photon_cons_setups: usize,
}

impl<E: Engine> CountingEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: IndexMap::new(),
            photon_cons_setups: 0,
        }
    }

    pub fn calls(&self, kind: OutputKind) -> usize {
        self.calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.values().sum()
    }

    pub fn photon_cons_setups(&self) -> usize {
        self.photon_cons_setups
    }

    pub fn reset(&mut self) {
        self.calls.clear();
        self.photon_cons_setups = 0;
    }
}

impl<E: Engine> Engine for CountingEngine<E> {
    fn compute(&mut self, request: &ComputeRequest<'_>, out: &mut BoxData) -> i32 {
        *self.calls.entry(request.kind()).or_default() += 1;
        self.inner.compute(request, out)
    }

    fn expected_n_halos(
        &self,
        redshift: f64,
        inputs: &InputParameters,
        globals: &GlobalParams,
    ) -> f64 {
        self.inner.expected_n_halos(redshift, inputs, globals)
    }

    fn setup_photon_cons(&mut self, inputs: &InputParameters, globals: &GlobalParams) -> i32 {
        self.photon_cons_setups += 1;
        self.inner.setup_photon_cons(inputs, globals)
    }

    fn photon_cons_data(&self) -> Option<PhotonConsData> {
        self.inner.photon_cons_data()
    }

    fn free_photon_cons_memory(&mut self) {
        self.inner.free_photon_cons_memory()
    }

    fn free_scratch(&mut self) {
        self.inner.free_scratch()
    }
}

/// Small, fast parameters: a 6^3 low-res box inside a 12^3 high-res one.
pub fn small_inputs(seed: u64) -> InputParameters {
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

/// Test harness: temp cache, globals, counting engine and parameters.
pub struct TestHarness {
    dir: TempDir,
    pub globals: GlobalParams,
    pub engine: CountingEngine<AnalyticEngine>,
    pub inputs: InputParameters,
}

impl TestHarness {
    /// Fresh cache directory and [`small_inputs`] with [`TEST_SEED`].
    ///
    /// # Panics
    ///
    /// Panics if the temp directory cannot be created.
    pub fn new() -> Self {
        Self::with_inputs(small_inputs(TEST_SEED))
    }

    pub fn with_inputs(inputs: InputParameters) -> Self {
        init_test_logging();
        let dir = tempfile::tempdir().expect("failed to create temp cache dir");
        Self {
            dir,
            globals: GlobalParams::default(),
            engine: CountingEngine::new(AnalyticEngine::new()),
            inputs,
        }
    }

    /// Replace the flags, keeping everything else.
    pub fn with_flags(mut self, flags: FlagOptions) -> Self {
        self.inputs.flag_options = flags;
        self
    }

    pub fn direc(&self) -> &Path {
        self.dir.path()
    }

    pub fn io(&self) -> IoOptions {
        IoOptions::new(self.dir.path())
    }

    pub fn params(&self) -> ParamArgs {
        ParamArgs::from(&self.inputs)
    }

    /// A stage context over the harness engine, globals and cache.
    pub fn ctx(&mut self) -> StageContext<'_> {
        let io = IoOptions::new(self.dir.path());
        StageContext::new(&mut self.engine, &self.globals, io)
    }

    /// Same as [`Self::ctx`] with explicit I/O options.
    pub fn ctx_with(&mut self, io: IoOptions) -> StageContext<'_> {
        StageContext::new(&mut self.engine, &self.globals, io)
    }

    /// Run the coeval driver with the harness parameters.
    pub fn coeval(
        &mut self,
        redshifts: &[f64],
        options: CoevalOptions,
    ) -> reionize_runtime::Result<CoevalResult> {
        let _span = info_span!("coeval", ?redshifts).entered();
        let io = self.io();
        let options = CoevalOptions {
            redshifts: redshifts.to_vec(),
            params: self.params(),
            ..options
        };
        run_coeval(&mut self.engine, &mut self.globals, io, options)
    }

    /// Run the lightcone driver with the harness parameters.
    pub fn lightcone<R>(
        &mut self,
        lightconer: &dyn Lightconer,
        options: LightconeOptions<'_, R>,
    ) -> reionize_runtime::Result<LightconeRun<R>> {
        let n_slices = lightconer.lc_redshifts().len();
        let _span = info_span!("lightcone", n_slices).entered();
        let io = self.io();
        let options = LightconeOptions {
            params: self.params(),
            ..options
        };
        run_lightcone(&mut self.engine, &mut self.globals, io, lightconer, options)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
