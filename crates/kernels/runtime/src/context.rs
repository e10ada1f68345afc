//! Per-call execution context for the stage resolvers.
//!
//! A [`StageContext`] bundles the engine, the (possibly scoped) globals, the
//! cache options and the post-compute hooks. Every stage takes one by `&mut`
//! and passes it down when it recurses, so there is no ambient state.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use reionize_params::{GlobalParams, InputParameters};
use tracing::{debug, info};

use crate::config::IoOptions;
use crate::engine::{ComputeRequest, Engine, STATUS_SUCCESS};
use crate::outputs::BoxData;
use crate::{Error, Result};

/// Closure run on every freshly computed box.
pub type HookFn = Arc<dyn Fn(&BoxData) -> anyhow::Result<()> + Send + Sync>;

/// Post-compute hook, run once after a successful compute.
#[derive(Clone)]
pub enum Hook {
    /// Write the box to a cache directory.
    Write { direc: PathBuf, overwrite: bool },
    Custom(HookFn),
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Write { direc, overwrite } => f
                .debug_struct("Write")
                .field("direc", direc)
                .field("overwrite", overwrite)
                .finish(),
            Hook::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Extra per-call arguments for [`StageContext::invoke`].
#[derive(Debug, Default)]
pub(crate) struct CallArgs {
    pub scalars: Vec<(&'static str, f64)>,
    pub halo_buffer: Option<usize>,
}

pub struct StageContext<'a> {
    engine: &'a mut dyn Engine,
    globals: &'a GlobalParams,
    io: IoOptions,
    hooks: Vec<Hook>,
}

impl<'a> StageContext<'a> {
    pub fn new(engine: &'a mut dyn Engine, globals: &'a GlobalParams, io: IoOptions) -> Self {
        Self {
            engine,
            globals,
            io,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn globals(&self) -> &'a GlobalParams {
        self.globals
    }

    pub fn io(&self) -> &IoOptions {
        &self.io
    }

    pub fn engine(&mut self) -> &mut dyn Engine {
        &mut *self.engine
    }

    /// Try to fill `out` from the cache.
    ///
    /// Returns `false` on a miss, or always when regenerating.
    pub fn try_read(&self, out: &mut BoxData) -> Result<bool> {
        if self.io.regenerate {
            return Ok(false);
        }
        match out.read(&self.io.direc) {
            Ok(()) => {
                info!(kind = %out.kind(), redshift = ?out.redshift(), "Existing box found in cache");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the photon-conservation calibration once, if the flags ask for it.
    pub fn ensure_photon_cons(&mut self, inputs: &InputParameters) -> Result<()> {
        if !inputs.photon_cons() || self.engine.photon_cons_data().is_some() {
            return Ok(());
        }
        info!(
            kind = inputs.flag_options.photon_cons_type.as_str(),
            "Calibrating photon non-conservation"
        );
        let status = self.engine.setup_photon_cons(inputs, self.globals);
        if status != STATUS_SUCCESS {
            return Err(Error::Engine {
                stage: "photon_cons",
                status,
                context: format!(
                    "PHOTON_CONS_TYPE={} over z in [{}, {}]",
                    inputs.flag_options.photon_cons_type.as_str(),
                    self.globals.photon_cons_end_calibz,
                    self.globals.z_heat_max
                ),
            });
        }
        Ok(())
    }

    /// Allocate `out` and hand it to the engine with every predecessor loaded.
    ///
    /// Does not mark `out` computed; callers that fill a box in several
    /// engine calls finish with [`complete`](Self::complete).
    pub(crate) fn invoke(
        &mut self,
        inputs: &InputParameters,
        out: &mut BoxData,
        predecessors: &[(&'static str, &BoxData)],
        args: CallArgs,
    ) -> Result<()> {
        let loaded: Vec<(&'static str, Cow<'_, BoxData>)> = predecessors
            .iter()
            .map(|(role, data)| Ok((*role, data.loaded()?)))
            .collect::<Result<_>>()?;

        let identity = out.identity().clone();
        let mut request = ComputeRequest::new(&identity, inputs, self.globals);
        for (role, data) in &loaded {
            request = request.with(role, data.as_ref());
        }
        for (name, value) in args.scalars {
            request = request.with_scalar(name, value);
        }
        request.halo_buffer = args.halo_buffer;

        out.allocate(self.globals);
        debug!(request = %request.summary(), "Calling engine");
        let status = self.engine.compute(&request, out);
        if status != STATUS_SUCCESS {
            return Err(Error::Engine {
                stage: identity.kind.stage(),
                status,
                context: request.summary(),
            });
        }
        Ok(())
    }

    /// Mark `out` computed and run the hooks.
    pub(crate) fn complete(&mut self, out: &mut BoxData) -> Result<()> {
        out.mark_computed();
        info!(kind = %out.kind(), redshift = ?out.redshift(), "Computed box");
        if self.io.write {
            out.write(&self.io.direc, self.io.regenerate)?;
        }
        for hook in &self.hooks {
            match hook {
                Hook::Write { direc, overwrite } => {
                    out.write(direc, *overwrite)?;
                }
                Hook::Custom(f) => f(out).map_err(|e| Error::Hook {
                    kind: out.kind(),
                    message: format!("{e:#}"),
                })?,
            }
        }
        Ok(())
    }

    /// One engine call followed by [`complete`](Self::complete).
    pub(crate) fn compute(
        &mut self,
        inputs: &InputParameters,
        out: &mut BoxData,
        predecessors: &[(&'static str, &BoxData)],
        args: CallArgs,
    ) -> Result<()> {
        self.invoke(inputs, out, predecessors, args)?;
        self.complete(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::analytic::AnalyticEngine;
    use crate::outputs::Identity;
    use crate::registry::OutputKind;

    #[test]
    fn test_engine_failure_names_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = GlobalParams::default();
        let mut ctx = StageContext::new(&mut engine, &globals, IoOptions::new(dir.path()));
        let inputs = InputParameters::with_seed(3);
        let mut out = BoxData::new(Identity::new(OutputKind::PerturbedField, &inputs, Some(9.0)));
        let err = ctx
            .compute(&inputs, &mut out, &[], CallArgs::default())
            .unwrap_err();
        match err {
            Error::Engine { stage, status, .. } => {
                assert_eq!(stage, "perturb_field");
                assert_ne!(status, STATUS_SUCCESS);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!out.is_computed());
    }

    #[test]
    fn test_hooks_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        let mut engine = AnalyticEngine::new();
        let globals = GlobalParams::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut ctx = StageContext::new(
            &mut engine,
            &globals,
            IoOptions::new(dir.path()).with_write(false),
        )
        .with_hook(Hook::Write {
            direc: extra.path().to_path_buf(),
            overwrite: false,
        })
        .with_hook(Hook::Custom(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let mut inputs = InputParameters::with_seed(3);
        inputs.user_params.hii_dim = 4;
        inputs.user_params.dim = Some(8);
        let mut out = BoxData::new(Identity::new(OutputKind::InitialConditions, &inputs, None));
        ctx.compute(&inputs, &mut out, &[], CallArgs::default()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(out.exists(extra.path()));
        assert!(!out.exists(dir.path()));
    }
}
