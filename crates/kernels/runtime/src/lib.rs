//! Reionize Runtime.
//!
//! Orchestration core for semi-numerical 21-cm simulations. The numerical
//! kernels live behind the [`Engine`] trait; this crate decides what has to
//! be computed, in which order, with which parameters, and whether a cached
//! copy can be reused instead.
//!
//! # Architecture
//!
//! - [`outputs`] - Output boxes: identity, array lifecycle, purge and reload
//! - [`registry`] - Field names, shapes and which kind produces them
//! - [`cache`] - On-disk records keyed by output identity, and queries
//! - [`engine`] - The compute backend seam and its request type
//! - [`analytic`] - A closed-form engine used by the CLI and the tests
//! - [`context`] - Per-call state shared by the stage resolvers
//! - [`stages`] - One resolver per output kind
//! - [`schedule`] - Redshift scrolls for the drivers
//! - [`coeval`] - All outputs at a set of target redshifts
//! - [`lightconer`] / [`lightcone`] - Slicing coevals onto a past light cone
//! - [`checkpoint`] - Resumable lightcone files
//! - [`config`] - Cache directory and I/O defaults
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```ignore
//! use reionize_runtime::{run_coeval, AnalyticEngine, CoevalOptions, IoOptions};
//!
//! let mut engine = AnalyticEngine::new();
//! let mut globals = GlobalParams::default();
//! let coeval = run_coeval(
//!     &mut engine,
//!     &mut globals,
//!     IoOptions::new("cache"),
//!     CoevalOptions { redshifts: vec![8.0], ..Default::default() },
//! )?
//! .single();
//! ```

pub mod analytic;
pub mod cache;
pub mod checkpoint;
pub mod coeval;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod lightcone;
pub mod lightconer;
pub mod outputs;
pub mod registry;
pub mod schedule;
pub mod stages;

pub use analytic::AnalyticEngine;
pub use cache::{get_boxes_at_redshift, query_cache, readbox, CacheQuery};
pub use checkpoint::{read_lightcone, LightconeCheckpoint};
pub use coeval::{run_coeval, CacheFiles, Coeval, CoevalOptions, CoevalResult};
pub use config::{Config, IoOptions};
pub use context::{Hook, HookFn, StageContext};
pub use engine::{ComputeRequest, Engine, PhotonConsData};
pub use error::{Error, Result};
pub use lightcone::{
    run_lightcone, CallbackSchedule, CoevalCallback, Lightcone, LightconeOptions, LightconeRun,
    BRIGHTNESS_TEMP_WITH_RSDS,
};
pub use lightconer::{
    AngularLightconer, Geometry, LightconeSlab, Lightconer, RectilinearLightconer, LOS_VELOCITY,
};
pub use outputs::{
    check_output_compatibility, BoxData, BoxState, BrightnessTemp, HaloBox, HaloField, Identity,
    InitialConditions, IonizedBox, OutputStruct, PerturbHaloField, PerturbedField, Placeholder,
    TsBox, XraySourceBox,
};
pub use registry::{get_all_fieldnames, lightcone_field_kind, FieldShape, FieldSpec, OutputKind};
pub use schedule::{coeval_required_redshifts, heating_scroll, lightcone_node_redshifts, logscroll};
pub use stages::ParamArgs;
