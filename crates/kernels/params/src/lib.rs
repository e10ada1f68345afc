//! Reionize Params
//!
//! The four parameter structs that define a simulation (cosmology, grid,
//! astrophysics and feature flags), the overridable global scalars, and the
//! [`InputParameters`] bundle with its cross-struct validation.

mod astro;
mod cosmo;
mod error;
mod flags;
mod globals;
mod inputs;
pub mod templates;
mod user;
pub mod value;

pub use astro::{AstroParams, R_BUBBLE_MAX_DEFAULT, R_BUBBLE_MAX_INHOMO};
pub use cosmo::{CosmoParams, C_KMS};
pub use error::{ParamError, Result};
pub use flags::{FlagOptions, PhotonConsType};
pub use globals::{GlobalParams, ScopedGlobals, GLOBAL_NAMES};
pub use inputs::{merge_required, merge_seed, merge_strict, InputParameters};
pub use user::{Hmf, UserParams};
pub use value::{ParamStruct, ParamValue};
