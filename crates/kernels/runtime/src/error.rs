//! Runtime errors for stage resolution and the drivers.
//!
//! # Error Categories
//!
//! - **Validation**: [`Error::Validation`], [`Error::Incompatible`], [`Error::Redshift`]
//!   are raised at the boundary, before any computation starts.
//! - **Cache miss**: [`Error::NotFound`] is the recoverable signal every stage
//!   resolver catches to fall back to computing.
//! - **Engine**: [`Error::Engine`] carries the failing stage and its inputs and
//!   aborts the whole driver call.
//! - **Advisory**: [`Error::NothingToPurge`] and [`Error::UnsafePurge`] are
//!   swallowed by the drivers.
//! - **I/O**: [`Error::Io`], [`Error::Serialization`], [`Error::Compression`],
//!   [`Error::Checkpoint`].

use std::path::PathBuf;

use reionize_params::ParamError;
use thiserror::Error;

use crate::registry::OutputKind;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Parameters disagree, are missing, or form a disallowed combination.
    #[error(transparent)]
    Validation(#[from] ParamError),

    /// Two entities handed to one stage were built from different parameters.
    #[error("incompatible inputs: {field} differs ({this} vs {other})")]
    Incompatible {
        field: String,
        this: String,
        other: String,
    },

    /// A requested redshift is outside what the call can serve.
    #[error("invalid redshift: {0}")]
    Redshift(String),

    /// No cache record matches the identity. Not a failure for resolvers.
    #[error("no cached {kind} found in {}", path.display())]
    NotFound { kind: OutputKind, path: PathBuf },

    /// The compute engine returned a nonzero status.
    #[error("{stage} failed with status {status}: {context}")]
    Engine {
        stage: &'static str,
        status: i32,
        context: String,
    },

    /// `purge` on an entity that holds no computed arrays.
    #[error("{0} has nothing to purge")]
    NothingToPurge(OutputKind),

    /// `purge` on an entity that was never written and could not be refilled.
    #[error("refusing to purge {0}: it has not been written to the cache")]
    UnsafePurge(OutputKind),

    /// An entity was used before its arrays were computed or reloaded.
    #[error("{kind} is not computed: {message}")]
    NotComputed { kind: OutputKind, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A post-compute hook returned an error.
    #[error("post-compute hook failed for {kind}: {message}")]
    Hook { kind: OutputKind, message: String },

    /// The first invocation of a lightcone coeval callback failed.
    #[error("coeval callback failed at z={redshift}: {message}")]
    Callback { redshift: f64, message: String },

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True only for the cache-miss variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Purge errors the drivers log and continue past.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Error::NothingToPurge(_) | Error::UnsafePurge(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
