//! Parameter errors.

use thiserror::Error;

/// Result alias for parameter construction and validation.
pub type Result<T> = std::result::Result<T, ParamError>;

/// Errors raised while building or validating parameters.
///
/// Every variant is raised at the boundary, before any computation starts.
#[derive(Debug, Error)]
pub enum ParamError {
    /// A field value, or a combination of fields, is not allowed.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Two sources supplied different values for the same parameter.
    #[error("conflicting values for {field}: {message}")]
    Conflict { field: String, message: String },

    /// A required parameter was supplied by neither the caller nor a predecessor.
    #[error("missing required parameter: {0}")]
    Missing(String),

    /// No overridable global with this name exists.
    #[error("unknown global parameter: {0}")]
    UnknownGlobal(String),

    /// A parameter template could not be resolved or parsed.
    #[error("template {name}: {message}")]
    Template { name: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ParamError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn conflict(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            field: field.into(),
            message: message.into(),
        }
    }
}
