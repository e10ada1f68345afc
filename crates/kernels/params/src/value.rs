//! Flattened parameter values.
//!
//! Each parameter struct exposes its persisted fields as an ordered list of
//! `(name, ParamValue)` pairs. Equality, hashing, diffing and the on-disk
//! identity key are all computed from that list, so a field that is not listed
//! (a derived quantity) can never influence identity.

use reionize_foundation::KeyHasher;
use serde::Serialize;
use std::fmt;

/// A single persisted parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(&'static str),
    Null,
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub(crate) fn write_key(&self, h: &mut KeyHasher) {
        match self {
            ParamValue::Float(v) => {
                h.write_u64(1).write_f64(*v);
            }
            ParamValue::Int(v) => {
                h.write_u64(2).write_u64(*v as u64);
            }
            ParamValue::Bool(v) => {
                h.write_u64(3).write_u64(*v as u64);
            }
            ParamValue::Text(s) => {
                h.write_u64(4).write_str(s);
            }
            ParamValue::Null => {
                h.write_u64(5);
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(s) => write!(f, "{s}"),
            ParamValue::Null => write!(f, "None"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

/// Common behavior of the four parameter structs.
pub trait ParamStruct {
    /// Struct name used in error messages and identity keys.
    const NAME: &'static str;

    /// Persisted fields in declaration order. Derived fields are excluded.
    fn fields(&self) -> Vec<(&'static str, ParamValue)>;

    /// Look up one persisted field by (case-insensitive) name.
    fn get(&self, name: &str) -> Option<ParamValue> {
        self.fields()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Name and both values of the first field that differs, if any.
    fn diff(&self, other: &Self) -> Option<(&'static str, ParamValue, ParamValue)> {
        self.fields()
            .into_iter()
            .zip(other.fields())
            .find(|((_, a), (_, b))| a != b)
            .map(|((name, a), (_, b))| (name, a, b))
    }

    /// Stable 64-bit hash over the persisted fields.
    fn stable_hash(&self) -> u64 {
        let mut h = KeyHasher::new();
        h.write_str(Self::NAME);
        for (name, value) in self.fields() {
            h.write_str(name);
            value.write_key(&mut h);
        }
        h.finish()
    }

    /// Compact `Name(A=1, B=2)` rendering.
    fn describe(&self) -> String {
        let body: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect();
        format!("{}({})", Self::NAME, body.join(", "))
    }
}

/// Implements `PartialEq`, `Eq` and `Hash` through [`ParamStruct::fields`].
///
/// Floats compare by value; NaN never reaches here because every struct
/// rejects non-finite fields on validation.
macro_rules! impl_param_identity {
    ($ty:ty) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                $crate::value::ParamStruct::diff(self, other).is_none()
            }
        }

        impl Eq for $ty {}

        impl std::hash::Hash for $ty {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                state.write_u64($crate::value::ParamStruct::stable_hash(self));
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&$crate::value::ParamStruct::describe(self))
            }
        }
    };
}

pub(crate) use impl_param_identity;

/// Reject non-finite float fields.
pub(crate) fn check_finite<P: ParamStruct>(p: &P) -> crate::Result<()> {
    for (name, value) in p.fields() {
        if let ParamValue::Float(v) = value {
            if !v.is_finite() {
                return Err(crate::ParamError::validation(
                    format!("{}.{}", P::NAME, name),
                    format!("must be finite, got {v}"),
                ));
            }
        }
    }
    Ok(())
}
