//! Reionize Foundation
//!
//! Small, dependency-free primitives shared by every crate in the workspace:
//! stable hashing for content-addressed cache keys and deterministic,
//! seed-derived random streams.

pub mod rng;
pub mod stable_hash;

pub use rng::RngStream;
pub use stable_hash::{
    fnv1a64, fnv1a64_mix, fnv1a64_str, KeyHasher, FNV1A_OFFSET_BASIS_64,
    FNV1A_PRIME_64,
};

/// A redshift value.
pub type Redshift = f64;

/// Absolute tolerance used when two redshifts are compared for identity.
pub const REDSHIFT_ATOL: f64 = 1e-5;

/// Whether two redshifts are equal within [`REDSHIFT_ATOL`].
#[inline]
pub fn redshifts_match(a: Redshift, b: Redshift) -> bool {
    (a - b).abs() <= REDSHIFT_ATOL
}
