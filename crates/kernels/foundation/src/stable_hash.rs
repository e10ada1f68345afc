//! Stable hashing for content-addressed cache keys.
//!
//! A cache record's filename is derived from a hash of the record's identity.
//! That hash must be identical across processes, platforms and compiler
//! versions, which rules out `std::hash`. These helpers implement FNV-1a 64-bit.
//!
//! NOTE: FNV-1a is **not** cryptographically secure. A key collision is caught
//! by the full identity comparison performed when a record is read back.

/// 64-bit FNV-1a offset basis.
pub const FNV1A_OFFSET_BASIS_64: u64 = 0xcbf29ce484222325;
/// 64-bit FNV-1a prime.
pub const FNV1A_PRIME_64: u64 = 0x0000_0100_0000_01B3;

/// Mix bytes into an existing FNV-1a 64-bit hash state.
///
/// # Example
/// ```
/// use reionize_foundation::stable_hash::{fnv1a64_mix, FNV1A_OFFSET_BASIS_64};
///
/// let hash = fnv1a64_mix(FNV1A_OFFSET_BASIS_64, b"InitialConditions");
/// let hash = fnv1a64_mix(hash, b"{\"box_len\":300.0}");
/// assert_ne!(hash, FNV1A_OFFSET_BASIS_64);
/// ```
#[inline]
pub const fn fnv1a64_mix(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0usize;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV1A_PRIME_64);
        i += 1;
    }
    hash
}

/// Hash an arbitrary byte slice with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a64_mix(FNV1A_OFFSET_BASIS_64, bytes)
}

/// Hash a UTF-8 string with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64_str(s: &str) -> u64 {
    fnv1a64(s.as_bytes())
}

/// Incremental hasher for composite keys.
///
/// Every `write_*` call is length- or tag-delimited so that `("ab", "c")` and
/// `("a", "bc")` hash differently. Floats are hashed by bit pattern, with
/// `-0.0` folded into `0.0`, so a parameter struct hashes the same however
/// its zero fields were written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHasher {
    state: u64,
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyHasher {
    pub const fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS_64,
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.state = fnv1a64_mix(self.state, &(bytes.len() as u64).to_le_bytes());
        self.state = fnv1a64_mix(self.state, bytes);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.state = fnv1a64_mix(self.state, &v.to_le_bytes());
        self
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        let v = if v == 0.0 { 0.0 } else { v };
        self.write_u64(v.to_bits())
    }

    pub const fn finish(&self) -> u64 {
        self.state
    }
}
