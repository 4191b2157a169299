//! MD5 digest verification over RDMA READ destination buffers (spec §4.3, §6).
//!
//! Integrity only, not authentication: constant-time comparison is not
//! required (spec §6, "Digest").

use md5::{Digest, Md5};

/// A 16-byte MD5 digest, as carried in the signal.
pub type DigestBytes = [u8; 16];

/// Computes the MD5 digest of `buf` and compares it against `expected`.
pub fn verify(buf: &[u8], expected: &DigestBytes) -> bool {
    compute(buf) == *expected
}

/// Computes the MD5 digest of `buf`.
pub fn compute(buf: &[u8]) -> DigestBytes {
    let mut hasher = Md5::new();
    hasher.update(buf);
    hasher.finalize().into()
}
