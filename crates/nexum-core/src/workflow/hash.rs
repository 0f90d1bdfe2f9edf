//! Version hashing of the canonical IR.
//!
//! A workflow version is identified by `"sha256:" + hex(SHA-256(ir_json))`.
//! Only the IR enters the digest, so editing a handler body never changes
//! the version while any structural edit always does.

use sha2::{Digest, Sha256};

/// Prefix carried by every version hash.
pub const VERSION_HASH_PREFIX: &str = "sha256:";

/// Compute the version hash of a canonical IR document.
pub fn version_hash(ir_json: &str) -> String {
    let digest = Sha256::digest(ir_json.as_bytes());
    format!("{VERSION_HASH_PREFIX}{digest:x}")
}
