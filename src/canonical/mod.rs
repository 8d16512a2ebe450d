//! Canonical forms and SHA-1 hashes
//!
//! Equivalence-based batching needs a stable key for inputs that are written
//! differently but mean the same thing. This module provides three layers:
//!
//! ```text
//!   predicate text ──> predicate::hash_predicate ─┐
//!   list text      ──> list::hash_list          ──┼──> fingerprint::Fingerprinter ──> Fingerprint
//!   ids, windows   ───────────────────────────────┘
//! ```
//!
//! All functions are pure.

pub mod fingerprint;
mod lexer;
pub mod list;
pub mod predicate;

use sha1::{Digest, Sha1};

pub use fingerprint::{Fingerprint, FingerprintParts, Fingerprinter, DEFAULT_SEPARATOR};
pub use list::{canonical_list, hash_list, hash_list_with};
pub use predicate::{canonical_predicate, hash_predicate};

/// Lowercase hex SHA-1 of UTF-8 text
pub fn sha1_hex(text: &str) -> String {
    hex::encode(Sha1::digest(text.as_bytes()))
}
