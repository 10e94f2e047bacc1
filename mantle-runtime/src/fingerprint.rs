//! Input-cut fingerprints.
//!
//! An output is stamped with a SHA-256 over the `kind/id@version` of every
//! input that fed its transform. Key order does not matter: entries are
//! sorted before hashing, so two identical cuts always hash identically and
//! an unchanged cut never bumps the output version.
use sha2::{Digest, Sha256};

/// Hashes a set of (kind, id, version) input coordinates.
#[must_use]
pub fn fingerprint<I>(parts: I) -> String
where
    I: IntoIterator<Item = (String, String, u64)>,
{
    let mut entries: Vec<String> = parts
        .into_iter()
        .map(|(kind, id, version)| format!("{kind}/{id}@{version}"))
        .collect();
    entries.sort_unstable();
    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}
