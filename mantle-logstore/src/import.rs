//! One-shot import of legacy single-file machine logs.
//!
//! Before the SQLite store existed, each machine's log lived in
//! `<machine-id>.log` next to a `<machine-id>.log.sha256sum` sidecar. On
//! first open those files are verified, imported and removed. A missing
//! sidecar marks the file stale: it is removed without import.
use crate::Result;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub(crate) fn import_legacy(conn: &Connection, dir: &Path, now: fn() -> i64) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Some(machine_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
        else {
            continue;
        };
        let sidecar = path.with_extension("log.sha256sum");
        if !sidecar.exists() {
            warn!(path = %path.display(), "legacy log has no checksum sidecar, removing stale file");
            fs::remove_file(&path)?;
            continue;
        }
        let contents = fs::read(&path)?;
        let expected = fs::read_to_string(&sidecar)?
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let actual = hex(&Sha256::digest(&contents));
        if actual != expected {
            warn!(path = %path.display(), "legacy log checksum mismatch, removing stale file");
            fs::remove_file(&path)?;
            fs::remove_file(&sidecar)?;
            continue;
        }
        let created_at = now();
        let mut imported = 0u64;
        for line in contents.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            conn.execute(
                "INSERT INTO machine_logs (machine_id, message, created_at) VALUES (?1, ?2, ?3)",
                params![machine_id, line, created_at],
            )?;
            imported += 1;
        }
        info!(machine = %machine_id, imported, "imported legacy log file");
        fs::remove_file(&path)?;
        fs::remove_file(&sidecar)?;
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
