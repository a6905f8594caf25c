//! OpenSSH moduli file loading.
//!
//! The daemon does not pick DH groups itself; the SSH library owns the
//! group-exchange internals. Loading a moduli file only decides whether
//! the DH group-exchange KEX algorithms may be offered at all.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// A moduli line is `time type tests trials size generator modulus`.
const MODULI_FIELDS: usize = 7;

/// Parse moduli file contents and return the number of usable entries.
pub fn count_valid_entries(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| is_valid_entry(line))
        .count()
}

fn is_valid_entry(line: &str) -> bool {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != MODULI_FIELDS {
        return false;
    }
    // timestamp, type, tests, trials, size, generator are decimal
    if fields[..6].iter().any(|f| f.parse::<u64>().is_err()) {
        return false;
    }
    let modulus = fields[6];
    !modulus.is_empty() && modulus.chars().all(|c| c.is_ascii_hexdigit())
}

/// Load the configured moduli files and report whether at least one of
/// them contains a usable entry. Invalid files are skipped with a
/// warning, they are never fatal.
pub fn load_moduli(config_dir: &Path, paths: &[String]) -> bool {
    let mut seen: Vec<PathBuf> = Vec::new();
    let mut any_valid = false;
    for raw in paths {
        let raw = raw.trim();
        if raw.is_empty() {
            warn!("ignoring empty moduli file path");
            continue;
        }
        let path = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            config_dir.join(raw)
        };
        if seen.contains(&path) {
            continue;
        }
        seen.push(path.clone());
        info!(path = %path.display(), "loading moduli file");
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let entries = count_valid_entries(&content);
                if entries == 0 {
                    warn!(path = %path.display(), "ignoring moduli file with no usable entries");
                } else {
                    info!(path = %path.display(), entries, "moduli file loaded");
                    any_valid = true;
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable moduli file");
            }
        }
    }
    any_valid
}
