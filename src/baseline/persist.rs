//! Baseline persistence.
//!
//! Frozen baselines serialize to a JSON snapshot keyed by hex
//! arbitration ID, with a version-stamped `meta` block. Loading
//! rejects snapshots from other format versions.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::baseline::{Baseline, IdBaseline};
use crate::config::parse_hex_id;
use crate::error::{IdsError, Result};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: &str = "4.0";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    version: String,
    created: String,
    id_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    meta: SnapshotMeta,
    ids: HashMap<String, IdBaseline>,
}

/// Write a frozen baseline to `path` as pretty-printed JSON.
pub fn save<P: AsRef<Path>>(baseline: &Baseline, path: P) -> Result<()> {
    let snapshot = Snapshot {
        meta: SnapshotMeta {
            version: SNAPSHOT_VERSION.to_string(),
            created: chrono::Utc::now().to_rfc3339(),
            id_count: baseline.len(),
        },
        ids: baseline
            .iter()
            .map(|(id, profile)| (format!("{id:#x}"), profile.clone()))
            .collect(),
    };
    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path.as_ref(), json)?;
    info!(
        path = %path.as_ref().display(),
        ids = baseline.len(),
        "baseline saved"
    );
    Ok(())
}

/// Load a baseline snapshot from `path`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Baseline> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        IdsError::BaselineNotFound(format!("{}: {e}", path.as_ref().display()))
    })?;
    let snapshot: Snapshot = serde_json::from_str(&content)?;
    if snapshot.meta.version != SNAPSHOT_VERSION {
        return Err(IdsError::Config(format!(
            "unsupported baseline version {:?}, expected {SNAPSHOT_VERSION:?}",
            snapshot.meta.version
        )));
    }

    let mut baseline = Baseline::default();
    for (key, profile) in snapshot.ids {
        baseline.insert(parse_hex_id(&key)?, profile);
    }
    info!(
        path = %path.as_ref().display(),
        ids = baseline.len(),
        "baseline loaded"
    );
    Ok(baseline)
}
