//! JSON export of the rows a collect stage kept.
//!
//! One file per search date, `filtered_results_<MM_DD_YYYY>.json`, written to a
//! temporary sibling first and renamed into place so readers never see a
//! partial file.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::cases::CaseRecord;

/// Snapshot write errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SnapshotError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Path of the snapshot for `label` under `dir`.
#[must_use]
pub fn snapshot_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("filtered_results_{label}.json"))
}

/// Writes `records` as a pretty JSON array, replacing any previous snapshot
/// with the same label. Creates `dir` when missing.
///
/// # Errors
///
/// Returns [`SnapshotError`] on I/O or serialization failure; the previous
/// snapshot, if any, is left intact.
#[instrument(skip(records), fields(rows = records.len(), dir = %dir.display()))]
pub fn write_snapshot(
    dir: &Path,
    label: &str,
    records: &[CaseRecord],
) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(dir).map_err(|e| SnapshotError::io(dir, e))?;

    let path = snapshot_path(dir, label);
    let tmp_path = path.with_extension("json.tmp");

    let written = write_json(&tmp_path, records);
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    fs::rename(&tmp_path, &path).map_err(|e| SnapshotError::io(&path, e))?;

    debug!(path = %path.display(), "snapshot written");
    Ok(path)
}

fn write_json(path: &Path, records: &[CaseRecord]) -> Result<(), SnapshotError> {
    let file = fs::File::create(path).map_err(|e| SnapshotError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush().map_err(|e| SnapshotError::io(path, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| SnapshotError::io(path, e))
}
