//! Local persistence: the pre-publish snapshot and the subscriber's
//! JSON-lines archive.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::record::BreadcrumbRecord;

/// Writes the whole batch to `path` as an indented JSON array, replacing any
/// previous snapshot.
pub fn write_snapshot(path: &Path, records: &[BreadcrumbRecord]) -> Result<()> {
    ensure_parent(path)?;

    let file = File::create(path)
        .with_context(|| format!("Failed to create snapshot {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)
        .with_context(|| format!("Failed to serialize snapshot {}", path.display()))?;
    writer.flush()?;

    info!(path = %path.display(), records = records.len(), "Snapshot saved");
    Ok(())
}

/// Loads a snapshot written by [`write_snapshot`].
pub fn read_snapshot(path: &Path) -> Result<Vec<BreadcrumbRecord>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open snapshot {}", path.display()))?;
    let records: Vec<BreadcrumbRecord> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Snapshot {} is not a JSON array of records", path.display()))?;

    debug!(path = %path.display(), records = records.len(), "Snapshot loaded");
    Ok(records)
}

/// `<dir>/<prefix>_<YYYY-MM-DD>.json`
pub fn dated_output_path(dir: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}_{}.json", prefix, date.format("%Y-%m-%d")))
}

/// Appends `value` as a single JSON line, creating the file if needed.
pub fn append_json_line(path: &Path, value: &impl Serialize) -> Result<()> {
    ensure_parent(path)?;

    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for append", path.display()))?;
    file.write_all(&line)
        .with_context(|| format!("Failed to append to {}", path.display()))?;

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}
