//! Report Sink: writes the `ImageUsage` snapshot and the
//! `HealthReport` to a run directory as JSON and CSV.
//!
//! Grounded in `k8s-inventory.py`/`registry-checker.py`'s
//! `REPORTDIR`/timestamped-directory convention and in
//! `headwind::config::HeadwindConfig::save`'s "build then write" shape
//! for the JSON side; the CSV flattening has no direct teacher
//! counterpart and is implemented straight from spec §4.6's "all rows
//! share a single header row" constraint via `Finding::csv_row`.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::evict::EvictionLogEntry;
use crate::model::{Finding, HealthReport, ImageUsage};

/// Resolve the output directory for a run: `$REPORTDIR` if set,
/// otherwise a freshly minted `check-report-YYYY-MM-DD-HH:MM:SS`
/// directory under the current working directory.
pub fn resolve_output_dir() -> PathBuf {
    match std::env::var("REPORTDIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(format!(
            "check-report-{}",
            Utc::now().format("%Y-%m-%d-%H:%M:%S")
        )),
    }
}

/// Write `bytes` to `dir/name` atomically: write to a sibling `.tmp`
/// file, then rename into place, so a reader never observes a partial
/// file.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(name);
    let tmp_path = dir.join(format!("{name}.tmp"));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Write the `ImageUsage` snapshot as `images.json`: 2-space indent,
/// keys sorted (the `BTreeMap` backing `ImageUsage` already sorts the
/// top level; occurrence keys within a record sort the same way via
/// `#[serde(flatten)]` over a `BTreeMap`).
pub fn write_image_usage(usage: &ImageUsage, dir: &Path) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(usage)?;
    write_atomic(dir, "images.json", &json)
}

/// Write `registry-check.json` and `registry-check.csv` from the same
/// `HealthReport`.
pub fn write_health_report(report: &HealthReport, dir: &Path) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(report)?;
    write_atomic(dir, "registry-check.json", &json)?;

    let csv_bytes = render_csv(report)?;
    write_atomic(dir, "registry-check.csv", &csv_bytes)
}

/// Flatten every finding into the fixed column set from
/// `Finding::csv_row`, sharing one header row across both finding
/// kinds.
fn render_csv(report: &HealthReport) -> io::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    if let Some(first) = report.first() {
        let header: Vec<&'static str> = first.csv_row().iter().map(|(k, _)| *k).collect();
        writer.write_record(&header)?;
    } else {
        // No findings at all: still emit the canonical header so a
        // downstream CSV reader never sees a headerless file.
        writer.write_record(EMPTY_REPORT_HEADER)?;
    }

    for finding in report {
        let row: Vec<String> = finding.csv_row().into_iter().map(|(_, v)| v).collect();
        writer.write_record(&row)?;
    }

    writer
        .into_inner()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

const EMPTY_REPORT_HEADER: [&str; 7] = [
    "ref", "problems", "namespaces", "phases", "name", "problem", "in_use",
];

/// Write `eviction-log.json` and `eviction-log.csv` for one evictor run
///.
pub fn write_eviction_log(log: &[EvictionLogEntry], dir: &Path) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(log)?;
    write_atomic(dir, "eviction-log.json", &json)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["repo", "tag", "digest", "action", "dry_run"])?;
    for entry in log {
        let row: Vec<String> = entry.csv_row().into_iter().map(|(_, v)| v).collect();
        writer.write_record(&row)?;
    }
    let csv_bytes = writer
        .into_inner()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    write_atomic(dir, "eviction-log.csv", &csv_bytes)
}
