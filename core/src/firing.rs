// -----------------------------------------------------------------------------
// Rust kiln control daemon
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// Module authors:
//   Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! The immutable post-mortem record of one firing.

use std::fs;
use std::path::PathBuf;
use derive_new::new;
use lazy_static::lazy_static;
use log::*;
use regex::Regex;
use serde_json::{json, Value};

use crate::clock;
use crate::errors::{Error, Result};
use crate::persist::atomic_write;
use crate::units::TempUnit;


/// Upper bound on the persisted temperature/target series.
pub const MAX_SERIES_POINTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    Completed,
    Aborted,
    Emergency,
}

impl EndStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndStatus::Completed => "completed",
            EndStatus::Aborted => "aborted",
            EndStatus::Emergency => "emergency",
        }
    }
}

/// Accumulates the time series of a run in memory; materialized into a
/// file once the run terminates, and never touched afterwards.
#[derive(Debug, Clone)]
pub struct FiringRecord {
    pub profile_name: String,
    pub unit: TempUnit,
    pub started_at: f64,
    samples: Vec<(f64, f64, f64)>,
    divergence_sum: f64,
    divergence_count: u64,
}

impl FiringRecord {
    pub fn new(profile_name: String, unit: TempUnit, started_at: f64) -> FiringRecord {
        FiringRecord {
            profile_name, unit, started_at,
            samples: Vec::new(),
            divergence_sum: 0.,
            divergence_count: 0,
        }
    }

    pub fn push(&mut self, runtime: f64, temperature: f64, target: f64) {
        self.samples.push((runtime, temperature, target));
        self.divergence_sum += (target - temperature).abs();
        self.divergence_count += 1;
    }

    pub fn mean_divergence(&self) -> f64 {
        if self.divergence_count == 0 {
            0.
        } else {
            self.divergence_sum / self.divergence_count as f64
        }
    }

    pub fn last_temperature(&self) -> Option<f64> {
        self.samples.last().map(|&(_, temp, _)| temp)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// The series decimated uniformly down to at most `max` triples.
    pub fn decimated(&self, max: usize) -> Vec<Value> {
        let step = (self.samples.len() + max - 1) / max.max(1);
        self.samples.iter()
            .step_by(step.max(1))
            .map(|&(t, temp, target)| json!([t, temp, target]))
            .collect()
    }
}

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex");
}

/// Profile names go into file names; anything resembling a path stays
/// out.
fn sanitize_name(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name, "_");
    let cleaned = cleaned.trim_matches(|c| c == '_' || c == '.');
    if cleaned.is_empty() { "profile".into() } else { cleaned.into() }
}

/// Writer for the append-only firing log directory.
#[derive(new)]
pub struct FiringLog {
    dir: PathBuf,
}

impl FiringLog {
    /// Write the record with its end status, and point the "latest"
    /// marker at it.
    pub fn finish(&self, record: &FiringRecord, status: EndStatus, end_wallclock: f64,
                  final_cost: f64) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::persistence(e.to_string()))?;
        let doc = json!({
            "profile_name": record.profile_name,
            "start_wallclock": clock::to_rfc3339(record.started_at),
            "end_wallclock": clock::to_rfc3339(end_wallclock),
            "duration_seconds": end_wallclock - record.started_at,
            "final_cost": final_cost,
            "final_temperature": record.last_temperature(),
            "mean_divergence": record.mean_divergence(),
            "end_status": status.as_str(),
            "temp_units": record.unit.as_str(),
            "series": record.decimated(MAX_SERIES_POINTS),
        });
        let filename = format!("{}_{}.json", clock::file_stamp(record.started_at),
                               sanitize_name(&record.profile_name));
        let path = self.dir.join(&filename);
        let data = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::persistence(e.to_string()))?;
        fs::write(&path, data).map_err(|e| Error::persistence(e.to_string()))?;
        // the pointer is best effort; the log itself is already on disk
        if let Err(e) = atomic_write(&self.dir.join("latest"), filename.as_bytes()) {
            error!("could not update latest-log pointer: {}", e);
        }
        info!("firing log written to {:?}", path);
        Ok(path)
    }

    /// The most recently finished log, per the pointer file.
    pub fn latest(&self) -> Option<PathBuf> {
        let name = fs::read_to_string(self.dir.join("latest")).ok()?;
        let path = self.dir.join(name.trim());
        if path.is_file() { Some(path) } else { None }
    }
}


#[cfg(test)]
mod tests {
    use serde_json::Value;
    use super::*;

    fn record(samples: usize) -> FiringRecord {
        let mut rec = FiringRecord::new("cone 6 / glaze".into(), TempUnit::Fahrenheit,
                                        1722513600.);
        for i in 0..samples {
            rec.push(i as f64 * 2., 70. + i as f64, 75. + i as f64);
        }
        rec
    }

    #[test]
    fn series_is_decimated() {
        let rec = record(4321);
        let series = rec.decimated(MAX_SERIES_POINTS);
        assert!(series.len() <= MAX_SERIES_POINTS);
        assert!(series.len() > MAX_SERIES_POINTS / 2);
        // short runs stay untouched
        assert_eq!(record(17).decimated(MAX_SERIES_POINTS).len(), 17);
    }

    #[test]
    fn mean_divergence() {
        let rec = record(10);
        assert!((rec.mean_divergence() - 5.).abs() < 1e-9);
        assert_eq!(FiringRecord::new("x".into(), TempUnit::Celsius, 0.).mean_divergence(), 0.);
    }

    #[test]
    fn finish_writes_log_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let log = FiringLog::new(dir.path().to_path_buf());
        let path = log.finish(&record(100), EndStatus::Completed, 1722513600. + 200., 0.5)
            .unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        // dated, sanitized file name: no spaces or slashes survive
        assert_eq!(name, "2024-08-01_12-00-00_cone_6_glaze.json");

        let doc: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["end_status"], "completed");
        assert_eq!(doc["profile_name"], "cone 6 / glaze");
        assert_eq!(doc["duration_seconds"], 200.);
        assert_eq!(doc["final_temperature"], 169.);
        assert_eq!(doc["series"].as_array().unwrap().len(), 100);

        assert_eq!(log.latest().unwrap(), path);
    }

    #[test]
    fn hostile_profile_names_are_defused() {
        assert_eq!(sanitize_name("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_name("///"), "profile");
        assert_eq!(sanitize_name("bisque"), "bisque");
    }
}
