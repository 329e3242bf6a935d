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
//! Atomic persistence of the state needed to resume a firing after an
//! unclean shutdown.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use log::*;
use serde_json::{json, Map, Value};

use crate::clock;
use crate::errors::{Error, ErrorKind, Result};
use crate::oven::Lifecycle;
use crate::segment::Phase;


/// The snapshot written on every control tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeSnapshot {
    pub profile_name: String,
    pub lifecycle: Lifecycle,
    pub segment_index: usize,
    pub segment_phase: Phase,
    pub segment_start_temp: f64,
    pub hold_elapsed_seconds: f64,
    pub accumulated_cost: f64,
    pub wallclock: f64,
}

/// A snapshot written by an older, time-based controller version.  It
/// carries too little to restore a tracker directly; the run loop picks
/// the segment whose temperature range contains the current reading.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyResume {
    pub profile_name: String,
    pub wallclock: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadedSnapshot {
    Current(ResumeSnapshot),
    Legacy(LegacyResume),
}

impl ResumeSnapshot {
    fn to_json(&self) -> Value {
        json!({
            "version": 2,
            "profile_name": self.profile_name,
            "lifecycle": self.lifecycle.as_str(),
            "segment_index": self.segment_index,
            "segment_phase": self.segment_phase.as_str(),
            "segment_start_temp": self.segment_start_temp,
            "hold_elapsed_seconds": self.hold_elapsed_seconds,
            "accumulated_cost": self.accumulated_cost,
            "wallclock": clock::to_rfc3339(self.wallclock),
        })
    }
}

fn parse_err(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::Parsing, msg)
}

fn req_str(obj: &Map<String, Value>, key: &str) -> Result<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
        .ok_or_else(|| parse_err(format!("snapshot lacks {:?}", key)))
}

fn req_f64(obj: &Map<String, Value>, key: &str) -> Result<f64> {
    obj.get(key).and_then(Value::as_f64)
        .ok_or_else(|| parse_err(format!("snapshot lacks {:?}", key)))
}

fn parse_snapshot(data: &[u8]) -> Result<LoadedSnapshot> {
    let val: Value = serde_json::from_slice(data)
        .map_err(|e| parse_err(format!("malformed snapshot: {}", e)))?;
    let obj = val.as_object().ok_or_else(|| parse_err("snapshot must be an object"))?;
    match obj.get("version").and_then(Value::as_u64) {
        Some(2) => Ok(LoadedSnapshot::Current(ResumeSnapshot {
            profile_name: req_str(obj, "profile_name")?,
            lifecycle: Lifecycle::parse(&req_str(obj, "lifecycle")?)?,
            segment_index: obj.get("segment_index").and_then(Value::as_u64)
                .ok_or_else(|| parse_err("snapshot lacks \"segment_index\""))? as usize,
            segment_phase: Phase::parse(&req_str(obj, "segment_phase")?)?,
            segment_start_temp: req_f64(obj, "segment_start_temp")?,
            hold_elapsed_seconds: req_f64(obj, "hold_elapsed_seconds")?,
            accumulated_cost: req_f64(obj, "accumulated_cost")?,
            wallclock: clock::parse_rfc3339(&req_str(obj, "wallclock")?)?,
        })),
        Some(1) => Ok(LoadedSnapshot::Legacy(LegacyResume {
            profile_name: req_str(obj, "profile_name")?,
            wallclock: clock::parse_rfc3339(&req_str(obj, "wallclock")?)?,
        })),
        Some(v) => Err(parse_err(format!("unsupported snapshot version {}", v))),
        None => Err(parse_err("snapshot lacks a version")),
    }
}

/// Write a file so that a crash leaves either the old or the new
/// content, never a torn mixture: write to an adjacent temporary file,
/// fsync, rename over the target.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// Owner of the resume snapshot file.  Nobody else writes it.
pub struct PersistentState {
    path: PathBuf,
}

impl PersistentState {
    pub fn new(path: PathBuf) -> PersistentState {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("could not create state directory {:?}: {}", parent, e);
            }
        }
        PersistentState { path }
    }

    /// Persist the snapshot atomically.  The caller logs failures; they
    /// never stop the control loop.
    pub fn write(&self, snapshot: &ResumeSnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(&snapshot.to_json())
            .map_err(|e| Error::persistence(e.to_string()))?;
        atomic_write(&self.path, &data).map_err(|e| Error::persistence(e.to_string()))
    }

    /// Remove the snapshot; a missing file is fine.
    pub fn clear(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("could not remove resume snapshot: {}", e);
            }
        }
    }

    /// Load the snapshot if it exists, was written while RUNNING, and is
    /// no older than the freshness window.
    pub fn try_resume(&self, freshness: f64, now: f64) -> Option<LoadedSnapshot> {
        let data = fs::read(&self.path).ok()?;
        let snapshot = match parse_snapshot(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("ignoring unreadable resume snapshot: {}", e);
                return None;
            }
        };
        let (wallclock, running) = match &snapshot {
            LoadedSnapshot::Current(s) => (s.wallclock, s.lifecycle == Lifecycle::Running),
            LoadedSnapshot::Legacy(l) => (l.wallclock, true),
        };
        if !running {
            debug!("resume snapshot was not taken while running");
            return None;
        }
        if now - wallclock > freshness {
            info!("resume snapshot is {:.0} s old, not resuming", now - wallclock);
            return None;
        }
        Some(snapshot)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(now: f64) -> ResumeSnapshot {
        ResumeSnapshot {
            profile_name: "bisque".into(),
            lifecycle: Lifecycle::Running,
            segment_index: 1,
            segment_phase: Phase::Hold,
            segment_start_temp: 500.,
            hold_elapsed_seconds: 300.,
            accumulated_cost: 1.25,
            wallclock: now,
        }
    }

    #[test]
    fn write_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistentState::new(dir.path().join("resume.json"));
        let now = 1722513600.;
        state.write(&snapshot(now)).unwrap();
        // no temporary left behind
        assert!(!dir.path().join("resume.tmp").exists());
        match state.try_resume(60., now + 10.).unwrap() {
            LoadedSnapshot::Current(s) => {
                assert_eq!(s.segment_index, 1);
                assert_eq!(s.segment_phase, Phase::Hold);
                assert!((s.wallclock - now).abs() < 1e-3);
                assert!((s.hold_elapsed_seconds - 300.).abs() < 1e-9);
            }
            LoadedSnapshot::Legacy(_) => panic!("v2 came back as legacy"),
        }
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistentState::new(dir.path().join("resume.json"));
        let now = 1722513600.;
        state.write(&snapshot(now)).unwrap();
        assert!(state.try_resume(60., now + 61.).is_none());
    }

    #[test]
    fn non_running_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistentState::new(dir.path().join("resume.json"));
        let now = 1722513600.;
        let mut snap = snapshot(now);
        snap.lifecycle = Lifecycle::Paused;
        state.write(&snap).unwrap();
        assert!(state.try_resume(60., now + 1.).is_none());
    }

    #[test]
    fn legacy_version_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let state = PersistentState::new(path.clone());
        std::fs::write(&path, format!(
            r#"{{"version": 1, "profile_name": "old", "wallclock": "{}"}}"#,
            clock::to_rfc3339(1722513600.))).unwrap();
        match state.try_resume(60., 1722513610.).unwrap() {
            LoadedSnapshot::Legacy(l) => assert_eq!(l.profile_name, "old"),
            LoadedSnapshot::Current(_) => panic!("v1 came back as current"),
        }
    }

    #[test]
    fn clear_removes_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistentState::new(dir.path().join("resume.json"));
        state.write(&snapshot(0.)).unwrap();
        state.clear();
        assert!(state.try_resume(1e12, 0.).is_none());
        state.clear();
    }

    #[test]
    fn garbage_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let state = PersistentState::new(path.clone());
        std::fs::write(&path, b"{ half a snapsho").unwrap();
        assert!(state.try_resume(60., 0.).is_none());
    }
}
