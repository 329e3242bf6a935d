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
//! Advancing through profile segments by achieved temperature, and
//! deriving the momentary setpoint.

use log::*;

use crate::errors::{Error, Result};
use crate::profile::{Profile, Rate, Segment};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ramp,
    Hold,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ramp => "RAMP",
            Phase::Hold => "HOLD",
        }
    }

    pub fn parse(s: &str) -> Result<Phase> {
        match s {
            "RAMP" => Ok(Phase::Ramp),
            "HOLD" => Ok(Phase::Hold),
            _ => Err(Error::new(crate::errors::ErrorKind::Parsing,
                                format!("invalid segment phase {:?}", s)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Advanced past the last segment: the run is complete.
    Finished,
}

/// A ramp counts as complete once the temperature has crossed the target
/// within tolerance, in the direction the segment's rate points.
pub(crate) fn ramp_complete(seg: &Segment, temp: f64, tol: f64) -> bool {
    match seg.rate {
        Rate::PerHour(r) if r > 0. => temp >= seg.target - tol,
        Rate::PerHour(r) if r < 0. => temp <= seg.target + tol,
        Rate::PerHour(_) => true,
        Rate::Max => temp >= seg.target - tol,
        Rate::Cool => temp <= seg.target + tol,
    }
}

/// Where the run currently is within its profile.  Wallclock progression
/// is never paused or rewound here; falling behind the schedule is the
/// run loop's business to report.
#[derive(Debug, Clone)]
pub struct SegmentTracker {
    index: usize,
    phase: Phase,
    start_wallclock: f64,
    start_temp: f64,
    hold_started: Option<f64>,
}

impl SegmentTracker {
    pub fn new(start_temp: f64, now: f64) -> SegmentTracker {
        SegmentTracker {
            index: 0,
            phase: Phase::Ramp,
            start_wallclock: now,
            start_temp,
            hold_started: None,
        }
    }

    /// Reconstruct a tracker from persisted state.
    pub fn restore(index: usize, phase: Phase, start_temp: f64, start_wallclock: f64,
                   hold_started: Option<f64>) -> SegmentTracker {
        SegmentTracker { index, phase, start_wallclock, start_temp, hold_started }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn start_temp(&self) -> f64 {
        self.start_temp
    }

    pub fn in_segment_elapsed(&self, now: f64) -> f64 {
        now - self.start_wallclock
    }

    pub fn hold_elapsed(&self, now: f64) -> f64 {
        self.hold_started.map_or(0., |t| now - t)
    }

    /// Shift all stored wallclocks forward, compensating a pause.
    pub fn shift(&mut self, delta: f64) {
        self.start_wallclock += delta;
        if let Some(t) = self.hold_started.as_mut() {
            *t += delta;
        }
    }

    /// Skip over leading segments the kiln temperature already
    /// satisfies, entering a hold where one is pending.
    pub fn seek(&mut self, profile: &Profile, temp: f64, tol: f64, now: f64) {
        while let Some(seg) = profile.segment(self.index) {
            if !ramp_complete(seg, temp, tol) {
                break;
            }
            if seg.hold_seconds > 0. {
                info!("seek: entering hold of segment {}", self.index);
                self.phase = Phase::Hold;
                self.hold_started = Some(now);
                break;
            }
            self.index += 1;
            self.start_wallclock = now;
            self.start_temp = temp;
            info!("seek: skipping to segment {}", self.index);
        }
    }

    /// Check for phase/segment completion at the current temperature.
    pub fn update(&mut self, profile: &Profile, temp: f64, now: f64, tol: f64) -> Step {
        let seg = match profile.segment(self.index) {
            Some(seg) => seg,
            None => return Step::Finished,
        };
        match self.phase {
            Phase::Ramp => {
                if ramp_complete(seg, temp, tol) {
                    if seg.hold_seconds > 0. {
                        info!("segment {}: target {} reached, holding for {} s",
                              self.index, seg.target, seg.hold_seconds);
                        self.phase = Phase::Hold;
                        self.hold_started = Some(now);
                    } else {
                        return self.advance(profile, temp, now);
                    }
                }
            }
            Phase::Hold => {
                if now - self.hold_started.unwrap_or(now) >= seg.hold_seconds {
                    info!("segment {}: hold finished", self.index);
                    return self.advance(profile, temp, now);
                }
            }
        }
        Step::Continue
    }

    fn advance(&mut self, profile: &Profile, temp: f64, now: f64) -> Step {
        self.index += 1;
        self.phase = Phase::Ramp;
        self.start_wallclock = now;
        self.start_temp = temp;
        self.hold_started = None;
        if self.index >= profile.segment_count() {
            info!("profile complete");
            Step::Finished
        } else {
            Step::Continue
        }
    }

    /// The momentary setpoint.  Ramps extrapolate linearly from the
    /// segment entry and never overshoot the target; tagged rates pin
    /// the target and let the controller saturate (or stay off).
    pub fn setpoint(&self, profile: &Profile, now: f64) -> f64 {
        let seg = match profile.segment(self.index) {
            Some(seg) => seg,
            None => return 0.,
        };
        match self.phase {
            Phase::Hold => seg.target,
            Phase::Ramp => match seg.rate {
                Rate::PerHour(r) if r != 0. => {
                    let sp = self.start_temp + r * (now - self.start_wallclock) / 3600.;
                    if r > 0. { sp.min(seg.target) } else { sp.max(seg.target) }
                }
                _ => seg.target,
            }
        }
    }

    /// The per-tick entry point: advance if due, then report the
    /// setpoint, or `None` once the profile is finished.
    pub fn update_and_setpoint(&mut self, profile: &Profile, temp: f64, now: f64,
                               tol: f64) -> Option<f64> {
        match self.update(profile, temp, now, tol) {
            Step::Finished => None,
            Step::Continue => Some(self.setpoint(profile, now)),
        }
    }
}
