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
//! Firing profiles: loading, validation, unit normalization and the
//! time/temperature queries derived from them.

use std::fs;
use std::path::Path;
use log::*;
use serde_json::{json, Map, Value};

use crate::errors::{Error, ErrorKind, Result};
use crate::units::TempUnit;


/// The slope of a segment.  Numeric rates are degrees per hour; `Max`
/// rides the elements at full power, `Cool` lets the kiln cool naturally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    PerHour(f64),
    Max,
    Cool,
}

impl Rate {
    fn from_json(val: &Value) -> Result<Rate> {
        if let Some(n) = val.as_f64() {
            if !n.is_finite() {
                return Err(Error::invalid_profile("segment rate must be finite"));
            }
            return Ok(Rate::PerHour(n));
        }
        match val.as_str().map(str::to_lowercase).as_deref() {
            Some("max") => Ok(Rate::Max),
            Some("cool") => Ok(Rate::Cool),
            _ => Err(Error::invalid_profile(format!("invalid segment rate {}", val)))
        }
    }

    fn to_json(self) -> Value {
        match self {
            Rate::PerHour(n) => json!(n),
            Rate::Max => json!("max"),
            Rate::Cool => json!("cool"),
        }
    }
}

/// Assumed rates for the segments whose slope the profile does not pin
/// down numerically.  Both are positive degrees per hour.
#[derive(Debug, Clone, Copy)]
pub struct RateEstimates {
    pub max_heating: f64,
    pub natural_cooling: f64,
}

/// One ramp-and-optional-hold element of a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub rate: Rate,
    pub target: f64,
    pub hold_seconds: f64,
}

impl Segment {
    /// Signed slope in degrees per hour, with estimates substituted for
    /// the tagged rates.  Zero denotes a pure hold.
    pub fn effective_rate(&self, est: &RateEstimates) -> f64 {
        match self.rate {
            Rate::PerHour(r) => r,
            Rate::Max => est.max_heating,
            Rate::Cool => -est.natural_cooling,
        }
    }

    /// Seconds of ramping from `from` until the target, given the
    /// declared slope.  Zero when there is nothing to ramp or the slope
    /// points away from the target.
    pub fn ramp_seconds(&self, from: f64, est: &RateEstimates) -> f64 {
        let rate = self.effective_rate(est);
        let delta = self.target - from;
        if rate == 0. || delta == 0. || (rate > 0.) != (delta > 0.) {
            0.
        } else {
            (delta / rate).abs() * 3600.
        }
    }

    /// When, relative to the segment entry, the given temperature is
    /// scheduled to be reached.  On a pure hold this is defined only for
    /// the hold temperature itself (the entry instant); on a descending
    /// segment there is no solution.
    pub fn time_to_reach(&self, from: f64, temp: f64, est: &RateEstimates) -> Option<f64> {
        let rate = self.effective_rate(est);
        if rate == 0. {
            if (temp - self.target).abs() < 1e-9 { Some(0.) } else { None }
        } else if rate > 0. && self.target >= from && temp >= from && temp <= self.target {
            Some((temp - from) / rate * 3600.)
        } else {
            None
        }
    }
}

/// A named firing schedule, normalized to segment form at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub unit: TempUnit,
    pub start_temp: f64,
    segments: Vec<Segment>,
    /// Unknown top-level keys, carried through load/serialize untouched.
    extra: Map<String, Value>,
}

fn get_f64(obj: &Map<String, Value>, key: &str) -> Result<f64> {
    let v = obj.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::invalid_profile(format!("missing or non-numeric {:?}", key)))?;
    if !v.is_finite() {
        return Err(Error::invalid_profile(format!("{:?} must be finite", key)));
    }
    Ok(v)
}

impl Profile {
    /// Parse a profile document in either of the two supported formats.
    pub fn load(data: &[u8]) -> Result<Profile> {
        let val: Value = serde_json::from_slice(data)
            .map_err(|e| Error::new(ErrorKind::Parsing, format!("malformed profile: {}", e)))?;
        let obj = match val {
            Value::Object(obj) => obj,
            _ => return Err(Error::invalid_profile("profile must be a JSON object")),
        };
        match obj.get("version").and_then(Value::as_u64) {
            Some(2) => Self::load_v2(obj),
            Some(1) => Self::load_v1(obj),
            None if obj.contains_key("data") => Self::load_v1(obj),
            Some(v) => Err(Error::invalid_profile(format!("unsupported profile version {}", v))),
            None => Err(Error::invalid_profile("profile has neither segments nor data points")),
        }
    }

    fn take_common(obj: &mut Map<String, Value>) -> Result<(String, Option<TempUnit>)> {
        let name = obj.remove("name")
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| Error::invalid_profile("missing profile name"))?;
        obj.remove("version");
        let unit = match obj.remove("temp_units") {
            Some(v) => {
                let s = v.as_str()
                    .ok_or_else(|| Error::invalid_profile("temp_units must be a string"))?
                    .to_owned();
                Some(TempUnit::parse(&s)?)
            }
            None => None,
        };
        Ok((name, unit))
    }

    fn load_v2(mut obj: Map<String, Value>) -> Result<Profile> {
        let (name, unit) = Self::take_common(&mut obj)?;
        let unit = unit.ok_or_else(|| Error::invalid_profile("v2 profile requires temp_units"))?;
        let start_temp = get_f64(&obj, "start_temp")?;
        obj.remove("start_temp");

        let raw_segments = match obj.remove("segments") {
            Some(Value::Array(a)) => a,
            _ => return Err(Error::invalid_profile("missing segments array")),
        };
        if raw_segments.is_empty() {
            return Err(Error::invalid_profile("profile must have at least one segment"));
        }

        let mut segments = Vec::with_capacity(raw_segments.len());
        let mut prev_target = start_temp;
        for (i, rawseg) in raw_segments.iter().enumerate() {
            let seg = rawseg.as_object().ok_or_else(
                || Error::invalid_profile(format!("segment {} must be an object", i)))?;
            let rate = Rate::from_json(seg.get("rate").unwrap_or(&Value::Null))
                .map_err(|e| e.amend(&format!("segment {}", i)))?;
            let target = get_f64(seg, "target")
                .map_err(|e| e.amend(&format!("segment {}", i)))?;
            let hold = get_f64(seg, "hold")
                .map_err(|e| e.amend(&format!("segment {}", i)))?;
            if hold < 0. {
                return Err(Error::invalid_profile(format!("segment {}: hold must not be \
                                                           negative", i)));
            }
            match rate {
                Rate::PerHour(r) if r > 0. && target < prev_target => {
                    return Err(Error::invalid_profile(format!("segment {}: positive rate \
                                                               with decreasing target", i)));
                }
                Rate::PerHour(r) if r < 0. && target > prev_target => {
                    return Err(Error::invalid_profile(format!("segment {}: negative rate \
                                                               with increasing target", i)));
                }
                _ => ()
            }
            prev_target = target;
            segments.push(Segment { rate, target, hold_seconds: hold * 60. });
        }

        Ok(Profile { name, unit, start_temp, segments, extra: obj })
    }

    fn load_v1(mut obj: Map<String, Value>) -> Result<Profile> {
        let (name, unit) = Self::take_common(&mut obj)?;
        // backwards compatibility: untagged point profiles are Fahrenheit
        let unit = unit.unwrap_or_else(|| {
            debug!("profile {} has no unit tag, assuming Fahrenheit", name);
            TempUnit::Fahrenheit
        });

        let raw = match obj.remove("data") {
            Some(Value::Array(a)) => a,
            _ => return Err(Error::invalid_profile("missing data points")),
        };
        let mut points = Vec::with_capacity(raw.len());
        for (i, p) in raw.iter().enumerate() {
            let pair = p.as_array().filter(|a| a.len() == 2)
                .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)))
                .ok_or_else(|| Error::invalid_profile(
                    format!("data point {} must be a [time, temperature] pair", i)))?;
            if !pair.0.is_finite() || !pair.1.is_finite() {
                return Err(Error::invalid_profile(format!("data point {} must be finite", i)));
            }
            points.push(pair);
        }
        if points.len() < 2 {
            return Err(Error::invalid_profile("profile needs at least two data points"));
        }
        if points[0].0 != 0. {
            return Err(Error::invalid_profile("first data point must be at time 0"));
        }

        let start_temp = points[0].1;
        let mut segments: Vec<Segment> = Vec::new();
        for pair in points.windows(2) {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            if t1 < t0 {
                return Err(Error::invalid_profile("data point times must not decrease"));
            }
            let dt = t1 - t0;
            if dt == 0. {
                if v1 != v0 {
                    return Err(Error::invalid_profile("temperature step without duration"));
                }
                continue;
            }
            if v1 == v0 {
                // flat stretch: becomes hold time of the preceding segment
                match segments.last_mut() {
                    Some(last) => last.hold_seconds += dt,
                    None => segments.push(Segment { rate: Rate::PerHour(0.), target: v0,
                                                    hold_seconds: dt }),
                }
            } else {
                segments.push(Segment { rate: Rate::PerHour((v1 - v0) / dt * 3600.),
                                        target: v1, hold_seconds: 0. });
            }
        }
        if segments.is_empty() {
            return Err(Error::invalid_profile("profile must have at least one segment"));
        }

        Ok(Profile { name, unit, start_temp, segments, extra: obj })
    }

    /// Serialize back to the segment (v2) document.  Unknown keys from
    /// the loaded document are written back unchanged.
    pub fn serialize(&self) -> Vec<u8> {
        let mut obj = self.extra.clone();
        obj.insert("name".into(), json!(self.name));
        obj.insert("version".into(), json!(2));
        obj.insert("temp_units".into(), json!(self.unit.as_str()));
        obj.insert("start_temp".into(), json!(self.start_temp));
        obj.insert("segments".into(), Value::Array(
            self.segments.iter().map(|s| json!({
                "rate": s.rate.to_json(),
                "target": s.target,
                "hold": s.hold_seconds / 60.,
            })).collect()));
        serde_json::to_vec_pretty(&Value::Object(obj)).expect("profile is serializable")
    }

    /// Convert all temperatures and numeric rates into the given unit.
    /// A no-op when the profile already uses it.
    pub fn convert_to(&mut self, unit: TempUnit) {
        if self.unit == unit {
            return;
        }
        self.start_temp = self.unit.convert_value(unit, self.start_temp);
        for seg in &mut self.segments {
            seg.target = self.unit.convert_value(unit, seg.target);
            if let Rate::PerHour(r) = seg.rate {
                seg.rate = Rate::PerHour(self.unit.convert_rate(unit, r));
            }
        }
        self.unit = unit;
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Estimated total run time in seconds from the given start
    /// temperature.
    pub fn duration_estimate(&self, start_temp: f64, est: &RateEstimates) -> f64 {
        let mut t = 0.;
        let mut cur = start_temp;
        for seg in &self.segments {
            t += seg.ramp_seconds(cur, est) + seg.hold_seconds;
            cur = seg.target;
        }
        t
    }

    /// Estimated seconds into the run at which the given segment has
    /// accumulated `in_segment` seconds.
    pub fn elapsed_at(&self, start_temp: f64, est: &RateEstimates, index: usize,
                      in_segment: f64) -> f64 {
        let mut t = 0.;
        let mut cur = start_temp;
        for seg in self.segments.iter().take(index) {
            t += seg.ramp_seconds(cur, est) + seg.hold_seconds;
            cur = seg.target;
        }
        t + in_segment
    }

    /// The (time, temperature) polyline of the schedule, for display and
    /// the telemetry backlog.  Purely descriptive; the control loop
    /// derives setpoints from the segments directly.
    pub fn to_display_points(&self, start_temp: f64, est: &RateEstimates) -> Vec<(f64, f64)> {
        let mut points = vec![(0., start_temp)];
        let mut t = 0.;
        let mut cur = start_temp;
        for seg in &self.segments {
            t += seg.ramp_seconds(cur, est);
            points.push((t, seg.target));
            if seg.hold_seconds > 0. {
                t += seg.hold_seconds;
                points.push((t, seg.target));
            }
            cur = seg.target;
        }
        points
    }

    /// Scheduled temperature at a given run time.  Beyond the end of the
    /// schedule this reports 0, the legacy "kiln idle" value.
    pub fn target_at(&self, start_temp: f64, est: &RateEstimates, time: f64) -> f64 {
        let points = self.to_display_points(start_temp, est);
        if time < 0. {
            return start_temp;
        }
        for pair in points.windows(2) {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            if time <= t1 {
                return if t1 == t0 { v1 } else { v0 + (v1 - v0) * (time - t0) / (t1 - t0) };
            }
        }
        0.
    }

    /// First scheduled time at which the given temperature is reached,
    /// if any segment reaches it while rising or holding.
    pub fn find_time_for_temperature(&self, start_temp: f64, est: &RateEstimates,
                                     temp: f64) -> Option<f64> {
        let mut t = 0.;
        let mut cur = start_temp;
        for seg in &self.segments {
            if let Some(dt) = seg.time_to_reach(cur, temp, est) {
                return Some(t + dt);
            }
            t += seg.ramp_seconds(cur, est) + seg.hold_seconds;
            cur = seg.target;
        }
        None
    }
}


/// Look up a profile by its `name` field among the JSON files of the
/// profile directory.
pub fn find_profile(dir: &Path, name: &str) -> Result<Profile> {
    let entries = fs::read_dir(dir).map_err(
        |e| Error::config(format!("cannot read profile directory {:?}: {}", dir, e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            match fs::read(&path).map_err(Error::from).and_then(|data| Profile::load(&data)) {
                Ok(profile) => if profile.name == name {
                    return Ok(profile);
                }
                Err(e) => warn!("skipping profile file {:?}: {}", path, e),
            }
        }
    }
    Err(Error::no_profile(name))
}


#[cfg(test)]
mod tests {
    use float_cmp::approx_eq;
    use super::*;
    use crate::units::TempUnit;

    pub const EST: RateEstimates = RateEstimates { max_heating: 600., natural_cooling: 300. };

    fn bisque() -> Profile {
        Profile::load(br#"{
            "name": "bisque",
            "version": 2,
            "temp_units": "f",
            "start_temp": 70,
            "segments": [
                {"rate": 200, "target": 500, "hold": 0},
                {"rate": 100, "target": 1800, "hold": 15},
                {"rate": "cool", "target": 200, "hold": 0}
            ]
        }"#).unwrap()
    }

    #[test]
    fn v2_load() {
        let p = bisque();
        assert_eq!(p.name, "bisque");
        assert_eq!(p.unit, TempUnit::Fahrenheit);
        assert_eq!(p.segment_count(), 3);
        assert_eq!(p.segment(1).unwrap().hold_seconds, 900.);
        assert_eq!(p.segment(2).unwrap().rate, Rate::Cool);
    }

    #[test]
    fn v2_validation() {
        // negative rate with increasing target
        assert!(Profile::load(br#"{"name": "x", "version": 2, "temp_units": "c",
            "start_temp": 20,
            "segments": [{"rate": -50, "target": 100, "hold": 0}]}"#).is_err());
        // positive rate with decreasing target
        assert!(Profile::load(br#"{"name": "x", "version": 2, "temp_units": "c",
            "start_temp": 500,
            "segments": [{"rate": 50, "target": 100, "hold": 0}]}"#).is_err());
        // negative hold
        assert!(Profile::load(br#"{"name": "x", "version": 2, "temp_units": "c",
            "start_temp": 20,
            "segments": [{"rate": 50, "target": 100, "hold": -1}]}"#).is_err());
        // empty segment list
        assert!(Profile::load(br#"{"name": "x", "version": 2, "temp_units": "c",
            "start_temp": 20, "segments": []}"#).is_err());
        // missing unit tag
        assert!(Profile::load(br#"{"name": "x", "version": 2, "start_temp": 20,
            "segments": [{"rate": 50, "target": 100, "hold": 0}]}"#).is_err());
        // non-finite values never make it through JSON, but bad types do
        assert!(Profile::load(br#"{"name": "x", "version": 2, "temp_units": "c",
            "start_temp": 20,
            "segments": [{"rate": "med", "target": 100, "hold": 0}]}"#).is_err());
    }

    #[test]
    fn v1_load_merges_holds() {
        let p = Profile::load(br#"{
            "name": "legacy",
            "data": [[0, 100], [3600, 400], [5400, 400], [7200, 400], [10800, 200]]
        }"#).unwrap();
        // untagged profiles come out as Fahrenheit
        assert_eq!(p.unit, TempUnit::Fahrenheit);
        assert_eq!(p.start_temp, 100.);
        assert_eq!(p.segment_count(), 2);
        let ramp = p.segment(0).unwrap();
        assert_eq!(ramp.rate, Rate::PerHour(300.));
        assert_eq!(ramp.target, 400.);
        // both flat stretches merged into one hold
        assert_eq!(ramp.hold_seconds, 3600.);
        let down = p.segment(1).unwrap();
        assert_eq!(down.rate, Rate::PerHour(-200.));
    }

    #[test]
    fn v1_leading_hold() {
        let p = Profile::load(br#"{"name": "x", "data": [[0, 70], [600, 70], [4200, 170]]}"#)
            .unwrap();
        assert_eq!(p.segment(0).unwrap().rate, Rate::PerHour(0.));
        assert_eq!(p.segment(0).unwrap().hold_seconds, 600.);
    }

    #[test]
    fn v1_validation() {
        assert!(Profile::load(br#"{"name": "x", "data": [[100, 70], [200, 80]]}"#).is_err());
        assert!(Profile::load(br#"{"name": "x", "data": [[0, 70], [0, 80]]}"#).is_err());
        assert!(Profile::load(br#"{"name": "x", "data": [[0, 70]]}"#).is_err());
        assert!(Profile::load(br#"{"name": "x", "data": [[0, 70], [-10, 80]]}"#).is_err());
    }

    #[test]
    fn round_trip() {
        let p = Profile::load(br#"{
            "name": "bisque",
            "version": 2,
            "temp_units": "f",
            "start_temp": 70,
            "glaze_code": "XJ-5",
            "segments": [{"rate": 200, "target": 500, "hold": 30}]
        }"#).unwrap();
        let q = Profile::load(&p.serialize()).unwrap();
        assert_eq!(p, q);
        // the unknown key survived
        assert!(String::from_utf8(q.serialize()).unwrap().contains("XJ-5"));
    }

    #[test]
    fn unit_conversion_is_idempotent() {
        let mut p = bisque();
        let orig = p.clone();
        p.convert_to(TempUnit::Fahrenheit);
        assert_eq!(p, orig);
        p.convert_to(TempUnit::Celsius);
        assert!(approx_eq!(f64, p.start_temp, 21.11, epsilon = 0.01));
        assert!(approx_eq!(f64, p.segment(0).unwrap().target, 260., epsilon = 0.01));
        match p.segment(0).unwrap().rate {
            Rate::PerHour(r) => assert!(approx_eq!(f64, r, 111.11, epsilon = 0.01)),
            _ => panic!("rate changed kind"),
        }
        // tagged rates are unit agnostic
        assert_eq!(p.segment(2).unwrap().rate, Rate::Cool);
        p.convert_to(TempUnit::Fahrenheit);
        for (a, b) in p.segments().iter().zip(orig.segments()) {
            assert!(approx_eq!(f64, a.target, b.target, epsilon = 0.1));
        }
    }

    #[test]
    fn display_points_are_monotone() {
        let p = bisque();
        let points = p.to_display_points(70., &EST);
        // ramp, ramp end, hold end, cool end
        assert_eq!(points.len(), 5);
        for pair in points.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
        assert_eq!(points[0], (0., 70.));
        assert_eq!(points.last().unwrap().1, 200.);
    }

    #[test]
    fn duration_estimate() {
        let p = bisque();
        // 430°/200°h + 1300°/100°h + 15 min + 1600°/300°h (estimated cool)
        let expect = 430. / 200. * 3600. + 1300. / 100. * 3600. + 900. + 1600. / 300. * 3600.;
        assert!(approx_eq!(f64, p.duration_estimate(70., &EST), expect, epsilon = 1.));
    }

    #[test]
    fn target_at_interpolates_and_idles() {
        let p = bisque();
        assert!(approx_eq!(f64, p.target_at(70., &EST, 0.), 70.));
        assert!(approx_eq!(f64, p.target_at(70., &EST, 3600.), 270.));
        // past the end of the schedule: idle
        assert_eq!(p.target_at(70., &EST, 1e7), 0.);
    }

    #[test]
    fn time_for_temperature() {
        let p = Profile::load(br#"{
            "name": "flat",
            "version": 2,
            "temp_units": "f",
            "start_temp": 100,
            "segments": [
                {"rate": 200, "target": 500, "hold": 0},
                {"rate": 0, "target": 500, "hold": 30},
                {"rate": 100, "target": 900, "hold": 0}
            ]
        }"#).unwrap();
        let ramp_secs = 400. / 200. * 3600.;
        // the hold temperature is reached exactly when the hold is entered
        assert!(approx_eq!(f64, p.find_time_for_temperature(100., &EST, 500.).unwrap(),
                           ramp_secs, epsilon = 1e-6));
        // on the flat segment itself, anything else has no solution
        let hold = p.segment(1).unwrap();
        assert_eq!(hold.time_to_reach(500., 499., &EST), None);
        assert_eq!(hold.time_to_reach(500., 500., &EST), Some(0.));
        // descending segments have no solution either
        let down = Segment { rate: Rate::PerHour(-100.), target: 200., hold_seconds: 0. };
        assert_eq!(down.time_to_reach(500., 300., &EST), None);
        // never reached at all
        assert_eq!(p.find_time_for_temperature(100., &EST, 2000.), None);
    }

    #[test]
    fn store_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), bisque().serialize()).unwrap();
        std::fs::write(dir.path().join("junk.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(find_profile(dir.path(), "bisque").unwrap().name, "bisque");
        let missing = find_profile(dir.path(), "raku").unwrap_err();
        assert_eq!(missing.wire_name(), "no_such_profile");
    }
}
