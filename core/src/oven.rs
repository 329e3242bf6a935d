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
//   Enrico Faulhaber <enrico.faulhaber@frm2.tum.de>
//   Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! The oven run loop: lifecycle state machine, control tick and command
//! handling, all on one dedicated thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use log::*;
use mlzutil::time::localtime;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::actuator::{Actuator, HeaterBackend};
use crate::config::KilnConfig;
use crate::errors::{Error, ErrorKind, Result};
use crate::firing::{EndStatus, FiringLog, FiringRecord, MAX_SERIES_POINTS};
use crate::persist::{LoadedSnapshot, PersistentState, ResumeSnapshot};
use crate::pid::Pid;
use crate::profile::{find_profile, Profile, Rate, RateEstimates};
use crate::segment::{ramp_complete, Phase, SegmentTracker};
use crate::sensor::{SensorBackend, SensorSettings, SensorStatus, TempSample, TempSensor};
use crate::telemetry::{Observer, ObserverId, Telemetry};
use crate::units::TempUnit;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
    Paused,
    Aborting,
    Emergency,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Idle => "IDLE",
            Lifecycle::Running => "RUNNING",
            Lifecycle::Paused => "PAUSED",
            Lifecycle::Aborting => "ABORTING",
            Lifecycle::Emergency => "EMERGENCY",
        }
    }

    pub fn parse(s: &str) -> Result<Lifecycle> {
        match s {
            "IDLE" => Ok(Lifecycle::Idle),
            "RUNNING" => Ok(Lifecycle::Running),
            "PAUSED" => Ok(Lifecycle::Paused),
            "ABORTING" => Ok(Lifecycle::Aborting),
            "EMERGENCY" => Ok(Lifecycle::Emergency),
            _ => Err(Error::new(ErrorKind::Parsing, format!("invalid lifecycle {:?}", s)))
        }
    }
}

/// Hook into a simulated kiln, for the simulator-only command.
pub trait SimControl: Send + Sync {
    /// Override the simulated temperature, in degrees Celsius.
    fn set_temperature(&self, celsius: f64);
}

enum Command {
    Start { profile: String, reply: Sender<Result<()>> },
    Stop { reply: Sender<Result<()>> },
    Pause { reply: Sender<Result<()>> },
    Resume { reply: Sender<Result<()>> },
    SetSimTemp { value: f64, reply: Sender<Result<()>> },
}

/// Handle given to the transport layer.  Commands are enqueued and
/// processed by the control thread at the next tick boundary; the reply
/// is synchronous.
#[derive(Clone)]
pub struct OvenHandle {
    cmds: Sender<Command>,
    status: Arc<Mutex<Value>>,
    telemetry: Arc<Telemetry>,
}

impl OvenHandle {
    pub fn start(&self, profile: &str) -> Result<()> {
        let profile = profile.to_owned();
        self.command(|reply| Command::Start { profile, reply })
    }

    pub fn stop(&self) -> Result<()> {
        self.command(|reply| Command::Stop { reply })
    }

    pub fn pause(&self) -> Result<()> {
        self.command(|reply| Command::Pause { reply })
    }

    pub fn resume(&self) -> Result<()> {
        self.command(|reply| Command::Resume { reply })
    }

    /// Only honored when the controller runs against the simulator.
    /// The value is in the configured temperature unit.
    pub fn set_simulated_temperature(&self, value: f64) -> Result<()> {
        self.command(|reply| Command::SetSimTemp { value, reply })
    }

    /// The latest telemetry snapshot; never blocks on the control
    /// thread.
    pub fn get_state(&self) -> Value {
        self.status.lock().clone()
    }

    pub fn add_observer(&self, observer: Box<dyn Observer>) -> ObserverId {
        self.telemetry.add_observer(observer)
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    fn command(&self, build: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply_sender, reply) = bounded(1);
        self.cmds.send(build(reply_sender))
            .map_err(|_| Error::programming("control thread is gone"))?;
        reply.recv().map_err(|_| Error::programming("control thread is gone"))?
    }
}

/// The oven owns every mutable piece of the controller: run state, PID,
/// actuator and tracker.  Only its thread touches them.
pub struct Oven {
    cfg: KilnConfig,
    sensor: TempSensor,
    pid: Pid,
    actuator: Actuator,
    persist: PersistentState,
    firing: FiringLog,
    telemetry: Arc<Telemetry>,
    status: Arc<Mutex<Value>>,
    sim: Option<Arc<dyn SimControl>>,

    lifecycle: Lifecycle,
    profile: Option<Profile>,
    tracker: Option<SegmentTracker>,
    record: Option<FiringRecord>,
    started_at: f64,
    run_start_temp: f64,
    paused_at: Option<f64>,
    accumulated_cost: f64,
    stale_ticks: u32,
    last_tick: Option<f64>,
    last_sample: Option<(f64, f64)>,
    last_duty: f64,
    last_error: Option<String>,
    rate_lag_since: Option<f64>,
    rate_warned_segment: Option<usize>,
}

impl Oven {
    /// Construct the oven, prime a resume if a fresh snapshot allows it,
    /// and start the control thread.
    pub fn start(cfg: KilnConfig, sensor_backend: Box<dyn SensorBackend>,
                 heater_backend: Box<dyn HeaterBackend>,
                 sim: Option<Arc<dyn SimControl>>) -> Result<OvenHandle> {
        cfg.validate()?;
        if let Err(e) = std::fs::create_dir_all(&cfg.profile_dir) {
            error!("could not create profile directory: {}", e);
        }

        let sensor = TempSensor::start(sensor_backend, SensorSettings::from_config(&cfg));
        let actuator = Actuator::new(heater_backend, cfg.tick_interval);
        let persist = PersistentState::new(cfg.resume_file());
        let firing = FiringLog::new(cfg.firing_log_dir.clone());
        let telemetry = Arc::new(Telemetry::new());
        let status = Arc::new(Mutex::new(json!({"lifecycle": Lifecycle::Idle.as_str()})));

        let pid = Pid::new(cfg.kp, cfg.ki, cfg.kd, cfg.output_window);
        let automatic_restarts = cfg.automatic_restarts;
        let mut oven = Oven {
            cfg, sensor, pid, actuator, persist, firing,
            telemetry: Arc::clone(&telemetry),
            status: Arc::clone(&status),
            sim,
            lifecycle: Lifecycle::Idle,
            profile: None,
            tracker: None,
            record: None,
            started_at: 0.,
            run_start_temp: 0.,
            paused_at: None,
            accumulated_cost: 0.,
            stale_ticks: 0,
            last_tick: None,
            last_sample: None,
            last_duty: 0.,
            last_error: None,
            rate_lag_since: None,
            rate_warned_segment: None,
        };
        if automatic_restarts {
            oven.try_resume(localtime());
        }

        let (cmd_sender, cmd_receiver) = unbounded();
        thread::Builder::new().name("oven".into())
            .spawn(move || oven.run(cmd_receiver))
            .map_err(|e| Error::programming(format!("could not start control thread: {}", e)))?;

        Ok(OvenHandle { cmds: cmd_sender, status, telemetry })
    }

    fn estimates(&self) -> RateEstimates {
        RateEstimates {
            max_heating: self.cfg.estimated_max_heating_rate,
            natural_cooling: self.cfg.estimated_natural_cooling_rate,
        }
    }

    fn run(mut self, cmds: Receiver<Command>) {
        mlzlog::set_thread_prefix("[oven] ");
        info!("control loop running every {} s", self.cfg.tick_interval);
        self.emit_state(localtime());
        let ticker = tick(Duration::from_secs_f64(self.cfg.tick_interval));
        loop {
            select! {
                recv(cmds) -> msg => match msg {
                    Ok(cmd) => self.handle_command(cmd),
                    // all handles dropped: shut down
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.tick(localtime()),
            }
        }
        self.actuator.shutoff();
        info!("control loop finished");
    }

    // Command handling.  Replies are synchronous; `last_error` keeps the
    // most recent failure until a command succeeds again.

    fn handle_command(&mut self, cmd: Command) {
        let now = localtime();
        let (result, reply) = match cmd {
            Command::Start { profile, reply } => (self.cmd_start(&profile, now), reply),
            Command::Stop { reply } => (self.cmd_stop(now), reply),
            Command::Pause { reply } => (self.cmd_pause(now), reply),
            Command::Resume { reply } => (self.cmd_resume(now), reply),
            Command::SetSimTemp { value, reply } => (self.cmd_set_sim_temp(value), reply),
        };
        match &result {
            Ok(()) => self.last_error = None,
            Err(e) => {
                warn!("command failed: {}", e);
                self.last_error = Some(e.to_string());
            }
        }
        self.emit_state(now);
        let _ = reply.send(result);
    }

    fn cmd_start(&mut self, name: &str, now: f64) -> Result<()> {
        if self.lifecycle != Lifecycle::Idle {
            return Err(Error::illegal_state(
                format!("cannot start while {}", self.lifecycle.as_str())));
        }
        let mut profile = find_profile(&self.cfg.profile_dir, name)?;
        profile.convert_to(self.cfg.temperature_unit);
        let sample = self.sensor.wait_for_reading((2. * self.cfg.sensor_cadence).max(1.))
            .ok_or_else(|| Error::hardware("no good temperature reading"))?;

        let mut tracker = SegmentTracker::new(sample.smoothed, now);
        if self.cfg.seek_start {
            tracker.seek(&profile, sample.smoothed, self.cfg.segment_complete_tolerance, now);
        }
        info!("starting profile {} at {:.1}°", profile.name, sample.smoothed);

        self.pid.reset();
        self.record = Some(FiringRecord::new(profile.name.clone(), profile.unit, now));
        self.started_at = now;
        self.run_start_temp = sample.smoothed;
        self.accumulated_cost = 0.;
        self.stale_ticks = 0;
        self.last_sample = None;
        self.rate_lag_since = None;
        self.rate_warned_segment = None;
        self.profile = Some(profile);
        self.tracker = Some(tracker);
        self.lifecycle = Lifecycle::Running;
        self.persist_now(now);
        Ok(())
    }

    fn cmd_stop(&mut self, now: f64) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Running | Lifecycle::Paused => {
                info!("aborting run");
                self.lifecycle = Lifecycle::Aborting;
                self.finish(EndStatus::Aborted, now);
                Ok(())
            }
            Lifecycle::Emergency => {
                info!("emergency acknowledged");
                self.reset_to_idle();
                Ok(())
            }
            _ => Err(Error::illegal_state("no run in progress")),
        }
    }

    fn cmd_pause(&mut self, now: f64) -> Result<()> {
        if self.lifecycle != Lifecycle::Running {
            return Err(Error::illegal_state("can only pause a running kiln"));
        }
        self.actuator.shutoff();
        self.last_duty = 0.;
        self.paused_at = Some(now);
        self.lifecycle = Lifecycle::Paused;
        info!("paused");
        self.persist_now(now);
        Ok(())
    }

    fn cmd_resume(&mut self, now: f64) -> Result<()> {
        if self.lifecycle != Lifecycle::Paused {
            return Err(Error::illegal_state("not paused"));
        }
        let delta = now - self.paused_at.take().unwrap_or(now);
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.shift(delta);
        }
        self.pid.shift_time(delta);
        self.started_at += delta;
        self.lifecycle = Lifecycle::Running;
        info!("resumed after {:.0} s pause", delta);
        self.persist_now(now);
        Ok(())
    }

    fn cmd_set_sim_temp(&mut self, value: f64) -> Result<()> {
        match &self.sim {
            Some(sim) => {
                let celsius = self.cfg.temperature_unit.convert_value(TempUnit::Celsius, value);
                sim.set_temperature(celsius);
                Ok(())
            }
            None => Err(Error::illegal_state("not running against simulated hardware")),
        }
    }

    // The control tick.

    fn tick(&mut self, now: f64) {
        match self.lifecycle {
            Lifecycle::Running => self.tick_running(now),
            Lifecycle::Paused => {
                let sample = self.sensor.latest();
                if sample.status.is_fatal() {
                    self.emergency(format!("sensor reported {} while paused",
                                           sample.status.as_str()), now);
                } else {
                    self.persist_now(now);
                    self.emit_state(now);
                }
            }
            _ => self.emit_state(now),
        }
        self.last_tick = Some(now);
    }

    fn tick_running(&mut self, now: f64) {
        let dt = self.last_tick.map_or(self.cfg.tick_interval, |t| now - t);
        if dt > 10. * self.cfg.tick_interval {
            return self.emergency(format!("control tick late by {:.1} s", dt), now);
        }

        let sample = self.sensor.latest();
        match sample.status {
            SensorStatus::Short | SensorStatus::Open => {
                return self.emergency(format!("thermocouple fault: {}",
                                              sample.status.as_str()), now);
            }
            SensorStatus::OverTemp => {
                return self.emergency(format!("over-temperature: {:.1}° exceeds the limit",
                                              sample.raw), now);
            }
            SensorStatus::Stale => {
                self.stale_ticks += 1;
                warn!("no fresh temperature reading ({} ticks)", self.stale_ticks);
                if self.stale_ticks >= 3 {
                    return self.emergency("temperature readings stalled".into(), now);
                }
            }
            SensorStatus::Ok => self.stale_ticks = 0,
        }

        let tol = self.cfg.segment_complete_tolerance;
        let mut finished = false;
        let (setpoint, cooling) = {
            let (profile, tracker) = match (&self.profile, &mut self.tracker) {
                (Some(profile), Some(tracker)) => (profile, tracker),
                _ => return,
            };
            match tracker.update_and_setpoint(profile, sample.smoothed, now, tol) {
                Some(setpoint) => {
                    let cooling = matches!(
                        profile.segment(tracker.index()).map(|seg| seg.rate),
                        Some(Rate::Cool));
                    (setpoint, cooling)
                }
                None => {
                    finished = true;
                    (0., false)
                }
            }
        };
        if finished {
            return self.finish(EndStatus::Completed, now);
        }

        // natural cooling never heats
        let duty = if cooling { 0. } else { self.pid.compute(setpoint, sample.smoothed, now) };
        let on_time = self.actuator.apply(duty);
        self.last_duty = duty;
        self.accumulated_cost += on_time / 3600. * self.cfg.kwh_rate * self.cfg.kw_elements;

        if let Some(record) = self.record.as_mut() {
            record.push(now - self.started_at, sample.smoothed, setpoint);
        }
        self.check_rate_deviation(&sample, now);

        // persist before the broadcast, so observers never run ahead of
        // what a restart would recover
        self.persist_now(now);
        self.publish(&sample, setpoint, now);
        self.last_sample = Some((now, sample.smoothed));
    }

    fn check_rate_deviation(&mut self, sample: &TempSample, now: f64) {
        let target_rate = match (&self.profile, &self.tracker) {
            (Some(profile), Some(tracker)) if tracker.phase() == Phase::Ramp => {
                match profile.segment(tracker.index()).map(|seg| seg.rate) {
                    Some(Rate::PerHour(r)) if r > 0. => r,
                    _ => {
                        self.rate_lag_since = None;
                        return;
                    }
                }
            }
            _ => {
                self.rate_lag_since = None;
                return;
            }
        };
        let actual = match self.last_sample {
            Some((t, temp)) if now > t => (sample.smoothed - temp) / (now - t) * 3600.,
            _ => return,
        };
        if target_rate - actual > self.cfg.rate_deviation_warning {
            let since = *self.rate_lag_since.get_or_insert(now);
            let segment = self.tracker.as_ref().map(|t| t.index());
            if now - since > 60. && self.rate_warned_segment != segment {
                warn!("heating at {:.0}°/h, {:.0}°/h behind the schedule", actual,
                      target_rate - actual);
                self.rate_warned_segment = segment;
            }
        } else {
            self.rate_lag_since = None;
        }
    }

    // Leaving RUNNING.

    fn emergency(&mut self, reason: String, now: f64) {
        error!("EMERGENCY: {}", reason);
        self.last_error = Some(reason);
        self.finish(EndStatus::Emergency, now);
    }

    /// Terminate the run.  Shutoff comes first on every path.
    fn finish(&mut self, status: EndStatus, now: f64) {
        self.actuator.shutoff();
        self.last_duty = 0.;
        if let Some(record) = self.record.take() {
            if let Err(e) = self.firing.finish(&record, status, now, self.accumulated_cost) {
                error!("could not write firing log: {}", e);
            }
        }
        self.persist.clear();
        match status {
            EndStatus::Emergency => {
                // keep the profile for display; stop() returns to IDLE
                self.lifecycle = Lifecycle::Emergency;
                self.tracker = None;
                self.telemetry.set_backlog(None);
            }
            _ => self.reset_to_idle(),
        }
        info!("run ended: {}", status.as_str());
        self.emit_state(now);
    }

    fn reset_to_idle(&mut self) {
        self.lifecycle = Lifecycle::Idle;
        self.profile = None;
        self.tracker = None;
        self.record = None;
        self.paused_at = None;
        self.stale_ticks = 0;
        self.last_duty = 0.;
        self.telemetry.set_backlog(None);
        self.persist.clear();
    }

    // Persistence.

    fn persist_now(&self, now: f64) {
        let (profile, tracker) = match (&self.profile, &self.tracker) {
            (Some(profile), Some(tracker)) => (profile, tracker),
            _ => return,
        };
        let snapshot = ResumeSnapshot {
            profile_name: profile.name.clone(),
            lifecycle: self.lifecycle,
            segment_index: tracker.index(),
            segment_phase: tracker.phase(),
            segment_start_temp: tracker.start_temp(),
            hold_elapsed_seconds: tracker.hold_elapsed(now),
            accumulated_cost: self.accumulated_cost,
            wallclock: now,
        };
        if let Err(e) = self.persist.write(&snapshot) {
            error!("could not write resume snapshot: {}", e);
        }
    }

    fn try_resume(&mut self, now: f64) {
        let snapshot = match self.persist.try_resume(self.cfg.resume_freshness_seconds, now) {
            Some(snapshot) => snapshot,
            None => return,
        };
        match self.prime_resume(snapshot, now) {
            Ok(name) => info!("resuming interrupted firing of profile {}", name),
            Err(e) => {
                warn!("could not resume interrupted firing: {}", e);
                self.persist.clear();
            }
        }
    }

    /// Restore run state from a snapshot, adjusting the segment and hold
    /// start times so that elapsed-in-segment is preserved.
    fn prime_resume(&mut self, snapshot: LoadedSnapshot, now: f64) -> Result<String> {
        let sample = self.sensor.wait_for_reading((3. * self.cfg.sensor_cadence).max(1.))
            .ok_or_else(|| Error::hardware("no temperature reading at startup"))?;
        let est = self.estimates();
        let tol = self.cfg.segment_complete_tolerance;

        let (name, tracker, cost) = match snapshot {
            LoadedSnapshot::Current(snap) => {
                let mut profile = find_profile(&self.cfg.profile_dir, &snap.profile_name)?;
                profile.convert_to(self.cfg.temperature_unit);
                let seg = profile.segment(snap.segment_index).ok_or_else(
                    || Error::persistence("snapshot segment index is out of range"))?;
                // the ramp clock is recovered from how far the kiln got
                let ramp_elapsed = match seg.rate {
                    Rate::PerHour(r) if r != 0. =>
                        ((sample.smoothed - snap.segment_start_temp) / r * 3600.).max(0.),
                    _ => 0.,
                };
                let (start_wallclock, hold_started) = match snap.segment_phase {
                    Phase::Ramp => (now - ramp_elapsed, None),
                    Phase::Hold => (now - seg.ramp_seconds(snap.segment_start_temp, &est)
                                        - snap.hold_elapsed_seconds,
                                    Some(now - snap.hold_elapsed_seconds)),
                };
                let tracker = SegmentTracker::restore(
                    snap.segment_index, snap.segment_phase, snap.segment_start_temp,
                    start_wallclock, hold_started);
                self.started_at = now - profile.elapsed_at(
                    profile.start_temp, &est, snap.segment_index,
                    tracker.in_segment_elapsed(now));
                self.run_start_temp = profile.start_temp;
                self.profile = Some(profile);
                (snap.profile_name, tracker, snap.accumulated_cost)
            }
            LoadedSnapshot::Legacy(snap) => {
                let mut profile = find_profile(&self.cfg.profile_dir, &snap.profile_name)?;
                profile.convert_to(self.cfg.temperature_unit);
                // time-based snapshot: pick the segment whose range
                // contains the current reading, in RAMP phase
                let mut index = 0;
                while profile.segment(index)
                             .map_or(false, |seg| ramp_complete(seg, sample.smoothed, tol)) {
                    index += 1;
                }
                if index >= profile.segment_count() {
                    return Err(Error::persistence("kiln is already past the profile end"));
                }
                let tracker = SegmentTracker::restore(index, Phase::Ramp, sample.smoothed,
                                                      now, None);
                self.started_at = now - profile.elapsed_at(profile.start_temp, &est, index, 0.);
                self.run_start_temp = profile.start_temp;
                self.profile = Some(profile);
                (snap.profile_name, tracker, 0.)
            }
        };

        // the PID integral does not survive a restart
        self.pid.reset();
        self.record = Some(FiringRecord::new(name.clone(), self.cfg.temperature_unit,
                                             self.started_at));
        self.accumulated_cost = cost;
        self.tracker = Some(tracker);
        self.lifecycle = Lifecycle::Running;
        Ok(name)
    }

    // Telemetry.

    fn emit_state(&self, now: f64) {
        let sample = self.sensor.latest();
        let setpoint = match (&self.profile, &self.tracker) {
            (Some(profile), Some(tracker))
                if matches!(self.lifecycle, Lifecycle::Running | Lifecycle::Paused) =>
                    tracker.setpoint(profile, now),
            _ => 0.,
        };
        self.publish(&sample, setpoint, now);
    }

    fn publish(&self, sample: &TempSample, setpoint: f64, now: f64) {
        let doc = self.snapshot_json(sample, setpoint, now);
        *self.status.lock() = doc.clone();
        self.update_backlog();
        self.telemetry.broadcast(&doc);
    }

    fn snapshot_json(&self, sample: &TempSample, setpoint: f64, now: f64) -> Value {
        let est = self.estimates();
        let (segment_index, segment_phase) = match &self.tracker {
            Some(tracker) => (json!(tracker.index()), json!(tracker.phase().as_str())),
            None => (Value::Null, Value::Null),
        };
        let heat_rate_target = match (&self.profile, &self.tracker) {
            (Some(profile), Some(tracker)) if tracker.phase() == Phase::Ramp => {
                match profile.segment(tracker.index()).map(|seg| seg.rate) {
                    Some(Rate::PerHour(r)) => r,
                    Some(Rate::Max) => est.max_heating,
                    Some(Rate::Cool) => -est.natural_cooling,
                    None => 0.,
                }
            }
            _ => 0.,
        };
        let heat_rate_actual = match self.last_sample {
            Some((t, temp)) if now > t => (sample.smoothed - temp) / (now - t) * 3600.,
            _ => 0.,
        };
        let (progress, elapsed, eta) = match &self.profile {
            Some(profile)
                if matches!(self.lifecycle, Lifecycle::Running | Lifecycle::Paused) => {
                let duration = profile.duration_estimate(self.run_start_temp, &est).max(1.);
                let elapsed = (now - self.started_at).max(0.);
                ((elapsed / duration * 100.).min(100.), elapsed, (duration - elapsed).max(0.))
            }
            _ => (0., 0., 0.),
        };
        json!({
            "lifecycle": self.lifecycle.as_str(),
            "profile_name": self.profile.as_ref().map(|p| &p.name),
            "temperature": sample.smoothed,
            "target": setpoint,
            "heat_rate_actual": heat_rate_actual,
            "heat_rate_target": heat_rate_target,
            "actuator_duty": self.last_duty,
            "segment_index": segment_index,
            "segment_phase": segment_phase,
            "progress_percent": progress,
            "elapsed_seconds": elapsed,
            "eta_seconds": eta,
            "accumulated_cost": self.accumulated_cost,
            "currency": self.cfg.currency,
            "unit": self.cfg.temperature_unit.as_str(),
            "last_error": self.last_error,
        })
    }

    /// The summary newly joining observers receive: the schedule as
    /// display points plus the live series so far.
    fn update_backlog(&self) {
        match (&self.profile, &self.record) {
            (Some(profile), Some(record)) => {
                let est = self.estimates();
                let points: Vec<Value> = profile
                    .to_display_points(self.run_start_temp, &est)
                    .into_iter()
                    .map(|(t, temp)| json!([t, temp]))
                    .collect();
                self.telemetry.set_backlog(Some(json!({
                    "type": "backlog",
                    "profile": {
                        "name": profile.name,
                        "temp_units": profile.unit.as_str(),
                        "points": points,
                    },
                    "series": record.decimated(MAX_SERIES_POINTS),
                })));
            }
            _ => self.telemetry.set_backlog(None),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use super::*;
    use crate::persist::{PersistentState, ResumeSnapshot};

    struct FixedSensor(Arc<Mutex<f64>>);

    impl SensorBackend for FixedSensor {
        fn read_temperature(&mut self) -> Result<f64> {
            Ok(*self.0.lock())
        }
    }

    struct NullHeater;

    impl HeaterBackend for NullHeater {
        fn set_heat(&mut self, _on: bool) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &Path) -> KilnConfig {
        let mut cfg = KilnConfig::default();
        cfg.tick_interval = 0.02;
        cfg.sensor_cadence = 0.01;
        cfg.smoothing_window_size = 2;
        cfg.temperature_unit = TempUnit::Celsius;
        cfg.emergency_over_temp = 1240.;
        cfg.automatic_restarts = false;
        cfg.profile_dir = dir.join("profiles");
        cfg.firing_log_dir = dir.join("firings");
        cfg.state_dir = dir.join("state");
        cfg
    }

    fn write_profile(cfg: &KilnConfig) {
        std::fs::create_dir_all(&cfg.profile_dir).unwrap();
        std::fs::write(cfg.profile_dir.join("slow.json"), br#"{
            "name": "slow",
            "version": 2,
            "temp_units": "c",
            "start_temp": 20,
            "segments": [
                {"rate": 100, "target": 300, "hold": 0},
                {"rate": 50, "target": 600, "hold": 10}
            ]
        }"#).unwrap();
    }

    fn wait_until(handle: &OvenHandle, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let state = handle.get_state();
            if pred(&state) {
                return state;
            }
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting; last state: {}", state);
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    fn start_oven(cfg: &KilnConfig, temp: f64) -> (OvenHandle, Arc<Mutex<f64>>) {
        let shared = Arc::new(Mutex::new(temp));
        let handle = Oven::start(cfg.clone(), Box::new(FixedSensor(Arc::clone(&shared))),
                                 Box::new(NullHeater), None).unwrap();
        (handle, shared)
    }

    #[test]
    fn commands_respect_the_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_profile(&cfg);
        let (handle, _temp) = start_oven(&cfg, 20.);

        assert_eq!(handle.stop().unwrap_err().wire_name(), "illegal_in_current_state");
        assert_eq!(handle.pause().unwrap_err().wire_name(), "illegal_in_current_state");
        assert_eq!(handle.start("raku").unwrap_err().wire_name(), "no_such_profile");
        assert_eq!(handle.set_simulated_temperature(500.).unwrap_err().wire_name(),
                   "illegal_in_current_state");
        // the failure stays visible in telemetry until a command succeeds
        let state = handle.get_state();
        assert!(state["last_error"].as_str().is_some());

        handle.start("slow").unwrap();
        assert!(handle.get_state()["last_error"].is_null());
        assert_eq!(handle.start("slow").unwrap_err().wire_name(),
                   "illegal_in_current_state");
        handle.stop().unwrap();
    }

    #[test]
    fn start_runs_and_stop_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_profile(&cfg);
        let (handle, _temp) = start_oven(&cfg, 20.);

        handle.start("slow").unwrap();
        let state = wait_until(&handle, |s| s["lifecycle"] == "RUNNING");
        assert_eq!(state["profile_name"], "slow");
        assert_eq!(state["segment_phase"], "RAMP");
        // a resume snapshot appears while running
        wait_until(&handle, |_| cfg.resume_file().exists());

        handle.stop().unwrap();
        let state = handle.get_state();
        assert_eq!(state["lifecycle"], "IDLE");
        assert_eq!(state["actuator_duty"], 0.);
        // snapshot is gone, the log carries the abort
        assert!(!cfg.resume_file().exists());
        let latest = FiringLog::new(cfg.firing_log_dir.clone()).latest().unwrap();
        let doc: Value = serde_json::from_slice(&std::fs::read(latest).unwrap()).unwrap();
        assert_eq!(doc["end_status"], "aborted");
    }

    #[test]
    fn pause_forces_duty_to_zero_and_resume_continues() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_profile(&cfg);
        let (handle, _temp) = start_oven(&cfg, 20.);

        handle.start("slow").unwrap();
        wait_until(&handle, |s| s["lifecycle"] == "RUNNING");
        handle.pause().unwrap();
        let state = wait_until(&handle, |s| s["lifecycle"] == "PAUSED");
        assert_eq!(state["actuator_duty"], 0.);
        handle.resume().unwrap();
        wait_until(&handle, |s| s["lifecycle"] == "RUNNING");
        handle.stop().unwrap();
    }

    #[test]
    fn over_temperature_is_an_emergency() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_profile(&cfg);
        let (handle, temp) = start_oven(&cfg, 20.);

        handle.start("slow").unwrap();
        wait_until(&handle, |s| s["lifecycle"] == "RUNNING");
        *temp.lock() = 1300.;
        let state = wait_until(&handle, |s| s["lifecycle"] == "EMERGENCY");
        assert_eq!(state["actuator_duty"], 0.);
        assert!(state["last_error"].as_str().unwrap().contains("over-temperature"));
        let latest = FiringLog::new(cfg.firing_log_dir.clone()).latest().unwrap();
        let doc: Value = serde_json::from_slice(&std::fs::read(latest).unwrap()).unwrap();
        assert_eq!(doc["end_status"], "emergency");
        // acknowledge
        handle.stop().unwrap();
        assert_eq!(handle.get_state()["lifecycle"], "IDLE");
    }

    #[test]
    fn fresh_snapshot_resumes_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.automatic_restarts = true;
        write_profile(&cfg);

        let now = mlzutil::time::localtime();
        PersistentState::new(cfg.resume_file()).write(&ResumeSnapshot {
            profile_name: "slow".into(),
            lifecycle: Lifecycle::Running,
            segment_index: 1,
            segment_phase: Phase::Hold,
            segment_start_temp: 300.,
            hold_elapsed_seconds: 240.,
            accumulated_cost: 1.5,
            wallclock: now,
        }).unwrap();

        let (handle, _temp) = start_oven(&cfg, 598.);
        let state = wait_until(&handle, |s| s["lifecycle"] == "RUNNING");
        assert_eq!(state["segment_index"], 1);
        assert_eq!(state["segment_phase"], "HOLD");
        assert!(state["accumulated_cost"].as_f64().unwrap() >= 1.5);
        handle.stop().unwrap();
    }

    #[test]
    fn stale_snapshot_is_not_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.automatic_restarts = true;
        write_profile(&cfg);

        PersistentState::new(cfg.resume_file()).write(&ResumeSnapshot {
            profile_name: "slow".into(),
            lifecycle: Lifecycle::Running,
            segment_index: 0,
            segment_phase: Phase::Ramp,
            segment_start_temp: 20.,
            hold_elapsed_seconds: 0.,
            accumulated_cost: 0.,
            wallclock: mlzutil::time::localtime() - 3600.,
        }).unwrap();

        let (handle, _temp) = start_oven(&cfg, 20.);
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(handle.get_state()["lifecycle"], "IDLE");
    }
}
