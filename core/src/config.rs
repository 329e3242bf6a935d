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
//! Configuration file handling.

use std::path::{Path, PathBuf};
use serde_derive::Deserialize;

use crate::errors::{Error, Result};
use crate::units::TempUnit;


/// All recognized options of the kiln controller.  Unset options take
/// their documented defaults; temperatures and rates are in the unit
/// selected by `temperature_unit`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Control loop cadence in seconds, also the actuator window.
    pub tick_interval: f64,
    pub temperature_unit: TempUnit,

    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Absolute scale of the windowed PID output.
    pub output_window: f64,

    pub smoothing_window_size: usize,
    /// Sensor acquisition cadence in seconds.
    pub sensor_cadence: f64,
    /// Fraction of a full smoothing window without good readings after
    /// which the sensor reports STALE.
    pub stale_window_fraction: f64,
    /// Additive correction applied to readings after unit conversion.
    pub thermocouple_offset: f64,

    pub emergency_over_temp: f64,
    pub segment_complete_tolerance: f64,
    /// Sustained heating-rate lag (degrees/hour) that triggers a warning.
    pub rate_deviation_warning: f64,
    /// Assumed heating rate (degrees/hour) for `MAX` segments.
    pub estimated_max_heating_rate: f64,
    /// Assumed natural cooling rate (degrees/hour) for `COOL` segments.
    pub estimated_natural_cooling_rate: f64,

    pub kwh_rate: f64,
    pub kw_elements: f64,
    pub currency: String,

    pub automatic_restarts: bool,
    pub resume_freshness_seconds: f64,
    /// Skip over profile segments the kiln temperature has already
    /// satisfied when starting.
    pub seek_start: bool,

    pub profile_dir: PathBuf,
    pub firing_log_dir: PathBuf,
    pub state_dir: PathBuf,

    pub hardware: HardwareConfig,
}

/// Selection and tuning of the hardware backend pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HardwareConfig {
    /// Backend class: "sim" or "sysfs".
    pub class: String,
    /// Millidegree temperature input file (sysfs backend).
    pub sensor_path: Option<PathBuf>,
    /// GPIO value file driving the relay (sysfs backend).
    pub relay_path: Option<PathBuf>,
    /// Optional fault indicator file; nonzero content maps to an open
    /// thermocouple (sysfs backend).
    pub fault_path: Option<PathBuf>,

    /// Simulator: full-power heating rate in °C/hour.
    pub sim_heat_rate: f64,
    /// Simulator: cooling coefficient towards ambient, per second.
    pub sim_cool_coeff: f64,
    /// Simulator: ambient temperature in °C.
    pub sim_ambient: f64,
}

impl Default for KilnConfig {
    fn default() -> Self {
        KilnConfig {
            tick_interval: 2.0,
            temperature_unit: TempUnit::Fahrenheit,
            kp: 25.0,
            ki: 1088.0,
            kd: 217.0,
            output_window: 100.0,
            smoothing_window_size: 10,
            sensor_cadence: 2.0,
            stale_window_fraction: 0.5,
            thermocouple_offset: 0.0,
            emergency_over_temp: 2264.0,
            segment_complete_tolerance: 5.0,
            rate_deviation_warning: 50.0,
            estimated_max_heating_rate: 500.0,
            estimated_natural_cooling_rate: 180.0,
            kwh_rate: 0.1319,
            kw_elements: 9.46,
            currency: "$".into(),
            automatic_restarts: true,
            resume_freshness_seconds: 60.0,
            seek_start: false,
            profile_dir: "profiles".into(),
            firing_log_dir: "firings".into(),
            state_dir: "state".into(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            class: "sim".into(),
            sensor_path: None,
            relay_path: None,
            fault_path: None,
            sim_heat_rate: 450.0,
            sim_cool_coeff: 1e-4,
            sim_ambient: 21.0,
        }
    }
}

impl KilnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval <= 0. || !self.tick_interval.is_finite() {
            return Err(Error::config("tick_interval must be positive"));
        }
        if self.sensor_cadence <= 0. || !self.sensor_cadence.is_finite() {
            return Err(Error::config("sensor_cadence must be positive"));
        }
        if self.output_window <= 0. {
            return Err(Error::config("output_window must be positive"));
        }
        if self.smoothing_window_size == 0 {
            return Err(Error::config("smoothing_window_size must be at least 1"));
        }
        if !(0. ..=1.).contains(&self.stale_window_fraction) {
            return Err(Error::config("stale_window_fraction must be within 0..1"));
        }
        if self.estimated_max_heating_rate <= 0. || self.estimated_natural_cooling_rate <= 0. {
            return Err(Error::config("rate estimates must be positive"));
        }
        if self.segment_complete_tolerance < 0. {
            return Err(Error::config("segment_complete_tolerance must not be negative"));
        }
        if self.resume_freshness_seconds <= 0. {
            return Err(Error::config("resume_freshness_seconds must be positive"));
        }
        Ok(())
    }

    /// The location of the resume snapshot file.
    pub fn resume_file(&self) -> PathBuf {
        self.state_dir.join("resume.json")
    }
}


pub fn load_config(filename: impl AsRef<Path>) -> Result<KilnConfig> {
    let data = std::fs::read(&filename).map_err(|e| Error::config(e.to_string()))?;
    let obj: KilnConfig = toml::from_slice(&data).map_err(|e| Error::config(e.to_string()))?;
    obj.validate()?;
    Ok(obj)
}
