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
//! Temperature acquisition: smoothing, offset correction and fault
//! classification on top of a raw thermocouple backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use crossbeam_channel::tick;
use log::*;
use parking_lot::Mutex;
use mlzutil::time::localtime;

use crate::config::KilnConfig;
use crate::errors::{ErrorKind, Result};
use crate::units::TempUnit;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStatus {
    Ok,
    /// No good reading for a substantial part of a smoothing window.
    Stale,
    /// Thermocouple shorted to a supply rail.
    Short,
    /// Thermocouple circuit open.
    Open,
    /// Raw reading above the emergency limit.
    OverTemp,
}

impl SensorStatus {
    /// Statuses that force an immediate shutoff.
    pub fn is_fatal(self) -> bool {
        matches!(self, SensorStatus::Short | SensorStatus::Open | SensorStatus::OverTemp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorStatus::Ok => "ok",
            SensorStatus::Stale => "stale",
            SensorStatus::Short => "short",
            SensorStatus::Open => "open",
            SensorStatus::OverTemp => "over_temp",
        }
    }
}

/// One classified reading, in the controller's temperature unit.
#[derive(Debug, Clone, Copy)]
pub struct TempSample {
    pub wallclock: f64,
    pub raw: f64,
    pub smoothed: f64,
    pub status: SensorStatus,
}

/// The raw hardware below the acquisition pipeline.  Implementations
/// report degrees Celsius and signal chip-level fault conditions via the
/// `SensorShort`/`SensorOpen` error kinds; any other error counts as a
/// transient read failure.
pub trait SensorBackend: Send {
    fn read_temperature(&mut self) -> Result<f64>;
}

#[derive(Debug, Clone, Copy)]
pub struct SensorSettings {
    pub unit: TempUnit,
    pub offset: f64,
    pub window_size: usize,
    pub cadence: f64,
    pub stale_window_fraction: f64,
    pub over_temp_limit: f64,
}

impl SensorSettings {
    pub fn from_config(cfg: &KilnConfig) -> Self {
        SensorSettings {
            unit: cfg.temperature_unit,
            offset: cfg.thermocouple_offset,
            window_size: cfg.smoothing_window_size,
            cadence: cfg.sensor_cadence,
            stale_window_fraction: cfg.stale_window_fraction,
            over_temp_limit: cfg.emergency_over_temp,
        }
    }
}

struct Acquisition {
    backend: Box<dyn SensorBackend>,
    settings: SensorSettings,
    window: VecDeque<f64>,
    last_ok: f64,
    shared: Arc<Mutex<TempSample>>,
}

fn median(window: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = window.iter().cloned().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("no NaN in window"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.
    } else {
        sorted[mid]
    }
}

impl Acquisition {
    /// Take and classify one reading.  Never propagates backend errors;
    /// on failure the previous smoothed value stays in place.
    fn sample_once(&mut self, now: f64) {
        match self.backend.read_temperature() {
            Ok(raw_c) => {
                let raw = TempUnit::Celsius.convert_value(self.settings.unit, raw_c) +
                    self.settings.offset;
                self.window.push_back(raw);
                if self.window.len() > self.settings.window_size {
                    self.window.pop_front();
                }
                let smoothed = if self.window.len() >= self.settings.window_size {
                    median(&self.window)
                } else {
                    // window not filled yet: average what we have
                    self.window.iter().sum::<f64>() / self.window.len() as f64
                };
                let status = if raw > self.settings.over_temp_limit {
                    SensorStatus::OverTemp
                } else {
                    SensorStatus::Ok
                };
                self.last_ok = now;
                *self.shared.lock() = TempSample { wallclock: now, raw, smoothed, status };
            }
            Err(e) => {
                let mut shared = self.shared.lock();
                match e.kind() {
                    ErrorKind::SensorShort => {
                        warn!("sensor fault: {}", e);
                        shared.status = SensorStatus::Short;
                    }
                    ErrorKind::SensorOpen => {
                        warn!("sensor fault: {}", e);
                        shared.status = SensorStatus::Open;
                    }
                    _ => {
                        debug!("sensor read failed: {}", e);
                        let span = self.settings.window_size as f64 * self.settings.cadence;
                        if now - self.last_ok > self.settings.stale_window_fraction * span {
                            shared.status = SensorStatus::Stale;
                        }
                    }
                }
            }
        }
    }

    fn run(mut self) {
        mlzlog::set_thread_prefix("[sensor] ");
        self.sample_once(localtime());
        let ticker = tick(Duration::from_secs_f64(self.settings.cadence));
        for _ in ticker {
            self.sample_once(localtime());
        }
    }
}

/// Read-through handle to the latest classified sample.  The acquisition
/// thread is the only writer.
pub struct TempSensor {
    shared: Arc<Mutex<TempSample>>,
}

impl TempSensor {
    pub fn start(backend: Box<dyn SensorBackend>, settings: SensorSettings) -> TempSensor {
        let now = localtime();
        let shared = Arc::new(Mutex::new(TempSample {
            wallclock: now, raw: 0., smoothed: 0., status: SensorStatus::Stale,
        }));
        let acq = Acquisition {
            backend, settings,
            window: VecDeque::with_capacity(settings.window_size + 1),
            last_ok: now,
            shared: Arc::clone(&shared),
        };
        thread::Builder::new().name("sensor".into())
            .spawn(move || acq.run())
            .expect("could not start sensor thread");
        TempSensor { shared }
    }

    pub fn latest(&self) -> TempSample {
        *self.shared.lock()
    }

    /// Wait up to `timeout` seconds for a good reading.
    pub fn wait_for_reading(&self, timeout: f64) -> Option<TempSample> {
        let deadline = localtime() + timeout;
        loop {
            let sample = self.latest();
            if sample.status == SensorStatus::Ok {
                return Some(sample);
            }
            if localtime() > deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}


#[cfg(test)]
mod tests {
    use float_cmp::approx_eq;
    use super::*;
    use crate::errors::Error;

    struct Script(Vec<Result<f64>>);

    impl SensorBackend for Script {
        fn read_temperature(&mut self) -> Result<f64> {
            self.0.remove(0)
        }
    }

    fn acquisition(script: Vec<Result<f64>>, settings: SensorSettings) -> Acquisition {
        Acquisition {
            backend: Box::new(Script(script)),
            settings,
            window: VecDeque::new(),
            last_ok: 0.,
            shared: Arc::new(Mutex::new(TempSample {
                wallclock: 0., raw: 0., smoothed: 0., status: SensorStatus::Stale,
            })),
        }
    }

    fn settings() -> SensorSettings {
        SensorSettings {
            unit: TempUnit::Celsius,
            offset: 0.,
            window_size: 4,
            cadence: 1.,
            stale_window_fraction: 0.5,
            over_temp_limit: 1240.,
        }
    }

    #[test]
    fn smoothing_fills_then_takes_median() {
        let mut acq = acquisition(
            vec![Ok(10.), Ok(12.), Ok(11.), Ok(13.), Ok(100.)], settings());
        acq.sample_once(0.);
        assert!(approx_eq!(f64, acq.shared.lock().smoothed, 10.));
        acq.sample_once(1.);
        assert!(approx_eq!(f64, acq.shared.lock().smoothed, 11.));
        acq.sample_once(2.);
        acq.sample_once(3.);
        // full window: median of 10, 11, 12, 13
        assert!(approx_eq!(f64, acq.shared.lock().smoothed, 11.5));
        // a single outlier barely moves the median
        acq.sample_once(4.);
        assert!(approx_eq!(f64, acq.shared.lock().smoothed, 12.5));
        assert_eq!(acq.shared.lock().status, SensorStatus::Ok);
    }

    #[test]
    fn offset_applies_after_conversion() {
        let mut s = settings();
        s.unit = TempUnit::Fahrenheit;
        s.offset = 5.;
        s.over_temp_limit = 2264.;
        let mut acq = acquisition(vec![Ok(100.)], s);
        acq.sample_once(0.);
        assert!(approx_eq!(f64, acq.shared.lock().raw, 217.));
    }

    #[test]
    fn transient_failures_keep_last_value() {
        let mut acq = acquisition(
            vec![Ok(500.), Err(Error::timeout("spi")), Err(Error::timeout("spi")),
                 Err(Error::timeout("spi"))],
            settings());
        acq.sample_once(0.);
        acq.sample_once(1.);
        // still fresh enough
        let sample = acq.shared.lock().clone();
        assert_eq!(sample.status, SensorStatus::Ok);
        assert!(approx_eq!(f64, sample.smoothed, 500.));
        // window is 4 s, fraction 0.5: stale after 2 s without a reading
        acq.sample_once(2.5);
        assert_eq!(acq.shared.lock().status, SensorStatus::Stale);
        // the value itself is retained
        assert!(approx_eq!(f64, acq.shared.lock().smoothed, 500.));
    }

    #[test]
    fn chip_faults_are_fatal() {
        let mut acq = acquisition(vec![Err(Error::sensor_short())], settings());
        acq.sample_once(0.);
        assert_eq!(acq.shared.lock().status, SensorStatus::Short);
        assert!(acq.shared.lock().status.is_fatal());

        let mut acq = acquisition(vec![Err(Error::sensor_open())], settings());
        acq.sample_once(0.);
        assert_eq!(acq.shared.lock().status, SensorStatus::Open);
    }

    #[test]
    fn over_temperature_uses_raw_reading() {
        let mut acq = acquisition(vec![Ok(100.), Ok(1300.)], settings());
        acq.sample_once(0.);
        acq.sample_once(1.);
        // the median is still harmless, the raw value is not
        assert_eq!(acq.shared.lock().status, SensorStatus::OverTemp);
    }
}
