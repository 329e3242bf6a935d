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
//! Simulated kiln backend.

use std::sync::Arc;
use log::*;
use mlzutil::time::localtime;
use parking_lot::Mutex;

use kiln_core::prelude::*;


/// Fault conditions the simulator can play back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    Short,
    Open,
    Timeout,
}

struct SimVars {
    /// Kiln temperature in °C.
    temp: f64,
    heater_on: bool,
    fault: Option<SimFault>,
    last_step: f64,
}

/// A lumped thermal model of a kiln: constant-power heating from the
/// elements, Newtonian loss towards ambient.  The model is stepped by
/// wallclock whenever the sensor reads it, so the acquisition cadence is
/// also the simulation cadence.
pub struct SimKiln {
    vars: Arc<Mutex<SimVars>>,
    heat_rate: f64,
    cool_coeff: f64,
    ambient: f64,
}

impl SimKiln {
    pub fn new(hw: &HardwareConfig) -> SimKiln {
        SimKiln {
            vars: Arc::new(Mutex::new(SimVars {
                temp: hw.sim_ambient,
                heater_on: false,
                fault: None,
                last_step: localtime(),
            })),
            heat_rate: hw.sim_heat_rate,
            cool_coeff: hw.sim_cool_coeff,
            ambient: hw.sim_ambient,
        }
    }

    pub fn sensor(&self) -> SimSensor {
        SimSensor {
            vars: Arc::clone(&self.vars),
            heat_rate: self.heat_rate,
            cool_coeff: self.cool_coeff,
            ambient: self.ambient,
        }
    }

    pub fn heater(&self) -> SimHeater {
        SimHeater { vars: Arc::clone(&self.vars) }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle { vars: Arc::clone(&self.vars) }
    }
}

pub struct SimSensor {
    vars: Arc<Mutex<SimVars>>,
    heat_rate: f64,
    cool_coeff: f64,
    ambient: f64,
}

impl SimSensor {
    fn step(&self, vars: &mut SimVars, now: f64) {
        // clamp dt so a long gap does not teleport the model
        let dt = (now - vars.last_step).max(0.).min(60.);
        let heating = if vars.heater_on { self.heat_rate / 3600. * dt } else { 0. };
        let cooling = self.cool_coeff * (vars.temp - self.ambient) * dt;
        vars.temp += heating - cooling;
        vars.last_step = now;
    }
}

impl SensorBackend for SimSensor {
    fn read_temperature(&mut self) -> Result<f64> {
        let mut vars = self.vars.lock();
        if let Some(fault) = vars.fault {
            return Err(match fault {
                SimFault::Short => Error::sensor_short(),
                SimFault::Open => Error::sensor_open(),
                SimFault::Timeout => Error::timeout("simulated SPI timeout"),
            });
        }
        let now = localtime();
        self.step(&mut vars, now);
        Ok(vars.temp)
    }
}

pub struct SimHeater {
    vars: Arc<Mutex<SimVars>>,
}

impl HeaterBackend for SimHeater {
    fn set_heat(&mut self, on: bool) -> Result<()> {
        let mut vars = self.vars.lock();
        if vars.heater_on != on {
            debug!("simulated relay {}", if on { "on" } else { "off" });
        }
        vars.heater_on = on;
        Ok(())
    }
}

/// Control hook for the simulator-only command surface and for tests.
#[derive(Clone)]
pub struct SimHandle {
    vars: Arc<Mutex<SimVars>>,
}

impl SimHandle {
    pub fn inject_fault(&self, fault: Option<SimFault>) {
        self.vars.lock().fault = fault;
    }

    pub fn temperature(&self) -> f64 {
        self.vars.lock().temp
    }

    pub fn heater_on(&self) -> bool {
        self.vars.lock().heater_on
    }
}

impl SimControl for SimHandle {
    fn set_temperature(&self, celsius: f64) {
        info!("simulated temperature forced to {:.1}°C", celsius);
        let mut vars = self.vars.lock();
        vars.temp = celsius;
        vars.last_step = localtime();
    }
}
