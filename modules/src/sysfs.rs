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
//! Sysfs-backed hardware: an hwmon-style temperature input and a GPIO
//! value file for the relay.  The thermocouple converter chip itself is
//! someone else's driver; we only consume what the kernel exposes.

use std::fs;
use std::path::PathBuf;

use kiln_core::prelude::*;


pub struct SysfsSensor {
    input: PathBuf,
    fault: Option<PathBuf>,
}

impl SysfsSensor {
    pub fn new(input: PathBuf, fault: Option<PathBuf>) -> SysfsSensor {
        SysfsSensor { input, fault }
    }
}

impl SensorBackend for SysfsSensor {
    fn read_temperature(&mut self) -> Result<f64> {
        if let Some(fault_path) = &self.fault {
            let flag = fs::read_to_string(fault_path)
                .map_err(|e| Error::hardware(format!("reading fault flag: {}", e)))?;
            if !matches!(flag.trim(), "" | "0") {
                return Err(Error::sensor_open());
            }
        }
        let raw = fs::read_to_string(&self.input)
            .map_err(|e| Error::hardware(format!("reading {:?}: {}", self.input, e)))?;
        // hwmon convention: millidegrees Celsius
        let milli: f64 = raw.trim().parse()
            .map_err(|_| Error::hardware(format!("unparseable reading {:?}", raw.trim())))?;
        Ok(milli / 1000.)
    }
}

pub struct SysfsRelay {
    value: PathBuf,
}

impl SysfsRelay {
    pub fn new(value: PathBuf) -> SysfsRelay {
        SysfsRelay { value }
    }
}

impl HeaterBackend for SysfsRelay {
    fn set_heat(&mut self, on: bool) -> Result<()> {
        fs::write(&self.value, if on { "1\n" } else { "0\n" })
            .map_err(|e| Error::hardware(format!("writing {:?}: {}", self.value, e)))
    }
}
