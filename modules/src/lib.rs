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
//! Hardware backend dispatcher.

use std::sync::Arc;

use kiln_core::prelude::*;

pub mod sim;
pub mod sysfs;


/// The backend pair (plus simulator hook) for one kiln.
pub struct Backends {
    pub sensor: Box<dyn SensorBackend>,
    pub heater: Box<dyn HeaterBackend>,
    pub sim: Option<Arc<dyn SimControl>>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Instantiate the backends selected by the hardware config.
pub fn create_backends(hw: &HardwareConfig) -> Result<Backends> {
    match &*hw.class {
        "sim" => {
            let kiln = sim::SimKiln::new(hw);
            Ok(Backends {
                sensor: Box::new(kiln.sensor()),
                heater: Box::new(kiln.heater()),
                sim: Some(Arc::new(kiln.handle())),
            })
        }
        "sysfs" => {
            let input = hw.sensor_path.clone()
                .ok_or_else(|| Error::config("sysfs backend requires sensor_path"))?;
            let relay = hw.relay_path.clone()
                .ok_or_else(|| Error::config("sysfs backend requires relay_path"))?;
            Ok(Backends {
                sensor: Box::new(sysfs::SysfsSensor::new(input, hw.fault_path.clone())),
                heater: Box::new(sysfs::SysfsRelay::new(relay)),
                sim: None,
            })
        }
        other => Err(Error::config(format!("no such hardware class: {}", other)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_dispatch() {
        let hw = HardwareConfig::default();
        assert!(create_backends(&hw).unwrap().sim.is_some());

        let hw = HardwareConfig { class: "sysfs".into(), ..HardwareConfig::default() };
        // missing paths are a config error
        assert_eq!(create_backends(&hw).unwrap_err().kind(), ErrorKind::Config);

        let hw = HardwareConfig { class: "mcu".into(), ..HardwareConfig::default() };
        assert!(create_backends(&hw).is_err());
    }
}
