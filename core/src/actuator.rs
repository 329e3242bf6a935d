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
//! Time-proportional relay actuation.

use std::thread;
use std::time::Duration;
use log::*;

use crate::errors::Result;


/// The relay (or SSR) driving the heating elements.  Commanding the
/// relay must be cheap; the timing lives in `Actuator`.
pub trait HeaterBackend: Send {
    fn set_heat(&mut self, on: bool) -> Result<()>;
}

/// Translates a duty fraction into one contiguous on-then-off pattern
/// per actuation window.  The sole writer of the relay.
pub struct Actuator {
    backend: Box<dyn HeaterBackend>,
    window: f64,
    energised: bool,
}

impl Actuator {
    pub fn new(backend: Box<dyn HeaterBackend>, window: f64) -> Actuator {
        Actuator { backend, window, energised: false }
    }

    /// Energise the relay for `duty * window` seconds, then de-energise.
    /// Blocks for the on-time; returns the seconds the relay was on,
    /// which feeds the cost accounting.
    pub fn apply(&mut self, duty: f64) -> f64 {
        let duty = duty.max(0.).min(1.);
        let on_time = duty * self.window;
        if on_time > 0. {
            self.set(true);
            thread::sleep(Duration::from_secs_f64(on_time));
        }
        if on_time < self.window {
            self.set(false);
        }
        on_time
    }

    /// Force the relay off.  Returns once the command has been issued.
    pub fn shutoff(&mut self) {
        self.set(false);
    }

    pub fn is_energised(&self) -> bool {
        self.energised
    }

    fn set(&mut self, on: bool) {
        match self.backend.set_heat(on) {
            Ok(()) => self.energised = on,
            // keep controlling; the next window tries again
            Err(e) => error!("could not switch relay {}: {}", if on { "on" } else { "off" }, e),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use float_cmp::approx_eq;
    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<bool>>>);

    impl HeaterBackend for Recorder {
        fn set_heat(&mut self, on: bool) -> Result<()> {
            self.0.lock().unwrap().push(on);
            Ok(())
        }
    }

    #[test]
    fn half_duty_is_on_then_off() {
        let rec = Recorder::default();
        let mut act = Actuator::new(Box::new(rec.clone()), 0.02);
        let on_time = act.apply(0.5);
        assert!(approx_eq!(f64, on_time, 0.01));
        assert_eq!(*rec.0.lock().unwrap(), vec![true, false]);
        assert!(!act.is_energised());
    }

    #[test]
    fn zero_duty_ends_off_immediately() {
        let rec = Recorder::default();
        let mut act = Actuator::new(Box::new(rec.clone()), 0.02);
        assert_eq!(act.apply(0.), 0.);
        assert_eq!(*rec.0.lock().unwrap(), vec![false]);
    }

    #[test]
    fn full_duty_stays_energised() {
        let rec = Recorder::default();
        let mut act = Actuator::new(Box::new(rec.clone()), 0.01);
        assert!(approx_eq!(f64, act.apply(1.), 0.01));
        assert_eq!(*rec.0.lock().unwrap(), vec![true]);
        assert!(act.is_energised());
        act.shutoff();
        assert!(!act.is_energised());
    }

    #[test]
    fn duty_is_clamped() {
        let rec = Recorder::default();
        let mut act = Actuator::new(Box::new(rec.clone()), 0.01);
        assert_eq!(act.apply(-3.), 0.);
        assert!(approx_eq!(f64, act.apply(7.), 0.01));
    }
}
