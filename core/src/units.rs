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
//! Temperature unit handling.

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};


/// The unit all temperatures of a profile or of the controller are
/// expressed in.  Rates tagged `MAX`/`COOL` are unit agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempUnit {
    #[serde(rename = "c")]
    Celsius,
    #[serde(rename = "f")]
    Fahrenheit,
}

impl TempUnit {
    pub fn parse(s: &str) -> Result<TempUnit> {
        match &*s.to_lowercase() {
            "c" | "celsius" => Ok(TempUnit::Celsius),
            "f" | "fahrenheit" => Ok(TempUnit::Fahrenheit),
            _ => Err(Error::invalid_profile(format!("unknown temperature unit {:?}", s)))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TempUnit::Celsius => "c",
            TempUnit::Fahrenheit => "f",
        }
    }

    /// Convert an absolute temperature from `self` into `other`.
    pub fn convert_value(self, other: TempUnit, value: f64) -> f64 {
        match (self, other) {
            (TempUnit::Celsius, TempUnit::Fahrenheit) => value * 9./5. + 32.,
            (TempUnit::Fahrenheit, TempUnit::Celsius) => (value - 32.) * 5./9.,
            _ => value,
        }
    }

    /// Convert a temperature rate (degrees per time) from `self` into `other`.
    pub fn convert_rate(self, other: TempUnit, rate: f64) -> f64 {
        match (self, other) {
            (TempUnit::Celsius, TempUnit::Fahrenheit) => rate * 9./5.,
            (TempUnit::Fahrenheit, TempUnit::Celsius) => rate * 5./9.,
            _ => rate,
        }
    }
}

impl Default for TempUnit {
    fn default() -> Self { TempUnit::Fahrenheit }
}
