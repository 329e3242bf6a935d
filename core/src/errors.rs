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
//! Enumeration of possible controller errors.

use std::{error, fmt, result};


pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Internal
    Config,
    Programming,
    Parsing,
    // Command surface
    ProfileInvalid,
    NoSuchProfile,
    IllegalState,
    // Hardware
    SensorShort,
    SensorOpen,
    SensorStale,
    Hardware,
    Timeout,
    // Storage
    Persistence,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn amend(mut self, msg: &str) -> Self {
        self.message = format!("{} ({})", self.message, msg);
        self
    }

    /// The stable error name reported over the command surface.
    pub fn wire_name(&self) -> &'static str {
        use self::ErrorKind::*;
        match self.kind {
            Config | Programming => "internal_error",
            Parsing | ProfileInvalid => "invalid_profile",
            NoSuchProfile => "no_such_profile",
            IllegalState => "illegal_in_current_state",
            SensorShort | SensorOpen | SensorStale => "sensor_fault",
            Hardware | Timeout => "hardware_error",
            Persistence => "persistence_error",
        }
    }

    // Quick construction.

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn programming(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Programming, message: msg.into() }
    }

    pub fn invalid_profile(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::ProfileInvalid, message: msg.into() }
    }

    pub fn no_profile(name: &str) -> Self {
        Self { kind: ErrorKind::NoSuchProfile, message: format!("no profile named {}", name) }
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::IllegalState, message: msg.into() }
    }

    pub fn sensor_short() -> Self {
        Self { kind: ErrorKind::SensorShort, message: "thermocouple short circuit".into() }
    }

    pub fn sensor_open() -> Self {
        Self { kind: ErrorKind::SensorOpen, message: "thermocouple not connected".into() }
    }

    pub fn hardware(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Hardware, message: msg.into() }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Timeout, message: msg.into() }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Persistence, message: msg.into() }
    }
}

/// Allow quick conversion of io::Error in the hardware and storage paths.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::hardware(e.to_string())
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ErrorKind::*;
        let kind = match self.kind {
            Config => "configuration error",
            Programming => "internal error",
            Parsing => "parse error",
            ProfileInvalid => "invalid profile",
            NoSuchProfile => "no such profile",
            IllegalState => "illegal in current state",
            SensorShort => "sensor short",
            SensorOpen => "sensor open",
            SensorStale => "sensor stale",
            Hardware => "hardware error",
            Timeout => "timeout",
            Persistence => "persistence error",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}
