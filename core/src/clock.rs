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
//! Conversions between the float wallclock used by the control loop and
//! the string timestamps used in files.

use lazy_static::lazy_static;
use time::OffsetDateTime;
use time::format_description::{self, well_known::Rfc3339, FormatItem};

use crate::errors::{Error, Result};

lazy_static! {
    static ref FILE_STAMP: Vec<FormatItem<'static>> = format_description::parse(
        "[year]-[month]-[day]_[hour]-[minute]-[second]").expect("valid format");
}

fn datetime(wallclock: f64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos((wallclock * 1e9) as i128)
        .map_err(|e| Error::programming(format!("timestamp out of range: {}", e)))
}

/// Format a float wallclock as an ISO-8601 (RFC 3339) UTC timestamp.
pub fn to_rfc3339(wallclock: f64) -> String {
    datetime(wallclock).ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{:.3}", wallclock))
}

/// Parse an ISO-8601 timestamp back into a float wallclock.
pub fn parse_rfc3339(stamp: &str) -> Result<f64> {
    let dt = OffsetDateTime::parse(stamp, &Rfc3339)
        .map_err(|e| Error::new(crate::errors::ErrorKind::Parsing,
                                format!("invalid timestamp {:?}: {}", stamp, e)))?;
    Ok(dt.unix_timestamp_nanos() as f64 / 1e9)
}

/// Format a float wallclock as `YYYY-MM-DD_HH-MM-SS` for file names.
pub fn file_stamp(wallclock: f64) -> String {
    datetime(wallclock).ok()
        .and_then(|dt| dt.format(&*FILE_STAMP).ok())
        .unwrap_or_else(|| format!("{:.0}", wallclock))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip() {
        let t = 1722513600.25;
        let stamp = to_rfc3339(t);
        assert!(stamp.ends_with('Z'));
        let back = parse_rfc3339(&stamp).unwrap();
        assert!((back - t).abs() < 1e-3);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_rfc3339("yesterday").is_err());
    }

    #[test]
    fn stamp_shape() {
        // 2024-08-01T12:00:00Z
        let stamp = file_stamp(1722513600.0);
        assert_eq!(stamp, "2024-08-01_12-00-00");
    }
}
