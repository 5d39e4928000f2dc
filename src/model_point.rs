// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::Path;

use canonical_error::{failed_precondition_error, invalid_argument_error,
                      CanonicalError};

/// A sky position to visit during a model run. Azimuth is wrapped to
/// [0, 360), altitude clamped to [0, 90].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPoint {
    pub azimuth: f64,
    pub altitude: f64,
    // True until the point has been consumed by a run.
    pub visible: bool,
    // False for points that are visited but not imaged (every other
    // hysteresis point).
    pub solve: bool,
    // Position in the originally generated list.
    pub index: usize,
}

impl ModelPoint {
    pub fn new(index: usize, azimuth: f64, altitude: f64) -> Self {
        ModelPoint {
            azimuth: wrap_azimuth(azimuth),
            altitude: altitude.clamp(0.0, 90.0),
            visible: true,
            solve: true,
            index,
        }
    }
}

pub fn wrap_azimuth(azimuth: f64) -> f64 {
    let wrapped = azimuth.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Renumbers `points` 0..n in list order.
pub fn reindex(points: &mut [ModelPoint]) {
    for (i, p) in points.iter_mut().enumerate() {
        p.index = i;
    }
}

/// Parses "az,alt" or "az:alt" lines. Blank lines and anything after '#'
/// are ignored.
pub fn parse_az_alt_lines(text: &str) -> Result<Vec<(f64, f64)>, CanonicalError> {
    let mut result = Vec::new();
    for (line_number, raw_line) in text.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        }.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split([',', ':']).map(|f| f.trim()).collect();
        let parsed = if fields.len() == 2 {
            match (fields[0].parse::<f64>(), fields[1].parse::<f64>()) {
                (Ok(az), Ok(alt)) => Some((az, alt)),
                _ => None,
            }
        } else {
            None
        };
        match parsed {
            Some(p) => result.push(p),
            None => {
                return Err(invalid_argument_error(format!(
                    "Line {}: expected 'az,alt', got {:?}",
                    line_number + 1, raw_line).as_str()));
            }
        }
    }
    Ok(result)
}

pub fn read_text_file(path: &Path) -> Result<String, CanonicalError> {
    fs::read_to_string(path).map_err(|e| {
        failed_precondition_error(format!("Cannot read {:?}: {}", path, e).as_str())
    })
}

/// Piecewise-linear minimum altitude as a function of azimuth. Between the
/// last and first vertex the boundary wraps through north. An empty mask
/// is the mathematical horizon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HorizonMask {
    // Sorted by azimuth, azimuths in [0, 360).
    vertices: Vec<(f64, f64)>,
}

impl HorizonMask {
    pub fn new(vertices: &[(f64, f64)]) -> Self {
        let mut vertices: Vec<(f64, f64)> = vertices.iter()
            .map(|(az, alt)| (wrap_azimuth(*az), alt.clamp(0.0, 90.0)))
            .collect();
        vertices.sort_by(|a, b| a.0.total_cmp(&b.0));
        HorizonMask { vertices }
    }

    pub fn parse(text: &str) -> Result<Self, CanonicalError> {
        Ok(HorizonMask::new(&parse_az_alt_lines(text)?))
    }

    pub fn from_file(path: &Path) -> Result<Self, CanonicalError> {
        HorizonMask::parse(&read_text_file(path)?)
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    /// Minimum visible altitude at `azimuth`.
    pub fn altitude_at(&self, azimuth: f64) -> f64 {
        let az = wrap_azimuth(azimuth);
        let n = self.vertices.len();
        match n {
            0 => return 0.0,
            1 => return self.vertices[0].1,
            _ => {}
        }
        for i in 0..n - 1 {
            let (az0, alt0) = self.vertices[i];
            let (az1, alt1) = self.vertices[i + 1];
            if az >= az0 && az <= az1 {
                return interpolate(az, az0, alt0, az1, alt1);
            }
        }
        // Wrap segment from the last vertex through 360/0 to the first.
        let (az_last, alt_last) = self.vertices[n - 1];
        let (az_first, alt_first) = self.vertices[0];
        let az_unwrapped = if az < az_first { az + 360.0 } else { az };
        interpolate(az_unwrapped, az_last, alt_last, az_first + 360.0, alt_first)
    }

    pub fn is_visible(&self, azimuth: f64, altitude: f64) -> bool {
        altitude >= self.altitude_at(azimuth)
    }
}

fn interpolate(x: f64, x0: f64, y0: f64, x1: f64, y1: f64) -> f64 {
    if x1 - x0 <= f64::EPSILON {
        return y0.max(y1);
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}
