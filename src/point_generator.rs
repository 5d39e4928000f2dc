// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Model point list generation. Everything here is a pure function of its
// inputs; nothing talks to the mount or the camera.

use std::path::Path;
use std::time::{Duration, SystemTime};

use canonical_error::{invalid_argument_error, CanonicalError};

use crate::astro_util::{alt_az_from_equatorial, j2000_to_jnow,
                        julian_date_from_system_time};
use crate::model_point::{parse_az_alt_lines, read_text_file, reindex,
                         HorizonMask, ModelPoint};

/// Observer location, degrees, longitude positive east.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Site {
    pub latitude: f64,
    pub longitude: f64,
}

/// Extra cost, in degrees of travel, of moving between the east and west
/// halves of the sky. Larger than any move within one half.
const MERIDIAN_PENALTY: f64 = 360.0;

/// Drops points below `horizon`.
pub fn filter_below_horizon(points: Vec<ModelPoint>, horizon: &HorizonMask)
                            -> Vec<ModelPoint> {
    points.into_iter()
        .filter(|p| horizon.is_visible(p.azimuth, p.altitude))
        .collect()
}

fn finish(mut points: Vec<ModelPoint>, delete_below_horizon: bool, sort: bool,
          horizon: &HorizonMask) -> Vec<ModelPoint> {
    if delete_below_horizon {
        points = filter_below_horizon(points, horizon);
    }
    if sort {
        points = sort_points(points);
    }
    reindex(&mut points);
    points
}

/// Points along the path of a J2000 target across the sky. The path starts
/// `preview_hours` from `now` and covers `hours_span` hours. Positions below
/// the mathematical horizon are always dropped.
#[allow(clippy::too_many_arguments)]
pub fn generate_dso(sort: bool, hours_span: f64, num_points: usize,
                    preview_hours: f64, target_ra: f64, target_dec: f64,
                    site: &Site, now: SystemTime, delete_below_horizon: bool,
                    horizon: &HorizonMask) -> Result<Vec<ModelPoint>, CanonicalError> {
    if num_points == 0 || !hours_span.is_finite() || hours_span < 0.0 ||
        !preview_hours.is_finite() {
        return Err(invalid_argument_error(format!(
            "Bad DSO path: {} points over {} hours", num_points, hours_span).as_str()));
    }
    let start = offset_time(now, preview_hours);
    let mut points = Vec::with_capacity(num_points);
    for i in 0..num_points {
        let hours = if num_points > 1 {
            hours_span * i as f64 / (num_points - 1) as f64
        } else {
            0.0
        };
        let time = offset_time(start, hours);
        let jd = julian_date_from_system_time(&time);
        let (ra, dec) = j2000_to_jnow(target_ra, target_dec, jd);
        let (alt, az, _ha) = alt_az_from_equatorial(
            ra.to_radians(), dec.to_radians(),
            site.latitude.to_radians(), site.longitude.to_radians(), &time);
        let (alt, az) = (alt.to_degrees(), az.to_degrees());
        if alt < 0.0 {
            continue;
        }
        points.push(ModelPoint::new(i, az, alt));
    }
    Ok(finish(points, delete_below_horizon, sort, horizon))
}

fn offset_time(time: SystemTime, hours: f64) -> SystemTime {
    let Ok(offset) = Duration::try_from_secs_f64(hours.abs() * 3600.0) else {
        return time;
    };
    if hours >= 0.0 {
        time.checked_add(offset).unwrap_or(time)
    } else {
        time.checked_sub(offset).unwrap_or(time)
    }
}

/// `rows` x `cols` grid between `alt_min` and `alt_max`. Every other row is
/// offset by half a column and traversed in reverse.
pub fn generate_grid(delete_below_horizon: bool, sort: bool, rows: usize,
                     cols: usize, alt_min: f64, alt_max: f64,
                     horizon: &HorizonMask) -> Result<Vec<ModelPoint>, CanonicalError> {
    if rows == 0 || cols == 0 || alt_min > alt_max ||
        alt_min < 0.0 || alt_max > 90.0 {
        return Err(invalid_argument_error(format!(
            "Bad grid: {}x{} between {} and {}", rows, cols, alt_min, alt_max).as_str()));
    }
    let rows_spec: Vec<(f64, usize)> = (0..rows)
        .map(|r| {
            let alt = if rows > 1 {
                alt_min + (alt_max - alt_min) * r as f64 / (rows - 1) as f64
            } else {
                (alt_min + alt_max) / 2.0
            };
            (alt, cols)
        })
        .collect();
    Ok(finish(rings(&rows_spec), delete_below_horizon, sort, horizon))
}

// One ring of points per (altitude, count) entry, alternating direction.
fn rings(rows: &[(f64, usize)]) -> Vec<ModelPoint> {
    let mut points = Vec::new();
    for (r, (alt, count)) in rows.iter().enumerate() {
        let step = 360.0 / *count as f64;
        let offset = if r % 2 == 1 { step / 2.0 } else { 0.0 };
        let mut row: Vec<ModelPoint> = (0..*count)
            .map(|c| ModelPoint::new(0, offset + step * c as f64, *alt))
            .collect();
        if r % 2 == 1 {
            row.reverse();
        }
        points.extend(row);
    }
    reindex(&mut points);
    points
}

/// `count` points at one altitude, evenly spaced in azimuth starting at `az`.
/// The default three-point base model is generate_base(az, alt, 3).
pub fn generate_base(az: f64, alt: f64, count: usize) -> Vec<ModelPoint> {
    let step = if count > 0 { 360.0 / count as f64 } else { 0.0 };
    (0..count)
        .map(|i| ModelPoint::new(i, az + step * i as f64, alt))
        .collect()
}

pub fn generate_normal(delete_below_horizon: bool, sort: bool,
                       horizon: &HorizonMask) -> Vec<ModelPoint> {
    let rows = [(30.0, 15), (50.0, 12), (70.0, 8)];
    finish(rings(&rows), delete_below_horizon, sort, horizon)
}

pub fn generate_min(delete_below_horizon: bool, sort: bool,
                    horizon: &HorizonMask) -> Vec<ModelPoint> {
    let rows = [(35.0, 5), (60.0, 5)];
    finish(rings(&rows), delete_below_horizon, sort, horizon)
}

pub fn generate_max(delete_below_horizon: bool, sort: bool,
                    horizon: &HorizonMask) -> Vec<ModelPoint> {
    let rows = [(25.0, 12), (40.0, 12), (55.0, 12), (70.0, 12)];
    finish(rings(&rows), delete_below_horizon, sort, horizon)
}

/// Reads a point list of "az,alt" (or "az:alt") lines.
pub fn load_from_file(path: &Path) -> Result<Vec<ModelPoint>, CanonicalError> {
    let points: Vec<ModelPoint> = parse_az_alt_lines(&read_text_file(path)?)?
        .into_iter()
        .enumerate()
        .map(|(i, (az, alt))| ModelPoint::new(i, az, alt))
        .collect();
    Ok(points)
}

fn east_side(p: &ModelPoint) -> bool {
    p.azimuth < 180.0
}

fn travel_cost(a: &ModelPoint, b: &ModelPoint) -> f64 {
    let daz = (a.azimuth - b.azimuth).abs();
    let daz = daz.min(360.0 - daz);
    let dalt = a.altitude - b.altitude;
    let penalty = if east_side(a) != east_side(b) { MERIDIAN_PENALTY } else { 0.0 };
    daz.hypot(dalt) + penalty
}

/// Greedy nearest-neighbour ordering starting from the lowest-azimuth point.
/// Crossing the meridian is penalised, so each side of the sky is finished
/// before the mount flips.
pub fn sort_points(points: Vec<ModelPoint>) -> Vec<ModelPoint> {
    let mut remaining = points;
    let mut sorted = Vec::with_capacity(remaining.len());
    let Some(start) = remaining.iter().enumerate()
        .min_by(|a, b| a.1.azimuth.total_cmp(&b.1.azimuth))
        .map(|(i, _)| i) else {
        return sorted;
    };
    sorted.push(remaining.swap_remove(start));
    while !remaining.is_empty() {
        let current = sorted[sorted.len() - 1];
        let next = remaining.iter().enumerate()
            .min_by(|a, b| travel_cost(&current, a.1).total_cmp(&travel_cost(&current, b.1)))
            .map(|(i, _)| i)
            .unwrap_or(0);
        sorted.push(remaining.swap_remove(next));
    }
    sorted
}
