// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Rendering of mount commands and parsing of poll replies. Reply parsing
// operates on framed replies (see command_class.rs) and writes into a
// MountState that the caller holds under its write lock.

use canonical_error::{internal_error, CanonicalError};

use crate::astro_util::{degree_from_string, format_alt_command,
                        format_az_command, format_dec_command,
                        format_ra_command, jnow_to_j2000};
use crate::command_class::Reply;
use crate::mount_state::{firmware_number, invert_longitude, ModelStar,
                         MountState};

/// Elevation, site, firmware identity.
pub const SLOW_COMMANDS: &str = ":Gev#:Gg#:Gt#:GVD#:GVN#:GVP#:GVT#:GVZ#";
/// Sidereal time and pointing.
pub const FAST_COMMANDS: &str = ":GS#:Ginfo#";
/// Refraction and mount flags.
pub const MEDIUM_COMMANDS: &str = ":GRTMP#:GRPRS#:GREF#:Guaf#:Gdat#:Gh#:Go#";
/// Number of alignment stars and stored model names.
pub const MODEL_COUNT_COMMANDS: &str = ":getalst#:modelcnt#";

pub const TRACKING_ON: &str = ":RT9#:AP#";
pub const STOP: &str = ":STOP#";
pub const NEW_ALIGNMENT: &str = ":newalig#";
pub const END_ALIGNMENT: &str = ":endalig#";
pub const ALIGNMENT_WORKAROUND: &str = ":newalig#:endalig#";
pub const GET_STAR_COUNT: &str = ":getalst#";
pub const SHUTDOWN: &str = ":shutdown#";

/// Sets the alt/az target and slews to it. Reply is three characters; the
/// last is '0' if the slew was accepted.
pub fn slew_alt_az(az: f64, alt: f64) -> String {
    format!(":Sz{}#:Sa{}#:MS#", format_az_command(az), format_alt_command(alt))
}

/// Adds a refinement point at the given JNow position (degrees). The last
/// reply chunk is "V" when the point was accepted.
pub fn point_add(ra_jnow: f64, dec_jnow: f64) -> String {
    format!(":Sr{}#:Sd{}#:CMS#", format_ra_command(ra_jnow),
            format_dec_command(dec_jnow))
}

/// Syncs the mount to the given JNow position without touching the model.
pub fn sync(ra_jnow: f64, dec_jnow: f64) -> String {
    format!(":Sr{}#:Sd{}#:CM#", format_ra_command(ra_jnow),
            format_dec_command(dec_jnow))
}

pub fn save_model(name: &str) -> String {
    format!(":modelsv0{}#", name)
}

pub fn load_model(name: &str) -> String {
    format!(":modelld0{}#", name)
}

pub fn delete_model(name: &str) -> String {
    format!(":modeldel0{}#", name)
}

/// Reads alignment stars 1..=count.
pub fn model_star_commands(count: usize) -> String {
    (1..=count).map(|i| format!(":getalp{}#", i)).collect()
}

/// Reads model names 1..=count.
pub fn model_name_commands(count: usize) -> String {
    (1..=count).map(|i| format!(":modelnam{}#", i)).collect()
}

/// Pushes refraction temperature (Celsius) and pressure (hPa).
pub fn set_refraction(temperature: f64, pressure: f64) -> String {
    format!(":SRTMP{:+06.1}#:SRPRS{:06.1}#", temperature, pressure)
}

fn expect_chunks(reply: &Reply, n: usize, what: &str) -> Result<(), CanonicalError> {
    if reply.chunks.len() != n {
        return Err(internal_error(format!(
            "{} reply has {} chunks, expected {}: {:?}",
            what, reply.chunks.len(), n, reply.raw).as_str()));
    }
    Ok(())
}

fn parse_f64(s: &str, what: &str) -> Result<f64, CanonicalError> {
    s.trim().trim_end_matches('*').parse::<f64>().map_err(|_| {
        internal_error(format!("Cannot parse {} from {:?}", what, s).as_str())
    })
}

fn parse_sexagesimal(s: &str, what: &str) -> Result<f64, CanonicalError> {
    degree_from_string(s).ok_or_else(|| {
        internal_error(format!("Cannot parse {} from {:?}", what, s).as_str())
    })
}

/// Applies the reply to SLOW_COMMANDS.
pub fn parse_slow(reply: &Reply, state: &mut MountState) -> Result<(), CanonicalError> {
    expect_chunks(reply, 8, "Slow poll")?;
    let c = &reply.chunks;
    let elevation = parse_f64(&c[0], "elevation")?;
    let longitude = parse_sexagesimal(&c[1], "longitude")?;
    let latitude = parse_sexagesimal(&c[2], "latitude")?;
    let number = firmware_number(&c[4]).ok_or_else(|| {
        internal_error(format!("Cannot parse firmware version {:?}", c[4]).as_str())
    })?;

    state.site_elevation = elevation;
    state.site_longitude = invert_longitude(longitude);
    state.site_latitude = latitude;
    state.firmware_date = c[3].clone();
    state.firmware_version = c[4].clone();
    state.firmware_number = number;
    state.product_name = c[5].clone();
    state.firmware_time = c[6].clone();
    state.hardware_version = c[7].clone();
    Ok(())
}

/// Applies the reply to FAST_COMMANDS.
pub fn parse_fast(reply: &Reply, state: &mut MountState) -> Result<(), CanonicalError> {
    expect_chunks(reply, 2, "Fast poll")?;
    let lst = reply.chunks[0].clone();
    let lst_hours = parse_sexagesimal(&lst, "sidereal time")?;
    let fields: Vec<&str> = reply.chunks[1].split(',').map(|f| f.trim()).collect();
    if fields.len() != 8 {
        return Err(internal_error(format!(
            "Ginfo reply has {} fields: {:?}", fields.len(), reply.chunks[1]).as_str()));
    }
    let ra_hours = parse_f64(fields[0], "ra")?;
    let dec = parse_f64(fields[1], "dec")?;
    let pier_side = match fields[2] {
        "E" => 'E',
        "W" => 'W',
        other => {
            return Err(internal_error(
                format!("Unexpected pier side {:?}", other).as_str()));
        }
    };
    let azimuth = parse_f64(fields[3], "azimuth")?;
    let altitude = parse_f64(fields[4], "altitude")?;
    let julian_date = parse_f64(fields[5], "julian date")?;
    let status: i32 = fields[6].parse().map_err(|_| {
        internal_error(format!("Cannot parse status from {:?}", fields[6]).as_str())
    })?;
    let slewing = match fields[7] {
        "0" => false,
        "1" => true,
        other => {
            return Err(internal_error(
                format!("Unexpected slew flag {:?}", other).as_str()));
        }
    };

    let ra_jnow = ra_hours * 15.0;
    let (ra_j2000, dec_j2000) = jnow_to_j2000(ra_jnow, dec, julian_date);
    state.local_sidereal_time = lst;
    state.local_sidereal_hours = lst_hours;
    state.ra_jnow = ra_jnow;
    state.dec_jnow = dec;
    state.ra_j2000 = ra_j2000;
    state.dec_j2000 = dec_j2000;
    state.pier_side = pier_side;
    state.azimuth = azimuth;
    state.altitude = altitude;
    state.julian_date = julian_date;
    state.status = status;
    // Status 0 is "tracking".
    state.tracking = status == 0;
    state.slewing = slewing;
    state.fast_cycles += 1;
    Ok(())
}

fn flag(s: &str) -> bool {
    s == "1"
}

/// Applies the reply to MEDIUM_COMMANDS.
pub fn parse_medium(reply: &Reply, state: &mut MountState) -> Result<(), CanonicalError> {
    expect_chunks(reply, 7, "Medium poll")?;
    let c = &reply.chunks;
    let temperature = parse_f64(&c[0], "refraction temperature")?;
    let pressure = parse_f64(&c[1], "refraction pressure")?;
    let limit_high = parse_f64(&c[5], "high limit")?;
    let limit_low = parse_f64(&c[6], "low limit")?;
    state.refraction_temperature = temperature;
    state.refraction_pressure = pressure;
    state.refraction_enabled = flag(&c[2]);
    state.unattended_flip = flag(&c[3]);
    state.dual_axis_tracking = flag(&c[4]);
    state.horizon_limit_high = limit_high;
    state.horizon_limit_low = limit_low;
    Ok(())
}

/// Returns (number of alignment stars, number of stored models) from the
/// reply to MODEL_COUNT_COMMANDS.
pub fn parse_model_counts(reply: &Reply) -> Result<(usize, usize), CanonicalError> {
    expect_chunks(reply, 2, "Model count")?;
    let stars = parse_count(&reply.chunks[0])?;
    let models = parse_count(&reply.chunks[1])?;
    Ok((stars, models))
}

pub fn parse_count(s: &str) -> Result<usize, CanonicalError> {
    s.trim().parse::<usize>().map_err(|_| {
        internal_error(format!("Cannot parse count from {:?}", s).as_str())
    })
}

/// Parses one alignment star line "HH:MM:SS.SS,+DD*MM:SS.S,  EEE.E,PPP".
pub fn parse_model_star(index: usize, line: &str) -> Result<ModelStar, CanonicalError> {
    let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
    if fields.len() != 4 {
        return Err(internal_error(format!(
            "Alignment star {} has {} fields: {:?}", index, fields.len(), line).as_str()));
    }
    Ok(ModelStar {
        index,
        hour_angle: parse_sexagesimal(fields[0], "hour angle")?,
        dec: parse_sexagesimal(fields[1], "declination")?,
        error_arcsec: parse_f64(fields[2], "star error")?,
        error_angle: parse_f64(fields[3], "star error angle")?,
    })
}

/// Parses the reply to model_star_commands(). Lines that fail to parse (the
/// mount answers "E" for missing stars) are skipped with their index kept.
pub fn parse_model_stars(reply: &Reply) -> Vec<ModelStar> {
    reply.chunks.iter().enumerate()
        .filter_map(|(i, line)| parse_model_star(i + 1, line).ok())
        .collect()
}
