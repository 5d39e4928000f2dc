// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f64::consts::PI;
use std::time::SystemTime;

use astro::angle::limit_to_two_PI;
use astro::coords::{alt_frm_eq, az_frm_eq};
use astro::precess::precess_eq_coords;
use astro::time::{julian_day, mn_sidr, CalType, Date};
use chrono::{DateTime, Datelike, Timelike, Utc};

const JD_J2000: f64 = 2451545.0;
const JD_UNIX_EPOCH: f64 = 2440587.5;

/// Julian date of the given instant.
pub fn julian_date_from_system_time(time: &SystemTime) -> f64 {
    let unix_seconds = match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    };
    JD_UNIX_EPOCH + unix_seconds / 86400.0
}

/// Precesses J2000 ra/dec (degrees) to the equinox of date given by `jd`.
/// Right ascension comes back in 0..360.
pub fn j2000_to_jnow(ra: f64, dec: f64, jd: f64) -> (f64, f64) {
    let (ra, dec) = precess_eq_coords(ra.to_radians(), dec.to_radians(), JD_J2000, jd);
    (limit_to_two_PI(ra).to_degrees(), dec.to_degrees())
}

/// Inverse of j2000_to_jnow().
pub fn jnow_to_j2000(ra: f64, dec: f64, jd: f64) -> (f64, f64) {
    // precess_eq_coords() is only right when starting from J2000 (it has the
    // wrong sign on the 0.8533T term), so apply the transpose of the J2000 to
    // jd rotation instead of calling it with the epochs swapped.
    let columns = [
        unit_vector_from_equatorial(j2000_to_jnow(0.0, 0.0, jd)),
        unit_vector_from_equatorial(j2000_to_jnow(90.0, 0.0, jd)),
        unit_vector_from_equatorial(j2000_to_jnow(0.0, 90.0, jd)),
    ];
    let v = unit_vector_from_equatorial((ra, dec));
    let rotated = columns.map(|c| c[0] * v[0] + c[1] * v[1] + c[2] * v[2]);
    equatorial_from_unit_vector(rotated)
}

fn unit_vector_from_equatorial((ra, dec): (f64, f64)) -> [f64; 3] {
    let (ra, dec) = (ra.to_radians(), dec.to_radians());
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

fn equatorial_from_unit_vector(v: [f64; 3]) -> (f64, f64) {
    let dec = v[2].clamp(-1.0, 1.0).asin();
    let ra = limit_to_two_PI(v[1].atan2(v[0]));
    (ra.to_degrees(), dec.to_degrees())
}

/// Returns (ra_error, dec_error, total_error) in arcseconds for a commanded
/// and a solved position, all in degrees.
pub fn residual_arcsec(commanded_ra: f64, commanded_dec: f64,
                       solved_ra: f64, solved_dec: f64) -> (f64, f64, f64) {
    let ra_error = (solved_ra - commanded_ra) * 3600.0;
    let dec_error = (solved_dec - commanded_dec) * 3600.0;
    (ra_error, dec_error, ra_error.hypot(dec_error))
}

/// Returns (alt, az, ha) in radians. Returned azimuth is clockwise from north.
/// Returned hour angle is -PI..PI.
/// ra: right ascension in radians.
/// dec: declination in radians.
/// lat: observer latitude in radians.
/// long: observer longitude in radians, positive east.
pub fn alt_az_from_equatorial(
    ra: f64,
    dec: f64,
    lat: f64,
    long: f64,
    time: &SystemTime,
) -> (/* alt */ f64, /* az */ f64, /* ha */ f64) {
    let gmst = greenwich_mean_sidereal_time_from_system_time(time);

    // Note that astro::coords::hr_angl_frm_observer_long() has a bug.
    // Fortunately the correct relation is trivial.
    let hour_angle = gmst + long - ra;

    let meeus_az = az_frm_eq(hour_angle, dec, lat);
    let az = limit_to_two_PI(meeus_az + PI);
    let mut ha = limit_to_two_PI(hour_angle);
    if ha > PI {
        ha -= 2.0 * PI;
    }

    (alt_frm_eq(hour_angle, dec, lat), az, ha)
}

fn greenwich_mean_sidereal_time_from_system_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64,
        cal_type: CalType::Gregorian,
    };
    let jd = julian_day(&date);

    let utc_hours = dt_utc.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours =
        mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;

    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// Parses a three-field sexagesimal value such as "+48:07:00.0",
/// "-011:35:00.0", "13:15:35.68" or "+45*30:10.5". The first field carries
/// the optional sign; the fields may be separated by ':' or '*'. Returns None
/// unless there are exactly three fields.
pub fn degree_from_string(s: &str) -> Option<f64> {
    let s = s.trim();
    let (negative, body) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let fields: Vec<&str> = body.split([':', '*']).collect();
    if fields.len() != 3 {
        return None;
    }
    if fields.iter().any(|f| f.is_empty()) {
        return None;
    }
    let degrees: u32 = fields[0].parse().ok()?;
    let minutes: u32 = fields[1].parse().ok()?;
    let seconds: f64 = fields[2].parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let value = degrees as f64 + minutes as f64 / 60.0 + seconds / 3600.0;
    Some(if negative { -value } else { value })
}

// Splits |value| into (whole, minutes, tenth-seconds...) with carry. `scale`
// is the number of sub-second units per second.
fn split_sexagesimal(value: f64, scale: i64) -> (i64, i64, i64) {
    let units_per_minute = 60 * scale;
    let units_per_whole = 60 * units_per_minute;
    let total = (value.abs() * units_per_whole as f64).round() as i64;
    let whole = total / units_per_whole;
    let rem = total % units_per_whole;
    (whole, rem / units_per_minute, rem % units_per_minute)
}

/// Formats as "sDD:MM:SS.S"; inverse of degree_from_string() for values
/// produced in this form.
pub fn string_from_degree(value: f64) -> String {
    let sign = if value < 0.0 { '-' } else { '+' };
    let (d, m, s) = split_sexagesimal(value, 10);
    format!("{}{:02}:{:02}:{:02}.{}", sign, d, m, s / 10, s % 10)
}

/// Mount target right ascension argument "HH:MM:SS.SS" from degrees.
pub fn format_ra_command(ra: f64) -> String {
    let hours = ra.rem_euclid(360.0) / 15.0;
    let (mut h, m, s) = split_sexagesimal(hours, 100);
    if h >= 24 {
        h -= 24;
    }
    format!("{:02}:{:02}:{:02}.{:02}", h, m, s / 100, s % 100)
}

/// Mount target declination argument "sDD*MM:SS.S" from degrees.
pub fn format_dec_command(dec: f64) -> String {
    let dec = dec.clamp(-90.0, 90.0);
    let sign = if dec < 0.0 { '-' } else { '+' };
    let (d, m, s) = split_sexagesimal(dec, 10);
    format!("{}{:02}*{:02}:{:02}.{}", sign, d, m, s / 10, s % 10)
}

/// Mount target azimuth argument "DDD*MM".
pub fn format_az_command(az: f64) -> String {
    let minutes = (az.rem_euclid(360.0) * 60.0).round() as i64 % (360 * 60);
    format!("{:03}*{:02}", minutes / 60, minutes % 60)
}

/// Mount target altitude argument "sDD*MM".
pub fn format_alt_command(alt: f64) -> String {
    let alt = alt.clamp(-90.0, 90.0);
    let sign = if alt < 0.0 { '-' } else { '+' };
    let minutes = (alt.abs() * 60.0).round() as i64;
    format!("{}{:02}*{:02}", sign, minutes / 60, minutes % 60)
}

/// FITS OBJCTRA style "HH MM SS.SS" from degrees.
pub fn fits_ra_string(ra: f64) -> String {
    format_ra_command(ra).replace(':', " ")
}

/// FITS OBJCTDEC style "sDD MM SS.S" from degrees.
pub fn fits_dec_string(dec: f64) -> String {
    format_dec_command(dec).replace(['*', ':'], " ")
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::time::Duration;

    use approx::assert_abs_diff_eq;
    use astro::angle::{deg_frm_dms, deg_frm_hms};
    use chrono::{FixedOffset, TimeZone};
    use rand::Rng;

    use super::*;

    #[test]
    fn test_degree_from_string() {
        assert_abs_diff_eq!(degree_from_string("+48:07:00.0").unwrap(),
                            48.116666, epsilon = 0.00001);
        assert_abs_diff_eq!(degree_from_string("-011:35:00.0").unwrap(),
                            -11.583333, epsilon = 0.00001);
        assert_abs_diff_eq!(degree_from_string("13:15:35.68").unwrap(),
                            13.259911, epsilon = 0.00001);
        assert_abs_diff_eq!(degree_from_string("+45*30:00.0").unwrap(),
                            45.5, epsilon = 0.00001);
        assert_abs_diff_eq!(degree_from_string("-00:30:00").unwrap(),
                            -0.5, epsilon = 0.00001);
    }

    #[test]
    fn test_degree_from_string_malformed() {
        assert_eq!(degree_from_string(""), None);
        assert_eq!(degree_from_string("12:45"), None);
        assert_eq!(degree_from_string("12:45:33:01.01"), None);
        assert_eq!(degree_from_string("12::33"), None);
        assert_eq!(degree_from_string("ab:45:33"), None);
        assert_eq!(degree_from_string("12:75:33"), None);
        assert_eq!(degree_from_string("+"), None);
    }

    #[test]
    fn test_sexagesimal_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let value: f64 = rng.gen_range(-180.0..=180.0);
            let s = string_from_degree(value);
            let parsed = degree_from_string(&s).unwrap();
            assert_eq!(string_from_degree(parsed), s);
        }
        assert_eq!(string_from_degree(degree_from_string("+12:45:33.1").unwrap()),
                   "+12:45:33.1");
        assert_eq!(string_from_degree(degree_from_string("-179:59:59.9").unwrap()),
                   "-179:59:59.9");
    }

    #[test]
    fn test_command_formats() {
        assert_eq!(format_az_command(123.5), "123*30");
        assert_eq!(format_az_command(359.999), "000*00");
        assert_eq!(format_az_command(-10.0), "350*00");
        assert_eq!(format_alt_command(45.25), "+45*15");
        assert_eq!(format_alt_command(-3.5), "-03*30");
        assert_eq!(format_ra_command(15.0), "01:00:00.00");
        assert_eq!(format_ra_command(359.9999999), "00:00:00.00");
        assert_eq!(format_dec_command(-15.5), "-15*30:00.0");
        assert_eq!(fits_ra_string(157.5), "10 30 00.00");
        assert_eq!(fits_dec_string(20.0), "+20 00 00.0");
    }

    #[test]
    fn test_residual() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let ra: f64 = rng.gen_range(0.0..360.0);
            let dec: f64 = rng.gen_range(-90.0..90.0);
            let ra2: f64 = ra + rng.gen_range(-1.0..1.0);
            let dec2: f64 = dec + rng.gen_range(-1.0..1.0);
            let (_, _, total) = residual_arcsec(ra, dec, ra2, dec2);
            let expected = ((ra2 - ra) * 3600.0).hypot((dec2 - dec) * 3600.0);
            assert_abs_diff_eq!(total, expected, epsilon = 1e-9);
        }
        let (ra_err, dec_err, total) = residual_arcsec(10.0, 20.0, 11.0, 20.0);
        assert_abs_diff_eq!(ra_err, 3600.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dec_err, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(total, 3600.0, epsilon = 1e-9);
    }

    #[test]
    fn test_precession() {
        // 24 years after J2000 the equinox has moved roughly 0.31 degrees.
        let jd = JD_J2000 + 24.0 * 365.25;
        let (ra, dec) = j2000_to_jnow(0.0, 0.0, jd);
        assert!(ra > 0.30 && ra < 0.32, "ra {}", ra);
        assert!(dec > 0.12 && dec < 0.14, "dec {}", dec);

        let (ra0, dec0) = jnow_to_j2000(ra, dec, jd);
        assert_abs_diff_eq!(ra0.min(360.0 - ra0), 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(dec0, 0.0, epsilon = 1e-7);

        let (ra, dec) = j2000_to_jnow(201.2983, -11.1614, jd);
        let (ra0, dec0) = jnow_to_j2000(ra, dec, jd);
        assert_abs_diff_eq!(ra0, 201.2983, epsilon = 1e-7);
        assert_abs_diff_eq!(dec0, -11.1614, epsilon = 1e-7);
    }

    #[test]
    fn test_precession_inverse_near_pole() {
        let jd = JD_J2000 + 30.0 * 365.25;
        for (ra, dec) in [(10.0, 89.99), (300.0, -80.0), (45.0, 89.5)] {
            let (ra_now, dec_now) = j2000_to_jnow(ra, dec, jd);
            let (ra0, dec0) = jnow_to_j2000(ra_now, dec_now, jd);
            assert_abs_diff_eq!(ra0, ra, epsilon = 1e-6);
            assert_abs_diff_eq!(dec0, dec, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_julian_date() {
        assert_abs_diff_eq!(julian_date_from_system_time(&SystemTime::UNIX_EPOCH),
                            2440587.5, epsilon = 1e-9);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(946728000);
        assert_abs_diff_eq!(julian_date_from_system_time(&t),
                            JD_J2000, epsilon = 1e-6);
    }

    #[test]
    fn test_alt_az_from_equatorial() {
        let mizar_ra = deg_frm_hms(13, 23, 55.5).to_radians();
        let mizar_dec = deg_frm_dms(54, 55, 30.7).to_radians();

        let dt = FixedOffset::west_opt(8 * 3600).unwrap().with_ymd_and_hms(
            2024, 3, 7, 23, 56, 0).unwrap();
        let unix_time = SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs_f64(
            dt.timestamp_millis() as f64 / 1000.0)).unwrap();

        let lat = 37_f64.to_radians();
        let long = -122_f64.to_radians();

        let (alt, az, _ha) =
            alt_az_from_equatorial(mizar_ra, mizar_dec, lat, long, &unix_time);

        // Expected values obtained from SkySafari.
        assert_abs_diff_eq!(alt,
                            deg_frm_dms(59, 3, 54.3).to_radians(),
                            epsilon = 0.02);
        assert_abs_diff_eq!(az,
                            deg_frm_dms(43, 20, 36.7).to_radians(),
                            epsilon = 0.02);
    }

}  // mod tests.
