// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, RwLock};

/// One alignment star as reported by the mount after a model fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStar {
    /// 1-based index within the mount's model.
    pub index: usize,
    /// Hour angle, hours.
    pub hour_angle: f64,
    /// Declination, degrees.
    pub dec: f64,
    /// Residual after the fit, arcseconds.
    pub error_arcsec: f64,
    /// Direction of the residual, degrees.
    pub error_angle: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MountState {
    // Identity.
    pub firmware_version: String,
    // major*10000 + minor*100 + patch; zero until the firmware is known.
    pub firmware_number: u32,
    pub product_name: String,
    pub hardware_version: String,
    pub firmware_date: String,
    pub firmware_time: String,

    // Site. Longitude is positive east, i.e. already inverted from the
    // east-negative wire convention.
    pub site_longitude: f64,
    pub site_latitude: f64,
    pub site_elevation: f64,

    // Pointing. Right ascension in degrees.
    pub ra_jnow: f64,
    pub dec_jnow: f64,
    pub ra_j2000: f64,
    pub dec_j2000: f64,
    pub azimuth: f64,
    pub altitude: f64,
    pub local_sidereal_time: String,
    pub local_sidereal_hours: f64,
    // 'E' or 'W'.
    pub pier_side: char,
    pub slewing: bool,
    pub tracking: bool,
    pub status: i32,
    pub julian_date: f64,

    // Environment as seen by the mount's refraction model.
    pub refraction_temperature: f64,
    pub refraction_pressure: f64,
    pub refraction_enabled: bool,
    pub dual_axis_tracking: bool,
    pub unattended_flip: bool,
    pub horizon_limit_high: f64,
    pub horizon_limit_low: f64,

    // Model.
    pub number_alignment_stars: usize,
    pub model_names: Vec<String>,
    pub model_stars: Vec<ModelStar>,

    // Counts completed poll cycles; lets readers detect staleness.
    pub fast_cycles: u64,
}

impl MountState {
    pub fn new() -> Self {
        MountState { pier_side: 'E', ..Default::default() }
    }

    pub fn firmware_known(&self) -> bool {
        self.firmware_number > 0
    }
}

/// Packs "2.15.14" as 21514. Returns None for anything that is not three
/// dot-separated numbers.
pub fn firmware_number(version: &str) -> Option<u32> {
    let parts: Vec<&str> = version.trim().split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let major: u32 = parts[0].parse().ok()?;
    let minor: u32 = parts[1].parse().ok()?;
    let patch: u32 = parts[2].parse().ok()?;
    Some(major * 10000 + minor * 100 + patch)
}

/// The wire protocol reports longitude east-negative; we present it
/// east-positive. Applying this twice is the identity.
pub fn invert_longitude(longitude: f64) -> f64 {
    -longitude
}

/// Process-wide mount state. Each poller applies a whole batch under one
/// write lock, so a reader never sees a half-applied poll cycle.
#[derive(Clone, Default)]
pub struct SharedMountState {
    inner: Arc<RwLock<MountState>>,
}

impl SharedMountState {
    pub fn new() -> Self {
        SharedMountState { inner: Arc::new(RwLock::new(MountState::new())) }
    }

    /// Consistent copy of the current state.
    pub fn snapshot(&self) -> MountState {
        self.inner.read().unwrap().clone()
    }

    pub fn firmware_known(&self) -> bool {
        self.inner.read().unwrap().firmware_known()
    }

    /// Applies `f` under the write lock.
    pub fn update<F, R>(&self, f: F) -> R
    where F: FnOnce(&mut MountState) -> R
    {
        let mut locked_state = self.inner.write().unwrap();
        f(&mut locked_state)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_firmware_number() {
        assert_eq!(firmware_number("2.15.14"), Some(21514));
        assert_eq!(firmware_number("3.0.1"), Some(30001));
        assert_eq!(firmware_number("2.15"), None);
        assert_eq!(firmware_number("a.b.c"), None);
    }

    #[test]
    fn test_invert_longitude() {
        assert_eq!(invert_longitude(-11.5), 11.5);
        assert_eq!(invert_longitude(8.25), -8.25);
        assert_eq!(invert_longitude(invert_longitude(42.0)), 42.0);
    }

    #[test]
    fn test_batch_updates_are_atomic() {
        let state = SharedMountState::new();
        let writer_state = state.clone();
        let writer = thread::spawn(move || {
            for i in 0..1000 {
                writer_state.update(|s| {
                    s.azimuth = i as f64;
                    s.altitude = i as f64;
                });
            }
        });
        for _ in 0..1000 {
            let s = state.snapshot();
            assert_eq!(s.azimuth, s.altitude);
        }
        writer.join().unwrap();
        assert!(!state.firmware_known());
    }
}
