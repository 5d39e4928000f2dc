// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;
use std::time::Instant;

use canonical_error::{failed_precondition_error, CanonicalError};

pub trait DomeProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Starts a slew; returns without waiting for it to complete.
    fn slew_to_azimuth(&self, azimuth: f64) -> Result<(), CanonicalError>;

    fn is_slewing(&self) -> Result<bool, CanonicalError>;

    fn azimuth(&self) -> Result<f64, CanonicalError>;
}

/// Domes take azimuths in [0, 360): negative values become 0 and values of
/// 360 or more become 359.9.
pub fn dome_azimuth(azimuth: f64) -> f64 {
    if azimuth < 0.0 {
        0.0
    } else if azimuth >= 360.0 {
        359.9
    } else {
        azimuth
    }
}

#[derive(Debug)]
struct DomeMotion {
    from: f64,
    to: f64,
    started: Instant,
}

/// A dome rotating at a constant rate along the shorter way.
pub struct SimulatedDome {
    // Degrees per second.
    rate: f64,
    motion: Mutex<DomeMotion>,
    connected: bool,
}

impl SimulatedDome {
    pub fn new(rate: f64) -> Self {
        SimulatedDome {
            rate,
            motion: Mutex::new(DomeMotion { from: 0.0, to: 0.0, started: Instant::now() }),
            connected: true,
        }
    }

    pub fn disconnected() -> Self {
        SimulatedDome { connected: false, ..SimulatedDome::new(1.0) }
    }

    // Signed shortest rotation from `from` to `to`.
    fn delta(from: f64, to: f64) -> f64 {
        let d = (to - from).rem_euclid(360.0);
        if d > 180.0 { d - 360.0 } else { d }
    }

    fn position(&self, motion: &DomeMotion) -> (f64, bool) {
        let delta = SimulatedDome::delta(motion.from, motion.to);
        let travelled = self.rate * motion.started.elapsed().as_secs_f64();
        if travelled >= delta.abs() {
            (motion.to, false)
        } else {
            ((motion.from + travelled * delta.signum()).rem_euclid(360.0), true)
        }
    }
}

impl DomeProvider for SimulatedDome {
    fn name(&self) -> &str {
        "simulated dome"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn slew_to_azimuth(&self, azimuth: f64) -> Result<(), CanonicalError> {
        if !self.connected {
            return Err(failed_precondition_error("Dome not connected"));
        }
        let mut motion = self.motion.lock().unwrap();
        let (current, _) = self.position(&motion);
        *motion = DomeMotion { from: current, to: dome_azimuth(azimuth), started: Instant::now() };
        Ok(())
    }

    fn is_slewing(&self) -> Result<bool, CanonicalError> {
        let motion = self.motion.lock().unwrap();
        Ok(self.position(&motion).1)
    }

    fn azimuth(&self) -> Result<f64, CanonicalError> {
        let motion = self.motion.lock().unwrap();
        Ok(self.position(&motion).0)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::thread;
    use std::time::Duration;

    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_dome_azimuth() {
        assert_eq!(dome_azimuth(-0.5), 0.0);
        assert_eq!(dome_azimuth(360.0), 359.9);
        assert_eq!(dome_azimuth(400.0), 359.9);
        assert_eq!(dome_azimuth(123.4), 123.4);
    }

    #[test]
    fn test_simulated_slew() {
        let dome = SimulatedDome::new(100.0);
        assert!(!dome.is_slewing().unwrap());
        dome.slew_to_azimuth(350.0).unwrap();
        // Shorter way is through north, 10 degrees.
        assert!(dome.is_slewing().unwrap());
        thread::sleep(Duration::from_millis(200));
        assert!(!dome.is_slewing().unwrap());
        assert_abs_diff_eq!(dome.azimuth().unwrap(), 350.0, epsilon = 1e-9);

        assert!(SimulatedDome::disconnected().slew_to_azimuth(10.0).is_err());
    }
}
