// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use canonical_error::{aborted_error, failed_precondition_error, CanonicalError};
use rand::Rng;

use crate::astro_util::degree_from_string;
use crate::cancel::CancelToken;
use crate::fits_header::{write_reference_image, FitsFile};
use crate::imaging::{CameraProps, CameraState, CaptureProgress, CaptureStage,
                     ImageParams, ImagingProvider, ImagingStatus, ProgressFn,
                     SolveResult};

const SENSOR_WIDTH: usize = 64;
const SENSOR_HEIGHT: usize = 48;

/// Stand-in camera and solver. Capture writes a flat reference frame; solve
/// reads the frame's OBJCTRA/OBJCTDEC and offsets them by a bounded random
/// amount.
pub struct SimulatedImaging {
    // Bound of the random solve offset per axis, arcseconds.
    max_offset_arcsec: f64,
    // Upper bound on the simulated exposure time.
    max_exposure: Duration,
}

impl SimulatedImaging {
    pub fn new(max_offset_arcsec: f64, max_exposure: Duration) -> Self {
        SimulatedImaging { max_offset_arcsec, max_exposure }
    }
}

impl Default for SimulatedImaging {
    fn default() -> Self {
        SimulatedImaging::new(30.0, Duration::from_secs(1))
    }
}

fn header_angle(fits: &FitsFile, key: &str) -> Option<f64> {
    let value = fits.header.get(key)?;
    degree_from_string(&value.split_whitespace().collect::<Vec<_>>().join(":"))
}

impl ImagingProvider for SimulatedImaging {
    fn name(&self) -> &str {
        "simulator"
    }

    fn get_status(&self) -> Result<ImagingStatus, CanonicalError> {
        Ok(ImagingStatus {
            application_status: "simulated".to_string(),
            connected: true,
            camera_state: CameraState::Idle,
        })
    }

    fn get_camera_props(&self) -> Result<CameraProps, CanonicalError> {
        Ok(CameraProps {
            pixels_x: SENSOR_WIDTH,
            pixels_y: SENSOR_HEIGHT,
            gain_options: vec!["Low".to_string(), "High".to_string()],
            can_subframe: false,
        })
    }

    fn capture_image(&self, params: &ImageParams, cancel: &CancelToken,
                     progress: ProgressFn) -> Result<PathBuf, CanonicalError> {
        let exposure = params.exposure_duration().min(self.max_exposure);
        progress(CaptureProgress {
            stage: CaptureStage::Start,
            exposure_remaining: exposure.as_secs_f64().ceil() as u32,
        });
        let start = Instant::now();
        while start.elapsed() < exposure {
            let remaining = exposure.saturating_sub(start.elapsed());
            progress(CaptureProgress {
                stage: CaptureStage::Integrate,
                exposure_remaining: remaining.as_secs_f64().ceil() as u32,
            });
            if cancel.sleep(remaining.min(Duration::from_millis(100))) {
                return Err(aborted_error("Capture cancelled"));
            }
        }
        cancel.check("download")?;
        progress(CaptureProgress { stage: CaptureStage::Download, exposure_remaining: 0 });
        let target = params.file_path();
        progress(CaptureProgress { stage: CaptureStage::Save, exposure_remaining: 0 });
        write_reference_image(&target, SENSOR_WIDTH, SENSOR_HEIGHT)?;
        progress(CaptureProgress { stage: CaptureStage::Idle, exposure_remaining: 0 });
        Ok(target)
    }

    fn solve_image(&self, path: &Path, scale_hint: f64, _blind: bool,
                   _use_fits_hints: bool, cancel: &CancelToken)
                   -> Result<SolveResult, CanonicalError> {
        cancel.check("plate solve")?;
        let start = Instant::now();
        let fits = FitsFile::read(path)?;
        let (Some(ra_hours), Some(dec)) = (header_angle(&fits, "OBJCTRA"),
                                           header_angle(&fits, "OBJCTDEC")) else {
            return Err(failed_precondition_error(
                format!("{:?} has no pointing keywords to simulate from", path).as_str()));
        };
        let mut rng = rand::thread_rng();
        let bound = self.max_offset_arcsec.abs() / 3600.0;
        let (dra, ddec) = if bound > 0.0 {
            (rng.gen_range(-bound..=bound), rng.gen_range(-bound..=bound))
        } else {
            (0.0, 0.0)
        };
        Ok(SolveResult {
            ra_j2000: (ra_hours * 15.0 + dra).rem_euclid(360.0),
            dec_j2000: (dec + ddec).clamp(-90.0, 90.0),
            scale: fits.header.scale_hint().unwrap_or(scale_hint),
            roll: 0.0,
            wall_time: start.elapsed().as_secs_f64(),
        })
    }
}
