// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Imaging through Sequence Generator Pro's local JSON API.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use canonical_error::{aborted_error, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      unavailable_error, CanonicalError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cancel::CancelToken;
use crate::imaging::{CameraProps, CameraState, CaptureProgress, CaptureStage,
                     ImageParams, ImagingProvider, ImagingStatus, ProgressFn,
                     SolveResult};

pub const SGPRO_DEFAULT_URL: &str = "http://127.0.0.1:59590";

const POLL_INTERVAL: Duration = Duration::from_millis(200);
// Beyond the exposure time, how long download and save may take.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SgResponse {
    success: bool,
    message: String,
    receipt: String,
    state: String,
    ra: f64,
    dec: f64,
    scale: f64,
    angle: f64,
    time_to_solve: f64,
    num_pixels_x: usize,
    num_pixels_y: usize,
    supports_subframe: bool,
    gain_values: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SgCaptureRequest {
    binning_mode: u32,
    exposure_length: f64,
    gain: String,
    iso: String,
    speed: String,
    frame_type: String,
    path: String,
    use_subframe: bool,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SgSolveRequest {
    image_path: String,
    ra_hint: f64,
    dec_hint: f64,
    scale_hint: f64,
    blind_solve: bool,
    use_fits_headers_for_hints: bool,
}

fn camera_state(state: &str) -> CameraState {
    match state.to_uppercase().as_str() {
        "IDLE" | "READY" => CameraState::Idle,
        "CAPTURING" | "INTEGRATING" => CameraState::Integrating,
        "DOWNLOADING" | "BUSY" => CameraState::Downloading,
        "SAVING" => CameraState::Saving,
        "DISCONNECTED" => CameraState::Disconnected,
        _ => CameraState::Error,
    }
}

pub struct SgProImaging {
    base_url: String,
    client: reqwest::blocking::Client,
    solve_timeout: Duration,
}

impl SgProImaging {
    pub fn new(base_url: &str, solve_timeout: Duration) -> Result<Self, CanonicalError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| internal_error(format!("HTTP client: {}", e).as_str()))?;
        Ok(SgProImaging {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            solve_timeout,
        })
    }

    fn post(&self, endpoint: &str, body: &impl Serialize)
            -> Result<SgResponse, CanonicalError> {
        let url = format!("{}/json/reply/{}", self.base_url, endpoint);
        let response = self.client.post(&url).json(body).send().map_err(|e| {
            unavailable_error(format!("{} failed: {}", endpoint, e).as_str())
        })?;
        if !response.status().is_success() {
            return Err(unavailable_error(
                format!("{} returned {}", endpoint, response.status()).as_str()));
        }
        response.json::<SgResponse>().map_err(|e| {
            internal_error(format!("{} reply not understood: {}", endpoint, e).as_str())
        })
    }

    fn abort_capture(&self) {
        if let Err(e) = self.post("SgAbortImage", &json!({})) {
            warn!("Abort of capture failed: {}", e.message);
        }
    }
}

impl ImagingProvider for SgProImaging {
    fn name(&self) -> &str {
        "SGPro"
    }

    fn get_status(&self) -> Result<ImagingStatus, CanonicalError> {
        let reply = self.post("SgGetDeviceStatus", &json!({"Device": "Camera"}))?;
        let state = camera_state(&reply.state);
        Ok(ImagingStatus {
            application_status: reply.message,
            connected: reply.success && state != CameraState::Disconnected,
            camera_state: state,
        })
    }

    fn get_camera_props(&self) -> Result<CameraProps, CanonicalError> {
        let reply = self.post("SgGetCameraProps", &json!({}))?;
        if !reply.success {
            return Err(failed_precondition_error(
                format!("Camera properties: {}", reply.message).as_str()));
        }
        Ok(CameraProps {
            pixels_x: reply.num_pixels_x,
            pixels_y: reply.num_pixels_y,
            gain_options: reply.gain_values,
            can_subframe: reply.supports_subframe,
        })
    }

    fn capture_image(&self, params: &ImageParams, cancel: &CancelToken,
                     progress: ProgressFn) -> Result<PathBuf, CanonicalError> {
        let target = params.file_path();
        progress(CaptureProgress {
            stage: CaptureStage::Start,
            exposure_remaining: params.exposure_seconds().ceil() as u32,
        });
        let frame = params.sub_frame.unwrap_or_default();
        let request = SgCaptureRequest {
            binning_mode: params.binning,
            exposure_length: params.exposure_seconds(),
            gain: params.gain.clone(),
            iso: params.iso.to_string(),
            speed: params.speed.clone(),
            frame_type: "Light".to_string(),
            path: target.to_string_lossy().to_string(),
            use_subframe: params.sub_frame.is_some(),
            x: frame.off_x,
            y: frame.off_y,
            width: frame.size_x,
            height: frame.size_y,
        };
        let reply = self.post("SgCaptureImage", &request)?;
        if !reply.success {
            return Err(failed_precondition_error(
                format!("Capture refused: {}", reply.message).as_str()));
        }
        let receipt = reply.receipt;
        let start = Instant::now();
        let deadline = start + params.exposure_duration() + DOWNLOAD_TIMEOUT;
        let mut stage = CaptureStage::Integrate;
        let saved_path = loop {
            if cancel.is_cancelled() {
                self.abort_capture();
                return Err(aborted_error("Capture cancelled"));
            }
            if Instant::now() > deadline {
                self.abort_capture();
                return Err(deadline_exceeded_error("Capture did not complete"));
            }
            let remaining = (params.exposure_seconds() - start.elapsed().as_secs_f64()).max(0.0);
            if remaining == 0.0 {
                stage = CaptureStage::Download;
            }
            progress(CaptureProgress { stage, exposure_remaining: remaining.ceil() as u32 });
            let reply = self.post("SgGetImagePath", &json!({"Receipt": receipt}))?;
            if reply.success {
                break PathBuf::from(reply.message);
            }
            debug!("Waiting for image: {}", reply.message);
            cancel.sleep(POLL_INTERVAL);
        };
        progress(CaptureProgress { stage: CaptureStage::Save, exposure_remaining: 0 });
        if saved_path != target {
            fs::copy(&saved_path, &target).map_err(|e| {
                failed_precondition_error(format!(
                    "Cannot copy {:?} to {:?}: {}", saved_path, target, e).as_str())
            })?;
        }
        progress(CaptureProgress { stage: CaptureStage::Idle, exposure_remaining: 0 });
        Ok(target)
    }

    // SGPro reports right ascension in hours; the result is in degrees.
    fn solve_image(&self, path: &Path, scale_hint: f64, blind: bool,
                   use_fits_hints: bool, cancel: &CancelToken)
                   -> Result<SolveResult, CanonicalError> {
        let start = Instant::now();
        let request = SgSolveRequest {
            image_path: path.to_string_lossy().to_string(),
            ra_hint: 0.0,
            dec_hint: 0.0,
            scale_hint,
            blind_solve: blind,
            use_fits_headers_for_hints: use_fits_hints,
        };
        let reply = self.post("SgSolveImage", &request)?;
        if !reply.success {
            return Err(failed_precondition_error(
                format!("Solve refused: {}", reply.message).as_str()));
        }
        let receipt = reply.receipt;
        loop {
            cancel.check("plate solve")?;
            if start.elapsed() > self.solve_timeout {
                return Err(deadline_exceeded_error(format!(
                    "No solution for {:?} within {:?}", path, self.solve_timeout).as_str()));
            }
            let reply = self.post("SgGetSolvedImageData", &json!({"Receipt": receipt}))?;
            if reply.success {
                return Ok(SolveResult {
                    ra_j2000: reply.ra * 15.0,
                    dec_j2000: reply.dec,
                    scale: reply.scale,
                    roll: reply.angle,
                    wall_time: if reply.time_to_solve > 0.0 {
                        reply.time_to_solve
                    } else {
                        start.elapsed().as_secs_f64()
                    },
                });
            }
            // "Solving...", "Matching..." mean keep waiting.
            if !reply.message.contains("ing") {
                return Err(failed_precondition_error(
                    format!("Solve failed: {}", reply.message).as_str()));
            }
            cancel.sleep(POLL_INTERVAL);
        }
    }
}
