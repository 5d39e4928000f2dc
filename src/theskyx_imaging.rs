// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Imaging through TheSkyX's TCP scripting server. Each request is a short
// JavaScript program; the server answers with the script's value followed
// by "|No error. Error = 0." on success.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use canonical_error::{aborted_error, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      unavailable_error, CanonicalError};
use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::command_runner::connect;
use crate::imaging::{CameraProps, CameraState, CaptureProgress, CaptureStage,
                     ImageParams, ImagingProvider, ImagingStatus, ProgressFn,
                     SolveResult};

pub const THESKYX_DEFAULT_ADDRESS: &str = "127.0.0.1:3040";
const SUCCESS_SUFFIX: &str = "|No error. Error = 0.";

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

pub struct TheSkyXImaging {
    address: String,
    solve_timeout: Duration,
}

// True once `reply` holds a complete answer: "... Error = <n>."
fn reply_complete(reply: &str) -> bool {
    match reply.rfind("Error = ") {
        Some(pos) => {
            let tail = &reply[pos + "Error = ".len()..];
            tail.ends_with('.') && tail.len() > 1
        }
        None => false,
    }
}

/// Strips the success suffix; anything else is a script error.
pub fn parse_reply(reply: &str) -> Result<String, CanonicalError> {
    let reply = reply.trim_end_matches(['\r', '\n']);
    match reply.strip_suffix(SUCCESS_SUFFIX) {
        Some(value) => Ok(value.to_string()),
        None => Err(failed_precondition_error(
            format!("TheSkyX script failed: {}", reply).as_str())),
    }
}

impl TheSkyXImaging {
    pub fn new(address: &str, solve_timeout: Duration) -> Self {
        TheSkyXImaging { address: address.to_string(), solve_timeout }
    }

    /// Runs `script` and returns its value.
    pub fn run_script(&self, script: &str, timeout: Duration)
                      -> Result<String, CanonicalError> {
        let mut stream: TcpStream = connect(&self.address)?;
        let program = format!("/* Java Script */\n/* Socket Start Packet */\n{}\n\
                               /* Socket End Packet */\n", script);
        stream.write_all(program.as_bytes()).map_err(|e| {
            unavailable_error(format!("TheSkyX write failed: {}", e).as_str())
        })?;
        let deadline = Instant::now() + timeout;
        let mut reply = String::new();
        let mut buffer = [0_u8; 1024];
        while !reply_complete(&reply) {
            let now = Instant::now();
            if now >= deadline {
                return Err(deadline_exceeded_error(
                    format!("TheSkyX did not answer; got {:?}", reply).as_str()));
            }
            let _ = stream.set_read_timeout(Some((deadline - now).min(POLL_INTERVAL)));
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => reply.push_str(&String::from_utf8_lossy(&buffer[..n])),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock ||
                    e.kind() == ErrorKind::TimedOut => {}
                Err(e) => {
                    return Err(unavailable_error(
                        format!("TheSkyX read failed: {}", e).as_str()));
                }
            }
        }
        debug!("TheSkyX: {}", reply);
        parse_reply(&reply)
    }

    fn abort_capture(&self) {
        if let Err(e) = self.run_script("ccdsoftCamera.Abort();", SCRIPT_TIMEOUT) {
            warn!("Abort of capture failed: {}", e.message);
        }
    }

    fn split_values(value: &str, n: usize, what: &str) -> Result<Vec<String>, CanonicalError> {
        let values: Vec<String> = value.split('|').map(|v| v.trim().to_string()).collect();
        if values.len() < n {
            return Err(internal_error(
                format!("{} reply has too few fields: {:?}", what, value).as_str()));
        }
        Ok(values)
    }
}

fn parse_number(s: &str, what: &str) -> Result<f64, CanonicalError> {
    s.trim().parse::<f64>().map_err(|_| {
        internal_error(format!("Cannot parse {} from {:?}", what, s).as_str())
    })
}

fn camera_state(status: &str) -> CameraState {
    let status = status.to_lowercase();
    if status.contains("not connected") {
        CameraState::Disconnected
    } else if status.contains("exposing") || status.contains("exposure in progress") {
        CameraState::Integrating
    } else if status.contains("download") {
        CameraState::Downloading
    } else if status.contains("saving") {
        CameraState::Saving
    } else if status.contains("ready") || status.contains("complete") || status.contains("idle") {
        CameraState::Idle
    } else {
        CameraState::Error
    }
}

impl ImagingProvider for TheSkyXImaging {
    fn name(&self) -> &str {
        "TheSkyX"
    }

    fn get_status(&self) -> Result<ImagingStatus, CanonicalError> {
        let status = self.run_script("var Out = ccdsoftCamera.Status; Out;", SCRIPT_TIMEOUT)?;
        let state = camera_state(&status);
        Ok(ImagingStatus {
            application_status: status,
            connected: state != CameraState::Disconnected,
            camera_state: state,
        })
    }

    fn get_camera_props(&self) -> Result<CameraProps, CanonicalError> {
        let value = self.run_script(
            "ccdsoftCamera.Connect(); \
             var Out = ccdsoftCamera.WidthInPixels + '|' + ccdsoftCamera.HeightInPixels; Out;",
            SCRIPT_TIMEOUT)?;
        let values = Self::split_values(&value, 2, "Camera size")?;
        Ok(CameraProps {
            pixels_x: parse_number(&values[0], "width")? as usize,
            pixels_y: parse_number(&values[1], "height")? as usize,
            gain_options: Vec::new(),
            can_subframe: true,
        })
    }

    fn capture_image(&self, params: &ImageParams, cancel: &CancelToken,
                     progress: ProgressFn) -> Result<PathBuf, CanonicalError> {
        let target = params.file_path();
        progress(CaptureProgress {
            stage: CaptureStage::Start,
            exposure_remaining: params.exposure_seconds().ceil() as u32,
        });
        let subframe = match params.sub_frame {
            Some(f) => format!(
                "ccdsoftCamera.Subframe = 1; ccdsoftCamera.SubframeLeft = {}; \
                 ccdsoftCamera.SubframeTop = {}; ccdsoftCamera.SubframeRight = {}; \
                 ccdsoftCamera.SubframeBottom = {};",
                f.off_x, f.off_y, f.off_x + f.size_x, f.off_y + f.size_y),
            None => "ccdsoftCamera.Subframe = 0;".to_string(),
        };
        let script = format!(
            "ccdsoftCamera.Connect(); ccdsoftCamera.Asynchronous = 1; \
             ccdsoftCamera.AutoSaveOn = 1; ccdsoftCamera.ImageReduction = 0; \
             ccdsoftCamera.Frame = 1; ccdsoftCamera.ExposureTime = {}; \
             ccdsoftCamera.BinX = {}; ccdsoftCamera.BinY = {}; {} \
             ccdsoftCamera.TakeImage(); var Out = 'started'; Out;",
            params.exposure_seconds(), params.binning, params.binning, subframe);
        self.run_script(&script, SCRIPT_TIMEOUT)?;

        let start = Instant::now();
        let deadline = start + params.exposure_duration() + DOWNLOAD_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                self.abort_capture();
                return Err(aborted_error("Capture cancelled"));
            }
            if Instant::now() > deadline {
                self.abort_capture();
                return Err(deadline_exceeded_error("Capture did not complete"));
            }
            let remaining = (params.exposure_seconds() - start.elapsed().as_secs_f64()).max(0.0);
            let stage = if remaining > 0.0 {
                CaptureStage::Integrate
            } else {
                CaptureStage::Download
            };
            progress(CaptureProgress { stage, exposure_remaining: remaining.ceil() as u32 });
            let done = self.run_script(
                "var Out = ccdsoftCamera.IsExposureComplete; Out;", SCRIPT_TIMEOUT)?;
            if done.trim() == "1" || done.trim() == "true" {
                break;
            }
            cancel.sleep(POLL_INTERVAL);
        }
        progress(CaptureProgress { stage: CaptureStage::Save, exposure_remaining: 0 });
        let saved = self.run_script(
            "var Out = ccdsoftCamera.LastImageFileName; Out;", SCRIPT_TIMEOUT)?;
        let saved = PathBuf::from(saved.trim());
        if saved != target {
            fs::copy(&saved, &target).map_err(|e| {
                failed_precondition_error(format!(
                    "Cannot copy {:?} to {:?}: {}", saved, target, e).as_str())
            })?;
        }
        progress(CaptureProgress { stage: CaptureStage::Idle, exposure_remaining: 0 });
        Ok(target)
    }

    // ImageLink reports right ascension in hours; the result is in degrees.
    // The script blocks in TheSkyX, so cancellation is observed only before
    // the solve starts.
    fn solve_image(&self, path: &Path, scale_hint: f64, blind: bool,
                   _use_fits_hints: bool, cancel: &CancelToken)
                   -> Result<SolveResult, CanonicalError> {
        cancel.check("plate solve")?;
        let start = Instant::now();
        let script = format!(
            "ImageLink.pathToFITS = '{}'; ImageLink.scale = {}; \
             ImageLink.unknownScale = {}; ImageLink.execute(); \
             var Out = ImageLinkResults.imageCenterRAJ2000 + '|' + \
             ImageLinkResults.imageCenterDecJ2000 + '|' + \
             ImageLinkResults.imageScale + '|' + \
             ImageLinkResults.imagePositionAngle; Out;",
            path.to_string_lossy().replace('\\', "/"), scale_hint,
            if blind { 1 } else { 0 });
        let value = self.run_script(&script, self.solve_timeout)?;
        let values = Self::split_values(&value, 4, "ImageLink")?;
        Ok(SolveResult {
            ra_j2000: parse_number(&values[0], "ra")? * 15.0,
            dec_j2000: parse_number(&values[1], "dec")?,
            scale: parse_number(&values[2], "scale")?,
            roll: parse_number(&values[3], "position angle")?,
            wall_time: start.elapsed().as_secs_f64(),
        })
    }
}
