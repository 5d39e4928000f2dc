// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Plate solving through an astrometry.net web API (the public service or a
// local installation). Capture is delegated to another provider.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use canonical_error::{deadline_exceeded_error, failed_precondition_error,
                      internal_error, unavailable_error, CanonicalError};
use log::{debug, info};
use reqwest::blocking::multipart::{Form, Part};
use serde_json::{json, Value};

use crate::astro_util::degree_from_string;
use crate::cancel::CancelToken;
use crate::fits_header::FitsFile;
use crate::imaging::{CameraProps, ImageParams, ImagingProvider,
                     ImagingStatus, ProgressFn, SolveResult};

pub const ONLINE_HOST: &str = "nova.astrometry.net";
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(60);
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(360);

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AstrometrySettings {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    // None selects LOCAL_TIMEOUT or ONLINE_TIMEOUT by host.
    pub timeout: Option<Duration>,
    pub downsample: u32,
}

impl AstrometrySettings {
    pub fn is_online(&self) -> bool {
        self.host.eq_ignore_ascii_case(ONLINE_HOST)
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(if self.is_online() { ONLINE_TIMEOUT } else { LOCAL_TIMEOUT })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}/api", self.host, self.port)
    }
}

pub struct AstrometryNetImaging {
    capture: Box<dyn ImagingProvider>,
    settings: AstrometrySettings,
    base_url: String,
    client: reqwest::blocking::Client,
}

/// Reads OBJCTRA/OBJCTDEC ("HH MM SS.SS" / "sDD MM SS.S") as degrees.
pub fn header_center(path: &Path) -> Option<(f64, f64)> {
    let fits = FitsFile::read(path).ok()?;
    let ra = fits.header.get("OBJCTRA")?;
    let dec = fits.header.get("OBJCTDEC")?;
    let ra_hours = degree_from_string(&ra.split_whitespace().collect::<Vec<_>>().join(":"))?;
    let dec = degree_from_string(&dec.split_whitespace().collect::<Vec<_>>().join(":"))?;
    // Upload hints are degrees.
    Some((ra_hours * 15.0, dec))
}

fn api_error(what: &str, e: reqwest::Error) -> CanonicalError {
    unavailable_error(format!("astrometry.net {}: {}", what, e).as_str())
}

impl AstrometryNetImaging {
    pub fn new(capture: Box<dyn ImagingProvider>, settings: AstrometrySettings)
               -> Result<Self, CanonicalError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| internal_error(format!("HTTP client: {}", e).as_str()))?;
        Ok(AstrometryNetImaging {
            capture,
            base_url: settings.base_url(),
            settings,
            client,
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn check_status(reply: &Value, what: &str) -> Result<(), CanonicalError> {
        match reply["status"].as_str() {
            Some("success") => Ok(()),
            _ => Err(failed_precondition_error(
                format!("astrometry.net {} failed: {}", what, reply).as_str())),
        }
    }

    fn get(&self, path: &str) -> Result<Value, CanonicalError> {
        let url = format!("{}/{}", self.base_url, path);
        self.client.get(&url).send().map_err(|e| api_error(path, e))?
            .json::<Value>().map_err(|e| api_error(path, e))
    }

    fn login(&self) -> Result<String, CanonicalError> {
        let request = json!({"apikey": self.settings.api_key}).to_string();
        let reply: Value = self.client.post(format!("{}/login", self.base_url))
            .form(&[("request-json", request)])
            .send().map_err(|e| api_error("login", e))?
            .json().map_err(|e| api_error("login", e))?;
        Self::check_status(&reply, "login")?;
        reply["session"].as_str().map(|s| s.to_string()).ok_or_else(|| {
            internal_error(format!("Login reply has no session: {}", reply).as_str())
        })
    }

    fn upload(&self, session: &str, path: &Path, scale_hint: f64, blind: bool,
              center: Option<(f64, f64)>) -> Result<i64, CanonicalError> {
        let mut request = json!({
            "session": session,
            "allow_commercial_use": "n",
            "allow_modifications": "n",
            "publicly_visible": "n",
            "downsample_factor": self.settings.downsample.max(1),
        });
        if !blind && scale_hint > 0.0 {
            request["scale_units"] = json!("arcsecperpix");
            request["scale_type"] = json!("ev");
            request["scale_est"] = json!(scale_hint);
            request["scale_err"] = json!(20);
        }
        if let Some((ra, dec)) = center {
            request["center_ra"] = json!(ra);
            request["center_dec"] = json!(dec);
            request["radius"] = json!(5);
        }
        let bytes = fs::read(path).map_err(|e| {
            failed_precondition_error(format!("Cannot read {:?}: {}", path, e).as_str())
        })?;
        let file_name = path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image.fit".to_string());
        let form = Form::new()
            .text("request-json", request.to_string())
            .part("file", Part::bytes(bytes).file_name(file_name));
        let reply: Value = self.client.post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send().map_err(|e| api_error("upload", e))?
            .json().map_err(|e| api_error("upload", e))?;
        Self::check_status(&reply, "upload")?;
        reply["subid"].as_i64().ok_or_else(|| {
            internal_error(format!("Upload reply has no subid: {}", reply).as_str())
        })
    }

    // Waits until `poll` yields a value, the deadline passes, or cancel.
    fn poll_until<T, F>(&self, what: &str, deadline: Instant, cancel: &CancelToken,
                        mut poll: F) -> Result<T, CanonicalError>
    where F: FnMut() -> Result<Option<T>, CanonicalError>
    {
        loop {
            cancel.check(what)?;
            if let Some(value) = poll()? {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(deadline_exceeded_error(
                    format!("astrometry.net {} timed out", what).as_str()));
            }
            cancel.sleep(POLL_INTERVAL);
        }
    }
}

impl ImagingProvider for AstrometryNetImaging {
    fn name(&self) -> &str {
        "astrometry.net"
    }

    fn get_status(&self) -> Result<ImagingStatus, CanonicalError> {
        self.capture.get_status()
    }

    fn get_camera_props(&self) -> Result<CameraProps, CanonicalError> {
        self.capture.get_camera_props()
    }

    fn capture_image(&self, params: &ImageParams, cancel: &CancelToken,
                     progress: ProgressFn) -> Result<PathBuf, CanonicalError> {
        self.capture.capture_image(params, cancel, progress)
    }

    // Calibration reports right ascension in degrees; no conversion.
    fn solve_image(&self, path: &Path, scale_hint: f64, blind: bool,
                   use_fits_hints: bool, cancel: &CancelToken)
                   -> Result<SolveResult, CanonicalError> {
        let start = Instant::now();
        let deadline = start + self.settings.effective_timeout();
        let center = if use_fits_hints && !blind { header_center(path) } else { None };
        let session = self.login()?;
        let submission = self.upload(&session, path, scale_hint, blind, center)?;
        info!("Uploaded {:?} as submission {}", path, submission);

        let job = self.poll_until("submission", deadline, cancel, || {
            let reply = self.get(&format!("submissions/{}", submission))?;
            Ok(reply["jobs"].as_array()
               .and_then(|jobs| jobs.iter().find_map(|j| j.as_i64())))
        })?;
        debug!("Submission {} started job {}", submission, job);

        self.poll_until("job", deadline, cancel, || {
            let reply = self.get(&format!("jobs/{}", job))?;
            match reply["status"].as_str() {
                Some("success") => Ok(Some(())),
                Some("failure") => Err(failed_precondition_error(
                    format!("astrometry.net found no solution for {:?}", path).as_str())),
                _ => Ok(None),
            }
        })?;

        let calibration = self.get(&format!("jobs/{}/calibration", job))?;
        let field = |name: &str| -> Result<f64, CanonicalError> {
            calibration[name].as_f64().ok_or_else(|| {
                internal_error(format!("Calibration lacks {}: {}", name, calibration).as_str())
            })
        };
        Ok(SolveResult {
            ra_j2000: field("ra")?,
            dec_j2000: field("dec")?,
            scale: field("pixscale")?,
            roll: field("orientation")?,
            wall_time: start.elapsed().as_secs_f64(),
        })
    }
}
