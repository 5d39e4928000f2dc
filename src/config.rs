// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{failed_precondition_error, invalid_argument_error,
                      CanonicalError};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::astrometry_net::AstrometrySettings;
use crate::fits_header::SCALE_FACTOR;
use crate::imaging::ImagingKind;
use crate::model_builder::ModelBuildSettings;
use crate::wake_on_lan::parse_mac;

const DEFAULT_SETTLING_TIME: Duration = Duration::from_secs(1);
const DEFAULT_SOLVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Persisted settings, stored as one flat JSON object. Missing keys take
/// their defaults and unknown keys are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    #[serde(rename = "MountIP")]
    pub mount_ip: String,
    pub mount_port: u16,
    // Empty when wake on LAN is not used.
    #[serde(rename = "MountMAC")]
    pub mount_mac: String,

    // Empty for a flat horizon.
    pub horizon_mask_file: String,

    pub astrometry_host: String,
    pub astrometry_port: u16,
    pub astrometry_api_key: String,
    // Seconds; 0 picks the default for the host.
    pub astrometry_timeout: f64,
    pub astrometry_downsample: u32,
    // Solve with astrometry.net instead of the imaging application.
    pub use_astrometry: bool,

    pub check_delete_below_horizon: bool,
    pub check_sort_points: bool,

    // Seconds.
    pub settling_time: f64,
    pub binning: u32,
    // Seconds.
    pub exposure: f64,
    #[serde(rename = "ISO")]
    pub iso: u32,
    pub sub_frame_scale: f64,
    // Millimeters; 0 when unknown.
    pub focal_length: f64,
    // Microns; 0 when unknown.
    pub pixel_size: f64,
    pub blind_solve: bool,
    // Seconds, for imaging applications that solve.
    pub solve_timeout: f64,
    pub image_directory: String,
    pub iterations: usize,

    pub remote_address: String,
    pub remote_port: u16,

    #[serde(rename = "INDIHost")]
    pub indi_host: String,
    #[serde(rename = "INDIPort")]
    pub indi_port: u16,

    pub imaging_application: String,
    pub dome_enabled: bool,
    pub simulation: bool,
    pub keep_images: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mount_ip: "192.168.2.15".to_string(),
            mount_port: 3492,
            mount_mac: String::new(),
            horizon_mask_file: String::new(),
            astrometry_host: "nova.astrometry.net".to_string(),
            astrometry_port: 80,
            astrometry_api_key: String::new(),
            astrometry_timeout: 0.0,
            astrometry_downsample: 2,
            use_astrometry: false,
            check_delete_below_horizon: true,
            check_sort_points: true,
            settling_time: DEFAULT_SETTLING_TIME.as_secs_f64(),
            binning: 1,
            exposure: 3.0,
            iso: 100,
            sub_frame_scale: 1.0,
            focal_length: 0.0,
            pixel_size: 0.0,
            blind_solve: false,
            solve_timeout: DEFAULT_SOLVE_TIMEOUT.as_secs_f64(),
            image_directory: std::env::temp_dir().join("mountmodel")
                .to_string_lossy().to_string(),
            iterations: 10,
            remote_address: "127.0.0.1".to_string(),
            remote_port: 3490,
            indi_host: "127.0.0.1".to_string(),
            indi_port: 7624,
            imaging_application: "None".to_string(),
            dome_enabled: false,
            simulation: false,
            keep_images: false,
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, CanonicalError> {
        serde_json::from_str(text).map_err(|e| {
            invalid_argument_error(format!("Malformed configuration: {}", e).as_str())
        })
    }

    /// Reads `path`. A missing or unreadable file yields the defaults.
    pub fn load(path: &Path) -> Config {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                info!("Using default configuration, could not read {:?}: {}", path, e);
                return Config::default();
            }
        };
        match Config::parse(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default configuration: {}", e.message);
                Config::default()
            }
        }
    }

    /// Writes to a scratch file next to `path` and renames it into place.
    pub fn save(&self, path: &Path) -> Result<(), CanonicalError> {
        let io_error = |e: std::io::Error| {
            failed_precondition_error(format!("Cannot write {:?}: {}", path, e).as_str())
        };
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            failed_precondition_error(format!("Cannot encode configuration: {}", e).as_str())
        })?;
        let scratch_path = path.with_extension("tmp");
        fs::write(&scratch_path, text).map_err(io_error)?;
        fs::rename(&scratch_path, path).map_err(io_error)
    }

    pub fn validate(&self) -> Result<(), CanonicalError> {
        self.mount_ip.parse::<IpAddr>().map_err(|_| {
            invalid_argument_error(format!("Invalid mount IP {:?}", self.mount_ip).as_str())
        })?;
        if !self.mount_mac.trim().is_empty() {
            parse_mac(&self.mount_mac)?;
        }
        if !(self.exposure > 0.0) {
            return Err(invalid_argument_error(
                format!("Exposure must be positive, got {}", self.exposure).as_str()));
        }
        self.remote_socket_address()?;
        Ok(())
    }

    pub fn mount_address(&self) -> String {
        format!("{}:{}", self.mount_ip, self.mount_port)
    }

    pub fn remote_socket_address(&self) -> Result<SocketAddr, CanonicalError> {
        let ip = self.remote_address.parse::<IpAddr>().map_err(|_| {
            invalid_argument_error(
                format!("Invalid remote address {:?}", self.remote_address).as_str())
        })?;
        Ok(SocketAddr::new(ip, self.remote_port))
    }

    pub fn imaging_kind(&self) -> Result<ImagingKind, CanonicalError> {
        ImagingKind::from_name(&self.imaging_application)
    }

    /// Arcseconds per binned pixel from focal length and pixel size.
    pub fn scale_hint(&self) -> Option<f64> {
        if self.focal_length > 0.0 && self.pixel_size > 0.0 {
            Some(self.pixel_size * self.binning.max(1) as f64 * SCALE_FACTOR / self.focal_length)
        } else {
            None
        }
    }

    pub fn solve_timeout(&self) -> Duration {
        seconds(self.solve_timeout.max(1.0)).unwrap_or(DEFAULT_SOLVE_TIMEOUT)
    }

    pub fn astrometry_settings(&self) -> AstrometrySettings {
        AstrometrySettings {
            host: self.astrometry_host.clone(),
            port: self.astrometry_port,
            api_key: self.astrometry_api_key.clone(),
            timeout: seconds(self.astrometry_timeout).filter(|t| !t.is_zero()),
            downsample: self.astrometry_downsample,
        }
    }

    pub fn build_settings(&self) -> ModelBuildSettings {
        ModelBuildSettings {
            settling_time: seconds(self.settling_time.max(0.0))
                .unwrap_or(DEFAULT_SETTLING_TIME),
            keep_images: self.keep_images,
            simulation: self.simulation,
            binning: self.binning.max(1),
            exposure: self.exposure,
            iso: self.iso,
            sub_frame_scale: self.sub_frame_scale,
            scale_hint: self.scale_hint().unwrap_or(1.0),
            blind: self.blind_solve,
            base_directory: PathBuf::from(&self.image_directory),
            iterations: self.iterations,
            ..Default::default()
        }
    }
}

// None for negative, NaN or out of range values.
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}
