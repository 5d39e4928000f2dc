// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{failed_precondition_error, invalid_argument_error,
                      CanonicalError};

use crate::cancel::CancelToken;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CameraState {
    #[default]
    Idle,
    Integrating,
    Downloading,
    Saving,
    Error,
    Disconnected,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImagingStatus {
    // Free text from the imaging application.
    pub application_status: String,
    pub connected: bool,
    pub camera_state: CameraState,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraProps {
    pub pixels_x: usize,
    pub pixels_y: usize,
    pub gain_options: Vec<String>,
    pub can_subframe: bool,
}

/// Sensor region in unbinned pixels. Binning is applied after.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubFrame {
    pub off_x: usize,
    pub off_y: usize,
    pub size_x: usize,
    pub size_y: usize,
}

impl SubFrame {
    /// Centered region covering `scale` (0..1] of each sensor dimension.
    pub fn centered(props: &CameraProps, scale: f64) -> Option<SubFrame> {
        if !props.can_subframe || !(scale > 0.0 && scale < 1.0) {
            return None;
        }
        let size_x = ((props.pixels_x as f64) * scale) as usize;
        let size_y = ((props.pixels_y as f64) * scale) as usize;
        Some(SubFrame {
            off_x: (props.pixels_x - size_x) / 2,
            off_y: (props.pixels_y - size_y) / 2,
            size_x,
            size_y,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageParams {
    pub binning: u32,
    // Seconds.
    pub exposure: f64,
    pub iso: u32,
    pub sub_frame: Option<SubFrame>,
    pub base_name: String,
    pub index: usize,
    pub base_directory: PathBuf,
    pub gain: String,
    pub speed: String,
    // Arcseconds per pixel.
    pub scale_hint: f64,
}

/// Longest exposure passed on to an imaging application, seconds.
pub const MAX_EXPOSURE_SECONDS: f64 = 86400.0;

impl ImageParams {
    /// Exposure in seconds, with negative and non-finite values read as
    /// zero.
    pub fn exposure_seconds(&self) -> f64 {
        if self.exposure.is_finite() {
            self.exposure.clamp(0.0, MAX_EXPOSURE_SECONDS)
        } else {
            0.0
        }
    }

    pub fn exposure_duration(&self) -> Duration {
        Duration::from_secs_f64(self.exposure_seconds())
    }

    pub fn file_name(&self) -> String {
        format!("{}{:03}.fit", self.base_name, self.index)
    }

    pub fn file_path(&self) -> PathBuf {
        self.base_directory.join(self.file_name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStage {
    Start,
    Integrate,
    Download,
    Save,
    Idle,
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CaptureStage::Start => "START",
            CaptureStage::Integrate => "INTEGRATE",
            CaptureStage::Download => "DOWNLOAD",
            CaptureStage::Save => "SAVE",
            CaptureStage::Idle => "IDLE",
        };
        write!(f, "{}", text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureProgress {
    pub stage: CaptureStage,
    pub exposure_remaining: u32,
}

pub type ProgressFn<'a> = &'a (dyn Fn(CaptureProgress) + Sync);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolveResult {
    // Degrees.
    pub ra_j2000: f64,
    pub dec_j2000: f64,
    // Arcseconds per pixel.
    pub scale: f64,
    // Degrees.
    pub roll: f64,
    // Seconds spent solving.
    pub wall_time: f64,
}

/// Single-image capture and plate solve. Implementations are blocking and
/// must observe `cancel` between stages at least every 200ms.
pub trait ImagingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn get_status(&self) -> Result<ImagingStatus, CanonicalError>;

    fn get_camera_props(&self) -> Result<CameraProps, CanonicalError>;

    /// Captures one frame to params.file_path(). Reports each stage change
    /// and the whole seconds of exposure remaining through `progress`.
    /// Returns the path of the written file.
    fn capture_image(&self, params: &ImageParams, cancel: &CancelToken,
                     progress: ProgressFn) -> Result<PathBuf, CanonicalError>;

    /// Solves the image at `path`. `scale_hint` is arcsec/pixel.
    fn solve_image(&self, path: &Path, scale_hint: f64, blind: bool,
                   use_fits_hints: bool, cancel: &CancelToken)
                   -> Result<SolveResult, CanonicalError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImagingKind {
    Ascom,
    Indi,
    SgPro,
    TheSkyX,
    MaximDL,
    AstrometryNet,
    None,
}

impl ImagingKind {
    pub fn from_name(name: &str) -> Result<ImagingKind, CanonicalError> {
        match name.trim().to_lowercase().as_str() {
            "ascom" => Ok(ImagingKind::Ascom),
            "indi" => Ok(ImagingKind::Indi),
            "sgpro" | "sequence generator pro" => Ok(ImagingKind::SgPro),
            "theskyx" => Ok(ImagingKind::TheSkyX),
            "maximdl" => Ok(ImagingKind::MaximDL),
            "astrometry" | "astrometrynet" | "astrometry.net" => {
                Ok(ImagingKind::AstrometryNet)
            }
            "" | "none" => Ok(ImagingKind::None),
            other => Err(invalid_argument_error(
                format!("Unknown imaging application {:?}", other).as_str())),
        }
    }
}

/// Placeholder for when no imaging application is configured or the
/// configured one cannot be used. Every call fails.
pub struct UnavailableImaging {
    reason: String,
}

impl UnavailableImaging {
    pub fn new(reason: &str) -> Self {
        UnavailableImaging { reason: reason.to_string() }
    }

    fn error(&self) -> CanonicalError {
        failed_precondition_error(
            format!("Imaging not available: {}", self.reason).as_str())
    }
}

impl ImagingProvider for UnavailableImaging {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn get_status(&self) -> Result<ImagingStatus, CanonicalError> {
        Ok(ImagingStatus {
            application_status: self.reason.clone(),
            connected: false,
            camera_state: CameraState::Disconnected,
        })
    }

    fn get_camera_props(&self) -> Result<CameraProps, CanonicalError> {
        Err(self.error())
    }

    fn capture_image(&self, _params: &ImageParams, _cancel: &CancelToken,
                     _progress: ProgressFn) -> Result<PathBuf, CanonicalError> {
        Err(self.error())
    }

    fn solve_image(&self, _path: &Path, _scale_hint: f64, _blind: bool,
                   _use_fits_hints: bool, _cancel: &CancelToken)
                   -> Result<SolveResult, CanonicalError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        let params = ImageParams {
            binning: 1, exposure: 3.0, iso: 100, sub_frame: None,
            base_name: "model_".to_string(), index: 7,
            base_directory: PathBuf::from("/tmp/run"),
            gain: "High".to_string(), speed: "Normal".to_string(),
            scale_hint: 1.3,
        };
        assert_eq!(params.file_name(), "model_007.fit");
        assert_eq!(params.exposure_duration(), Duration::from_secs(3));
        assert_eq!(params.file_path(), PathBuf::from("/tmp/run/model_007.fit"));
    }

    #[test]
    fn test_bad_exposure() {
        let mut params = ImageParams {
            binning: 1, exposure: -1.0, iso: 100, sub_frame: None,
            base_name: "model_".to_string(), index: 1,
            base_directory: PathBuf::from("/tmp/run"),
            gain: String::new(), speed: String::new(), scale_hint: 1.0,
        };
        assert_eq!(params.exposure_seconds(), 0.0);
        assert_eq!(params.exposure_duration(), Duration::ZERO);
        params.exposure = f64::NAN;
        assert_eq!(params.exposure_duration(), Duration::ZERO);
        params.exposure = f64::INFINITY;
        assert_eq!(params.exposure_duration(), Duration::ZERO);
        params.exposure = 1e300;
        assert_eq!(params.exposure_seconds(), MAX_EXPOSURE_SECONDS);
    }

    #[test]
    fn test_sub_frame() {
        let props = CameraProps {
            pixels_x: 4000, pixels_y: 3000, gain_options: vec![],
            can_subframe: true,
        };
        let frame = SubFrame::centered(&props, 0.5).unwrap();
        assert_eq!(frame, SubFrame { off_x: 1000, off_y: 750, size_x: 2000, size_y: 1500 });
        assert!(SubFrame::centered(&props, 1.0).is_none());
        let no_subframe = CameraProps { can_subframe: false, ..props };
        assert!(SubFrame::centered(&no_subframe, 0.5).is_none());
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(ImagingKind::from_name("SGPro").unwrap(), ImagingKind::SgPro);
        assert_eq!(ImagingKind::from_name("TheSkyX").unwrap(), ImagingKind::TheSkyX);
        assert_eq!(ImagingKind::from_name("").unwrap(), ImagingKind::None);
        assert_eq!(ImagingKind::from_name("astrometry.net").unwrap(),
                   ImagingKind::AstrometryNet);
        assert!(ImagingKind::from_name("Photoshop").is_err());
    }

    #[test]
    fn test_unavailable() {
        let imaging = UnavailableImaging::new("ASCOM drivers are not supported");
        let status = imaging.get_status().unwrap();
        assert_eq!(status.camera_state, CameraState::Disconnected);
        assert!(imaging.get_camera_props().is_err());
        assert!(imaging.solve_image(Path::new("x.fit"), 1.0, false, false,
                                    &CancelToken::new()).is_err());
    }
}
