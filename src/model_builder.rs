// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use canonical_error::{aborted_error, deadline_exceeded_error,
                      failed_precondition_error, invalid_argument_error,
                      unavailable_error,
                      CanonicalError, CanonicalErrorCode};
use chrono::Local;
use log::{debug, error, info, warn};

use crate::analyse::{RunArtifact, SolvedFrame};
use crate::astro_util::{j2000_to_jnow, julian_date_from_system_time,
                        residual_arcsec};
use crate::cancel::{CancelToken, WaitOutcome};
use crate::dome::{dome_azimuth, DomeProvider};
use crate::fits_header::{inject_into_file, FrameKeywords};
use crate::imaging::{CaptureProgress, ImageParams, ImagingProvider, SubFrame};
use crate::model_point::ModelPoint;
use crate::mount_commands::{delete_model, model_star_commands, parse_count,
                            parse_model_stars, point_add, save_model,
                            slew_alt_az, sync, END_ALIGNMENT, GET_STAR_COUNT,
                            NEW_ALIGNMENT, TRACKING_ON};
use crate::mount_gateway::MountGateway;
use crate::mount_state::ModelStar;
use crate::simulated_imaging::SimulatedImaging;

/// How long the mount may take to report that a slew has begun.
pub const SLEW_START_TIMEOUT: Duration = Duration::from_secs(3);
// Granularity of every slew and dome wait.
const SLEW_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    Initial,
    Full,
    Refinement,
    Check,
    TimeChange,
    Hysterese,
    PlateSolveSync,
}

impl BuildMode {
    pub fn from_name(name: &str) -> Result<BuildMode, CanonicalError> {
        match name.trim().to_lowercase().as_str() {
            "initial" | "base" => Ok(BuildMode::Initial),
            "full" => Ok(BuildMode::Full),
            "refinement" => Ok(BuildMode::Refinement),
            "check" => Ok(BuildMode::Check),
            "timechange" => Ok(BuildMode::TimeChange),
            "hysterese" => Ok(BuildMode::Hysterese),
            "platesolvesync" | "sync" => Ok(BuildMode::PlateSolveSync),
            other => Err(invalid_argument_error(
                format!("Unknown build mode {:?}", other).as_str())),
        }
    }

    /// Whether solved points are added to the mount's model.
    pub fn programs_model(&self) -> bool {
        matches!(self, BuildMode::Initial | BuildMode::Full | BuildMode::Refinement)
    }

    /// Whether the run starts a fresh alignment and computes it at the end.
    /// Refinement adds to the model already in the mount.
    pub fn opens_alignment(&self) -> bool {
        matches!(self, BuildMode::Initial | BuildMode::Full)
    }

    /// Model slot the result is saved into.
    pub fn slot_name(&self) -> Option<&'static str> {
        match self {
            BuildMode::Initial => Some("Base"),
            BuildMode::Full => Some("Full"),
            BuildMode::Refinement => Some("Refinement"),
            _ => None,
        }
    }

    fn slug(&self) -> &'static str {
        match self {
            BuildMode::Initial => "base",
            BuildMode::Full => "full",
            BuildMode::Refinement => "refinement",
            BuildMode::Check => "check",
            BuildMode::TimeChange => "timechange",
            BuildMode::Hysterese => "hysterese",
            BuildMode::PlateSolveSync => "platesolvesync",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

#[derive(Clone, Debug)]
pub struct ModelBuildSettings {
    pub settling_time: Duration,
    pub keep_images: bool,
    // Use the built-in simulator instead of the configured imaging provider.
    pub simulation: bool,
    pub binning: u32,
    // Seconds.
    pub exposure: f64,
    pub iso: u32,
    // Fraction of the sensor to read out; 1.0 for the full frame.
    pub sub_frame_scale: f64,
    // Arcseconds per pixel, used when the frame carries no scale of its own.
    pub scale_hint: f64,
    pub blind: bool,
    pub use_fits_hints: bool,
    pub gain: String,
    pub speed: String,
    // Each run images into its own subdirectory of this.
    pub base_directory: PathBuf,
    // Defaults to a timestamped file in base_directory.
    pub artifact_path: Option<PathBuf>,
    // TimeChange and Hysterese repetitions.
    pub iterations: usize,
    pub slew_timeout: Duration,
}

impl Default for ModelBuildSettings {
    fn default() -> Self {
        ModelBuildSettings {
            settling_time: Duration::from_secs(1),
            keep_images: false,
            simulation: false,
            binning: 1,
            exposure: 3.0,
            iso: 100,
            sub_frame_scale: 1.0,
            scale_hint: 1.0,
            blind: false,
            use_fits_hints: true,
            gain: String::new(),
            speed: String::new(),
            base_directory: std::env::temp_dir().join("mountmodel"),
            artifact_path: None,
            iterations: 10,
            slew_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Clone, Debug)]
pub enum BuildEvent {
    Started { mode: BuildMode, points: usize },
    // Whole seconds of settling left before imaging point `index`.
    Settling { index: usize, remaining: u32 },
    Capture { index: usize, progress: CaptureProgress },
    // The point is done; it can be removed from the sky plot.
    PointDone { index: usize, frame: SolvedFrame },
    PointSkipped { index: usize, reason: String },
    Cancelled,
    Finished { mode: BuildMode, accepted: usize },
}

/// Summary of a run's solved frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveStatistics {
    pub mean_error: f64,
    pub max_error: f64,
    pub mean_solve_time: f64,
}

pub fn solve_statistics(frames: &[SolvedFrame]) -> Option<SolveStatistics> {
    if frames.is_empty() {
        return None;
    }
    let n = frames.len() as f64;
    Some(SolveStatistics {
        mean_error: frames.iter().map(|f| f.model_error).sum::<f64>() / n,
        max_error: frames.iter().map(|f| f.model_error).fold(0.0, f64::max),
        mean_solve_time: frames.iter().map(|f| f.solve_time).sum::<f64>() / n,
    })
}

/// Replaces the residuals of programmed frames with the per-star errors the
/// mount reports after computing its model. Returns the number of frames
/// updated.
pub fn retrofit(frames: &mut [SolvedFrame], stars: &[ModelStar]) -> usize {
    let mut updated = 0;
    for frame in frames.iter_mut() {
        let Some(star_index) = frame.star_index else {
            continue;
        };
        let Some(star) = stars.iter().find(|s| s.index == star_index) else {
            continue;
        };
        let angle = star.error_angle.to_radians();
        frame.ra_error = star.error_arcsec * angle.sin();
        frame.dec_error = star.error_arcsec * angle.cos();
        frame.model_error = star.error_arcsec;
        updated += 1;
    }
    updated
}

/// The positions visited by a run, in order. TimeChange repeats the first
/// point; Hysterese alternates the first two and images only every second
/// visit.
pub fn build_sequence(mode: BuildMode, points: Vec<ModelPoint>,
                      iterations: usize) -> Vec<ModelPoint> {
    let points: Vec<ModelPoint> = points.into_iter().filter(|p| p.visible).collect();
    match mode {
        BuildMode::TimeChange => match points.first() {
            Some(first) => (0..iterations)
                .map(|i| ModelPoint { index: i, ..*first })
                .collect(),
            None => Vec::new(),
        },
        BuildMode::Hysterese => {
            if points.is_empty() {
                return Vec::new();
            }
            let pair = &points[..points.len().min(2)];
            (0..iterations * 2)
                .map(|i| ModelPoint {
                    index: i,
                    solve: i % 2 == 1,
                    ..pair[i % pair.len()]
                })
                .collect()
        }
        BuildMode::PlateSolveSync => Vec::new(),
        _ => points,
    }
}

// State of one run.
struct Run<'a> {
    mode: BuildMode,
    settings: &'a ModelBuildSettings,
    imaging: &'a dyn ImagingProvider,
    run_dir: PathBuf,
    sub_frame: Option<SubFrame>,
    frames: Vec<SolvedFrame>,
    cancel_reported: bool,
}

/// Runs model builds against a mount, an imaging provider and optionally a
/// dome. A build is strictly sequential; cancel() may be called from any
/// thread.
pub struct ModelBuilder {
    mount: Arc<dyn MountGateway>,
    imaging: Arc<dyn ImagingProvider>,
    dome: Option<Arc<dyn DomeProvider>>,
    cancel: CancelToken,
    events: Option<Sender<BuildEvent>>,
}

impl ModelBuilder {
    pub fn new(mount: Arc<dyn MountGateway>,
               imaging: Arc<dyn ImagingProvider>,
               dome: Option<Arc<dyn DomeProvider>>,
               events: Option<Sender<BuildEvent>>) -> Self {
        ModelBuilder { mount, imaging, dome, cancel: CancelToken::new(), events }
    }

    /// Requests that the running build stop at its next suspension point.
    /// Calling it again has no further effect.
    pub fn cancel(&self) {
        if self.cancel.cancel() {
            info!("Model build cancel requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clears an earlier cancel. Called when a new build is accepted, before
    /// its thread starts, so a cancel that arrives in between is kept.
    pub fn clear_cancel(&self) {
        self.cancel.reset();
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }

    /// Runs a build to completion or cancellation. Never fails: points whose
    /// stages fail are skipped, and the frames collected so far are always
    /// returned. A cancel issued before the call stops the build before it
    /// moves the mount; see clear_cancel().
    pub fn run_build(&self, mode: BuildMode, points: Vec<ModelPoint>,
                     settings: &ModelBuildSettings) -> RunArtifact {
        let stamp = Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        let run_dir = settings.base_directory.join(format!("{}-{}", stamp, mode));
        if let Err(e) = fs::create_dir_all(&run_dir) {
            error!("Cannot create image directory {:?}: {}", run_dir, e);
        }
        let simulator = SimulatedImaging::default();
        let imaging: &dyn ImagingProvider = if settings.simulation {
            &simulator
        } else {
            self.imaging.as_ref()
        };
        let sub_frame = match imaging.get_camera_props() {
            Ok(props) => SubFrame::centered(&props, settings.sub_frame_scale),
            Err(e) => {
                debug!("No camera properties from {}: {}", imaging.name(), e);
                None
            }
        };
        let mut run = Run {
            mode, settings, imaging, run_dir, sub_frame,
            frames: Vec::new(),
            cancel_reported: false,
        };

        let sequence = build_sequence(mode, points, settings.iterations);
        info!("Starting {} build with {} points using {}",
              mode, sequence.len().max(1), imaging.name());
        self.emit(BuildEvent::Started { mode, points: sequence.len() });
        let alignment_open = mode.opens_alignment() && !self.gate(&mut run);
        if alignment_open && self.mount.command(NEW_ALIGNMENT).is_none() {
            warn!("No reply opening the alignment session");
        }

        match mode {
            BuildMode::PlateSolveSync => self.plate_solve_sync(&mut run),
            BuildMode::TimeChange => self.time_change(&mut run, sequence),
            _ => self.visit_points(&mut run, sequence),
        }
        let cancelled = self.gate(&mut run);
        let compute_model = mode.programs_model() && !cancelled && !run.frames.is_empty();

        if alignment_open && !compute_model {
            // Nothing will be saved; the reply does not matter.
            let reply = self.mount.command(END_ALIGNMENT);
            info!("Closed alignment session without saving: {:?}", reply.map(|r| r.raw));
        }
        // Never leave the mount stopped.
        if self.mount.command(TRACKING_ON).is_none() {
            error!("Could not turn tracking on after the build");
        }
        if compute_model {
            self.finish_model(&mut run);
        }
        if let Some(stats) = solve_statistics(&run.frames) {
            info!("Model error mean {:.1} arcsec, max {:.1} arcsec; mean solve time {:.1}s",
                  stats.mean_error, stats.max_error, stats.mean_solve_time);
        }

        let artifact = RunArtifact::from_frames(&run.frames);
        let artifact_path = settings.artifact_path.clone().unwrap_or_else(|| {
            settings.base_directory.join(format!("{}-{}.model", stamp, mode))
        });
        if let Err(e) = artifact.write_atomic(&artifact_path) {
            error!("Could not write run results: {}", e);
        }
        if !settings.keep_images {
            if let Err(e) = fs::remove_dir_all(&run.run_dir) {
                warn!("Could not remove {:?}: {}", run.run_dir, e);
            }
        }
        let accepted = run.frames.len();
        self.emit(BuildEvent::Finished { mode, accepted });
        info!("Model build {} finished: {} points accepted", mode, accepted);
        artifact
    }

    // Returns true if the build is cancelled. Reports the cancellation once.
    fn gate(&self, run: &mut Run) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        if !run.cancel_reported {
            run.cancel_reported = true;
            info!("Model build {} cancelled with {} points accepted",
                  run.mode, run.frames.len());
            self.emit(BuildEvent::Cancelled);
        }
        true
    }

    fn skip(&self, index: usize, e: &CanonicalError) {
        if e.code == CanonicalErrorCode::Aborted {
            return;
        }
        warn!("Point {} skipped: {}", index, e.message);
        self.emit(BuildEvent::PointSkipped { index, reason: e.message.clone() });
    }

    fn record(&self, run: &mut Run, frame: SolvedFrame) {
        info!("Point {} solved: ra error {:.1} dec error {:.1} total {:.1} arcsec",
              frame.index, frame.ra_error, frame.dec_error, frame.model_error);
        self.emit(BuildEvent::PointDone { index: frame.index, frame: frame.clone() });
        run.frames.push(frame);
    }

    fn visit_points(&self, run: &mut Run, sequence: Vec<ModelPoint>) {
        for point in sequence {
            if self.gate(run) {
                return;
            }
            match self.visit(run, &point) {
                Ok(Some(frame)) => self.record(run, frame),
                Ok(None) => {}
                Err(e) => self.skip(point.index, &e),
            }
        }
    }

    fn visit(&self, run: &Run, point: &ModelPoint)
             -> Result<Option<SolvedFrame>, CanonicalError> {
        self.slew(run.settings, point)?;
        if !point.solve {
            return Ok(None);
        }
        self.settle(run.settings, point.index)?;
        let mut frame = self.image_and_solve(run, point.index)?;
        if run.mode.programs_model() {
            self.program(&mut frame)?;
        }
        Ok(Some(frame))
    }

    fn time_change(&self, run: &mut Run, sequence: Vec<ModelPoint>) {
        let Some(first) = sequence.first() else {
            return;
        };
        if self.gate(run) {
            return;
        }
        if let Err(e) = self.slew(run.settings, first) {
            self.skip(first.index, &e);
            return;
        }
        if self.mount.command(TRACKING_ON).is_none() {
            warn!("Could not turn tracking on");
        }
        for point in &sequence {
            if self.gate(run) {
                return;
            }
            let result = self.settle(run.settings, point.index)
                .and_then(|_| self.image_and_solve(run, point.index));
            match result {
                Ok(frame) => self.record(run, frame),
                Err(e) => self.skip(point.index, &e),
            }
        }
    }

    fn plate_solve_sync(&self, run: &mut Run) {
        if self.gate(run) {
            return;
        }
        let result = self.image_and_solve(run, 0).and_then(|frame| {
            let command = sync(frame.ra_jnow_solved, frame.dec_jnow_solved);
            match self.mount.command(&command) {
                Some(reply) => {
                    info!("Mount synced: {:?}", reply.raw);
                    Ok(frame)
                }
                None => Err(unavailable_error("No reply to sync")),
            }
        });
        match result {
            Ok(frame) => self.record(run, frame),
            Err(e) => self.skip(0, &e),
        }
    }

    // Slews the mount (and dome, if connected) and waits until both stop.
    fn slew(&self, settings: &ModelBuildSettings, point: &ModelPoint)
            -> Result<(), CanonicalError> {
        let reply = self.mount.command(&slew_alt_az(point.azimuth, point.altitude))
            .ok_or_else(|| unavailable_error("No reply to slew"))?;
        if reply.last_chunk() != Some("0") {
            return Err(failed_precondition_error(
                format!("Mount refused slew to az {:.2} alt {:.2}: {:?}",
                        point.azimuth, point.altitude, reply.raw).as_str()));
        }
        match self.cancel.wait_until(SLEW_POLL, SLEW_START_TIMEOUT,
                                     || self.mount.snapshot().slewing) {
            WaitOutcome::Satisfied => {}
            WaitOutcome::TimedOut => {
                return Err(deadline_exceeded_error("Slew did not start"));
            }
            WaitOutcome::Cancelled => return Err(aborted_error("Cancelled during slew")),
        }
        let dome = self.dome.as_deref().filter(|d| d.is_connected());
        if let Some(dome) = dome {
            if let Err(e) = dome.slew_to_azimuth(dome_azimuth(point.azimuth)) {
                warn!("Dome {} did not slew: {}", dome.name(), e.message);
            }
        }
        let stopped = || {
            !self.mount.snapshot().slewing
                && dome.map_or(true, |d| !d.is_slewing().unwrap_or(false))
        };
        match self.cancel.wait_until(SLEW_POLL, settings.slew_timeout, stopped) {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::TimedOut => Err(deadline_exceeded_error("Slew did not finish")),
            WaitOutcome::Cancelled => Err(aborted_error("Cancelled during slew")),
        }
    }

    fn settle(&self, settings: &ModelBuildSettings, index: usize)
              -> Result<(), CanonicalError> {
        let mut remaining = settings.settling_time;
        while !remaining.is_zero() {
            self.emit(BuildEvent::Settling {
                index,
                remaining: remaining.as_secs_f64().ceil() as u32,
            });
            let step = remaining.min(Duration::from_secs(1));
            if self.cancel.sleep(step) {
                return Err(aborted_error("Cancelled while settling"));
            }
            remaining -= step;
        }
        Ok(())
    }

    // Snapshot, capture, annotate, solve and compute the residual.
    fn image_and_solve(&self, run: &Run, index: usize)
                       -> Result<SolvedFrame, CanonicalError> {
        let settings = run.settings;
        let state = self.mount.snapshot();
        let date_obs = SystemTime::now();
        let params = ImageParams {
            binning: settings.binning,
            exposure: settings.exposure,
            iso: settings.iso,
            sub_frame: run.sub_frame,
            base_name: format!("{}_", run.mode),
            index,
            base_directory: run.run_dir.clone(),
            gain: settings.gain.clone(),
            speed: settings.speed.clone(),
            scale_hint: settings.scale_hint,
        };
        let progress = |progress: CaptureProgress| {
            self.emit(BuildEvent::Capture { index, progress });
        };
        let image_path = run.imaging.capture_image(&params, &self.cancel, &progress)?;

        let keywords = FrameKeywords {
            date_obs,
            ra_j2000: state.ra_j2000,
            dec_j2000: state.dec_j2000,
            ra_jnow: state.ra_jnow,
            dec_jnow: state.dec_jnow,
            local_sidereal_time: state.local_sidereal_time.clone(),
            pier_side: state.pier_side,
            exposure: settings.exposure,
            azimuth: state.azimuth,
            altitude: state.altitude,
        };
        let scale_hint = inject_into_file(&image_path, &keywords, settings.scale_hint)?;

        self.cancel.check("plate solve")?;
        let solved = run.imaging.solve_image(&image_path, scale_hint, settings.blind,
                                             settings.use_fits_hints, &self.cancel)?;
        let jd = julian_date_from_system_time(&date_obs);
        let (ra_jnow_solved, dec_jnow_solved) =
            j2000_to_jnow(solved.ra_j2000, solved.dec_j2000, jd);
        let (ra_error, dec_error, model_error) = residual_arcsec(
            state.ra_j2000, state.dec_j2000, solved.ra_j2000, solved.dec_j2000);

        Ok(SolvedFrame {
            index,
            azimuth: state.azimuth,
            altitude: state.altitude,
            ra_jnow: state.ra_jnow,
            dec_jnow: state.dec_jnow,
            ra_j2000: state.ra_j2000,
            dec_j2000: state.dec_j2000,
            ra_j2000_solved: solved.ra_j2000,
            dec_j2000_solved: solved.dec_j2000,
            ra_jnow_solved,
            dec_jnow_solved,
            local_sidereal_time: state.local_sidereal_time,
            local_sidereal_hours: state.local_sidereal_hours,
            pier_side: state.pier_side,
            scale: solved.scale,
            roll: solved.roll,
            solve_time: solved.wall_time,
            binning: settings.binning,
            exposure: settings.exposure,
            sub_frame: run.sub_frame,
            image_path,
            refraction_temperature: state.refraction_temperature,
            refraction_pressure: state.refraction_pressure,
            ra_error,
            dec_error,
            model_error,
            star_index: None,
        })
    }

    // Adds the solved position to the mount's model.
    fn program(&self, frame: &mut SolvedFrame) -> Result<(), CanonicalError> {
        let reply = self.mount.command(&point_add(frame.ra_jnow_solved, frame.dec_jnow_solved))
            .ok_or_else(|| unavailable_error("No reply to point add"))?;
        if reply.last_chunk() != Some("V") {
            return Err(failed_precondition_error(
                format!("Mount rejected point: {:?}", reply.raw).as_str()));
        }
        frame.star_index = self.mount.command(GET_STAR_COUNT)
            .and_then(|r| r.chunk(0).and_then(|c| parse_count(c).ok()));
        debug!("Point {} is alignment star {:?}", frame.index, frame.star_index);
        Ok(())
    }

    // Computes and saves the model, then takes over the mount's residuals.
    fn finish_model(&self, run: &mut Run) {
        if run.mode.opens_alignment() {
            match self.mount.command(END_ALIGNMENT) {
                Some(reply) if reply.last_chunk() == Some("V") => {
                    info!("Mount computed the model");
                }
                other => {
                    error!("Mount did not compute the model: {:?}", other.map(|r| r.raw));
                    return;
                }
            }
        }
        if let Some(slot) = run.mode.slot_name() {
            self.mount.command(&delete_model(slot));
            if self.mount.command(&save_model(slot)).is_none() {
                warn!("Could not save model slot {}", slot);
            }
        }
        let count = self.mount.command(GET_STAR_COUNT)
            .and_then(|r| r.chunk(0).and_then(|c| parse_count(c).ok()))
            .unwrap_or(0);
        if count == 0 {
            warn!("Mount reports no alignment stars after computing the model");
            return;
        }
        match self.mount.command(&model_star_commands(count)) {
            Some(reply) => {
                let stars = parse_model_stars(&reply);
                let updated = retrofit(&mut run.frames, &stars);
                info!("Took residuals of {} points from the mount's model", updated);
            }
            None => warn!("Could not read the mount's alignment stars"),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::command_class::Reply;
    use crate::dome::SimulatedDome;
    use crate::fits_header::write_reference_image;
    use crate::imaging::{CameraProps, CameraState, ImagingStatus, ProgressFn,
                         SolveResult};
    use crate::mount_state::MountState;

    #[derive(Default)]
    struct FakeMountInner {
        log: Vec<String>,
        slewing_polls: u32,
        stars: usize,
    }

    // Replies "V" to every point add and reports 3600" at 90 degrees for
    // every alignment star.
    #[derive(Default)]
    struct FakeMount {
        inner: Mutex<FakeMountInner>,
    }

    impl FakeMount {
        fn log(&self) -> Vec<String> {
            self.inner.lock().unwrap().log.clone()
        }
    }

    impl MountGateway for FakeMount {
        fn command(&self, command: &str) -> Option<Reply> {
            let mut inner = self.inner.lock().unwrap();
            inner.log.push(command.to_string());
            let chunks: Vec<String> = if command.ends_with(":MS#") {
                inner.slewing_polls = 2;
                vec!["1".to_string(), "1".to_string(), "0".to_string()]
            } else if command.ends_with(":CMS#") {
                inner.stars += 1;
                vec!["1".to_string(), "1".to_string(), "V".to_string()]
            } else if command == GET_STAR_COUNT {
                vec![inner.stars.to_string()]
            } else if command.starts_with(":getalp") {
                (0..command.matches("getalp").count())
                    .map(|_| "12:00:00.00,+45*00:00.0, 3600.0,090".to_string())
                    .collect()
            } else if command == END_ALIGNMENT {
                vec!["V".to_string()]
            } else {
                vec![]
            };
            Some(Reply { raw: chunks.join("#"), chunks })
        }

        fn snapshot(&self) -> MountState {
            let mut inner = self.inner.lock().unwrap();
            let slewing = inner.slewing_polls > 0;
            if slewing {
                inner.slewing_polls -= 1;
            }
            MountState {
                ra_j2000: 150.0,
                dec_j2000: 40.0,
                ra_jnow: 150.3,
                dec_jnow: 39.9,
                azimuth: 100.0,
                altitude: 50.0,
                local_sidereal_time: "10:00:00.00".to_string(),
                local_sidereal_hours: 10.0,
                pier_side: 'W',
                slewing,
                tracking: true,
                firmware_number: 21514,
                ..MountState::new()
            }
        }
    }

    // Solves every frame one degree east of the mount's position, except
    // the `fail_on`th solve (0-based).
    struct FakeImaging {
        solves: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl FakeImaging {
        fn new(fail_on: Option<usize>) -> Self {
            FakeImaging { solves: AtomicUsize::new(0), fail_on }
        }
    }

    impl ImagingProvider for FakeImaging {
        fn name(&self) -> &str {
            "fake"
        }

        fn get_status(&self) -> Result<ImagingStatus, CanonicalError> {
            Ok(ImagingStatus {
                application_status: "ok".to_string(),
                connected: true,
                camera_state: CameraState::Idle,
            })
        }

        fn get_camera_props(&self) -> Result<CameraProps, CanonicalError> {
            Ok(CameraProps { pixels_x: 8, pixels_y: 8, gain_options: vec![],
                             can_subframe: false })
        }

        fn capture_image(&self, params: &ImageParams, _cancel: &CancelToken,
                         _progress: ProgressFn) -> Result<PathBuf, CanonicalError> {
            let path = params.file_path();
            write_reference_image(&path, 8, 8)?;
            Ok(path)
        }

        fn solve_image(&self, _path: &Path, scale_hint: f64, _blind: bool,
                       _use_fits_hints: bool, _cancel: &CancelToken)
                       -> Result<SolveResult, CanonicalError> {
            let n = self.solves.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_on {
                return Err(failed_precondition_error("No stars found"));
            }
            Ok(SolveResult { ra_j2000: 151.0, dec_j2000: 40.0, scale: scale_hint,
                             roll: 0.0, wall_time: 0.5 })
        }
    }

    fn points(n: usize) -> Vec<ModelPoint> {
        (0..n).map(|i| ModelPoint::new(i, 10.0 + 30.0 * i as f64, 45.0)).collect()
    }

    fn settings(name: &str) -> ModelBuildSettings {
        let dir = std::env::temp_dir()
            .join(format!("builder_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        ModelBuildSettings {
            settling_time: Duration::ZERO,
            exposure: 0.0,
            scale_hint: 1.2,
            artifact_path: Some(dir.join("run.model")),
            base_directory: dir,
            ..Default::default()
        }
    }

    fn count_fits(dir: &Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries.flatten()
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    count_fits(&path)
                } else {
                    usize::from(path.extension().map_or(false, |x| x == "fit"))
                }
            })
            .sum()
    }

    #[test]
    fn test_point_add_loop() {
        let mount = Arc::new(FakeMount::default());
        let dome = Arc::new(SimulatedDome::new(3600.0));
        let (tx, rx) = channel();
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(None)),
                                        Some(dome.clone() as Arc<dyn DomeProvider>),
                                        Some(tx));
        let settings = settings("s4");
        let artifact = builder.run_build(BuildMode::Full, points(3), &settings);

        assert_eq!(artifact.len(), 3);
        for value in artifact.column_f64("RaError").unwrap() {
            assert_abs_diff_eq!(value, 3600.0, epsilon = 1e-6);
        }
        for value in artifact.column_f64("DecError").unwrap() {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-6);
        }
        for value in artifact.column_f64("ModelError").unwrap() {
            assert_abs_diff_eq!(value, 3600.0, epsilon = 1e-6);
        }
        assert_eq!(artifact.column_f64("StarIndex").unwrap(), vec![1.0, 2.0, 3.0]);

        let finished: Vec<usize> = rx.try_iter()
            .filter_map(|e| match e {
                BuildEvent::Finished { accepted, .. } => Some(accepted),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![3]);

        let log = mount.log();
        assert_eq!(log.first().map(String::as_str), Some(NEW_ALIGNMENT));
        assert!(log.iter().any(|c| c == END_ALIGNMENT));
        assert!(log.iter().any(|c| *c == save_model("Full")));
        assert!(log.iter().any(|c| c == TRACKING_ON));
        assert_abs_diff_eq!(dome.azimuth().unwrap(), 70.0, epsilon = 1e-9);

        assert_eq!(count_fits(&settings.base_directory), 0);
        assert_eq!(RunArtifact::load(&settings.base_directory.join("run.model")).unwrap(),
                   artifact);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_partial_failure() {
        let mount = Arc::new(FakeMount::default());
        let (tx, rx) = channel();
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(Some(1))),
                                        None, Some(tx));
        let settings = ModelBuildSettings { keep_images: true, ..settings("s5") };
        let artifact = builder.run_build(BuildMode::Full, points(4), &settings);

        assert_eq!(artifact.column_f64("Index").unwrap(), vec![0.0, 2.0, 3.0]);
        let skipped: Vec<usize> = rx.try_iter()
            .filter_map(|e| match e {
                BuildEvent::PointSkipped { index, .. } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec![1]);
        // The failed point was captured; kept images stay.
        assert_eq!(count_fits(&settings.base_directory), 4);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_cancel_while_settling() {
        let mount = Arc::new(FakeMount::default());
        let (tx, rx) = channel();
        let builder = Arc::new(ModelBuilder::new(
            mount.clone(), Arc::new(FakeImaging::new(None)), None, Some(tx)));
        let settling = Duration::from_secs(1);
        let settings = ModelBuildSettings { settling_time: settling, ..settings("s6") };

        let worker = {
            let builder = builder.clone();
            let settings = settings.clone();
            thread::spawn(move || builder.run_build(BuildMode::Full, points(3), &settings))
        };
        let cancelled_at = loop {
            if let BuildEvent::Settling { index: 1, .. } = rx.recv().unwrap() {
                builder.cancel();
                break Instant::now();
            }
        };
        let artifact = worker.join().unwrap();
        assert!(cancelled_at.elapsed() < settling + Duration::from_millis(200));

        assert_eq!(artifact.column_f64("Index").unwrap(), vec![0.0]);
        let log = mount.log();
        assert_eq!(log.last().map(String::as_str), Some(TRACKING_ON));
        // The session is closed but nothing is saved.
        assert_eq!(log.iter().filter(|c| *c == END_ALIGNMENT).count(), 1);
        assert!(!log.iter().any(|c| *c == save_model("Full")));
        assert!(!log.iter().any(|c| c.starts_with(":getalp")));
        assert_eq!(count_fits(&settings.base_directory), 0);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mount = Arc::new(FakeMount::default());
        let (tx, rx) = channel();
        let builder = Arc::new(ModelBuilder::new(
            mount, Arc::new(FakeImaging::new(None)), None, Some(tx)));
        let settings = ModelBuildSettings {
            settling_time: Duration::from_secs(1),
            ..settings("cancel")
        };
        let worker = {
            let builder = builder.clone();
            let settings = settings.clone();
            thread::spawn(move || builder.run_build(BuildMode::Check, points(5), &settings))
        };
        loop {
            if let BuildEvent::Settling { index: 0, .. } = rx.recv().unwrap() {
                break;
            }
        }
        for _ in 0..5 {
            builder.cancel();
        }
        let artifact = worker.join().unwrap();
        builder.cancel();
        assert!(artifact.validate().is_ok());
        assert!(artifact.is_empty());
        let cancelled = rx.try_iter().filter(|e| matches!(e, BuildEvent::Cancelled)).count();
        assert_eq!(cancelled, 1);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_cancel_before_start() {
        let mount = Arc::new(FakeMount::default());
        let (tx, rx) = channel();
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(None)),
                                        None, Some(tx));
        let settings = settings("precancel");
        builder.cancel();
        let artifact = builder.run_build(BuildMode::Full, points(3), &settings);
        assert!(artifact.is_empty());
        assert!(artifact.validate().is_ok());
        assert_eq!(rx.try_iter().filter(|e| matches!(e, BuildEvent::Cancelled)).count(), 1);
        assert_eq!(mount.log(), vec![TRACKING_ON.to_string()]);

        // Accepting the next build clears the cancel.
        builder.clear_cancel();
        let artifact = builder.run_build(BuildMode::Full, points(3), &settings);
        assert_eq!(artifact.len(), 3);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_failed_build_closes_alignment() {
        let mount = Arc::new(FakeMount::default());
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(Some(0))),
                                        None, None);
        let settings = settings("closes");
        let artifact = builder.run_build(BuildMode::Full, points(1), &settings);
        assert!(artifact.is_empty());
        assert_eq!(mount.log(), vec![NEW_ALIGNMENT.to_string(),
                                     slew_alt_az(10.0, 45.0),
                                     END_ALIGNMENT.to_string(),
                                     TRACKING_ON.to_string()]);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_check_does_not_program() {
        let mount = Arc::new(FakeMount::default());
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(None)),
                                        None, None);
        let settings = settings("check");
        let artifact = builder.run_build(BuildMode::Check, points(2), &settings);
        assert_eq!(artifact.len(), 2);
        // Residuals straight from the solve.
        for value in artifact.column_f64("RaError").unwrap() {
            assert_abs_diff_eq!(value, 3600.0, epsilon = 1e-6);
        }
        let log = mount.log();
        assert!(!log.iter().any(|c| c.ends_with(":CMS#") || c == NEW_ALIGNMENT));
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_plate_solve_sync() {
        let mount = Arc::new(FakeMount::default());
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(None)),
                                        None, None);
        let settings = settings("sync");
        let artifact = builder.run_build(BuildMode::PlateSolveSync, points(3), &settings);
        assert_eq!(artifact.len(), 1);
        let log = mount.log();
        assert!(!log.iter().any(|c| c.ends_with(":MS#")));
        assert_eq!(log.iter().filter(|c| c.ends_with(":CM#")).count(), 1);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_hysterese_solves_every_second_visit() {
        let mount = Arc::new(FakeMount::default());
        let builder = ModelBuilder::new(mount.clone(), Arc::new(FakeImaging::new(None)),
                                        None, None);
        let settings = ModelBuildSettings { iterations: 2, ..settings("hysterese") };
        let artifact = builder.run_build(BuildMode::Hysterese, points(2), &settings);
        assert_eq!(artifact.column_f64("Index").unwrap(), vec![1.0, 3.0]);
        assert_eq!(mount.log().iter().filter(|c| c.ends_with(":MS#")).count(), 4);
        fs::remove_dir_all(&settings.base_directory).unwrap();
    }

    #[test]
    fn test_mode_names() {
        for mode in [BuildMode::Initial, BuildMode::Full, BuildMode::Refinement,
                     BuildMode::Check, BuildMode::TimeChange, BuildMode::Hysterese,
                     BuildMode::PlateSolveSync] {
            assert_eq!(BuildMode::from_name(&mode.to_string()).unwrap(), mode);
        }
        assert_eq!(BuildMode::from_name("Full").unwrap().slot_name(), Some("Full"));
        assert_eq!(BuildMode::Initial.slot_name(), Some("Base"));
        assert!(BuildMode::from_name("bogus").is_err());
    }

    #[test]
    fn test_build_sequence() {
        let time_change = build_sequence(BuildMode::TimeChange, points(3), 4);
        assert_eq!(time_change.len(), 4);
        assert!(time_change.iter().all(|p| p.azimuth == 10.0));

        let hysterese = build_sequence(BuildMode::Hysterese, points(3), 2);
        let azimuths: Vec<f64> = hysterese.iter().map(|p| p.azimuth).collect();
        assert_eq!(azimuths, vec![10.0, 40.0, 10.0, 40.0]);
        let solves: Vec<bool> = hysterese.iter().map(|p| p.solve).collect();
        assert_eq!(solves, vec![false, true, false, true]);

        let mut list = points(3);
        list[1].visible = false;
        let full = build_sequence(BuildMode::Full, list, 0);
        assert_eq!(full.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 2]);
        assert!(build_sequence(BuildMode::PlateSolveSync, points(3), 3).is_empty());
    }

    #[test]
    fn test_retrofit_and_statistics() {
        let mut frames = vec![
            SolvedFrame { index: 0, star_index: Some(2), model_error: 5.0,
                          solve_time: 1.0, ..Default::default() },
            SolvedFrame { index: 1, star_index: None, model_error: 7.0,
                          solve_time: 3.0, ..Default::default() },
        ];
        let stars = vec![ModelStar { index: 2, hour_angle: 1.0, dec: 10.0,
                                     error_arcsec: 10.0, error_angle: 30.0 }];
        assert_eq!(retrofit(&mut frames, &stars), 1);
        assert_abs_diff_eq!(frames[0].ra_error, 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(frames[0].dec_error, 10.0 * 30f64.to_radians().cos(), epsilon = 1e-9);
        assert_eq!(frames[0].model_error, 10.0);
        assert_eq!(frames[1].model_error, 7.0);

        let stats = solve_statistics(&frames).unwrap();
        assert_abs_diff_eq!(stats.mean_error, 8.5, epsilon = 1e-9);
        assert_eq!(stats.max_error, 10.0);
        assert_abs_diff_eq!(stats.mean_solve_time, 2.0, epsilon = 1e-9);
        assert!(solve_statistics(&[]).is_none());
    }
}
