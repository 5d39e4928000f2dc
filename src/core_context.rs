// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use canonical_error::{failed_precondition_error, CanonicalError};
use log::{error, info, warn};

use crate::analyse::RunArtifact;
use crate::astrometry_net::AstrometryNetImaging;
use crate::command_runner::CommandRunner;
use crate::config::Config;
use crate::dome::{DomeProvider, SimulatedDome};
use crate::environment::{EnvironmentProvider, EnvironmentWorker};
use crate::imaging::{ImagingKind, ImagingProvider, UnavailableImaging};
use crate::model_builder::{BuildEvent, BuildMode, ModelBuilder};
use crate::model_point::{HorizonMask, ModelPoint};
use crate::mount_commands::{delete_model, load_model, save_model, SHUTDOWN};
use crate::mount_gateway::{LiveMount, MountGateway};
use crate::mount_poller::MountPollers;
use crate::mount_state::{MountState, SharedMountState};
use crate::point_generator::{generate_base, generate_dso, generate_max,
                             generate_min, generate_normal, load_from_file,
                             Site};
use crate::remote_server::{RemoteCommand, RemoteHandler};
use crate::sgpro_imaging::{SgProImaging, SGPRO_DEFAULT_URL};
use crate::theskyx_imaging::{TheSkyXImaging, THESKYX_DEFAULT_ADDRESS};
use crate::wake_on_lan;

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const ENVIRONMENT_INTERVAL: Duration = Duration::from_secs(30);
// Degrees per second.
const SIMULATED_DOME_RATE: f64 = 5.0;

/// The point lists a build can be started with.
#[derive(Clone, Debug, PartialEq)]
pub enum PointSet {
    Base,
    Normal,
    Min,
    Max,
    File(PathBuf),
}

impl PointSet {
    /// Named sets by name; anything else is a point file.
    pub fn from_name(name: &str) -> PointSet {
        match name.trim().to_lowercase().as_str() {
            "base" => PointSet::Base,
            "normal" => PointSet::Normal,
            "min" => PointSet::Min,
            "max" => PointSet::Max,
            _ => PointSet::File(PathBuf::from(name.trim())),
        }
    }
}

/// Builds the imaging provider the configuration asks for. Applications we
/// cannot drive, and invalid settings, give a provider that reports itself
/// not available.
pub fn select_imaging(config: &Config) -> Arc<dyn ImagingProvider> {
    let kind = match config.imaging_kind() {
        Ok(kind) => kind,
        Err(e) => {
            error!("{}", e.message);
            return Arc::new(UnavailableImaging::new(&e.message));
        }
    };
    let capture: Box<dyn ImagingProvider> = match kind {
        ImagingKind::SgPro => match SgProImaging::new(SGPRO_DEFAULT_URL, config.solve_timeout()) {
            Ok(sgpro) => Box::new(sgpro),
            Err(e) => Box::new(UnavailableImaging::new(&e.message)),
        },
        ImagingKind::TheSkyX => {
            Box::new(TheSkyXImaging::new(THESKYX_DEFAULT_ADDRESS, config.solve_timeout()))
        }
        ImagingKind::Ascom | ImagingKind::Indi | ImagingKind::MaximDL => {
            Box::new(UnavailableImaging::new(
                format!("no driver for {:?}", kind).as_str()))
        }
        ImagingKind::AstrometryNet => {
            Box::new(UnavailableImaging::new("astrometry.net does not capture"))
        }
        ImagingKind::None => Box::new(UnavailableImaging::new("no imaging application")),
    };
    if kind == ImagingKind::AstrometryNet || config.use_astrometry {
        match AstrometryNetImaging::new(capture, config.astrometry_settings()) {
            Ok(imaging) => return Arc::new(imaging),
            Err(e) => return Arc::new(UnavailableImaging::new(&e.message)),
        }
    }
    Arc::from(capture)
}

/// Everything the application shares between its workers: the command
/// runner and pollers for the mount, the mount state they maintain, the
/// selected providers, the model builder and the configuration it was
/// started with.
pub struct CoreContext {
    config: Config,
    mount_state: SharedMountState,
    runner: Arc<CommandRunner>,
    pollers: Mutex<MountPollers>,
    mount: Arc<dyn MountGateway>,
    dome: Option<Arc<dyn DomeProvider>>,
    environment: Mutex<Option<EnvironmentWorker>>,
    builder: Arc<ModelBuilder>,
    build_thread: Mutex<Option<thread::JoinHandle<RunArtifact>>>,
    shutdown_requested: Arc<AtomicBool>,
}

impl CoreContext {
    /// Starts the mount workers. Build events are delivered on the returned
    /// receiver. `shutdown_requested` is set when a remote client asks the
    /// application to exit.
    pub fn new(config: Config,
               environment: Option<Arc<dyn EnvironmentProvider>>,
               shutdown_requested: Arc<AtomicBool>)
               -> (CoreContext, Receiver<BuildEvent>) {
        if let Err(e) = config.validate() {
            error!("Configuration: {}", e.message);
        }
        let imaging = select_imaging(&config);
        CoreContext::with_imaging(config, imaging, environment, shutdown_requested)
    }

    pub fn with_imaging(config: Config, imaging: Arc<dyn ImagingProvider>,
                        environment: Option<Arc<dyn EnvironmentProvider>>,
                        shutdown_requested: Arc<AtomicBool>)
                        -> (CoreContext, Receiver<BuildEvent>) {
        let address = config.mount_address();
        let mount_state = SharedMountState::new();
        let runner = Arc::new(CommandRunner::new(address.clone(), mount_state.clone()));
        let pollers = MountPollers::start(&address, &mount_state);
        let mount: Arc<dyn MountGateway> =
            Arc::new(LiveMount::new(runner.clone(), mount_state.clone(), REPLY_TIMEOUT));

        let dome: Option<Arc<dyn DomeProvider>> = if !config.dome_enabled {
            None
        } else if config.simulation {
            Some(Arc::new(SimulatedDome::new(SIMULATED_DOME_RATE)))
        } else {
            warn!("Dome not available: no dome driver");
            None
        };
        let environment = environment.map(|provider| {
            info!("Environment from {}", provider.name());
            EnvironmentWorker::new(provider, Some(mount.clone()), ENVIRONMENT_INTERVAL)
        });

        let (sender, receiver) = channel();
        let builder = Arc::new(ModelBuilder::new(mount.clone(), imaging, dome.clone(),
                                                 Some(sender)));
        let context = CoreContext {
            config,
            mount_state,
            runner,
            pollers: Mutex::new(pollers),
            mount,
            dome,
            environment: Mutex::new(environment),
            builder,
            build_thread: Mutex::new(None),
            shutdown_requested,
        };
        (context, receiver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mount_state(&self) -> MountState {
        self.mount_state.snapshot()
    }

    pub fn dome(&self) -> Option<&Arc<dyn DomeProvider>> {
        self.dome.as_ref()
    }

    fn horizon_mask(&self) -> HorizonMask {
        if self.config.horizon_mask_file.trim().is_empty() {
            return HorizonMask::default();
        }
        match HorizonMask::from_file(Path::new(&self.config.horizon_mask_file)) {
            Ok(mask) => mask,
            Err(e) => {
                warn!("Ignoring horizon mask: {}", e.message);
                HorizonMask::default()
            }
        }
    }

    /// Points for `set`, filtered and sorted as configured.
    pub fn points(&self, set: &PointSet) -> Result<Vec<ModelPoint>, CanonicalError> {
        let delete = self.config.check_delete_below_horizon;
        let sort = self.config.check_sort_points;
        let horizon = self.horizon_mask();
        Ok(match set {
            PointSet::Base => generate_base(0.0, 45.0, 3),
            PointSet::Normal => generate_normal(delete, sort, &horizon),
            PointSet::Min => generate_min(delete, sort, &horizon),
            PointSet::Max => generate_max(delete, sort, &horizon),
            PointSet::File(path) => load_from_file(path)?,
        })
    }

    /// Points along the track of a target (degrees, J2000) at the mount's
    /// site.
    pub fn dso_points(&self, target_ra: f64, target_dec: f64, hours_span: f64,
                      num_points: usize, preview_hours: f64)
                      -> Result<Vec<ModelPoint>, CanonicalError> {
        let state = self.mount_state.snapshot();
        let site = Site { latitude: state.site_latitude, longitude: state.site_longitude };
        generate_dso(self.config.check_sort_points, hours_span, num_points, preview_hours,
                     target_ra, target_dec, &site, SystemTime::now(),
                     self.config.check_delete_below_horizon, &self.horizon_mask())
    }

    /// Starts a build on its own thread. Refused while another build runs
    /// or when the configuration is invalid.
    pub fn start_build(&self, mode: BuildMode, points: Vec<ModelPoint>)
                       -> Result<(), CanonicalError> {
        self.config.validate()?;
        let mut build_thread = self.build_thread.lock().unwrap();
        if build_thread.as_ref().map_or(false, |t| !t.is_finished()) {
            return Err(failed_precondition_error("A model build is already running"));
        }
        if let Some(finished) = build_thread.take() {
            let _ = finished.join();
        }
        self.builder.clear_cancel();
        let builder = self.builder.clone();
        let settings = self.config.build_settings();
        *build_thread = Some(thread::spawn(move || builder.run_build(mode, points, &settings)));
        Ok(())
    }

    pub fn is_building(&self) -> bool {
        self.build_thread.lock().unwrap().as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn cancel_build(&self) {
        self.builder.cancel();
    }

    /// Waits for the current build and returns its result, if one was
    /// started.
    pub fn wait_build(&self) -> Option<RunArtifact> {
        let handle = self.build_thread.lock().unwrap().take()?;
        match handle.join() {
            Ok(artifact) => {
                self.pollers.lock().unwrap().refresh_model();
                Some(artifact)
            }
            Err(_) => {
                error!("Model build thread panicked");
                None
            }
        }
    }

    fn model_slot(&self, command: &str, what: &str) -> Result<(), CanonicalError> {
        let reply = self.mount.command(command);
        match reply.as_ref().and_then(|r| r.chunk(0)) {
            Some("1") => {
                self.pollers.lock().unwrap().refresh_model();
                Ok(())
            }
            _ => Err(failed_precondition_error(
                format!("Mount could not {}: {:?}", what, reply.map(|r| r.raw)).as_str())),
        }
    }

    pub fn save_model(&self, name: &str) -> Result<(), CanonicalError> {
        // The mount refuses to overwrite a slot.
        let _ = self.mount.command(&delete_model(name));
        self.model_slot(&save_model(name), format!("save model {}", name).as_str())
    }

    pub fn load_model(&self, name: &str) -> Result<(), CanonicalError> {
        self.model_slot(&load_model(name), format!("load model {}", name).as_str())
    }

    pub fn delete_model(&self, name: &str) -> Result<(), CanonicalError> {
        self.model_slot(&delete_model(name), format!("delete model {}", name).as_str())
    }

    pub fn shutdown_mount(&self) -> Result<(), CanonicalError> {
        match self.mount.command(SHUTDOWN).as_ref().and_then(|r| r.chunk(0)) {
            Some("1") => {
                info!("Mount shutting down");
                Ok(())
            }
            other => Err(failed_precondition_error(
                format!("Mount did not accept shutdown: {:?}", other).as_str())),
        }
    }

    pub fn boot_mount(&self) -> Result<(), CanonicalError> {
        if self.config.mount_mac.trim().is_empty() {
            return Err(failed_precondition_error("No mount MAC address configured"));
        }
        wake_on_lan::wake(&self.config.mount_mac)
    }

    /// Cancels any build and stops all workers.
    pub fn stop(&self) {
        self.cancel_build();
        self.wait_build();
        if let Some(mut environment) = self.environment.lock().unwrap().take() {
            environment.stop();
        }
        self.pollers.lock().unwrap().stop();
        self.runner.stop();
    }
}

impl RemoteHandler for CoreContext {
    fn handle(&self, command: RemoteCommand) -> Result<(), CanonicalError> {
        match command {
            RemoteCommand::Shutdown => {
                self.shutdown_requested.store(true, Ordering::Relaxed);
                Ok(())
            }
            RemoteCommand::ShutdownMount => self.shutdown_mount(),
            RemoteCommand::BootMount => self.boot_mount(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::command_runner::tests::fake_mount;
    use crate::simulated_imaging::SimulatedImaging;

    // Answers the slow poll (so the firmware becomes known) and model slot
    // commands.
    fn mount_replies(command: &str) -> String {
        match command {
            "Gev" => "+0585.2#".to_string(),
            "Gg" => "-011:35:00.0#".to_string(),
            "Gt" => "+48:07:00.0#".to_string(),
            "GVD" => "Mar 19 2018#".to_string(),
            "GVN" => "2.15.14#".to_string(),
            "GVP" => "10micron GM1000HPS#".to_string(),
            "GVT" => "15:56:53#".to_string(),
            "GVZ" => "Q-TYPE2012#".to_string(),
            "shutdown" => "1".to_string(),
            "CM" => "Coordinates     matched        #".to_string(),
            c if c.starts_with("Sr") || c.starts_with("Sd") => "1".to_string(),
            c if c.starts_with("modelsv0") || c.starts_with("modelld0") => "1#".to_string(),
            c if c.starts_with("modeldel0") => "0#".to_string(),
            _ => String::new(),
        }
    }

    fn fake_mount_config() -> Config {
        let (address, _) = fake_mount(mount_replies);
        let (ip, port) = address.rsplit_once(':').unwrap();
        Config { mount_ip: ip.to_string(), mount_port: port.parse().unwrap(),
                 ..Default::default() }
    }

    fn context(config: Config) -> (CoreContext, Receiver<BuildEvent>) {
        CoreContext::with_imaging(config, Arc::new(SimulatedImaging::default()), None,
                                  Arc::new(AtomicBool::new(false)))
    }

    fn wait_for_firmware(context: &CoreContext) {
        for _ in 0..100 {
            if context.mount_state().firmware_known() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("firmware never read");
    }

    #[test]
    fn test_select_imaging() {
        let unavailable = |name: &str| {
            let config = Config { imaging_application: name.to_string(), ..Default::default() };
            select_imaging(&config).get_status().map(|s| s.connected).unwrap_or(true)
        };
        assert!(!unavailable("ascom"));
        assert!(!unavailable("maximdl"));
        assert!(!unavailable("none"));
        assert!(!unavailable("bogus"));
        let config = Config { imaging_application: "theskyx".to_string(),
                              ..Default::default() };
        assert_eq!(select_imaging(&config).name(), "TheSkyX");
    }

    #[test]
    fn test_point_sets() {
        assert_eq!(PointSet::from_name("Normal"), PointSet::Normal);
        assert_eq!(PointSet::from_name("max"), PointSet::Max);
        assert_eq!(PointSet::from_name("/tmp/points.txt"),
                   PointSet::File(PathBuf::from("/tmp/points.txt")));
        let (context, _) = context(Config { mount_ip: "127.0.0.1".to_string(),
                                            mount_port: 1, ..Default::default() });
        assert_eq!(context.points(&PointSet::Base).unwrap().len(), 3);
        assert!(!context.points(&PointSet::Normal).unwrap().is_empty());
        assert!(context.points(&PointSet::File(PathBuf::from("/nonexistent"))).is_err());
        context.stop();
    }

    #[test]
    fn test_remote_commands() {
        let (context, _) = context(fake_mount_config());
        wait_for_firmware(&context);

        assert!(context.handle(RemoteCommand::ShutdownMount).is_ok());
        // No MAC configured.
        assert!(context.handle(RemoteCommand::BootMount).is_err());
        assert!(!context.shutdown_requested.load(Ordering::Relaxed));
        assert!(context.handle(RemoteCommand::Shutdown).is_ok());
        assert!(context.shutdown_requested.load(Ordering::Relaxed));

        assert!(context.save_model("Full").is_ok());
        assert!(context.load_model("Full").is_ok());
        assert!(context.delete_model("Full").is_err());
        context.stop();
    }

    #[test]
    fn test_start_build() {
        let dir = std::env::temp_dir().join(format!("core_{}", std::process::id()));
        let config = Config {
            image_directory: dir.to_string_lossy().to_string(),
            settling_time: 0.0,
            exposure: 0.1,
            ..fake_mount_config()
        };
        let (context, events) = context(config);
        wait_for_firmware(&context);
        context.start_build(BuildMode::PlateSolveSync, vec![]).unwrap();
        assert!(context.start_build(BuildMode::Check, vec![]).is_err());
        let artifact = context.wait_build().unwrap();
        assert_eq!(artifact.len(), 1);
        assert!(events.try_iter().any(|e| matches!(e, BuildEvent::Finished { .. })));
        assert!(!context.is_building());
        context.stop();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_cancel_right_after_start() {
        let dir = std::env::temp_dir().join(format!("core_cancel_{}", std::process::id()));
        let config = Config {
            image_directory: dir.to_string_lossy().to_string(),
            settling_time: 0.0,
            exposure: 0.1,
            ..fake_mount_config()
        };
        let (context, events) = context(config);
        wait_for_firmware(&context);
        context.start_build(BuildMode::PlateSolveSync, vec![]).unwrap();
        context.cancel_build();
        assert!(context.wait_build().unwrap().is_empty());
        assert_eq!(events.try_iter().filter(|e| matches!(e, BuildEvent::Cancelled)).count(), 1);

        // The next build is not affected by the earlier cancel.
        context.start_build(BuildMode::PlateSolveSync, vec![]).unwrap();
        assert_eq!(context.wait_build().unwrap().len(), 1);
        context.stop();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_config_refuses_build() {
        let config = Config { exposure: -1.0, ..fake_mount_config() };
        let (context, _) = context(config);
        let err = context.start_build(BuildMode::Check, vec![]).unwrap_err();
        assert_eq!(err.code, canonical_error::CanonicalErrorCode::InvalidArgument);
        assert!(!context.is_building());
        context.stop();
    }
}
