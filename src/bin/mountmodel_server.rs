// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use mountmodel::config::Config;
use mountmodel::core_context::{CoreContext, PointSet};
use mountmodel::environment::{EnvironmentProvider, SimulatedEnvironment};
use mountmodel::model_builder::{BuildEvent, BuildMode};
use mountmodel::remote_server::RemoteServer;

const EVENT_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file. Read at startup and written back at shutdown.
    #[arg(long, default_value = "./mountmodel_config.json")]
    config: PathBuf,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "mountmodel_log.txt")]
    log_file: String,

    /// Overrides MountIP from the configuration file for this run.
    #[arg(long)]
    mount_ip: Option<String>,

    /// Use the simulated camera, environment and dome.
    #[arg(long, default_value_t = false)]
    simulation: bool,

    /// Run one model build and exit: initial, full, refinement, check,
    /// timechange, hysterese or platesolvesync.
    #[arg(long)]
    build: Option<String>,

    /// Points for --build: base, normal, min, max, or a point file.
    #[arg(long, default_value = "normal")]
    points: String,

    /// Target right ascension (degrees, J2000). With --dso_dec, models
    /// along the target's track instead of using --points.
    #[arg(long)]
    dso_ra: Option<f64>,

    /// Target declination (degrees, J2000).
    #[arg(long)]
    dso_dec: Option<f64>,

    /// Hours of the target's track to cover.
    #[arg(long, default_value = "4.0")]
    dso_hours: f64,

    #[arg(long, default_value = "20")]
    dso_points: usize,

    /// Seconds to wait for the mount to report its site before generating
    /// target points.
    #[arg(long, value_parser = parse_duration, default_value = "30.0")]
    mount_wait: Duration,
}

fn parse_duration(arg: &str) -> Result<Duration, String> {
    let seconds: f64 = arg.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("{}: {}", arg, e))
}

fn log_event(event: &BuildEvent) {
    match event {
        BuildEvent::Started { mode, points } => {
            info!("Build {} started with {} points", mode, points);
        }
        BuildEvent::Settling { index, remaining } => {
            info!("Point {}: settling, {}s left", index, remaining);
        }
        BuildEvent::Capture { index, progress } => {
            info!("Point {}: {} ({}s)", index, progress.stage, progress.exposure_remaining);
        }
        BuildEvent::PointDone { index, frame } => {
            info!("Point {}: error {:.1} arcsec, solved in {:.1}s",
                  index, frame.model_error, frame.solve_time);
        }
        BuildEvent::PointSkipped { index, reason } => {
            warn!("Point {} skipped: {}", index, reason);
        }
        BuildEvent::Cancelled => info!("Build cancelled"),
        BuildEvent::Finished { mode, accepted } => {
            info!("Build {} finished with {} points", mode, accepted);
        }
    }
}

fn wait_for_mount(context: &CoreContext, timeout: Duration, got_signal: &AtomicBool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if context.mount_state().firmware_known() {
            return true;
        }
        if got_signal.load(Ordering::Relaxed) {
            return false;
        }
        std::thread::sleep(EVENT_POLL);
    }
    false
}

fn start_requested_build(args: &Args, context: &CoreContext, got_signal: &AtomicBool)
                         -> bool {
    let Some(mode_name) = &args.build else {
        return false;
    };
    let mode = match BuildMode::from_name(mode_name) {
        Ok(mode) => mode,
        Err(e) => {
            error!("{}", e.message);
            return false;
        }
    };
    let points = match (args.dso_ra, args.dso_dec) {
        (Some(ra), Some(dec)) => {
            if !wait_for_mount(context, args.mount_wait, got_signal) {
                error!("Mount did not report its site");
                return false;
            }
            context.dso_points(ra, dec, args.dso_hours, args.dso_points, 0.0)
        }
        _ => context.points(&PointSet::from_name(&args.points)),
    };
    let points = match points {
        Ok(points) => points,
        Err(e) => {
            error!("Cannot generate points: {}", e.message);
            return false;
        }
    };
    match context.start_build(mode, points) {
        Ok(()) => true,
        Err(e) => {
            error!("Cannot start build: {}", e.message);
            false
        }
    }
}

fn run(context: &CoreContext, events: &Receiver<BuildEvent>, one_shot: bool,
       got_signal: &AtomicBool, shutdown_requested: &AtomicBool) {
    loop {
        match events.recv_timeout(EVENT_POLL) {
            Ok(event) => log_event(&event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if got_signal.load(Ordering::Relaxed) || shutdown_requested.load(Ordering::Relaxed) {
            break;
        }
        if one_shot && !context.is_building() {
            if let Some(artifact) = context.wait_build() {
                info!("Build produced {} rows", artifact.len());
            }
            // Remaining events.
            while let Ok(event) = events.try_recv() {
                log_event(&event);
            }
            break;
        }
    }
}

fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = tracing_appender::rolling::never(&args.log_dir, &args.log_file);
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let _subscriber = registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, Ordering::Relaxed);
    }) {
        warn!("Cannot install control-c handler: {}", e);
    }

    let file_config = Config::load(&args.config);
    let mut config = file_config.clone();
    if let Some(mount_ip) = &args.mount_ip {
        config.mount_ip = mount_ip.clone();
    }
    if args.simulation {
        config.simulation = true;
    }
    info!("Mount at {}", config.mount_address());

    let environment: Option<Arc<dyn EnvironmentProvider>> = if config.simulation {
        Some(Arc::new(SimulatedEnvironment::new(10.0, 1010.0)))
    } else {
        None
    };
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let (context, events) = CoreContext::new(config.clone(), environment,
                                             shutdown_requested.clone());
    let context = Arc::new(context);

    let mut remote_server = match config.remote_socket_address()
        .and_then(|address| RemoteServer::start(address, context.clone()))
    {
        Ok(server) => Some(server),
        Err(e) => {
            error!("Remote control not available: {}", e.message);
            None
        }
    };

    let one_shot = args.build.is_some();
    if !one_shot || start_requested_build(&args, &context, &got_signal) {
        run(&context, &events, one_shot, &got_signal, &shutdown_requested);
    }

    info!("Shutting down");
    context.cancel_build();
    if let Some(remote_server) = remote_server.as_mut() {
        remote_server.stop();
    }
    context.stop();
    if let Err(e) = file_config.save(&args.config) {
        error!("{}", e.message);
    }
}
