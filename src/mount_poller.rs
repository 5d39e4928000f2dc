// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use canonical_error::{unavailable_error, CanonicalError};
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::command_class::Reply;
use crate::command_runner::{connect, request};
use crate::mount_commands::{model_name_commands, model_star_commands,
                            parse_fast, parse_medium, parse_model_counts,
                            parse_model_stars, parse_slow, FAST_COMMANDS,
                            MEDIUM_COMMANDS, MODEL_COUNT_COMMANDS,
                            SLOW_COMMANDS};
use crate::mount_state::SharedMountState;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCadence {
    Fast,
    Medium,
    Slow,
    // Runs after connecting and again whenever a refresh is requested.
    Once,
}

impl PollCadence {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            PollCadence::Fast => Some(Duration::from_millis(250)),
            PollCadence::Medium => Some(Duration::from_secs(3)),
            PollCadence::Slow => Some(Duration::from_secs(60)),
            PollCadence::Once => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PollCadence::Fast => "fast",
            PollCadence::Medium => "medium",
            PollCadence::Slow => "slow",
            PollCadence::Once => "once",
        }
    }
}

// A poller's private connection to the mount's command port. The command
// runner's socket is never shared with the pollers.
struct PollConnection {
    address: String,
    stream: Option<TcpStream>,
}

impl PollConnection {
    fn request(&mut self, command: &str) -> Result<Reply, CanonicalError> {
        if self.stream.is_none() {
            self.stream = Some(connect(&self.address)?);
        }
        let result = match self.stream.as_mut() {
            Some(stream) => request(stream, command, REPLY_TIMEOUT),
            None => return Err(unavailable_error("Not connected to mount")),
        };
        if result.is_err() {
            // Whatever is left on the socket belongs to the failed request.
            self.stream = None;
        }
        result
    }
}

/// One polling thread. Each cycle sends one pipelined batch and applies the
/// parsed reply to the shared state under a single write.
pub struct MountPoller {
    cadence: PollCadence,
    stop: CancelToken,
    refresh_requested: Arc<Mutex<bool>>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for MountPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MountPoller {
    pub fn new(cadence: PollCadence, address: String,
               mount_state: SharedMountState) -> Self {
        let stop = CancelToken::new();
        let refresh_requested = Arc::new(Mutex::new(true));
        let cloned_stop = stop.clone();
        let cloned_refresh = refresh_requested.clone();
        let worker_thread = thread::spawn(move || {
            MountPoller::worker(cadence, address, mount_state, cloned_stop,
                                cloned_refresh);
        });
        MountPoller {
            cadence, stop, refresh_requested,
            worker_thread: Some(worker_thread),
        }
    }

    pub fn cadence(&self) -> PollCadence {
        self.cadence
    }

    /// Makes the Once poller re-read the model on its next tick. Has no
    /// effect on the periodic pollers.
    pub fn request_refresh(&self) {
        *self.refresh_requested.lock().unwrap() = true;
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }

    fn poll_once(cadence: PollCadence, connection: &mut PollConnection,
                 mount_state: &SharedMountState) -> Result<(), CanonicalError> {
        match cadence {
            PollCadence::Slow => {
                let reply = connection.request(SLOW_COMMANDS)?;
                let first = !mount_state.firmware_known();
                mount_state.update(|s| parse_slow(&reply, s))?;
                if first {
                    let s = mount_state.snapshot();
                    info!("Mount {} firmware {} at lat {:.4} long {:.4}",
                          s.product_name, s.firmware_version,
                          s.site_latitude, s.site_longitude);
                }
            }
            PollCadence::Fast => {
                let reply = connection.request(FAST_COMMANDS)?;
                mount_state.update(|s| parse_fast(&reply, s))?;
            }
            PollCadence::Medium => {
                let reply = connection.request(MEDIUM_COMMANDS)?;
                mount_state.update(|s| parse_medium(&reply, s))?;
            }
            PollCadence::Once => {
                let reply = connection.request(MODEL_COUNT_COMMANDS)?;
                let (star_count, model_count) = parse_model_counts(&reply)?;
                let stars = if star_count > 0 {
                    parse_model_stars(&connection.request(
                        &model_star_commands(star_count))?)
                } else {
                    Vec::new()
                };
                let names = if model_count > 0 {
                    connection.request(&model_name_commands(model_count))?.chunks
                } else {
                    Vec::new()
                };
                debug!("Mount has {} alignment stars, models {:?}", star_count, names);
                mount_state.update(|s| {
                    s.number_alignment_stars = star_count;
                    s.model_stars = stars;
                    s.model_names = names;
                });
            }
        }
        Ok(())
    }

    fn worker(cadence: PollCadence, address: String,
              mount_state: SharedMountState, stop: CancelToken,
              refresh_requested: Arc<Mutex<bool>>) {
        let mut connection = PollConnection { address, stream: None };
        let mut failures = 0;
        loop {
            if stop.is_cancelled() {
                break;
            }
            // Everything except identity waits for the firmware to be known.
            if cadence != PollCadence::Slow && !mount_state.firmware_known() {
                if stop.sleep(IDLE_TICK) {
                    break;
                }
                continue;
            }
            if cadence == PollCadence::Once {
                let mut refresh = refresh_requested.lock().unwrap();
                if !*refresh {
                    drop(refresh);
                    if stop.sleep(IDLE_TICK) {
                        break;
                    }
                    continue;
                }
                *refresh = false;
            }
            let wait = match MountPoller::poll_once(cadence, &mut connection,
                                                    &mount_state) {
                Ok(()) => {
                    if failures > 0 {
                        info!("Mount {} poll recovered", cadence.name());
                    }
                    failures = 0;
                    cadence.interval().unwrap_or(IDLE_TICK)
                }
                Err(e) => {
                    failures += 1;
                    // Log the first failure of a run of failures only.
                    if failures == 1 {
                        warn!("Mount {} poll failed: {}", cadence.name(), e.message);
                    } else {
                        debug!("Mount {} poll failed: {}", cadence.name(), e.message);
                    }
                    if cadence == PollCadence::Once {
                        *refresh_requested.lock().unwrap() = true;
                    }
                    RETRY_INTERVAL.min(cadence.interval().unwrap_or(RETRY_INTERVAL))
                }
            };
            if stop.sleep(wait) {
                break;
            }
        }
        debug!("Mount {} poller stopped", cadence.name());
    }
}

/// The four pollers feeding one SharedMountState.
pub struct MountPollers {
    pollers: Vec<MountPoller>,
}

impl MountPollers {
    pub fn start(address: &str, mount_state: &SharedMountState) -> Self {
        let pollers = [PollCadence::Slow, PollCadence::Fast,
                       PollCadence::Medium, PollCadence::Once]
            .into_iter()
            .map(|c| MountPoller::new(c, address.to_string(), mount_state.clone()))
            .collect();
        MountPollers { pollers }
    }

    /// Re-reads alignment stars and model names.
    pub fn refresh_model(&self) {
        for p in &self.pollers {
            if p.cadence() == PollCadence::Once {
                p.request_refresh();
            }
        }
    }

    pub fn stop(&mut self) {
        for p in &mut self.pollers {
            p.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::time::Instant;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::command_runner::tests::fake_mount;

    fn mount_replies(command: &str) -> String {
        let reply = match command {
            "Gev" => "+0585.2#",
            "Gg" => "-011:35:00.0#",
            "Gt" => "+48:07:00.0#",
            "GVD" => "Mar 19 2018#",
            "GVN" => "2.15.14#",
            "GVP" => "10micron GM1000HPS#",
            "GVT" => "15:56:53#",
            "GVZ" => "Q-TYPE2012#",
            "GS" => "13:15:35.68#",
            "Ginfo" => "19.44591,+88.0032,W,002.9803,+47.9945,2458352.10403639,0,1#",
            "GRTMP" => "+010.5#",
            "GRPRS" => "0950.2#",
            "GREF" => "1",
            "Guaf" => "0",
            "Gdat" => "1",
            "Gh" => "+90#",
            "Go" => "-05#",
            "getalst" => "2#",
            "modelcnt" => "1#",
            "getalp1" => "21:03:27.58,+37*45:17.6,   8.5,146#",
            "getalp2" => "E#",
            "modelnam1" => "Base#",
            _ => "",
        };
        reply.to_string()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_pollers_populate_state() {
        let (address, _) = fake_mount(mount_replies);
        let mount_state = SharedMountState::new();
        let mut pollers = MountPollers::start(&address, &mount_state);

        assert!(wait_for(|| {
            let s = mount_state.snapshot();
            s.firmware_known() && s.fast_cycles > 0 &&
                s.refraction_pressure > 0.0 && !s.model_names.is_empty()
        }));
        pollers.stop();

        let s = mount_state.snapshot();
        assert_eq!(s.firmware_number, 21514);
        assert_abs_diff_eq!(s.site_longitude, 11.58333, epsilon = 1e-5);
        assert!(s.tracking);
        assert!(s.slewing);
        assert_eq!(s.pier_side, 'W');
        assert_abs_diff_eq!(s.refraction_temperature, 10.5, epsilon = 1e-9);
        assert!(s.refraction_enabled);
        assert!(s.dual_axis_tracking);
        assert_eq!(s.number_alignment_stars, 2);
        // The second star answered "E" and is skipped.
        assert_eq!(s.model_stars.len(), 1);
        assert_eq!(s.model_names, vec!["Base"]);
    }

    #[test]
    fn test_fast_poller_waits_for_firmware() {
        let (address, connections) = fake_mount(mount_replies);
        let mount_state = SharedMountState::new();
        let mut poller = MountPoller::new(PollCadence::Fast, address,
                                          mount_state.clone());
        thread::sleep(Duration::from_millis(500));
        assert_eq!(mount_state.snapshot().fast_cycles, 0);
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 0);

        mount_state.update(|s| s.firmware_number = 21514);
        assert!(wait_for(|| mount_state.snapshot().fast_cycles >= 2));
        poller.stop();
    }
}
