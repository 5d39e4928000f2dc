// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{unavailable_error, CanonicalError};
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::mount_commands::set_refraction;
use crate::mount_gateway::MountGateway;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentField {
    Temperature,
    Pressure,
    Humidity,
    DewPoint,
    CloudCover,
    SkyQuality,
    WindSpeed,
    RainRate,
}

pub const ALL_FIELDS: [EnvironmentField; 8] = [
    EnvironmentField::Temperature,
    EnvironmentField::Pressure,
    EnvironmentField::Humidity,
    EnvironmentField::DewPoint,
    EnvironmentField::CloudCover,
    EnvironmentField::SkyQuality,
    EnvironmentField::WindSpeed,
    EnvironmentField::RainRate,
];

/// One environment reading. Fields the device does not deliver are None.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvironmentData {
    // Celsius.
    pub temperature: Option<f64>,
    // hPa.
    pub pressure: Option<f64>,
    // Percent.
    pub humidity: Option<f64>,
    pub dew_point: Option<f64>,
    pub cloud_cover: Option<f64>,
    // mag/arcsec^2.
    pub sky_quality: Option<f64>,
    pub wind_speed: Option<f64>,
    pub rain_rate: Option<f64>,
}

impl EnvironmentData {
    fn set(&mut self, field: EnvironmentField, value: f64) {
        let slot = match field {
            EnvironmentField::Temperature => &mut self.temperature,
            EnvironmentField::Pressure => &mut self.pressure,
            EnvironmentField::Humidity => &mut self.humidity,
            EnvironmentField::DewPoint => &mut self.dew_point,
            EnvironmentField::CloudCover => &mut self.cloud_cover,
            EnvironmentField::SkyQuality => &mut self.sky_quality,
            EnvironmentField::WindSpeed => &mut self.wind_speed,
            EnvironmentField::RainRate => &mut self.rain_rate,
        };
        *slot = Some(value);
    }
}

/// Weather telemetry source. Each field is read separately so that a device
/// lacking one sensor still delivers the others.
pub trait EnvironmentProvider: Send + Sync {
    fn name(&self) -> &str;

    fn read_field(&self, field: EnvironmentField) -> Result<f64, CanonicalError>;
}

/// Fields that failed once and are no longer polled until the set is
/// cleared (on reconnect).
#[derive(Clone, Debug, Default)]
pub struct SuppressedSet {
    fields: HashSet<EnvironmentField>,
}

impl SuppressedSet {
    pub fn suppress(&mut self, field: EnvironmentField) -> bool {
        self.fields.insert(field)
    }

    pub fn is_suppressed(&self, field: EnvironmentField) -> bool {
        self.fields.contains(&field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

/// Reads every field not yet suppressed. A failing field is suppressed.
pub fn poll_environment(provider: &dyn EnvironmentProvider,
                        suppressed: &mut SuppressedSet) -> EnvironmentData {
    let mut data = EnvironmentData::default();
    for field in ALL_FIELDS {
        if suppressed.is_suppressed(field) {
            continue;
        }
        match provider.read_field(field) {
            Ok(value) => data.set(field, value),
            Err(e) => {
                warn!("{} cannot deliver {:?}, no longer polled: {}",
                      provider.name(), field, e.message);
                suppressed.suppress(field);
            }
        }
    }
    data
}

#[derive(Clone, Debug, Default)]
struct EnvironmentSnapshot {
    data: EnvironmentData,
    updated: Option<Instant>,
}

/// Background poller for one EnvironmentProvider. Pushes temperature and
/// pressure to the mount's refraction model when they change and the mount
/// is not slewing.
pub struct EnvironmentWorker {
    snapshot: Arc<RwLock<EnvironmentSnapshot>>,
    suppressed: Arc<Mutex<SuppressedSet>>,
    stop: CancelToken,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for EnvironmentWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

// Refraction values are sent with one decimal.
fn same_refraction(a: (f64, f64), b: (f64, f64)) -> bool {
    (a.0 - b.0).abs() < 0.05 && (a.1 - b.1).abs() < 0.05
}

impl EnvironmentWorker {
    pub fn new(provider: Arc<dyn EnvironmentProvider>,
               mount: Option<Arc<dyn MountGateway>>,
               interval: Duration) -> Self {
        let snapshot = Arc::new(RwLock::new(EnvironmentSnapshot::default()));
        let suppressed = Arc::new(Mutex::new(SuppressedSet::default()));
        let stop = CancelToken::new();
        let cloned_snapshot = snapshot.clone();
        let cloned_suppressed = suppressed.clone();
        let cloned_stop = stop.clone();
        let worker_thread = thread::spawn(move || {
            EnvironmentWorker::worker(provider, mount, interval, cloned_snapshot,
                                      cloned_suppressed, cloned_stop);
        });
        EnvironmentWorker {
            snapshot, suppressed, stop,
            worker_thread: Some(worker_thread),
        }
    }

    /// The latest reading and its age, if any reading was taken yet.
    pub fn latest(&self) -> Option<(EnvironmentData, Duration)> {
        let locked = self.snapshot.read().unwrap();
        locked.updated.map(|t| (locked.data.clone(), t.elapsed()))
    }

    pub fn suppressed(&self) -> SuppressedSet {
        self.suppressed.lock().unwrap().clone()
    }

    /// Polls all fields again, e.g. after reconnecting the device.
    pub fn reset_suppressed(&self) {
        self.suppressed.lock().unwrap().clear();
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }

    fn worker(provider: Arc<dyn EnvironmentProvider>,
              mount: Option<Arc<dyn MountGateway>>, interval: Duration,
              snapshot: Arc<RwLock<EnvironmentSnapshot>>,
              suppressed: Arc<Mutex<SuppressedSet>>, stop: CancelToken) {
        info!("Environment polling {} every {:?}", provider.name(), interval);
        let mut last_pushed: Option<(f64, f64)> = None;
        loop {
            if stop.is_cancelled() {
                break;
            }
            let data = {
                let mut locked_suppressed = suppressed.lock().unwrap();
                poll_environment(provider.as_ref(), &mut locked_suppressed)
            };
            {
                let mut locked = snapshot.write().unwrap();
                locked.data = data.clone();
                locked.updated = Some(Instant::now());
            }
            if let (Some(mount), Some(t), Some(p)) = (&mount, data.temperature, data.pressure) {
                let unchanged = last_pushed.is_some_and(|last| same_refraction(last, (t, p)));
                if !unchanged && !mount.snapshot().slewing {
                    let command = set_refraction(t, p);
                    match mount.command(&command) {
                        Some(_) => {
                            debug!("Refraction set to {:.1}C {:.1}hPa", t, p);
                            last_pushed = Some((t, p));
                        }
                        None => warn!("Refraction update {} failed", command),
                    }
                }
            }
            if stop.sleep(interval) {
                break;
            }
        }
    }
}

/// Environment values for simulation and tests. Fields listed in `missing`
/// fail on read.
pub struct SimulatedEnvironment {
    pub data: Mutex<EnvironmentData>,
    pub missing: HashSet<EnvironmentField>,
}

impl SimulatedEnvironment {
    pub fn new(temperature: f64, pressure: f64) -> Self {
        SimulatedEnvironment {
            data: Mutex::new(EnvironmentData {
                temperature: Some(temperature),
                pressure: Some(pressure),
                humidity: Some(60.0),
                dew_point: Some(temperature - 6.0),
                ..Default::default()
            }),
            missing: HashSet::new(),
        }
    }
}

impl EnvironmentProvider for SimulatedEnvironment {
    fn name(&self) -> &str {
        "simulated environment"
    }

    fn read_field(&self, field: EnvironmentField) -> Result<f64, CanonicalError> {
        let data = self.data.lock().unwrap();
        let value = match field {
            EnvironmentField::Temperature => data.temperature,
            EnvironmentField::Pressure => data.pressure,
            EnvironmentField::Humidity => data.humidity,
            EnvironmentField::DewPoint => data.dew_point,
            EnvironmentField::CloudCover => data.cloud_cover,
            EnvironmentField::SkyQuality => data.sky_quality,
            EnvironmentField::WindSpeed => data.wind_speed,
            EnvironmentField::RainRate => data.rain_rate,
        };
        match value {
            Some(v) if !self.missing.contains(&field) => Ok(v),
            _ => Err(unavailable_error(format!("No {:?} sensor", field).as_str())),
        }
    }
}
