//! In-memory pump reachable through a [`TransportHandle`].
//!
//! The simulator keeps the pump's memory (remote IDs, companion settings,
//! basal schedules, clock) across sessions so repeated commissioning runs see
//! the effects of earlier writes, the way a physical pump would.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use commissioning::{DeviceStateNotifier, TransportError, TransportHandle};
use serde::Serialize;
use shared::{
    domain::{
        BasalProfile, BasalScheduleEntry, DeviceTimeZone, PumpModel, PumpRegion, RemoteId,
    },
    protocol::{self, PumpCommand, PumpReply},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REMOTE_ID_SLOTS: u8 = 3;

/// Persistent contents of the simulated pump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpMemory {
    pub model: PumpModel,
    pub region: PumpRegion,
    pub time_zone: DeviceTimeZone,
    pub other_devices_enabled: bool,
    pub other_device_ids: Vec<String>,
    pub remote_ids: Vec<Option<RemoteId>>,
    pub remote_control_enabled: bool,
    pub max_basal_units_per_hour: f64,
    pub max_bolus_units: f64,
    pub selected_profile: BasalProfile,
    pub schedules: HashMap<BasalProfile, Vec<BasalScheduleEntry>>,
    pub clock: Option<NaiveDateTime>,
}

impl PumpMemory {
    pub fn new(model: PumpModel, region: PumpRegion) -> Self {
        let standard = vec![
            BasalScheduleEntry {
                start_minutes: 0,
                rate_units_per_hour: 0.8,
            },
            BasalScheduleEntry {
                start_minutes: 6 * 60,
                rate_units_per_hour: 1.05,
            },
            BasalScheduleEntry {
                start_minutes: 21 * 60,
                rate_units_per_hour: 0.9,
            },
        ];
        let pattern_a = vec![BasalScheduleEntry {
            start_minutes: 0,
            rate_units_per_hour: 0.5,
        }];

        Self {
            model,
            region,
            time_zone: DeviceTimeZone::utc(),
            other_devices_enabled: false,
            other_device_ids: Vec::new(),
            remote_ids: vec![None; usize::from(REMOTE_ID_SLOTS)],
            remote_control_enabled: false,
            max_basal_units_per_hour: 3.0,
            max_bolus_units: 10.0,
            selected_profile: BasalProfile::PatternA,
            schedules: HashMap::from([
                (BasalProfile::Standard, standard),
                (BasalProfile::PatternA, pattern_a),
            ]),
            clock: None,
        }
    }

    pub fn configured_remote_ids(&self) -> Vec<RemoteId> {
        self.remote_ids.iter().flatten().copied().collect()
    }
}

/// Failure injected for a named command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    NoResponse,
    Nak(String),
    Garbage,
    /// Fails the first `n` attempts, then behaves normally.
    Transient(usize),
}

pub struct SimulatedPump {
    memory: Mutex<PumpMemory>,
    connected: AtomicBool,
    latency: Duration,
    faults: Mutex<HashMap<&'static str, Fault>>,
    report_identity: AtomicBool,
    in_flight: AtomicBool,
    notifier: Mutex<Option<DeviceStateNotifier>>,
    log: Mutex<Vec<PumpCommand>>,
    exchanges: AtomicUsize,
}

impl SimulatedPump {
    pub fn new(memory: PumpMemory) -> Arc<Self> {
        Self::with_latency(memory, Duration::ZERO)
    }

    /// Every exchange takes at least `latency` of air time.
    pub fn with_latency(memory: PumpMemory, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            memory: Mutex::new(memory),
            connected: AtomicBool::new(true),
            latency,
            faults: Mutex::new(HashMap::new()),
            report_identity: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            notifier: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            exchanges: AtomicUsize::new(0),
        })
    }

    /// Routes identity reports (model and clock time zone), emitted after a
    /// successful model read, to a session.
    pub async fn attach(&self, notifier: DeviceStateNotifier) {
        *self.notifier.lock().await = Some(notifier);
    }

    /// When disabled the pump still answers every command but its identity
    /// is never reported out of band.
    pub fn set_reports_identity(&self, enabled: bool) {
        self.report_identity.store(enabled, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn inject_fault(&self, command: &'static str, fault: Fault) {
        self.faults.lock().await.insert(command, fault);
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    pub async fn memory(&self) -> PumpMemory {
        self.memory.lock().await.clone()
    }

    pub async fn command_log(&self) -> Vec<PumpCommand> {
        self.log.lock().await.clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    async fn take_fault(&self, command: &'static str) -> Option<Fault> {
        let mut faults = self.faults.lock().await;
        match faults.get(command).cloned()? {
            Fault::Transient(0) => {
                faults.remove(command);
                None
            }
            Fault::Transient(remaining) => {
                faults.insert(command, Fault::Transient(remaining - 1));
                Some(Fault::NoResponse)
            }
            fault => Some(fault),
        }
    }

    async fn handle(&self, command: PumpCommand) -> PumpReply {
        let mut memory = self.memory.lock().await;
        match command {
            PumpCommand::TuneRadio {
                scan_frequencies_mhz,
                ..
            } => {
                let center = band_center_mhz(memory.region);
                let best = scan_frequencies_mhz
                    .iter()
                    .copied()
                    .min_by(|a, b| (a - center).abs().total_cmp(&(b - center).abs()));
                match best {
                    Some(frequency_mhz) => PumpReply::RadioTuned {
                        frequency_mhz,
                        rssi_dbm: -58 - ((frequency_mhz - center).abs() * 100.0).round() as i32,
                    },
                    None => PumpReply::Nak {
                        message: "empty scan table".into(),
                    },
                }
            }
            PumpCommand::ReadPumpModel => {
                let model = memory.model;
                let time_zone = memory.time_zone;
                drop(memory);
                if self.report_identity.load(Ordering::SeqCst) {
                    if let Some(notifier) = self.notifier.lock().await.as_ref() {
                        notifier.on_device_state_update(Some(model), Some(time_zone));
                    }
                }
                PumpReply::PumpModel { model }
            }
            PumpCommand::ReadOtherDevicesEnabled => {
                if !memory.model.has_my_sentry() {
                    return nak("other devices unsupported");
                }
                PumpReply::OtherDevicesEnabled {
                    enabled: memory.other_devices_enabled,
                }
            }
            PumpCommand::ReadOtherDeviceIds => {
                if !memory.model.has_my_sentry() {
                    return nak("other devices unsupported");
                }
                PumpReply::OtherDeviceIds {
                    ids: memory.other_device_ids.clone(),
                }
            }
            PumpCommand::ReadRemoteControlIds => PumpReply::RemoteControlIds {
                ids: memory.configured_remote_ids(),
            },
            PumpCommand::SetRemoteControlId { remote_id, slot } => {
                let Some(entry) = memory.remote_ids.get_mut(usize::from(slot)) else {
                    return nak(format!("remote id slot {slot} out of range"));
                };
                *entry = Some(remote_id);
                info!(%remote_id, slot, "pump_sim: remote control id stored");
                PumpReply::Ack
            }
            PumpCommand::SetRemoteControlEnabled { enabled } => {
                memory.remote_control_enabled = enabled;
                PumpReply::Ack
            }
            PumpCommand::ReadSettings => PumpReply::Settings {
                max_basal_units_per_hour: memory.max_basal_units_per_hour,
                max_bolus_units: memory.max_bolus_units,
                selected_profile: memory.selected_profile,
            },
            PumpCommand::ReadBasalSchedule { profile } => PumpReply::BasalSchedule {
                profile,
                entries: memory.schedules.get(&profile).cloned().unwrap_or_default(),
            },
            PumpCommand::SelectBasalProfile { profile } => {
                memory.selected_profile = profile;
                PumpReply::Ack
            }
            PumpCommand::SetTime {
                local_time,
                time_zone,
            } => {
                memory.clock = Some(local_time);
                memory.time_zone = time_zone;
                PumpReply::Ack
            }
        }
    }
}

#[async_trait]
impl TransportHandle for SimulatedPump {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("pump_sim: exchange rejected, link already in use");
            return Err(TransportError::Busy);
        }
        let _in_flight = InFlight(&self.in_flight);
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        let command: PumpCommand =
            protocol::decode(request).map_err(|err| TransportError::Io(err.to_string()))?;
        let name = command.name();
        self.log.lock().await.push(command.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        // A pump on another band never hears the tune request.
        if let PumpCommand::TuneRadio { region, .. } = &command {
            if !same_band(*region, self.memory.lock().await.region) {
                debug!(?region, "pump_sim: tune request on foreign band ignored");
                return Err(TransportError::NoResponse);
            }
        }

        let reply = match self.take_fault(name).await {
            Some(Fault::NoResponse) => return Err(TransportError::NoResponse),
            Some(Fault::Garbage) => return Ok(b"\xff\x00garbage".to_vec()),
            Some(Fault::Nak(message)) => PumpReply::Nak { message },
            Some(Fault::Transient(_)) | None => self.handle(command).await,
        };
        debug!(command = name, reply = reply.name(), "pump_sim: exchange");
        protocol::encode(&reply).map_err(|err| TransportError::Io(err.to_string()))
    }
}

/// Frees the link when an exchange finishes or is dropped mid-flight.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn nak(message: impl Into<String>) -> PumpReply {
    PumpReply::Nak {
        message: message.into(),
    }
}

fn band_center_mhz(region: PumpRegion) -> f64 {
    match region {
        PumpRegion::NorthAmerica | PumpRegion::Canada => 916.65,
        PumpRegion::WorldWide => 868.45,
    }
}

fn same_band(a: PumpRegion, b: PumpRegion) -> bool {
    (a == PumpRegion::WorldWide) == (b == PumpRegion::WorldWide)
}
