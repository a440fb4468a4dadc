use serde::Serialize;
use shared::domain::{DeviceTimeZone, PumpModel, RemoteId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::RadioConfiguration;

/// Auxiliary devices known to the pump, by pairing scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompanionDeviceRecord {
    OtherDevices { enabled: bool, ids: Vec<String> },
    RemoteControl { ids: Vec<RemoteId> },
}

/// What the session currently knows about the pump.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    pub model: Option<PumpModel>,
    pub time_zone: Option<DeviceTimeZone>,
    pub radio: Option<RadioConfiguration>,
    pub companions: Option<CompanionDeviceRecord>,
    pub remote_control_enabled: Option<bool>,
}

impl DeviceState {
    /// Records `model` unless one is already known, returning the model in
    /// effect afterwards.
    pub(crate) fn record_model(&mut self, model: PumpModel) -> PumpModel {
        match self.model {
            Some(existing) => {
                if existing != model {
                    warn!(%existing, reported = %model, "ignoring conflicting pump model");
                }
                existing
            }
            None => {
                self.model = Some(model);
                model
            }
        }
    }

    /// Stores the model read over the link. It replaces any earlier
    /// out-of-band report and is what the rest of the session acts on.
    pub(crate) fn adopt_read_model(&mut self, model: PumpModel) {
        if let Some(reported) = self.model.filter(|reported| *reported != model) {
            warn!(%reported, read = %model, "pump model report superseded by model read");
        }
        self.model = Some(model);
    }

    pub(crate) fn merge(&mut self, update: DeviceStateUpdate) {
        if let Some(model) = update.model {
            self.record_model(model);
        }
        if let Some(time_zone) = update.time_zone {
            match self.time_zone {
                Some(existing) if existing != time_zone => {
                    warn!(
                        existing = existing.utc_offset_seconds,
                        reported = time_zone.utc_offset_seconds,
                        "ignoring conflicting pump time zone"
                    );
                }
                Some(_) => {}
                None => {
                    debug!(
                        utc_offset_seconds = time_zone.utc_offset_seconds,
                        "pump time zone established"
                    );
                    self.time_zone = Some(time_zone);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStateUpdate {
    pub model: Option<PumpModel>,
    pub time_zone: Option<DeviceTimeZone>,
}

/// Sending half handed to the layer that learns about the pump out of band.
///
/// Updates are queued and folded into the session's [`DeviceState`] between
/// exchanges; the session stays the only writer.
#[derive(Debug, Clone)]
pub struct DeviceStateNotifier {
    tx: mpsc::UnboundedSender<DeviceStateUpdate>,
}

impl DeviceStateNotifier {
    /// Returns `false` once the session has finished and the update was
    /// dropped.
    pub fn on_device_state_update(
        &self,
        model: Option<PumpModel>,
        time_zone: Option<DeviceTimeZone>,
    ) -> bool {
        if model.is_none() && time_zone.is_none() {
            return true;
        }
        self.tx.send(DeviceStateUpdate { model, time_zone }).is_ok()
    }
}

pub(crate) fn notifier_channel() -> (
    DeviceStateNotifier,
    mpsc::UnboundedReceiver<DeviceStateUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeviceStateNotifier { tx }, rx)
}
