use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use shared::{
    domain::{BasalProfile, BasalSchedule, DeviceTimeZone, PumpColor, PumpId, PumpModel, PumpRegion},
    error::IdentityError,
};

use crate::{device_state::DeviceState, error::CommissioningError};

pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SESSION_NAME: &str = "Pump ID Setup";

/// Which pump to commission, as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub pump_id: PumpId,
    pub region: PumpRegion,
}

impl DeviceIdentity {
    pub fn new(pump_id: &str, region: PumpRegion) -> Result<Self, IdentityError> {
        Ok(Self {
            pump_id: PumpId::parse(pump_id)?,
            region,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_name: String,
    /// Upper bound on a single request/response exchange.
    pub exchange_timeout: Duration,
    pub pump_color: PumpColor,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            pump_color: PumpColor::default(),
        }
    }
}

/// Source of the wall-clock time written to the pump.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let now = Local::now();
        now.with_timezone(now.offset())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RadioConfiguration {
    pub region: PumpRegion,
    pub frequency_mhz: f64,
    pub rssi_dbm: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpOperatingSettings {
    pub max_basal_units_per_hour: f64,
    pub max_bolus_units: f64,
    pub basal_schedule: BasalSchedule,
    pub selected_profile: BasalProfile,
}

/// Everything needed to create a pump manager for the commissioned pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpManagerState {
    pub pump_color: PumpColor,
    pub pump_id: PumpId,
    pub pump_model: PumpModel,
    pub pump_region: PumpRegion,
    pub time_zone: DeviceTimeZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextSetupStep {
    ConfigureCompanion,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommissioningResult {
    pub settings: PumpOperatingSettings,
    pub companion_setup_required: bool,
    pub manager_state: PumpManagerState,
}

impl CommissioningResult {
    pub fn next_step(&self) -> NextSetupStep {
        if self.companion_setup_required {
            NextSetupStep::ConfigureCompanion
        } else {
            NextSetupStep::Finish
        }
    }
}

/// Folds the final device state and fetched settings into a result. A pump
/// whose model or clock time zone is still unknown is not commissioned.
pub fn assemble_result(
    state: &DeviceState,
    identity: &DeviceIdentity,
    pump_color: PumpColor,
    settings: PumpOperatingSettings,
    companion_setup_required: bool,
) -> Result<CommissioningResult, CommissioningError> {
    let (Some(pump_model), Some(time_zone)) = (state.model, state.time_zone) else {
        return Err(CommissioningError::IncompleteDeviceState);
    };

    Ok(CommissioningResult {
        settings,
        companion_setup_required,
        manager_state: PumpManagerState {
            pump_color,
            pump_id: identity.pump_id.clone(),
            pump_model,
            pump_region: identity.region,
            time_zone,
        },
    })
}
