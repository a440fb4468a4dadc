use chrono::NaiveDateTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    domain::{BasalProfile, BasalScheduleEntry, DeviceTimeZone, PumpModel, PumpRegion, RemoteId},
    error::CodecError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PumpCommand {
    TuneRadio {
        region: PumpRegion,
        scan_frequencies_mhz: Vec<f64>,
    },
    ReadPumpModel,
    ReadOtherDevicesEnabled,
    ReadOtherDeviceIds,
    ReadRemoteControlIds,
    SetRemoteControlId {
        remote_id: RemoteId,
        slot: u8,
    },
    SetRemoteControlEnabled {
        enabled: bool,
    },
    ReadSettings,
    ReadBasalSchedule {
        profile: BasalProfile,
    },
    SelectBasalProfile {
        profile: BasalProfile,
    },
    SetTime {
        local_time: NaiveDateTime,
        time_zone: DeviceTimeZone,
    },
}

impl PumpCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TuneRadio { .. } => "tune_radio",
            Self::ReadPumpModel => "read_pump_model",
            Self::ReadOtherDevicesEnabled => "read_other_devices_enabled",
            Self::ReadOtherDeviceIds => "read_other_device_ids",
            Self::ReadRemoteControlIds => "read_remote_control_ids",
            Self::SetRemoteControlId { .. } => "set_remote_control_id",
            Self::SetRemoteControlEnabled { .. } => "set_remote_control_enabled",
            Self::ReadSettings => "read_settings",
            Self::ReadBasalSchedule { .. } => "read_basal_schedule",
            Self::SelectBasalProfile { .. } => "select_basal_profile",
            Self::SetTime { .. } => "set_time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PumpReply {
    RadioTuned {
        frequency_mhz: f64,
        rssi_dbm: i32,
    },
    PumpModel {
        model: PumpModel,
    },
    OtherDevicesEnabled {
        enabled: bool,
    },
    OtherDeviceIds {
        ids: Vec<String>,
    },
    RemoteControlIds {
        ids: Vec<RemoteId>,
    },
    Settings {
        max_basal_units_per_hour: f64,
        max_bolus_units: f64,
        selected_profile: BasalProfile,
    },
    BasalSchedule {
        profile: BasalProfile,
        entries: Vec<BasalScheduleEntry>,
    },
    Ack,
    /// The pump refused or could not execute the command.
    Nak {
        message: String,
    },
}

impl PumpReply {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RadioTuned { .. } => "radio_tuned",
            Self::PumpModel { .. } => "pump_model",
            Self::OtherDevicesEnabled { .. } => "other_devices_enabled",
            Self::OtherDeviceIds { .. } => "other_device_ids",
            Self::RemoteControlIds { .. } => "remote_control_ids",
            Self::Settings { .. } => "settings",
            Self::BasalSchedule { .. } => "basal_schedule",
            Self::Ack => "ack",
            Self::Nak { .. } => "nak",
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
