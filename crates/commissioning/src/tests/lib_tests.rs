use super::*;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use shared::domain::{BasalScheduleEntry, DeviceTimeZone, PumpColor};
use tokio::sync::Mutex;

const PUMP_TIME_ZONE: DeviceTimeZone = DeviceTimeZone {
    utc_offset_seconds: -5 * 3600,
};

struct TestPump {
    connected: bool,
    model: PumpModel,
    other_devices_enabled: bool,
    other_device_ids: Vec<String>,
    schedule: Vec<BasalScheduleEntry>,
    remote_ids: Mutex<Vec<RemoteId>>,
    remote_enabled: Mutex<bool>,
    commands: Mutex<Vec<PumpCommand>>,
    notifier: Mutex<Option<DeviceStateNotifier>>,
    fail_on: Option<&'static str>,
    nak_on: Option<&'static str>,
    delay_on: Option<(&'static str, Duration)>,
    cancel_on: Option<(&'static str, CancelHandle)>,
}

impl TestPump {
    fn with_model(model: &str) -> Self {
        Self {
            connected: true,
            model: model.parse().expect("model"),
            other_devices_enabled: false,
            other_device_ids: Vec::new(),
            schedule: vec![
                BasalScheduleEntry {
                    start_minutes: 0,
                    rate_units_per_hour: 0.85,
                },
                BasalScheduleEntry {
                    start_minutes: 7 * 60,
                    rate_units_per_hour: 1.2,
                },
                BasalScheduleEntry {
                    start_minutes: 22 * 60,
                    rate_units_per_hour: 0.9,
                },
            ],
            remote_ids: Mutex::new(Vec::new()),
            remote_enabled: Mutex::new(false),
            commands: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
            fail_on: None,
            nak_on: None,
            delay_on: None,
            cancel_on: None,
        }
    }

    fn legacy() -> Self {
        Self::with_model("522")
    }

    fn sentry(enabled: bool, ids: &[&str]) -> Self {
        let mut pump = Self::with_model("723");
        pump.other_devices_enabled = enabled;
        pump.other_device_ids = ids.iter().map(|id| id.to_string()).collect();
        pump
    }

    fn with_remote_ids(self, ids: Vec<RemoteId>) -> Self {
        Self {
            remote_ids: Mutex::new(ids),
            ..self
        }
    }

    /// Reports model and time zone out of band whenever the model is read.
    async fn report_to(&self, notifier: DeviceStateNotifier) {
        *self.notifier.lock().await = Some(notifier);
    }

    async fn commands(&self) -> Vec<PumpCommand> {
        self.commands.lock().await.clone()
    }

    async fn command_names(&self) -> Vec<&'static str> {
        self.commands
            .lock()
            .await
            .iter()
            .map(PumpCommand::name)
            .collect()
    }

    async fn reply_to(&self, command: PumpCommand) -> PumpReply {
        match command {
            PumpCommand::TuneRadio {
                scan_frequencies_mhz,
                ..
            } => PumpReply::RadioTuned {
                frequency_mhz: scan_frequencies_mhz[scan_frequencies_mhz.len() / 2],
                rssi_dbm: -62,
            },
            PumpCommand::ReadPumpModel => {
                if let Some(notifier) = self.notifier.lock().await.as_ref() {
                    notifier.on_device_state_update(Some(self.model), Some(PUMP_TIME_ZONE));
                }
                PumpReply::PumpModel { model: self.model }
            }
            PumpCommand::ReadOtherDevicesEnabled => PumpReply::OtherDevicesEnabled {
                enabled: self.other_devices_enabled,
            },
            PumpCommand::ReadOtherDeviceIds => PumpReply::OtherDeviceIds {
                ids: self.other_device_ids.clone(),
            },
            PumpCommand::ReadRemoteControlIds => PumpReply::RemoteControlIds {
                ids: self.remote_ids.lock().await.clone(),
            },
            PumpCommand::SetRemoteControlId { remote_id, .. } => {
                self.remote_ids.lock().await.push(remote_id);
                PumpReply::Ack
            }
            PumpCommand::SetRemoteControlEnabled { enabled } => {
                *self.remote_enabled.lock().await = enabled;
                PumpReply::Ack
            }
            PumpCommand::ReadSettings => PumpReply::Settings {
                max_basal_units_per_hour: 2.5,
                max_bolus_units: 8.0,
                selected_profile: BasalProfile::PatternA,
            },
            PumpCommand::ReadBasalSchedule { profile } => PumpReply::BasalSchedule {
                profile,
                entries: self.schedule.clone(),
            },
            PumpCommand::SelectBasalProfile { .. } | PumpCommand::SetTime { .. } => {
                PumpReply::Ack
            }
        }
    }
}

#[async_trait]
impl TransportHandle for TestPump {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let command: PumpCommand =
            protocol::decode(request).map_err(|err| TransportError::Io(err.to_string()))?;
        let name = command.name();
        self.commands.lock().await.push(command.clone());

        if let Some((target, delay)) = self.delay_on {
            if target == name {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail_on == Some(name) {
            return Err(TransportError::NoResponse);
        }
        if let Some((target, handle)) = &self.cancel_on {
            if *target == name {
                handle.cancel();
            }
        }

        let reply = if self.nak_on == Some(name) {
            PumpReply::Nak {
                message: format!("{name} refused"),
            }
        } else {
            self.reply_to(command).await
        };
        Ok(protocol::encode(&reply).expect("encode reply"))
    }
}

struct FixedClock(DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

fn session() -> CommissioningSession {
    CommissioningSession::for_pump("123456", PumpRegion::NorthAmerica, SessionOptions::default())
        .expect("session")
}

async fn reporting_session(pump: &TestPump) -> CommissioningSession {
    let session = session();
    pump.report_to(session.notifier()).await;
    session
}

#[tokio::test]
async fn pump_ids_of_wrong_length_are_rejected_before_any_exchange() {
    let pump = TestPump::legacy();
    for raw in ["", "12345", "1234567", "12345678901", " 123456", "123456\n"] {
        let err = CommissioningSession::for_pump(raw, PumpRegion::WorldWide, SessionOptions::default())
            .err()
            .expect("invalid id must be rejected");
        assert!(matches!(
            err,
            CommissioningError::InvalidIdentity(shared::error::IdentityError::InvalidPumpIdLength {
                expected: 6,
                ..
            })
        ));
    }
    assert!(pump.commands().await.is_empty());
}

#[tokio::test]
async fn disconnected_transport_fails_with_no_device() {
    let mut pump = TestPump::legacy();
    pump.connected = false;

    let outcome = session().run(&pump).await;
    assert!(matches!(outcome.result, Err(CommissioningError::NoDevice)));
    assert!(pump.commands().await.is_empty());

    let outcome = session().run(&MissingTransport).await;
    assert!(matches!(outcome.result, Err(CommissioningError::NoDevice)));
}

#[tokio::test]
async fn tune_failure_stops_the_session() {
    let mut pump = TestPump::legacy();
    pump.fail_on = Some("tune_radio");

    let outcome = session().run(&pump).await;
    let err = outcome.result.expect_err("tune must fail");
    assert!(matches!(
        err,
        CommissioningError::Communication {
            step: CommissioningStep::TuneRadio,
            source: ExchangeError::Transport {
                command: "tune_radio",
                source: TransportError::NoResponse,
            },
        }
    ));
    assert_eq!(pump.command_names().await, vec!["tune_radio"]);
    assert_eq!(outcome.device_state, DeviceState::default());
}

#[tokio::test]
async fn tune_request_carries_region_scan_table() {
    let pump = TestPump::legacy();
    let session = CommissioningSession::for_pump("123456", PumpRegion::WorldWide, SessionOptions::default())
        .expect("session");
    pump.report_to(session.notifier()).await;

    let outcome = session.run(&pump).await;
    outcome.result.expect("commissioned");

    let commands = pump.commands().await;
    let PumpCommand::TuneRadio {
        region,
        scan_frequencies_mhz,
    } = &commands[0]
    else {
        panic!("first command must tune the radio");
    };
    assert_eq!(*region, PumpRegion::WorldWide);
    assert_eq!(scan_frequencies_mhz, &PumpRegion::WorldWide.scan_frequencies_mhz());

    let radio = outcome.device_state.radio.expect("radio configuration");
    assert_eq!(radio.region, PumpRegion::WorldWide);
    assert_eq!(radio.rssi_dbm, -62);
}

#[tokio::test]
async fn legacy_pump_without_remote_gets_placeholder_written_once() {
    let pump = TestPump::legacy();
    let session = reporting_session(&pump).await;

    let outcome = session.run(&pump).await;
    let result = outcome.result.expect("commissioned");
    assert!(!result.companion_setup_required);
    assert_eq!(result.next_step(), NextSetupStep::Finish);

    let commands = pump.commands().await;
    let writes: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, command)| matches!(command, PumpCommand::SetRemoteControlId { .. }))
        .map(|(index, _)| index)
        .collect();
    let enables: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, command)| matches!(command, PumpCommand::SetRemoteControlEnabled { .. }))
        .map(|(index, _)| index)
        .collect();

    assert_eq!(writes.len(), 1);
    assert_eq!(enables.len(), 1);
    assert!(writes[0] < enables[0]);
    assert_eq!(
        commands[writes[0]],
        PumpCommand::SetRemoteControlId {
            remote_id: RemoteId([9, 9, 9, 9, 9, 9]),
            slot: 2,
        }
    );
    assert_eq!(
        commands[enables[0]],
        PumpCommand::SetRemoteControlEnabled { enabled: true }
    );
    assert_eq!(outcome.device_state.remote_control_enabled, Some(true));
    assert_eq!(
        outcome.device_state.companions,
        Some(CompanionDeviceRecord::RemoteControl {
            ids: vec![RemoteId::PLACEHOLDER]
        })
    );
}

#[tokio::test]
async fn legacy_pump_with_remote_is_never_rewritten() {
    let pump = TestPump::legacy().with_remote_ids(vec![RemoteId([1, 2, 3, 4, 5, 6])]);
    let session = reporting_session(&pump).await;

    let outcome = session.run(&pump).await;
    outcome.result.expect("commissioned");

    let names = pump.command_names().await;
    assert!(!names.contains(&"set_remote_control_id"));
    assert_eq!(
        names.iter().filter(|name| **name == "set_remote_control_enabled").count(),
        1
    );
    assert!(*pump.remote_enabled.lock().await);
}

#[tokio::test]
async fn sentry_pump_with_other_devices_disabled_always_needs_companion_setup() {
    for ids in [&[][..], &["a1b2c3"][..]] {
        let pump = TestPump::sentry(false, ids);
        let session = reporting_session(&pump).await;

        let outcome = session.run(&pump).await;
        let result = outcome.result.expect("commissioned");
        assert!(result.companion_setup_required);
        assert_eq!(result.next_step(), NextSetupStep::ConfigureCompanion);

        let names = pump.command_names().await;
        assert!(!names.contains(&"read_other_device_ids"));
        assert!(!names.contains(&"read_remote_control_ids"));
    }
}

#[tokio::test]
async fn sentry_pump_with_paired_devices_needs_no_companion_setup() {
    let pump = TestPump::sentry(true, &["a1b2c3", "d4e5f6"]);
    let session = reporting_session(&pump).await;

    let outcome = session.run(&pump).await;
    let result = outcome.result.expect("commissioned");
    assert!(!result.companion_setup_required);
    assert_eq!(
        outcome.device_state.companions,
        Some(CompanionDeviceRecord::OtherDevices {
            enabled: true,
            ids: vec!["a1b2c3".to_string(), "d4e5f6".to_string()],
        })
    );
    assert_eq!(outcome.device_state.remote_control_enabled, None);
}

#[tokio::test]
async fn sentry_pump_with_no_paired_devices_needs_companion_setup() {
    let pump = TestPump::sentry(true, &[]);
    let session = reporting_session(&pump).await;

    let result = session.run(&pump).await.result.expect("commissioned");
    assert!(result.companion_setup_required);
}

#[tokio::test]
async fn missing_time_zone_report_fails_even_when_every_exchange_succeeds() {
    let pump = TestPump::legacy();

    let outcome = session().run(&pump).await;
    assert!(matches!(
        outcome.result,
        Err(CommissioningError::IncompleteDeviceState)
    ));
    assert_eq!(
        pump.command_names().await,
        vec![
            "tune_radio",
            "read_pump_model",
            "read_remote_control_ids",
            "set_remote_control_id",
            "set_remote_control_enabled",
            "read_settings",
            "read_basal_schedule",
            "select_basal_profile",
            "set_time",
        ]
    );
    assert!(outcome.device_state.model.is_some());
    assert!(outcome.device_state.time_zone.is_none());
}

#[tokio::test]
async fn time_zone_reported_before_run_is_used() {
    let pump = TestPump::sentry(true, &["a1b2c3"]);
    let session = session();
    assert!(session
        .notifier()
        .on_device_state_update(None, Some(DeviceTimeZone::utc())));

    let result = session.run(&pump).await.result.expect("commissioned");
    assert_eq!(result.manager_state.time_zone, DeviceTimeZone::utc());
    assert_eq!(result.manager_state.pump_model.number(), 723);
    assert_eq!(result.manager_state.pump_color, PumpColor::Blue);
}

#[tokio::test]
async fn stale_model_report_does_not_pick_the_companion_branch() {
    let pump = TestPump::sentry(true, &["a1b2c3"]);
    let session = reporting_session(&pump).await;
    assert!(session
        .notifier()
        .on_device_state_update(Some("522".parse().expect("model")), None));

    let outcome = session.run(&pump).await;
    let result = outcome.result.expect("commissioned");
    let names = pump.command_names().await;
    assert!(names.contains(&"read_other_devices_enabled"));
    assert!(!names.contains(&"read_remote_control_ids"));
    assert!(!names.contains(&"set_remote_control_id"));
    assert!(pump.remote_ids.lock().await.is_empty());
    assert_eq!(result.manager_state.pump_model.number(), 723);
    assert_eq!(outcome.device_state.model.map(|m| m.number()), Some(723));
}

#[tokio::test]
async fn back_to_back_sessions_read_identical_settings() {
    let pump = TestPump::legacy().with_remote_ids(vec![RemoteId::PLACEHOLDER]);
    *pump.remote_enabled.lock().await = true;

    let first = reporting_session(&pump).await.run(&pump).await;
    let second = reporting_session(&pump).await.run(&pump).await;

    let first = first.result.expect("first session");
    let second = second.result.expect("second session");
    assert_eq!(first.settings, second.settings);
    assert_eq!(first.companion_setup_required, second.companion_setup_required);
    assert!(!pump
        .command_names()
        .await
        .contains(&"set_remote_control_id"));
    assert_eq!(pump.remote_ids.lock().await.len(), 1);
}

#[tokio::test]
async fn cancellation_after_remote_enable_leaves_pump_configured() {
    let (cancel, signal) = cancellation();
    let mut pump = TestPump::legacy();
    pump.cancel_on = Some(("set_remote_control_enabled", cancel));
    let session = reporting_session(&pump).await.with_cancellation(signal);

    let outcome = session.run(&pump).await;
    assert!(matches!(
        outcome.result,
        Err(CommissioningError::Cancelled {
            before: CommissioningStep::FetchSettings
        })
    ));
    assert_eq!(outcome.device_state.remote_control_enabled, Some(true));
    assert!(*pump.remote_enabled.lock().await);
    assert_eq!(*pump.remote_ids.lock().await, vec![RemoteId::PLACEHOLDER]);

    let names = pump.command_names().await;
    assert_eq!(names.last(), Some(&"set_remote_control_enabled"));
}

#[tokio::test]
async fn cancellation_before_run_sends_nothing() {
    let (cancel, signal) = cancellation();
    cancel.cancel();
    let pump = TestPump::legacy();

    let outcome = session().with_cancellation(signal).run(&pump).await;
    assert!(matches!(
        outcome.result,
        Err(CommissioningError::Cancelled {
            before: CommissioningStep::TuneRadio
        })
    ));
    assert!(pump.commands().await.is_empty());
}

#[tokio::test]
async fn slow_reply_times_out_as_communication_error() {
    let mut pump = TestPump::legacy();
    pump.delay_on = Some(("read_pump_model", Duration::from_millis(500)));
    let options = SessionOptions {
        exchange_timeout: Duration::from_millis(20),
        ..SessionOptions::default()
    };
    let session =
        CommissioningSession::for_pump("123456", PumpRegion::Canada, options).expect("session");

    let err = session.run(&pump).await.result.expect_err("timeout");
    assert!(matches!(
        err,
        CommissioningError::Communication {
            step: CommissioningStep::IdentifyModel,
            source: ExchangeError::Timeout {
                command: "read_pump_model",
                ..
            },
        }
    ));
    assert_eq!(err.step(), Some(CommissioningStep::IdentifyModel));
}

#[tokio::test]
async fn rejected_command_is_reported_with_its_step() {
    let mut pump = TestPump::legacy();
    pump.nak_on = Some("select_basal_profile");
    let session = reporting_session(&pump).await;

    let err = session.run(&pump).await.result.expect_err("nak");
    assert!(matches!(
        err,
        CommissioningError::Communication {
            step: CommissioningStep::FetchSettings,
            source: ExchangeError::Rejected {
                command: "select_basal_profile",
                ..
            },
        }
    ));
    assert!(!pump.command_names().await.contains(&"set_time"));
}

#[tokio::test]
async fn malformed_schedule_fails_settings_step() {
    let mut pump = TestPump::legacy();
    pump.schedule = vec![BasalScheduleEntry {
        start_minutes: 60,
        rate_units_per_hour: 1.0,
    }];
    let session = reporting_session(&pump).await;

    let err = session.run(&pump).await.result.expect_err("schedule");
    assert!(matches!(
        err,
        CommissioningError::Communication {
            step: CommissioningStep::FetchSettings,
            source: ExchangeError::MalformedSchedule { .. },
        }
    ));
    assert!(!pump.command_names().await.contains(&"select_basal_profile"));
}

#[tokio::test]
async fn settings_step_selects_standard_profile_and_sets_clock() {
    let offset = FixedOffset::west_opt(5 * 3600).expect("offset");
    let now = offset
        .from_local_datetime(
            &NaiveDate::from_ymd_opt(2026, 3, 14)
                .expect("date")
                .and_hms_opt(9, 26, 53)
                .expect("time"),
        )
        .single()
        .expect("instant");
    let pump = TestPump::legacy();
    let session = reporting_session(&pump)
        .await
        .with_clock(Arc::new(FixedClock(now)));

    let result = session.run(&pump).await.result.expect("commissioned");
    assert_eq!(result.settings.selected_profile, BasalProfile::Standard);
    assert_eq!(result.settings.max_basal_units_per_hour, 2.5);
    assert_eq!(result.settings.max_bolus_units, 8.0);
    assert_eq!(result.settings.basal_schedule.entries.len(), 3);

    let commands = pump.commands().await;
    assert!(commands.contains(&PumpCommand::ReadBasalSchedule {
        profile: BasalProfile::Standard
    }));
    assert!(commands.contains(&PumpCommand::SelectBasalProfile {
        profile: BasalProfile::Standard
    }));
    assert_eq!(
        commands.last(),
        Some(&PumpCommand::SetTime {
            local_time: now.naive_local(),
            time_zone: DeviceTimeZone {
                utc_offset_seconds: -5 * 3600
            },
        })
    );
}
