use std::sync::Arc;

use shared::{
    domain::{BasalProfile, BasalSchedule, PumpModel, PumpRegion, RemoteId},
    protocol::{self, PumpCommand, PumpReply},
};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod cancel;
pub mod device_state;
pub mod error;
pub mod transport;
pub mod types;

pub use cancel::{cancellation, CancelHandle, CancellationSignal};
pub use device_state::{CompanionDeviceRecord, DeviceState, DeviceStateNotifier, DeviceStateUpdate};
pub use error::{CommissioningError, CommissioningStep, ExchangeError};
pub use transport::{MissingTransport, TransportError, TransportHandle};
pub use types::{
    assemble_result, Clock, CommissioningResult, DeviceIdentity, NextSetupStep,
    PumpManagerState, PumpOperatingSettings, RadioConfiguration, SessionOptions, SystemClock,
};

/// What a finished session hands back: the outcome plus everything learned
/// about the pump, which is kept even when the session failed.
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: Result<CommissioningResult, CommissioningError>,
    pub device_state: DeviceState,
}

/// One-shot commissioning run against a single pump.
///
/// The session tunes the radio, identifies the pump model, reconciles
/// companion device IDs, reads the operating settings and finally checks that
/// the pump's identity is fully known. The first failing step ends the
/// session; a new session must be built to try again.
pub struct CommissioningSession {
    session_id: Uuid,
    identity: DeviceIdentity,
    options: SessionOptions,
    clock: Arc<dyn Clock>,
    cancel: CancellationSignal,
    state: DeviceState,
    notifier: DeviceStateNotifier,
    updates: mpsc::UnboundedReceiver<DeviceStateUpdate>,
}

impl CommissioningSession {
    pub fn new(identity: DeviceIdentity, options: SessionOptions) -> Self {
        let (notifier, updates) = device_state::notifier_channel();
        Self {
            session_id: Uuid::new_v4(),
            identity,
            options,
            clock: Arc::new(SystemClock),
            cancel: CancellationSignal::never(),
            state: DeviceState::default(),
            notifier,
            updates,
        }
    }

    /// Validates the user-entered pump id before anything touches the radio.
    pub fn for_pump(
        pump_id: &str,
        region: PumpRegion,
        options: SessionOptions,
    ) -> Result<Self, CommissioningError> {
        let identity = DeviceIdentity::new(pump_id, region)?;
        Ok(Self::new(identity, options))
    }

    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Entry point for out-of-band model / time zone reports about this pump.
    pub fn notifier(&self) -> DeviceStateNotifier {
        self.notifier.clone()
    }

    pub async fn run<T>(mut self, transport: &T) -> SessionOutcome
    where
        T: TransportHandle + ?Sized,
    {
        let span = info_span!(
            "commissioning.session",
            session_id = %self.session_id,
            session_name = %self.options.session_name,
            pump_id = %self.identity.pump_id,
            region = ?self.identity.region,
        );
        let result = self.execute(transport).instrument(span).await;
        SessionOutcome {
            result,
            device_state: self.state,
        }
    }

    async fn execute<T>(&mut self, transport: &T) -> Result<CommissioningResult, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        if !transport.is_connected() {
            warn!("commissioning: radio bridge not connected");
            return Err(CommissioningError::NoDevice);
        }
        info!("commissioning: session started");

        let result = self.run_steps(transport).await;
        match &result {
            Ok(done) => info!(
                model = %done.manager_state.pump_model,
                companion_setup_required = done.companion_setup_required,
                "commissioning: completed"
            ),
            Err(CommissioningError::Cancelled { before }) => {
                info!(%before, "commissioning: cancelled")
            }
            Err(err) => warn!(step = ?err.step(), "commissioning: failed: {err}"),
        }
        result
    }

    async fn run_steps<T>(&mut self, transport: &T) -> Result<CommissioningResult, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let radio = self.tune_radio(transport).await?;
        self.state.radio = Some(radio);

        let model = self.identify_model(transport).await?;
        let companion_setup_required = self.reconcile_companions(transport, model).await?;
        let settings = self.fetch_settings(transport).await?;

        self.ensure_not_cancelled(CommissioningStep::Finalize)?;
        self.drain_updates();
        assemble_result(
            &self.state,
            &self.identity,
            self.options.pump_color,
            settings,
            companion_setup_required,
        )
    }

    async fn tune_radio<T>(&mut self, transport: &T) -> Result<RadioConfiguration, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let step = CommissioningStep::TuneRadio;
        let region = self.identity.region;
        let command = PumpCommand::TuneRadio {
            region,
            scan_frequencies_mhz: region.scan_frequencies_mhz(),
        };
        match self.exchange(transport, step, command).await? {
            PumpReply::RadioTuned {
                frequency_mhz,
                rssi_dbm,
            } => {
                info!(frequency_mhz, rssi_dbm, "commissioning: radio tuned");
                Ok(RadioConfiguration {
                    region,
                    frequency_mhz,
                    rssi_dbm,
                })
            }
            other => Err(unexpected(step, "tune_radio", &other)),
        }
    }

    async fn identify_model<T>(&mut self, transport: &T) -> Result<PumpModel, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let step = CommissioningStep::IdentifyModel;
        match self.exchange(transport, step, PumpCommand::ReadPumpModel).await? {
            PumpReply::PumpModel { model } => {
                self.state.adopt_read_model(model);
                info!(%model, has_my_sentry = model.has_my_sentry(), "commissioning: pump identified");
                Ok(model)
            }
            other => Err(unexpected(step, "read_pump_model", &other)),
        }
    }

    /// Returns whether companion (MySentry) setup is still needed.
    async fn reconcile_companions<T>(
        &mut self,
        transport: &T,
        model: PumpModel,
    ) -> Result<bool, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        if model.has_my_sentry() {
            self.reconcile_other_devices(transport).await
        } else {
            self.reconcile_remote_control(transport).await?;
            Ok(false)
        }
    }

    async fn reconcile_other_devices<T>(&mut self, transport: &T) -> Result<bool, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let step = CommissioningStep::ReconcileCompanions;
        let enabled = match self
            .exchange(transport, step, PumpCommand::ReadOtherDevicesEnabled)
            .await?
        {
            PumpReply::OtherDevicesEnabled { enabled } => enabled,
            other => return Err(unexpected(step, "read_other_devices_enabled", &other)),
        };

        if !enabled {
            self.state.companions = Some(CompanionDeviceRecord::OtherDevices {
                enabled,
                ids: Vec::new(),
            });
            info!("commissioning: other devices disabled, companion setup required");
            return Ok(true);
        }

        let ids = match self
            .exchange(transport, step, PumpCommand::ReadOtherDeviceIds)
            .await?
        {
            PumpReply::OtherDeviceIds { ids } => ids,
            other => return Err(unexpected(step, "read_other_device_ids", &other)),
        };
        let setup_required = ids.is_empty();
        info!(
            paired = ids.len(),
            setup_required, "commissioning: other device ids read"
        );
        self.state.companions = Some(CompanionDeviceRecord::OtherDevices { enabled, ids });
        Ok(setup_required)
    }

    async fn reconcile_remote_control<T>(&mut self, transport: &T) -> Result<(), CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let step = CommissioningStep::ReconcileCompanions;
        let mut ids = match self
            .exchange(transport, step, PumpCommand::ReadRemoteControlIds)
            .await?
        {
            PumpReply::RemoteControlIds { ids } => ids,
            other => return Err(unexpected(step, "read_remote_control_ids", &other)),
        };

        // Only write when the pump reports no remote at all; the write is not
        // safe to repeat blindly.
        if ids.is_empty() {
            let command = PumpCommand::SetRemoteControlId {
                remote_id: RemoteId::PLACEHOLDER,
                slot: RemoteId::PLACEHOLDER_SLOT,
            };
            self.exchange_ack(transport, step, command).await?;
            info!(
                remote_id = %RemoteId::PLACEHOLDER,
                slot = RemoteId::PLACEHOLDER_SLOT,
                "commissioning: wrote placeholder remote control id"
            );
            ids.push(RemoteId::PLACEHOLDER);
        } else {
            debug!(count = ids.len(), "commissioning: remote control ids already present");
        }
        self.state.companions = Some(CompanionDeviceRecord::RemoteControl { ids });

        let command = PumpCommand::SetRemoteControlEnabled { enabled: true };
        self.exchange_ack(transport, step, command).await?;
        self.state.remote_control_enabled = Some(true);
        info!("commissioning: remote control enabled");
        Ok(())
    }

    async fn fetch_settings<T>(
        &mut self,
        transport: &T,
    ) -> Result<PumpOperatingSettings, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let step = CommissioningStep::FetchSettings;
        let profile = BasalProfile::Standard;

        let (max_basal_units_per_hour, max_bolus_units) =
            match self.exchange(transport, step, PumpCommand::ReadSettings).await? {
                PumpReply::Settings {
                    max_basal_units_per_hour,
                    max_bolus_units,
                    ..
                } => (max_basal_units_per_hour, max_bolus_units),
                other => return Err(unexpected(step, "read_settings", &other)),
            };

        let command = PumpCommand::ReadBasalSchedule { profile };
        let basal_schedule = match self.exchange(transport, step, command).await? {
            PumpReply::BasalSchedule {
                profile: reported,
                entries,
            } if reported == profile => BasalSchedule::new(entries),
            other => return Err(unexpected(step, "read_basal_schedule", &other)),
        };
        basal_schedule.validate().map_err(|source| {
            step.failed(ExchangeError::MalformedSchedule {
                command: "read_basal_schedule",
                source,
            })
        })?;

        let command = PumpCommand::SelectBasalProfile { profile };
        self.exchange_ack(transport, step, command).await?;

        let now = self.clock.now();
        let command = PumpCommand::SetTime {
            local_time: now.naive_local(),
            time_zone: (*now.offset()).into(),
        };
        self.exchange_ack(transport, step, command).await?;

        info!(
            max_basal_units_per_hour,
            max_bolus_units,
            basal_entries = basal_schedule.entries.len(),
            "commissioning: settings read"
        );
        Ok(PumpOperatingSettings {
            max_basal_units_per_hour,
            max_bolus_units,
            basal_schedule,
            selected_profile: profile,
        })
    }

    /// Sends one command and waits, bounded by the exchange timeout, for its
    /// reply. Cancellation is honoured only before the command goes out.
    async fn exchange<T>(
        &mut self,
        transport: &T,
        step: CommissioningStep,
        command: PumpCommand,
    ) -> Result<PumpReply, CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        self.ensure_not_cancelled(step)?;
        self.drain_updates();

        let name = command.name();
        let request = protocol::encode(&command)
            .map_err(|source| step.failed(ExchangeError::Codec { command: name, source }))?;

        debug!(%step, command = name, "commissioning: sending");
        let after = self.options.exchange_timeout;
        let response = match timeout(after, transport.exchange(&request)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(source)) => {
                return Err(step.failed(ExchangeError::Transport {
                    command: name,
                    source,
                }))
            }
            Err(_) => {
                return Err(step.failed(ExchangeError::Timeout {
                    command: name,
                    after,
                }))
            }
        };

        let reply: PumpReply = protocol::decode(&response)
            .map_err(|source| step.failed(ExchangeError::Codec { command: name, source }))?;
        self.drain_updates();

        if let PumpReply::Nak { message } = reply {
            return Err(step.failed(ExchangeError::Rejected {
                command: name,
                message,
            }));
        }
        debug!(%step, command = name, reply = reply.name(), "commissioning: received");
        Ok(reply)
    }

    async fn exchange_ack<T>(
        &mut self,
        transport: &T,
        step: CommissioningStep,
        command: PumpCommand,
    ) -> Result<(), CommissioningError>
    where
        T: TransportHandle + ?Sized,
    {
        let name = command.name();
        match self.exchange(transport, step, command).await? {
            PumpReply::Ack => Ok(()),
            other => Err(unexpected(step, name, &other)),
        }
    }

    fn ensure_not_cancelled(&self, before: CommissioningStep) -> Result<(), CommissioningError> {
        if self.cancel.is_cancelled() {
            return Err(CommissioningError::Cancelled { before });
        }
        Ok(())
    }

    fn drain_updates(&mut self) {
        while let Ok(update) = self.updates.try_recv() {
            self.state.merge(update);
        }
    }
}

fn unexpected(step: CommissioningStep, command: &'static str, reply: &PumpReply) -> CommissioningError {
    step.failed(ExchangeError::UnexpectedReply {
        command,
        reply: reply.name(),
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
