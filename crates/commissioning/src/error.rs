use std::{fmt, time::Duration};

use serde::Serialize;
use shared::error::{CodecError, IdentityError, ScheduleError};
use thiserror::Error;

use crate::transport::TransportError;

/// The five ordered stages of a commissioning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissioningStep {
    TuneRadio,
    IdentifyModel,
    ReconcileCompanions,
    FetchSettings,
    Finalize,
}

impl CommissioningStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TuneRadio => "tune_radio",
            Self::IdentifyModel => "identify_model",
            Self::ReconcileCompanions => "reconcile_companions",
            Self::FetchSettings => "fetch_settings",
            Self::Finalize => "finalize",
        }
    }

    pub(crate) fn failed(self, source: ExchangeError) -> CommissioningError {
        CommissioningError::Communication { step: self, source }
    }
}

impl fmt::Display for CommissioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{command}: {source}")]
    Transport {
        command: &'static str,
        source: TransportError,
    },
    #[error("{command}: no reply within {after:?}")]
    Timeout {
        command: &'static str,
        after: Duration,
    },
    #[error("{command}: {source}")]
    Codec {
        command: &'static str,
        source: CodecError,
    },
    #[error("{command}: pump rejected command: {message}")]
    Rejected {
        command: &'static str,
        message: String,
    },
    #[error("{command}: unexpected reply {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: &'static str,
    },
    #[error("{command}: malformed basal schedule: {source}")]
    MalformedSchedule {
        command: &'static str,
        source: ScheduleError,
    },
}

#[derive(Debug, Error)]
pub enum CommissioningError {
    #[error("invalid pump identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("no connected radio bridge available")]
    NoDevice,
    #[error("communication failed during {step}: {source}")]
    Communication {
        step: CommissioningStep,
        #[source]
        source: ExchangeError,
    },
    #[error("pump did not report its model and time zone; it cannot be treated as commissioned")]
    IncompleteDeviceState,
    #[error("commissioning cancelled before {before}")]
    Cancelled { before: CommissioningStep },
}

impl CommissioningError {
    /// The step that failed, when the failure happened on the radio link.
    pub fn step(&self) -> Option<CommissioningStep> {
        match self {
            Self::Communication { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Whether running a fresh session could plausibly succeed without new
    /// user input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoDevice
                | Self::Communication { .. }
                | Self::IncompleteDeviceState
                | Self::Cancelled { .. }
        )
    }
}
