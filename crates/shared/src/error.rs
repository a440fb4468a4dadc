use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("pump id must be exactly {expected} characters, got {actual}")]
    InvalidPumpIdLength { expected: usize, actual: usize },
    #[error("pump id must contain only ASCII digits: {0:?}")]
    InvalidPumpIdCharacters(String),
    #[error("unknown pump region code {0:?}")]
    UnknownRegionCode(String),
    #[error("unknown pump color {0:?}")]
    UnknownColor(String),
    #[error("unrecognized pump model {0:?}")]
    UnknownModel(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode pump message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode pump message: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("basal schedule has no entries")]
    Empty,
    #[error("basal schedule starts at minute {0} instead of midnight")]
    DoesNotStartAtMidnight(u16),
    #[error("basal schedule entry {index} starts at minute {start_minutes}, past the end of the day")]
    StartOutOfRange { index: usize, start_minutes: u16 },
    #[error("basal schedule entry {index} does not start after the previous entry")]
    NotAscending { index: usize },
    #[error("basal schedule entry {index} has an invalid rate")]
    InvalidRate { index: usize },
}
