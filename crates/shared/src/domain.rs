use std::{fmt, str::FromStr};

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, ScheduleError};

pub const PUMP_ID_LEN: usize = 6;
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Serial number printed on the back of the pump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PumpId(String);

impl PumpId {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let actual = raw.chars().count();
        if actual != PUMP_ID_LEN {
            return Err(IdentityError::InvalidPumpIdLength {
                expected: PUMP_ID_LEN,
                actual,
            });
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::InvalidPumpIdCharacters(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PumpId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PumpId> for String {
    fn from(value: PumpId) -> Self {
        value.0
    }
}

impl fmt::Display for PumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpRegion {
    NorthAmerica,
    Canada,
    WorldWide,
}

impl PumpRegion {
    /// Frequencies scanned while tuning, in MHz.
    pub fn scan_frequencies_mhz(self) -> Vec<f64> {
        let (start_khz, end_khz) = match self {
            Self::NorthAmerica | Self::Canada => (916_450u32, 916_800u32),
            Self::WorldWide => (868_250u32, 868_650u32),
        };
        (start_khz..=end_khz)
            .step_by(50)
            .map(|khz| f64::from(khz) / 1000.0)
            .collect()
    }
}

impl fmt::Display for PumpRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NorthAmerica => "North America",
            Self::Canada => "Canada",
            Self::WorldWide => "World-Wide",
        };
        f.write_str(label)
    }
}

/// Two-letter region code printed on the pump label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionCode {
    NorthAmerica,
    Canada,
    WorldWide,
}

impl RegionCode {
    /// Picker order.
    pub const ALL: [RegionCode; 3] = [Self::NorthAmerica, Self::Canada, Self::WorldWide];

    pub fn code(self) -> &'static str {
        match self {
            Self::NorthAmerica => "NA",
            Self::Canada => "CA",
            Self::WorldWide => "WW",
        }
    }

    pub fn region(self) -> PumpRegion {
        match self {
            Self::NorthAmerica => PumpRegion::NorthAmerica,
            Self::Canada => PumpRegion::Canada,
            Self::WorldWide => PumpRegion::WorldWide,
        }
    }
}

impl FromStr for RegionCode {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.code().eq_ignore_ascii_case(code))
            .ok_or_else(|| IdentityError::UnknownRegionCode(code.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpColor {
    #[default]
    Blue,
    Clear,
    Purple,
    Smoke,
    Pink,
}

impl PumpColor {
    /// Picker order.
    pub const ALL: [PumpColor; 5] = [
        Self::Blue,
        Self::Clear,
        Self::Purple,
        Self::Smoke,
        Self::Pink,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Clear => "clear",
            Self::Purple => "purple",
            Self::Smoke => "smoke",
            Self::Pink => "pink",
        }
    }
}

impl FromStr for PumpColor {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| IdentityError::UnknownColor(name.to_string()))
    }
}

const KNOWN_MODELS: &[u16] = &[
    508, 511, 512, 515, 522, 523, 530, 540, 551, 554, 711, 712, 715, 722, 723, 730, 740, 751,
    754,
];

/// Model number reported by the pump, e.g. `523` or `722`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PumpModel(u16);

impl PumpModel {
    pub fn number(self) -> u16 {
        self.0
    }

    pub fn generation(self) -> u16 {
        self.0 % 100
    }

    /// Whether the pump can pair "other devices" (MySentry class monitors).
    pub fn has_my_sentry(self) -> bool {
        self.generation() >= 23
    }

    /// 7xx pumps carry the larger reservoir.
    pub fn is_larger(self) -> bool {
        self.0 / 100 == 7
    }
}

impl FromStr for PumpModel {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        raw.parse::<u16>()
            .ok()
            .filter(|number| KNOWN_MODELS.contains(number))
            .map(Self)
            .ok_or_else(|| IdentityError::UnknownModel(raw.to_string()))
    }
}

impl TryFrom<String> for PumpModel {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PumpModel> for String {
    fn from(value: PumpModel) -> Self {
        value.0.to_string()
    }
}

impl fmt::Display for PumpModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The pump clock's time zone, stored as a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTimeZone {
    pub utc_offset_seconds: i32,
}

impl DeviceTimeZone {
    pub fn utc() -> Self {
        Self {
            utc_offset_seconds: 0,
        }
    }

    pub fn fixed_offset(self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds)
    }
}

impl From<FixedOffset> for DeviceTimeZone {
    fn from(value: FixedOffset) -> Self {
        Self {
            utc_offset_seconds: value.local_minus_utc(),
        }
    }
}

/// Six-byte remote control identifier stored in a pump slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(pub [u8; 6]);

impl RemoteId {
    /// Written when a pre-MySentry pump has no remote configured; having any
    /// remote ID shortens the pump's radio wake interval.
    pub const PLACEHOLDER: RemoteId = RemoteId([9, 9, 9, 9, 9, 9]);
    pub const PLACEHOLDER_SLOT: u8 = 2;
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for digit in self.0 {
            write!(f, "{digit}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasalProfile {
    #[default]
    Standard,
    PatternA,
    PatternB,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BasalScheduleEntry {
    /// Minutes after midnight.
    pub start_minutes: u16,
    pub rate_units_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BasalSchedule {
    pub entries: Vec<BasalScheduleEntry>,
}

impl BasalSchedule {
    pub fn new(entries: Vec<BasalScheduleEntry>) -> Self {
        Self { entries }
    }

    /// Checks that the entries cover the whole day in ascending order.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        let Some(first) = self.entries.first() else {
            return Err(ScheduleError::Empty);
        };
        if first.start_minutes != 0 {
            return Err(ScheduleError::DoesNotStartAtMidnight(first.start_minutes));
        }

        let mut previous: Option<u16> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.start_minutes >= MINUTES_PER_DAY {
                return Err(ScheduleError::StartOutOfRange {
                    index,
                    start_minutes: entry.start_minutes,
                });
            }
            if previous.is_some_and(|prev| entry.start_minutes <= prev) {
                return Err(ScheduleError::NotAscending { index });
            }
            if !entry.rate_units_per_hour.is_finite() || entry.rate_units_per_hour < 0.0 {
                return Err(ScheduleError::InvalidRate { index });
            }
            previous = Some(entry.start_minutes);
        }
        Ok(())
    }

    pub fn rate_at(&self, minute_of_day: u16) -> Option<f64> {
        self.entries
            .iter()
            .take_while(|entry| entry.start_minutes <= minute_of_day)
            .last()
            .map(|entry| entry.rate_units_per_hour)
    }
}
