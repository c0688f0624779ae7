use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(MatchId);
id_newtype!(QuestionId);
id_newtype!(RescueId);

/// Seat number printed on a contestant's badge, unique within a match and
/// dense from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationNumber(pub u32);

impl fmt::Display for RegistrationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestantStatus {
    NotStarted,
    InProgress,
    Confirmed1,
    Confirmed2,
    Eliminated,
    Rescued,
    Banned,
    Completed,
}

impl ContestantStatus {
    /// Still answering questions: anything that is not knocked out or
    /// disqualified.
    pub fn is_in_play(self) -> bool {
        !matches!(self, Self::Eliminated | Self::Banned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestantRecord {
    pub registration_number: RegistrationNumber,
    pub full_name: String,
    pub status: ContestantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eliminated_at_question_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescued_at_question_order: Option<u32>,
}

/// What the audience screen is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderMode {
    #[default]
    Background,
    Question,
    QuestionInfo,
    Answer,
    Explanation,
    RosterEliminated,
    RosterRescued,
    PrizeFirst,
    PrizeSecond,
    PrizeThird,
    PrizeConsolation,
    Winners,
}

impl RenderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Question => "question",
            Self::QuestionInfo => "questionInfo",
            Self::Answer => "answer",
            Self::Explanation => "explanation",
            Self::RosterEliminated => "rosterEliminated",
            Self::RosterRescued => "rosterRescued",
            Self::PrizeFirst => "prizeFirst",
            Self::PrizeSecond => "prizeSecond",
            Self::PrizeThird => "prizeThird",
            Self::PrizeConsolation => "prizeConsolation",
            Self::Winners => "winners",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator instruction carried as the value of a screen-control signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    Eliminate,
    Rescued,
    Custom(String),
}

impl ControlCommand {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Eliminate => "Eliminate",
            Self::Rescued => "Rescued",
            Self::Custom(value) => value,
        }
    }
}

impl From<&str> for ControlCommand {
    fn from(value: &str) -> Self {
        match value {
            "Eliminate" => Self::Eliminate,
            "Rescued" => Self::Rescued,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for ControlCommand {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Eliminate" => Self::Eliminate,
            "Rescued" => Self::Rescued,
            _ => Self::Custom(value),
        }
    }
}

impl Serialize for ControlCommand {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ControlCommand {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescueStatus {
    NotUsed,
    Active,
    Used,
}
