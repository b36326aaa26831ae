//! Core record types of the repository
//!
//! - `QueryRecord`: an aggregate query posed by a data processor
//! - `QueryUser`: one selected user's consent and settings snapshot
//! - `PrivacySetting` / `UploadGranularityRecord`: live per-user settings
//! - `PinQueryRecord`: a query addressed to users by a short PIN
//! - `QueryState`, `ConsentState`, `Tier`: classification enums

use crate::sources::{AttributeValue, UserDataType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type ProcessorId = i64;
pub type QueryId = i64;
pub type DataSourceId = i64;

/// Identifier of a data-contributing user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queries are unique per processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub processor_id: ProcessorId,
    pub query_id: QueryId,
}

impl QueryKey {
    pub fn new(processor_id: ProcessorId, query_id: QueryId) -> Self {
        Self {
            processor_id,
            query_id,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.processor_id, self.query_id)
    }
}

/// A state or consent string that does not name a known variant
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown {kind}: {value}")]
pub struct ParseStateError {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Pending,
    Processing,
    Completed,
    Aborted,
    Paid,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Paid => "paid",
        }
    }

    /// Whether `self → next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: QueryState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Aborted)
                | (Self::Completed, Self::Paid)
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "paid" => Ok(Self::Paid),
            _ => Err(ParseStateError {
                kind: "query state",
                value: s.to_string(),
            }),
        }
    }
}

/// A user's answer to a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    Pending,
    Accepted,
    Refused,
}

impl ConsentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Refused => "refused",
        }
    }

    pub fn from_answer(accept: bool) -> Self {
        if accept {
            Self::Accepted
        } else {
            Self::Refused
        }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "refused" => Ok(Self::Refused),
            _ => Err(ParseStateError {
                kind: "consent state",
                value: s.to_string(),
            }),
        }
    }
}

/// Privacy tier a user assigns to an attribute. Higher is stricter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Tier {
    One,
    Two,
    Three,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::One, Tier::Two, Tier::Three];

    pub fn level(&self) -> i64 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    pub fn index(&self) -> usize {
        self.level() as usize - 1
    }

    pub fn next(&self) -> Option<Tier> {
        match self {
            Self::One => Some(Self::Two),
            Self::Two => Some(Self::Three),
            Self::Three => None,
        }
    }
}

impl TryFrom<i64> for Tier {
    type Error = String;

    fn try_from(level: i64) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(format!("privacy tier out of range: {}", other)),
        }
    }
}

impl From<Tier> for i64 {
    fn from(tier: Tier) -> Self {
        tier.level()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// An aggregate query posed by a data processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub processor_id: ProcessorId,
    pub query_id: QueryId,
    pub query: String,
    pub price: f64,
    /// Minimum number of accepting users
    pub amount: u32,
    pub interval_start: i64,
    pub interval_finish: i64,
    pub consent_start: i64,
    pub consent_finish: i64,
    /// Coarsest granularity (ms) a user may upload at to be selected
    pub granularity: Option<i64>,
    pub max_privacy: i64,
    pub state: QueryState,
    pub result: Option<String>,
    pub title: String,
    pub description: String,
    pub goal_description: String,
    pub thumbnail_url: String,
    pub used_data_types: Vec<UserDataType>,
}

impl QueryRecord {
    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.processor_id, self.query_id)
    }

    pub fn interval_len(&self) -> i64 {
        self.interval_finish - self.interval_start
    }
}

/// A selected user's participation in a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryUser {
    pub user_id: UserId,
    pub key: QueryKey,
    pub consent: ConsentState,
    /// JSON snapshot of the selection settings, empty for pin queries
    pub settings: String,
}

/// Live privacy setting of one user for one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacySetting {
    pub user_id: UserId,
    pub data_source_id: DataSourceId,
    pub attribute: String,
    pub level: i64,
    pub explicit_consent: bool,
}

/// Upload interval a user announced at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadGranularityRecord {
    pub user_id: UserId,
    pub data_source_id: DataSourceId,
    pub timestamp: i64,
    pub interval: i64,
}

/// A raw stored value
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub value: AttributeValue,
}

impl Sample {
    pub fn new(timestamp: i64, value: AttributeValue) -> Self {
        Self { timestamp, value }
    }
}

/// A query addressed by PIN instead of user selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinQueryRecord {
    pub processor_id: ProcessorId,
    pub query_id: QueryId,
    pub query: String,
    pub pin: u32,
    pub session_id: i64,
    pub consent_start: i64,
    pub consent_finish: i64,
    pub state: QueryState,
    pub result: Option<String>,
}

impl PinQueryRecord {
    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.processor_id, self.query_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip_strings() {
        for state in [
            QueryState::Pending,
            QueryState::Processing,
            QueryState::Completed,
            QueryState::Aborted,
            QueryState::Paid,
        ] {
            assert_eq!(state.as_str().parse::<QueryState>().unwrap(), state);
        }
        assert!("abandoned".parse::<QueryState>().is_err());
        assert_eq!("refused".parse::<ConsentState>().unwrap(), ConsentState::Refused);
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(QueryState::Pending.can_transition_to(QueryState::Processing));
        assert!(QueryState::Processing.can_transition_to(QueryState::Aborted));
        assert!(QueryState::Completed.can_transition_to(QueryState::Paid));
        assert!(!QueryState::Pending.can_transition_to(QueryState::Completed));
        assert!(!QueryState::Aborted.can_transition_to(QueryState::Processing));
        assert!(!QueryState::Paid.can_transition_to(QueryState::Completed));
    }

    #[test]
    fn test_tier_conversion() {
        assert_eq!(Tier::try_from(2).unwrap(), Tier::Two);
        assert!(Tier::try_from(0).is_err());
        assert!(Tier::try_from(4).is_err());
        assert_eq!(Tier::Three.index(), 2);
        assert_eq!(Tier::One.next(), Some(Tier::Two));
        assert_eq!(Tier::Three.next(), None);

        let json = serde_json::to_string(&Tier::Two).unwrap();
        assert_eq!(json, "2");
        assert_eq!(serde_json::from_str::<Tier>("3").unwrap(), Tier::Three);
        assert!(serde_json::from_str::<Tier>("5").is_err());
    }
}
