//! Primary records persisted in the ledger.
//!
//! Field names are part of the persisted state: every record serializes to a
//! JSON object with fixed camelCase keys, in declaration order, so a record
//! written and read back is byte-for-byte identical.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HashDress {
    pub hash: String,
    pub storage_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsDress {
    pub name: String,
    pub hash: String,
    pub storage_address: String,
}

/// Explicit reference from a challenge to its reference test set.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChallengeTestData {
    pub dataset_key: String,
    pub data_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Challenge {
    pub name: String,
    pub description_storage_address: String,
    pub metrics: MetricsDress,
    pub owner: String,
    pub test_data: ChallengeTestData,
    pub permissions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Dataset {
    pub name: String,
    pub opener: HashDress,
    #[serde(rename = "type")]
    pub data_type: String,
    pub description: HashDress,
    pub owner: String,
    pub challenge_keys: Vec<String>,
    pub permissions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Data {
    pub dataset_key: String,
    pub test_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Algo {
    pub name: String,
    pub storage_address: String,
    pub description: HashDress,
    pub owner: String,
    pub challenge_key: String,
    pub permissions: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Todo,
    Training,
    Trained,
    Testing,
    Done,
    Failed,
}

impl Status {
    pub const ALL: [Self; 6] = [
        Self::Todo,
        Self::Training,
        Self::Trained,
        Self::Testing,
        Self::Done,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Training => "training",
            Self::Trained => "trained",
            Self::Testing => "testing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todo" => Some(Self::Todo),
            "training" => Some(Self::Training),
            "trained" => Some(Self::Trained),
            "testing" => Some(Self::Testing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker role on a traintuple.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Train,
    Test,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "train" => Some(Self::Train),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TraintupleChallenge {
    pub key: String,
    pub metrics: HashDress,
}

/// Training- or testing-side descriptor of a traintuple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TtData {
    pub worker: String,
    pub keys: Vec<String>,
    pub opener_hash: String,
    pub perf: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Traintuple {
    pub challenge: TraintupleChallenge,
    pub algo: HashDress,
    pub start_model: HashDress,
    pub end_model: Option<HashDress>,
    pub train_data: TtData,
    pub test_data: TtData,
    pub status: Status,
    pub rank: u32,
    pub perf: f32,
    pub log: String,
    pub permissions: String,
    pub creator: String,
}

impl Traintuple {
    #[must_use]
    pub fn worker(&self, role: Role) -> &str {
        match role {
            Role::Train => &self.train_data.worker,
            Role::Test => &self.test_data.worker,
        }
    }
}

/// Any primary record, recognized by its exact field set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LedgerRecord {
    Traintuple(Box<Traintuple>),
    Challenge(Challenge),
    Dataset(Dataset),
    Algo(Algo),
    Data(Data),
}

/// Entity types listable through `getAllOfType`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ElementType {
    Challenge,
    Dataset,
    Data,
    Algo,
    Traintuple,
}

impl ElementType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Challenge => "challenge",
            Self::Dataset => "dataset",
            Self::Data => "data",
            Self::Algo => "algo",
            Self::Traintuple => "traintuple",
        }
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
