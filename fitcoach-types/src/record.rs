//! Record types and record keys.
//!
//! A record key is the remote name of a record. It is derived from the
//! owning entity's type and id only, so encoding the same entity twice
//! always targets the same remote record.

use crate::{EntityId, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every entity type the sync engine knows how to replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    Exercise,
    WorkoutSession,
    ExerciseSet,
    FoodEntry,
    BodyMeasurement,
    Goal,
}

impl RecordType {
    /// All known record types, parents before children.
    pub const ALL: [RecordType; 6] = [
        RecordType::Exercise,
        RecordType::WorkoutSession,
        RecordType::ExerciseSet,
        RecordType::FoodEntry,
        RecordType::BodyMeasurement,
        RecordType::Goal,
    ];

    /// Returns the remote type name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordType::Exercise => "Exercise",
            RecordType::WorkoutSession => "WorkoutSession",
            RecordType::ExerciseSet => "ExerciseSet",
            RecordType::FoodEntry => "FoodEntry",
            RecordType::BodyMeasurement => "BodyMeasurement",
            RecordType::Goal => "Goal",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownRecordType(s.to_string()))
    }
}

/// Stable remote name of a record: `<RecordType>/<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    record_type: RecordType,
    entity_id: EntityId,
}

impl RecordKey {
    /// Derives the key for an entity.
    #[must_use]
    pub const fn new(record_type: RecordType, entity_id: EntityId) -> Self {
        Self {
            record_type,
            entity_id,
        }
    }

    /// Returns the record type encoded in the key.
    #[must_use]
    pub const fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Returns the entity id encoded in the key.
    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Parses a remote record name back into a key.
    pub fn parse(name: &str) -> Result<Self, Error> {
        let malformed = || Error::MalformedKey(name.to_string());
        let (type_part, id_part) = name.split_once('/').ok_or_else(malformed)?;
        let record_type = type_part.parse().map_err(|_| malformed())?;
        let entity_id = EntityId::parse(id_part).map_err(|_| malformed())?;
        Ok(Self::new(record_type, entity_id))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.entity_id)
    }
}

impl FromStr for RecordKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RecordKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
