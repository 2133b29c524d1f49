//! Entity ⇄ record codec.
//!
//! Encoding is pure: optional fields that are `None` are written as cleared,
//! and numbers must be finite. Decoding validates
//! the record name and field kinds and rebuilds an entity skeleton.
//! References are decoded to identifiers only; nothing here looks up the
//! referenced entity.
//!
//! Codecs are looked up through a static [`CodecRegistry`] keyed by
//! [`RecordType`].

use crate::entity::{
    BodyMeasurement, Entity, Exercise, ExerciseSet, FoodEntry, Goal, WorkoutSession,
};
use crate::error::{SyncError, SyncResult};
use crate::record::{DeletePolicy, FieldValue, Record, RecordReference};
use chrono::{DateTime, Utc};
use fitcoach_types::{EntityId, RecordKey, RecordType};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Field carrying the entity's local last-modified time.
pub const MODIFIED_AT_FIELD: &str = "modifiedAt";

/// Why a record could not be turned back into an entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed record key: {0}")]
    MalformedKey(String),

    #[error("{record_type} record is missing field `{field}`")]
    MissingField {
        record_type: RecordType,
        field: String,
    },

    #[error("field `{field}` should be {expected}, found {found}")]
    FieldType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field `{field}` holds invalid JSON: {reason}")]
    InvalidJson { field: String, reason: String },

    #[error("field `{field}` has unknown value `{value}`")]
    UnknownValue { field: String, value: String },

    #[error("no codec registered for record type `{0}`")]
    UnknownRecordType(String),

    #[error("field `{field}` is not a finite number")]
    NonFiniteNumber { field: String },

    #[error("codec for {expected} cannot handle {actual}")]
    TypeMismatch {
        expected: RecordType,
        actual: RecordType,
    },
}

/// Converts one record type in both directions.
pub trait RecordCodec: Send + Sync {
    /// The record type this codec handles.
    fn record_type(&self) -> RecordType;

    /// Encodes an entity. Fails only if handed an entity of another type.
    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError>;

    /// Decodes a record into an entity skeleton.
    fn decode(&self, record: &Record) -> Result<Entity, DecodeError>;
}

// ── Field access helpers ─────────────────────────────────────────

/// Typed read access to a record's fields.
struct Fields<'a> {
    record: &'a Record,
}

impl<'a> Fields<'a> {
    /// Validates the record name against `expected` and returns the entity id.
    fn open(record: &'a Record, expected: RecordType) -> Result<(Self, EntityId), DecodeError> {
        if record.record_type != expected {
            return Err(DecodeError::TypeMismatch {
                expected,
                actual: record.record_type,
            });
        }
        let key = RecordKey::parse(&record.key)
            .map_err(|_| DecodeError::MalformedKey(record.key.clone()))?;
        if key.record_type() != expected {
            return Err(DecodeError::MalformedKey(record.key.clone()));
        }
        Ok((Self { record }, key.entity_id()))
    }

    fn missing(&self, field: &str) -> DecodeError {
        DecodeError::MissingField {
            record_type: self.record.record_type,
            field: field.to_string(),
        }
    }

    fn required<T>(&self, field: &str, read: Option<T>) -> Result<T, DecodeError> {
        read.ok_or_else(|| self.missing(field))
    }

    fn mismatch(field: &str, expected: &'static str, found: &FieldValue) -> DecodeError {
        DecodeError::FieldType {
            field: field.to_string(),
            expected,
            found: found.kind(),
        }
    }

    fn opt_string(&self, field: &str) -> Result<Option<String>, DecodeError> {
        match self.record.get(field) {
            None => Ok(None),
            Some(FieldValue::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(Self::mismatch(field, "string", other)),
        }
    }

    fn string(&self, field: &str) -> Result<String, DecodeError> {
        let v = self.opt_string(field)?;
        self.required(field, v)
    }

    fn opt_int(&self, field: &str) -> Result<Option<i64>, DecodeError> {
        match self.record.get(field) {
            None => Ok(None),
            Some(FieldValue::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(Self::mismatch(field, "int", other)),
        }
    }

    fn int(&self, field: &str) -> Result<i64, DecodeError> {
        let v = self.opt_int(field)?;
        self.required(field, v)
    }

    fn opt_double(&self, field: &str) -> Result<Option<f64>, DecodeError> {
        match self.record.get(field) {
            None => Ok(None),
            Some(FieldValue::Double(d)) => Ok(Some(*d)),
            // Integral numbers written by older clients.
            Some(FieldValue::Int(i)) => Ok(Some(*i as f64)),
            Some(other) => Err(Self::mismatch(field, "double", other)),
        }
    }

    fn double(&self, field: &str) -> Result<f64, DecodeError> {
        let v = self.opt_double(field)?;
        self.required(field, v)
    }

    fn bool(&self, field: &str) -> Result<bool, DecodeError> {
        match self.record.get(field) {
            None => Err(self.missing(field)),
            Some(FieldValue::Bool(b)) => Ok(*b),
            Some(FieldValue::Int(i)) => Ok(*i != 0),
            Some(other) => Err(Self::mismatch(field, "bool", other)),
        }
    }

    fn opt_date(&self, field: &str) -> Result<Option<DateTime<Utc>>, DecodeError> {
        match self.record.get(field) {
            None => Ok(None),
            Some(FieldValue::Date(d)) => Ok(Some(*d)),
            Some(other) => Err(Self::mismatch(field, "date", other)),
        }
    }

    fn date(&self, field: &str) -> Result<DateTime<Utc>, DecodeError> {
        let v = self.opt_date(field)?;
        self.required(field, v)
    }

    /// Local modification time, falling back to the server's when absent.
    fn modified_at(&self) -> Result<DateTime<Utc>, DecodeError> {
        let v = self.opt_date(MODIFIED_AT_FIELD)?.or(self.record.modified_at);
        self.required(MODIFIED_AT_FIELD, v)
    }

    /// A JSON-encoded sequence of strings. Absent means empty.
    fn string_list(&self, field: &str) -> Result<Vec<String>, DecodeError> {
        match self.record.get(field) {
            None => Ok(Vec::new()),
            Some(FieldValue::Json(raw)) => {
                serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson {
                    field: field.to_string(),
                    reason: e.to_string(),
                })
            }
            Some(other) => Err(Self::mismatch(field, "json", other)),
        }
    }

    fn opt_reference(
        &self,
        field: &str,
        target: RecordType,
    ) -> Result<Option<EntityId>, DecodeError> {
        match self.record.get(field) {
            None => Ok(None),
            Some(FieldValue::Reference(r)) => {
                let key = RecordKey::parse(&r.key)
                    .map_err(|_| DecodeError::MalformedKey(r.key.clone()))?;
                if key.record_type() != target {
                    return Err(DecodeError::MalformedKey(r.key.clone()));
                }
                Ok(Some(key.entity_id()))
            }
            Some(other) => Err(Self::mismatch(field, "reference", other)),
        }
    }

    fn reference(&self, field: &str, target: RecordType) -> Result<EntityId, DecodeError> {
        let v = self.opt_reference(field, target)?;
        self.required(field, v)
    }

    fn parse_enum<T: FromStr>(&self, field: &str) -> Result<T, DecodeError> {
        let raw = self.string(field)?;
        raw.parse().map_err(|_| DecodeError::UnknownValue {
            field: field.to_string(),
            value: raw,
        })
    }
}

fn string(s: &str) -> FieldValue {
    FieldValue::String(s.to_string())
}

fn string_list(items: &[String]) -> FieldValue {
    // Serializing a slice of strings cannot fail.
    FieldValue::Json(serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()))
}

fn reference(target: RecordType, id: EntityId, policy: DeletePolicy) -> FieldValue {
    FieldValue::Reference(RecordReference::new(RecordKey::new(target, id), policy))
}

fn base_record(entity: &Entity) -> Record {
    let mut record = Record::new(entity.key());
    record.set(MODIFIED_AT_FIELD, FieldValue::Date(entity.modified_at()));
    record
}

fn mismatch(expected: RecordType, entity: &Entity) -> DecodeError {
    DecodeError::TypeMismatch {
        expected,
        actual: entity.record_type(),
    }
}

// ── Codecs ───────────────────────────────────────────────────────

pub struct ExerciseCodec;

impl RecordCodec for ExerciseCodec {
    fn record_type(&self) -> RecordType {
        RecordType::Exercise
    }

    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError> {
        let Entity::Exercise(e) = entity else {
            return Err(mismatch(self.record_type(), entity));
        };
        let mut r = base_record(entity);
        r.set("name", string(&e.name));
        r.set("category", string(&e.category));
        r.set_opt("equipment", e.equipment.as_deref().map(string));
        r.set_opt("instructions", e.instructions.as_deref().map(string));
        r.set("muscleGroups", string_list(&e.muscle_groups));
        r.set("isCustom", FieldValue::Bool(e.is_custom));
        Ok(r)
    }

    fn decode(&self, record: &Record) -> Result<Entity, DecodeError> {
        let (f, id) = Fields::open(record, self.record_type())?;
        Ok(Entity::Exercise(Exercise {
            id,
            name: f.string("name")?,
            category: f.string("category")?,
            equipment: f.opt_string("equipment")?,
            instructions: f.opt_string("instructions")?,
            muscle_groups: f.string_list("muscleGroups")?,
            is_custom: f.bool("isCustom")?,
            modified_at: f.modified_at()?,
        }))
    }
}

pub struct WorkoutSessionCodec;

impl RecordCodec for WorkoutSessionCodec {
    fn record_type(&self) -> RecordType {
        RecordType::WorkoutSession
    }

    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError> {
        let Entity::WorkoutSession(s) = entity else {
            return Err(mismatch(self.record_type(), entity));
        };
        let mut r = base_record(entity);
        r.set("name", string(&s.name));
        r.set("status", string(s.status.as_str()));
        r.set("startedAt", FieldValue::Date(s.started_at));
        r.set_opt("completedAt", s.completed_at.map(FieldValue::Date));
        r.set_opt("notes", s.notes.as_deref().map(string));
        r.set("tags", string_list(&s.tags));
        Ok(r)
    }

    fn decode(&self, record: &Record) -> Result<Entity, DecodeError> {
        let (f, id) = Fields::open(record, self.record_type())?;
        Ok(Entity::WorkoutSession(WorkoutSession {
            id,
            name: f.string("name")?,
            status: f.parse_enum("status")?,
            started_at: f.date("startedAt")?,
            completed_at: f.opt_date("completedAt")?,
            notes: f.opt_string("notes")?,
            tags: f.string_list("tags")?,
            modified_at: f.modified_at()?,
        }))
    }
}

pub struct ExerciseSetCodec;

impl RecordCodec for ExerciseSetCodec {
    fn record_type(&self) -> RecordType {
        RecordType::ExerciseSet
    }

    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError> {
        let Entity::ExerciseSet(s) = entity else {
            return Err(mismatch(self.record_type(), entity));
        };
        let mut r = base_record(entity);
        r.set(
            "session",
            reference(
                RecordType::WorkoutSession,
                s.session_id,
                DeletePolicy::CascadeDeleteOwner,
            ),
        );
        r.set_opt(
            "exercise",
            s.exercise_id.map(|id| {
                reference(RecordType::Exercise, id, DeletePolicy::NullifyOnOwnerDelete)
            }),
        );
        r.set("setIndex", FieldValue::Int(s.set_index));
        r.set_opt("reps", s.reps.map(FieldValue::Int));
        r.set_opt("weightKg", s.weight_kg.map(FieldValue::Double));
        r.set_opt("durationSecs", s.duration_secs.map(FieldValue::Int));
        r.set("completed", FieldValue::Bool(s.completed));
        Ok(r)
    }

    fn decode(&self, record: &Record) -> Result<Entity, DecodeError> {
        let (f, id) = Fields::open(record, self.record_type())?;
        Ok(Entity::ExerciseSet(ExerciseSet {
            id,
            session_id: f.reference("session", RecordType::WorkoutSession)?,
            exercise_id: f.opt_reference("exercise", RecordType::Exercise)?,
            set_index: f.int("setIndex")?,
            reps: f.opt_int("reps")?,
            weight_kg: f.opt_double("weightKg")?,
            duration_secs: f.opt_int("durationSecs")?,
            completed: f.bool("completed")?,
            modified_at: f.modified_at()?,
        }))
    }
}

pub struct FoodEntryCodec;

impl RecordCodec for FoodEntryCodec {
    fn record_type(&self) -> RecordType {
        RecordType::FoodEntry
    }

    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError> {
        let Entity::FoodEntry(e) = entity else {
            return Err(mismatch(self.record_type(), entity));
        };
        let mut r = base_record(entity);
        r.set("name", string(&e.name));
        r.set("meal", string(e.meal.as_str()));
        r.set("consumedAt", FieldValue::Date(e.consumed_at));
        r.set("calories", FieldValue::Double(e.calories));
        r.set_opt("proteinG", e.protein_g.map(FieldValue::Double));
        r.set_opt("carbsG", e.carbs_g.map(FieldValue::Double));
        r.set_opt("fatG", e.fat_g.map(FieldValue::Double));
        Ok(r)
    }

    fn decode(&self, record: &Record) -> Result<Entity, DecodeError> {
        let (f, id) = Fields::open(record, self.record_type())?;
        Ok(Entity::FoodEntry(FoodEntry {
            id,
            name: f.string("name")?,
            meal: f.parse_enum("meal")?,
            consumed_at: f.date("consumedAt")?,
            calories: f.double("calories")?,
            protein_g: f.opt_double("proteinG")?,
            carbs_g: f.opt_double("carbsG")?,
            fat_g: f.opt_double("fatG")?,
            modified_at: f.modified_at()?,
        }))
    }
}

pub struct BodyMeasurementCodec;

impl RecordCodec for BodyMeasurementCodec {
    fn record_type(&self) -> RecordType {
        RecordType::BodyMeasurement
    }

    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError> {
        let Entity::BodyMeasurement(m) = entity else {
            return Err(mismatch(self.record_type(), entity));
        };
        let mut r = base_record(entity);
        r.set("measuredAt", FieldValue::Date(m.measured_at));
        r.set_opt("weightKg", m.weight_kg.map(FieldValue::Double));
        r.set_opt("bodyFatPct", m.body_fat_pct.map(FieldValue::Double));
        r.set_opt("notes", m.notes.as_deref().map(string));
        Ok(r)
    }

    fn decode(&self, record: &Record) -> Result<Entity, DecodeError> {
        let (f, id) = Fields::open(record, self.record_type())?;
        Ok(Entity::BodyMeasurement(BodyMeasurement {
            id,
            measured_at: f.date("measuredAt")?,
            weight_kg: f.opt_double("weightKg")?,
            body_fat_pct: f.opt_double("bodyFatPct")?,
            notes: f.opt_string("notes")?,
            modified_at: f.modified_at()?,
        }))
    }
}

pub struct GoalCodec;

impl RecordCodec for GoalCodec {
    fn record_type(&self) -> RecordType {
        RecordType::Goal
    }

    fn encode(&self, entity: &Entity) -> Result<Record, DecodeError> {
        let Entity::Goal(g) = entity else {
            return Err(mismatch(self.record_type(), entity));
        };
        let mut r = base_record(entity);
        r.set("title", string(&g.title));
        r.set("kind", string(g.kind.as_str()));
        r.set("targetValue", FieldValue::Double(g.target_value));
        r.set("currentValue", FieldValue::Double(g.current_value));
        r.set_opt("deadline", g.deadline.map(FieldValue::Date));
        r.set("achieved", FieldValue::Bool(g.achieved));
        r.set("milestones", string_list(&g.milestones));
        Ok(r)
    }

    fn decode(&self, record: &Record) -> Result<Entity, DecodeError> {
        let (f, id) = Fields::open(record, self.record_type())?;
        Ok(Entity::Goal(Goal {
            id,
            title: f.string("title")?,
            kind: f.parse_enum("kind")?,
            target_value: f.double("targetValue")?,
            current_value: f.double("currentValue")?,
            deadline: f.opt_date("deadline")?,
            achieved: f.bool("achieved")?,
            milestones: f.string_list("milestones")?,
            modified_at: f.modified_at()?,
        }))
    }
}

// ── Registry ─────────────────────────────────────────────────────

/// Static table from record type to codec.
pub struct CodecRegistry {
    codecs: BTreeMap<RecordType, Box<dyn RecordCodec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            codecs: BTreeMap::new(),
        }
    }

    /// Creates a registry with a codec for every known record type.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(ExerciseCodec));
        registry.register(Box::new(WorkoutSessionCodec));
        registry.register(Box::new(ExerciseSetCodec));
        registry.register(Box::new(FoodEntryCodec));
        registry.register(Box::new(BodyMeasurementCodec));
        registry.register(Box::new(GoalCodec));
        registry
    }

    /// Registers (or replaces) the codec for its record type.
    pub fn register(&mut self, codec: Box<dyn RecordCodec>) {
        self.codecs.insert(codec.record_type(), codec);
    }

    /// Returns the codec for a record type.
    pub fn get(&self, record_type: RecordType) -> Option<&dyn RecordCodec> {
        self.codecs.get(&record_type).map(|c| c.as_ref())
    }

    /// Record types with a registered codec, in dependency order.
    pub fn record_types(&self) -> Vec<RecordType> {
        RecordType::ALL
            .into_iter()
            .filter(|t| self.codecs.contains_key(t))
            .collect()
    }

    fn codec(&self, record_type: RecordType) -> SyncResult<&dyn RecordCodec> {
        self.get(record_type)
            .ok_or_else(|| SyncError::from(DecodeError::UnknownRecordType(record_type.to_string())))
    }

    /// Encodes an entity with the codec for its type.
    ///
    /// NaN and infinite doubles have no wire form and are rejected.
    pub fn encode(&self, entity: &Entity) -> SyncResult<Record> {
        let record = self.codec(entity.record_type())?.encode(entity)?;
        if let Some(field) = record.non_finite_field() {
            return Err(DecodeError::NonFiniteNumber {
                field: field.to_string(),
            }
            .into());
        }
        Ok(record)
    }

    /// Decodes a record with the codec for its type.
    pub fn decode(&self, record: &Record) -> SyncResult<Entity> {
        Ok(self.codec(record.record_type)?.decode(record)?)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
