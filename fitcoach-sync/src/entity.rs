//! Local domain entities replicated by the sync engine.

use chrono::{DateTime, Utc};
use fitcoach_types::{EntityId, RecordKey, RecordType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a closed string enum with a stable wire name per variant.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(other.to_string()),
                }
            }
        }
    };
}

wire_enum!(
    /// Lifecycle of a workout session.
    WorkoutStatus {
        Planned => "planned",
        InProgress => "inProgress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

wire_enum!(
    MealType {
        Breakfast => "breakfast",
        Lunch => "lunch",
        Dinner => "dinner",
        Snack => "snack",
    }
);

wire_enum!(
    GoalKind {
        WeightLoss => "weightLoss",
        MuscleGain => "muscleGain",
        Strength => "strength",
        Endurance => "endurance",
        Nutrition => "nutrition",
        Habit => "habit",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: EntityId,
    pub name: String,
    pub category: String,
    pub equipment: Option<String>,
    pub instructions: Option<String>,
    pub muscle_groups: Vec<String>,
    pub is_custom: bool,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSession {
    pub id: EntityId,
    pub name: String,
    pub status: WorkoutStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub modified_at: DateTime<Utc>,
}

/// One performed set. Owned by its session; points at a library exercise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSet {
    pub id: EntityId,
    pub session_id: EntityId,
    pub exercise_id: Option<EntityId>,
    pub set_index: i64,
    pub reps: Option<i64>,
    pub weight_kg: Option<f64>,
    pub duration_secs: Option<i64>,
    pub completed: bool,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodEntry {
    pub id: EntityId,
    pub name: String,
    pub meal: MealType,
    pub consumed_at: DateTime<Utc>,
    pub calories: f64,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMeasurement {
    pub id: EntityId,
    pub measured_at: DateTime<Utc>,
    pub weight_kg: Option<f64>,
    pub body_fat_pct: Option<f64>,
    pub notes: Option<String>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: EntityId,
    pub title: String,
    pub kind: GoalKind,
    pub target_value: f64,
    pub current_value: f64,
    pub deadline: Option<DateTime<Utc>>,
    pub achieved: bool,
    pub milestones: Vec<String>,
    pub modified_at: DateTime<Utc>,
}

/// Any entity the local store can hand to the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type")]
pub enum Entity {
    Exercise(Exercise),
    WorkoutSession(WorkoutSession),
    ExerciseSet(ExerciseSet),
    FoodEntry(FoodEntry),
    BodyMeasurement(BodyMeasurement),
    Goal(Goal),
}

impl Entity {
    pub fn record_type(&self) -> RecordType {
        match self {
            Entity::Exercise(_) => RecordType::Exercise,
            Entity::WorkoutSession(_) => RecordType::WorkoutSession,
            Entity::ExerciseSet(_) => RecordType::ExerciseSet,
            Entity::FoodEntry(_) => RecordType::FoodEntry,
            Entity::BodyMeasurement(_) => RecordType::BodyMeasurement,
            Entity::Goal(_) => RecordType::Goal,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Entity::Exercise(e) => e.id,
            Entity::WorkoutSession(e) => e.id,
            Entity::ExerciseSet(e) => e.id,
            Entity::FoodEntry(e) => e.id,
            Entity::BodyMeasurement(e) => e.id,
            Entity::Goal(e) => e.id,
        }
    }

    /// The stable remote key for this entity.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type(), self.id())
    }

    /// Local last-modified time.
    pub fn modified_at(&self) -> DateTime<Utc> {
        match self {
            Entity::Exercise(e) => e.modified_at,
            Entity::WorkoutSession(e) => e.modified_at,
            Entity::ExerciseSet(e) => e.modified_at,
            Entity::FoodEntry(e) => e.modified_at,
            Entity::BodyMeasurement(e) => e.modified_at,
            Entity::Goal(e) => e.modified_at,
        }
    }
}
