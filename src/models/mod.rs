use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display};

/// Identifier for a user or an item
///
/// Loaders for numeric datasets (e.g. MovieLens) produce `Numeric` ids,
/// loaders keyed by strings (e.g. ISBNs) produce `Key` ids. Ordering puts
/// numeric ids first, each variant in its natural order, which is what
/// every "ascending id" tie-break in the crate relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityId {
    Numeric(u64),
    Key(String),
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Numeric(id) => write!(f, "{}", id),
            EntityId::Key(id) => write!(f, "{}", id),
        }
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId::Numeric(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::Key(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::Key(id)
    }
}

/// Ratings keyed by the id on the other axis
///
/// Kept ordered so every sum over a vector runs in ascending key order and
/// produces the same bits on every run.
pub type Ratings = BTreeMap<EntityId, f64>;

/// Row id -> ratings. Forward matrices are keyed by user, inverted by item.
pub type PreferenceMatrix = BTreeMap<EntityId, Ratings>;

/// Something that can be rated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    id: EntityId,
    display_value: String,
}

impl Item {
    pub fn new(id: impl Into<EntityId>, display_value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_value: display_value.into(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn display_value(&self) -> &str {
        &self.display_value
    }
}

/// A user together with the ratings they gave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    id: EntityId,
    display_value: String,
    preferences: Ratings,
}

impl User {
    pub fn new(id: impl Into<EntityId>, display_value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_value: display_value.into(),
            preferences: Ratings::new(),
        }
    }

    /// Records a rating, replacing any earlier rating of the same item
    ///
    /// Ratings must be finite and non-zero; loading rejects anything else.
    pub fn add_preference(&mut self, item_id: impl Into<EntityId>, rating: f64) {
        self.preferences.insert(item_id.into(), rating);
    }

    /// Builder form of [`User::add_preference`]
    pub fn with_preference(mut self, item_id: impl Into<EntityId>, rating: f64) -> Self {
        self.add_preference(item_id, rating);
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn display_value(&self) -> &str {
        &self.display_value
    }

    pub fn preferences(&self) -> &Ratings {
        &self.preferences
    }
}

/// One row of a ranked result: similar user, similar item or recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub display_value: String,
    pub id: EntityId,
    pub score: f64,
}

impl ScoredEntity {
    pub fn new(display_value: impl Into<String>, id: EntityId, score: f64) -> Self {
        Self {
            display_value: display_value.into(),
            id,
            score,
        }
    }
}
