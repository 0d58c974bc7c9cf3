//! Storage backend abstraction shared by every engine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{BackendError, ErrorSeverity, StorageEngine, StorageErrorKind, StorageResult};

/// Current state document format version.
pub const STATE_VERSION: u32 = 1;

/// Persistable entity with a stable string id.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Unique id within a backend.
    fn id(&self) -> &str;

    /// Name used in error messages, e.g. `"task"`.
    fn entity_type() -> &'static str;
}

/// Bookkeeping stored alongside the entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    /// Document format version.
    pub version: u32,
    /// Where the state lives, for diagnostics.
    pub storage_location: String,
    /// Advanced on every successful mutation.
    pub last_updated: DateTime<Utc>,
}

impl StateMetadata {
    /// Fresh metadata for a storage location.
    pub fn new(storage_location: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            storage_location: storage_location.into(),
            last_updated: Utc::now(),
        }
    }

    /// Advances `last_updated` strictly beyond its previous value, even
    /// when the clock has not ticked since the last mutation.
    pub fn touch(&mut self) {
        let now = Utc::now();
        let floor = self.last_updated + Duration::milliseconds(1);
        self.last_updated = if now > floor { now } else { floor };
    }
}

/// Snapshot of every entity in a backend plus bookkeeping metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageState<T> {
    /// Entities in insertion order.
    pub entities: Vec<T>,
    /// Bookkeeping for the stored document.
    pub metadata: StateMetadata,
}

impl<T: Entity> StorageState<T> {
    /// Initial empty state for a storage location.
    pub fn initial(storage_location: impl Into<String>) -> Self {
        Self {
            entities: Vec::new(),
            metadata: StateMetadata::new(storage_location),
        }
    }

    /// Finds an entity by id.
    pub fn find(&self, id: &str) -> Option<&T> {
        self.entities.iter().find(|e| e.id() == id)
    }

    /// Whether an entity with `id` exists.
    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }
}

/// Equality filter over top-level entity fields.
///
/// Field names are the serialized (wire) names, so a status condition
/// matches against values like `"IN-PROGRESS"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    conditions: BTreeMap<String, serde_json::Value>,
}

impl EntityFilter {
    /// Filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality condition on a top-level field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.conditions.insert(name.into(), value.into());
        self
    }

    /// Whether any conditions are set.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// True when every condition equals the entity's serialized field.
    pub fn matches<T: Serialize>(&self, entity: &T) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let value = match serde_json::to_value(entity) {
            Ok(value) => value,
            Err(_) => return false,
        };
        self.conditions
            .iter()
            .all(|(name, expected)| value.get(name) == Some(expected))
    }
}

/// Uniform interface over every storage engine.
///
/// Implementations persist a full [`StorageState`] document; entity
/// operations behave as read-modify-write against it and leave stored
/// state untouched when they fail.
#[async_trait]
pub trait StorageBackend<T: Entity>: Send + Sync {
    /// Prepares the storage location, creating it when missing.
    /// Repeated calls have no observable effect.
    async fn initialize(&self) -> StorageResult<()>;

    /// Loads the full state. Blank storage parses as the initial state;
    /// malformed content is a classified failure, never a panic.
    async fn read_state(&self) -> StorageResult<StorageState<T>>;

    /// Persists `state` exactly as given.
    async fn write_state(&self, state: &StorageState<T>) -> StorageResult<()>;

    /// Fetches one entity by id.
    async fn get_entity(&self, id: &str) -> StorageResult<Option<T>>;

    /// Fetches entities in insertion order, optionally narrowed by an
    /// equality filter.
    async fn get_entities(&self, filter: Option<&EntityFilter>) -> StorageResult<Vec<T>>;

    /// Adds a new entity. A duplicate id fails with `AlreadyExists`.
    async fn create_entity(&self, entity: T) -> StorageResult<T>;

    /// Replaces an existing entity. A missing id fails with `NotFound`.
    async fn update_entity(&self, entity: T) -> StorageResult<T>;

    /// Removes an entity. A missing id fails with `NotFound`.
    async fn delete_entity(&self, id: &str) -> StorageResult<()>;

    /// Human-readable location backing this store.
    fn storage_location(&self) -> String;

    /// Releases engine resources.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Validates a table name before it is interpolated into SQL.
pub(crate) fn validate_table_name(engine: StorageEngine, name: &str) -> StorageResult<()> {
    let head_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let tail_ok = name
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if head_ok && tail_ok {
        return Ok(());
    }
    Err(BackendError::new(
        StorageErrorKind::Schema,
        ErrorSeverity::High,
        false,
        engine,
        "configure",
        format!("invalid table name: {name:?}"),
    )
    .into())
}
