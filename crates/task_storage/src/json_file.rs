//! JSON file storage backend.
//!
//! State lives in a single document: the entity array under a
//! configurable top-level field plus a `metadata` object. Writes go to
//! a temp sibling first and are renamed into place, so a crash or a
//! failed serialization never clobbers the previous file.

use std::marker::PhantomData;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    classify_io, classify_json, Entity, EntityFilter, StateMetadata, StorageBackend, StorageEngine,
    StorageError, StorageResult, StorageState,
};

use async_trait::async_trait;

/// File-backed storage holding one JSON state document.
///
/// A process-local mutex serializes read-modify-write cycles; exclusion
/// across processes is the workspace lock's job.
pub struct JsonFileStorage<T: Entity> {
    file_path: PathBuf,
    entities_field: String,
    write_guard: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> JsonFileStorage<T> {
    /// Creates a backend over `file_path` with the default `tasks` field.
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            entities_field: "tasks".to_string(),
            write_guard: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Overrides the top-level field holding the entity array.
    pub fn with_entities_field(mut self, field: impl Into<String>) -> Self {
        self.entities_field = field.into();
        self
    }

    /// Path of the state file.
    pub fn file_path(&self) -> &std::path::Path {
        &self.file_path
    }

    fn initial_state(&self) -> StorageState<T> {
        StorageState::initial(self.file_path.display().to_string())
    }

    async fn load_state(&self) -> StorageResult<StorageState<T>> {
        let contents = tokio::fs::read_to_string(&self.file_path)
            .await
            .map_err(|e| classify_io(StorageEngine::Json, "read_state", e))?;
        if contents.trim().is_empty() {
            return Ok(self.initial_state());
        }
        self.parse_state(&contents)
    }

    fn parse_state(&self, contents: &str) -> StorageResult<StorageState<T>> {
        let doc: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| classify_json(StorageEngine::Json, "read_state", e))?;

        let entities = match doc.get(&self.entities_field) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| classify_json(StorageEngine::Json, "read_state", e))?,
            None => Vec::new(),
        };

        let metadata = match doc.get("metadata") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| classify_json(StorageEngine::Json, "read_state", e))?,
            None => StateMetadata::new(self.file_path.display().to_string()),
        };

        Ok(StorageState { entities, metadata })
    }

    /// Serializes `state` fully, then writes temp + rename.
    async fn store_state(&self, state: &StorageState<T>) -> StorageResult<()> {
        let body = self.render(state)?;

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| classify_io(StorageEngine::Json, "write_state", e))?;
            }
        }

        let tmp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, body)
            .await
            .map_err(|e| classify_io(StorageEngine::Json, "write_state", e))?;
        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .map_err(|e| classify_io(StorageEngine::Json, "write_state", e))?;
        Ok(())
    }

    fn render(&self, state: &StorageState<T>) -> StorageResult<String> {
        let entities = serde_json::to_value(&state.entities)?;
        let metadata = serde_json::to_value(&state.metadata)?;
        let mut doc = serde_json::Map::new();
        doc.insert(self.entities_field.clone(), entities);
        doc.insert("metadata".to_string(), metadata);
        Ok(serde_json::to_string_pretty(&serde_json::Value::Object(
            doc,
        ))?)
    }
}

#[async_trait]
impl<T: Entity> StorageBackend<T> for JsonFileStorage<T> {
    async fn initialize(&self) -> StorageResult<()> {
        let _guard = self.write_guard.lock().await;

        let fresh = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(contents) => contents.trim().is_empty(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(classify_io(StorageEngine::Json, "initialize", e).into()),
        };

        if fresh {
            debug!(path = %self.file_path.display(), "initializing state file");
            self.store_state(&self.initial_state()).await?;
        }
        Ok(())
    }

    async fn read_state(&self) -> StorageResult<StorageState<T>> {
        self.load_state().await
    }

    async fn write_state(&self, state: &StorageState<T>) -> StorageResult<()> {
        let _guard = self.write_guard.lock().await;
        self.store_state(state).await
    }

    async fn get_entity(&self, id: &str) -> StorageResult<Option<T>> {
        let state = self.load_state().await?;
        Ok(state.entities.into_iter().find(|e| e.id() == id))
    }

    async fn get_entities(&self, filter: Option<&EntityFilter>) -> StorageResult<Vec<T>> {
        let state = self.load_state().await?;
        Ok(match filter {
            Some(filter) => state
                .entities
                .into_iter()
                .filter(|e| filter.matches(e))
                .collect(),
            None => state.entities,
        })
    }

    async fn create_entity(&self, entity: T) -> StorageResult<T> {
        let _guard = self.write_guard.lock().await;
        let mut state = self.load_state().await?;
        if state.contains(entity.id()) {
            return Err(StorageError::already_exists(T::entity_type(), entity.id()));
        }
        state.entities.push(entity.clone());
        state.metadata.touch();
        self.store_state(&state).await?;
        Ok(entity)
    }

    async fn update_entity(&self, entity: T) -> StorageResult<T> {
        let _guard = self.write_guard.lock().await;
        let mut state = self.load_state().await?;
        match state.entities.iter_mut().find(|e| e.id() == entity.id()) {
            Some(slot) => *slot = entity.clone(),
            None => return Err(StorageError::not_found(T::entity_type(), entity.id())),
        }
        state.metadata.touch();
        self.store_state(&state).await?;
        Ok(entity)
    }

    async fn delete_entity(&self, id: &str) -> StorageResult<()> {
        let _guard = self.write_guard.lock().await;
        let mut state = self.load_state().await?;
        let before = state.entities.len();
        state.entities.retain(|e| e.id() != id);
        if state.entities.len() == before {
            return Err(StorageError::not_found(T::entity_type(), id));
        }
        state.metadata.touch();
        self.store_state(&state).await?;
        Ok(())
    }

    fn storage_location(&self) -> String {
        self.file_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorSeverity, StorageErrorKind};
    use entities::{TaskRecord, TaskStatus};
    use serde::{Deserialize, Serialize, Serializer};
    use tempfile::tempdir;

    fn storage_in(dir: &tempfile::TempDir) -> JsonFileStorage<TaskRecord> {
        JsonFileStorage::new(dir.path().join("tasks.json"))
    }

    #[tokio::test]
    async fn test_initialize_creates_empty_state() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);

        storage.initialize().await.unwrap();

        let state = storage.read_state().await.unwrap();
        assert!(state.entities.is_empty());
        assert_eq!(state.metadata.version, crate::STATE_VERSION);
        assert!(state.metadata.storage_location.ends_with("tasks.json"));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);

        storage.initialize().await.unwrap();
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();
        storage.initialize().await.unwrap();

        let state = storage.read_state().await.unwrap();
        assert_eq!(state.entities.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_file_reads_as_initial_state() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        std::fs::write(storage.file_path(), "  \n").unwrap();

        let state = storage.read_state().await.unwrap();
        assert!(state.entities.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_classified_resource_error() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);

        let error = storage.read_state().await.unwrap_err();
        match error {
            StorageError::Backend(e) => {
                assert_eq!(e.kind, StorageErrorKind::Resource);
                assert_eq!(e.severity, ErrorSeverity::Medium);
                assert!(!e.retryable);
            }
            other => panic!("expected backend error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_file_is_classified_corruption() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        std::fs::write(storage.file_path(), "{ definitely not json").unwrap();

        let error = storage.read_state().await.unwrap_err();
        match error {
            StorageError::Backend(e) => {
                assert_eq!(e.kind, StorageErrorKind::Corruption);
                assert_eq!(e.severity, ErrorSeverity::High);
                assert!(!e.retryable);
            }
            other => panic!("expected backend error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();

        let mut state = storage.read_state().await.unwrap();
        state.entities.push(TaskRecord::new("t-1", "First"));
        state
            .entities
            .push(TaskRecord::new("t-2", "Second").with_status(TaskStatus::InProgress));
        storage.write_state(&state).await.unwrap();

        let read_back = storage.read_state().await.unwrap();
        assert_eq!(read_back, state);
    }

    #[tokio::test]
    async fn test_wire_document_shape() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(storage.file_path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(doc["tasks"].is_array());
        assert!(doc["metadata"]["storageLocation"].is_string());
        assert!(doc["metadata"]["lastUpdated"].is_string());
        assert_eq!(doc["metadata"]["version"], 1);
    }

    #[tokio::test]
    async fn test_custom_entities_field() {
        let dir = tempdir().unwrap();
        let storage = JsonFileStorage::<TaskRecord>::new(dir.path().join("issues.json"))
            .with_entities_field("issues");
        storage.initialize().await.unwrap();
        storage
            .create_entity(TaskRecord::new("i-1", "Issue"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(storage.file_path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["issues"].as_array().unwrap().len(), 1);
        assert!(doc.get("tasks").is_none());
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();

        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();
        storage
            .create_entity(TaskRecord::new("t-2", "Second"))
            .await
            .unwrap();
        storage
            .create_entity(TaskRecord::new("t-3", "Third"))
            .await
            .unwrap();

        let all = storage.get_entities(None).await.unwrap();
        assert_eq!(
            all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            ["t-1", "t-2", "t-3"]
        );

        let updated = TaskRecord::new("t-2", "Second, renamed").with_status(TaskStatus::Done);
        storage.update_entity(updated).await.unwrap();
        let fetched = storage.get_entity("t-2").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Second, renamed");
        assert_eq!(fetched.status, TaskStatus::Done);

        storage.delete_entity("t-1").await.unwrap();
        assert!(storage.get_entity("t-1").await.unwrap().is_none());
        assert_eq!(storage.get_entities(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_filtered_queries() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();

        storage
            .create_entity(TaskRecord::new("t-1", "First").with_status(TaskStatus::InProgress))
            .await
            .unwrap();
        storage
            .create_entity(TaskRecord::new("t-2", "Second").with_status(TaskStatus::Done))
            .await
            .unwrap();
        storage
            .create_entity(TaskRecord::new("t-3", "Third").with_status(TaskStatus::InProgress))
            .await
            .unwrap();

        let filter = EntityFilter::new().field("status", "IN-PROGRESS");
        let in_progress = storage.get_entities(Some(&filter)).await.unwrap();
        assert_eq!(
            in_progress.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            ["t-1", "t-3"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();

        let before = std::fs::read_to_string(storage.file_path()).unwrap();
        let error = storage
            .create_entity(TaskRecord::new("t-1", "Impostor"))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::AlreadyExists { .. }));

        let after = std::fs::read_to_string(storage.file_path()).unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_missing_update_and_delete_leave_file_untouched() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();

        let before = std::fs::read_to_string(storage.file_path()).unwrap();

        let error = storage
            .update_entity(TaskRecord::new("ghost", "Ghost"))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::NotFound { .. }));

        let error = storage.delete_entity("ghost").await.unwrap_err();
        assert!(matches!(error, StorageError::NotFound { .. }));

        let after = std::fs::read_to_string(storage.file_path()).unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_mutations_advance_last_updated() {
        let dir = tempdir().unwrap();
        let storage = storage_in(&dir);
        storage.initialize().await.unwrap();

        let t0 = storage.read_state().await.unwrap().metadata.last_updated;
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();
        let t1 = storage.read_state().await.unwrap().metadata.last_updated;
        assert!(t1 > t0);

        storage
            .update_entity(TaskRecord::new("t-1", "Renamed"))
            .await
            .unwrap();
        let t2 = storage.read_state().await.unwrap().metadata.last_updated;
        assert!(t2 > t1);

        storage.delete_entity("t-1").await.unwrap();
        let t3 = storage.read_state().await.unwrap().metadata.last_updated;
        assert!(t3 > t2);
    }

    #[derive(Clone, Debug, Deserialize)]
    struct Grenade {
        id: String,
    }

    impl Serialize for Grenade {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing to serialize"))
        }
    }

    impl Entity for Grenade {
        fn id(&self) -> &str {
            &self.id
        }

        fn entity_type() -> &'static str {
            "grenade"
        }
    }

    #[tokio::test]
    async fn test_failed_serialization_leaves_previous_file_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grenades.json");
        let seed = r#"{
  "tasks": [{"id": "g-1"}],
  "metadata": {"version": 1, "storageLocation": "seed", "lastUpdated": "2026-01-01T00:00:00Z"}
}"#;
        std::fs::write(&path, seed).unwrap();

        let storage = JsonFileStorage::<Grenade>::new(&path);
        let state = storage.read_state().await.unwrap();
        assert_eq!(state.entities.len(), 1);

        let error = storage.write_state(&state).await.unwrap_err();
        assert!(matches!(error, StorageError::Serialization(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), seed);
    }
}
