//! SQLite storage backend.
//!
//! Entities are stored as JSON documents in a two-table layout: the
//! entity table (`id`, `data`, `position`) and a one-row `<table>_state`
//! table carrying the document metadata. Insertion order is preserved
//! through `position`.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::backend::validate_table_name;
use crate::{
    classify_json, classify_sqlx, Entity, EntityFilter, StateMetadata, StorageBackend,
    StorageConfig, StorageEngine, StorageError, StorageResult, StorageState,
};

/// SQLite-backed storage holding one JSON state document per table pair.
#[derive(Debug)]
pub struct SqliteStorage<T: Entity> {
    pool: SqlitePool,
    db_path: PathBuf,
    table: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> SqliteStorage<T> {
    /// Opens (creating when missing) the database from `config` with the
    /// default `tasks` table.
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        Self::connect_with_table(config, "tasks").await
    }

    /// Opens the database with a custom entity table name.
    pub async fn connect_with_table(config: &StorageConfig, table: &str) -> StorageResult<Self> {
        validate_table_name(StorageEngine::Sqlite, table)?;

        let db_path = config.resolved_db_path();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| crate::classify_io(StorageEngine::Sqlite, "connect", e))?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "connect", e))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .connect_with(options)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "connect", e))?;

        debug!(path = %db_path.display(), table, "opened sqlite storage");
        Ok(Self {
            pool,
            db_path,
            table: table.to_string(),
            _marker: PhantomData,
        })
    }

    /// Connection pool, used by health checks for engine diagnostics.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_metadata<'a, E>(&self, executor: E) -> StorageResult<StateMetadata>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT version, storage_location, last_updated FROM {}_state WHERE id = 1",
            self.table
        );
        let row: Option<(i64, String, String)> = sqlx::query_as(&sql)
            .fetch_optional(executor)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "read_state", e))?;

        Ok(match row {
            Some((version, storage_location, last_updated)) => StateMetadata {
                version: version as u32,
                storage_location,
                last_updated: chrono::DateTime::parse_from_rfc3339(&last_updated)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
            },
            None => StateMetadata::new(self.storage_location()),
        })
    }

    async fn write_metadata<'a, E>(&self, executor: E, metadata: &StateMetadata) -> StorageResult<()>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        let sql = format!(
            "INSERT INTO {table}_state (id, version, storage_location, last_updated) \
             VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET version = excluded.version, \
             storage_location = excluded.storage_location, last_updated = excluded.last_updated",
            table = self.table
        );
        sqlx::query(&sql)
            .bind(metadata.version as i64)
            .bind(&metadata.storage_location)
            .bind(metadata.last_updated.to_rfc3339())
            .execute(executor)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "write_state", e))?;
        Ok(())
    }

    async fn touch_metadata(&self, tx: &mut Transaction<'_, Sqlite>) -> StorageResult<()> {
        let mut metadata = self.fetch_metadata(&mut **tx).await?;
        metadata.touch();
        self.write_metadata(&mut **tx, &metadata).await
    }

    async fn begin(&self, operation: &str) -> StorageResult<Transaction<'_, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, operation, e))
            .map_err(StorageError::from)
    }
}

#[async_trait]
impl<T: Entity> StorageBackend<T> for SqliteStorage<T> {
    async fn initialize(&self) -> StorageResult<()> {
        let entity_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id TEXT PRIMARY KEY, \
             data TEXT NOT NULL, \
             position INTEGER NOT NULL)",
            self.table
        );
        let state_table = format!(
            "CREATE TABLE IF NOT EXISTS {}_state (\
             id INTEGER PRIMARY KEY CHECK (id = 1), \
             version INTEGER NOT NULL, \
             storage_location TEXT NOT NULL, \
             last_updated TEXT NOT NULL)",
            self.table
        );
        for sql in [&entity_table, &state_table] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "initialize", e))?;
        }

        let metadata = StateMetadata::new(self.storage_location());
        let seed = format!(
            "INSERT OR IGNORE INTO {}_state (id, version, storage_location, last_updated) \
             VALUES (1, ?, ?, ?)",
            self.table
        );
        sqlx::query(&seed)
            .bind(metadata.version as i64)
            .bind(&metadata.storage_location)
            .bind(metadata.last_updated.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "initialize", e))?;
        Ok(())
    }

    async fn read_state(&self) -> StorageResult<StorageState<T>> {
        let sql = format!("SELECT data FROM {} ORDER BY position", self.table);
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "read_state", e))?;

        let mut entities = Vec::with_capacity(rows.len());
        for (data,) in rows {
            entities.push(
                serde_json::from_str(&data)
                    .map_err(|e| classify_json(StorageEngine::Sqlite, "read_state", e))?,
            );
        }

        let metadata = self.fetch_metadata(&self.pool).await?;
        Ok(StorageState { entities, metadata })
    }

    async fn write_state(&self, state: &StorageState<T>) -> StorageResult<()> {
        // Serialize every entity before touching the database.
        let mut rows = Vec::with_capacity(state.entities.len());
        for entity in &state.entities {
            rows.push((entity.id().to_string(), serde_json::to_string(entity)?));
        }

        let mut tx = self.begin("write_state").await?;
        let clear = format!("DELETE FROM {}", self.table);
        sqlx::query(&clear)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "write_state", e))?;

        let insert = format!(
            "INSERT INTO {} (id, data, position) VALUES (?, ?, ?)",
            self.table
        );
        for (position, (id, data)) in rows.iter().enumerate() {
            sqlx::query(&insert)
                .bind(id)
                .bind(data)
                .bind(position as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "write_state", e))?;
        }

        self.write_metadata(&mut *tx, &state.metadata).await?;
        tx.commit()
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "write_state", e))?;
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> StorageResult<Option<T>> {
        let sql = format!("SELECT data FROM {} WHERE id = ?", self.table);
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "get_entity", e))?;

        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data).map_err(|e| {
                classify_json(StorageEngine::Sqlite, "get_entity", e)
            })?)),
            None => Ok(None),
        }
    }

    async fn get_entities(&self, filter: Option<&EntityFilter>) -> StorageResult<Vec<T>> {
        let state: StorageState<T> = self.read_state().await?;
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
        let data = serde_json::to_string(&entity)?;

        let mut tx = self.begin("create_entity").await?;
        let insert = format!(
            "INSERT OR IGNORE INTO {table} (id, data, position) \
             SELECT ?, ?, COALESCE(MAX(position) + 1, 0) FROM {table}",
            table = self.table
        );
        let result = sqlx::query(&insert)
            .bind(entity.id())
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "create_entity", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::already_exists(T::entity_type(), entity.id()));
        }

        self.touch_metadata(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "create_entity", e))?;
        Ok(entity)
    }

    async fn update_entity(&self, entity: T) -> StorageResult<T> {
        let data = serde_json::to_string(&entity)?;

        let mut tx = self.begin("update_entity").await?;
        let update = format!("UPDATE {} SET data = ? WHERE id = ?", self.table);
        let result = sqlx::query(&update)
            .bind(&data)
            .bind(entity.id())
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "update_entity", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(T::entity_type(), entity.id()));
        }

        self.touch_metadata(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "update_entity", e))?;
        Ok(entity)
    }

    async fn delete_entity(&self, id: &str) -> StorageResult<()> {
        let mut tx = self.begin("delete_entity").await?;
        let delete = format!("DELETE FROM {} WHERE id = ?", self.table);
        let result = sqlx::query(&delete)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "delete_entity", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(T::entity_type(), id));
        }

        self.touch_metadata(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| classify_sqlx(StorageEngine::Sqlite, "delete_entity", e))?;
        Ok(())
    }

    fn storage_location(&self) -> String {
        self.db_path.display().to_string()
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageErrorKind;
    use entities::{TaskRecord, TaskStatus};
    use tempfile::tempdir;

    fn config_in(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig {
            engine: StorageEngine::Sqlite,
            db_path: Some(dir.path().join("tasks.db")),
            ..StorageConfig::default()
        }
    }

    async fn open(dir: &tempfile::TempDir) -> SqliteStorage<TaskRecord> {
        let storage = SqliteStorage::connect(&config_in(dir)).await.unwrap();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;

        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();
        storage.initialize().await.unwrap();

        let state = storage.read_state().await.unwrap();
        assert_eq!(state.entities.len(), 1);
        assert_eq!(state.metadata.version, crate::STATE_VERSION);
    }

    #[tokio::test]
    async fn test_read_before_initialize_is_classified() {
        let dir = tempdir().unwrap();
        let storage: SqliteStorage<TaskRecord> =
            SqliteStorage::connect(&config_in(&dir)).await.unwrap();

        let error = storage.read_state().await.unwrap_err();
        assert_eq!(error.kind(), Some(StorageErrorKind::Schema));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_crud_cycle_preserves_order() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;

        for (id, title) in [("t-1", "First"), ("t-2", "Second"), ("t-3", "Third")] {
            storage
                .create_entity(TaskRecord::new(id, title))
                .await
                .unwrap();
        }

        let all = storage.get_entities(None).await.unwrap();
        assert_eq!(
            all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            ["t-1", "t-2", "t-3"]
        );

        storage
            .update_entity(TaskRecord::new("t-2", "Second, renamed").with_status(TaskStatus::Done))
            .await
            .unwrap();
        let fetched = storage.get_entity("t-2").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Second, renamed");

        storage.delete_entity("t-3").await.unwrap();
        assert!(storage.get_entity("t-3").await.unwrap().is_none());
        assert_eq!(storage.get_entities(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;

        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();
        let error = storage
            .create_entity(TaskRecord::new("t-1", "Impostor"))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::AlreadyExists { .. }));

        let kept = storage.get_entity("t-1").await.unwrap().unwrap();
        assert_eq!(kept.title, "First");
    }

    #[tokio::test]
    async fn test_missing_update_and_delete_leave_state_unchanged() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();

        let before = storage.read_state().await.unwrap();

        let error = storage
            .update_entity(TaskRecord::new("ghost", "Ghost"))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::NotFound { .. }));
        let error = storage.delete_entity("ghost").await.unwrap_err();
        assert!(matches!(error, StorageError::NotFound { .. }));

        let after = storage.read_state().await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_write_state_replaces_document() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;
        storage
            .create_entity(TaskRecord::new("old-1", "Old"))
            .await
            .unwrap();

        let mut state = storage.read_state().await.unwrap();
        state.entities = vec![
            TaskRecord::new("new-1", "New first"),
            TaskRecord::new("new-2", "New second"),
        ];
        storage.write_state(&state).await.unwrap();

        let read_back = storage.read_state().await.unwrap();
        assert_eq!(read_back, state);
        assert!(storage.get_entity("old-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutations_advance_last_updated() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;

        let t0 = storage.read_state().await.unwrap().metadata.last_updated;
        storage
            .create_entity(TaskRecord::new("t-1", "First"))
            .await
            .unwrap();
        let t1 = storage.read_state().await.unwrap().metadata.last_updated;
        assert!(t1 > t0);

        storage.delete_entity("t-1").await.unwrap();
        let t2 = storage.read_state().await.unwrap().metadata.last_updated;
        assert!(t2 > t1);
    }

    #[tokio::test]
    async fn test_filtered_queries() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;

        storage
            .create_entity(TaskRecord::new("t-1", "First").with_status(TaskStatus::InProgress))
            .await
            .unwrap();
        storage
            .create_entity(TaskRecord::new("t-2", "Second").with_status(TaskStatus::Done))
            .await
            .unwrap();

        let filter = EntityFilter::new().field("status", "DONE");
        let done = storage.get_entities(Some(&filter)).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "t-2");
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_rejected() {
        let dir = tempdir().unwrap();
        let error = SqliteStorage::<TaskRecord>::connect_with_table(
            &config_in(&dir),
            "tasks; DROP TABLE tasks",
        )
        .await
        .unwrap_err();
        assert_eq!(error.kind(), Some(StorageErrorKind::Schema));
    }

    #[tokio::test]
    async fn test_storage_location_is_db_path() {
        let dir = tempdir().unwrap();
        let storage = open(&dir).await;
        assert!(storage.storage_location().ends_with("tasks.db"));
        storage.close().await.unwrap();
    }
}
