//! SQLite key/value store.
//!
//! One table, `config_items`, keyed by `(pk, sk)` with an index on
//! `config_type` standing in for the secondary index. SQLite has no replicas,
//! so every read is already consistent and the `consistent` flag is ignored.

use async_trait::async_trait;
use adcp_core::config::{ConfigType, SourceTier};
use adcp_core::error::StoreError;
use adcp_core::store::{KeyValueStore, StoreItem};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteKvStore {
    pool: SqlitePool,
}

fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable {
                tier: SourceTier::KeyValue,
                reason: format!("{context}: {e}"),
            }
        }
        other => StoreError::TransientIo {
            tier: SourceTier::KeyValue,
            reason: format!("{context}: {other}"),
        },
    }
}

impl SqliteKvStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable {
                tier: SourceTier::KeyValue,
                reason: format!("Invalid SQLite path: {e}"),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Each in-memory connection is its own database
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to open SQLite", e))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(path = %path, "SQLite config store initialized");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config_items (
                pk           TEXT NOT NULL,
                sk           TEXT NOT NULL,
                config_type  TEXT NOT NULL,
                agent_name   TEXT,
                template_id  TEXT,
                content      TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (pk, sk)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("config_items table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_config_items_type ON config_items(config_type)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("config_type index", e))?;

        debug!("SQLite config migrations complete");
        Ok(())
    }

    fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<StoreItem, StoreError> {
        let column = |name: &str, e: sqlx::Error| StoreError::Malformed {
            tier: SourceTier::KeyValue,
            key: name.to_string(),
            reason: e.to_string(),
        };

        let pk: String = row.try_get("pk").map_err(|e| column("pk", e))?;
        let sk: String = row.try_get("sk").map_err(|e| column("sk", e))?;
        let config_type: String = row
            .try_get("config_type")
            .map_err(|e| column("config_type", e))?;
        let agent_name: Option<String> = row
            .try_get("agent_name")
            .map_err(|e| column("agent_name", e))?;
        let template_id: Option<String> = row
            .try_get("template_id")
            .map_err(|e| column("template_id", e))?;
        let content: String = row.try_get("content").map_err(|e| column("content", e))?;
        let updated_at: String = row
            .try_get("updated_at")
            .map_err(|e| column("updated_at", e))?;

        let config_type = ConfigType::parse(&config_type).ok_or_else(|| StoreError::Malformed {
            tier: SourceTier::KeyValue,
            key: format!("{pk}/{sk}"),
            reason: format!("unknown config_type '{config_type}'"),
        })?;

        let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(StoreItem {
            pk,
            sk,
            config_type,
            agent_name,
            template_id,
            content,
            updated_at,
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_item(
        &self,
        pk: &str,
        sk: &str,
        _consistent: bool,
    ) -> Result<Option<StoreItem>, StoreError> {
        let row = sqlx::query("SELECT * FROM config_items WHERE pk = ?1 AND sk = ?2")
            .bind(pk)
            .bind(sk)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("SELECT item", e))?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn put_item(&self, item: StoreItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config_items (pk, sk, config_type, agent_name, template_id, content, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(pk, sk) DO UPDATE SET
                config_type = excluded.config_type,
                agent_name = excluded.agent_name,
                template_id = excluded.template_id,
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.pk)
        .bind(&item.sk)
        .bind(item.config_type.as_str())
        .bind(&item.agent_name)
        .bind(&item.template_id)
        .bind(&item.content)
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("INSERT item", e))?;

        debug!(pk = %item.pk, sk = %item.sk, "Stored config item");
        Ok(())
    }

    async fn delete_item(&self, pk: &str, sk: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM config_items WHERE pk = ?1 AND sk = ?2")
            .bind(pk)
            .bind(sk)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("DELETE item", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_partition(&self, pk: &str) -> Result<Vec<StoreItem>, StoreError> {
        let rows = sqlx::query("SELECT * FROM config_items WHERE pk = ?1 ORDER BY sk")
            .bind(pk)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("SELECT partition", e))?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn query_by_type(&self, config_type: ConfigType) -> Result<Vec<StoreItem>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM config_items WHERE config_type = ?1 ORDER BY pk, sk")
                .bind(config_type.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("SELECT by type", e))?;
        rows.iter().map(Self::row_to_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcp_core::config::ConfigKey;

    async fn temp_store() -> (tempfile::TempDir, SqliteKvStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.db");
        let store = SqliteKvStore::new(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_roundtrip_keeps_attributes() {
        let (_dir, store) = temp_store().await;
        let key = ConfigKey::visualization_template("AgentX", "bar-chart");
        store
            .put_item(StoreItem::for_key(&key, r#"{"type":"bar"}"#).unwrap())
            .await
            .unwrap();

        let item = store
            .get_item("VIZ_TEMPLATE#AgentX", "bar-chart", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.config_type, ConfigType::VisualizationTemplate);
        assert_eq!(item.agent_name.as_deref(), Some("AgentX"));
        assert_eq!(item.template_id.as_deref(), Some("bar-chart"));
        assert_eq!(item.config_key(), key);
    }

    #[tokio::test]
    async fn put_overwrites_existing_item() {
        let (_dir, store) = temp_store().await;
        let key = ConfigKey::instruction("AgentX");
        store.put_item(StoreItem::for_key(&key, "v1 text").unwrap()).await.unwrap();
        store.put_item(StoreItem::for_key(&key, "v2 text").unwrap()).await.unwrap();

        let item = store.get_item("INSTRUCTION#AgentX", "v1", false).await.unwrap();
        assert_eq!(item.unwrap().content, "v2 text");
    }

    #[tokio::test]
    async fn missing_item_is_none() {
        let (_dir, store) = temp_store().await;
        assert!(store.get_item("INSTRUCTION#Nope", "v1", true).await.unwrap().is_none());
        assert!(!store.delete_item("INSTRUCTION#Nope", "v1").await.unwrap());
    }

    #[tokio::test]
    async fn type_index_and_partition_queries() {
        let (_dir, store) = temp_store().await;
        for key in [
            ConfigKey::instruction("A"),
            ConfigKey::instruction("B"),
            ConfigKey::visualization_template("A", "t1"),
            ConfigKey::visualization_template("A", "t2"),
        ] {
            store.put_item(StoreItem::for_key(&key, "x").unwrap()).await.unwrap();
        }

        let instructions = store.query_by_type(ConfigType::Instruction).await.unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].pk, "INSTRUCTION#A");

        let templates = store.query_partition("VIZ_TEMPLATE#A").await.unwrap();
        let sks: Vec<_> = templates.iter().map(|i| i.sk.as_str()).collect();
        assert_eq!(sks, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn in_memory_database_works() {
        let store = SqliteKvStore::new("sqlite::memory:").await.unwrap();
        store
            .put_item(StoreItem::for_key(&ConfigKey::global(), "{}").unwrap())
            .await
            .unwrap();
        assert!(store.get_item("GLOBAL_CONFIG", "v1", true).await.unwrap().is_some());
    }
}
