//! Document-store backends.
//!
//! The journal and the `journal`/`journal-store` verbs only need two
//! operations from a document store: insert one JSON document, and find the
//! documents whose `field` is in a set of values.  [`DocumentStore`] is that
//! seam.  Two implementations exist:
//!
//! - [`MongoDocuments`] talks to a MongoDB deployment (`mongodb` dialect).
//! - [`EmbeddedDocuments`] keeps documents as JSON text in a local SQLite
//!   file (`document` dialect), for single-node setups and tests.
//!
//! Documents come back without the backend's internal `_id`.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::Client;
use mongodb::options::{ClientOptions, Credential};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::DataSourceConfig;
use crate::db::Database;
use crate::error::{StorageError, StorageResult};

/// Bounds the liveness check against an unreachable deployment.
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal document-store surface used by the storage engine.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every document in `database.collection` whose `field` equals one of
    /// `values`, in insertion order where the backend keeps one.
    async fn find_in(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StorageResult<Vec<Value>>;

    /// Append one JSON object.
    async fn insert(&self, database: &str, collection: &str, document: Value) -> StorageResult<()>;

    /// Round-trip to the backend.
    async fn ping(&self) -> StorageResult<()>;

    /// Release the underlying connection.
    async fn close(&self) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// MongoDB
// ---------------------------------------------------------------------------

/// MongoDB-backed document store.
#[derive(Clone)]
pub struct MongoDocuments {
    client: Client,
    /// Database used for the liveness check.
    database: String,
}

impl MongoDocuments {
    /// Connect using `source`'s host, port and credentials, then ping.
    pub async fn connect(source: &DataSourceConfig) -> StorageResult<Self> {
        let mut options = ClientOptions::parse(source.dsn()?).await?;
        options.app_name = Some("plexus".into());
        options
            .server_selection_timeout
            .get_or_insert(SERVER_SELECTION_TIMEOUT);
        if let Some(user) = source.user.as_deref().filter(|u| !u.is_empty()) {
            let mut credential = Credential::default();
            credential.username = Some(user.to_string());
            credential.password = source.password.clone();
            options.credential = Some(credential);
        }

        let store = Self {
            client: Client::with_options(options)?,
            database: source.database.clone(),
        };
        store.ping().await?;
        info!(source = %source.name, "mongodb connected");
        Ok(store)
    }
}

#[async_trait]
impl DocumentStore for MongoDocuments {
    async fn find_in(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StorageResult<Vec<Value>> {
        let mut filter = Document::new();
        filter.insert(field, doc! { "$in": values.to_vec() });
        let cursor = self
            .client
            .database(database)
            .collection::<Document>(collection)
            .find(filter)
            .await?;
        let found: Vec<Document> = cursor.try_collect().await?;

        Ok(found
            .into_iter()
            .map(|mut d| {
                d.remove("_id");
                Bson::Document(d).into_relaxed_extjson()
            })
            .collect())
    }

    async fn insert(&self, database: &str, collection: &str, document: Value) -> StorageResult<()> {
        let document = bson::to_document(&document)?;
        self.client
            .database(database)
            .collection::<Document>(collection)
            .insert_one(document)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Embedded
// ---------------------------------------------------------------------------

/// Document store kept in a local SQLite file.
///
/// Bodies are stored as JSON text and matched with `json_extract`, so any
/// top-level field can be filtered on.
#[derive(Clone)]
pub struct EmbeddedDocuments {
    db: Database,
}

impl EmbeddedDocuments {
    /// Open (or create) the file at `source.database` and migrate it.
    pub async fn open(source: &DataSourceConfig) -> StorageResult<Self> {
        let db = Database::open_and_migrate(source.dsn()?).await?;
        info!(source = %source.name, path = %source.database, "embedded document store opened");
        Ok(Self { db })
    }

    pub async fn in_memory() -> StorageResult<Self> {
        let db = Database::open_in_memory()?;
        db.execute(|conn| crate::migration::run_all(conn)).await?;
        Ok(Self { db })
    }
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

#[async_trait]
impl DocumentStore for EmbeddedDocuments {
    async fn find_in(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        values: &[String],
    ) -> StorageResult<Vec<Value>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..values.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT body FROM documents \
             WHERE database = ?1 AND collection = ?2 AND json_extract(body, ?3) IN ({placeholders}) \
             ORDER BY id"
        );

        let mut params = vec![database.to_string(), collection.to_string(), json_path(field)];
        params.extend(values.iter().cloned());
        debug!(collection, field, values = values.len(), "embedded find");

        let bodies: Vec<String> = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    async fn insert(&self, database: &str, collection: &str, document: Value) -> StorageResult<()> {
        let body = serde_json::to_string(&document)?;
        let database = database.to_string();
        let collection = collection.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO documents (database, collection, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![database, collection, body, chrono::Utc::now().timestamp()],
                )?;
                Ok(())
            })
            .await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.db
            .execute(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await
            .map(|_| ())
    }

    async fn close(&self) -> StorageResult<()> {
        // The connection closes when the last handle drops; flush the WAL now.
        self.db
            .execute(|conn| Ok(conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?))
            .await
    }
}
