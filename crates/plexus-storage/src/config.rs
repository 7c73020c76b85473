//! Storage configuration.
//!
//! [`StorageSettings`] is deserialized once at process start (it is the
//! `[storage]` table of the application config) and handed to
//! [`StorageEngine::builder`](crate::StorageEngine::builder).  Every field has
//! a default so an empty table is valid.
//!
//! Data sources come from two places: inline `[[storage.sources]]` entries and
//! `*.dbconfig` JSON files in `source_dir`.  Both use the same descriptor:
//!
//! ```json
//! {"name": "db1", "dialect": "postgres", "database": "billing",
//!  "user": "app", "password": "secret", "host": "10.0.0.5", "port": 5432}
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{StorageError, StorageResult};

// ---------------------------------------------------------------------------
// Dialects
// ---------------------------------------------------------------------------

/// The backend kind a data source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
    MongoDb,
    /// Document store embedded in a local SQLite file.
    Document,
}

impl Dialect {
    /// Resolve a dialect tag.  Returns `None` for unknown tags.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" => Some(Self::MySql),
            "mongodb" | "mongo" => Some(Self::MongoDb),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    pub fn is_relational(self) -> bool {
        matches!(self, Self::Sqlite | Self::Postgres | Self::MySql)
    }

    fn default_port(self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::MongoDb => Some(27017),
            Self::Sqlite | Self::Document => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Postgres => write!(f, "postgres"),
            Self::MySql => write!(f, "mysql"),
            Self::MongoDb => write!(f, "mongodb"),
            Self::Document => write!(f, "document"),
        }
    }
}

// ---------------------------------------------------------------------------
// Data sources
// ---------------------------------------------------------------------------

/// One backend descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub dialect: String,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl DataSourceConfig {
    /// The parsed dialect, or [`StorageError::UnsupportedDialect`].
    pub fn dialect(&self) -> StorageResult<Dialect> {
        Dialect::parse(&self.dialect).ok_or_else(|| StorageError::UnsupportedDialect {
            source_name: self.name.clone(),
            dialect: self.dialect.clone(),
        })
    }

    /// Connection string for this source.
    ///
    /// Network credentials are percent-encoded into the URL for relational
    /// dialects.  MongoDB credentials are passed separately at connect time,
    /// so its DSN only carries host and port.  The embedded document dialect
    /// returns the database file path as-is.
    pub fn dsn(&self) -> StorageResult<String> {
        let dialect = self.dialect()?;
        match dialect {
            Dialect::Sqlite => Ok(format!("sqlite://{}?mode=rwc", self.database)),
            Dialect::Document => Ok(self.database.clone()),
            Dialect::MongoDb => {
                let url = self.network_url("mongodb", dialect, false)?;
                Ok(url.to_string().trim_end_matches('/').to_string())
            }
            Dialect::Postgres => Ok(self.network_url("postgres", dialect, true)?.to_string()),
            Dialect::MySql => Ok(self.network_url("mysql", dialect, true)?.to_string()),
        }
    }

    fn network_url(&self, scheme: &str, dialect: Dialect, with_auth: bool) -> StorageResult<Url> {
        let host = self.host.as_deref().unwrap_or("localhost");
        let mut url =
            Url::parse(&format!("{scheme}://{host}")).map_err(|e| self.invalid(e))?;

        let port = self.port.or(dialect.default_port());
        url.set_port(port).map_err(|()| self.invalid("port not allowed"))?;

        if with_auth {
            if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
                url.set_username(user)
                    .map_err(|()| self.invalid("user not allowed"))?;
                url.set_password(self.password.as_deref())
                    .map_err(|()| self.invalid("password not allowed"))?;
            }
            url.set_path(&self.database);
        }
        Ok(url)
    }

    fn invalid(&self, reason: impl fmt::Display) -> StorageError {
        StorageError::InvalidSource {
            source_name: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Read every `*.dbconfig` descriptor in `dir`.
    ///
    /// Unreadable files and descriptors without a name are logged and
    /// skipped.  Results are sorted by name.
    pub fn load_dir(dir: impl AsRef<Path>) -> StorageResult<Vec<Self>> {
        let dir = dir.as_ref();
        let mut sources = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dbconfig") {
                continue;
            }

            let parsed = std::fs::read_to_string(&path)
                .map_err(StorageError::from)
                .and_then(|raw| serde_json::from_str::<Self>(&raw).map_err(StorageError::from));

            match parsed {
                Ok(source) if source.name.trim().is_empty() => {
                    error!(path = %path.display(), "name of connection can not be empty");
                }
                Ok(source) => {
                    debug!(path = %path.display(), source = %source.name, "data source loaded");
                    sources.push(source);
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to read data source");
                }
            }
        }

        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Where the journal lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// Name of the document data source holding the journal.
    pub source: String,
    pub database: String,
    pub collection: String,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            source: "signal".into(),
            database: "signal".into(),
            collection: "messages".into(),
        }
    }
}

/// Bounds applied to every relational connection pool.
///
/// Idle connections are bounded by `max_open` and closed after
/// `idle_timeout_secs` without use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 100,
            max_lifetime_secs: 3600,
            idle_timeout_secs: 600,
        }
    }
}

/// Storage engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Capacity of the engine's inbound message queue.
    pub inbound_capacity: usize,
    /// How long a `journal-store` read waits for its write.
    pub readiness_timeout_ms: u64,
    /// Readiness entries nobody waits on are dropped after this long.
    pub readiness_ttl_ms: u64,
    /// Route and command of result messages.
    pub reply_route: String,
    pub reply_command: String,
    pub journal: JournalSettings,
    pub pool: PoolSettings,
    pub sources: Vec<DataSourceConfig>,
    /// Directory scanned for `*.dbconfig` descriptors.
    pub source_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 256,
            readiness_timeout_ms: 30_000,
            readiness_ttl_ms: 600_000,
            reply_route: "server".into(),
            reply_command: "get".into(),
            journal: JournalSettings::default(),
            pool: PoolSettings::default(),
            sources: Vec::new(),
            source_dir: None,
        }
    }
}

impl StorageSettings {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn readiness_ttl(&self) -> Duration {
        Duration::from_millis(self.readiness_ttl_ms.max(1))
    }

    /// Inline sources merged with the ones found in `source_dir`.
    ///
    /// A descriptor from the directory replaces an inline one of the same
    /// name.
    pub fn resolve_sources(&self) -> StorageResult<Vec<DataSourceConfig>> {
        let mut by_name: HashMap<String, DataSourceConfig> = HashMap::new();
        for source in &self.sources {
            by_name.insert(source.name.clone(), source.clone());
        }
        if let Some(dir) = &self.source_dir {
            for source in DataSourceConfig::load_dir(dir)? {
                if by_name.contains_key(&source.name) {
                    warn!(source = %source.name, "data source overridden by {}", dir.display());
                }
                by_name.insert(source.name.clone(), source);
            }
        }
        let mut sources: Vec<_> = by_name.into_values().collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
