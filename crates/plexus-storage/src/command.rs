//! Storage commands.
//!
//! A command is the `message` payload of a storage-routed [`Message`]:
//!
//! ```json
//! {"service": "db1", "sql": "INSERT INTO t(v) VALUES('x')"}
//! {"service": "signal", "collection": "messages", "filter": {"field": "id", "query": "[A1 A2]"}}
//! ```
//!
//! The payload may arrive either as a JSON object or as a string holding
//! JSON; [`Command::from_payload`] accepts both.  Which backend path runs is
//! decided by the [`Verb`], never by which fields happen to be present.
//!
//! [`Message`]: plexus_kernel::Message

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// The storage verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Read journal entries.
    Journal,
    /// Execute a relational statement and journal its outcome.
    Store,
    /// Read journal entries once the `store` they reference has succeeded.
    JournalStore,
}

impl FromStr for Verb {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "journal" => Ok(Self::Journal),
            "store" => Ok(Self::Store),
            "journal-store" => Ok(Self::JournalStore),
            other => Err(StorageError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Journal => write!(f, "journal"),
            Self::Store => write!(f, "store"),
            Self::JournalStore => write!(f, "journal-store"),
        }
    }
}

/// Set-membership filter for document lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    /// Whitespace-separated values, optionally wrapped in brackets.
    pub query: String,
}

impl Filter {
    pub fn new(field: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            query: query.into(),
        }
    }

    /// The values to match, with bracket characters stripped.
    pub fn values(&self) -> Vec<String> {
        self.query
            .replace(['[', ']'], " ")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// A decoded storage command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl Command {
    /// Decode a message payload.  String payloads are parsed as JSON first.
    pub fn from_payload(payload: &Value) -> StorageResult<Self> {
        match payload {
            Value::String(raw) => Ok(serde_json::from_str(raw)?),
            other => Ok(Self::deserialize(other)?),
        }
    }

    /// The backend name, or [`StorageError::MissingService`].
    pub fn service(&self) -> StorageResult<&str> {
        if self.service.trim().is_empty() {
            return Err(StorageError::MissingService);
        }
        Ok(&self.service)
    }

    pub fn sql(&self) -> StorageResult<&str> {
        self.sql
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(StorageError::MissingSql)
    }

    pub fn collection(&self) -> StorageResult<&str> {
        self.collection
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(StorageError::MissingField("collection"))
    }

    pub fn filter(&self) -> StorageResult<&Filter> {
        self.filter
            .as_ref()
            .filter(|f| !f.field.is_empty())
            .ok_or(StorageError::MissingField("filter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verbs_parse() {
        assert_eq!("store".parse::<Verb>().unwrap(), Verb::Store);
        assert_eq!("journal-store".parse::<Verb>().unwrap(), Verb::JournalStore);
        let err = "purge".parse::<Verb>().unwrap_err();
        assert_eq!(err.to_string(), "unknown command (purge)");
    }

    #[test]
    fn filter_strips_brackets_and_splits() {
        let filter = Filter::new("id", "[A1  A2]\tA3");
        assert_eq!(filter.values(), vec!["A1", "A2", "A3"]);
        assert!(Filter::new("id", "[]").values().is_empty());
    }

    #[test]
    fn decodes_object_payload() {
        let cmd = Command::from_payload(&json!({
            "service": "db1",
            "sql": "INSERT INTO t(v) VALUES('x')"
        }))
        .unwrap();
        assert_eq!(cmd.service().unwrap(), "db1");
        assert!(cmd.sql().unwrap().starts_with("INSERT"));
        assert!(cmd.filter.is_none());
    }

    #[test]
    fn decodes_string_payload() {
        let raw = r#"{"service":"signal","collection":"messages","filter":{"field":"id","query":"A1"}}"#;
        let cmd = Command::from_payload(&Value::String(raw.into())).unwrap();
        assert_eq!(cmd.collection().unwrap(), "messages");
        assert_eq!(cmd.filter().unwrap().values(), vec!["A1"]);
    }

    #[test]
    fn malformed_payload_is_a_json_error() {
        let err = Command::from_payload(&Value::String("{oops".into())).unwrap_err();
        assert!(matches!(err, StorageError::Json(_)));
        let err = Command::from_payload(&json!(42)).unwrap_err();
        assert!(matches!(err, StorageError::Json(_)));
    }

    #[test]
    fn missing_fields_are_named() {
        let cmd = Command::default();
        assert!(matches!(cmd.service(), Err(StorageError::MissingService)));
        assert!(matches!(cmd.sql(), Err(StorageError::MissingSql)));
        assert!(matches!(
            cmd.collection(),
            Err(StorageError::MissingField("collection"))
        ));
    }
}
