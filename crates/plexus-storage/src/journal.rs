//! The journal: one document per processed command, keyed by message id.
//!
//! Entries are only ever inserted.  A successful command records its result
//! as `data`; a failed one records `{"error": "<text>"}`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::JournalSettings;
use crate::document::DocumentStore;
use crate::error::StorageResult;

/// A persisted command outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub data: Value,
}

impl JournalEntry {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn failure(id: impl Into<String>, err: impl fmt::Display) -> Self {
        Self {
            id: id.into(),
            data: json!({ "error": err.to_string() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.data.get("error").is_some()
    }
}

/// Writer bound to the configured journal location.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn DocumentStore>,
    database: String,
    collection: String,
}

impl Journal {
    pub fn new(store: Arc<dyn DocumentStore>, settings: &JournalSettings) -> Self {
        Self {
            store,
            database: settings.database.clone(),
            collection: settings.collection.clone(),
        }
    }

    pub async fn record(&self, entry: JournalEntry) -> StorageResult<()> {
        tracing::debug!(message_id = %entry.id, error = entry.is_error(), "journal entry");
        self.store
            .insert(&self.database, &self.collection, serde_json::to_value(entry)?)
            .await
    }

    /// Entries whose id is one of `ids`.
    pub async fn entries(&self, ids: &[String]) -> StorageResult<Vec<JournalEntry>> {
        self.store
            .find_in(&self.database, &self.collection, "id", ids)
            .await?
            .into_iter()
            .map(|doc| Ok(serde_json::from_value(doc)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::EmbeddedDocuments;

    #[test]
    fn entry_round_trips_through_json() {
        let entries = [
            JournalEntry::success("A1", json!({"rows_affected": 1, "last_insert_id": 7})),
            JournalEntry::success("A2", json!([{"v": "x"}])),
            JournalEntry::failure("A3", "no such table: t"),
        ];
        for entry in entries {
            let raw = serde_json::to_string(&entry).unwrap();
            let back: JournalEntry = serde_json::from_str(&raw).unwrap();
            assert_eq!(back, entry);
        }
    }

    #[test]
    fn failure_shape() {
        let entry = JournalEntry::failure("A1", "boom");
        assert!(entry.is_error());
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"id": "A1", "data": {"error": "boom"}})
        );
    }

    #[tokio::test]
    async fn record_then_read_back() {
        let store: Arc<dyn DocumentStore> = Arc::new(EmbeddedDocuments::in_memory().await.unwrap());
        let journal = Journal::new(store, &JournalSettings::default());

        journal
            .record(JournalEntry::success("A1", json!({"ok": true})))
            .await
            .unwrap();
        journal.record(JournalEntry::failure("B2", "nope")).await.unwrap();

        let found = journal.entries(&["B2".into()]).await.unwrap();
        assert_eq!(found, vec![JournalEntry::failure("B2", "nope")]);
    }
}
