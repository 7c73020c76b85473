//! # plexus-storage
//!
//! Storage engine component for plexus.
//!
//! The engine attaches to the kernel like any other component, takes every
//! message routed to `storage`, and executes it against one of its named
//! backends.  Every outcome, success or failure, is appended to a journal
//! keyed by the message id.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  StorageEngine (Component, route "storage")          │
//! │    write() ──> inbound queue ──> router loop         │
//! ├──────────────────────────────────────────────────────┤
//! │  journal        ──> DocumentStore::find_in           │
//! │  store          ──> RelationalStore::execute (tx)    │
//! │  journal-store  ──> ReadinessMap wait ──> find_in    │
//! ├──────────────────────────────────────────────────────┤
//! │  RelationalStore  (sqlx Any: sqlite/postgres/mysql)  │
//! │  DocumentStore    (mongodb | embedded rusqlite)      │
//! │  Journal          ({id, data} in signal.messages)    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use plexus_storage::{ConnectTo, StorageEngine, StorageSettings};
//!
//! let module = StorageEngine::builder(bus.clone(), StorageSettings::default())
//!     .option(ConnectTo::new(sources))
//!     .build()
//!     .await;
//! ```

pub mod command;
pub mod config;
pub mod db;
pub mod document;
pub mod engine;
pub mod error;
pub mod journal;
pub mod migration;
pub mod readiness;
pub mod relational;

// ── re-exports ───────────────────────────────────────────────────────

pub use command::{Command, Filter, Verb};
pub use config::{DataSourceConfig, Dialect, JournalSettings, PoolSettings, StorageSettings};
pub use db::Database;
pub use document::{DocumentStore, EmbeddedDocuments, MongoDocuments};
pub use engine::{ConnectTo, NAME, ROUTE, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use journal::{Journal, JournalEntry};
pub use readiness::ReadinessMap;
pub use relational::RelationalStore;
