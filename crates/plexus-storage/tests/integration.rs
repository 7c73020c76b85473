//! Integration tests for the plexus-storage crate.
//!
//! Each test runs a real kernel with the storage engine attached, backed by
//! an on-disk SQLite database (`db1`) and an embedded document store
//! (`signal`) holding the journal.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use plexus_kernel::{
    Component, ComponentModule, Kernel, Lifecycle, Message, Notice, Severity, SignalBus, Signals,
};
use plexus_storage::{DataSourceConfig, JournalEntry, StorageEngine, StorageSettings};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::broadcast;

// ═══════════════════════════════════════════════════════════════════════
//  Fixture
// ═══════════════════════════════════════════════════════════════════════

struct Fixture {
    _dir: TempDir,
    db1_path: String,
    bus: SignalBus,
    engine: Arc<StorageEngine>,
    replies: Signals,
    notices: broadcast::Receiver<Notice>,
}

fn source(name: &str, dialect: &str, database: &str) -> DataSourceConfig {
    DataSourceConfig {
        name: name.into(),
        dialect: dialect.into(),
        database: database.into(),
        user: None,
        password: None,
        host: None,
        port: None,
    }
}

fn path_string(dir: &Path, file: &str) -> String {
    dir.join(file).display().to_string()
}

async fn start(settings: StorageSettings) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db1_path = path_string(dir.path(), "db1.sqlite");
    rusqlite::Connection::open(&db1_path)
        .unwrap()
        .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL);")
        .unwrap();

    let bus = SignalBus::new(256);
    let notices = bus.subscribe_notices();
    let replies = bus.generate();

    let engine = Arc::new(StorageEngine::new(bus.clone(), settings));
    engine
        .connect(&source("db1", "sqlite", &db1_path))
        .await
        .unwrap();
    engine
        .connect(&source("signal", "document", &path_string(dir.path(), "signal.db")))
        .await
        .unwrap();

    let module = ComponentModule::enabled(Arc::clone(&engine) as Arc<dyn Component>, bus.clone());
    let kernel = Arc::new(Kernel::new(bus.clone(), vec![module]));

    let baseline = bus.subscriber_count();
    let k = Arc::clone(&kernel);
    tokio::spawn(async move { k.run().await });
    for _ in 0..200 {
        if bus.subscriber_count() > baseline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    Fixture {
        _dir: dir,
        db1_path,
        bus,
        engine,
        replies,
        notices,
    }
}

impl Fixture {
    fn send(&self, id: &str, command: &str, data: Value) {
        self.bus.send(Message::reply(id, "storage", command, data));
    }

    /// Next message on the reply route carrying `id`.
    async fn reply(&mut self, id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let signal = tokio::time::timeout(remaining, self.replies.next())
                .await
                .expect("timed out waiting for reply")
                .expect("bus closed");
            let message = signal.message();
            if message.route() == "server" && message.id() == id {
                assert_eq!(message.command(), "get");
                return message.data().clone();
            }
        }
    }

    /// Journal entries for `id`, once at least `count` exist.
    async fn journal(&self, id: &str, count: usize) -> Vec<JournalEntry> {
        let journal = self.engine.journal().unwrap();
        for _ in 0..200 {
            let entries = journal.entries(&[id.to_string()]).await.unwrap();
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("journal never reached {count} entries for {id}");
    }

    async fn error(&mut self, needle: &str) -> Notice {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let notice = tokio::time::timeout(remaining, self.notices.recv())
                .await
                .expect("timed out waiting for error notice")
                .expect("notice stream closed");
            if notice.severity == Severity::Error && notice.text.contains(needle) {
                return notice;
            }
        }
    }

    fn row_count(&self) -> i64 {
        rusqlite::Connection::open(&self.db1_path)
            .unwrap()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }
}

fn journal_lookup(query: &str) -> Value {
    json!({
        "service": "signal",
        "collection": "messages",
        "filter": {"field": "id", "query": query}
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Write-then-read
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn store_then_journal_store_returns_the_written_entry() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('x')"}),
    );
    fx.send("B1", "journal-store", journal_lookup("A1"));

    let reply = fx.reply("B1").await;
    assert_eq!(
        reply,
        json!([{"id": "A1", "data": {"rows_affected": 1, "last_insert_id": 1}}])
    );
    assert_eq!(fx.row_count(), 1);
    assert!(!fx.engine.readiness().contains("A1"));
}

#[tokio::test]
async fn journal_store_sent_first_still_waits_for_the_write() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send("B1", "journal-store", journal_lookup("[A1]"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('late')"}),
    );

    let reply = fx.reply("B1").await;
    assert_eq!(reply[0]["id"], "A1");
    assert_eq!(fx.row_count(), 1);
}

#[tokio::test]
async fn select_results_are_journaled_as_rows() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('x')"}),
    );
    fx.journal("A1", 1).await;
    fx.send(
        "A2",
        "store",
        json!({"service": "db1", "sql": "SELECT id, v FROM t"}),
    );
    fx.send("B2", "journal-store", journal_lookup("A2"));

    let reply = fx.reply("B2").await;
    assert_eq!(reply[0]["data"], json!([{"id": 1, "v": "x"}]));
}

#[tokio::test]
async fn unfulfilled_journal_store_times_out_with_error_reply() {
    let settings = StorageSettings {
        readiness_timeout_ms: 100,
        ..StorageSettings::default()
    };
    let mut fx = start(settings).await;

    fx.send("B1", "journal-store", journal_lookup("never"));

    let reply = fx.reply("B1").await;
    let text = reply["error"].as_str().unwrap();
    assert!(text.starts_with("stored:never not found"), "{text}");

    fx.error("stored:never").await;
    let entries = fx.journal("B1", 1).await;
    assert!(entries[0].is_error());
    assert!(fx.engine.readiness().is_empty());
}

#[tokio::test]
async fn second_reader_keeps_waiting_after_first_times_out() {
    let settings = StorageSettings {
        readiness_timeout_ms: 300,
        ..StorageSettings::default()
    };
    let mut fx = start(settings).await;

    fx.send("B1", "journal-store", journal_lookup("A9"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second_sent = tokio::time::Instant::now();
    fx.send("B2", "journal-store", journal_lookup("A9"));

    let first = fx.reply("B1").await;
    assert!(first["error"].as_str().unwrap().starts_with("stored:A9 not found"));

    let second = fx.reply("B2").await;
    assert!(
        second["error"].as_str().unwrap().starts_with("stored:A9 not found"),
        "{second}"
    );
    assert!(second_sent.elapsed() >= Duration::from_millis(250));
    assert_eq!(fx.journal("B2", 1).await.len(), 1);
    assert!(fx.engine.readiness().is_empty());
}

#[tokio::test]
async fn every_waiting_reader_is_released_by_one_store() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send("B1", "journal-store", journal_lookup("A1"));
    fx.send("B2", "journal-store", journal_lookup("A1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('x')"}),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut released = Vec::new();
    while released.len() < 2 {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let signal = tokio::time::timeout(remaining, fx.replies.next())
            .await
            .expect("timed out waiting for replies")
            .expect("bus closed");
        let message = signal.message();
        if message.route() == "server" {
            assert_eq!(message.data()[0]["id"], "A1");
            released.push(message.id().to_string());
        }
    }
    released.sort();
    assert_eq!(released, ["B1", "B2"]);
}

#[tokio::test]
async fn unread_ready_entries_are_swept() {
    let settings = StorageSettings {
        readiness_ttl_ms: 100,
        ..StorageSettings::default()
    };
    let fx = start(settings).await;

    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('x')"}),
    );
    fx.journal("A1", 1).await;

    for _ in 0..100 {
        if !fx.engine.readiness().contains("A1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!fx.engine.readiness().contains("A1"));
    assert_eq!(fx.row_count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failed_store_rolls_back_and_journals_one_error() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(id, v) VALUES (1, 'a'), (1, 'b')"}),
    );

    fx.error("UNIQUE constraint failed").await;
    let entries = fx.journal("A1", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries_after = fx.engine.journal().unwrap().entries(&["A1".into()]).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries_after.len(), 1);
    assert!(entries[0].is_error());
    assert_eq!(fx.row_count(), 0);
    assert!(!fx.engine.readiness().contains("A1"));
}

#[tokio::test]
async fn unknown_verb_is_reported_and_journaled() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send("C1", "purge", json!({"service": "db1"}));

    fx.error("unknown command (purge)").await;
    let entries = fx.journal("C1", 1).await;
    assert_eq!(entries[0].data, json!({"error": "unknown command (purge)"}));
}

#[tokio::test]
async fn malformed_payload_is_journaled_and_processing_continues() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send("D1", "store", Value::String("{not json".into()));
    fx.error("json error").await;
    assert!(fx.journal("D1", 1).await[0].is_error());

    fx.send(
        "D2",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('ok')"}),
    );
    assert!(!fx.journal("D2", 1).await[0].is_error());
}

#[tokio::test]
async fn unknown_service_and_missing_sql_are_journaled() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send("E1", "store", json!({"service": "db9", "sql": "SELECT 1"}));
    fx.error("connection not found: db9").await;

    fx.send("E2", "store", json!({"service": "db1"}));
    fx.error("missing sql raw").await;

    assert!(fx.journal("E1", 1).await[0].is_error());
    assert!(fx.journal("E2", 1).await[0].is_error());
}

// ═══════════════════════════════════════════════════════════════════════
//  Journal verb
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn journal_verb_replies_and_clears_ready_entries() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send(
        "A1",
        "store",
        json!({"service": "db1", "sql": "INSERT INTO t(v) VALUES('x')"}),
    );
    fx.journal("A1", 1).await;
    for _ in 0..100 {
        if fx.engine.readiness().is_ready("A1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(fx.engine.readiness().is_ready("A1"));

    fx.send("J1", "journal", journal_lookup("[A1 missing]"));
    let reply = fx.reply("J1").await;

    assert_eq!(reply.as_array().unwrap().len(), 1);
    assert_eq!(reply[0]["id"], "A1");
    assert!(!fx.engine.readiness().contains("A1"));
}

#[tokio::test]
async fn journal_verb_against_unknown_service_is_an_error() {
    let mut fx = start(StorageSettings::default()).await;

    fx.send(
        "J2",
        "journal",
        json!({"service": "nowhere", "collection": "messages", "filter": {"field": "id", "query": "A1"}}),
    );
    fx.error("connection not found: nowhere").await;
    assert!(fx.journal("J2", 1).await[0].is_error());
}

// ═══════════════════════════════════════════════════════════════════════
//  Construction and lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn builder_with_bad_sources_is_disabled_and_reports_each() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SignalBus::new(64);
    let mut notices = bus.subscribe_notices();

    let settings = StorageSettings {
        sources: vec![
            source("legacy", "oracle", "x"),
            source("signal", "document", &path_string(dir.path(), "signal.db")),
            source("gremlin", "graph", "y"),
        ],
        ..StorageSettings::default()
    };
    let module = StorageEngine::builder(bus.clone(), settings).build().await;
    assert!(!module.is_enabled());

    let kernel = Kernel::new(bus.clone(), vec![module]);
    assert_eq!(kernel.components().count(), 0);

    let mut errors = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if notice.severity == Severity::Error {
            errors.push(notice.text);
        }
    }
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert!(errors.iter().any(|e| e.contains("unsupported dialect `oracle`")));
    assert!(errors.iter().any(|e| e.contains("unsupported dialect `graph`")));
    assert!(errors.iter().all(|e| e.starts_with("[Storage] ")));
}

#[tokio::test]
async fn builder_connects_sources_from_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("conf");
    std::fs::create_dir(&conf).unwrap();
    std::fs::write(
        conf.join("signal.dbconfig"),
        serde_json::to_string(&source(
            "signal",
            "document",
            &path_string(dir.path(), "signal.db"),
        ))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        conf.join("db1.dbconfig"),
        serde_json::to_string(&source("db1", "sqlite3", &path_string(dir.path(), "db1.sqlite")))
            .unwrap(),
    )
    .unwrap();

    let bus = SignalBus::new(64);
    let settings = StorageSettings {
        source_dir: Some(conf),
        ..StorageSettings::default()
    };
    let module = StorageEngine::builder(bus.clone(), settings).build().await;
    assert!(module.is_enabled());

    let component = module.component().unwrap();
    component.configure().await.unwrap();
    assert_eq!(component.read().as_deref(), Some("db1,signal"));
}

#[tokio::test]
async fn stop_ends_the_run_loop() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SignalBus::new(8);
    let engine = Arc::new(StorageEngine::new(bus, StorageSettings::default()));
    engine
        .connect(&source("signal", "document", &path_string(dir.path(), "signal.db")))
        .await
        .unwrap();

    let e = Arc::clone(&engine);
    let run = tokio::spawn(async move { e.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.pid().is_some());

    engine.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run loop did not stop")
        .unwrap()
        .unwrap();

    assert!(engine.run().await.is_err());
}
