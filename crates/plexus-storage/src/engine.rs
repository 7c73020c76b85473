//! The storage engine component.
//!
//! [`StorageEngine`] services route `storage`.  Its `write` only enqueues;
//! the run loop drains the queue and routes each message by verb:
//!
//! ```text
//! write() ─> mpsc ─> run loop ─┬─ journal        find in a document store, reply
//!                              ├─ store          pending ─> tx ─> journal ─> ready
//!                              └─ journal-store  spawn: wait ready ─> find, reply
//! ```
//!
//! Every failure is reported on the bus error stream and journaled under the
//! id of the message that caused it.  Replies reuse the request id and go to
//! the configured reply route.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use plexus_kernel::{
    Component, ComponentBuilder, ComponentOption, Failures, KernelError, Lifecycle, Message,
    SignalBus,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{Command, Verb};
use crate::config::{DataSourceConfig, Dialect, StorageSettings};
use crate::document::{DocumentStore, EmbeddedDocuments, MongoDocuments};
use crate::error::{StorageError, StorageResult};
use crate::journal::{Journal, JournalEntry};
use crate::readiness::ReadinessMap;
use crate::relational::RelationalStore;

pub const NAME: &str = "Storage";
pub const ROUTE: &str = "storage";

impl From<StorageError> for KernelError {
    fn from(err: StorageError) -> Self {
        KernelError::component(NAME, err)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Backends and shared state needed to process one message.  Cloned into
/// every `journal-store` task.
#[derive(Clone)]
struct Router {
    bus: SignalBus,
    settings: Arc<StorageSettings>,
    relational: Arc<DashMap<String, RelationalStore>>,
    documents: Arc<DashMap<String, Arc<dyn DocumentStore>>>,
    readiness: ReadinessMap,
}

impl Router {
    async fn dispatch(&self, message: Arc<Message>, cancel: &CancellationToken) {
        let id = message.id().to_string();
        debug!(message_id = %id, command = %message.command(), "routing storage message");

        let command = match Command::from_payload(message.data()) {
            Ok(command) => command,
            Err(err) => return self.fail(&id, err).await,
        };
        let verb = match message.command().parse::<Verb>() {
            Ok(verb) => verb,
            Err(err) => return self.fail(&id, err).await,
        };

        match verb {
            Verb::Journal => self.journal(&id, &command).await,
            Verb::Store => self.store(&id, &command).await,
            Verb::JournalStore => {
                let router = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(message_id = %id, "journal-store cancelled");
                        }
                        _ = router.journal_store(&id, &command) => {}
                    }
                });
            }
        }
    }

    async fn journal(&self, id: &str, command: &Command) {
        match self.lookup(command).await {
            Ok((values, found)) => {
                self.readiness.clear_ready(id);
                for value in &values {
                    self.readiness.clear_ready(value);
                }
                self.reply(id, Value::Array(found));
            }
            Err(err) => self.fail(id, err).await,
        }
    }

    async fn store(&self, id: &str, command: &Command) {
        self.readiness.pending(id);

        let result = match self.execute(command).await {
            Ok(result) => result,
            Err(err) => {
                self.readiness.discard(id);
                return self.fail(id, err).await;
            }
        };
        self.bus.debug(format!("[{NAME}] {id}: {result}"));

        match self.record(JournalEntry::success(id, result)).await {
            Ok(()) => self.readiness.mark_ready(id),
            Err(err) => self.bus.error(KernelError::component(NAME, err)),
        }
    }

    async fn journal_store(&self, id: &str, command: &Command) {
        match self.wait_then_lookup(command).await {
            Ok(found) => self.reply(id, Value::Array(found)),
            Err(err) => {
                let text = err.to_string();
                self.fail(id, err).await;
                self.reply(id, json!({ "error": text }));
            }
        }
    }

    async fn wait_then_lookup(&self, command: &Command) -> StorageResult<Vec<Value>> {
        let values = command.filter()?.values();
        let timeout = self.settings.readiness_timeout();
        for value in &values {
            self.readiness.wait_ready(value, timeout).await?;
        }
        self.lookup(command).await.map(|(_, found)| found)
    }

    /// Run the set-membership query a document command describes.
    ///
    /// The service name doubles as the database name.
    async fn lookup(&self, command: &Command) -> StorageResult<(Vec<String>, Vec<Value>)> {
        let service = command.service()?;
        let collection = command.collection()?;
        let filter = command.filter()?;
        let store = self.document_store(service)?;

        let values = filter.values();
        let found = store
            .find_in(service, collection, &filter.field, &values)
            .await?;
        Ok((values, found))
    }

    async fn execute(&self, command: &Command) -> StorageResult<Value> {
        let service = command.service()?;
        let sql = command.sql()?;
        let store = self
            .relational
            .get(service)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::ConnectionNotFound(service.to_string()))?;
        store.execute(sql).await
    }

    fn document_store(&self, service: &str) -> StorageResult<Arc<dyn DocumentStore>> {
        self.documents
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StorageError::ConnectionNotFound(service.to_string()))
    }

    fn journal_writer(&self) -> StorageResult<Journal> {
        let store = self.document_store(&self.settings.journal.source)?;
        Ok(Journal::new(store, &self.settings.journal))
    }

    async fn record(&self, entry: JournalEntry) -> StorageResult<()> {
        self.journal_writer()?.record(entry).await
    }

    /// Report `err` and journal it under `id`.
    async fn fail(&self, id: &str, err: StorageError) {
        self.bus.error(KernelError::component(NAME, &err));
        if let Err(journal_err) = self.record(JournalEntry::failure(id, &err)).await {
            self.bus.error(KernelError::component(NAME, journal_err));
        }
    }

    fn reply(&self, id: &str, data: Value) {
        self.bus.send(Message::reply(
            id,
            &self.settings.reply_route,
            &self.settings.reply_command,
            data,
        ));
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Multi-backend storage component.
pub struct StorageEngine {
    router: Router,
    inbound: mpsc::Sender<Arc<Message>>,
    receiver: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    pid: OnceLock<String>,
    cancel: CancellationToken,
}

impl StorageEngine {
    /// An engine with no backends yet.  Connect them with [`ConnectTo`] or
    /// [`StorageEngine::connect`].
    pub fn new(bus: SignalBus, settings: StorageSettings) -> Self {
        let (inbound, receiver) = mpsc::channel(settings.inbound_capacity.max(1));
        Self {
            router: Router {
                bus,
                settings: Arc::new(settings),
                relational: Arc::new(DashMap::new()),
                documents: Arc::new(DashMap::new()),
                readiness: ReadinessMap::new(),
            },
            inbound,
            receiver: Mutex::new(Some(receiver)),
            pid: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder that connects every source resolved from `settings`.
    pub fn builder(bus: SignalBus, settings: StorageSettings) -> ComponentBuilder<StorageEngine> {
        ComponentBuilder::new(Self::new(bus.clone(), settings), bus).option(ConnectTo::configured())
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.router.settings
    }

    pub fn readiness(&self) -> &ReadinessMap {
        &self.router.readiness
    }

    /// Names of every connected data source.
    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .router
            .relational
            .iter()
            .map(|e| e.key().clone())
            .chain(self.router.documents.iter().map(|e| e.key().clone()))
            .collect();
        names.sort();
        names
    }

    /// Writer for the configured journal location.
    pub fn journal(&self) -> StorageResult<Journal> {
        self.router.journal_writer()
    }

    /// Open one data source and register it under its name.
    pub async fn connect(&self, source: &DataSourceConfig) -> StorageResult<()> {
        if source.name.trim().is_empty() {
            return Err(StorageError::InvalidSource {
                source_name: source.name.clone(),
                reason: "name of connection can not be empty".into(),
            });
        }

        let dialect = source.dialect()?;
        if matches!(dialect, Dialect::Sqlite | Dialect::Document) {
            if let Some(parent) = Path::new(&source.database)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        match dialect {
            Dialect::Sqlite | Dialect::Postgres | Dialect::MySql => {
                let store = RelationalStore::connect(source, &self.router.settings.pool).await?;
                self.router.relational.insert(source.name.clone(), store);
            }
            Dialect::MongoDb => {
                let store = MongoDocuments::connect(source).await?;
                self.router
                    .documents
                    .insert(source.name.clone(), Arc::new(store));
            }
            Dialect::Document => {
                let store = EmbeddedDocuments::open(source).await?;
                self.router
                    .documents
                    .insert(source.name.clone(), Arc::new(store));
            }
        }

        self.router
            .bus
            .info(format!("[{NAME}] connected to {} ({dialect})", source.name));
        Ok(())
    }

    async fn close_all(&self) {
        let relational: Vec<RelationalStore> =
            self.router.relational.iter().map(|e| e.value().clone()).collect();
        for store in relational {
            store.close().await;
            debug!(source = %store.name(), "relational pool closed");
        }

        let documents: Vec<(String, Arc<dyn DocumentStore>)> = self
            .router
            .documents
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (name, store) in documents {
            if let Err(err) = store.close().await {
                self.router
                    .bus
                    .error(format!("[{NAME}] closing {name}: {err}"));
            }
        }

        self.router.relational.clear();
        self.router.documents.clear();
    }
}

#[async_trait]
impl Lifecycle for StorageEngine {
    /// Leave the run loop and cancel pending `journal-store` reads.
    async fn stop(&self) -> plexus_kernel::Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    /// Stop, then release every backend connection.
    async fn kill(&self) -> plexus_kernel::Result<()> {
        self.stop().await?;
        self.close_all().await;
        self.router.bus.info(format!("[{NAME}] connections closed"));
        Ok(())
    }
}

#[async_trait]
impl Component for StorageEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn route(&self) -> &str {
        ROUTE
    }

    fn pid(&self) -> Option<String> {
        self.pid.get().cloned()
    }

    async fn configure(&self) -> plexus_kernel::Result<()> {
        let journal = &self.router.settings.journal;
        if !self.router.documents.contains_key(&journal.source) {
            return Err(StorageError::ConnectionNotFound(format!(
                "journal source `{}`",
                journal.source
            ))
            .into());
        }
        Ok(())
    }

    async fn run(&self) -> plexus_kernel::Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| KernelError::component(NAME, "run loop already started"))?;

        let pid = self.pid.get_or_init(|| Uuid::now_v7().to_string());
        info!(component = NAME, pid = %pid, "storage engine started");

        let ttl = self.router.settings.readiness_ttl();
        let mut sweep = tokio::time::interval(ttl);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => {
                    let dropped = self.router.readiness.sweep(ttl);
                    if dropped > 0 {
                        debug!(component = NAME, dropped, "stale readiness entries dropped");
                    }
                }
                next = receiver.recv() => match next {
                    Some(message) => self.router.dispatch(message, &self.cancel).await,
                    None => break,
                },
            }
        }

        info!(component = NAME, "storage engine stopped");
        Ok(())
    }

    async fn write(&self, message: Arc<Message>) -> plexus_kernel::Result<()> {
        if message.route() != ROUTE {
            return Ok(());
        }
        self.inbound
            .send(message)
            .await
            .map_err(|_| KernelError::component(NAME, "inbound queue closed"))
    }

    fn read(&self) -> Option<String> {
        Some(self.sources().join(","))
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Connects data sources while the engine is being built.
///
/// Every source is attempted; each one that fails adds one failure, and any
/// failure keeps the engine from attaching.
pub struct ConnectTo {
    sources: Option<Vec<DataSourceConfig>>,
}

impl ConnectTo {
    pub fn new(sources: impl IntoIterator<Item = DataSourceConfig>) -> Self {
        Self {
            sources: Some(sources.into_iter().collect()),
        }
    }

    /// Use the sources resolved from the engine's own settings.
    pub fn configured() -> Self {
        Self { sources: None }
    }
}

#[async_trait]
impl ComponentOption<StorageEngine> for ConnectTo {
    async fn apply(self: Box<Self>, engine: &mut StorageEngine, failures: &mut Failures) {
        let sources = match self.sources {
            Some(sources) => sources,
            None => match engine.settings().resolve_sources() {
                Ok(sources) => sources,
                Err(err) => {
                    failures.push(err);
                    return;
                }
            },
        };

        for source in &sources {
            if let Err(err) = engine.connect(source).await {
                failures.push(err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
