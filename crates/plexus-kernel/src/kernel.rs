//! Kernel dispatch loop.
//!
//! The kernel owns the attached components and the only subscription that
//! feeds them.  Its life has two phases:
//!
//! ```text
//! Assembling  --run()-->  Running (until the process exits)
//! ```
//!
//! While assembling, [`ComponentModule`]s attach components to the
//! registry.  [`Kernel::run`] then starts every component on its own task
//! (`configure` followed by `run`) and loops over the bus:
//!
//! ```text
//! bus.generate() ──> signal ──spawn──> fan-out ──spawn──> component.write()  (x N)
//! ```
//!
//! Each fan-out and each delivery is its own task, so a slow or failing
//! component never holds up the others.  Delivery order across components
//! is unspecified.  Failures are reported on the bus error stream; panics
//! inside a component's run task are caught and reported the same way.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::SignalBus;
use crate::component::{Component, ComponentModule, Lifecycle, Service};
use crate::error::{KernelError, Result};
use crate::message::Message;
use crate::registry::ComponentRegistry;

const KERNEL_NAME: &str = "Kernel";

/// Loads component modules from a plugin location.
///
/// Discovery and file loading are left to the implementor; the kernel only
/// attaches what it is handed.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<Vec<ComponentModule>>;
}

/// The plexus micro-kernel.
///
/// Wrap in an `Arc` to call [`Kernel::add_plugin`] or
/// [`Kernel::remove_plugin`] while [`Kernel::run`] is looping.
pub struct Kernel {
    bus: SignalBus,
    registry: ComponentRegistry,
    /// Run task per component name.
    tasks: DashMap<String, JoinHandle<()>>,
    loader: Option<Arc<dyn PluginLoader>>,
    pid: OnceLock<String>,
    running: AtomicBool,
}

impl Kernel {
    /// Create a kernel and attach every enabled module.
    pub fn new(bus: SignalBus, modules: impl IntoIterator<Item = ComponentModule>) -> Self {
        let kernel = Self {
            bus,
            registry: ComponentRegistry::new(),
            tasks: DashMap::new(),
            loader: None,
            pid: OnceLock::new(),
            running: AtomicBool::new(false),
        };
        for module in modules {
            module.attach(&kernel);
        }
        kernel.bus.info(format!("[{KERNEL_NAME}] initialized"));
        kernel
    }

    /// Use `loader` for [`Kernel::add_plugin`].
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// The attached components.
    pub fn components(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Identity token, assigned when the kernel starts running.
    pub fn pid(&self) -> Option<&str> {
        self.pid.get().map(String::as_str)
    }

    pub fn name(&self) -> &str {
        KERNEL_NAME
    }

    /// Start every component and dispatch bus signals until the bus closes.
    ///
    /// The bus closes only when every [`SignalBus`] clone is dropped, and the
    /// kernel holds one, so this future normally never resolves.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(KernelError::AlreadyRunning);
        }
        let pid = self.pid.get_or_init(|| Uuid::now_v7().to_string());
        tracing::info!(pid = %pid, components = self.registry.count(), "kernel starting");

        // Subscribe before any component starts so nothing it sends is missed.
        let mut signals = self.bus.generate();

        for component in self.registry.snapshot() {
            self.start(component);
        }
        self.bus.info(format!("[{KERNEL_NAME}] started"));

        while let Some(signal) = signals.next().await {
            let registry = self.registry.clone();
            let bus = self.bus.clone();
            tokio::spawn(dispatch(registry, bus, Arc::clone(signal.message())));
        }

        tracing::info!("signal bus closed; kernel loop finished");
        Ok(())
    }

    /// Load components from `path`, attach the new ones and start `name`.
    ///
    /// Components whose name is already registered are left untouched.  If
    /// `name` already has a live run task it is not started a second time.
    pub async fn add_plugin(&self, path: impl AsRef<Path>, name: &str) -> Result<()> {
        let path = path.as_ref();
        let loader = self.loader.as_ref().ok_or(KernelError::PluginLoaderMissing)?;
        let modules = loader.load(path).await?;

        for module in modules {
            if self.registry.contains(module.name()) {
                tracing::debug!(component = %module.name(), "plugin component already attached");
                continue;
            }
            module.attach(self);
        }

        let component = self.registry.get(name)?;
        let live = self
            .tasks
            .get(name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if !live {
            self.start(component);
        }

        self.bus.info(format!(
            "[{KERNEL_NAME}] plugin {name} added from {}",
            path.display()
        ));
        Ok(())
    }

    /// Stop, kill and unregister a component.
    ///
    /// Lifecycle failures are reported but do not prevent removal.
    pub async fn remove_plugin(&self, name: &str) -> Result<()> {
        let component = self.registry.get(name)?;

        if let Err(err) = component.stop().await {
            report(&self.bus, name, err);
        }
        if let Err(err) = component.kill().await {
            report(&self.bus, name, err);
        }

        self.registry.unregister(name);
        if let Some((_, handle)) = self.tasks.remove(name) {
            handle.abort();
        }

        self.bus.info(format!("[{KERNEL_NAME}] plugin {name} removed"));
        Ok(())
    }

    /// Spawn the configure-then-run task for one component.
    fn start(&self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        let handle = tokio::spawn(supervise(component, self.bus.clone()));
        if let Some(previous) = self.tasks.insert(name, handle) {
            previous.abort();
        }
    }
}

impl Service for Kernel {
    fn add_component(&self, component: Arc<dyn Component>) {
        self.registry.register(component);
    }
}

#[async_trait]
impl Lifecycle for Kernel {
    /// Ask every component to stop.
    async fn stop(&self) -> Result<()> {
        for component in self.registry.snapshot() {
            if let Err(err) = component.stop().await {
                report(&self.bus, component.name(), err);
            }
        }
        Ok(())
    }

    /// Kill every component and abort their run tasks.
    async fn kill(&self) -> Result<()> {
        for component in self.registry.snapshot() {
            if let Err(err) = component.kill().await {
                report(&self.bus, component.name(), err);
            }
        }
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Run one component to completion, converting failures and panics into
/// error notices.
async fn supervise(component: Arc<dyn Component>, bus: SignalBus) {
    let name = component.name().to_string();

    let outcome = AssertUnwindSafe(async {
        if let Err(err) = component.configure().await {
            report(&bus, &name, err);
        } else {
            bus.info(format!("[{name}] configured"));
        }
        component.run().await
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => tracing::info!(component = %name, "component run finished"),
        Ok(Err(err)) => report(&bus, &name, err),
        Err(panic) => report(
            &bus,
            &name,
            KernelError::ComponentPanicked {
                component: name.clone(),
                payload: panic_message(panic.as_ref()),
            },
        ),
    }
}

/// Deliver one message to every registered component.
async fn dispatch(registry: ComponentRegistry, bus: SignalBus, message: Arc<Message>) {
    if message.route().is_empty() {
        bus.error(KernelError::EmptyRoute {
            message_id: message.id().to_string(),
        });
        return;
    }

    tracing::trace!(
        message_id = %message.id(),
        route = %message.route(),
        command = %message.command(),
        "dispatching signal"
    );

    for component in registry.snapshot() {
        let bus = bus.clone();
        let message = Arc::clone(&message);
        tokio::spawn(async move {
            if let Err(err) = component.write(message).await {
                report(&bus, component.name(), err);
            }
        });
    }
}

/// Put `err` on the error stream, prefixed with the component name unless
/// the error already carries it.
fn report(bus: &SignalBus, component: &str, err: KernelError) {
    match err {
        KernelError::Component { .. } | KernelError::ComponentPanicked { .. } => bus.error(err),
        other => bus.error(format!("[{component}] {other}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
