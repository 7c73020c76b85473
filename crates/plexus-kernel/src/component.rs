//! Component contract.
//!
//! A component is a named unit the kernel starts once and then feeds every
//! message on the bus.  Each component decides by its [`Component::route`]
//! whether a message concerns it; anything else must be ignored with
//! `Ok(())`.
//!
//! # Construction
//!
//! ```text
//! ComponentBuilder::new(component, bus)
//!     .option(A)      ── may push failures ──┐
//!     .option(B)      ── may push failures ──┤
//!     .build().await                         ▼
//!          │                          failures empty?
//!          ├── yes ─> ComponentModule::enabled  (attach registers it)
//!          └── no  ─> ComponentModule::disabled (attach is a no-op;
//!                                                each failure reported once)
//! ```
//!
//! Options never panic and never abort construction early: every option is
//! applied so that all failures surface in one pass.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::SignalBus;
use crate::error::Result;
use crate::message::Message;

// ---------------------------------------------------------------------------
// Lifecycle surface
// ---------------------------------------------------------------------------

/// Process-control operations every component and the kernel expose.
///
/// These exist for orchestration tooling.  Each method defaults to a no-op;
/// implementors override the ones they can honour.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn up(&self, _graceful: bool) -> Result<()> {
        Ok(())
    }

    async fn down(&self, _graceful: bool) -> Result<()> {
        Ok(())
    }

    async fn sleep(&self, _duration: Duration) -> Result<()> {
        Ok(())
    }

    async fn restart(&self, _graceful: bool) -> Result<()> {
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn cron(&self, _rule: &str) -> Result<()> {
        Ok(())
    }

    /// Ask the component to leave its run loop.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Stop and release every held resource.
    async fn kill(&self) -> Result<()> {
        Ok(())
    }

    async fn sync(&self, _with: &str) -> Result<()> {
        Ok(())
    }

    async fn backup(&self, _to: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// The pluggable unit contract.
///
/// Components are shared as `Arc<dyn Component>` between the kernel's run
/// task and its fan-out tasks, so every method takes `&self` and components
/// use interior mutability for their state.
#[async_trait]
pub trait Component: Lifecycle {
    /// Unique, stable name.  Used as the registry key.
    fn name(&self) -> &str;

    /// The route this component services.
    fn route(&self) -> &str;

    /// Identity token assigned when the component starts running.
    fn pid(&self) -> Option<String>;

    /// One-time setup, invoked by the kernel right before [`Component::run`].
    async fn configure(&self) -> Result<()>;

    /// Enter the component's own execution.  Server-like components block
    /// here for the lifetime of the process.
    async fn run(&self) -> Result<()>;

    /// Deliver a message.  Must return `Ok(())` without side effects when
    /// `message.route() != self.route()`.
    async fn write(&self, message: Arc<Message>) -> Result<()>;

    /// Polling accessor.  Most components have nothing to offer.
    fn read(&self) -> Option<String> {
        None
    }
}

/// A host that components attach to.
pub trait Service: Send + Sync {
    fn add_component(&self, component: Arc<dyn Component>);
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Construction failures collected while applying options.
#[derive(Debug, Default)]
pub struct Failures {
    errors: Vec<String>,
}

impl Failures {
    pub fn push(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(String::as_str)
    }
}

/// One configuration step applied to a component under construction.
#[async_trait]
pub trait ComponentOption<C: Send>: Send {
    async fn apply(self: Box<Self>, component: &mut C, failures: &mut Failures);
}

/// Applies options to a component and decides whether it may attach.
pub struct ComponentBuilder<C> {
    component: C,
    options: Vec<Box<dyn ComponentOption<C>>>,
    bus: SignalBus,
}

impl<C> ComponentBuilder<C>
where
    C: Component + 'static,
{
    pub fn new(component: C, bus: SignalBus) -> Self {
        Self {
            component,
            options: Vec::new(),
            bus,
        }
    }

    /// Queue an option.  Options run in the order they were added.
    pub fn option(mut self, option: impl ComponentOption<C> + 'static) -> Self {
        self.options.push(Box::new(option));
        self
    }

    /// Apply every option and produce the attach hook.
    pub async fn build(self) -> ComponentModule {
        let Self {
            mut component,
            options,
            bus,
        } = self;

        let mut failures = Failures::default();
        for option in options {
            option.apply(&mut component, &mut failures).await;
        }

        let name = component.name().to_string();
        if !failures.is_empty() {
            for failure in failures.iter() {
                bus.error(format!("[{name}] {failure}"));
            }
            return ComponentModule::disabled(name);
        }

        bus.info(format!("[{name}] initialized"));
        ComponentModule::enabled(Arc::new(component), bus)
    }
}

/// Result of a component build: the hook that attaches it to a host.
pub struct ComponentModule {
    name: String,
    component: Option<Arc<dyn Component>>,
    bus: Option<SignalBus>,
}

impl ComponentModule {
    /// A module that attaches `component` when applied.
    pub fn enabled(component: Arc<dyn Component>, bus: SignalBus) -> Self {
        Self {
            name: component.name().to_string(),
            component: Some(component),
            bus: Some(bus),
        }
    }

    /// A module whose attach hook does nothing.
    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component: None,
            bus: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.component.is_some()
    }

    /// The component this module would attach, if enabled.
    pub fn component(&self) -> Option<Arc<dyn Component>> {
        self.component.clone()
    }

    /// Register the component into `service`.  No-op when disabled.
    pub fn attach(&self, service: &dyn Service) {
        let Some(component) = &self.component else {
            tracing::debug!(component = %self.name, "disabled component not attached");
            return;
        };
        service.add_component(Arc::clone(component));
        if let Some(bus) = &self.bus {
            bus.info(format!("[{}] attached", self.name));
        }
    }
}

impl fmt::Debug for ComponentModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentModule")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Widget {
        name: String,
        tags: Vec<String>,
    }

    #[async_trait]
    impl Lifecycle for Widget {}

    #[async_trait]
    impl Component for Widget {
        fn name(&self) -> &str {
            &self.name
        }
        fn route(&self) -> &str {
            "widget"
        }
        fn pid(&self) -> Option<String> {
            None
        }
        async fn configure(&self) -> Result<()> {
            Ok(())
        }
        async fn run(&self) -> Result<()> {
            Ok(())
        }
        async fn write(&self, _message: Arc<Message>) -> Result<()> {
            Ok(())
        }
        fn read(&self) -> Option<String> {
            Some(self.tags.join(","))
        }
    }

    struct Tag(&'static str);

    #[async_trait]
    impl ComponentOption<Widget> for Tag {
        async fn apply(self: Box<Self>, component: &mut Widget, _failures: &mut Failures) {
            component.tags.push(self.0.to_string());
        }
    }

    struct Broken(&'static str);

    #[async_trait]
    impl ComponentOption<Widget> for Broken {
        async fn apply(self: Box<Self>, _component: &mut Widget, failures: &mut Failures) {
            failures.push(self.0);
        }
    }

    #[derive(Default)]
    struct Host {
        names: Mutex<Vec<String>>,
    }

    impl Service for Host {
        fn add_component(&self, component: Arc<dyn Component>) {
            self.names.lock().unwrap().push(component.name().to_string());
        }
    }

    fn widget() -> Widget {
        Widget {
            name: "Widget".into(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn options_apply_in_order_and_attach() {
        let bus = SignalBus::new(8);
        let module = ComponentBuilder::new(widget(), bus)
            .option(Tag("a"))
            .option(Tag("b"))
            .build()
            .await;
        assert!(module.is_enabled());
        let component = module.component().expect("enabled");
        assert_eq!(component.read().as_deref(), Some("a,b"));

        let host = Host::default();
        module.attach(&host);
        assert_eq!(*host.names.lock().unwrap(), vec!["Widget".to_string()]);
    }

    #[tokio::test]
    async fn failures_disable_and_report_each_once() {
        let bus = SignalBus::new(8);
        let mut notices = bus.subscribe_notices();

        let module = ComponentBuilder::new(widget(), bus)
            .option(Broken("first"))
            .option(Tag("ok"))
            .option(Broken("second"))
            .build()
            .await;
        assert!(!module.is_enabled());

        let host = Host::default();
        module.attach(&host);
        assert!(host.names.lock().unwrap().is_empty());

        let a = notices.recv().await.unwrap();
        let b = notices.recv().await.unwrap();
        assert_eq!(a.text, "[Widget] first");
        assert_eq!(b.text, "[Widget] second");
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn lifecycle_defaults_are_noops() {
        let p = widget();
        assert!(p.up(true).await.is_ok());
        assert!(p.sleep(Duration::from_millis(1)).await.is_ok());
        assert!(p.cron("* * * * *").await.is_ok());
        assert!(p.stop().await.is_ok());
        assert!(p.kill().await.is_ok());
        assert!(p.backup("/tmp").await.is_ok());
    }
}
