//! plexus micro-kernel.
//!
//! This crate provides the foundational services every plexus component
//! builds on:
//!
//! - **[`bus`]** -- Publish/subscribe signal bus backed by
//!   [`tokio::sync::broadcast`], plus the info/debug/error notice streams.
//! - **[`message`]** -- The immutable [`Message`] value and its wire codec.
//! - **[`component`]** -- The [`Component`] contract, the [`Lifecycle`]
//!   control surface, and the [`ComponentBuilder`] that turns construction
//!   failures into a disabled [`ComponentModule`].
//! - **[`registry`]** -- Concurrent component registry using [`DashMap`].
//! - **[`kernel`]** -- The dispatch loop that starts every component and
//!   fans each received signal out to all of them.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.
//!
//! [`DashMap`]: dashmap::DashMap

pub mod bus;
pub mod component;
pub mod error;
pub mod kernel;
pub mod message;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use bus::{Notice, Severity, Signal, SignalBus, Signals};
pub use component::{
    Component, ComponentBuilder, ComponentModule, ComponentOption, Failures, Lifecycle, Service,
};
pub use error::{KernelError, Result};
pub use kernel::{Kernel, PluginLoader};
pub use message::Message;
pub use registry::ComponentRegistry;
