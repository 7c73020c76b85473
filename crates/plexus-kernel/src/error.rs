//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate, including
//! the [`Component`](crate::Component) contract.  Components with their own
//! error enums convert into [`KernelError::Component`] at the contract
//! boundary.

/// Unified error type for the plexus micro-kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Kernel state -------------------------------------------------------
    /// `Kernel::run` was called more than once.
    #[error("kernel is already running")]
    AlreadyRunning,

    // -- Bus errors ---------------------------------------------------------
    /// A received message carried no route and cannot be delivered.
    #[error("message {message_id} has an empty route")]
    EmptyRoute { message_id: String },

    /// Decoding a message from its wire form failed.
    #[error("message decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    // -- Component errors ---------------------------------------------------
    /// A component reported a failure from one of its contract methods.
    #[error("[{component}] {reason}")]
    Component { component: String, reason: String },

    /// A component's task panicked.  The panic was caught and converted.
    #[error("[{component}] panicked: {payload}")]
    ComponentPanicked { component: String, payload: String },

    /// The requested component is not registered.
    #[error("component not found: {name}")]
    ComponentNotFound { name: String },

    // -- Plugin errors ------------------------------------------------------
    /// `add_plugin` was called on a kernel without a plugin loader.
    #[error("no plugin loader configured")]
    PluginLoaderMissing,

    /// The plugin loader failed to produce components from `path`.
    #[error("plugin load failed for `{path}`: {reason}")]
    PluginLoad { path: String, reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Wrap any component-local error under the component's name.
    pub fn component(component: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Component {
            component: component.into(),
            reason: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
