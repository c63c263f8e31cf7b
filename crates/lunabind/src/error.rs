//! Error types for the bridge, plus the process-wide error handler.
//!
//! Errors raised inside the VM reach the host only through protected calls.
//! Before such an error is returned to the caller, it is reported to the
//! installed error handler (by default a `tracing::error!` event).

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A value's runtime kind did not match the kind the caller asked for
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeGuard {
        /// Expected kind name
        expected: String,
        /// Actual kind name
        got: String,
    },

    /// Error raised by embedded code or by a host closure during an embedded call
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Chunk failed to compile
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// VM allocation failure
    #[error("Memory error: {0}")]
    Memory(String),

    /// File I/O error while loading a chunk
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A custom type was registered twice in the same VM
    #[error("Custom type already registered: {0}")]
    AlreadyRegistered(String),

    /// Userdata requested for a type that has no registration in this VM
    #[error("Custom type not registered: {0}")]
    UnregisteredType(String),

    /// Payload was already handed to its finalizer
    #[error("Userdata of type {0} has been finalized")]
    Finalized(String),

    /// Operation the bridge cannot express
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The VM owning a handle has been closed
    #[error("VM has been closed")]
    VmClosed,

    /// A handle was used with a VM other than the one that created it
    #[error("Value belongs to a different VM")]
    VmMismatch,

    /// Host callback panicked
    #[error("Host callback panicked: {0}")]
    Panic(String),
}

impl BridgeError {
    /// Build a `TypeGuard` error from kind names
    pub fn type_guard(expected: impl Into<String>, got: impl Into<String>) -> Self {
        BridgeError::TypeGuard {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Message as it should appear inside the VM when this error is raised
    /// from a host callback.
    pub fn vm_message(&self) -> String {
        match self {
            BridgeError::Runtime(msg) | BridgeError::Syntax(msg) | BridgeError::Memory(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::Runtime(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::Runtime(s.to_string())
    }
}

// ============================================================================
// Error Handler
// ============================================================================

/// Callback invoked with the message of every VM error before it propagates
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

static ERROR_HANDLER: Lazy<RwLock<ErrorHandler>> =
    Lazy::new(|| RwLock::new(Arc::new(log_error)));

fn log_error(message: &str) {
    tracing::error!(target: "lunabind", "{}", message);
}

/// Install a process-wide error handler, replacing the current one.
pub fn set_error_handler(handler: impl Fn(&str) + Send + Sync + 'static) {
    *ERROR_HANDLER.write() = Arc::new(handler);
}

/// Restore the default handler (logs through `tracing`).
pub fn reset_error_handler() {
    *ERROR_HANDLER.write() = Arc::new(log_error);
}

/// Hand `message` to the installed error handler.
pub(crate) fn report(message: &str) {
    // Clone out so a handler may itself call `set_error_handler`
    let handler = ERROR_HANDLER.read().clone();
    handler(message);
}

/// Format a panic payload into an error message
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
