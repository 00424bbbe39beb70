use thiserror::Error;

/// Failure taxonomy for the fastbridge execution core.
///
/// Every failure the core can produce is a typed variant here; nothing is
/// silently swallowed. Variants fall into three groups:
///
/// - **Caller errors**, surfaced immediately: [`CapacityExceeded`],
///   [`HandlerNotFound`], [`Encoding`]
/// - **Failed tickets**: [`HandlerPanicked`] (counts toward context fault
///   eviction), [`Timeout`] (triggers context eviction)
/// - **Pool/reload conditions**: [`CompileError`] (reload rejected, state
///   unchanged), [`PoolExhausted`] (backoff/retry at the caller's
///   discretion), [`ContextStopped`], [`Shutdown`]
///
/// [`CapacityExceeded`]: BridgeError::CapacityExceeded
/// [`HandlerNotFound`]: BridgeError::HandlerNotFound
/// [`Encoding`]: BridgeError::Encoding
/// [`HandlerPanicked`]: BridgeError::HandlerPanicked
/// [`Timeout`]: BridgeError::Timeout
/// [`CompileError`]: BridgeError::CompileError
/// [`PoolExhausted`]: BridgeError::PoolExhausted
/// [`ContextStopped`]: BridgeError::ContextStopped
/// [`Shutdown`]: BridgeError::Shutdown
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("buffer capacity exceeded: needed {needed} bytes, reserved {reserved}")]
    CapacityExceeded { needed: usize, reserved: usize },

    #[error("no handler registered for route '{0}'")]
    HandlerNotFound(String),

    #[error("handler fault on route '{route}': {message}")]
    HandlerPanicked { route: String, message: String },

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("handler compilation failed: {0}")]
    CompileError(String),

    #[error("no idle execution context available")]
    PoolExhausted,

    #[error("invalid payload encoding: {0}")]
    Encoding(String),

    #[error("execution context stopped")]
    ContextStopped,

    #[error("runtime is shutting down")]
    Shutdown,

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether this failure counts toward a context's fault window.
    ///
    /// Only handler-internal faults contribute; caller errors and routing
    /// misconfiguration say nothing about the context's health.
    pub fn is_context_fault(&self) -> bool {
        matches!(self, BridgeError::HandlerPanicked { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
