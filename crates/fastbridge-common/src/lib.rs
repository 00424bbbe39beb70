//! fastbridge Common Types
//!
//! This crate provides the shared error taxonomy and configuration surface
//! for the fastbridge execution core. fastbridge fronts a pool of isolated
//! script-execution contexts behind a native dispatcher; everything that
//! both the runtime and its external collaborators (listener, reload
//! watcher, monitoring) need to agree on lives here:
//!
//! - [`error`] - Typed failure taxonomy ([`BridgeError`]) and `Result` alias
//! - [`config`] - The configuration snapshot consumed (not owned) by the core
//!
//! # Example
//!
//! ```
//! use fastbridge_common::{BridgeError, RuntimeConfig};
//!
//! let config = RuntimeConfig::default();
//! assert!(config.pool_size >= 1);
//!
//! let err = BridgeError::HandlerNotFound("orders.create".into());
//! assert!(err.to_string().contains("orders.create"));
//! ```

pub mod config;
pub mod error;

pub use config::RuntimeConfig;
pub use error::{BridgeError, Result};
