//! Native dispatch runtime over a pool of isolated script contexts.
//!
//! The runtime fronts a set of JavaScript execution contexts (Boa
//! interpreters), each pinned to its own thread with fully private global
//! state. Requests flow through zero-copy transfer buffers into the
//! least-recently-used idle context, run under a deadline, and come back
//! as owned result buffers. Handler code is versioned in immutable sets
//! and can be reloaded across the pool without dropping in-flight work.
//!
//! [`Bridge`] is the entry point for embedders; the lower layers
//! ([`ContextPool`], [`BridgeDispatcher`], [`BufferPool`]) are exposed for
//! callers that need finer control.

pub mod bridge;
pub mod buffer;
pub mod dispatch;
pub mod pool;
pub mod reload;
pub mod runtime;

pub use bridge::Bridge;
pub use buffer::{BufferHandle, BufferPool, Encoding, TransferBuffer};
pub use dispatch::BridgeDispatcher;
pub use fastbridge_common::{BridgeError, Result, RuntimeConfig};
pub use pool::{ContextLease, ContextPool, HealthSnapshot};
pub use reload::{ReloadCoordinator, ReloadReport};
pub use runtime::handler_set::{HandlerSet, HandlerSource};
