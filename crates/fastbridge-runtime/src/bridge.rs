//! Top-level runtime facade.
//!
//! [`Bridge`] wires the buffer pool, context pool, dispatcher and reload
//! coordinator together behind one handle. Embedders start it once with a
//! config snapshot and an initial handler set, then dispatch requests,
//! reload handlers, and read health from any task.

use crate::buffer::{BufferHandle, BufferPool, Encoding};
use crate::dispatch::BridgeDispatcher;
use crate::pool::{ContextPool, HealthSnapshot};
use crate::reload::{ReloadCoordinator, ReloadReport};
use crate::runtime::handler_set::{HandlerSet, HandlerSource};
use fastbridge_common::{Result, RuntimeConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A running bridge runtime. Cheap to clone; all clones share the same
/// pool and buffers.
#[derive(Clone)]
pub struct Bridge {
    config: RuntimeConfig,
    pool: ContextPool,
    dispatcher: BridgeDispatcher,
    reloader: ReloadCoordinator,
    buffers: Arc<BufferPool>,
}

impl Bridge {
    /// Starts the runtime: compiles the initial handler set from `paths`,
    /// spawns the context pool, and waits for every context to come up.
    pub async fn start(config: RuntimeConfig, paths: &[impl AsRef<Path>]) -> Result<Self> {
        let sources = paths
            .iter()
            .map(|p| HandlerSource::from_path(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::start_with_sources(config, sources).await
    }

    /// Starts the runtime from in-memory handler sources.
    pub async fn start_with_sources(
        config: RuntimeConfig,
        sources: Vec<HandlerSource>,
    ) -> Result<Self> {
        let set = Arc::new(HandlerSet::compile(sources, 1)?);
        let buffers = Arc::new(BufferPool::new());
        let pool = ContextPool::new(config.clone(), set, Arc::clone(&buffers)).await?;
        let dispatcher = BridgeDispatcher::new(pool.clone(), Arc::clone(&buffers), &config);
        let reloader = ReloadCoordinator::new(pool.clone(), &config);
        tracing::info!(
            contexts = config.pool_size,
            timeout_ms = config.request_timeout_ms,
            "bridge runtime started"
        );
        Ok(Self {
            config,
            pool,
            dispatcher,
            reloader,
            buffers,
        })
    }

    /// Dispatches one request and returns the result bytes.
    ///
    /// Uses the configured default deadline. For JSON encoding the result
    /// is the handler's return value serialized as JSON; for byte encoding
    /// it is the raw byte array the handler returned.
    pub async fn dispatch(&self, route: &str, body: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
        self.dispatcher
            .dispatch_bytes(route, body, encoding, None)
            .await
    }

    /// Dispatches with an explicit per-request deadline.
    pub async fn dispatch_with_deadline(
        &self,
        route: &str,
        body: &[u8],
        encoding: Encoding,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        self.dispatcher
            .dispatch_bytes(route, body, encoding, Some(deadline))
            .await
    }

    /// Zero-copy variant: the caller owns the returned handle and must
    /// release it back via [`Bridge::buffers`].
    pub async fn dispatch_raw(
        &self,
        route: &str,
        body: &[u8],
        encoding: Encoding,
        deadline: Option<Duration>,
    ) -> Result<BufferHandle> {
        self.dispatcher.dispatch(route, body, encoding, deadline).await
    }

    /// Validates and rolls a new handler set read from `paths` across the
    /// pool. A set that fails validation changes nothing.
    pub async fn reload(&self, paths: &[impl AsRef<Path>]) -> Result<ReloadReport> {
        let sources = paths
            .iter()
            .map(|p| HandlerSource::from_path(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.reloader.propose_reload(sources).await
    }

    /// Reload from in-memory sources.
    pub async fn reload_sources(&self, sources: Vec<HandlerSource>) -> Result<ReloadReport> {
        self.reloader.propose_reload(sources).await
    }

    /// Grows or shrinks the context pool.
    pub async fn resize(&self, target: usize) -> Result<()> {
        self.pool.resize(target).await
    }

    pub fn health(&self) -> HealthSnapshot {
        self.pool.health()
    }

    /// Routes served by the currently published handler set.
    pub fn routes(&self) -> Vec<String> {
        self.pool.current_set().routes().to_vec()
    }

    pub fn generation(&self) -> u64 {
        self.pool.generation()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Drains every context and rejects further dispatches.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
