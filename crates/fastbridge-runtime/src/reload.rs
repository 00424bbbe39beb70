//! Rolling reload of handler code across the pool.
//!
//! A reload that would fail compilation must not disturb the running
//! system at all, so the coordinator validates the whole set in a scratch
//! interpreter before any context is touched. Only then does it bump the
//! pool generation and walk the contexts, draining and swapping each one
//! under a parallelism bound so available capacity never collapses during
//! the rollout.
//!
//! Mixed-generation operation is a supported intermediate state, not a
//! fault: contexts that fail or straggle stay on the old generation and
//! keep serving it, and the report names them.

use crate::pool::ContextPool;
use crate::runtime::handler_set::{HandlerSet, HandlerSource};
use fastbridge_common::{BridgeError, Result, RuntimeConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of one rolling reload.
#[derive(Debug)]
pub struct ReloadReport {
    /// Generation the new handler set was published as.
    pub generation: u64,
    /// Contexts now serving the new generation.
    pub reloaded: Vec<usize>,
    /// Contexts still on an older generation (drain straggler, load
    /// failure, or stopped). Empty means the rollout fully converged.
    pub failed: Vec<usize>,
}

impl ReloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Validates new handler sets and rolls them across the pool.
#[derive(Clone)]
pub struct ReloadCoordinator {
    pool: ContextPool,
    parallelism: usize,
    drain_grace: Duration,
}

impl ReloadCoordinator {
    pub fn new(pool: ContextPool, config: &RuntimeConfig) -> Self {
        Self {
            pool,
            parallelism: config.reload_parallelism.max(1),
            drain_grace: config.drain_grace(),
        }
    }

    /// Proposes a new handler set built from `sources`.
    ///
    /// Compilation failures reject the proposal with
    /// [`BridgeError::CompileError`] and leave generation and every
    /// context binding untouched.
    pub async fn propose_reload(&self, sources: Vec<HandlerSource>) -> Result<ReloadReport> {
        // validate in a scratch context off the async runtime; nothing in
        // the pool is touched until this succeeds
        let probe = sources.clone();
        tokio::task::spawn_blocking(move || HandlerSet::compile(probe, 0).map(drop))
            .await
            .map_err(|e| BridgeError::CompileError(format!("validation task failed: {e}")))??;

        let generation = self.pool.next_generation();
        let set = tokio::task::spawn_blocking(move || HandlerSet::compile(sources, generation))
            .await
            .map_err(|e| BridgeError::CompileError(format!("validation task failed: {e}")))??;
        let set = Arc::new(set);
        self.pool.publish(Arc::clone(&set));
        tracing::info!(
            generation,
            routes = set.routes().len(),
            "handler set validated, starting rollout"
        );

        let targets = self.pool.live_slot_ids();
        let limiter = Arc::new(Semaphore::new(self.parallelism));
        let mut rollout = JoinSet::new();
        for id in targets {
            let pool = self.pool.clone();
            let set = Arc::clone(&set);
            let limiter = Arc::clone(&limiter);
            let grace = self.drain_grace;
            rollout.spawn(async move {
                let _permit = limiter
                    .acquire()
                    .await
                    .expect("reload limiter closed");
                let result = pool.drain_and_reload(id, set, grace).await;
                (id, result)
            });
        }

        let mut report = ReloadReport {
            generation,
            reloaded: Vec::new(),
            failed: Vec::new(),
        };
        while let Some(joined) = rollout.join_next().await {
            let (id, result) = joined.expect("rollout task panicked");
            match result {
                Ok(loaded) => {
                    debug_assert_eq!(loaded, generation);
                    report.reloaded.push(id);
                }
                Err(e) => {
                    tracing::warn!(context = id, error = %e, "context kept old generation");
                    report.failed.push(id);
                }
            }
        }
        report.reloaded.sort_unstable();
        report.failed.sort_unstable();

        if report.is_complete() {
            tracing::info!(generation, contexts = report.reloaded.len(), "reload complete");
        } else {
            tracing::warn!(
                generation,
                stragglers = report.failed.len(),
                "reload partially failed; mixed generations in service"
            );
        }
        Ok(report)
    }
}
