//! Bridge dispatcher: the single owner of a request's lifecycle.
//!
//! Every inbound request becomes a [`RequestTicket`]: payload buffer,
//! deadline, assigned context, completion. The dispatcher builds the
//! transfer buffer, selects a context, hands the buffer off, and awaits
//! the result under the ticket's deadline. No other component originates
//! tickets.
//!
//! Deadline misses are treated as a threat to pool throughput: the ticket
//! fails with `Timeout` and the context that missed it is sacrificed
//! rather than trusted again.

use crate::buffer::{BufferHandle, BufferPool, Encoding};
use crate::pool::ContextPool;
use fastbridge_common::{BridgeError, Result, RuntimeConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static TICKET_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One in-flight request tracked through the core.
///
/// Created at dispatch, destroyed after the result is delivered or the
/// ticket times out.
#[derive(Debug)]
pub struct RequestTicket {
    pub id: u64,
    pub route: String,
    pub deadline: Duration,
    /// Pool generation at dispatch time; the serving context may be newer
    /// during a rolling reload, never older than its own loaded set.
    pub generation: u64,
    pub assigned_context: Option<usize>,
    created: Instant,
}

impl RequestTicket {
    fn new(route: &str, deadline: Duration, generation: u64) -> Self {
        Self {
            id: TICKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            route: route.to_string(),
            deadline,
            generation,
            assigned_context: None,
            created: Instant::now(),
        }
    }

    /// Time left before the deadline.
    fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.created.elapsed())
    }
}

/// Receives completed native requests and routes them through the pool.
#[derive(Clone)]
pub struct BridgeDispatcher {
    pool: ContextPool,
    buffers: Arc<BufferPool>,
    default_deadline: Duration,
}

impl BridgeDispatcher {
    pub fn new(pool: ContextPool, buffers: Arc<BufferPool>, config: &RuntimeConfig) -> Self {
        Self {
            pool,
            buffers,
            default_deadline: config.request_timeout(),
        }
    }

    /// Dispatches one request and awaits its result buffer.
    ///
    /// `deadline` covers the whole journey: context selection plus handler
    /// execution. `None` applies the configured default. The input buffer
    /// is consumed by the executing context; the caller owns the returned
    /// result handle and must release it back to the buffer pool.
    pub async fn dispatch(
        &self,
        route: &str,
        body: &[u8],
        encoding: Encoding,
        deadline: Option<Duration>,
    ) -> Result<BufferHandle> {
        let mut ticket = RequestTicket::new(
            route,
            deadline.unwrap_or(self.default_deadline),
            self.pool.generation(),
        );
        tracing::debug!(
            ticket = ticket.id,
            route,
            bytes = body.len(),
            "dispatching request"
        );

        // a structured payload that does not parse is a caller error and
        // never reaches a context
        if encoding == Encoding::Json {
            serde_json::from_slice::<serde::de::IgnoredAny>(body)
                .map_err(|e| BridgeError::Encoding(format!("request payload: {e}")))?;
        }

        let mut buffer = self.buffers.acquire(body.len(), encoding);
        buffer.write(body)?;
        let payload = buffer.handoff();

        let lease = match self.pool.select(Some(ticket.remaining())).await {
            Ok(lease) => lease,
            Err(e) => {
                // no context ever took the payload; recycle it here
                self.buffers.release(payload);
                return Err(e);
            }
        };
        ticket.assigned_context = Some(lease.context_id());

        match tokio::time::timeout(ticket.remaining(), lease.execute(route, payload)).await {
            Ok(Ok(result)) => {
                tracing::debug!(
                    ticket = ticket.id,
                    context = ticket.assigned_context,
                    elapsed_ms = ticket.created.elapsed().as_millis() as u64,
                    "request completed"
                );
                Ok(result)
            }
            Ok(Err(BridgeError::ContextStopped)) => {
                // the context died under this request; replace the slot and
                // surface the ticket as a handler fault
                let id = lease.defuse();
                self.pool.sacrifice(id).await;
                tracing::warn!(
                    ticket = ticket.id,
                    context = id,
                    "context stopped mid-request, replacing"
                );
                Err(BridgeError::HandlerPanicked {
                    route: route.to_string(),
                    message: "execution context stopped".into(),
                })
            }
            Ok(Err(e)) => {
                let id = lease.context_id();
                drop(lease);
                if e.is_context_fault() {
                    self.pool.record_fault(id).await;
                }
                tracing::debug!(ticket = ticket.id, context = id, error = %e, "request failed");
                Err(e)
            }
            Err(_) => {
                // the context is still grinding on the handler; sacrifice
                // it so the stuck work cannot shrink pool capacity
                let id = lease.defuse();
                self.pool.sacrifice(id).await;
                let millis = ticket.deadline.as_millis() as u64;
                tracing::warn!(ticket = ticket.id, context = id, "request deadline exceeded");
                Err(BridgeError::Timeout(millis))
            }
        }
    }

    /// Dispatch returning the result as plain bytes, releasing the result
    /// buffer internally. The handoff contract for callers that do not
    /// manage buffers themselves.
    pub async fn dispatch_bytes(
        &self,
        route: &str,
        body: &[u8],
        encoding: Encoding,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let result = self.dispatch(route, body, encoding, deadline).await?;
        Ok(result.into_vec(&self.buffers))
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }
}
