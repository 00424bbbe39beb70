//! Pool of execution contexts.
//!
//! The pool owns every context slot and all scheduling state. Selection is
//! least-recently-used among idle contexts: slots returning from work go to
//! the back of the idle queue and `select` pops from the front, so load
//! spreads evenly instead of hammering one warm context. The queue is
//! seeded in index order, which makes ties deterministic (lowest index
//! first).
//!
//! Contexts that keep faulting get evicted: once a slot accumulates
//! `fault_threshold` handler faults inside the sliding window, it is
//! retired and a fresh context is spawned into the same slot. A context
//! that misses a deadline or dies mid-request is sacrificed the same way,
//! immediately.

use crate::buffer::{BufferHandle, BufferPool};
use crate::runtime::handler_set::HandlerSet;
use crate::runtime::worker::{
    spawn_worker, ContextShared, ContextState, WorkerHandle, WorkerMsg,
};
use fastbridge_common::{BridgeError, Result, RuntimeConfig};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

/// Aggregate pool health, serializable for the monitoring collaborator.
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub idle_contexts: usize,
    pub busy_contexts: usize,
    pub stopped_contexts: usize,
    pub current_generation: u64,
    pub total_executed: u64,
    pub total_failed: u64,
}

struct Slot {
    handle: WorkerHandle,
    /// Timestamps of recent handler faults, pruned to the config window.
    faults: VecDeque<Instant>,
}

struct PoolInner {
    slots: Vec<Slot>,
    /// LRU order: front = least recently used idle context.
    idle: VecDeque<usize>,
}

pub(crate) struct PoolCore {
    config: RuntimeConfig,
    buffers: Arc<BufferPool>,
    inner: Mutex<PoolInner>,
    idle_notify: Notify,
    generation: AtomicU64,
    current_set: Mutex<Arc<HandlerSet>>,
    shutdown: AtomicBool,
}

impl PoolCore {
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("pool state poisoned")
    }

    fn requeue_idle(&self, id: usize) {
        let mut inner = self.lock_inner();
        let slot = &inner.slots[id];
        if slot.handle.shared.is_retired() || slot.handle.shared.state() != ContextState::Idle {
            return;
        }
        if !inner.idle.contains(&id) {
            inner.idle.push_back(id);
        }
        drop(inner);
        self.idle_notify.notify_one();
    }
}

/// Ordered collection of execution contexts with LRU scheduling.
///
/// Cheap to clone; all clones share the same pool state.
#[derive(Clone)]
pub struct ContextPool {
    core: Arc<PoolCore>,
}

impl ContextPool {
    /// Spawns `config.pool_size` contexts, each loading `set`, and waits
    /// for all of them to reach `Idle`.
    pub async fn new(
        config: RuntimeConfig,
        set: Arc<HandlerSet>,
        buffers: Arc<BufferPool>,
    ) -> Result<Self> {
        let pool_size = config.pool_size.max(1);
        let core = Arc::new(PoolCore {
            config,
            buffers: Arc::clone(&buffers),
            inner: Mutex::new(PoolInner {
                slots: Vec::with_capacity(pool_size),
                idle: VecDeque::with_capacity(pool_size),
            }),
            idle_notify: Notify::new(),
            generation: AtomicU64::new(set.generation()),
            current_set: Mutex::new(Arc::clone(&set)),
            shutdown: AtomicBool::new(false),
        });

        let mut ready = Vec::with_capacity(pool_size);
        {
            let mut inner = core.lock_inner();
            for id in 0..pool_size {
                let (handle, ready_rx) = spawn_worker(id, Arc::clone(&set), Arc::clone(&buffers));
                inner.slots.push(Slot {
                    handle,
                    faults: VecDeque::new(),
                });
                ready.push(ready_rx);
            }
        }

        for (id, ready_rx) in ready.into_iter().enumerate() {
            ready_rx
                .await
                .map_err(|_| BridgeError::ContextStopped)??;
            // ties in the idle queue resolve lowest-index-first
            core.lock_inner().idle.push_back(id);
        }

        tracing::info!(contexts = pool_size, "context pool started");
        Ok(Self { core })
    }

    /// Picks the least-recently-used idle context.
    ///
    /// With `wait = None` the call is non-blocking and fails with
    /// [`BridgeError::PoolExhausted`] when nothing is idle. With a wait
    /// budget it blocks until a context frees up or the budget elapses
    /// ([`BridgeError::Timeout`]).
    pub async fn select(&self, wait: Option<Duration>) -> Result<ContextLease> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            if self.core.shutdown.load(Ordering::Acquire) {
                return Err(BridgeError::Shutdown);
            }
            let notified = self.core.idle_notify.notified();
            if let Some(lease) = self.try_take_idle() {
                return Ok(lease);
            }
            let Some(deadline) = deadline else {
                return Err(BridgeError::PoolExhausted);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Timeout(wait.unwrap_or_default().as_millis() as u64));
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(BridgeError::Timeout(wait.unwrap_or_default().as_millis() as u64));
            }
        }
    }

    fn try_take_idle(&self) -> Option<ContextLease> {
        let mut inner = self.core.lock_inner();
        while let Some(id) = inner.idle.pop_front() {
            let slot = &inner.slots[id];
            // stale entries (retired or drained since queueing) are skipped
            if slot.handle.shared.is_retired()
                || slot.handle.shared.state() != ContextState::Idle
            {
                continue;
            }
            slot.handle.shared.set_state(ContextState::Busy);
            let handle = slot.handle.clone();
            return Some(ContextLease {
                core: Arc::clone(&self.core),
                handle,
                defused: false,
            });
        }
        None
    }

    /// Records a handler fault against a context; evicts and replaces it
    /// once the fault count crosses the configured threshold inside the
    /// window. A context that stopped outright goes through
    /// [`sacrifice`](Self::sacrifice) instead.
    pub async fn record_fault(&self, id: usize) {
        let evict = {
            let mut inner = self.core.lock_inner();
            let window = self.core.config.fault_window();
            let threshold = self.core.config.fault_threshold as usize;
            let now = Instant::now();
            let slot = &mut inner.slots[id];
            slot.faults.push_back(now);
            while let Some(front) = slot.faults.front() {
                if now.duration_since(*front) > window {
                    slot.faults.pop_front();
                } else {
                    break;
                }
            }
            slot.faults.len() >= threshold
        };
        if evict {
            tracing::warn!(context = id, "context crossed fault threshold, evicting");
            self.replace_slot(id).await;
        }
    }

    /// Sacrifices a context that can no longer be trusted (missed its
    /// deadline or died mid-request): the slot is retired and refilled
    /// immediately. A worker thread still grinding on a handler is left to
    /// finish on its own and its reply is discarded.
    pub async fn sacrifice(&self, id: usize) {
        tracing::warn!(context = id, "sacrificing context, replacing slot");
        self.replace_slot(id).await;
    }

    /// Stops a worker thread without retiring its slot, leaving the slot
    /// schedulable so the dead-context dispatch path can be exercised.
    #[cfg(test)]
    pub(crate) async fn sever_worker(&self, id: usize) {
        let shared = {
            let inner = self.core.lock_inner();
            let slot = &inner.slots[id];
            let _ = slot.handle.sender.send(WorkerMsg::Stop);
            Arc::clone(&slot.handle.shared)
        };
        while shared.state() != ContextState::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shared.set_state(ContextState::Idle);
    }

    async fn replace_slot(&self, id: usize) {
        let set = self.current_set();
        let ready_rx = {
            let mut inner = self.core.lock_inner();
            let inner = &mut *inner;
            let slot = &mut inner.slots[id];
            slot.handle.shared.retire();
            let _ = slot.handle.sender.send(WorkerMsg::Stop);
            inner.idle.retain(|&queued| queued != id);

            let (handle, ready_rx) =
                spawn_worker(id, set, Arc::clone(&self.core.buffers));
            inner.slots[id] = Slot {
                handle,
                faults: VecDeque::new(),
            };
            ready_rx
        };

        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            match ready_rx.await {
                Ok(Ok(())) => {
                    core.requeue_idle(id);
                    tracing::info!(context = id, "replacement context is idle");
                }
                Ok(Err(e)) => {
                    // pool capacity degrades but the process stays up
                    tracing::error!(context = id, error = %e, "replacement context failed to start; pool degraded");
                }
                Err(_) => {
                    tracing::error!(context = id, "replacement context vanished; pool degraded");
                }
            }
        });
    }

    /// Drains one context and swaps it to `set`, waiting up to `grace`.
    ///
    /// The slot is taken out of rotation first, so it finishes its current
    /// request (messages are ordered) and reloads before any new work can
    /// land on it. On a load failure the old handler set stays active and
    /// the context returns to rotation on its old generation.
    pub(crate) async fn drain_and_reload(
        &self,
        id: usize,
        set: Arc<HandlerSet>,
        grace: Duration,
    ) -> Result<u64> {
        let sender = {
            let mut inner = self.core.lock_inner();
            let inner = &mut *inner;
            let slot = &inner.slots[id];
            let state = slot.handle.shared.state();
            if slot.handle.shared.is_retired() || state == ContextState::Stopped {
                return Err(BridgeError::ContextStopped);
            }
            slot.handle.shared.set_state(ContextState::Draining);
            inner.idle.retain(|&queued| queued != id);
            slot.handle.sender.clone()
        };

        let (reply, mut rx) = oneshot::channel();
        if sender.send(WorkerMsg::Load { set, reply }).is_err() {
            return Err(BridgeError::ContextStopped);
        }

        match tokio::time::timeout(grace, &mut rx).await {
            Ok(Ok(Ok(generation))) => {
                self.finish_drain(id, true);
                Ok(generation)
            }
            Ok(Ok(Err(e))) => {
                // all-or-nothing load: old bindings still active
                self.finish_drain(id, true);
                Err(e)
            }
            Ok(Err(_)) => Err(BridgeError::ContextStopped),
            Err(_) => {
                // straggler: keep waiting off to the side so the slot
                // eventually rejoins rotation (or stops) on its own
                let pool = self.clone();
                tokio::spawn(async move {
                    match rx.await {
                        Ok(Ok(_)) | Ok(Err(_)) => pool.finish_drain(id, true),
                        Err(_) => {
                            tracing::warn!(context = id, "draining context never responded");
                        }
                    }
                });
                Err(BridgeError::Timeout(grace.as_millis() as u64))
            }
        }
    }

    fn finish_drain(&self, id: usize, requeue: bool) {
        {
            let inner = self.core.lock_inner();
            let shared = &inner.slots[id].handle.shared;
            if shared.is_retired() || shared.state() == ContextState::Stopped {
                return;
            }
            shared.set_state(ContextState::Idle);
        }
        if requeue {
            self.core.requeue_idle(id);
        }
    }

    /// Grows or shrinks the pool to `target` contexts.
    ///
    /// Growth reuses stopped slots before appending new ones and waits for
    /// each new context to reach `Idle`. Shrinking drains from the highest
    /// index down; contexts finish their current request and stop, they
    /// are never force-killed.
    pub async fn resize(&self, target: usize) -> Result<()> {
        let target = target.max(1);
        let set = self.current_set();

        // shrink: drain highest-index live slots beyond the target
        let mut live: Vec<usize> = {
            let inner = self.core.lock_inner();
            inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    !s.handle.shared.is_retired()
                        && s.handle.shared.state() != ContextState::Stopped
                })
                .map(|(id, _)| id)
                .collect()
        };

        while live.len() > target {
            let id = live.pop().expect("live set not empty");
            let mut inner = self.core.lock_inner();
            let inner = &mut *inner;
            let slot = &inner.slots[id];
            slot.handle.shared.set_state(ContextState::Draining);
            let _ = slot.handle.sender.send(WorkerMsg::Stop);
            inner.idle.retain(|&queued| queued != id);
            tracing::info!(context = id, "context draining for pool shrink");
        }

        // grow: refill stopped slots first, then append
        while live.len() < target {
            let (id, ready_rx) = {
                let mut inner = self.core.lock_inner();
                let reusable = inner.slots.iter().position(|s| {
                    !live.contains(&s.handle.shared.id())
                        && (s.handle.shared.is_retired()
                            || s.handle.shared.state() == ContextState::Stopped)
                });
                match reusable {
                    Some(id) => {
                        let (handle, ready_rx) =
                            spawn_worker(id, Arc::clone(&set), Arc::clone(&self.core.buffers));
                        inner.slots[id] = Slot {
                            handle,
                            faults: VecDeque::new(),
                        };
                        (id, ready_rx)
                    }
                    None => {
                        let id = inner.slots.len();
                        let (handle, ready_rx) =
                            spawn_worker(id, Arc::clone(&set), Arc::clone(&self.core.buffers));
                        inner.slots.push(Slot {
                            handle,
                            faults: VecDeque::new(),
                        });
                        (id, ready_rx)
                    }
                }
            };
            ready_rx
                .await
                .map_err(|_| BridgeError::ContextStopped)??;
            self.core.requeue_idle(id);
            live.push(id);
        }

        tracing::info!(contexts = target, "pool resized");
        Ok(())
    }

    /// Current published generation.
    pub fn generation(&self) -> u64 {
        self.core.generation.load(Ordering::Acquire)
    }

    /// Reserves the next generation number.
    pub(crate) fn next_generation(&self) -> u64 {
        self.core.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Publishes `set` as the handler set for replacement contexts.
    pub(crate) fn publish(&self, set: Arc<HandlerSet>) {
        *self
            .core
            .current_set
            .lock()
            .expect("handler set lock poisoned") = set;
    }

    pub(crate) fn current_set(&self) -> Arc<HandlerSet> {
        Arc::clone(
            &self
                .core
                .current_set
                .lock()
                .expect("handler set lock poisoned"),
        )
    }

    /// Identities of slots currently eligible for a rolling reload.
    pub(crate) fn live_slot_ids(&self) -> Vec<usize> {
        let inner = self.core.lock_inner();
        inner
            .slots
            .iter()
            .filter(|s| {
                !s.handle.shared.is_retired()
                    && s.handle.shared.state() != ContextState::Stopped
            })
            .map(|s| s.handle.shared.id())
            .collect()
    }

    pub(crate) fn slot_generation(&self, id: usize) -> u64 {
        self.core.lock_inner().slots[id].handle.shared.generation()
    }

    pub fn health(&self) -> HealthSnapshot {
        let inner = self.core.lock_inner();
        let mut snapshot = HealthSnapshot {
            idle_contexts: 0,
            busy_contexts: 0,
            stopped_contexts: 0,
            current_generation: self.generation(),
            total_executed: 0,
            total_failed: 0,
        };
        for slot in &inner.slots {
            let shared = &slot.handle.shared;
            snapshot.total_executed += shared.executed();
            snapshot.total_failed += shared.failed();
            match shared.state() {
                ContextState::Idle => snapshot.idle_contexts += 1,
                ContextState::Busy | ContextState::Draining | ContextState::Starting => {
                    snapshot.busy_contexts += 1
                }
                ContextState::Stopped => snapshot.stopped_contexts += 1,
            }
        }
        snapshot
    }

    /// Drains every context and stops accepting new selections.
    pub async fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
        {
            let mut inner = self.core.lock_inner();
            inner.idle.clear();
            for slot in &inner.slots {
                if slot.handle.shared.state() != ContextState::Stopped {
                    slot.handle.shared.set_state(ContextState::Draining);
                    let _ = slot.handle.sender.send(WorkerMsg::Stop);
                }
            }
        }
        // wake blocked selectors so they observe the shutdown
        self.core.idle_notify.notify_waiters();
        tracing::info!("context pool shut down");
    }
}

/// Exclusive use of one context, returned to the idle queue on drop.
pub struct ContextLease {
    core: Arc<PoolCore>,
    handle: WorkerHandle,
    defused: bool,
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("context_id", &self.handle.shared.id())
            .field("defused", &self.defused)
            .finish_non_exhaustive()
    }
}

impl ContextLease {
    pub fn context_id(&self) -> usize {
        self.handle.shared.id()
    }

    /// Generation of the handler set loaded in the leased context.
    pub fn generation(&self) -> u64 {
        self.handle.shared.generation()
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.handle.shared
    }

    /// Hands the payload to the leased context and awaits the result
    /// buffer. Blocks for the full duration of handler execution; deadline
    /// enforcement belongs to the dispatcher.
    pub(crate) async fn execute(&self, route: &str, payload: BufferHandle) -> Result<BufferHandle> {
        let (reply, rx) = oneshot::channel();
        if let Err(rejected) = self.handle.sender.send(WorkerMsg::Execute {
            route: route.to_string(),
            payload,
            reply,
        }) {
            // worker is gone; recycle the payload it never took
            if let WorkerMsg::Execute { payload, .. } = rejected.0 {
                self.core.buffers.release(payload);
            }
            return Err(BridgeError::ContextStopped);
        }
        rx.await.map_err(|_| BridgeError::ContextStopped)?
    }

    /// Consumes the lease without returning the context to rotation; used
    /// when the context is about to be sacrificed.
    pub(crate) fn defuse(mut self) -> usize {
        self.defused = true;
        self.handle.shared.id()
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        let shared = &self.handle.shared;
        if !shared.is_retired() && shared.state() == ContextState::Busy {
            shared.set_state(ContextState::Idle);
            self.core.requeue_idle(shared.id());
        }
    }
}
