//! Dedicated worker thread hosting one execution context.
//!
//! Boa's `Context` is not `Send`, so every execution context lives on its
//! own OS thread and is driven through a message channel. The channel also
//! gives the drain guarantee for free: messages are processed strictly in
//! order, so a `Load` queued behind an `Execute` takes effect only after
//! the in-flight request finishes.
//!
//! Lifecycle: `Starting -> Idle <-> Busy -> Draining -> Stopped`. The pool
//! owns the Idle/Busy/Draining scheduling states; the worker itself only
//! reports readiness, load results, and the terminal `Stopped` transition
//! when its interpreter state is beyond recovery.

use crate::buffer::{BufferHandle, BufferPool, Encoding};
use crate::runtime::handler_set::HandlerSet;
use crate::runtime::script::{HandlerArgs, ScriptContext};
use fastbridge_common::{BridgeError, Result};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Lifecycle state of an execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ContextState {
    Starting,
    Idle,
    Busy,
    Draining,
    Stopped,
}

impl ContextState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ContextState::Starting,
            1 => ContextState::Idle,
            2 => ContextState::Busy,
            3 => ContextState::Draining,
            _ => ContextState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ContextState::Starting => 0,
            ContextState::Idle => 1,
            ContextState::Busy => 2,
            ContextState::Draining => 3,
            ContextState::Stopped => 4,
        }
    }
}

/// State shared between a worker thread, its pool slot, and in-flight
/// leases.
#[derive(Debug)]
pub struct ContextShared {
    id: usize,
    state: AtomicU8,
    generation: AtomicU64,
    /// Set when the slot has been replaced; the old worker exits on sight
    /// and its late replies are discarded.
    retired: AtomicBool,
    executed: AtomicU64,
    failed: AtomicU64,
}

impl ContextShared {
    fn new(id: usize, generation: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(ContextState::Starting.as_u8()),
            generation: AtomicU64::new(generation),
            retired: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ContextState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Generation of the handler set this context currently has loaded.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.set_state(ContextState::Stopped);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Messages accepted by a worker thread, processed strictly in order.
pub(crate) enum WorkerMsg {
    Execute {
        route: String,
        payload: BufferHandle,
        reply: oneshot::Sender<Result<BufferHandle>>,
    },
    Load {
        set: Arc<HandlerSet>,
        reply: oneshot::Sender<Result<u64>>,
    },
    Stop,
}

/// Sending half of a worker's channel plus its shared state.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub shared: Arc<ContextShared>,
    pub sender: mpsc::UnboundedSender<WorkerMsg>,
}

/// Spawns a worker thread that compiles `set` and then serves messages.
///
/// Returns the handle immediately; the readiness receiver resolves once
/// the initial compile finishes (`Ok` puts the context at `Idle`, an error
/// leaves it `Stopped`).
pub(crate) fn spawn_worker(
    id: usize,
    set: Arc<HandlerSet>,
    buffers: Arc<BufferPool>,
) -> (WorkerHandle, oneshot::Receiver<Result<()>>) {
    let shared = Arc::new(ContextShared::new(id, set.generation()));
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let thread_shared = Arc::clone(&shared);
    std::thread::Builder::new()
        .name(format!("fastbridge-ctx-{id}"))
        .spawn(move || worker_main(thread_shared, set, buffers, rx, ready_tx))
        .expect("failed to spawn context worker thread");

    (WorkerHandle { shared, sender: tx }, ready_rx)
}

fn worker_main(
    shared: Arc<ContextShared>,
    set: Arc<HandlerSet>,
    buffers: Arc<BufferPool>,
    mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut script = match ScriptContext::compile(set.sources()) {
        Ok(script) => {
            shared.set_state(ContextState::Idle);
            let _ = ready.send(Ok(()));
            script
        }
        Err(e) => {
            tracing::error!(context = shared.id(), error = %e, "context failed to start");
            shared.set_state(ContextState::Stopped);
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(msg) = rx.blocking_recv() {
        if shared.is_retired() {
            break;
        }
        match msg {
            WorkerMsg::Execute {
                route,
                payload,
                reply,
            } => {
                let result = run_handler(&mut script, &shared, &route, payload, &buffers);
                match &result {
                    Ok(_) => shared.executed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => shared.failed.fetch_add(1, Ordering::Relaxed),
                };
                let corrupted = matches!(
                    &result,
                    Err(BridgeError::ContextStopped)
                );
                let _ = reply.send(result);
                if corrupted {
                    // interpreter state is gone; stop serving
                    break;
                }
            }
            WorkerMsg::Load { set, reply } => {
                match ScriptContext::compile(set.sources()) {
                    Ok(fresh) => {
                        script = fresh;
                        shared
                            .generation
                            .store(set.generation(), Ordering::Release);
                        tracing::debug!(
                            context = shared.id(),
                            generation = set.generation(),
                            "context reloaded"
                        );
                        let _ = reply.send(Ok(set.generation()));
                    }
                    Err(e) => {
                        // previous handler set stays active
                        tracing::warn!(
                            context = shared.id(),
                            error = %e,
                            "context reload failed, keeping old handler set"
                        );
                        let _ = reply.send(Err(e));
                    }
                }
            }
            WorkerMsg::Stop => break,
        }
    }

    if !shared.is_retired() {
        shared.set_state(ContextState::Stopped);
    }
    tracing::debug!(context = shared.id(), "context worker exited");
}

/// Decodes the payload, invokes the handler, and encodes the result into a
/// fresh transfer buffer.
///
/// A panic out of the interpreter marks the context corrupted
/// ([`BridgeError::ContextStopped`]); a script-level throw is an ordinary
/// `HandlerPanicked` and leaves the context serviceable.
fn run_handler(
    script: &mut ScriptContext,
    shared: &ContextShared,
    route: &str,
    payload: BufferHandle,
    buffers: &BufferPool,
) -> Result<BufferHandle> {
    let encoding = payload.encoding();
    let args = match encoding {
        Encoding::Json => {
            let json = serde_json::from_slice(payload.as_slice())
                .map_err(|e| BridgeError::Encoding(format!("request payload: {e}")))?;
            HandlerArgs::Json(json)
        }
        Encoding::Bytes => HandlerArgs::Bytes(payload.as_slice().to_vec()),
    };
    // the request leg ends here; recycle the input buffer before running
    buffers.release(payload);

    let outcome = catch_unwind(AssertUnwindSafe(|| script.invoke(route, args)));
    let result = match outcome {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!(
                context = shared.id(),
                route,
                "interpreter panicked; context marked stopped"
            );
            shared.set_state(ContextState::Stopped);
            return Err(BridgeError::ContextStopped);
        }
    };

    encode_result(&result, encoding, buffers)
}

fn encode_result(
    result: &serde_json::Value,
    encoding: Encoding,
    buffers: &BufferPool,
) -> Result<BufferHandle> {
    let bytes = match encoding {
        Encoding::Json => serde_json::to_vec(result)?,
        Encoding::Bytes => match result {
            // byte handlers return arrays of numbers; anything else is
            // serialized as JSON text
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    let b = item
                        .as_u64()
                        .filter(|&b| b <= u8::MAX as u64)
                        .ok_or_else(|| {
                            BridgeError::Encoding("byte result out of range".into())
                        })?;
                    out.push(b as u8);
                }
                out
            }
            other => serde_json::to_vec(other)?,
        },
    };

    let mut buffer = buffers.acquire(bytes.len(), encoding);
    buffer.write(&bytes)?;
    Ok(buffer.handoff())
}
