//! Future bridge: native async operations behind a single host awaitable.
//!
//! Every async native call becomes a pending operation identified by an
//! operation handle. Its lifecycle is
//!
//! ```text
//! Created ──poll──▶ Polled ──complete──▶ Completed ──free──▶ (gone)
//!    │                 │
//!    └─────cancel──────┴──────────────▶ Cancelled ──free──▶ (gone)
//! ```
//!
//! The terminal slot is single-assignment: whichever of `complete` and
//! `cancel` lands first wins, and the loser is discarded. The continuation
//! registered by `poll` receives the terminal [`Outcome`] exactly once, and
//! always through the call invoker, never on the caller's stack.
//!
//! One implementation serves every result kind; payloads travel as the
//! tagged union [`ReturnValue`].

use crate::buffer::NativeBuffer;
use crate::error::{call_status, BridgeError, Result};
use crate::invoker::CallInvoker;
use crate::metrics::BridgeMetrics;
use crate::value::{HostValue, Scalar, ScalarKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Result kind of an async operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    /// No value
    Void,
    /// Fixed-width number
    Scalar(ScalarKind),
    /// Handle of a newly created native object
    Pointer,
    /// Serialized payload
    Buffer,
}

impl ResultKind {
    /// Suffix used by the per-kind entry points (`poll_u8`, `poll_rust_buffer`, ...)
    pub fn suffix(&self) -> &'static str {
        match self {
            ResultKind::Void => "void",
            ResultKind::Scalar(kind) => kind.name(),
            ResultKind::Pointer => "pointer",
            ResultKind::Buffer => "rust_buffer",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Payload of a completed operation
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// No value
    Void,
    /// Fixed-width number
    Scalar(Scalar),
    /// Id of a native object handle
    Pointer(u64),
    /// Serialized payload
    Buffer(NativeBuffer),
}

impl ReturnValue {
    /// The kind of this payload
    pub fn kind(&self) -> ResultKind {
        match self {
            ReturnValue::Void => ResultKind::Void,
            ReturnValue::Scalar(s) => ResultKind::Scalar(s.kind()),
            ReturnValue::Pointer(_) => ResultKind::Pointer,
            ReturnValue::Buffer(_) => ResultKind::Buffer,
        }
    }

    /// Lower into a host value, transferring buffer ownership to the host
    pub fn into_host(self) -> HostValue {
        match self {
            ReturnValue::Void => HostValue::Undefined,
            ReturnValue::Scalar(s) => s.to_host(),
            ReturnValue::Pointer(id) => HostValue::BigUint(id),
            ReturnValue::Buffer(b) => HostValue::Bytes(b.into_vec()),
        }
    }
}

/// Id of a native object returned by an async constructor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectPointer(pub u64);

/// Rust types that can be the result of an async native operation
pub trait FfiReturn: Sized + Send + 'static {
    /// Result kind of this type
    const KIND: ResultKind;

    /// Wrap into the tagged payload
    fn into_return_value(self) -> ReturnValue;

    /// Unwrap from the tagged payload
    fn from_return_value(value: ReturnValue) -> Result<Self>;
}

impl FfiReturn for () {
    const KIND: ResultKind = ResultKind::Void;

    fn into_return_value(self) -> ReturnValue {
        ReturnValue::Void
    }

    fn from_return_value(value: ReturnValue) -> Result<Self> {
        match value {
            ReturnValue::Void => Ok(()),
            other => Err(kind_mismatch(Self::KIND, other.kind())),
        }
    }
}

macro_rules! scalar_return {
    ($ty:ty, $variant:ident) => {
        impl FfiReturn for $ty {
            const KIND: ResultKind = ResultKind::Scalar(ScalarKind::$variant);

            fn into_return_value(self) -> ReturnValue {
                ReturnValue::Scalar(Scalar::$variant(self))
            }

            fn from_return_value(value: ReturnValue) -> Result<Self> {
                match value {
                    ReturnValue::Scalar(Scalar::$variant(v)) => Ok(v),
                    other => Err(kind_mismatch(Self::KIND, other.kind())),
                }
            }
        }
    };
}

scalar_return!(u8, U8);
scalar_return!(i8, I8);
scalar_return!(u16, U16);
scalar_return!(i16, I16);
scalar_return!(u32, U32);
scalar_return!(i32, I32);
scalar_return!(u64, U64);
scalar_return!(i64, I64);
scalar_return!(f32, F32);
scalar_return!(f64, F64);

impl FfiReturn for ObjectPointer {
    const KIND: ResultKind = ResultKind::Pointer;

    fn into_return_value(self) -> ReturnValue {
        ReturnValue::Pointer(self.0)
    }

    fn from_return_value(value: ReturnValue) -> Result<Self> {
        match value {
            ReturnValue::Pointer(id) => Ok(ObjectPointer(id)),
            other => Err(kind_mismatch(Self::KIND, other.kind())),
        }
    }
}

impl FfiReturn for NativeBuffer {
    const KIND: ResultKind = ResultKind::Buffer;

    fn into_return_value(self) -> ReturnValue {
        ReturnValue::Buffer(self)
    }

    fn from_return_value(value: ReturnValue) -> Result<Self> {
        match value {
            ReturnValue::Buffer(b) => Ok(b),
            other => Err(kind_mismatch(Self::KIND, other.kind())),
        }
    }
}

fn kind_mismatch(expected: ResultKind, actual: ResultKind) -> BridgeError {
    BridgeError::encode(format!("Expected a {} payload but got {}", expected, actual))
}

/// Terminal state of a pending operation, as delivered to the host
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completed with a value
    Ready(ReturnValue),
    /// Completed with an error
    Failed(BridgeError),
    /// Cancelled before completion
    Cancelled,
}

impl Outcome {
    /// Call status reported to the host
    pub fn call_status(&self) -> i8 {
        match self {
            Outcome::Ready(_) => call_status::SUCCESS,
            Outcome::Failed(e) => e.call_status(),
            Outcome::Cancelled => call_status::CANCELLED,
        }
    }

    /// Whether the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Lift into a typed result; `None` means cancelled
    pub fn into_result<T: FfiReturn>(self) -> Result<Option<T>> {
        match self {
            Outcome::Ready(value) => T::from_return_value(value).map(Some),
            Outcome::Failed(e) => Err(e),
            Outcome::Cancelled => Ok(None),
        }
    }
}

/// Lifecycle phase of a pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, no continuation registered
    Created,
    /// Continuation registered, not yet terminal
    Polled,
    /// Completed with a value or error
    Completed,
    /// Cancelled
    Cancelled,
}

/// What happened to a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The continuation was scheduled on the host
    Delivered,
    /// Stored until the host polls
    Stored,
    /// Cancellation won the race; the payload was dropped
    Discarded,
}

/// Single-shot continuation receiving the terminal outcome
pub type Continuation = Box<dyn FnOnce(Outcome) + Send + 'static>;

struct OperationState {
    phase: Phase,
    terminal: Option<Outcome>,
    continuation: Option<Continuation>,
    delivered: bool,
    abort: Option<AbortHandle>,
}

impl OperationState {
    fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::Cancelled)
    }

    // Pair the terminal outcome with the continuation once both are present.
    fn take_delivery(&mut self) -> Option<(Continuation, Outcome)> {
        if self.continuation.is_some() && self.terminal.is_some() {
            self.delivered = true;
            let continuation = self.continuation.take()?;
            let outcome = self.terminal.take()?;
            Some((continuation, outcome))
        } else {
            None
        }
    }
}

struct Operation {
    kind: ResultKind,
    state: Mutex<OperationState>,
}

/// Table of pending operations for one module
pub struct FutureBridge {
    operations: DashMap<u64, Arc<Operation>>,
    next_id: AtomicU64,
    reserved: AtomicUsize,
    invoker: Arc<dyn CallInvoker>,
    runtime: RuntimeHandle,
    metrics: Arc<BridgeMetrics>,
    max_pending: usize,
}

impl FutureBridge {
    /// Create a bridge running native work on `runtime` and resuming the host via `invoker`
    pub fn new(
        invoker: Arc<dyn CallInvoker>,
        runtime: RuntimeHandle,
        metrics: Arc<BridgeMetrics>,
        max_pending: usize,
    ) -> Self {
        Self {
            operations: DashMap::new(),
            next_id: AtomicU64::new(1),
            reserved: AtomicUsize::new(0),
            invoker,
            runtime,
            metrics,
            max_pending,
        }
    }

    /// Create a pending operation whose completion native code delivers itself
    pub fn create(&self, kind: ResultKind) -> Result<u64> {
        // Reserve the slot before inserting so concurrent creates cannot overshoot.
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_pending).then_some(live + 1)
            })
            .map_err(|_| BridgeError::resource_limit("pending operations", self.max_pending))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.operations.insert(
            id,
            Arc::new(Operation {
                kind,
                state: Mutex::new(OperationState {
                    phase: Phase::Created,
                    terminal: None,
                    continuation: None,
                    delivered: false,
                    abort: None,
                }),
            }),
        );
        self.metrics.record_future_started();
        trace!(operation = id, kind = %kind, "Created pending operation");
        Ok(id)
    }

    /// Run a native future on the worker runtime and complete the operation with its result
    pub fn spawn<T, F>(self: &Arc<Self>, future: F) -> Result<u64>
    where
        T: FfiReturn,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.create(T::KIND)?;

        let native = self.runtime.spawn(future);
        let abort = native.abort_handle();
        let bridge = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = match native.await {
                Ok(result) => result.map(FfiReturn::into_return_value),
                Err(e) if e.is_panic() => Err(BridgeError::panic(format!(
                    "Native operation {} panicked",
                    id
                ))),
                // Aborted by cancel or free; the terminal slot is already settled.
                Err(_) => return,
            };
            if let Err(e) = bridge.complete(id, result) {
                debug!(operation = id, error = %e, "Completion not accepted");
            }
        });

        if let Some(operation) = self.operations.get(&id) {
            let mut state = operation.state.lock();
            if state.is_terminal() {
                abort.abort();
            } else {
                state.abort = Some(abort);
            }
        }
        Ok(id)
    }

    /// Register the continuation that receives the terminal outcome
    pub fn poll(&self, id: u64, continuation: Continuation) -> Result<()> {
        let operation = self.operation(id)?;
        let delivery = {
            let mut state = operation.state.lock();
            if state.delivered || state.continuation.is_some() {
                return Err(BridgeError::protocol_violation(format!(
                    "Operation {} has already been polled",
                    id
                ))
                .with_handle(id));
            }
            state.continuation = Some(continuation);
            if state.phase == Phase::Created {
                state.phase = Phase::Polled;
            }
            state.take_delivery()
        };

        if let Some(delivery) = delivery {
            self.deliver(id, delivery);
        }
        Ok(())
    }

    /// Receive the terminal outcome through a channel instead of a callback
    pub fn subscribe(&self, id: u64) -> Result<oneshot::Receiver<Outcome>> {
        let (sender, receiver) = oneshot::channel();
        self.poll(
            id,
            Box::new(move |outcome| {
                let _ = sender.send(outcome);
            }),
        )?;
        Ok(receiver)
    }

    /// Request cancellation; returns whether cancellation won the race
    pub fn cancel(&self, id: u64) -> Result<bool> {
        let operation = self.operation(id)?;
        let delivery = {
            let mut state = operation.state.lock();
            if state.is_terminal() {
                return Ok(false);
            }
            state.phase = Phase::Cancelled;
            state.terminal = Some(Outcome::Cancelled);
            if let Some(abort) = state.abort.take() {
                abort.abort();
            }
            state.take_delivery()
        };

        self.metrics.record_future_cancelled();
        debug!(operation = id, "Cancelled pending operation");
        if let Some(delivery) = delivery {
            self.deliver(id, delivery);
        }
        Ok(true)
    }

    /// Deliver the final payload or error of an operation
    pub fn complete(&self, id: u64, result: Result<ReturnValue>) -> Result<Resolution> {
        let operation = self.operation(id)?;
        if let Ok(value) = &result {
            if value.kind() != operation.kind {
                return Err(kind_mismatch(operation.kind, value.kind()).with_handle(id));
            }
        }

        let delivery = {
            let mut state = operation.state.lock();
            match state.phase {
                Phase::Completed => {
                    return Err(BridgeError::protocol_violation(format!(
                        "Operation {} completed twice",
                        id
                    ))
                    .with_handle(id));
                }
                Phase::Cancelled => {
                    self.metrics.record_future_discarded();
                    trace!(operation = id, "Discarded completion after cancellation");
                    return Ok(Resolution::Discarded);
                }
                Phase::Created | Phase::Polled => {}
            }

            state.phase = Phase::Completed;
            state.abort = None;
            state.terminal = Some(match result {
                Ok(value) => Outcome::Ready(value),
                Err(e) => Outcome::Failed(e),
            });
            state.take_delivery()
        };

        self.metrics.record_future_completed();
        match delivery {
            Some(delivery) => {
                self.deliver(id, delivery);
                Ok(Resolution::Delivered)
            }
            None => Ok(Resolution::Stored),
        }
    }

    /// Typed convenience over [`FutureBridge::complete`]
    pub fn complete_with<T: FfiReturn>(&self, id: u64, result: Result<T>) -> Result<Resolution> {
        self.complete(id, result.map(FfiReturn::into_return_value))
    }

    /// Release the operation
    pub fn free(&self, id: u64) -> Result<()> {
        match self.operations.entry(id) {
            Entry::Occupied(entry) => {
                {
                    let mut state = entry.get().state.lock();
                    if state.phase == Phase::Polled {
                        return Err(BridgeError::protocol_violation(format!(
                            "Operation {} is still pending; cancel it before freeing",
                            id
                        ))
                        .with_handle(id));
                    }
                    if let Some(abort) = state.abort.take() {
                        abort.abort();
                    }
                }
                entry.remove();
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                trace!(operation = id, "Freed pending operation");
                Ok(())
            }
            Entry::Vacant(_) => Err(BridgeError::invalid_handle(id, "unknown or freed operation")),
        }
    }

    /// Current phase of an operation
    pub fn phase(&self, id: u64) -> Result<Phase> {
        Ok(self.operation(id)?.state.lock().phase)
    }

    /// Result kind of an operation
    pub fn kind(&self, id: u64) -> Result<ResultKind> {
        Ok(self.operation(id)?.kind)
    }

    /// Number of live operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether no operation is live
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn operation(&self, id: u64) -> Result<Arc<Operation>> {
        self.operations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::invalid_handle(id, "unknown or freed operation"))
    }

    fn deliver(&self, id: u64, (continuation, outcome): (Continuation, Outcome)) {
        let scheduled = self.invoker.schedule(Box::new(move || continuation(outcome)));
        if !scheduled {
            warn!(operation = id, "Host is gone; dropped operation outcome");
        }
    }
}
