//! Method dispatch table.
//!
//! Maps every exposed method name to a marshaling thunk together with its
//! declared argument and return kinds. The table is built once when a module
//! is registered and is immutable afterwards. Lookups are a binary search
//! over a sorted boxed slice.
//!
//! Dispatching a call goes through four steps:
//!
//! 1. look the name up (`METHOD_NOT_FOUND`, no native call)
//! 2. decode every argument against its declared kind (`DECODE_ERROR` or
//!    `INVALID_HANDLE`, still no native call)
//! 3. run the thunk, catching panics (`PANIC`)
//! 4. check the result against the declared return kind (`ENCODE_ERROR`)

use crate::buffer::{to_native_buffer, NativeBuffer};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::future::{FfiReturn, FutureBridge, ObjectPointer, ResultKind};
use crate::handle::{Handle, HandleTable, TypeTag};
use crate::metrics::BridgeMetrics;
use crate::value::{HostValue, Scalar, ScalarKind};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace};

/// Declared kind of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Fixed-width number
    Scalar(ScalarKind),
    /// Handle of a live object of the given type
    Handle(TypeTag),
    /// Byte buffer
    Buffer,
    /// UTF-8 string
    String,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Scalar(kind) => write!(f, "{}", kind),
            ArgKind::Handle(tag) => write!(f, "handle<{}>", tag),
            ArgKind::Buffer => f.write_str("buffer"),
            ArgKind::String => f.write_str("string"),
        }
    }
}

/// Declared kind of a return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// No value
    Void,
    /// Fixed-width number
    Scalar(ScalarKind),
    /// Handle of a newly created object
    Handle(TypeTag),
    /// Byte buffer
    Buffer,
    /// UTF-8 string
    String,
    /// Pending operation resolving to the given kind
    Async(ResultKind),
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnKind::Void => f.write_str("void"),
            ReturnKind::Scalar(kind) => write!(f, "{}", kind),
            ReturnKind::Handle(tag) => write!(f, "handle<{}>", tag),
            ReturnKind::Buffer => f.write_str("buffer"),
            ReturnKind::String => f.write_str("string"),
            ReturnKind::Async(kind) => write!(f, "async<{}>", kind),
        }
    }
}

/// A decoded argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Fixed-width number
    Scalar(Scalar),
    /// Live handle
    Handle(Handle),
    /// Byte buffer copied from the host
    Buffer(NativeBuffer),
    /// UTF-8 string
    String(String),
}

/// Decoded arguments of one call
#[derive(Debug, Clone)]
pub struct Args {
    values: Vec<Arg>,
}

macro_rules! scalar_getter {
    ($name:ident, $ty:ty, $variant:ident) => {
        #[doc = concat!("Argument `index` as `", stringify!($ty), "`")]
        pub fn $name(&self, index: usize) -> Result<$ty> {
            match self.get(index)? {
                Arg::Scalar(Scalar::$variant(v)) => Ok(*v),
                other => Err(unexpected_arg(index, stringify!($ty), other)),
            }
        }
    };
}

impl Args {
    /// Wrap already decoded arguments
    pub fn new(values: Vec<Arg>) -> Self {
        Self { values }
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument `index`
    pub fn get(&self, index: usize) -> Result<&Arg> {
        self.values
            .get(index)
            .ok_or_else(|| BridgeError::decode(format!("Missing argument {}", index)))
    }

    scalar_getter!(u8, u8, U8);
    scalar_getter!(i8, i8, I8);
    scalar_getter!(u16, u16, U16);
    scalar_getter!(i16, i16, I16);
    scalar_getter!(u32, u32, U32);
    scalar_getter!(i32, i32, I32);
    scalar_getter!(u64, u64, U64);
    scalar_getter!(i64, i64, I64);
    scalar_getter!(f32, f32, F32);
    scalar_getter!(f64, f64, F64);

    /// Argument `index` as a handle
    pub fn handle(&self, index: usize) -> Result<Handle> {
        match self.get(index)? {
            Arg::Handle(handle) => Ok(*handle),
            other => Err(unexpected_arg(index, "handle", other)),
        }
    }

    /// Argument `index` as raw bytes
    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.get(index)? {
            Arg::Buffer(buffer) => Ok(buffer.as_slice()),
            other => Err(unexpected_arg(index, "buffer", other)),
        }
    }

    /// Argument `index` as an owned native buffer
    pub fn buffer(&self, index: usize) -> Result<NativeBuffer> {
        match self.get(index)? {
            Arg::Buffer(buffer) => Ok(buffer.clone()),
            other => Err(unexpected_arg(index, "buffer", other)),
        }
    }

    /// Argument `index` as a string
    pub fn str(&self, index: usize) -> Result<&str> {
        match self.get(index)? {
            Arg::String(s) => Ok(s),
            other => Err(unexpected_arg(index, "string", other)),
        }
    }
}

fn unexpected_arg(index: usize, expected: &str, actual: &Arg) -> BridgeError {
    BridgeError::decode(format!(
        "Argument {} is not a {}: {:?}",
        index, expected, actual
    ))
}

/// Value produced by a thunk
#[derive(Debug, Clone, PartialEq)]
pub enum Ret {
    /// No value
    Void,
    /// Fixed-width number
    Scalar(Scalar),
    /// Handle of a newly created object
    Handle(Handle),
    /// Byte buffer, ownership moves to the host
    Buffer(NativeBuffer),
    /// UTF-8 string
    String(String),
    /// Id of a pending operation
    Pending(u64),
}

// Host-visible resource a thunk created for its result.
#[derive(Debug, Clone, Copy)]
enum Produced {
    Object(Handle),
    Operation(u64),
}

impl Ret {
    fn produced(&self) -> Option<Produced> {
        match *self {
            Ret::Handle(handle) => Some(Produced::Object(handle)),
            Ret::Pending(id) => Some(Produced::Operation(id)),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Ret::Void => "void".to_string(),
            Ret::Scalar(s) => s.kind().to_string(),
            Ret::Handle(h) => format!("handle<{}>", h.tag()),
            Ret::Buffer(_) => "buffer".to_string(),
            Ret::String(_) => "string".to_string(),
            Ret::Pending(_) => "pending operation".to_string(),
        }
    }
}

impl From<Scalar> for Ret {
    fn from(scalar: Scalar) -> Self {
        Ret::Scalar(scalar)
    }
}

impl From<NativeBuffer> for Ret {
    fn from(buffer: NativeBuffer) -> Self {
        Ret::Buffer(buffer)
    }
}

impl From<String> for Ret {
    fn from(s: String) -> Self {
        Ret::String(s)
    }
}

impl From<Handle> for Ret {
    fn from(handle: Handle) -> Self {
        Ret::Handle(handle)
    }
}

/// Per-call access to the module's tables
pub struct CallScope<'a> {
    handles: &'a Arc<HandleTable>,
    futures: &'a Arc<FutureBridge>,
    metrics: &'a Arc<BridgeMetrics>,
}

impl<'a> CallScope<'a> {
    /// Create a scope over a module's tables
    pub fn new(
        handles: &'a Arc<HandleTable>,
        futures: &'a Arc<FutureBridge>,
        metrics: &'a Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            handles,
            futures,
            metrics,
        }
    }

    /// The handle table
    pub fn handles(&self) -> &Arc<HandleTable> {
        self.handles
    }

    /// The future bridge
    pub fn futures(&self) -> &Arc<FutureBridge> {
        self.futures
    }

    /// Borrow the object behind a handle
    pub fn object<T: Send + Sync + 'static>(&self, handle: Handle) -> Result<Arc<T>> {
        self.handles.get(handle)
    }

    /// Store a newly constructed object
    pub fn create_object<T: Send + Sync + 'static>(&self, tag: TypeTag, object: T) -> Handle {
        self.metrics.record_handle_created();
        self.handles.insert(tag, Arc::new(object))
    }

    /// Add a reference to a handle
    pub fn clone_object(&self, handle: Handle) -> Result<Handle> {
        self.handles.clone_handle(handle)
    }

    /// Drop a reference to a handle
    pub fn free_object(&self, handle: Handle) -> Result<bool> {
        let destroyed = self.handles.free(handle)?;
        if destroyed {
            self.metrics.record_handle_destroyed();
        }
        Ok(destroyed)
    }

    /// Start a native async operation and return its pending result
    pub fn spawn<T, F>(&self, future: F) -> Result<Ret>
    where
        T: FfiReturn,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.futures.spawn(future).map(Ret::Pending)
    }

    /// Start an async constructor; the operation resolves to the new object's handle
    pub fn spawn_object<T, F>(&self, tag: TypeTag, future: F) -> Result<Ret>
    where
        T: Send + Sync + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handles = Arc::clone(self.handles);
        let metrics = Arc::clone(self.metrics);
        self.spawn(async move {
            let object = future.await?;
            metrics.record_handle_created();
            Ok(ObjectPointer(handles.insert(tag, Arc::new(object)).id()))
        })
    }

    fn release(&self, produced: Produced) {
        match produced {
            Produced::Object(handle) => {
                if let Err(e) = self.free_object(handle) {
                    debug!(handle = handle.id(), error = %e, "Rejected handle already released");
                }
            }
            Produced::Operation(id) => {
                let _ = self.futures.cancel(id);
                if let Err(e) = self.futures.free(id) {
                    debug!(operation = id, error = %e, "Rejected operation already released");
                }
            }
        }
    }
}

/// Marshaling thunk behind an exposed method
pub type Thunk = Arc<dyn Fn(&CallScope<'_>, &Args) -> Result<Ret> + Send + Sync>;

/// API checksum of a method signature
pub fn signature_checksum(signature: &str) -> u16 {
    let digest = Sha256::digest(signature.as_bytes());
    u16::from_be_bytes([digest[0], digest[1]])
}

/// Static registration of one exposed method
#[derive(Clone)]
pub struct MethodRegistration {
    name: String,
    args: Vec<ArgKind>,
    returns: ReturnKind,
    checksum: Option<u16>,
    thunk: Thunk,
}

impl MethodRegistration {
    /// Register `thunk` under `name`, taking no arguments and returning nothing
    pub fn new<F>(name: impl Into<String>, thunk: F) -> Self
    where
        F: Fn(&CallScope<'_>, &Args) -> Result<Ret> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            args: Vec::new(),
            returns: ReturnKind::Void,
            checksum: None,
            thunk: Arc::new(thunk),
        }
    }

    /// Append an argument
    pub fn arg(mut self, kind: ArgKind) -> Self {
        self.args.push(kind);
        self
    }

    /// Set the return kind
    pub fn returns(mut self, kind: ReturnKind) -> Self {
        self.returns = kind;
        self
    }

    /// Pin the checksum the binding expects
    pub fn with_checksum(mut self, checksum: u16) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Exposed name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument kinds
    pub fn arg_kinds(&self) -> &[ArgKind] {
        &self.args
    }

    /// Declared return kind
    pub fn return_kind(&self) -> ReturnKind {
        self.returns
    }

    /// Canonical signature, e.g. `fetcher_get_config(handle<Fetcher>) -> buffer`
    pub fn signature(&self) -> String {
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        format!("{}({}) -> {}", self.name, args.join(", "), self.returns)
    }

    /// Checksum the binding expects the library to report
    pub fn checksum(&self) -> u16 {
        self.checksum
            .unwrap_or_else(|| signature_checksum(&self.signature()))
    }

    /// Hex fingerprint of the signature, for diagnostics
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.signature().as_bytes())[..8])
    }

    fn decode_args(&self, handles: &HandleTable, values: Vec<HostValue>) -> Result<Args> {
        if values.len() != self.args.len() {
            return Err(BridgeError::decode(format!(
                "{} takes {} argument(s) but {} were given",
                self.name,
                self.args.len(),
                values.len()
            )));
        }

        let decoded = self
            .args
            .iter()
            .zip(values)
            .enumerate()
            .map(|(index, (kind, value))| {
                decode_arg(handles, *kind, value).map_err(|e| {
                    let message = format!("{}: argument {}: {}", self.name, index, e.message);
                    BridgeError { message, ..e }.with_context(serde_json::json!({
                        "method": self.name,
                        "argument": index,
                        "expected": kind.to_string(),
                    }))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Args::new(decoded))
    }

    fn encode_ret(&self, futures: &FutureBridge, ret: Ret) -> Result<HostValue> {
        let mismatch = |ret: &Ret| {
            BridgeError::encode(format!(
                "{} declares {} but returned {}",
                self.name,
                self.returns,
                ret.describe()
            ))
        };

        match (self.returns, ret) {
            (ReturnKind::Void, Ret::Void) => Ok(HostValue::Undefined),
            (ReturnKind::Scalar(kind), Ret::Scalar(s)) if s.kind() == kind => Ok(s.to_host()),
            (ReturnKind::Handle(tag), Ret::Handle(h)) if h.tag() == tag => {
                Ok(HostValue::BigUint(h.id()))
            }
            (ReturnKind::Buffer, Ret::Buffer(b)) => Ok(HostValue::Bytes(b.into_vec())),
            (ReturnKind::String, Ret::String(s)) => Ok(HostValue::String(s)),
            (ReturnKind::Async(kind), Ret::Pending(id)) => {
                let actual = futures.kind(id)?;
                if actual != kind {
                    return Err(BridgeError::encode(format!(
                        "{} declares async<{}> but started async<{}>",
                        self.name, kind, actual
                    ))
                    .with_handle(id));
                }
                Ok(HostValue::Pending(id))
            }
            (_, ret) => Err(mismatch(&ret)),
        }
    }
}

impl fmt::Debug for MethodRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistration")
            .field("signature", &self.signature())
            .field("checksum", &self.checksum)
            .finish()
    }
}

fn decode_arg(handles: &HandleTable, kind: ArgKind, value: HostValue) -> Result<Arg> {
    match (kind, value) {
        (ArgKind::Scalar(kind), value) => Scalar::from_host(kind, &value).map(Arg::Scalar),
        (ArgKind::Handle(tag), value) => {
            let id = value.as_id().ok_or_else(|| {
                BridgeError::decode(format!(
                    "Expected a {} handle but got {}",
                    tag,
                    value.type_name()
                ))
            })?;
            let live = handles.lookup(id)?;
            if live.tag() != tag {
                return Err(BridgeError::invalid_handle(
                    id,
                    format!("expected a {} but the handle refers to a {}", tag, live.tag()),
                ));
            }
            Ok(Arg::Handle(live))
        }
        (ArgKind::Buffer, HostValue::Bytes(bytes)) => Ok(Arg::Buffer(to_native_buffer(&bytes))),
        (ArgKind::String, HostValue::String(s)) => Ok(Arg::String(s)),
        (kind, value) => Err(BridgeError::decode(format!(
            "Expected {} but got {}",
            kind,
            value.type_name()
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Immutable name -> registration table
#[derive(Debug)]
pub struct DispatchTable {
    methods: Box<[MethodRegistration]>,
}

impl DispatchTable {
    /// Build the table; duplicate names are rejected
    pub fn new(mut methods: Vec<MethodRegistration>) -> Result<Self> {
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = methods.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(BridgeError::new(
                ErrorCode::InvalidArgument,
                format!("Method {} is registered twice", pair[0].name),
            ));
        }
        Ok(Self {
            methods: methods.into_boxed_slice(),
        })
    }

    /// Find a registration by name
    pub fn lookup(&self, name: &str) -> Option<&MethodRegistration> {
        self.methods
            .binary_search_by(|m| m.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.methods[index])
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name.as_str())
    }

    /// All registrations, sorted by name
    pub fn methods(&self) -> &[MethodRegistration] {
        &self.methods
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Decode, invoke and encode one call
    pub fn dispatch(
        &self,
        scope: &CallScope<'_>,
        name: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue> {
        let Some(method) = self.lookup(name) else {
            scope.metrics.record_error(ErrorCode::MethodNotFound);
            debug!(method = name, "Unknown method");
            return Err(BridgeError::method_not_found(name));
        };

        let result = self.invoke(method, scope, args);
        scope
            .metrics
            .record_call(name, result.as_ref().err().map(|e| e.code));
        if let Err(e) = &result {
            debug!(method = name, error = %e, "Call failed");
        }
        result
    }

    fn invoke(
        &self,
        method: &MethodRegistration,
        scope: &CallScope<'_>,
        args: Vec<HostValue>,
    ) -> Result<HostValue> {
        let args = method.decode_args(scope.handles, args)?;
        trace!(method = %method.name, args = args.len(), "Invoking native entry point");

        let ret = catch_unwind(AssertUnwindSafe(|| (method.thunk)(scope, &args))).map_err(
            |payload| {
                BridgeError::panic(format!(
                    "{} panicked: {}",
                    method.name,
                    panic_message(payload.as_ref())
                ))
            },
        )??;

        // A result the host never sees must not leave its handle or operation behind.
        let produced = ret.produced();
        method.encode_ret(scope.futures, ret).map_err(|e| {
            if let Some(produced) = produced {
                scope.release(produced);
            }
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::QueuedCallInvoker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COUNTER: TypeTag = TypeTag("Counter");

    struct Counter {
        value: AtomicUsize,
    }

    struct Harness {
        handles: Arc<HandleTable>,
        futures: Arc<FutureBridge>,
        metrics: Arc<BridgeMetrics>,
        _runtime: tokio::runtime::Runtime,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_limit(16)
        }

        fn with_limit(max_pending: usize) -> Self {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (invoker, _host) = QueuedCallInvoker::new();
            let futures = Arc::new(FutureBridge::new(
                Arc::new(invoker),
                runtime.handle().clone(),
                Arc::new(BridgeMetrics::new()),
                max_pending,
            ));
            Self {
                handles: Arc::new(HandleTable::new()),
                futures,
                metrics: Arc::new(BridgeMetrics::new()),
                _runtime: runtime,
            }
        }

        fn scope(&self) -> CallScope<'_> {
            CallScope::new(&self.handles, &self.futures, &self.metrics)
        }
    }

    fn table(calls: Arc<AtomicUsize>) -> DispatchTable {
        let add_calls = Arc::clone(&calls);
        let panic_calls = Arc::clone(&calls);
        DispatchTable::new(vec![
            MethodRegistration::new("counter_new", |scope, _| {
                Ok(scope
                    .create_object(
                        COUNTER,
                        Counter {
                            value: AtomicUsize::new(0),
                        },
                    )
                    .into())
            })
            .returns(ReturnKind::Handle(COUNTER)),
            MethodRegistration::new("counter_add", move |scope, args| {
                add_calls.fetch_add(1, Ordering::SeqCst);
                let counter = scope.object::<Counter>(args.handle(0)?)?;
                let total = counter.value.fetch_add(args.u8(1)? as usize, Ordering::SeqCst)
                    + args.u8(1)? as usize;
                Ok(Scalar::U32(total as u32).into())
            })
            .arg(ArgKind::Handle(COUNTER))
            .arg(ArgKind::Scalar(ScalarKind::U8))
            .returns(ReturnKind::Scalar(ScalarKind::U32)),
            MethodRegistration::new("counter_explode", move |_, _| {
                panic_calls.fetch_add(1, Ordering::SeqCst);
                panic!("counter overflow")
            }),
            MethodRegistration::new("counter_lies", |_, _| Ok(Ret::String("nope".into())))
                .returns(ReturnKind::Buffer),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup_is_sorted() {
        let table = table(Arc::new(AtomicUsize::new(0)));
        let names: Vec<_> = table.names().collect();
        assert_eq!(
            names,
            vec!["counter_add", "counter_explode", "counter_lies", "counter_new"]
        );
        assert!(table.lookup("counter_add").is_some());
        assert!(table.lookup("counter_missing").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = DispatchTable::new(vec![
            MethodRegistration::new("twice", |_, _| Ok(Ret::Void)),
            MethodRegistration::new("twice", |_, _| Ok(Ret::Void)),
        ])
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_dispatch_round_trip() {
        let harness = Harness::new();
        let table = table(Arc::new(AtomicUsize::new(0)));
        let scope = harness.scope();

        let handle = table.dispatch(&scope, "counter_new", vec![]).unwrap();
        assert_eq!(handle, HostValue::BigUint(1));

        let total = table
            .dispatch(&scope, "counter_add", vec![handle.clone(), HostValue::Number(5.0)])
            .unwrap();
        assert_eq!(total, HostValue::Number(5.0));
        assert_eq!(harness.metrics.calls_total(), 2);
    }

    #[test]
    fn test_unknown_method_does_not_call_native() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let table = table(Arc::clone(&calls));

        let err = table
            .dispatch(&harness.scope(), "methodThatDoesNotExist", vec![])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.metrics.calls_total(), 0);
        assert_eq!(harness.metrics.error_counts()[&ErrorCode::MethodNotFound], 1);
    }

    #[test]
    fn test_decode_failures_happen_before_native_call() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let table = table(Arc::clone(&calls));
        let scope = harness.scope();
        let handle = table.dispatch(&scope, "counter_new", vec![]).unwrap();

        let cases = vec![
            vec![handle.clone()],
            vec![handle.clone(), HostValue::Number(256.0)],
            vec![handle.clone(), HostValue::Number(1.5)],
            vec![handle.clone(), HostValue::String("1".into())],
            vec![HostValue::String("1".into()), HostValue::Number(1.0)],
        ];
        for args in cases {
            let err = table.dispatch(&scope, "counter_add", args).unwrap_err();
            assert_eq!(err.code, ErrorCode::DecodeError, "{}", err);
        }

        let err = table
            .dispatch(&scope, "counter_add", vec![HostValue::BigUint(99), HostValue::Number(1.0)])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHandle);
        assert_eq!(err.handle, Some(99));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_operation_id_is_not_a_handle() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let table = table(Arc::clone(&calls));
        let scope = harness.scope();
        let handle = table.dispatch(&scope, "counter_new", vec![]).unwrap();
        assert_eq!(handle, HostValue::BigUint(1));

        let err = table
            .dispatch(&scope, "counter_add", vec![HostValue::Pending(1), HostValue::Number(1.0)])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DecodeError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let context = err.context.unwrap();
        assert_eq!(context["method"], "counter_add");
        assert_eq!(context["argument"], 0);
        assert_eq!(context["expected"], "handle<Counter>");
    }

    #[test]
    fn test_handle_of_wrong_type() {
        let harness = Harness::new();
        let table = table(Arc::new(AtomicUsize::new(0)));
        let other = harness.handles.insert(TypeTag("Service"), Arc::new(()));

        let err = table
            .dispatch(
                &harness.scope(),
                "counter_add",
                vec![HostValue::BigUint(other.id()), HostValue::Number(1.0)],
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidHandle);
    }

    #[test]
    fn test_panic_is_caught() {
        let harness = Harness::new();
        let table = table(Arc::new(AtomicUsize::new(0)));

        let err = table
            .dispatch(&harness.scope(), "counter_explode", vec![])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Panic);
        assert!(err.message.contains("counter overflow"));
        assert_eq!(harness.metrics.calls_failed(), 1);
    }

    #[test]
    fn test_return_kind_enforced() {
        let harness = Harness::new();
        let table = table(Arc::new(AtomicUsize::new(0)));

        let err = table
            .dispatch(&harness.scope(), "counter_lies", vec![])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EncodeError);
    }

    #[test]
    fn test_async_return_kind() {
        let harness = Harness::new();
        let table = DispatchTable::new(vec![
            MethodRegistration::new("answer", |scope, _| scope.spawn(async { Ok(42u32) }))
                .returns(ReturnKind::Async(ResultKind::Scalar(ScalarKind::U32))),
            MethodRegistration::new("wrong_answer", |scope, _| scope.spawn(async { Ok(42u8) }))
                .returns(ReturnKind::Async(ResultKind::Scalar(ScalarKind::U32))),
        ])
        .unwrap();

        let pending = table.dispatch(&harness.scope(), "answer", vec![]).unwrap();
        assert!(matches!(pending, HostValue::Pending(_)));

        let err = table
            .dispatch(&harness.scope(), "wrong_answer", vec![])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EncodeError);
    }

    #[test]
    fn test_rejected_result_leaves_nothing_behind() {
        let harness = Harness::with_limit(2);
        let table = DispatchTable::new(vec![
            MethodRegistration::new("answer", |scope, _| scope.spawn(async { Ok(42u32) }))
                .returns(ReturnKind::Async(ResultKind::Scalar(ScalarKind::U32))),
            MethodRegistration::new("wrong_answer", |scope, _| scope.spawn(async { Ok(42u8) }))
                .returns(ReturnKind::Async(ResultKind::Scalar(ScalarKind::U32))),
            MethodRegistration::new("service_new", |scope, _| {
                Ok(scope
                    .create_object(
                        COUNTER,
                        Counter {
                            value: AtomicUsize::new(0),
                        },
                    )
                    .into())
            })
            .returns(ReturnKind::Handle(TypeTag("Service"))),
        ])
        .unwrap();
        let scope = harness.scope();

        for _ in 0..3 {
            let err = table.dispatch(&scope, "wrong_answer", vec![]).unwrap_err();
            assert_eq!(err.code, ErrorCode::EncodeError);
        }
        assert_eq!(harness.futures.len(), 0);
        assert!(matches!(
            table.dispatch(&scope, "answer", vec![]).unwrap(),
            HostValue::Pending(_)
        ));

        let err = table.dispatch(&scope, "service_new", vec![]).unwrap_err();
        assert_eq!(err.code, ErrorCode::EncodeError);
        assert!(harness.handles.is_empty());
        assert_eq!(harness.metrics.snapshot(0, 0).handles_destroyed, 1);
    }

    #[test]
    fn test_native_error_keeps_payload() {
        let harness = Harness::new();
        let payload = rmp_serde::to_vec(&("InsufficientBalance", 1200u64)).unwrap();
        let expected = payload.clone();
        let table = DispatchTable::new(vec![MethodRegistration::new("pay", move |_, _| {
            Err(BridgeError::native("payment rejected").with_payload(payload.clone()))
        })])
        .unwrap();

        let err = table.dispatch(&harness.scope(), "pay", vec![]).unwrap_err();
        assert_eq!(err.code, ErrorCode::NativeError);
        assert_eq!(err.call_status(), crate::error::call_status::ERROR);
        assert_eq!(err.payload.as_deref(), Some(expected.as_slice()));

        let (kind, amount): (String, u64) = rmp_serde::from_slice(&err.payload.unwrap()).unwrap();
        assert_eq!(kind, "InsufficientBalance");
        assert_eq!(amount, 1200);
    }

    #[test]
    fn test_checksums() {
        let method = MethodRegistration::new("fetcher_get_config", |_, _| Ok(Ret::Void))
            .arg(ArgKind::Handle(TypeTag("Fetcher")))
            .returns(ReturnKind::Buffer);
        assert_eq!(
            method.signature(),
            "fetcher_get_config(handle<Fetcher>) -> buffer"
        );
        assert_eq!(method.checksum(), signature_checksum(&method.signature()));
        assert_eq!(method.fingerprint().len(), 16);

        let pinned = method.clone().with_checksum(15012);
        assert_eq!(pinned.checksum(), 15012);

        let changed = method.returns(ReturnKind::String);
        assert_ne!(changed.signature(), pinned.signature());
    }
}
