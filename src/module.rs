//! Module lifecycle: installing a native library on the host runtime.
//!
//! `register_module` verifies that the binding and the library agree on the
//! contract version and on every method's API checksum, builds the dispatch
//! table and starts the module's native worker runtime. The resulting
//! [`BridgeModule`] is installed on the [`HostRuntime`] root object under the
//! library's name. `unregister_module` removes it again and closes the
//! module's invoker gate, so completions still in flight are dropped.

use crate::buffer::{buffer_to_string, string_byte_length, string_to_buffer};
use crate::config::BridgeConfig;
use crate::dispatch::{
    ArgKind, CallScope, DispatchTable, MethodRegistration, Ret, ReturnKind,
};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::future::{Continuation, FutureBridge};
use crate::handle::{HandleGuard, HandleInfo, HandleTable, TypeTag};
use crate::invoker::{CallInvoker, InvokerGate};
use crate::metrics::{BridgeMetrics, BridgeStats};
use crate::value::{HostValue, Scalar, ScalarKind};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Method reporting a string's UTF-8 byte length
pub const STRING_TO_BYTE_LENGTH: &str = "ffi_string_to_byte_length";

/// Method encoding a string into a buffer
pub const STRING_TO_BUFFER: &str = "ffi_string_to_arraybuffer";

/// Method decoding a buffer into a string
pub const BUFFER_TO_STRING: &str = "ffi_arraybuffer_to_string";

/// A native library exposed through the bridge
pub trait NativeLibrary: Send + Sync {
    /// Name of the property installed on the host root object
    fn name(&self) -> &str;

    /// Contract version the library was built with
    fn contract_version(&self) -> u32;

    /// API checksum the library reports for `method`
    fn checksum(&self, method: &str) -> Option<u16>;

    /// Exposed object types; each gets `clone_<type>` and `free_<type>` methods
    fn object_types(&self) -> Vec<TypeTag>;

    /// Exposed methods
    fn methods(&self) -> Vec<MethodRegistration>;
}

/// Root object of the host runtime holding installed modules
pub struct HostRuntime {
    modules: RwLock<HashMap<String, Arc<BridgeModule>>>,
}

impl HostRuntime {
    /// Create a runtime with nothing installed
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Installed module by name
    pub fn module(&self, name: &str) -> Result<Arc<BridgeModule>> {
        self.modules.read().get(name).cloned().ok_or_else(|| {
            BridgeError::new(
                ErrorCode::NotRegistered,
                format!("Module {} is not registered", name),
            )
        })
    }

    /// Whether a module is installed under `name`
    pub fn is_registered(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Names of installed modules, sorted
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of an installed module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    /// Instance id
    pub id: Uuid,
    /// Installed name
    pub name: String,
    /// Registration time (RFC 3339)
    pub registered_at: String,
    /// Contract version
    pub contract_version: u32,
    /// Exposed method names, sorted
    pub methods: Vec<String>,
}

/// An installed native library
pub struct BridgeModule {
    id: Uuid,
    name: String,
    registered_at: DateTime<Utc>,
    config: BridgeConfig,
    table: DispatchTable,
    handles: Arc<HandleTable>,
    futures: Arc<FutureBridge>,
    gate: Arc<InvokerGate>,
    metrics: Arc<BridgeMetrics>,
    registered: AtomicBool,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl BridgeModule {
    /// Instance id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Installed name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registration time
    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Configuration the module was registered with
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Contract version the module was registered against
    pub fn contract_version(&self) -> u32 {
        self.config.contract_version
    }

    /// Whether the module is still installed
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// The module's handle table
    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// The module's future bridge
    pub fn futures(&self) -> &Arc<FutureBridge> {
        &self.futures
    }

    /// The module's dispatch table
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Call an exposed method
    pub fn call(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue> {
        self.ensure_registered()?;
        let scope = CallScope::new(&self.handles, &self.futures, &self.metrics);
        self.table.dispatch(&scope, method, args)
    }

    /// Register the continuation of a pending operation
    pub fn poll_future(&self, operation: u64, continuation: Continuation) -> Result<()> {
        self.ensure_registered()?;
        self.futures.poll(operation, continuation)
    }

    /// Cancel a pending operation; still allowed after unregistering
    pub fn cancel_future(&self, operation: u64) -> Result<bool> {
        self.futures.cancel(operation)
    }

    /// Free a pending operation; still allowed after unregistering
    pub fn free_future(&self, operation: u64) -> Result<()> {
        self.futures.free(operation)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BridgeStats {
        self.metrics.snapshot(self.futures.len(), self.handles.len())
    }

    /// Prometheus text export
    pub fn prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Take over the caller's reference to handle `id`; dropping the guard frees it
    pub fn adopt_handle(&self, id: u64) -> Result<HandleGuard> {
        let handle = self.handles.lookup(id)?;
        Ok(HandleGuard::adopt(Arc::clone(&self.handles), handle))
    }

    /// Take an extra reference to handle `id`, released when the guard is dropped
    pub fn retain_handle(&self, id: u64) -> Result<HandleGuard> {
        let handle = self.handles.lookup(id)?;
        HandleGuard::acquire(Arc::clone(&self.handles), handle)
    }

    /// Live handles, for diagnostics
    pub fn handle_snapshot(&self) -> Vec<HandleInfo> {
        self.handles.snapshot()
    }

    /// Module summary
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id,
            name: self.name.clone(),
            registered_at: self.registered_at.to_rfc3339(),
            contract_version: self.config.contract_version,
            methods: self.table.names().map(str::to_string).collect(),
        }
    }

    fn ensure_registered(&self) -> Result<()> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(BridgeError::new(
                ErrorCode::NotRegistered,
                format!("Module {} has been unregistered", self.name),
            ))
        }
    }

    fn unregister(&self) {
        self.registered.store(false, Ordering::Release);
        self.gate.close();
    }
}

impl fmt::Debug for BridgeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeModule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("registered", &self.is_registered())
            .field("methods", &self.table.len())
            .finish()
    }
}

impl Drop for BridgeModule {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!(module = %self.name, "Native worker runtime stopped");
        }
    }
}

/// Install `library` on `runtime`, relaying completions through `invoker`
#[instrument(skip(runtime, invoker, library, config), fields(module = library.name()))]
pub fn register_module(
    runtime: &HostRuntime,
    invoker: Arc<dyn CallInvoker>,
    library: &dyn NativeLibrary,
    config: BridgeConfig,
) -> Result<Arc<BridgeModule>> {
    config.validate()?;
    let name = library.name().to_string();

    if runtime.is_registered(&name) {
        return Err(already_registered(&name));
    }

    let actual = library.contract_version();
    if actual != config.contract_version {
        warn!(expected = config.contract_version, actual, "Contract version mismatch");
        return Err(BridgeError::version_mismatch(config.contract_version, actual));
    }

    let mut methods = library.methods();
    if config.verify_checksums {
        verify_checksums(library, &methods)?;
    }
    for tag in library.object_types() {
        methods.push(clone_method(tag));
        methods.push(free_method(tag));
    }
    methods.extend(string_methods());
    let table = DispatchTable::new(methods)?;

    let worker = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name(format!("{}-native", name))
        .enable_all()
        .build()?;

    let metrics = Arc::new(BridgeMetrics::new());
    let gate = Arc::new(InvokerGate::new(invoker, Arc::clone(&metrics)));
    let futures = Arc::new(FutureBridge::new(
        Arc::clone(&gate) as Arc<dyn CallInvoker>,
        worker.handle().clone(),
        Arc::clone(&metrics),
        config.max_pending_operations,
    ));

    let module = Arc::new(BridgeModule {
        id: Uuid::new_v4(),
        name: name.clone(),
        registered_at: Utc::now(),
        config,
        table,
        handles: Arc::new(HandleTable::new()),
        futures,
        gate,
        metrics,
        registered: AtomicBool::new(true),
        runtime: Mutex::new(Some(worker)),
    });

    match runtime.modules.write().entry(name.clone()) {
        Entry::Occupied(_) => return Err(already_registered(&name)),
        Entry::Vacant(slot) => {
            slot.insert(Arc::clone(&module));
        }
    }

    info!(
        id = %module.id,
        methods = module.table.len(),
        contract_version = module.contract_version(),
        "Module registered"
    );
    if module.config.debug {
        for method in module.table.methods() {
            debug!(
                signature = %method.signature(),
                checksum = method.checksum(),
                "Exposed method"
            );
        }
    }
    Ok(module)
}

/// Remove the module installed under `name`; returns whether one was removed
#[instrument(skip(runtime))]
pub fn unregister_module(runtime: &HostRuntime, name: &str) -> bool {
    let Some(module) = runtime.modules.write().remove(name) else {
        debug!("Module already unregistered");
        return false;
    };

    module.unregister();
    info!(
        id = %module.id,
        pending_operations = module.futures.len(),
        live_handles = module.handles.len(),
        "Module unregistered"
    );
    true
}

fn already_registered(name: &str) -> BridgeError {
    BridgeError::new(
        ErrorCode::AlreadyRegistered,
        format!("Module {} is already registered", name),
    )
}

fn verify_checksums(library: &dyn NativeLibrary, methods: &[MethodRegistration]) -> Result<()> {
    for method in methods {
        let expected = method.checksum();
        let actual = library.checksum(method.name());
        if actual != Some(expected) {
            warn!(
                method = method.name(),
                expected,
                ?actual,
                fingerprint = %method.fingerprint(),
                "API checksum mismatch"
            );
            return Err(BridgeError::checksum_mismatch(method.name(), expected, actual));
        }
    }
    Ok(())
}

fn clone_method(tag: TypeTag) -> MethodRegistration {
    MethodRegistration::new(tag.clone_method(), |scope, args| {
        Ok(scope.clone_object(args.handle(0)?)?.into())
    })
    .arg(ArgKind::Handle(tag))
    .returns(ReturnKind::Handle(tag))
}

fn free_method(tag: TypeTag) -> MethodRegistration {
    MethodRegistration::new(tag.free_method(), |scope, args| {
        scope.free_object(args.handle(0)?)?;
        Ok(Ret::Void)
    })
    .arg(ArgKind::Handle(tag))
}

fn string_methods() -> Vec<MethodRegistration> {
    vec![
        MethodRegistration::new(STRING_TO_BYTE_LENGTH, |_, args| {
            let length = string_byte_length(args.str(0)?);
            let length = i32::try_from(length).map_err(|_| {
                BridgeError::encode(format!("String of {} bytes is too long", length))
            })?;
            Ok(Scalar::I32(length).into())
        })
        .arg(ArgKind::String)
        .returns(ReturnKind::Scalar(ScalarKind::I32)),
        MethodRegistration::new(STRING_TO_BUFFER, |_, args| {
            Ok(string_to_buffer(args.str(0)?).into())
        })
        .arg(ArgKind::String)
        .returns(ReturnKind::Buffer),
        MethodRegistration::new(BUFFER_TO_STRING, |_, args| {
            Ok(buffer_to_string(args.buffer(0)?)?.into())
        })
        .arg(ArgKind::Buffer)
        .returns(ReturnKind::String),
    ]
}
