//! N-API bindings for Node.js integration.
//!
//! The linked native library is installed once per process with
//! [`set_native_library`]. JavaScript then creates a `NativeModule`, passing a
//! pump function that the call invoker uses to reach the JS thread, and
//! calls exposed methods by name. Async methods return a pending operation id
//! that is resolved with `pollFuture`.
//!
//! Object handles come back as bigints that the host frees explicitly. Passing
//! one to `adopt` instead wraps it in an `ObjectRef`, whose reference is
//! released when the wrapper is garbage collected.

// `#[napi]` expands to undocumented glue items.
#![allow(missing_docs)]

use crate::config::{BridgeConfig, DEFAULT_LOG_FILTER};
use crate::error::{BridgeError, ErrorCode};
use crate::future::Outcome;
use crate::handle::HandleGuard;
use crate::invoker::{CallInvoker, Task};
use crate::module::{register_module, unregister_module, BridgeModule, HostRuntime, NativeLibrary};
use crate::value::HostValue;
use napi::threadsafe_function::{
    ErrorStrategy, ThreadSafeCallContext, ThreadsafeFunction, ThreadsafeFunctionCallMode,
};
use napi::{Env, Error, JsBigInt, JsBuffer, JsFunction, JsUnknown, Result, Status, ValueType};
use napi_derive::napi;
use once_cell::sync::{Lazy, OnceCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static LIBRARY: OnceCell<Box<dyn NativeLibrary>> = OnceCell::new();

static HOST: Lazy<HostRuntime> = Lazy::new(HostRuntime::new);

/// Link the native library exposed by this addon; only the first call wins
pub fn set_native_library(library: Box<dyn NativeLibrary>) -> crate::error::Result<()> {
    LIBRARY.set(library).map_err(|library| {
        BridgeError::new(
            ErrorCode::AlreadyRegistered,
            format!("Native library {} is already linked", library.name()),
        )
    })
}

/// JavaScript-friendly configuration
#[napi(object)]
pub struct JsBridgeConfig {
    /// Native worker threads
    pub worker_threads: Option<u32>,
    /// Maximum live pending operations
    pub max_pending_operations: Option<u32>,
    /// Contract version the binding was generated against
    pub contract_version: Option<u32>,
    /// Verify per-method API checksums
    pub verify_checksums: Option<bool>,
    /// Tracing filter directive
    pub log_filter: Option<String>,
    /// Debug mode
    pub debug: Option<bool>,
}

impl From<JsBridgeConfig> for BridgeConfig {
    fn from(js: JsBridgeConfig) -> Self {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            worker_threads: js
                .worker_threads
                .map(|v| v as usize)
                .unwrap_or(defaults.worker_threads),
            max_pending_operations: js
                .max_pending_operations
                .map(|v| v as usize)
                .unwrap_or(defaults.max_pending_operations),
            contract_version: js.contract_version.unwrap_or(defaults.contract_version),
            verify_checksums: js.verify_checksums.unwrap_or(defaults.verify_checksums),
            log_filter: js.log_filter.unwrap_or(defaults.log_filter),
            debug: js.debug.unwrap_or(defaults.debug),
        }
    }
}

/// Call invoker relaying tasks through a threadsafe function onto the JS thread
pub struct TsfnCallInvoker {
    tsfn: ThreadsafeFunction<Task, ErrorStrategy::Fatal>,
    alive: AtomicBool,
}

impl TsfnCallInvoker {
    fn new(env: &Env, pump: JsFunction) -> Result<Self> {
        let mut tsfn = pump.create_threadsafe_function(0, |ctx: ThreadSafeCallContext<Task>| {
            (ctx.value)();
            Ok(Vec::<JsUnknown>::new())
        })?;
        // Pending tasks must not keep the event loop alive on their own.
        tsfn.unref(env)?;
        Ok(Self {
            tsfn,
            alive: AtomicBool::new(true),
        })
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl CallInvoker for TsfnCallInvoker {
    fn schedule(&self, task: Task) -> bool {
        self.is_alive()
            && self.tsfn.call(task, ThreadsafeFunctionCallMode::NonBlocking) == Status::Ok
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

fn to_napi_error(e: BridgeError) -> Error {
    let reason = serde_json::to_string(&e).unwrap_or_else(|_| e.to_string());
    Error::new(Status::GenericFailure, reason)
}

fn operation_id(operation: i64) -> Result<u64> {
    u64::try_from(operation)
        .map_err(|_| Error::from_reason(format!("Invalid operation id {}", operation)))
}

fn js_to_host(value: JsUnknown) -> Result<HostValue> {
    match value.get_type()? {
        ValueType::Undefined | ValueType::Null => Ok(HostValue::Undefined),
        ValueType::Number => Ok(HostValue::Number(value.coerce_to_number()?.get_double()?)),
        ValueType::String => Ok(HostValue::String(
            value.coerce_to_string()?.into_utf8()?.into_owned()?,
        )),
        ValueType::BigInt => {
            // SAFETY: the value type was checked above.
            let bigint = unsafe { value.cast::<JsBigInt>() };
            let (unsigned, lossless) = bigint.get_u64()?;
            if lossless {
                return Ok(HostValue::BigUint(unsigned));
            }
            let (signed, lossless) = bigint.get_i64()?;
            if lossless {
                return Ok(HostValue::BigInt(signed));
            }
            Err(Error::from_reason("BigInt does not fit in 64 bits"))
        }
        ValueType::Object if value.is_buffer()? => {
            let buffer = JsBuffer::try_from(value)?.into_value()?;
            Ok(HostValue::Bytes(buffer.to_vec()))
        }
        other => Err(Error::from_reason(format!(
            "Unsupported argument type {:?}",
            other
        ))),
    }
}

fn handle_id(value: JsUnknown) -> Result<u64> {
    let value = js_to_host(value)?;
    value.as_id().ok_or_else(|| {
        Error::from_reason(format!("Expected a handle but got {}", value.type_name()))
    })
}

fn install_tracing(filter: &str) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    // A host that already installed a subscriber keeps it.
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

fn host_to_js(env: &Env, value: HostValue) -> Result<JsUnknown> {
    match value {
        HostValue::Undefined => Ok(env.get_undefined()?.into_unknown()),
        HostValue::Number(n) => Ok(env.create_double(n)?.into_unknown()),
        HostValue::BigInt(n) => env.create_bigint_from_i64(n)?.into_unknown(),
        HostValue::BigUint(n) => env.create_bigint_from_u64(n)?.into_unknown(),
        HostValue::String(s) => Ok(env.create_string(&s)?.into_unknown()),
        HostValue::Bytes(bytes) => Ok(env
            .create_buffer_with_data(bytes)?
            .into_raw()
            .into_unknown()),
        HostValue::Pending(id) => Ok(env.create_double(id as f64)?.into_unknown()),
    }
}

fn outcome_to_js(env: &Env, outcome: Outcome) -> Result<JsUnknown> {
    match outcome {
        Outcome::Ready(value) => host_to_js(env, value.into_host()),
        Outcome::Failed(e) => {
            let reason = serde_json::to_string(&e).unwrap_or_else(|_| e.to_string());
            Ok(env.create_string(&reason)?.into_unknown())
        }
        Outcome::Cancelled => Ok(env.get_undefined()?.into_unknown()),
    }
}

/// A registered native library exposed to Node.js
#[napi]
pub struct NativeModule {
    module: Arc<BridgeModule>,
    invoker: Arc<TsfnCallInvoker>,
}

#[napi]
impl NativeModule {
    /// Register the linked library, relaying completions through `invoker`
    #[napi(constructor)]
    pub fn new(env: Env, invoker: JsFunction, config: Option<JsBridgeConfig>) -> Result<Self> {
        let library = LIBRARY
            .get()
            .ok_or_else(|| Error::from_reason("No native library has been linked"))?;
        let config = config.map(BridgeConfig::from).unwrap_or_default();
        install_tracing(&config.log_filter);
        let invoker = Arc::new(TsfnCallInvoker::new(&env, invoker)?);

        let module = register_module(
            &HOST,
            Arc::clone(&invoker) as Arc<dyn CallInvoker>,
            library.as_ref(),
            config,
        )
        .map_err(to_napi_error)?;

        Ok(Self { module, invoker })
    }

    /// Installed module name
    #[napi(getter)]
    pub fn name(&self) -> String {
        self.module.name().to_string()
    }

    /// Contract version the module was registered against
    #[napi]
    pub fn contract_version(&self) -> u32 {
        self.module.contract_version()
    }

    /// Call an exposed method
    #[napi]
    pub fn call(&self, env: Env, method: String, args: Vec<JsUnknown>) -> Result<JsUnknown> {
        let args = args
            .into_iter()
            .map(js_to_host)
            .collect::<Result<Vec<_>>>()?;
        let value = self.module.call(&method, args).map_err(to_napi_error)?;
        host_to_js(&env, value)
    }

    /// Register `callback(status, value)` for a pending operation
    #[napi]
    pub fn poll_future(&self, operation: i64, callback: JsFunction) -> Result<()> {
        let tsfn: ThreadsafeFunction<Outcome, ErrorStrategy::Fatal> = callback
            .create_threadsafe_function(0, |ctx: ThreadSafeCallContext<Outcome>| {
                let status = ctx.env.create_int32(ctx.value.call_status() as i32)?;
                let value = outcome_to_js(&ctx.env, ctx.value)?;
                Ok(vec![status.into_unknown(), value])
            })?;

        self.module
            .poll_future(
                operation_id(operation)?,
                Box::new(move |outcome| {
                    tsfn.call(outcome, ThreadsafeFunctionCallMode::NonBlocking);
                }),
            )
            .map_err(to_napi_error)
    }

    /// Cancel a pending operation
    #[napi]
    pub fn cancel_future(&self, operation: i64) -> Result<bool> {
        self.module
            .cancel_future(operation_id(operation)?)
            .map_err(to_napi_error)
    }

    /// Free a pending operation
    #[napi]
    pub fn free_future(&self, operation: i64) -> Result<()> {
        self.module
            .free_future(operation_id(operation)?)
            .map_err(to_napi_error)
    }

    /// Hand the reference behind `handle` to a garbage-collected wrapper
    #[napi]
    pub fn adopt(&self, handle: JsUnknown) -> Result<ObjectRef> {
        let guard = self
            .module
            .adopt_handle(handle_id(handle)?)
            .map_err(to_napi_error)?;
        Ok(ObjectRef { guard })
    }

    /// Take an extra reference to `handle`, owned by a garbage-collected wrapper
    #[napi]
    pub fn retain(&self, handle: JsUnknown) -> Result<ObjectRef> {
        let guard = self
            .module
            .retain_handle(handle_id(handle)?)
            .map_err(to_napi_error)?;
        Ok(ObjectRef { guard })
    }

    /// Module statistics
    #[napi]
    pub fn stats(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self.module.stats())
            .map_err(|e| Error::from_reason(format!("Failed to encode stats: {}", e)))
    }

    /// Prometheus metrics
    #[napi]
    pub fn prometheus_metrics(&self) -> String {
        self.module.prometheus()
    }

    /// Unregister the module; returns whether it was still registered
    #[napi]
    pub fn dispose(&self) -> bool {
        self.invoker.close();
        unregister_module(&HOST, self.module.name())
    }
}

/// Native object reference freed when the JS wrapper is collected
#[napi]
pub struct ObjectRef {
    guard: HandleGuard,
}

#[napi]
impl ObjectRef {
    /// Handle id, or `undefined` once released
    #[napi(getter)]
    pub fn handle(&self, env: Env) -> Result<JsUnknown> {
        match self.guard.handle() {
            Some(handle) => env.create_bigint_from_u64(handle.id())?.into_unknown(),
            None => Ok(env.get_undefined()?.into_unknown()),
        }
    }

    /// Release the reference now instead of at collection
    #[napi]
    pub fn release(&mut self) -> Result<bool> {
        self.guard.release().map_err(to_napi_error)
    }
}

/// Contract version this addon was built with
#[napi]
pub fn bridge_contract_version() -> u32 {
    crate::CONTRACT_VERSION
}

/// Initialize logging ahead of module construction; returns whether a subscriber was installed
#[napi]
pub fn init(log_filter: Option<String>) -> bool {
    install_tracing(log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_conversion() {
        let js_config = JsBridgeConfig {
            worker_threads: Some(4),
            max_pending_operations: Some(64),
            contract_version: None,
            verify_checksums: Some(false),
            log_filter: None,
            debug: Some(true),
        };

        let config: BridgeConfig = js_config.into();

        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_pending_operations, 64);
        assert_eq!(config.contract_version, crate::CONTRACT_VERSION);
        assert!(!config.verify_checksums);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        assert!(config.debug);
    }

    #[test]
    fn test_tracing_installed_once() {
        let config = BridgeConfig::default().with_log_filter("lni_native_bridge=trace");
        install_tracing(&config.log_filter);
        assert!(!install_tracing(&config.log_filter));
        assert!(!init(None));
    }

    #[test]
    fn test_operation_id() {
        assert_eq!(operation_id(7).unwrap(), 7);
        assert!(operation_id(-1).is_err());
    }
}
