//! # LNI Native Bridge
//!
//! This library exposes a native library's objects, asynchronous operations
//! and byte buffers to a single-threaded host runtime (a JavaScript engine)
//! with correct lifetime and cancellation semantics.
//!
//! ## Architecture
//!
//! ```text
//! Host runtime (single JS thread)
//!     │ call(name, args)                      ▲ continuation(outcome)
//!     ▼                                       │
//! Method Dispatch Table ── Handle Table       Call Invoker (queue + wake)
//!     │                 ── Buffer Codec       ▲
//!     ▼                                       │ schedule
//! Native entry point ──async──▶ Future Bridge ┘
//!     │
//!     ▼
//! Native worker runtime (tokio)
//! ```
//!
//! ## Features
//!
//! - **Handle Table**: refcounted opaque handles, never reused
//! - **Buffer Codec**: exact-length buffers and length-prefixed framing
//! - **Future Bridge**: one generic poll/cancel/complete/free state machine
//!   for every result kind
//! - **Call Invoker**: native threads resume the host only through a queue
//! - **Node.js binding**: N-API surface behind the `node` feature

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod handle;
pub mod invoker;
pub mod metrics;
pub mod module;
#[cfg(feature = "node")]
pub mod node;
pub mod value;

// Re-export commonly used types
pub use buffer::{FrameReader, FrameWriter, NativeBuffer};
pub use config::BridgeConfig;
pub use dispatch::{ArgKind, Args, CallScope, DispatchTable, MethodRegistration, Ret, ReturnKind};
pub use error::{BridgeError, ErrorCode, Result};
pub use future::{FfiReturn, FutureBridge, ObjectPointer, Outcome, ResultKind, ReturnValue};
pub use handle::{Handle, HandleGuard, HandleTable, TypeTag};
pub use invoker::{CallInvoker, HostLoop, QueuedCallInvoker};
pub use metrics::{BridgeMetrics, BridgeStats};
pub use module::{register_module, unregister_module, BridgeModule, HostRuntime, NativeLibrary};
pub use value::{HostValue, Scalar, ScalarKind};

/// Contract version between bindings and native libraries
pub const CONTRACT_VERSION: u32 = 26;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }

    #[test]
    fn test_default_config_matches_contract() {
        assert_eq!(BridgeConfig::default().contract_version, CONTRACT_VERSION);
    }
}
