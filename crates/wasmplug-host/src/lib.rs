//! Wasmplug host runtime
//!
//! Invokes untrusted WASM plugin modules and exchanges byte buffers with
//! them across the sandbox boundary:
//! - Per-call instantiation: every operation runs in a fresh, short-lived
//!   instance that is torn down on all exit paths
//! - Descriptor-based marshaling: buffers and buffer arrays travel through
//!   guest linear memory behind packed (length, offset) descriptors
//! - Strict bounds validation on every boundary crossing, with typed errors
//! - Resource limits: memory/table growth caps and optional fuel metering
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Host                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────────┐   │
//! │  │ PluginRuntime│──▶│ PluginModule │──▶│ PluginCall  │   │
//! │  │   (engine)   │   │  (compiled)  │   │ (one call)  │   │
//! │  └──────────────┘   └──────────────┘   └──────┬──────┘   │
//! │                                               │          │
//! │  ┌────────────────────────────────────────────▼──────┐   │
//! │  │                   WASM sandbox                    │   │
//! │  │   __allocate ◀── buffers in ── descriptors out    │   │
//! │  │   __name / __params_info / __parse_params / ...   │   │
//! │  └───────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use wasmplug_host::PluginRuntime;
//!
//! # fn main() -> wasmplug_host::PluginResult<()> {
//! let runtime = PluginRuntime::default_runtime()?;
//! let plugin = runtime.load_file(Path::new("plugins/wordcount.wasm"))?;
//!
//! println!("loaded plugin: {}", plugin.name()?);
//! let output = plugin.execute(b"", &[b"some input".to_vec()])?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

mod call;
mod memory;
pub mod runtime;
mod types;

pub use memory::{GuestPtr, GuestSlice};
pub use runtime::{PluginModule, PluginRuntime, RuntimeConfig};
pub use types::{PluginError, PluginResult, PluginSymbol, ResourceLimits};
