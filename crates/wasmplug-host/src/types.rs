//! Core types for the plugin host
//!
//! The error taxonomy, the plugin export table, and resource limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Functions a plugin module exports to the host.
///
/// Export lookups go through this enum rather than ad hoc strings, so a
/// module missing a function surfaces as [`PluginError::MissingExport`]
/// before any input is written into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginSymbol {
    /// `__allocate(size: i32) -> i32`, reserves guest memory for host writes
    Allocate,
    /// `__name() -> i64`, descriptor for a printable name string
    Name,
    /// `__params_info() -> i64`, descriptor for the parameter schema bytes
    ParamsInfo,
    /// `__parse_params(params: i64) -> i64`
    ParseParams,
    /// `__raw_data_info() -> i64`, descriptor for the raw-data schema bytes
    RawDataInfo,
    /// `__parse_raw_data(params: i64, data: i64) -> i64`
    ParseRawData,
    /// `__prepare(params: i64) -> i64`
    Prepare,
    /// `__execute(params: i64, inputs: i64) -> i64`
    Execute,
}

impl PluginSymbol {
    /// Name of the function in the module's export table.
    pub const fn export_name(self) -> &'static str {
        match self {
            PluginSymbol::Allocate => "__allocate",
            PluginSymbol::Name => "__name",
            PluginSymbol::ParamsInfo => "__params_info",
            PluginSymbol::ParseParams => "__parse_params",
            PluginSymbol::RawDataInfo => "__raw_data_info",
            PluginSymbol::ParseRawData => "__parse_raw_data",
            PluginSymbol::Prepare => "__prepare",
            PluginSymbol::Execute => "__execute",
        }
    }
}

impl fmt::Display for PluginSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Plugin host errors
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to compile plugin module: {0}")]
    Compilation(String),

    #[error("Failed to instantiate plugin module: {0}")]
    Instantiation(String),

    #[error("Export not found: {0}")]
    MissingExport(&'static str),

    #[error("Export {name} has an unexpected signature: {reason}")]
    SignatureMismatch { name: &'static str, reason: String },

    #[error(
        "Guest allocator returned offset {offset:#x} for {requested} bytes, memory size is {available}"
    )]
    InsufficientMemory {
        requested: u32,
        offset: u32,
        available: usize,
    },

    #[error("Descriptor out of bounds: offset={offset}, len={len}, memory size={size}")]
    InvalidMemoryBounds { offset: u32, len: u32, size: usize },

    #[error("Buffer of {0} bytes does not fit the 32-bit guest address space")]
    BufferTooLarge(usize),

    #[error("Plugin name is not printable: {0}")]
    InvalidName(String),

    #[error("Guest call to {symbol} failed: {error}")]
    GuestTrap {
        symbol: &'static str,
        error: wasmtime::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Plugin host result type
pub type PluginResult<T> = Result<T, PluginError>;

/// Resource limits applied to every plugin call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory pages (64KB each)
    pub max_memory_pages: u32,
    /// Maximum table elements
    pub max_table_elements: u32,
    /// Maximum fuel (instruction count) per call; `None` disables metering
    pub max_fuel: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_pages: 256, // 16MB
            max_table_elements: 10000,
            max_fuel: Some(100_000_000), // ~100M instructions
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_memory_pages: u32::MAX,
            max_table_elements: u32::MAX,
            max_fuel: None,
        }
    }

    pub fn restrictive() -> Self {
        Self {
            max_memory_pages: 16, // 1MB
            max_table_elements: 1000,
            max_fuel: Some(10_000_000),
        }
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_pages as u64 * 65536
    }
}
