//! Plugin runtime
//!
//! One [`PluginRuntime`] holds the engine; [`PluginModule`] is a compiled
//! plugin exposing the host-facing operations. Every operation instantiates
//! the module fresh, writes its inputs, calls the guest export, copies the
//! result out, and drops the instance; nothing guest-side survives a call.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::info;
use wasmtime::{Config, Engine, Module};

use crate::call::PluginCall;
use crate::types::{PluginError, PluginResult, PluginSymbol, ResourceLimits};

/// Runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Resource limits applied to every call
    pub limits: ResourceLimits,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Convert to a wasmtime Config
    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();
        config.consume_fuel(self.limits.max_fuel.is_some());
        config
    }
}

/// Plugin runtime: one engine, many compiled modules
pub struct PluginRuntime {
    engine: Engine,
    config: RuntimeConfig,
}

impl PluginRuntime {
    /// Create a new runtime
    pub fn new(config: RuntimeConfig) -> PluginResult<Self> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| PluginError::Internal(format!("failed to create engine: {e}")))?;
        Ok(Self { engine, config })
    }

    /// Create with default configuration
    pub fn default_runtime() -> PluginResult<Self> {
        Self::new(RuntimeConfig::default())
    }

    /// Get the wasmtime engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compile plugin bytecode.
    ///
    /// The bytes are treated as opaque; nothing is instantiated yet and the
    /// input is not retained.
    pub fn load(&self, bytes: &[u8]) -> PluginResult<PluginModule> {
        let start = Instant::now();
        let module =
            Module::new(&self.engine, bytes).map_err(|e| PluginError::Compilation(e.to_string()))?;
        info!(
            "compiled plugin module in {}ms ({} bytes)",
            start.elapsed().as_millis(),
            bytes.len()
        );

        Ok(PluginModule {
            module,
            engine: self.engine.clone(),
            limits: self.config.limits.clone(),
        })
    }

    /// Read plugin bytecode from a file and compile it.
    pub fn load_file(&self, path: &Path) -> PluginResult<PluginModule> {
        let bytes = std::fs::read(path)?;
        self.load(&bytes)
    }
}

/// A compiled plugin module
///
/// Each operation below creates its own short-lived instance, so a
/// `PluginModule` is immutable and can be shared across threads freely.
#[derive(Debug)]
pub struct PluginModule {
    module: Module,
    engine: Engine,
    limits: ResourceLimits,
}

impl PluginModule {
    fn instantiate(&self, required: &[PluginSymbol]) -> PluginResult<PluginCall> {
        PluginCall::new(&self.engine, &self.module, &self.limits, required)
    }

    /// The plugin's self-reported name.
    ///
    /// Fails with [`PluginError::InvalidName`] unless every character of the
    /// returned string is printable.
    pub fn name(&self) -> PluginResult<String> {
        let mut call = self.instantiate(&[PluginSymbol::Name])?;
        let raw = call.invoke(PluginSymbol::Name)?;
        let bytes = call.parse_output(raw)?;

        let name = String::from_utf8(bytes).map_err(|e| PluginError::InvalidName(e.to_string()))?;
        if let Some(ch) = name.chars().find(|ch| ch.is_control()) {
            return Err(PluginError::InvalidName(format!(
                "control character {ch:?}"
            )));
        }
        Ok(name)
    }

    /// Self-describing parameter schema bytes; the format is the plugin's.
    pub fn params_info(&self) -> PluginResult<Vec<u8>> {
        let mut call = self.instantiate(&[PluginSymbol::ParamsInfo])?;
        let raw = call.invoke(PluginSymbol::ParamsInfo)?;
        call.parse_output(raw)
    }

    /// Hand a parameter buffer to the plugin's parser.
    pub fn parse_params(&self, params: &[u8]) -> PluginResult<Vec<u8>> {
        let mut call = self.instantiate(&[PluginSymbol::Allocate, PluginSymbol::ParseParams])?;
        let params = call.store_buffer(params)?;
        let raw = call.invoke1(PluginSymbol::ParseParams, params)?;
        call.parse_output(raw)
    }

    /// Self-describing raw-data schema bytes.
    pub fn raw_data_info(&self) -> PluginResult<Vec<u8>> {
        let mut call = self.instantiate(&[PluginSymbol::RawDataInfo])?;
        let raw = call.invoke(PluginSymbol::RawDataInfo)?;
        call.parse_output(raw)
    }

    /// Hand a parameter buffer and a raw data buffer to the plugin's parser.
    pub fn parse_raw_data(&self, params: &[u8], data: &[u8]) -> PluginResult<Vec<u8>> {
        let mut call = self.instantiate(&[PluginSymbol::Allocate, PluginSymbol::ParseRawData])?;
        let params = call.store_buffer(params)?;
        let data = call.store_buffer(data)?;
        let raw = call.invoke2(PluginSymbol::ParseRawData, params, data)?;
        call.parse_output(raw)
    }

    /// Run the plugin's preparation step.
    pub fn prepare(&self, params: &[u8]) -> PluginResult<Vec<u8>> {
        let mut call = self.instantiate(&[PluginSymbol::Allocate, PluginSymbol::Prepare])?;
        let params = call.store_buffer(params)?;
        let raw = call.invoke1(PluginSymbol::Prepare, params)?;
        call.parse_output(raw)
    }

    /// Run the plugin against an ordered sequence of input buffers.
    pub fn execute(&self, params: &[u8], inputs: &[Vec<u8>]) -> PluginResult<Vec<u8>> {
        let mut call = self.instantiate(&[PluginSymbol::Allocate, PluginSymbol::Execute])?;
        let params = call.store_buffer(params)?;
        let inputs = call.store_buffer_array(inputs)?;
        let raw = call.invoke2(PluginSymbol::Execute, params, inputs)?;
        call.parse_output(raw)
    }
}
