//! Per-call plugin instantiation and marshaling
//!
//! A [`PluginCall`] is one live instantiation of a plugin module, scoped to a
//! single host operation. It owns the store, so dropping it tears the
//! instance down on every exit path, including failures while inputs are
//! still being written.

use tracing::debug;
use wasmtime::{
    Engine, Instance, Memory, Module, ResourceLimiter, Store, TypedFunc, WasmParams, WasmResults,
};

use crate::memory::{self, GuestPtr, GuestSlice};
use crate::types::{PluginError, PluginResult, PluginSymbol, ResourceLimits};

/// Export name of the guest's linear memory.
const MEMORY_EXPORT: &str = "memory";

/// Size of one descriptor-table entry in guest memory.
const DESCRIPTOR_SIZE: u32 = 8;

/// Store-level limiter for guest memory and table growth
#[derive(Debug)]
struct StoreLimits {
    max_memory_bytes: usize,
    max_table_elements: usize,
}

impl StoreLimits {
    fn new(limits: &ResourceLimits) -> Self {
        Self {
            max_memory_bytes: limits.max_memory_bytes() as usize,
            max_table_elements: limits.max_table_elements as usize,
        }
    }
}

impl ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let max = maximum.unwrap_or(self.max_memory_bytes);
        Ok(desired <= max && desired <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let max = maximum.unwrap_or(self.max_table_elements);
        Ok(desired <= max && desired <= self.max_table_elements)
    }
}

/// State stored in the wasmtime store for one call
#[derive(Debug)]
struct CallState {
    limits: StoreLimits,
}

/// One live plugin instantiation, scoped to a single operation
#[derive(Debug)]
pub(crate) struct PluginCall {
    store: Store<CallState>,
    instance: Instance,
    memory: Memory,
}

impl PluginCall {
    /// Instantiate the module and resolve every export the operation needs.
    ///
    /// Export presence is checked here, before any input is written, so a
    /// non-conforming module fails with [`PluginError::MissingExport`]
    /// instead of partway through population.
    pub(crate) fn new(
        engine: &Engine,
        module: &Module,
        limits: &ResourceLimits,
        required: &[PluginSymbol],
    ) -> PluginResult<Self> {
        let state = CallState {
            limits: StoreLimits::new(limits),
        };
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = limits.max_fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| PluginError::Internal(e.to_string()))?;
        }

        let instance = Instance::new(&mut store, module, &[])
            .map_err(|e| PluginError::Instantiation(e.to_string()))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or(PluginError::MissingExport(MEMORY_EXPORT))?;

        for symbol in required {
            if instance
                .get_func(&mut store, symbol.export_name())
                .is_none()
            {
                return Err(PluginError::MissingExport(symbol.export_name()));
            }
        }

        Ok(Self {
            store,
            instance,
            memory,
        })
    }

    fn typed<P, R>(&mut self, symbol: PluginSymbol) -> PluginResult<TypedFunc<P, R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_func(&mut self.store, symbol.export_name())
            .ok_or(PluginError::MissingExport(symbol.export_name()))?;
        func.typed(&self.store)
            .map_err(|e| PluginError::SignatureMismatch {
                name: symbol.export_name(),
                reason: e.to_string(),
            })
    }

    /// Ask the guest to reserve `size` bytes of its memory.
    ///
    /// The allocator runs guest code and may grow (or lie about) memory, so
    /// the returned range is re-validated against the current memory size
    /// before anything is written through it.
    fn alloc(&mut self, size: u32) -> PluginResult<GuestPtr> {
        let allocate = self.typed::<i32, i32>(PluginSymbol::Allocate)?;
        let offset = allocate
            .call(&mut self.store, size as i32)
            .map_err(|error| PluginError::GuestTrap {
                symbol: PluginSymbol::Allocate.export_name(),
                error,
            })? as u32;

        let available = self.memory.data_size(&self.store);
        let ptr = GuestPtr::new(offset);
        match ptr.as_usize().checked_add(size as usize) {
            Some(end) if end <= available => {
                debug!("guest allocated {} bytes at {:?}", size, ptr);
                Ok(ptr)
            }
            _ => Err(PluginError::InsufficientMemory {
                requested: size,
                offset,
                available,
            }),
        }
    }

    /// Copy one host buffer into guest memory and return its descriptor.
    pub(crate) fn store_buffer(&mut self, data: &[u8]) -> PluginResult<GuestSlice> {
        let len = u32::try_from(data.len()).map_err(|_| PluginError::BufferTooLarge(data.len()))?;
        let ptr = self.alloc(len)?;
        memory::write_bytes(&self.memory, &mut self.store, ptr, data)?;
        Ok(GuestSlice::new(ptr, len))
    }

    /// Copy an ordered sequence of host buffers into guest memory.
    ///
    /// The elements land wherever the guest allocator puts them; a
    /// contiguous table of their wire descriptors, one 8-byte entry per
    /// element in order, is written separately. The returned descriptor
    /// addresses the table and carries the element count in its length
    /// field. The first element failure aborts the whole call.
    pub(crate) fn store_buffer_array(&mut self, buffers: &[Vec<u8>]) -> PluginResult<GuestSlice> {
        let count = u32::try_from(buffers.len())
            .map_err(|_| PluginError::BufferTooLarge(buffers.len()))?;
        let table_len = count
            .checked_mul(DESCRIPTOR_SIZE)
            .ok_or(PluginError::BufferTooLarge(buffers.len()))?;

        let table = self.alloc(table_len)?;
        for (index, buffer) in buffers.iter().enumerate() {
            let slice = self.store_buffer(buffer)?;
            let entry = table.offset(index as u32 * DESCRIPTOR_SIZE);
            memory::write_bytes(&self.memory, &mut self.store, entry, &slice.to_wire_bytes())?;
        }

        debug!(
            "stored {} buffers behind a {} byte descriptor table",
            count, table_len
        );
        Ok(GuestSlice::new(table, count))
    }

    /// Call a zero-argument export returning a descriptor.
    pub(crate) fn invoke(&mut self, symbol: PluginSymbol) -> PluginResult<i64> {
        let func = self.typed::<(), i64>(symbol)?;
        debug!("calling guest export {}", symbol);
        func.call(&mut self.store, ())
            .map_err(|error| PluginError::GuestTrap {
                symbol: symbol.export_name(),
                error,
            })
    }

    /// Call a one-descriptor export returning a descriptor.
    pub(crate) fn invoke1(&mut self, symbol: PluginSymbol, a: GuestSlice) -> PluginResult<i64> {
        let func = self.typed::<i64, i64>(symbol)?;
        debug!("calling guest export {}", symbol);
        func.call(&mut self.store, a.into_raw() as i64)
            .map_err(|error| PluginError::GuestTrap {
                symbol: symbol.export_name(),
                error,
            })
    }

    /// Call a two-descriptor export returning a descriptor.
    pub(crate) fn invoke2(
        &mut self,
        symbol: PluginSymbol,
        a: GuestSlice,
        b: GuestSlice,
    ) -> PluginResult<i64> {
        let func = self.typed::<(i64, i64), i64>(symbol)?;
        debug!("calling guest export {}", symbol);
        func.call(&mut self.store, (a.into_raw() as i64, b.into_raw() as i64))
            .map_err(|error| PluginError::GuestTrap {
                symbol: symbol.export_name(),
                error,
            })
    }

    /// Validate a guest-returned descriptor and copy its bytes out.
    pub(crate) fn parse_output(&mut self, raw: i64) -> PluginResult<Vec<u8>> {
        let slice = GuestSlice::from_raw(raw as u64);
        memory::read_bytes(&self.memory, &self.store, slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUMP_ALLOCATOR: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (func (export "__allocate") (param $size i32) (result i32)
                (local $ptr i32)
                global.get $heap
                local.set $ptr
                global.get $heap
                local.get $size
                i32.add
                global.set $heap
                local.get $ptr))
    "#;

    // Claims an offset far past the end of its single memory page.
    const LYING_ALLOCATOR: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "__allocate") (param i32) (result i32)
                i32.const 2000000000))
    "#;

    fn new_call(wat: &str, required: &[PluginSymbol]) -> PluginResult<PluginCall> {
        let engine = Engine::default();
        let module = Module::new(&engine, wat).unwrap();
        PluginCall::new(&engine, &module, &ResourceLimits::unlimited(), required)
    }

    #[test]
    fn test_store_buffer_round_trip() {
        let mut call = new_call(BUMP_ALLOCATOR, &[PluginSymbol::Allocate]).unwrap();

        let payload = b"some plugin parameters";
        let slice = call.store_buffer(payload).unwrap();
        assert_eq!(slice.len, payload.len() as u32);

        let read = call.parse_output(slice.into_raw() as i64).unwrap();
        assert_eq!(read, payload);
    }

    #[test]
    fn test_store_buffer_array_table_layout() {
        let mut call = new_call(BUMP_ALLOCATOR, &[PluginSymbol::Allocate]).unwrap();

        let buffers = vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()];
        let outer = call.store_buffer_array(&buffers).unwrap();
        assert_eq!(outer.len, 3);

        // Walk the descriptor table the way a guest would and check every
        // element comes back in order.
        let table = memory::read_bytes(
            &call.memory,
            &call.store,
            GuestSlice::new(outer.ptr, 3 * DESCRIPTOR_SIZE),
        )
        .unwrap();
        for (index, expected) in buffers.iter().enumerate() {
            let entry: [u8; 8] = table[index * 8..index * 8 + 8].try_into().unwrap();
            let slice = GuestSlice::from_raw(u64::from_le_bytes(entry));
            assert_eq!(slice.len, expected.len() as u32);

            let element = memory::read_bytes(&call.memory, &call.store, slice).unwrap();
            assert_eq!(&element, expected);
        }
    }

    #[test]
    fn test_store_empty_buffer_array() {
        let mut call = new_call(BUMP_ALLOCATOR, &[PluginSymbol::Allocate]).unwrap();

        let outer = call.store_buffer_array(&[]).unwrap();
        assert_eq!(outer.len, 0);
    }

    #[test]
    fn test_allocator_out_of_range_offset_is_rejected() {
        let mut call = new_call(LYING_ALLOCATOR, &[PluginSymbol::Allocate]).unwrap();

        let err = call.store_buffer(b"payload").unwrap_err();
        assert!(matches!(err, PluginError::InsufficientMemory { .. }));
    }

    #[test]
    fn test_missing_allocate_export() {
        let err = new_call(
            r#"(module (memory (export "memory") 1))"#,
            &[PluginSymbol::Allocate],
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::MissingExport("__allocate")));
    }

    #[test]
    fn test_module_without_memory_export() {
        let err = new_call("(module)", &[]).unwrap_err();
        assert!(matches!(err, PluginError::MissingExport("memory")));
    }
}
