//! Guest memory addressing
//!
//! Descriptors for byte ranges in a plugin's linear memory, plus
//! bounds-checked copies in and out of it. On the wire a descriptor is a
//! single `u64` with the length in the upper 32 bits and the offset in the
//! lower 32; inside the host it is always the explicit [`GuestSlice`] pair,
//! converted at the serialization boundary only.

use wasmtime::{AsContext, AsContextMut, Memory};

use crate::types::{PluginError, PluginResult};

/// Guest pointer (32-bit address in WASM linear memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestPtr(pub u32);

impl GuestPtr {
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn offset(&self, bytes: u32) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for GuestPtr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl From<GuestPtr> for u32 {
    fn from(ptr: GuestPtr) -> Self {
        ptr.0
    }
}

/// Guest slice (pointer + length), the host-side form of a wire descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    pub ptr: GuestPtr,
    pub len: u32,
}

impl GuestSlice {
    pub fn new(ptr: GuestPtr, len: u32) -> Self {
        Self { ptr, len }
    }

    /// Split a wire descriptor into its (length, offset) pair.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            ptr: GuestPtr((raw & 0xffff_ffff) as u32),
            len: (raw >> 32) as u32,
        }
    }

    /// Pack into the wire descriptor: length in the upper 32 bits, offset in
    /// the lower 32.
    pub fn into_raw(self) -> u64 {
        ((self.len as u64) << 32) | self.ptr.0 as u64
    }

    /// Encoding of this descriptor as one element of a guest-side
    /// descriptor table.
    pub fn to_wire_bytes(self) -> [u8; 8] {
        self.into_raw().to_le_bytes()
    }
}

/// Copy a guest range into a host-owned buffer.
///
/// The copy keeps the bytes valid after the owning instance is dropped.
pub(crate) fn read_bytes(
    memory: &Memory,
    store: impl AsContext,
    slice: GuestSlice,
) -> PluginResult<Vec<u8>> {
    let data = memory.data(&store);
    let start = slice.ptr.as_usize();
    let end = start
        .checked_add(slice.len as usize)
        .ok_or(PluginError::InvalidMemoryBounds {
            offset: slice.ptr.into(),
            len: slice.len,
            size: data.len(),
        })?;

    if end > data.len() {
        return Err(PluginError::InvalidMemoryBounds {
            offset: slice.ptr.into(),
            len: slice.len,
            size: data.len(),
        });
    }

    Ok(data[start..end].to_vec())
}

/// Copy host bytes into guest memory at `ptr`.
pub(crate) fn write_bytes(
    memory: &Memory,
    mut store: impl AsContextMut,
    ptr: GuestPtr,
    data: &[u8],
) -> PluginResult<()> {
    let mem = memory.data_mut(&mut store);
    let start = ptr.as_usize();
    let end = start
        .checked_add(data.len())
        .ok_or(PluginError::InvalidMemoryBounds {
            offset: ptr.into(),
            len: data.len() as u32,
            size: mem.len(),
        })?;

    if end > mem.len() {
        return Err(PluginError::InvalidMemoryBounds {
            offset: ptr.into(),
            len: data.len() as u32,
            size: mem.len(),
        });
    }

    mem[start..end].copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    fn test_memory() -> (Store<()>, Memory) {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let memory = Memory::new(&mut store, MemoryType::new(1, Some(1))).unwrap();
        (store, memory)
    }

    #[test]
    fn test_descriptor_round_trip() {
        for (len, offset) in [
            (0u32, 0u32),
            (1, 0),
            (0, 1),
            (13, 1024),
            (u32::MAX, 0),
            (0, u32::MAX),
            (u32::MAX, u32::MAX),
        ] {
            let slice = GuestSlice::new(GuestPtr::new(offset), len);
            let decoded = GuestSlice::from_raw(slice.into_raw());
            assert_eq!(decoded, slice);
        }
    }

    #[test]
    fn test_descriptor_wire_layout() {
        let slice = GuestSlice::new(GuestPtr::new(0x11223344), 0x55667788);
        assert_eq!(slice.into_raw(), 0x5566778811223344);
        assert_eq!(
            slice.to_wire_bytes(),
            [0x44, 0x33, 0x22, 0x11, 0x88, 0x77, 0x66, 0x55]
        );
    }

    #[test]
    fn test_read_write_round_trip() {
        let (mut store, memory) = test_memory();
        let data = b"hello, guest";
        let ptr = GuestPtr::new(1024);

        write_bytes(&memory, &mut store, ptr, data).unwrap();
        let read = read_bytes(&memory, &store, GuestSlice::new(ptr, data.len() as u32)).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_read_rejects_out_of_bounds() {
        let (store, memory) = test_memory();

        // One byte past the end of a 64KB memory.
        let slice = GuestSlice::new(GuestPtr::new(65536 - 9), 10);
        let err = read_bytes(&memory, &store, slice).unwrap_err();
        assert!(matches!(err, PluginError::InvalidMemoryBounds { .. }));
    }

    #[test]
    fn test_read_rejects_offset_overflow() {
        let (store, memory) = test_memory();

        let slice = GuestSlice::new(GuestPtr::new(u32::MAX), u32::MAX);
        let err = read_bytes(&memory, &store, slice).unwrap_err();
        assert!(matches!(err, PluginError::InvalidMemoryBounds { .. }));
    }

    #[test]
    fn test_write_rejects_out_of_bounds() {
        let (mut store, memory) = test_memory();

        let err = write_bytes(&memory, &mut store, GuestPtr::new(65535), &[1, 2]).unwrap_err();
        assert!(matches!(err, PluginError::InvalidMemoryBounds { .. }));
    }
}
