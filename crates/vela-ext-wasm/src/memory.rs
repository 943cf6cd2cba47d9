use crate::abi::AbiValue;
use crate::error::AbiError;
use crate::state::ExtensionState;
use std::ops::Range;
use vela_ext_abi::v1::{MEMORY_EXPORT, REALLOC_EXPORT};
use wasmtime::{AsContextMut, Caller, Extern, Instance, Memory, StoreContextMut, TypedFunc};

pub(crate) type ReallocFn = TypedFunc<(i32, i32, i32, i32), i32>;

/// Alignment requested from the guest allocator, and the non-null
/// sentinel returned for zero-byte allocations.
const ALLOC_ALIGN: u32 = 4;

/// A view over one instance's linear memory.
///
/// Borrowed from the live store for the duration of one host call (or one
/// host-side lowering pass), so its lifetime never outlasts the instance.
/// All accessors are bounds-checked against the current memory size and
/// fail with [`AbiError`] instead of touching out-of-range bytes.
pub struct GuestMemory<'a> {
    store: StoreContextMut<'a, ExtensionState>,
    memory: Memory,
    realloc: Option<ReallocFn>,
}

impl<'a> GuestMemory<'a> {
    /// Resolves the accessor inside a host call.
    ///
    /// The `memory` and `cabi_realloc` exports are looked up once per
    /// instance and cached in [`ExtensionState`].
    pub fn from_caller(caller: &'a mut Caller<'_, ExtensionState>) -> Result<Self, AbiError> {
        let memory = match caller.data().memory {
            Some(memory) => memory,
            None => {
                let memory = caller
                    .get_export(MEMORY_EXPORT)
                    .and_then(Extern::into_memory)
                    .ok_or(AbiError::MissingExport {
                        name: MEMORY_EXPORT,
                    })?;
                caller.data_mut().memory = Some(memory);
                memory
            }
        };

        let realloc = match caller.data().realloc {
            Some(realloc) => Some(realloc),
            None => match caller.get_export(REALLOC_EXPORT).and_then(Extern::into_func) {
                Some(func) => {
                    let realloc = func
                        .typed::<(i32, i32, i32, i32), i32>(&*caller)
                        .map_err(|_| AbiError::ExportType {
                            name: REALLOC_EXPORT,
                        })?;
                    caller.data_mut().realloc = Some(realloc);
                    Some(realloc)
                }
                None => None,
            },
        };

        Ok(Self {
            store: caller.as_context_mut(),
            memory,
            realloc,
        })
    }

    /// Resolves the accessor from an instance, for host-side lowering
    /// outside of a guest call (preparing arguments, reading results).
    pub fn from_instance(
        mut store: StoreContextMut<'a, ExtensionState>,
        instance: &Instance,
    ) -> Result<Self, AbiError> {
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or(AbiError::MissingExport {
                name: MEMORY_EXPORT,
            })?;
        let realloc = instance
            .get_typed_func::<(i32, i32, i32, i32), i32>(&mut store, REALLOC_EXPORT)
            .ok();
        Ok(Self {
            store,
            memory,
            realloc,
        })
    }

    /// Current memory size in bytes.
    pub fn size(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }

    pub fn state(&self) -> &ExtensionState {
        self.store.data()
    }

    pub fn state_mut(&mut self) -> &mut ExtensionState {
        self.store.data_mut()
    }

    fn data(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    fn checked_range(&self, offset: u32, len: u32) -> Result<Range<usize>, AbiError> {
        let end = offset as u64 + len as u64;
        if end > self.size() {
            return Err(AbiError::OutOfBounds {
                offset,
                len,
                size: self.size(),
            });
        }
        Ok(offset as usize..end as usize)
    }

    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>, AbiError> {
        let range = self.checked_range(offset, len)?;
        Ok(self.data()[range].to_vec())
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<(), AbiError> {
        let len = u32::try_from(bytes.len()).map_err(|_| AbiError::AddressOverflow {
            base: offset,
            offset: bytes.len() as u64,
        })?;
        let range = self.checked_range(offset, len)?;
        self.data_mut()[range].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn zero(&mut self, offset: u32, len: u32) -> Result<(), AbiError> {
        let range = self.checked_range(offset, len)?;
        self.data_mut()[range].fill(0);
        Ok(())
    }

    pub fn read_u8(&self, offset: u32) -> Result<u8, AbiError> {
        let range = self.checked_range(offset, 1)?;
        Ok(self.data()[range.start])
    }

    pub fn write_u8(&mut self, offset: u32, value: u8) -> Result<(), AbiError> {
        self.write_bytes(offset, &[value])
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32, AbiError> {
        let range = self.checked_range(offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data()[range]);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), AbiError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn read_u64(&self, offset: u32) -> Result<u64, AbiError> {
        let range = self.checked_range(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data()[range]);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&mut self, offset: u32, value: u64) -> Result<(), AbiError> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn read_i32(&self, offset: u32) -> Result<i32, AbiError> {
        Ok(self.read_u32(offset)? as i32)
    }

    pub fn write_i32(&mut self, offset: u32, value: i32) -> Result<(), AbiError> {
        self.write_u32(offset, value as u32)
    }

    pub fn read_i64(&self, offset: u32) -> Result<i64, AbiError> {
        Ok(self.read_u64(offset)? as i64)
    }

    pub fn write_i64(&mut self, offset: u32, value: i64) -> Result<(), AbiError> {
        self.write_u64(offset, value as u64)
    }

    pub fn read_f32(&self, offset: u32) -> Result<f32, AbiError> {
        Ok(f32::from_bits(self.read_u32(offset)?))
    }

    pub fn write_f32(&mut self, offset: u32, value: f32) -> Result<(), AbiError> {
        self.write_u32(offset, value.to_bits())
    }

    pub fn read_f64(&self, offset: u32) -> Result<f64, AbiError> {
        Ok(f64::from_bits(self.read_u64(offset)?))
    }

    pub fn write_f64(&mut self, offset: u32, value: f64) -> Result<(), AbiError> {
        self.write_u64(offset, value.to_bits())
    }

    /// Reads `len` bytes at `ptr` and UTF-8-decodes them.
    pub fn read_str(&self, ptr: u32, len: u32) -> Result<String, AbiError> {
        let range = self.checked_range(ptr, len)?;
        match std::str::from_utf8(&self.data()[range]) {
            Ok(text) => Ok(text.to_owned()),
            Err(source) => Err(AbiError::InvalidUtf8 { ptr, len, source }),
        }
    }

    /// Lowers a string: allocates space via the guest allocator, writes
    /// the UTF-8 bytes, and returns the (pointer, length) pair.
    pub fn write_str(&mut self, text: &str) -> Result<(u32, u32), AbiError> {
        let len = u32::try_from(text.len()).map_err(|_| AbiError::AddressOverflow {
            base: 0,
            offset: text.len() as u64,
        })?;
        let ptr = self.allocate(len)?;
        self.write_bytes(ptr, text.as_bytes())?;
        Ok((ptr, len))
    }

    /// Allocates `size` bytes in guest memory through the guest's own
    /// exported allocator, so ownership stays guest-controlled.
    ///
    /// A zero `size` returns a non-null aligned sentinel without calling
    /// into the guest.
    pub fn allocate(&mut self, size: u32) -> Result<u32, AbiError> {
        if size == 0 {
            return Ok(ALLOC_ALIGN);
        }
        if size > i32::MAX as u32 {
            return Err(AbiError::AllocationFailed {
                size,
                message: "size exceeds the guest address range".to_string(),
            });
        }
        let realloc = self.realloc.ok_or(AbiError::MissingExport {
            name: REALLOC_EXPORT,
        })?;
        let ptr = realloc
            .call(&mut self.store, (0, 0, ALLOC_ALIGN as i32, size as i32))
            .map_err(|source| AbiError::AllocationFailed {
                size,
                message: source.to_string(),
            })?;
        if ptr == 0 {
            return Err(AbiError::AllocationFailed {
                size,
                message: "guest allocator returned a null pointer".to_string(),
            });
        }
        Ok(ptr as u32)
    }

    /// Encodes `value` starting at `offset` (typically a guest-supplied
    /// return pointer).
    pub fn store_at<T: AbiValue>(&mut self, offset: u32, value: &T) -> Result<(), AbiError> {
        value.store(self, offset)
    }

    /// Decodes a `T` starting at `offset`.
    pub fn load_at<T: AbiValue>(&self, offset: u32) -> Result<T, AbiError> {
        T::load(self, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExtensionState;
    use wasmtime::{Engine, Linker, Module, Store};

    const FIXTURE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 64))

  (func (export "cabi_realloc") (param i32 i32 i32 i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get 3)))
    (local.get $ptr)
  )
)
"#;

    const NO_ALLOC_WAT: &str = r#"
(module
  (memory (export "memory") 1)
)
"#;

    fn instantiate(wat_src: &str) -> (Store<ExtensionState>, Instance) {
        let engine = Engine::default();
        let module = Module::new(&engine, wat::parse_str(wat_src).unwrap()).unwrap();
        let mut store = Store::new(&engine, ExtensionState::new());
        let linker = Linker::new(&engine);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        (store, instance)
    }

    #[test]
    fn integers_round_trip_little_endian() {
        let (mut store, instance) = instantiate(FIXTURE_WAT);
        let mut memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        memory.write_u32(16, 0x1122_3344).unwrap();
        assert_eq!(memory.read_bytes(16, 4).unwrap(), [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(memory.read_u32(16).unwrap(), 0x1122_3344);

        memory.write_u64(24, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(
            memory.read_bytes(24, 8).unwrap(),
            [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(memory.read_u64(24).unwrap(), 0x0102_0304_0506_0708);

        memory.write_i64(32, -5).unwrap();
        assert_eq!(memory.read_i64(32).unwrap(), -5);

        memory.write_f64(40, 2.5).unwrap();
        assert_eq!(memory.read_f64(40).unwrap(), 2.5);
    }

    #[test]
    fn out_of_bounds_reads_are_rejected() {
        let (mut store, instance) = instantiate(FIXTURE_WAT);
        let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        // One wasm page.
        assert_eq!(memory.size(), 0x10000);
        assert!(memory.read_bytes(0xffff, 1).is_ok());
        let error = memory.read_bytes(0xffff, 2).unwrap_err();
        assert!(matches!(error, AbiError::OutOfBounds { .. }));
        let error = memory.read_u32(0xfffe).unwrap_err();
        assert!(matches!(error, AbiError::OutOfBounds { .. }));
    }

    #[test]
    fn out_of_bounds_writes_are_rejected() {
        let (mut store, instance) = instantiate(FIXTURE_WAT);
        let mut memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        let error = memory.write_bytes(0xfffd, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(error, AbiError::OutOfBounds { .. }));
        // The failed write must not have touched the tail bytes.
        assert_eq!(memory.read_bytes(0xfffd, 3).unwrap(), [0, 0, 0]);
    }

    #[test]
    fn strings_lower_through_the_guest_allocator() {
        let (mut store, instance) = instantiate(FIXTURE_WAT);
        let mut memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        let (ptr, len) = memory.write_str("grüße").unwrap();
        assert_eq!(len, "grüße".len() as u32);
        assert_eq!(memory.read_str(ptr, len).unwrap(), "grüße");
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let (mut store, instance) = instantiate(FIXTURE_WAT);
        let mut memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        memory.write_bytes(8, &[0xff, 0xfe]).unwrap();
        let error = memory.read_str(8, 2).unwrap_err();
        assert!(matches!(
            error,
            AbiError::InvalidUtf8 { ptr: 8, len: 2, .. }
        ));
    }

    #[test]
    fn allocate_without_guest_allocator_fails_cleanly() {
        let (mut store, instance) = instantiate(NO_ALLOC_WAT);
        let mut memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        let error = memory.allocate(8).unwrap_err();
        assert!(matches!(
            error,
            AbiError::MissingExport {
                name: "cabi_realloc"
            }
        ));
    }

    #[test]
    fn zero_sized_allocations_skip_the_guest() {
        let (mut store, instance) = instantiate(NO_ALLOC_WAT);
        let mut memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();

        let ptr = memory.allocate(0).unwrap();
        assert_ne!(ptr, 0);
    }
}
