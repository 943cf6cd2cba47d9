use super::{advance, AbiValue, ToAbi};
use crate::error::AbiError;
use crate::memory::GuestMemory;
use std::fmt;
use std::marker::PhantomData;
use vela_ext_abi::v1::PTR_LEN_PAIR_SIZE;

/// A guest list: an 8-byte (pointer, element count) pair over `len`
/// elements of width `T::SIZE` packed back to back, so element `i` sits
/// at `ptr + i * T::SIZE`.
///
/// Variable-size elements (strings, nested lists) are themselves
/// (pointer, length) pairs, which keeps the element stride fixed; each
/// level of nesting costs one extra indirection per element.
pub struct WasmList<T> {
    ptr: u32,
    len: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for WasmList<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for WasmList<T> {}

impl<T> fmt::Debug for WasmList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmList")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

fn element_ptr<T: AbiValue>(base: u32, index: u32) -> Result<u32, AbiError> {
    let delta = index as u64 * T::SIZE as u64;
    u32::try_from(base as u64 + delta).map_err(|_| AbiError::AddressOverflow {
        base,
        offset: delta,
    })
}

impl<T: AbiValue> WasmList<T> {
    /// Lowers a slice of already-lifted elements into freshly allocated
    /// guest memory.
    pub fn from_items(memory: &mut GuestMemory<'_>, items: &[T]) -> Result<Self, AbiError> {
        let len = u32::try_from(items.len()).map_err(|_| AbiError::AddressOverflow {
            base: 0,
            offset: items.len() as u64,
        })?;
        let total = len as u64 * T::SIZE as u64;
        let total = u32::try_from(total).map_err(|_| AbiError::AddressOverflow {
            base: 0,
            offset: total,
        })?;
        let ptr = memory.allocate(total)?;
        for (index, item) in items.iter().enumerate() {
            item.store(memory, element_ptr::<T>(ptr, index as u32)?)?;
        }
        Ok(Self {
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    /// Wraps an existing (pointer, count) pair without validating it.
    /// Element reads through the result are still bounds-checked.
    pub fn from_raw(ptr: u32, len: u32) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decodes element `index`.
    pub fn get(&self, memory: &GuestMemory<'_>, index: u32) -> Result<T, AbiError> {
        if index >= self.len {
            return Err(AbiError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        T::load(memory, element_ptr::<T>(self.ptr, index)?)
    }

    /// Decodes the whole list.
    pub fn read(&self, memory: &GuestMemory<'_>) -> Result<Vec<T>, AbiError> {
        (0..self.len).map(|index| self.get(memory, index)).collect()
    }
}

impl<T: AbiValue> AbiValue for WasmList<T> {
    const SIZE: u32 = PTR_LEN_PAIR_SIZE;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        memory.write_u32(offset, self.ptr)?;
        memory.write_u32(advance(offset, 4)?, self.len)
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        let ptr = memory.read_u32(offset)?;
        let len = memory.read_u32(advance(offset, 4)?)?;
        Ok(Self::from_raw(ptr, len))
    }
}

impl<T: ToAbi> ToAbi for [T] {
    type Abi = WasmList<T::Abi>;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError> {
        let mut items = Vec::with_capacity(self.len());
        for item in self {
            items.push(item.to_abi(memory)?);
        }
        WasmList::from_items(memory, &items)
    }
}

impl<T: ToAbi> ToAbi for Vec<T> {
    type Abi = WasmList<T::Abi>;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<Self::Abi, AbiError> {
        self.as_slice().to_abi(memory)
    }
}
