use super::{advance, AbiValue, ToAbi};
use crate::error::AbiError;
use crate::memory::GuestMemory;
use vela_ext_abi::v1::PTR_LEN_PAIR_SIZE;

/// A guest string: an 8-byte (pointer, byte length) pair over UTF-8 text
/// owned by the guest allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WasmStr {
    ptr: u32,
    len: u32,
}

impl WasmStr {
    /// Lowers `text` into freshly allocated guest memory.
    pub fn from_str(memory: &mut GuestMemory<'_>, text: &str) -> Result<Self, AbiError> {
        let (ptr, len) = memory.write_str(text)?;
        Ok(Self { ptr, len })
    }

    /// Wraps an existing (pointer, length) pair without validating it.
    /// Reads through the result are still bounds- and UTF-8-checked.
    pub fn from_raw(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
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

    /// Copies the text out of guest memory.
    pub fn read(&self, memory: &GuestMemory<'_>) -> Result<String, AbiError> {
        memory.read_str(self.ptr, self.len)
    }
}

impl AbiValue for WasmStr {
    const SIZE: u32 = PTR_LEN_PAIR_SIZE;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        memory.write_u32(offset, self.ptr)?;
        memory.write_u32(advance(offset, 4)?, self.len)
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        let ptr = memory.read_u32(offset)?;
        let len = memory.read_u32(advance(offset, 4)?)?;
        Ok(Self { ptr, len })
    }
}

impl ToAbi for str {
    type Abi = WasmStr;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<WasmStr, AbiError> {
        WasmStr::from_str(memory, self)
    }
}

impl ToAbi for String {
    type Abi = WasmStr;

    fn to_abi(&self, memory: &mut GuestMemory<'_>) -> Result<WasmStr, AbiError> {
        WasmStr::from_str(memory, self)
    }
}
