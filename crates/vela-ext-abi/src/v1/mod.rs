use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Name of the linear-memory export every guest module must provide.
pub const MEMORY_EXPORT: &str = "memory";

/// Name of the guest allocator export.
///
/// The export has the canonical signature
/// `(old_ptr: i32, old_size: i32, align: i32, new_size: i32) -> i32`;
/// allocation is `cabi_realloc(0, 0, align, size)` and freeing is
/// `cabi_realloc(ptr, size, align, 0)`.
pub const REALLOC_EXPORT: &str = "cabi_realloc";

/// Width of the Option/Result discriminant: a little-endian u32 at the
/// start of the value's slot.
pub const DISCRIMINANT_SIZE: u32 = 4;

/// Width of a lowered string or list slot: two consecutive little-endian
/// u32 values (pointer, length).
pub const PTR_LEN_PAIR_SIZE: u32 = 8;

/// Discriminant values for Option and Result encodings (ABI v1).
///
/// Any value other than 0 or 1 in a discriminant slot is a decode error.
pub mod discriminant {
    pub const NONE: u32 = 0;
    pub const SOME: u32 = 1;

    pub const OK: u32 = 0;
    pub const ERR: u32 = 1;
}

// === Function signatures ======================================================

/// A core-wasm scalar slot kind.
///
/// Compound arguments are pre-flattened into these before they reach the
/// call boundary: a string or list is two `I32` slots (pointer, length),
/// an option is an `I32` discriminant slot followed by its payload slots,
/// and a resource handle is one `I32` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    I32,
    I64,
    F32,
    F64,
}

impl SlotKind {
    pub const fn name(self) -> &'static str {
        match self {
            SlotKind::I32 => "i32",
            SlotKind::I64 => "i64",
            SlotKind::F32 => "f32",
            SlotKind::F64 => "f64",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The flattened signature of one host function.
///
/// `params` lists every scalar slot in call order, including the trailing
/// return-pointer slot when `ret_ptr` is set. `result` is the single
/// scalar return slot, if any; functions with a compound logical result
/// use a return pointer instead and leave `result` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnSignature {
    pub params: Vec<SlotKind>,
    #[serde(default)]
    pub result: Option<SlotKind>,
    #[serde(default)]
    pub ret_ptr: bool,
}

impl FnSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one raw scalar slot.
    pub fn slot(mut self, kind: SlotKind) -> Self {
        self.params.push(kind);
        self
    }

    /// Appends the single i32 slot of a resource handle argument.
    pub fn handle(self) -> Self {
        self.slot(SlotKind::I32)
    }

    /// Appends the (pointer, length) slot pair of a string argument.
    pub fn string(self) -> Self {
        self.slot(SlotKind::I32).slot(SlotKind::I32)
    }

    /// Appends the (pointer, length) slot pair of a list argument.
    pub fn list(self) -> Self {
        self.slot(SlotKind::I32).slot(SlotKind::I32)
    }

    /// Appends the three i32 slots of an `option<string>` argument.
    pub fn option_string(self) -> Self {
        self.option_slots(&[SlotKind::I32, SlotKind::I32])
    }

    /// Appends an option argument: an i32 discriminant slot followed by
    /// the payload's flattened slots (present and zero-valued for the
    /// `none` arm).
    pub fn option_slots(mut self, payload: &[SlotKind]) -> Self {
        self.params.push(SlotKind::I32);
        self.params.extend_from_slice(payload);
        self
    }

    /// Appends the trailing return-pointer slot for a compound result.
    pub fn ret_ptr(mut self) -> Self {
        self.params.push(SlotKind::I32);
        self.ret_ptr = true;
        self
    }

    /// Declares a single scalar result slot.
    pub fn returning(mut self, kind: SlotKind) -> Self {
        self.result = Some(kind);
        self
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn has_ret_ptr(&self) -> bool {
        self.ret_ptr
    }
}

// === Function naming ==========================================================

/// Builds the destructor import name for a resource type,
/// e.g. `[resource-drop]worktree`.
pub fn resource_drop_name(resource: &str) -> String {
    format!("[resource-drop]{resource}")
}

/// Builds the method import name for a resource type,
/// e.g. `[method]worktree.read-text-file`.
pub fn resource_method_name(resource: &str, method: &str) -> String {
    format!("[method]{resource}.{method}")
}

/// Helpers for implementing ABI v1 guest modules in Rust.
pub mod guest {
    use alloc::alloc::{alloc as raw_alloc, dealloc, realloc as raw_realloc};
    use core::alloc::Layout;
    use core::ptr;

    /// Canonical `cabi_realloc` implementation backed by the guest's
    /// global allocator. Guests re-export it under [`REALLOC_EXPORT`]:
    ///
    /// ```ignore
    /// #[no_mangle]
    /// pub unsafe extern "C" fn cabi_realloc(
    ///     old_ptr: *mut u8,
    ///     old_size: usize,
    ///     align: usize,
    ///     new_size: usize,
    /// ) -> *mut u8 {
    ///     vela_ext_abi::v1::guest::cabi_realloc(old_ptr, old_size, align, new_size)
    /// }
    /// ```
    ///
    /// Returns null when the allocation cannot be satisfied; a zero
    /// `new_size` frees `old_ptr` and returns a non-null aligned
    /// sentinel.
    ///
    /// [`REALLOC_EXPORT`]: super::REALLOC_EXPORT
    ///
    /// # Safety
    ///
    /// - `old_ptr` must be null or a pointer previously returned by this
    ///   function for `old_size` bytes at alignment `align`.
    /// - Ownership of `old_ptr` transfers back to the allocator; the old
    ///   buffer must not be used afterwards.
    pub unsafe fn cabi_realloc(
        old_ptr: *mut u8,
        old_size: usize,
        align: usize,
        new_size: usize,
    ) -> *mut u8 {
        let align = align.max(1);

        if new_size == 0 {
            if !old_ptr.is_null() && old_size != 0 {
                if let Ok(old_layout) = Layout::from_size_align(old_size, align) {
                    // Safety: caller guarantees `old_ptr` came from this
                    // allocator with `old_size`/`align`.
                    dealloc(old_ptr, old_layout);
                }
            }
            return align as *mut u8;
        }

        let Ok(new_layout) = Layout::from_size_align(new_size, align) else {
            return ptr::null_mut();
        };

        if old_ptr.is_null() || old_size == 0 {
            // Safety: `new_layout` has non-zero size.
            return raw_alloc(new_layout);
        }

        match Layout::from_size_align(old_size, align) {
            // Safety: caller guarantees `old_ptr` matches `old_layout`.
            Ok(old_layout) => raw_realloc(old_ptr, old_layout, new_size),
            Err(_) => ptr::null_mut(),
        }
    }
}
