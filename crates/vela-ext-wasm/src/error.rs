use std::fmt;
use std::str::Utf8Error;

/// Failure classes of the ABI layer, used for logging at the dispatch
/// boundary. Every class is recoverable; none may escape as a trap or a
/// panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiErrorKind {
    /// Offset/length outside the instance's memory extent.
    Bounds,
    /// Invalid discriminant, malformed UTF-8, truncated container.
    Decode,
    /// Unknown or already-dropped resource handle.
    Handle,
    /// Argument-count or slot-kind mismatch against the declared signature.
    Dispatch,
}

impl fmt::Display for AbiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbiErrorKind::Bounds => "bounds",
            AbiErrorKind::Decode => "decode",
            AbiErrorKind::Handle => "handle",
            AbiErrorKind::Dispatch => "dispatch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AbiError {
    #[error("guest memory range {offset:#x}+{len} exceeds memory size {size:#x}")]
    OutOfBounds { offset: u32, len: u32, size: u64 },
    #[error("guest address {base:#x}+{offset} overflows the 32-bit address space")]
    AddressOverflow { base: u32, offset: u64 },
    #[error("{shape} discriminant must be 0 or 1, got {value}")]
    InvalidDiscriminant { shape: &'static str, value: u32 },
    #[error("guest string at {ptr:#x}+{len} is not valid utf-8: {source}")]
    InvalidUtf8 {
        ptr: u32,
        len: u32,
        #[source]
        source: Utf8Error,
    },
    #[error("list index {index} out of range for list of {len}")]
    IndexOutOfRange { index: u32, len: u32 },
    #[error("unknown resource handle {handle}")]
    UnknownHandle { handle: u32 },
    #[error("resource handle {handle} is a {actual}, expected a {expected}")]
    ResourceKindMismatch {
        handle: u32,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{function}: expected {declared} argument slots, got {actual}")]
    ArityMismatch {
        function: String,
        declared: usize,
        actual: usize,
    },
    #[error("{function}: no argument slot at index {index}")]
    MissingSlot { function: String, index: usize },
    #[error("{function}: argument slot {index} is not a {expected}")]
    SlotKindMismatch {
        function: String,
        index: usize,
        expected: &'static str,
    },
    #[error("guest instance does not export {name:?}")]
    MissingExport { name: &'static str },
    #[error("guest export {name:?} has the wrong type")]
    ExportType { name: &'static str },
    #[error("guest allocator failed to provide {size} bytes: {message}")]
    AllocationFailed { size: u32, message: String },
}

impl AbiError {
    pub fn kind(&self) -> AbiErrorKind {
        match self {
            AbiError::OutOfBounds { .. } | AbiError::AddressOverflow { .. } => AbiErrorKind::Bounds,
            AbiError::InvalidDiscriminant { .. }
            | AbiError::InvalidUtf8 { .. }
            | AbiError::IndexOutOfRange { .. } => AbiErrorKind::Decode,
            AbiError::UnknownHandle { .. } | AbiError::ResourceKindMismatch { .. } => {
                AbiErrorKind::Handle
            }
            AbiError::ArityMismatch { .. }
            | AbiError::MissingSlot { .. }
            | AbiError::SlotKindMismatch { .. }
            | AbiError::MissingExport { .. }
            | AbiError::ExportType { .. }
            | AbiError::AllocationFailed { .. } => AbiErrorKind::Dispatch,
        }
    }
}
