//! Host side of the Vela extension ABI.
//!
//! Sandboxed extensions run as WebAssembly core modules and exchange
//! compound values with the editor through canonical encodings in guest
//! linear memory. This crate owns that exchange: bounds-checked memory
//! access, the value codec, resource handles, and the `$root` host
//! module extensions import.

pub mod abi;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod resource;
pub mod root_module;
pub mod settings;
pub mod state;
pub mod worktree;

pub use abi::{AbiValue, ToAbi, WasmList, WasmStr};
pub use dispatch::{Args, DefineError, HostModule, RegisterError};
pub use error::{AbiError, AbiErrorKind};
pub use memory::GuestMemory;
pub use resource::{Handle, Resource, ResourceKind, ResourceTable};
pub use root_module::{root_module, ROOT_MODULE};
pub use settings::{SettingsError, SettingsLocation, SettingsSnapshot};
pub use state::ExtensionState;
pub use worktree::{make_file_executable, Project, Worktree, WorktreeError};
