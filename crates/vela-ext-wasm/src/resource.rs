//! Guest-visible handles to host resources.

use crate::abi::{AbiValue, ToAbi};
use crate::error::AbiError;
use crate::memory::GuestMemory;
use crate::worktree::{Project, Worktree};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// First handle value ever issued. Zero and the low band stay out of
/// circulation so null or uninitialized handles in guest traffic are
/// unmistakable.
const FIRST_HANDLE: u32 = 0x1000;

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(FIRST_HANDLE);

/// An opaque identifier the guest holds in place of a host object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AbiValue for Handle {
    const SIZE: u32 = 4;

    fn store(&self, memory: &mut GuestMemory<'_>, offset: u32) -> Result<(), AbiError> {
        memory.write_u32(offset, self.0)
    }

    fn load(memory: &GuestMemory<'_>, offset: u32) -> Result<Self, AbiError> {
        Ok(Handle(memory.read_u32(offset)?))
    }
}

impl ToAbi for Handle {
    type Abi = Handle;

    fn to_abi(&self, _memory: &mut GuestMemory<'_>) -> Result<Handle, AbiError> {
        Ok(*self)
    }
}

/// A host object a guest can hold a handle to.
///
/// The set of kinds is closed: dispatch matches on this enum, so a
/// handle of the wrong kind fails with a typed error instead of a
/// downcast.
#[derive(Clone)]
pub enum Resource {
    Worktree(Arc<Worktree>),
    Project(Arc<Project>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Worktree(_) => ResourceKind::Worktree,
            Resource::Project(_) => ResourceKind::Project,
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Worktree(worktree) => {
                f.debug_tuple("Worktree").field(&worktree.id()).finish()
            }
            Resource::Project(project) => f
                .debug_tuple("Project")
                .field(&project.worktree_ids())
                .finish(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Worktree,
    Project,
}

impl ResourceKind {
    pub const fn name(self) -> &'static str {
        match self {
            ResourceKind::Worktree => "worktree",
            ResourceKind::Project => "project",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The handles one extension instance currently owns.
///
/// Handle values come from a process-wide counter, so a live handle is
/// never reissued even across instances. The entries themselves belong
/// to one instance and die with it.
#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: Mutex<HashMap<Handle, Resource>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `resource` and returns the fresh handle that refers to it.
    pub fn register(&self, resource: Resource) -> Handle {
        let handle = Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        let kind = resource.kind();
        self.entries.lock().insert(handle, resource);
        tracing::debug!(handle = handle.0, kind = %kind, "registered resource");
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Result<Resource, AbiError> {
        self.entries
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(AbiError::UnknownHandle { handle: handle.0 })
    }

    /// Resolves `handle` as a worktree.
    pub fn worktree(&self, handle: Handle) -> Result<Arc<Worktree>, AbiError> {
        match self.resolve(handle)? {
            Resource::Worktree(worktree) => Ok(worktree),
            other => Err(AbiError::ResourceKindMismatch {
                handle: handle.0,
                expected: ResourceKind::Worktree.name(),
                actual: other.kind().name(),
            }),
        }
    }

    /// Resolves `handle` as a project.
    pub fn project(&self, handle: Handle) -> Result<Arc<Project>, AbiError> {
        match self.resolve(handle)? {
            Resource::Project(project) => Ok(project),
            other => Err(AbiError::ResourceKindMismatch {
                handle: handle.0,
                expected: ResourceKind::Project.name(),
                actual: other.kind().name(),
            }),
        }
    }

    /// Releases `handle`. Dropping an unknown or already-dropped handle
    /// is a no-op; the return value says whether anything was removed.
    pub fn drop_handle(&self, handle: Handle) -> bool {
        let removed = self.entries.lock().remove(&handle);
        match &removed {
            Some(resource) => {
                tracing::debug!(handle = handle.0, kind = %resource.kind(), "dropped resource");
            }
            None => {
                tracing::debug!(handle = handle.0, "dropped handle with no live resource");
            }
        }
        removed.is_some()
    }

    /// Drops every live entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
