use crate::memory::ReallocFn;
use crate::resource::ResourceTable;
use crate::settings::SettingsSnapshot;
use std::fmt;
use wasmtime::Memory;

/// Host-side state carried by each extension instance's store.
///
/// Owns the instance's resource table and the settings snapshot served
/// to it, plus the `memory`/`cabi_realloc` exports cached after first
/// resolution.
pub struct ExtensionState {
    pub(crate) memory: Option<Memory>,
    pub(crate) realloc: Option<ReallocFn>,
    resources: ResourceTable,
    settings: SettingsSnapshot,
}

impl ExtensionState {
    pub fn new() -> Self {
        Self {
            memory: None,
            realloc: None,
            resources: ResourceTable::new(),
            settings: SettingsSnapshot::new(),
        }
    }

    pub fn with_settings(settings: SettingsSnapshot) -> Self {
        Self {
            settings,
            ..Self::new()
        }
    }

    pub fn set_settings(&mut self, settings: SettingsSnapshot) {
        self.settings = settings;
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn settings(&self) -> &SettingsSnapshot {
        &self.settings
    }

    /// Releases every resource the instance still holds. Runs when the
    /// instance shuts down; calling it again is a no-op.
    pub fn teardown(&mut self) {
        let dropped = self.resources.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "released live resources at teardown");
        }
    }
}

impl Default for ExtensionState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionState")
            .field("resources", &self.resources)
            .field("memory_cached", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}
