//! Unhandled rejection listeners
//!
//! One registry is shared by every global scope a host builds. The
//! registry's hook is installed when the first listener attaches and removed
//! when the last one detaches, so a host with no interested scope reports
//! nothing.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Called with each unhandled failure
pub type RejectionListener = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Handle returned by [`RejectionRegistry::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: BTreeMap<u64, RejectionListener>,
    installed: bool,
}

/// Reference-counted registry of unhandled rejection listeners
#[derive(Clone, Default)]
pub struct RejectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl RejectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: RejectionListener) -> ListenerId {
        let mut inner = self.inner.lock();
        if inner.listeners.is_empty() {
            inner.installed = true;
            tracing::debug!("Installed unhandled rejection hook");
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, listener);
        ListenerId(id)
    }

    /// Returns whether the listener was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.listeners.remove(&id.0).is_some();
        if removed && inner.listeners.is_empty() {
            inner.installed = false;
            tracing::debug!("Removed unhandled rejection hook");
        }
        removed
    }

    /// Whether the hook is currently installed
    pub fn is_installed(&self) -> bool {
        self.inner.lock().installed
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Delivers `error` to every listener, returning whether any saw it
    pub fn report(&self, error: &anyhow::Error) -> bool {
        // Listeners may add or remove listeners, so call them unlocked
        let listeners: Vec<RejectionListener> =
            self.inner.lock().listeners.values().cloned().collect();
        for listener in &listeners {
            listener(error);
        }
        !listeners.is_empty()
    }
}

impl fmt::Debug for RejectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RejectionRegistry")
            .field("listeners", &inner.listeners.len())
            .field("installed", &inner.installed)
            .finish()
    }
}
