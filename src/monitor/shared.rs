//! Serialized handle to a monitor for multi-threaded harnesses.

use super::ModelMonitor;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Cloneable handle; every access holds the monitor lock for its duration.
#[derive(Debug, Clone)]
pub struct SharedMonitor {
    inner: Arc<Mutex<ModelMonitor>>,
}

impl SharedMonitor {
    pub fn new(monitor: ModelMonitor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(monitor)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ModelMonitor> {
        self.inner.lock()
    }

    /// Runs `f` with exclusive access to the monitor.
    pub fn with<R>(&self, f: impl FnOnce(&mut ModelMonitor) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Recovers the monitor once every other handle has been dropped.
    pub fn into_inner(self) -> Result<ModelMonitor, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{HostMemory, Rmi};
    use std::thread;

    #[test]
    fn test_concurrent_delegation_is_serialized() {
        let shared = SharedMonitor::new(ModelMonitor::default());
        let granules: Vec<_> = (0..8)
            .map(|_| shared.with(|m| m.alloc_granule().unwrap()))
            .collect();

        thread::scope(|s| {
            for chunk in granules.chunks(2) {
                let handle = shared.clone();
                s.spawn(move || {
                    for pa in chunk {
                        handle.with(|m| m.granule_delegate(*pa)).unwrap();
                    }
                });
            }
        });

        let monitor = shared.into_inner().unwrap();
        assert_eq!(
            monitor.registry().count(crate::granule::GranuleState::Delegated),
            8
        );
    }
}
