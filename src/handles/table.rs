use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{Handle, LeakPolicy};
use crate::error::{Error, Result};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Shared across all tables so the leak thresholds apply globally.
pub(crate) static LIVE_OBJECTS: AtomicUsize = AtomicUsize::new(0);

struct Entries<T: ?Sized> {
    by_handle: HashMap<Handle, Arc<T>>,
    by_ptr: HashMap<usize, Handle>,
}

/// Bidirectional map between opaque handles and shared instances of `T`.
pub struct HandleTable<T: ?Sized> {
    type_name: &'static str,
    policy: LeakPolicy,
    entries: RwLock<Entries<T>>,
}

fn ptr_key<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

impl<T: ?Sized + Send + Sync + 'static> HandleTable<T> {
    pub fn new(policy: LeakPolicy) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            policy,
            entries: RwLock::new(Entries {
                by_handle: HashMap::new(),
                by_ptr: HashMap::new(),
            }),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Registers `value` and returns its handle. Tracking an instance that is
    /// already registered returns the existing handle.
    pub fn track(&self, value: Arc<T>) -> Result<Handle> {
        let key = ptr_key(&value);
        let mut entries = self.entries.write();
        if let Some(handle) = entries.by_ptr.get(&key) {
            return Ok(*handle);
        }

        let live = LIVE_OBJECTS.load(Ordering::Relaxed);
        if live >= self.policy.hard_threshold {
            return Err(Error::RuntimeError(format!(
                "too many live handles ({}); refusing to track another {}",
                live, self.type_name
            )));
        }
        if live >= self.policy.soft_threshold {
            log::warn!(
                "{} live handles exceeds the soft threshold of {} (tracking {})",
                live + 1,
                self.policy.soft_threshold,
                self.type_name
            );
        }

        let handle = Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        entries.by_handle.insert(handle, value);
        entries.by_ptr.insert(key, handle);
        LIVE_OBJECTS.fetch_add(1, Ordering::Relaxed);
        log::trace!("tracked {} as {}", self.type_name, handle);
        Ok(handle)
    }

    pub fn lookup(&self, handle: Handle) -> Result<Arc<T>> {
        self.entries
            .read()
            .by_handle
            .get(&handle)
            .cloned()
            .ok_or(Error::InvalidHandle(handle))
    }

    pub fn is_tracked(&self, handle: Handle) -> bool {
        self.entries.read().by_handle.contains_key(&handle)
    }

    pub fn is_tracked_instance(&self, value: &Arc<T>) -> bool {
        self.entries.read().by_ptr.contains_key(&ptr_key(value))
    }

    pub fn handle_of(&self, value: &Arc<T>) -> Option<Handle> {
        self.entries.read().by_ptr.get(&ptr_key(value)).copied()
    }

    /// Removes `handle`. The registry's reference is dropped after the lock is
    /// released, so a destructor may call back into the registry.
    pub fn release(&self, handle: Handle) -> Result<()> {
        let removed = {
            let mut entries = self.entries.write();
            let value = entries
                .by_handle
                .remove(&handle)
                .ok_or(Error::InvalidHandle(handle))?;
            entries.by_ptr.remove(&ptr_key(&value));
            value
        };
        LIVE_OBJECTS.fetch_sub(1, Ordering::Relaxed);
        log::trace!("released {} {}", self.type_name, handle);
        drop(removed);
        Ok(())
    }

    pub fn release_instance(&self, value: &Arc<T>) -> Result<()> {
        let handle = self.handle_of(value).ok_or_else(|| {
            Error::RuntimeError(format!("{} instance is not tracked", self.type_name))
        })?;
        self.release(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the table, logging every entry still present as a leak. Safe to
    /// call more than once.
    pub fn terminate(&self) -> usize {
        let drained: Vec<(Handle, Arc<T>)> = {
            let mut entries = self.entries.write();
            entries.by_ptr.clear();
            entries.by_handle.drain().collect()
        };

        let count = drained.len();
        if count > 0 {
            LIVE_OBJECTS.fetch_sub(count, Ordering::Relaxed);
            if count > self.policy.soft_threshold {
                log::error!("{} leaked {} handles at shutdown", self.type_name, count);
            }
            for (handle, _) in &drained {
                log::warn!("leaked handle {} of type {}", handle, self.type_name);
            }
        }
        drop(drained);
        count
    }
}

impl<T: ?Sized> Drop for HandleTable<T> {
    fn drop(&mut self) {
        let remaining = self.entries.get_mut().by_handle.len();
        if remaining > 0 {
            LIVE_OBJECTS.fetch_sub(remaining, Ordering::Relaxed);
        }
    }
}
