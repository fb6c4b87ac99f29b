//! Opaque handles for objects shared across the API boundary.
//!
//! Each object type gets its own [`HandleTable`], created lazily the first
//! time the type is used through a [`HandleRegistry`]. Tables are keyed by
//! `TypeId`, so two types never share a table even when their names collide.

mod table;

pub use table::HandleTable;

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Rebuilds a handle received back from a caller. Validity is only
    /// established by a successful lookup.
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }
}

/// Live handles across every table of every registry in the process.
pub fn live_objects() -> usize {
    table::LIVE_OBJECTS.load(Ordering::Relaxed)
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Thresholds on the number of live handles across all tables.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LeakPolicy {
    /// Above this, every new handle is logged.
    pub soft_threshold: usize,
    /// Above this, tracking fails.
    pub hard_threshold: usize,
}

impl Default for LeakPolicy {
    fn default() -> Self {
        Self {
            soft_threshold: 10_000,
            hard_threshold: 100_000,
        }
    }
}

trait ErasedTable: Send + Sync {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn type_name(&self) -> &'static str;
    fn live(&self) -> usize;
    fn terminate(&self) -> usize;
}

impl<T: ?Sized + Send + Sync + 'static> ErasedTable for HandleTable<T> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        HandleTable::type_name(self)
    }

    fn live(&self) -> usize {
        self.len()
    }

    fn terminate(&self) -> usize {
        HandleTable::terminate(self)
    }
}

/// Owns one [`HandleTable`] per tracked type.
pub struct HandleRegistry {
    policy: LeakPolicy,
    tables: RwLock<HashMap<TypeId, Arc<dyn ErasedTable>>>,
    terminated: AtomicBool,
}

impl HandleRegistry {
    pub fn new(policy: LeakPolicy) -> Self {
        Self {
            policy,
            tables: RwLock::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Returns the table for `T`, creating it on first use.
    pub fn table<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<HandleTable<T>> {
        let id = TypeId::of::<T>();
        if let Some(table) = self.tables.read().get(&id) {
            if let Ok(table) = table.clone().as_any().downcast::<HandleTable<T>>() {
                return table;
            }
        }

        let mut tables = self.tables.write();
        let erased = tables
            .entry(id)
            .or_insert_with(|| Arc::new(HandleTable::<T>::new(self.policy)))
            .clone();
        match erased.as_any().downcast::<HandleTable<T>>() {
            Ok(table) => table,
            // TypeId 相同则类型必然一致
            Err(_) => unreachable!("handle table registered under a foreign TypeId"),
        }
    }

    pub fn track<T: ?Sized + Send + Sync + 'static>(&self, value: Arc<T>) -> Result<Handle> {
        self.table::<T>().track(value)
    }

    pub fn lookup<T: ?Sized + Send + Sync + 'static>(&self, handle: Handle) -> Result<Arc<T>> {
        self.table::<T>().lookup(handle)
    }

    pub fn is_tracked<T: ?Sized + Send + Sync + 'static>(&self, handle: Handle) -> bool {
        self.table::<T>().is_tracked(handle)
    }

    pub fn release<T: ?Sized + Send + Sync + 'static>(&self, handle: Handle) -> Result<()> {
        self.table::<T>().release(handle)
    }

    /// Live handle count per tracked type name, for diagnostics.
    pub fn object_counts(&self) -> BTreeMap<&'static str, usize> {
        let tables: Vec<Arc<dyn ErasedTable>> = self.tables.read().values().cloned().collect();
        tables
            .iter()
            .map(|table| (table.type_name(), table.live()))
            .collect()
    }

    /// Destroys every table, logging leftover entries as leaks. Tables
    /// created after an earlier call are destroyed by the next one.
    pub fn terminate_all(&self) {
        let first = !self.terminated.swap(true, Ordering::AcqRel);
        let tables: Vec<Arc<dyn ErasedTable>> =
            self.tables.write().drain().map(|(_, table)| table).collect();
        if !first && tables.is_empty() {
            return;
        }

        let mut leaked = 0;
        for table in &tables {
            leaked += table.terminate();
        }
        if leaked > 0 {
            log::warn!("handle registry terminated with {} leaked handles", leaked);
        } else if first {
            log::info!("handle registry terminated cleanly");
        }
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new(LeakPolicy::default())
    }
}

impl Drop for HandleRegistry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recognizer {
        language: String,
    }

    struct Connection;

    #[test]
    fn test_tables_are_per_type() {
        let registry = HandleRegistry::default();
        let reco = registry
            .track(Arc::new(Recognizer {
                language: "en-US".into(),
            }))
            .unwrap();
        let conn = registry.track(Arc::new(Connection)).unwrap();

        assert_eq!(registry.lookup::<Recognizer>(reco).unwrap().language, "en-US");
        assert!(registry.lookup::<Connection>(reco).is_err());
        assert!(registry.is_tracked::<Connection>(conn));

        let counts = registry.object_counts();
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|count| *count == 1));

        registry.release::<Connection>(conn).unwrap();
        registry.release::<Recognizer>(reco).unwrap();
    }

    #[test]
    fn test_table_is_shared() {
        let registry = HandleRegistry::default();
        let first = registry.table::<Connection>();
        let second = registry.table::<Connection>();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_terminate_all_clears_leaks() {
        let registry = HandleRegistry::default();
        let value = Arc::new(Connection);
        let handle = registry.track(value.clone()).unwrap();

        registry.terminate_all();
        assert_eq!(Arc::strong_count(&value), 1);
        registry.terminate_all();
        assert!(!registry.is_tracked::<Connection>(handle));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::from_raw(255).to_string(), "0xff");
        assert_eq!(Handle::from_raw(42).as_raw(), 42);
    }
}
