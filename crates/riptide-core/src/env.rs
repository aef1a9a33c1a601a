//! Per-connection environment store.
//!
//! An associative store of named, disposable objects attached to one
//! monitored connection. Subsystems park private state here (a parser, a
//! session object, a timer handle) keyed by `(name, type_tag)` and get a
//! guaranteed disposal call when the entry is replaced, removed, or the
//! connection is torn down.
//!
//! # Disposal invariants
//!
//! - Replacing an occupied key fires the displaced entry's disposer before
//!   the new entry becomes visible, inside one exclusive critical section.
//! - [`EnvStore::unset`] never fires the disposer — ownership of the object
//!   transfers back to the caller.
//! - [`EnvStore::remove`] fires the disposer iff the key was present.
//! - [`EnvStore::destroy`] (and `Drop`) drains every entry, firing each
//!   disposer exactly once.
//!
//! # Concurrency
//!
//! One exclusive lock guards the whole store; every operation, disposal
//! included, runs inside it. Keep operations short, and never re-enter the
//! same store from a disposer — the lock is not reentrant and the calling
//! thread would deadlock.

use std::any::Any;

use fxhash::FxHashMap;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// EnvEntry
// ---------------------------------------------------------------------------

/// A stored object. `Any + Send` so entries can hold arbitrary subsystem
/// state and still migrate across worker threads with the connection.
pub type EnvObject = Box<dyn Any + Send>;

/// Disposal callback. `FnOnce` taking the object by value: the type system
/// rules out both double-dispose and use-after-dispose.
pub type OnClose = Box<dyn FnOnce(EnvObject) + Send>;

/// One environment entry: the object plus its optional disposer.
pub struct EnvEntry {
    object: EnvObject,
    on_close: Option<OnClose>,
}

impl EnvEntry {
    /// Creates an entry with no disposer.
    #[must_use]
    pub fn new(object: EnvObject) -> Self {
        Self {
            object,
            on_close: None,
        }
    }

    /// Creates an entry whose disposer receives the object when the entry is
    /// replaced, removed, or drained at teardown.
    #[must_use]
    pub fn with_disposer<F>(object: EnvObject, on_close: F) -> Self
    where
        F: FnOnce(EnvObject) + Send + 'static,
    {
        Self {
            object,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Fires the disposer, if any, consuming the entry.
    fn dispose(self) {
        if let Some(on_close) = self.on_close {
            on_close(self.object);
        }
    }

    /// Consumes the entry, returning the object and discarding the disposer.
    fn into_object(self) -> EnvObject {
        self.object
    }
}

impl std::fmt::Debug for EnvEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvEntry")
            .field("has_disposer", &self.on_close.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SetPolicy
// ---------------------------------------------------------------------------

/// What [`EnvStore::set`] does when the key is already occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPolicy {
    /// Displace the existing entry, firing its disposer first.
    Replace,
    /// Keep the existing entry and hand the rejected one back to the caller.
    Keep,
}

// ---------------------------------------------------------------------------
// EnvStore
// ---------------------------------------------------------------------------

/// Composite key: name bytes plus a caller-chosen type tag, so independent
/// subsystems can share names without collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EnvKey {
    name: String,
    type_tag: u64,
}

/// The per-connection environment store.
///
/// Owned by a [`Connection`](crate::conn::Connection); dropped entries are
/// drained (disposers fired) at teardown.
#[derive(Default)]
pub struct EnvStore {
    entries: Mutex<FxHashMap<EnvKey, EnvEntry>>,
}

impl EnvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the `(name, type_tag)` entry.
    ///
    /// With [`SetPolicy::Replace`], a displaced entry's disposer fires before
    /// the new entry becomes visible, inside the store's critical section.
    ///
    /// # Errors
    ///
    /// With [`SetPolicy::Keep`] and an occupied key, returns the rejected
    /// entry back to the caller — its disposer is never fired here.
    pub fn set(
        &self,
        name: &str,
        type_tag: u64,
        entry: EnvEntry,
        policy: SetPolicy,
    ) -> Result<(), EnvEntry> {
        let key = EnvKey {
            name: name.to_owned(),
            type_tag,
        };

        let mut entries = self.entries.lock();
        if let Some(displaced) = entries.remove(&key) {
            if policy == SetPolicy::Keep {
                entries.insert(key, displaced);
                return Err(entry);
            }
            displaced.dispose();
        }
        entries.insert(key, entry);
        Ok(())
    }

    /// Removes the entry silently, returning the object. The disposer is
    /// intentionally discarded: ownership transfers back to the caller.
    pub fn unset(&self, name: &str, type_tag: u64) -> Option<EnvObject> {
        let key = EnvKey {
            name: name.to_owned(),
            type_tag,
        };
        self.entries.lock().remove(&key).map(EnvEntry::into_object)
    }

    /// Removes the entry and fires its disposer iff it was present.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, name: &str, type_tag: u64) -> bool {
        let key = EnvKey {
            name: name.to_owned(),
            type_tag,
        };
        let mut entries = self.entries.lock();
        match entries.remove(&key) {
            Some(entry) => {
                entry.dispose();
                true
            }
            None => false,
        }
    }

    /// Drains every entry, firing each disposer exactly once. Used at
    /// connection teardown; also invoked by `Drop`.
    pub fn destroy(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.dispose();
        }
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Drop for EnvStore {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for EnvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvStore")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_entry(value: i64, fired: &Arc<AtomicUsize>) -> EnvEntry {
        let fired = Arc::clone(fired);
        EnvEntry::with_disposer(Box::new(value), move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    // --- Set / replace tests ---

    #[test]
    fn test_set_then_replace_fires_old_once() {
        let store = EnvStore::new();
        let fired_v1 = Arc::new(AtomicUsize::new(0));
        let fired_v2 = Arc::new(AtomicUsize::new(0));

        store
            .set("parser", 1, counting_entry(1, &fired_v1), SetPolicy::Replace)
            .unwrap();
        store
            .set("parser", 1, counting_entry(2, &fired_v2), SetPolicy::Replace)
            .unwrap();

        assert_eq!(fired_v1.load(Ordering::SeqCst), 1);
        assert_eq!(fired_v2.load(Ordering::SeqCst), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_order_old_disposed_before_new_visible() {
        let store = EnvStore::new();
        let log: Arc<parking_lot::Mutex<Vec<&'static str>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        let v1 = EnvEntry::with_disposer(Box::new(1i64), move |_| l.lock().push("dispose-v1"));
        store.set("k", 0, v1, SetPolicy::Replace).unwrap();

        let v2 = EnvEntry::new(Box::new(2i64));
        store.set("k", 0, v2, SetPolicy::Replace).unwrap();
        log.lock().push("v2-visible");

        assert_eq!(*log.lock(), vec!["dispose-v1", "v2-visible"]);
    }

    #[test]
    fn test_set_keep_policy_hands_entry_back() {
        let store = EnvStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        store
            .set("k", 0, counting_entry(1, &fired), SetPolicy::Replace)
            .unwrap();
        let rejected = store.set("k", 0, counting_entry(2, &fired), SetPolicy::Keep);
        assert!(rejected.is_err());

        // Neither the kept nor the rejected entry was disposed.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // A different type tag is a different key.
        store
            .set("k", 1, counting_entry(3, &fired), SetPolicy::Keep)
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    // --- Unset / remove tests ---

    #[test]
    fn test_unset_never_fires_disposer() {
        let store = EnvStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        store
            .set("k", 0, counting_entry(42, &fired), SetPolicy::Replace)
            .unwrap();
        let object = store.unset("k", 0).unwrap();

        assert_eq!(*object.downcast::<i64>().unwrap(), 42);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(store.is_empty());

        // Missing key is None.
        assert!(store.unset("k", 0).is_none());
    }

    #[test]
    fn test_remove_fires_iff_present() {
        let store = EnvStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        store
            .set("k", 0, counting_entry(1, &fired), SetPolicy::Replace)
            .unwrap();
        assert!(store.remove("k", 0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Second remove is a no-op.
        assert!(!store.remove("k", 0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // --- Destroy tests ---

    #[test]
    fn test_destroy_drains_all_entries() {
        let store = EnvStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for i in 0..5i64 {
            store
                .set(&format!("k{i}"), 0, counting_entry(i, &fired), SetPolicy::Replace)
                .unwrap();
        }
        store.destroy();

        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert!(store.is_empty());
    }

    #[test]
    fn test_drop_drains_like_destroy() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let store = EnvStore::new();
            store
                .set("k", 0, counting_entry(1, &fired), SetPolicy::Replace)
                .unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // --- Thread safety tests ---

    #[test]
    fn test_store_thread_safety() {
        let store = Arc::new(EnvStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                let fired = Arc::clone(&fired);
                std::thread::spawn(move || {
                    for i in 0..50i64 {
                        let name = format!("t{t}-k{i}");
                        store
                            .set(&name, 0, counting_entry(i, &fired), SetPolicy::Replace)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 200);
        store.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 200);
    }
}
