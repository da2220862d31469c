use std::sync::atomic::{AtomicU64, Ordering};

//pub type Map<K, V> = std::collections::BTreeMap<K, V>;
pub type Map<K, V> = ahash::HashMap<K, V>;
//pub type Set<K> = std::collections::BTreeSet<K>;
pub type Set<K> = ahash::HashSet<K>;

/// Process-wide monotonic id source. Ids are never reused, so they can serve as stable identities
/// of tasks and execution contexts.
pub struct IdGenerator<T> {
    c: AtomicU64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> IdGenerator<T> {
    pub const fn new() -> Self {
        Self {
            c: AtomicU64::new(0),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for IdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: From<u64>> IdGenerator<T> {
    pub fn next(&self) -> T {
        T::from(self.c.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lock a mutex, ignoring poisoning. A panicking task must not render the bookkeeping of the other
/// tasks inaccessible.
pub fn lock<T: ?Sized>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
