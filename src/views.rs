use crate::collection::SegmentCollection;
use crate::navigation::Navigator;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::debug;

pub const DEFAULT_MAX_VIEWS: usize = 4096;

/// One reader looking at one story session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub viewer: String,
    pub session: String,
}

impl ViewKey {
    pub fn new(viewer: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            viewer: viewer.into(),
            session: session.into(),
        }
    }
}

/// Live navigators, one per reader and story. Least recently used views are
/// dropped once the registry is full; a dropped view starts over at the
/// entry segment the next time it is touched.
pub struct ViewRegistry {
    inner: Mutex<LruCache<ViewKey, Navigator>>,
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VIEWS)
    }
}

impl ViewRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Replaces the view with a navigator over `collection`, then runs `f`.
    pub fn reset<R>(
        &self,
        key: ViewKey,
        collection: SegmentCollection,
        f: impl FnOnce(&mut Navigator) -> R,
    ) -> R {
        let mut navigator = Navigator::new();
        navigator.load_collection(collection);
        let result = f(&mut navigator);
        if let Some((evicted, _)) = self.inner.lock().push(key, navigator) {
            debug!(viewer = %evicted.viewer, session = %evicted.session, "evicted story view");
        }
        result
    }

    /// Runs `f` against the existing view, loading it with `load` first when
    /// the registry has no navigator for `key`. `load` runs without the lock
    /// held; if another caller inserted the view meanwhile, theirs is kept.
    pub fn with_view<R>(
        &self,
        key: ViewKey,
        load: impl FnOnce() -> SegmentCollection,
        f: impl FnOnce(&mut Navigator) -> R,
    ) -> R {
        if let Some(navigator) = self.inner.lock().get_mut(&key) {
            return f(navigator);
        }
        let collection = load();
        let mut guard = self.inner.lock();
        let navigator = guard.get_or_insert_mut(key, || {
            let mut navigator = Navigator::new();
            navigator.load_collection(collection);
            navigator
        });
        f(navigator)
    }

    /// Whether `key` has a live view. Does not touch recency.
    pub fn contains(&self, key: &ViewKey) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
