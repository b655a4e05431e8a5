//! Bounded admission cache for tag rows already known to be durable.
//!
//! A miss is not an error: it just means the tag-table source should
//! propose that row again. Eviction under pressure only causes a
//! redundant (harmless, `ON CONFLICT ... DO NOTHING`) re-insert.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::tag::TagId;

pub struct AdmissionCache {
    inner: LruCache<TagId, ()>,
}

impl AdmissionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn admitted(&mut self, id: TagId) -> bool {
        self.inner.get(&id).is_some()
    }

    pub fn admit(&mut self, id: TagId) {
        self.inner.put(id, ());
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
