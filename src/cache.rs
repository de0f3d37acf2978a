//! Hash cache.
//!
//! A bounded bidirectional map between a leaf's payload and its id, with
//! least-recently-used eviction. The engine runs on a single cooperative
//! task scheduler, so the map itself needs no internal locking to stay
//! correct within one call — but it is still wrapped in a
//! [`parking_lot::Mutex`] from the start, so a port to a parallel
//! scheduler only has to widen the lock's scope rather than introduce one.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ids::LeafId;

struct Node {
    data: String,
    id: LeafId,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Intrusive doubly-linked-list LRU over a slab, keyed both by payload and
/// by leaf id.
struct Inner {
    capacity: usize,
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    by_data: HashMap<String, usize>,
    by_id: HashMap<LeafId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Inner {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slab: Vec::new(),
            free: Vec::new(),
            by_data: HashMap::new(),
            by_id: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.slab[idx].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn evict_one(&mut self) {
        let Some(tail) = self.tail else { return };
        self.detach(tail);
        let node = self.slab[tail].take().unwrap();
        self.by_data.remove(&node.data);
        self.by_id.remove(&node.id);
        self.free.push(tail);
    }

    fn insert(&mut self, data: String, id: LeafId) {
        if self.by_data.contains_key(&data) {
            return;
        }
        while self.by_data.len() >= self.capacity && self.tail.is_some() {
            self.evict_one();
        }
        if self.capacity == 0 {
            return;
        }
        let node = Node {
            data: data.clone(),
            id: id.clone(),
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.slab[i] = Some(node);
                i
            }
            None => {
                self.slab.push(Some(node));
                self.slab.len() - 1
            }
        };
        self.by_data.insert(data, idx);
        self.by_id.insert(id, idx);
        self.push_front(idx);
    }
}

/// Bounded bidirectional `leaf data <-> leaf id` map.
pub struct HashCache {
    inner: Mutex<Inner>,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(capacity)),
        }
    }

    /// `set(data, id)`.
    pub fn set(&self, data: &str, id: LeafId) {
        self.inner.lock().insert(data.to_owned(), id);
    }

    /// `get(data) -> id?`
    pub fn get(&self, data: &str) -> Option<LeafId> {
        let mut inner = self.inner.lock();
        let idx = *inner.by_data.get(data)?;
        inner.touch(idx);
        Some(inner.slab[idx].as_ref().unwrap().id.clone())
    }

    /// `revGet(id) -> data?`
    pub fn rev_get(&self, id: &LeafId) -> Option<String> {
        let mut inner = self.inner.lock();
        let idx = *inner.by_id.get(id)?;
        inner.touch(idx);
        Some(inner.slab[idx].as_ref().unwrap().data.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> LeafId {
        LeafId(s.to_owned())
    }

    #[test]
    fn set_and_get_round_trip() {
        let cache = HashCache::new(4);
        cache.set("hello", id("h:1"));
        assert_eq!(cache.get("hello"), Some(id("h:1")));
        assert_eq!(cache.rev_get(&id("h:1")), Some("hello".to_owned()));
    }

    #[test]
    fn miss_returns_none() {
        let cache = HashCache::new(4);
        assert_eq!(cache.get("nope"), None);
        assert_eq!(cache.rev_get(&id("h:nope")), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = HashCache::new(2);
        cache.set("a", id("h:a"));
        cache.set("b", id("h:b"));
        // touch "a" so "b" becomes the LRU victim
        assert_eq!(cache.get("a"), Some(id("h:a")));
        cache.set("c", id("h:c"));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(id("h:a")));
        assert_eq!(cache.get("c"), Some(id("h:c")));
    }

    #[test]
    fn zero_capacity_never_caches() {
        let cache = HashCache::new(0);
        cache.set("a", id("h:a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn reinsert_of_same_data_is_noop() {
        let cache = HashCache::new(4);
        cache.set("a", id("h:a"));
        cache.set("a", id("h:different"));
        // first write wins; insert() is a no-op on an already-cached key
        assert_eq!(cache.get("a"), Some(id("h:a")));
    }
}
