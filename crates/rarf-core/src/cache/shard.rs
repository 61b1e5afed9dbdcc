//! A single cache shard: a hash map plus an intrusive doubly-linked LRU list
//! over a slab of nodes (§9 design note: arenas/indices, not a pointer graph,
//! so eviction is O(1)).

use std::collections::HashMap;
use std::time::Instant;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    size_bytes: usize,
    created_at: Instant,
    expires_at: Option<Instant>,
    last_access: Instant,
    hit_count: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One partition of the L1 cache. Not `Send`/`Sync` on its own; shards are
/// always accessed through `Mutex<Shard>` in `Cache`.
pub(super) struct Shard {
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<Vec<u8>, usize>,
    head: Option<usize>, // most-recently-used
    tail: Option<usize>, // least-recently-used
    bytes: usize,
}

pub(super) enum GetOutcome {
    Hit(Vec<u8>),
    Expired,
    Miss,
}

impl Shard {
    pub(super) fn new() -> Self {
        Self { slab: Vec::new(), free: Vec::new(), index: HashMap::new(), head: None, tail: None, bytes: 0 }
    }

    pub(super) fn len(&self) -> usize {
        self.index.len()
    }

    pub(super) fn bytes(&self) -> usize {
        self.bytes
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().expect("node present");
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
            let node = self.slab[idx].as_mut().expect("node present");
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

    fn touch(&mut self, idx: usize, now: Instant) {
        self.detach(idx);
        self.push_front(idx);
        let node = self.slab[idx].as_mut().expect("node present");
        node.last_access = now;
        node.hit_count += 1;
    }

    pub(super) fn get(&mut self, key: &[u8], now: Instant) -> GetOutcome {
        let Some(&idx) = self.index.get(key) else {
            return GetOutcome::Miss;
        };
        let expired = self.slab[idx].as_ref().expect("node present").expires_at.is_some_and(|e| now >= e);
        if expired {
            self.remove_index(idx);
            return GetOutcome::Expired;
        }
        self.touch(idx, now);
        GetOutcome::Hit(self.slab[idx].as_ref().unwrap().value.clone())
    }

    fn remove_index(&mut self, idx: usize) {
        self.detach(idx);
        if let Some(node) = self.slab[idx].take() {
            self.bytes -= node.size_bytes;
            self.index.remove(&node.key);
        }
        self.free.push(idx);
    }

    pub(super) fn delete(&mut self, key: &[u8]) -> bool {
        if let Some(idx) = self.index.get(key).copied() {
            self.remove_index(idx);
            true
        } else {
            false
        }
    }

    /// Insert or overwrite `key`. Evicts LRU-first until both the entry-count
    /// and byte budgets are satisfied (§4.5), returning whatever got evicted
    /// so the caller can demote it to L2 when demotion is enabled.
    pub(super) fn put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        expires_at: Option<Instant>,
        now: Instant,
        max_entries: usize,
        max_bytes: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>, Option<Instant>)> {
        let size_bytes = key.len() + value.len();

        if let Some(&idx) = self.index.get(&key) {
            let old_size = self.slab[idx].as_ref().unwrap().size_bytes;
            self.bytes = self.bytes - old_size + size_bytes;
            {
                let node = self.slab[idx].as_mut().unwrap();
                node.value = value;
                node.size_bytes = size_bytes;
                node.expires_at = expires_at;
                node.created_at = now;
            }
            self.touch(idx, now);
        } else {
            let idx = match self.free.pop() {
                Some(idx) => idx,
                None => {
                    self.slab.push(None);
                    self.slab.len() - 1
                }
            };
            self.slab[idx] = Some(Node {
                key: key.clone(),
                value,
                size_bytes,
                created_at: now,
                expires_at,
                last_access: now,
                hit_count: 0,
                prev: None,
                next: None,
            });
            self.index.insert(key, idx);
            self.bytes += size_bytes;
            self.push_front(idx);
        }

        let mut evicted = Vec::new();
        while (self.index.len() > max_entries || self.bytes > max_bytes) && self.tail.is_some() {
            let victim = self.tail.expect("tail present while evicting");
            let node = self.slab[victim].as_ref().unwrap();
            evicted.push((node.key.clone(), node.value.clone(), node.expires_at));
            self.remove_index(victim);
        }
        evicted
    }

    /// Drop every entry whose TTL has passed; called by the periodic sweep
    /// in addition to the lazy purge done on `get`.
    pub(super) fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<usize> = self
            .slab
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| {
                let node = node.as_ref()?;
                if node.expires_at.is_some_and(|e| now >= e) {
                    Some(idx)
                } else {
                    None
                }
            })
            .collect();
        let count = expired.len();
        for idx in expired {
            self.remove_index(idx);
        }
        count
    }
}
