// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared keyed store for the latest sampling and aggregation records.
//!
//! Handlers on different CPUs update the store concurrently, so each table is sharded with
//! one lock per shard: a read-modify-write on one key is atomic with respect to other
//! callers of the same key, and there is no global lock. Cross-key consistency is not
//! offered and not needed; consumers read latest-wins records stamped with a generation.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use sync::Mutex;

use crate::fallback::ProcessRecord;
use crate::topology::NodeInfo;
use crate::topology::ZoneInfo;
use crate::topology::ZoneKey;

const SHARD_COUNT: usize = 16;

/// Hash map split across fixed shards, each behind its own lock.
pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
}

impl<K: Eq + Hash, V: Clone> ShardedMap<K, V> {
    pub fn new() -> Self {
        ShardedMap {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Replaces the value for `key`, returning the previous one.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).lock().insert(key, value)
    }

    /// Create-or-update under the shard lock; the whole read-modify-write is atomic for
    /// this key.
    pub fn upsert(&self, key: K, init: impl FnOnce() -> V, update: impl FnOnce(&mut V)) {
        let shard = self.shard(&key);
        let mut map = shard.lock();
        match map.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => update(e.get_mut()),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(init());
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out all entries, one shard at a time. Not a consistent cross-shard snapshot.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let mut out = Vec::new();
        for shard in &self.shards {
            let map = shard.lock();
            out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Evicts lowest-ranked entries from `key`'s shard until it holds at most `max_len`.
    /// Used to keep per-process tables bounded; the cap is per shard, so the global bound
    /// is approximate.
    pub fn prune_shard(&self, key: &K, max_len: usize, rank: impl Fn(&V) -> u64)
    where
        K: Clone,
    {
        let shard = self.shard(key);
        let mut map = shard.lock();
        while map.len() > max_len {
            let victim = map
                .iter()
                .min_by_key(|&(_, v)| rank(v))
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    map.remove(&k);
                }
                None => break,
            }
        }
    }
}

impl<K: Eq + Hash, V: Clone> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The latest node, zone and fallback-aggregation records, readable by a reporting layer.
pub struct TelemetryStore {
    /// Bumped once per walk; every record written by that walk carries the new value.
    generation: AtomicU64,
    /// Bumped once per fallback event, for per-process recency ranking.
    event_stamp: AtomicU64,
    nodes: ShardedMap<u32, NodeInfo>,
    zones: ShardedMap<ZoneKey, ZoneInfo>,
    cpu_counts: ShardedMap<u32, u64>,
    processes: ShardedMap<u32, ProcessRecord>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        TelemetryStore {
            generation: AtomicU64::new(0),
            event_stamp: AtomicU64::new(0),
            nodes: ShardedMap::new(),
            zones: ShardedMap::new(),
            cpu_counts: ShardedMap::new(),
            processes: ShardedMap::new(),
        }
    }

    /// Starts a new walk generation and returns it.
    pub(crate) fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The generation of the most recent walk, 0 if none has run.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub(crate) fn next_event_stamp(&self) -> u64 {
        self.event_stamp.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn upsert_node(&self, info: NodeInfo) {
        self.nodes.insert(info.node_id, info);
    }

    pub(crate) fn upsert_zone(&self, info: ZoneInfo) {
        self.zones.insert(info.key(), info);
    }

    pub(crate) fn cpu_table(&self) -> &ShardedMap<u32, u64> {
        &self.cpu_counts
    }

    pub(crate) fn process_table(&self) -> &ShardedMap<u32, ProcessRecord> {
        &self.processes
    }

    /// Latest node records, ordered by node id.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut out: Vec<_> = self.nodes.snapshot().into_iter().map(|(_, v)| v).collect();
        out.sort_by_key(|n| n.node_id);
        out
    }

    /// Latest zone records across all nodes, ordered by (zone, order).
    pub fn zones(&self) -> Vec<ZoneInfo> {
        let mut out: Vec<_> = self.zones.snapshot().into_iter().map(|(_, v)| v).collect();
        out.sort_by_key(|z| z.key());
        out
    }

    /// Latest zone records for one node, ordered by (zone, order).
    pub fn zones_for_node(&self, node_id: u32) -> Vec<ZoneInfo> {
        let mut out: Vec<_> = self
            .zones
            .snapshot()
            .into_iter()
            .map(|(_, v)| v)
            .filter(|z| z.node_id == node_id)
            .collect();
        out.sort_by_key(|z| z.key());
        out
    }

    /// Per-CPU fallback occurrence counts, ordered by CPU id.
    pub fn cpu_counts(&self) -> Vec<(u32, u64)> {
        let mut out = self.cpu_counts.snapshot();
        out.sort_by_key(|&(cpu, _)| cpu);
        out
    }

    /// Sum of fallback occurrences across all CPUs.
    pub fn total_fallbacks(&self) -> u64 {
        self.cpu_counts.snapshot().iter().map(|&(_, n)| n).sum()
    }

    /// Per-process fallback records, heaviest first.
    pub fn process_records(&self) -> Vec<ProcessRecord> {
        let mut out: Vec<_> = self
            .processes
            .snapshot()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.pid.cmp(&b.pid)));
        out
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}
