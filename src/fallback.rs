// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Aggregation of allocation fallback events.
//!
//! A fallback happens when a request cannot be satisfied at its preferred order or
//! migration type and borrows from another free list. Each occurrence arrives as one event;
//! the aggregator keeps a monotonically increasing per-CPU count and a per-process record
//! where counts accumulate and the event fields are latest-wins. Events for the same
//! process from different CPUs may be merged in either order; the count is exact, the
//! "latest" fields are whichever write landed last.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::store::TelemetryStore;
use crate::types::bounded_name;
use crate::types::COMM_LEN;

/// One fallback occurrence, exactly as delivered by the probe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    /// Physical page frame the borrowed block starts at.
    pub pfn: u64,
    /// Order the allocation asked for.
    pub alloc_order: u32,
    /// Order of the block actually taken.
    pub fallback_order: u32,
    /// Raw migration type requested; decode with [`crate::types::MigrateType::n`].
    pub alloc_migratetype: i32,
    /// Raw migration type of the list the block came from.
    pub fallback_migratetype: i32,
    /// Whether the whole block changed ownership to the requested type.
    pub change_ownership: bool,
    pub pid: u32,
    pub comm: String,
    /// CPU the event fired on.
    pub cpu: u32,
    /// Probe-assigned sequence index on that CPU.
    pub seq: u64,
}

/// Running per-process aggregation: latest event fields plus a cumulative count.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub comm: String,
    pub pfn: u64,
    pub alloc_order: u32,
    pub fallback_order: u32,
    pub alloc_migratetype: i32,
    pub fallback_migratetype: i32,
    pub change_ownership: bool,
    /// Fallbacks attributed to this pid so far.
    pub count: u64,
    /// Recency stamp used by the eviction sweep.
    pub last_seen: u64,
}

impl ProcessRecord {
    fn from_event(evt: &FallbackEvent, last_seen: u64) -> Self {
        ProcessRecord {
            pid: evt.pid,
            comm: bounded_name(&evt.comm, COMM_LEN),
            pfn: evt.pfn,
            alloc_order: evt.alloc_order,
            fallback_order: evt.fallback_order,
            alloc_migratetype: evt.alloc_migratetype,
            fallback_migratetype: evt.fallback_migratetype,
            change_ownership: evt.change_ownership,
            count: 1,
            last_seen,
        }
    }

    fn absorb(&mut self, evt: &FallbackEvent, last_seen: u64) {
        let count = self.count + 1;
        *self = ProcessRecord::from_event(evt, last_seen);
        self.count = count;
    }
}

pub struct FallbackAggregator {
    store: Arc<TelemetryStore>,
    /// Per-shard cap on tracked processes; 0 disables eviction.
    shard_cap: usize,
}

impl FallbackAggregator {
    pub fn new(store: Arc<TelemetryStore>, config: &Config) -> Self {
        let shard_cap = if config.max_tracked_processes == 0 {
            0
        } else {
            // The global cap is spread across shards, so it is approximate.
            (config.max_tracked_processes / store.process_table().shard_count()).max(1)
        };
        FallbackAggregator { store, shard_cap }
    }

    /// Folds one event into both aggregation views. Touches only in-memory sharded state;
    /// callable from any thread, never blocks beyond a shard lock.
    pub fn on_event(&self, evt: &FallbackEvent) {
        self.store.cpu_table().upsert(evt.cpu, || 1, |n| *n += 1);

        let last_seen = self.store.next_event_stamp();
        self.store.process_table().upsert(
            evt.pid,
            || ProcessRecord::from_event(evt, last_seen),
            |rec| rec.absorb(evt, last_seen),
        );
        if self.shard_cap > 0 {
            self.store
                .process_table()
                .prune_shard(&evt.pid, self.shard_cap, |rec| rec.last_seen);
        }
    }
}
