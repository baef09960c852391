// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::types::DEFAULT_MAX_ORDER;
use crate::types::MAX_ZONES_PER_NODE;

/// Tunables for the sampling engine.
///
/// All fields have defaults, so a partial configuration (for example from a JSON fragment)
/// deserializes into a fully usable value.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Minimum number of seconds between two topology walks. `None` and `Some(0)` both mean
    /// unlimited sampling; an absent value must never be read as garbage cooldown.
    pub sample_cooldown_secs: Option<u64>,
    /// Highest order sampled per zone; `max_order + 1` orders are scanned.
    pub max_order: u32,
    /// Zones enumerated per node before the walker stops trusting the node's own count.
    pub max_zones_per_node: u32,
    /// Cap on the per-process fallback table. Oldest records are evicted past the cap;
    /// 0 disables eviction and accepts unbounded growth.
    pub max_tracked_processes: usize,
    /// Depth of the ingestion queue between probe callbacks and the worker thread.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sample_cooldown_secs: None,
            max_order: DEFAULT_MAX_ORDER,
            max_zones_per_node: MAX_ZONES_PER_NODE,
            max_tracked_processes: 4096,
            queue_depth: 256,
        }
    }
}

impl Config {
    /// The effective cooldown between samples. Absent configuration means no throttling.
    pub fn sample_cooldown(&self) -> Duration {
        Duration::from_secs(self.sample_cooldown_secs.unwrap_or(0))
    }
}
