// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The boundary between the sampling engine and whatever mechanism inspects the live
//! allocator. Everything behind this trait can fail at any moment: the structures being read
//! are mutated, freed and remapped while we look at them, so every accessor returns a
//! [`Fault`] that callers recover from locally rather than propagate as fatal.

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::types::NodeHandle;
use crate::types::ZoneHandle;

pub mod buddyinfo;
pub mod remote;

pub use buddyinfo::BuddyinfoProbe;
pub use remote::KernelLayout;
pub use remote::MemImage;
pub use remote::RemoteMemory;
pub use remote::RemoteTopology;

/// Failure of a single probe read. Never fatal to a walk; at worst the current entry is
/// skipped or counted as zero.
#[sorted]
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Fault {
    #[error("handle {0:#x} is not mapped by this probe")]
    BadHandle(u64),
    #[error("probe source is no longer attached")]
    Disconnected,
    #[error("read of {size} bytes at {handle:#x} failed")]
    ReadFailed { handle: u64, size: usize },
    #[error("short read at {handle:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        handle: u64,
        wanted: usize,
        got: usize,
    },
}

/// Node metadata as reported by the probe. `nr_zones` is the node's own claim and is clamped
/// by the walker before use.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_id: u32,
    pub nr_zones: u32,
}

/// Zone metadata as reported by the probe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ZoneMeta {
    pub zone: ZoneHandle,
    pub name: String,
    pub start_pfn: u64,
    pub spanned_pages: u64,
    pub present_pages: u64,
}

/// Read access to the allocator topology.
///
/// Implementations must be callable from multiple threads at once and must never block on
/// anything slower than a memory read; the walker calls `nr_free` once per (zone, order)
/// under its sampling budget.
pub trait ProbeSource: Send + Sync {
    /// Handles for all online nodes, used by full-topology walks.
    fn online_nodes(&self) -> Result<Vec<NodeHandle>, Fault>;

    /// Metadata for one node.
    fn node_meta(&self, node: NodeHandle) -> Result<NodeMeta, Fault>;

    /// Metadata for the zone at `index` within `node`. `Ok(None)` means the slot exists but
    /// holds no zone (absent), which is not an error.
    fn zone_meta(&self, node: NodeHandle, index: u32) -> Result<Option<ZoneMeta>, Fault>;

    /// Count of free blocks on the zone's free list for `order`.
    fn nr_free(&self, zone: ZoneHandle, order: u32) -> Result<u64, Fault>;
}
