// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Probe source backed by a raw remote-memory read capability.
//!
//! A kernel-attached collector exposes exactly one primitive: read `size` bytes at an
//! address, which may fail because the target was freed or unmapped mid-read. This module
//! layers the typed [`ProbeSource`] accessors over that primitive using a table of structure
//! offsets supplied by the integrator for the running kernel build.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::probe::Fault;
use crate::probe::NodeMeta;
use crate::probe::ProbeSource;
use crate::probe::ZoneMeta;
use crate::types::bounded_name;
use crate::types::NodeHandle;
use crate::types::ZoneHandle;
use crate::types::ZONE_NAME_LEN;

/// The raw read capability. Implementations must tolerate arbitrary handles and fail with a
/// [`Fault`] instead of crashing; the caller never assumes success.
pub trait RemoteMemory: Send + Sync {
    fn read_remote(&self, handle: u64, size: usize) -> Result<Vec<u8>, Fault>;
}

/// Byte offsets of the fields the walker needs, for one kernel build.
///
/// Node handles are addresses of per-node memory descriptors; zones are an inline array
/// inside the descriptor, and each zone holds an inline array of per-order free areas.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelLayout {
    /// Offset of the node id (u32) within the node descriptor.
    pub node_id: u64,
    /// Offset of the zone count (u32) within the node descriptor.
    pub nr_zones: u64,
    /// Offset of the first element of the zone array within the node descriptor.
    pub node_zones: u64,
    /// Size of one zone structure.
    pub zone_size: u64,
    /// Offset of the start pfn (u64) within a zone.
    pub zone_start_pfn: u64,
    /// Offset of the spanned page count (u64) within a zone.
    pub zone_spanned: u64,
    /// Offset of the present page count (u64) within a zone.
    pub zone_present: u64,
    /// Offset of the zone name pointer (u64) within a zone. A null pointer marks the slot
    /// as holding no zone.
    pub zone_name: u64,
    /// Offset of the first per-order free area within a zone.
    pub free_area: u64,
    /// Size of one free-area element.
    pub free_area_stride: u64,
    /// Offset of the free-block count (u64) within a free-area element.
    pub nr_free: u64,
}

/// [`ProbeSource`] over a [`RemoteMemory`] capability plus a [`KernelLayout`].
pub struct RemoteTopology<M> {
    mem: M,
    layout: KernelLayout,
    nodes: Vec<NodeHandle>,
}

impl<M: RemoteMemory> RemoteTopology<M> {
    /// `nodes` are the descriptor addresses of all online nodes, discovered by the attach
    /// mechanism (for example from the kernel's node table at load time).
    pub fn new(mem: M, layout: KernelLayout, nodes: Vec<NodeHandle>) -> Self {
        RemoteTopology { mem, layout, nodes }
    }

    fn read_u32(&self, handle: u64) -> Result<u32, Fault> {
        let bytes = self.mem.read_remote(handle, 4)?;
        let arr: [u8; 4] = bytes.try_into().map_err(|_| Fault::ReadFailed { handle, size: 4 })?;
        Ok(u32::from_ne_bytes(arr))
    }

    fn read_u64(&self, handle: u64) -> Result<u64, Fault> {
        let bytes = self.mem.read_remote(handle, 8)?;
        let arr: [u8; 8] = bytes.try_into().map_err(|_| Fault::ReadFailed { handle, size: 8 })?;
        Ok(u64::from_ne_bytes(arr))
    }

    /// Reads a NUL-terminated string of at most `max` bytes.
    fn read_str(&self, handle: u64, max: usize) -> Result<String, Fault> {
        let bytes = self.mem.read_remote(handle, max)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

impl<M: RemoteMemory> ProbeSource for RemoteTopology<M> {
    fn online_nodes(&self) -> Result<Vec<NodeHandle>, Fault> {
        Ok(self.nodes.clone())
    }

    fn node_meta(&self, node: NodeHandle) -> Result<NodeMeta, Fault> {
        Ok(NodeMeta {
            node_id: self.read_u32(node.0 + self.layout.node_id)?,
            nr_zones: self.read_u32(node.0 + self.layout.nr_zones)?,
        })
    }

    fn zone_meta(&self, node: NodeHandle, index: u32) -> Result<Option<ZoneMeta>, Fault> {
        let base = node.0 + self.layout.node_zones + u64::from(index) * self.layout.zone_size;
        let name_ptr = self.read_u64(base + self.layout.zone_name)?;
        if name_ptr == 0 {
            return Ok(None);
        }
        let name = bounded_name(&self.read_str(name_ptr, ZONE_NAME_LEN)?, ZONE_NAME_LEN);
        Ok(Some(ZoneMeta {
            zone: ZoneHandle(base),
            name,
            start_pfn: self.read_u64(base + self.layout.zone_start_pfn)?,
            spanned_pages: self.read_u64(base + self.layout.zone_spanned)?,
            present_pages: self.read_u64(base + self.layout.zone_present)?,
        }))
    }

    fn nr_free(&self, zone: ZoneHandle, order: u32) -> Result<u64, Fault> {
        let entry = zone.0
            + self.layout.free_area
            + u64::from(order) * self.layout.free_area_stride
            + self.layout.nr_free;
        self.read_u64(entry)
    }
}

/// In-memory [`RemoteMemory`] with fault injection, for tests and offline replay of memory
/// snapshots.
#[derive(Default)]
pub struct MemImage {
    segments: BTreeMap<u64, Vec<u8>>,
    poisoned: Vec<(u64, u64)>,
}

impl MemImage {
    pub fn new() -> Self {
        Default::default()
    }

    /// Maps `bytes` at `addr`. Segments must not overlap.
    pub fn map(&mut self, addr: u64, bytes: Vec<u8>) {
        self.segments.insert(addr, bytes);
    }

    pub fn map_u32(&mut self, addr: u64, value: u32) {
        self.map(addr, value.to_ne_bytes().to_vec());
    }

    pub fn map_u64(&mut self, addr: u64, value: u64) {
        self.map(addr, value.to_ne_bytes().to_vec());
    }

    /// Makes any read overlapping `[addr, addr + len)` fail, as if the target were unmapped
    /// mid-scan.
    pub fn poison(&mut self, addr: u64, len: u64) {
        self.poisoned.push((addr, len));
    }
}

impl RemoteMemory for MemImage {
    fn read_remote(&self, handle: u64, size: usize) -> Result<Vec<u8>, Fault> {
        let end = handle
            .checked_add(size as u64)
            .ok_or(Fault::BadHandle(handle))?;
        for &(paddr, plen) in &self.poisoned {
            if handle < paddr + plen && paddr < end {
                return Err(Fault::ReadFailed { handle, size });
            }
        }
        let (&seg_addr, seg) = self
            .segments
            .range(..=handle)
            .next_back()
            .ok_or(Fault::BadHandle(handle))?;
        let offset = (handle - seg_addr) as usize;
        if offset + size > seg.len() {
            return Err(Fault::ShortRead {
                handle,
                wanted: size,
                got: seg.len().saturating_sub(offset),
            });
        }
        Ok(seg[offset..offset + size].to_vec())
    }
}
