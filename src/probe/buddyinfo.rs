// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Probe source backed by procfs, for hosts where no kernel-attached collector is loaded.
//!
//! `/proc/buddyinfo` supplies the per-order free-block counts and `/proc/zoneinfo` the zone
//! metadata (start pfn, spanned and present pages). Both files are re-read on
//! [`BuddyinfoProbe::refresh`]; the trait accessors serve the parsed snapshot so a walk in
//! progress sees one consistent parse per zone.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use sync::Mutex;

use crate::probe::Fault;
use crate::probe::NodeMeta;
use crate::probe::ProbeSource;
use crate::probe::ZoneMeta;
use crate::types::bounded_name;
use crate::types::NodeHandle;
use crate::types::ZoneHandle;
use crate::types::ZONE_NAME_LEN;

#[derive(Debug, Default, Clone)]
struct ZoneSnap {
    name: String,
    free: Vec<u64>,
    start_pfn: u64,
    spanned_pages: u64,
    present_pages: u64,
}

#[derive(Debug, Default)]
struct Snapshot {
    // node_id -> zones in file order
    nodes: BTreeMap<u32, Vec<ZoneSnap>>,
}

/// Zone handles encode `(node_id, zone_index)` so they stay stable across refreshes.
fn zone_handle(node_id: u32, index: u32) -> ZoneHandle {
    ZoneHandle((u64::from(node_id) << 32) | u64::from(index))
}

fn split_handle(zone: ZoneHandle) -> (u32, u32) {
    ((zone.0 >> 32) as u32, zone.0 as u32)
}

pub struct BuddyinfoProbe {
    buddyinfo_path: PathBuf,
    zoneinfo_path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl BuddyinfoProbe {
    pub fn new() -> Self {
        Self::with_paths("/proc/buddyinfo", "/proc/zoneinfo")
    }

    /// Paths are injectable so tests can point at fixture files.
    pub fn with_paths<P: AsRef<Path>, Q: AsRef<Path>>(buddyinfo: P, zoneinfo: Q) -> Self {
        BuddyinfoProbe {
            buddyinfo_path: buddyinfo.as_ref().to_path_buf(),
            zoneinfo_path: zoneinfo.as_ref().to_path_buf(),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Re-reads both files and replaces the snapshot. Call before each walk.
    pub fn refresh(&self) -> anyhow::Result<()> {
        let buddy = fs::read_to_string(&self.buddyinfo_path)
            .with_context(|| format!("reading {}", self.buddyinfo_path.display()))?;
        let zone = fs::read_to_string(&self.zoneinfo_path)
            .with_context(|| format!("reading {}", self.zoneinfo_path.display()))?;
        let mut snap = parse_buddyinfo(&buddy)?;
        merge_zoneinfo(&mut snap, &zone);
        *self.snapshot.lock() = snap;
        Ok(())
    }
}

impl Default for BuddyinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses lines of the form `Node 0, zone   Normal   96   47   ...`.
fn parse_buddyinfo(text: &str) -> anyhow::Result<Snapshot> {
    let mut snap = Snapshot::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (node_kw, node_id, zone_kw, name) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        );
        if node_kw != Some("Node") || zone_kw != Some("zone") {
            continue;
        }
        let node_id: u32 = node_id
            .and_then(|f| f.trim_end_matches(',').parse().ok())
            .with_context(|| format!("bad node id in buddyinfo line: {line}"))?;
        let name = name.context("buddyinfo line missing zone name")?;
        let free = fields
            .map(|f| f.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("bad free count in buddyinfo line: {line}"))?;
        snap.nodes.entry(node_id).or_default().push(ZoneSnap {
            name: bounded_name(name, ZONE_NAME_LEN),
            free,
            ..Default::default()
        });
    }
    Ok(snap)
}

/// Fills in start_pfn/spanned/present from `/proc/zoneinfo`, matching zones by
/// `(node, name)`. Zones present in zoneinfo but not buddyinfo (or vice versa) are left
/// alone; the walker tolerates partially populated metadata.
fn merge_zoneinfo(snap: &mut Snapshot, text: &str) {
    let mut current: Option<(u32, String)> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Node ") {
            // `Node 0, zone      DMA`
            let mut fields = rest.split_whitespace();
            let node_id = fields
                .next()
                .and_then(|f| f.trim_end_matches(',').parse::<u32>().ok());
            let name = match (fields.next(), fields.next()) {
                (Some("zone"), Some(name)) => Some(name.to_string()),
                _ => None,
            };
            current = node_id.zip(name);
            continue;
        }
        let Some((node_id, name)) = &current else {
            continue;
        };
        let mut fields = trimmed.split_whitespace();
        let (key, value) = (fields.next(), fields.next());
        let Some(value) = value.and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        let Some(zone) = snap
            .nodes
            .get_mut(node_id)
            .and_then(|zones| zones.iter_mut().find(|z| &z.name == name))
        else {
            continue;
        };
        match key {
            Some("spanned") => zone.spanned_pages = value,
            Some("present") => zone.present_pages = value,
            Some("start_pfn:") => zone.start_pfn = value,
            _ => {}
        }
    }
}

impl ProbeSource for BuddyinfoProbe {
    fn online_nodes(&self) -> Result<Vec<NodeHandle>, Fault> {
        let snap = self.snapshot.lock();
        if snap.nodes.is_empty() {
            return Err(Fault::Disconnected);
        }
        Ok(snap
            .nodes
            .keys()
            .map(|&id| NodeHandle(u64::from(id)))
            .collect())
    }

    fn node_meta(&self, node: NodeHandle) -> Result<NodeMeta, Fault> {
        let snap = self.snapshot.lock();
        let node_id = node.0 as u32;
        let zones = snap.nodes.get(&node_id).ok_or(Fault::BadHandle(node.0))?;
        Ok(NodeMeta {
            node_id,
            nr_zones: zones.len() as u32,
        })
    }

    fn zone_meta(&self, node: NodeHandle, index: u32) -> Result<Option<ZoneMeta>, Fault> {
        let snap = self.snapshot.lock();
        let node_id = node.0 as u32;
        let zones = snap.nodes.get(&node_id).ok_or(Fault::BadHandle(node.0))?;
        Ok(zones.get(index as usize).map(|z| ZoneMeta {
            zone: zone_handle(node_id, index),
            name: z.name.clone(),
            start_pfn: z.start_pfn,
            spanned_pages: z.spanned_pages,
            present_pages: z.present_pages,
        }))
    }

    fn nr_free(&self, zone: ZoneHandle, order: u32) -> Result<u64, Fault> {
        let snap = self.snapshot.lock();
        let (node_id, index) = split_handle(zone);
        let z = snap
            .nodes
            .get(&node_id)
            .and_then(|zones| zones.get(index as usize))
            .ok_or(Fault::BadHandle(zone.0))?;
        // buddyinfo carries a fixed number of columns; an order past the end is a read the
        // file cannot satisfy, which the scanner treats as zero.
        z.free.get(order as usize).copied().ok_or(Fault::ReadFailed {
            handle: zone.0,
            size: 8,
        })
    }
}
