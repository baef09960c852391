// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Node → zone → order traversal.
//!
//! One walk visits either the node that triggered an allocation-pressure event or every
//! online node, scans each present zone's free lists once per order, scores them, and
//! upserts the records into the telemetry store. Failures are local: an unreadable node or
//! zone drops only its own contribution.

use std::sync::Arc;
use std::time::Instant;

use log::warn;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::contig::fill_contig_page_info;
use crate::index::fragmentation_index;
use crate::index::unusable_free_index;
use crate::probe::Fault;
use crate::probe::ProbeSource;
use crate::rate_limit::SampleRateLimiter;
use crate::store::TelemetryStore;
use crate::types::NodeHandle;
use crate::types::ZoneHandle;

#[sorted]
#[derive(Error, Debug)]
pub enum WalkError {
    /// Enumerating online nodes failed outright; per-node failures are skipped instead.
    #[error("probe could not enumerate nodes: {0}")]
    Probe(#[from] Fault),
    /// A walk already ran within the configured cooldown.
    #[error("sample suppressed by cooldown")]
    Throttled,
}

/// Which part of the topology a walk covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkMode {
    /// The node owning the zone that triggered the event.
    Node(NodeHandle),
    /// Every online node; used for periodic sampling.
    AllNodes,
}

/// Key for zone records: the handle disambiguates zones across nodes whose numeric ids
/// coincide, the order separates the per-order records of one zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ZoneKey {
    pub zone: ZoneHandle,
    pub order: u32,
}

/// Latest sample of one node. Overwritten on every walk that visits the node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: NodeHandle,
    pub node_id: u32,
    /// Zone count after clamping to the configured per-node maximum.
    pub nr_zones: u32,
    pub generation: u64,
}

/// Latest sample of one (zone, order). Overwritten on every walk; `generation` tells a
/// consumer how stale the record is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ZoneInfo {
    pub zone: ZoneHandle,
    pub node_id: u32,
    pub name: String,
    pub start_pfn: u64,
    pub spanned_pages: u64,
    pub present_pages: u64,
    pub order: u32,
    pub free_pages: u64,
    pub free_blocks_total: u64,
    pub free_blocks_suitable: u64,
    /// Thousandths of free memory unusable at this order.
    pub unusable_index: i64,
    /// Thousandths attributing the missing block to fragmentation vs shortage.
    pub fragmentation_index: i64,
    pub generation: u64,
}

impl ZoneInfo {
    pub fn key(&self) -> ZoneKey {
        ZoneKey {
            zone: self.zone,
            order: self.order,
        }
    }
}

pub struct TopologyWalker {
    probe: Arc<dyn ProbeSource>,
    store: Arc<TelemetryStore>,
    limiter: SampleRateLimiter,
    max_order: u32,
    max_zones: u32,
}

impl TopologyWalker {
    pub fn new(probe: Arc<dyn ProbeSource>, store: Arc<TelemetryStore>, config: &Config) -> Self {
        TopologyWalker {
            probe,
            store,
            limiter: SampleRateLimiter::from_config(config),
            max_order: config.max_order,
            max_zones: config.max_zones_per_node,
        }
    }

    /// Samples the topology selected by `mode`, upserting every record produced and
    /// returning them. Partial results are expected: unreadable nodes and zones are
    /// logged and skipped.
    pub fn walk(&self, mode: WalkMode, now: Instant) -> Result<Vec<ZoneInfo>, WalkError> {
        if !self.limiter.allow_sample(now) {
            return Err(WalkError::Throttled);
        }
        let generation = self.store.begin_generation();
        let nodes = match mode {
            WalkMode::Node(handle) => vec![handle],
            WalkMode::AllNodes => self.probe.online_nodes()?,
        };
        let mut records = Vec::new();
        for node in nodes {
            let meta = match self.probe.node_meta(node) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("skipping node {node}: {e}");
                    continue;
                }
            };
            let nr_zones = if meta.nr_zones > self.max_zones {
                warn!(
                    "node {} reports {} zones, clamping to {}",
                    meta.node_id, meta.nr_zones, self.max_zones
                );
                self.max_zones
            } else {
                meta.nr_zones
            };
            self.store.upsert_node(NodeInfo {
                node,
                node_id: meta.node_id,
                nr_zones,
                generation,
            });
            for index in 0..nr_zones {
                let zone = match self.probe.zone_meta(node, index) {
                    Ok(Some(zone)) => zone,
                    // Absent slot; not an error.
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("skipping zone {index} of node {}: {e}", meta.node_id);
                        continue;
                    }
                };
                if zone.present_pages == 0 {
                    continue;
                }
                for order in 0..=self.max_order {
                    let info =
                        fill_contig_page_info(self.probe.as_ref(), zone.zone, order, self.max_order);
                    let record = ZoneInfo {
                        zone: zone.zone,
                        node_id: meta.node_id,
                        name: zone.name.clone(),
                        start_pfn: zone.start_pfn,
                        spanned_pages: zone.spanned_pages,
                        present_pages: zone.present_pages,
                        order,
                        free_pages: info.free_pages,
                        free_blocks_total: info.free_blocks_total,
                        free_blocks_suitable: info.free_blocks_suitable,
                        unusable_index: unusable_free_index(order, &info),
                        fragmentation_index: fragmentation_index(order, self.max_order, &info),
                        generation,
                    };
                    self.store.upsert_zone(record.clone());
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::probe::NodeMeta;
    use crate::probe::ZoneMeta;

    /// Synthetic topology: `nodes[n]` holds that node's zones as (name, present_pages,
    /// per-order free counts). Node handles are indexes into `nodes`.
    struct SyntheticProbe {
        nodes: Vec<Vec<(String, u64, Vec<u64>)>>,
        broken_nodes: HashSet<u64>,
        reported_zones: HashMap<u64, u32>,
    }

    impl SyntheticProbe {
        fn new(nodes: Vec<Vec<(String, u64, Vec<u64>)>>) -> Self {
            SyntheticProbe {
                nodes,
                broken_nodes: HashSet::new(),
                reported_zones: HashMap::new(),
            }
        }
    }

    impl ProbeSource for SyntheticProbe {
        fn online_nodes(&self) -> Result<Vec<NodeHandle>, Fault> {
            Ok((0..self.nodes.len() as u64).map(NodeHandle).collect())
        }

        fn node_meta(&self, node: NodeHandle) -> Result<NodeMeta, Fault> {
            if self.broken_nodes.contains(&node.0) {
                return Err(Fault::ReadFailed {
                    handle: node.0,
                    size: 8,
                });
            }
            let zones = self.nodes.get(node.0 as usize).ok_or(Fault::BadHandle(node.0))?;
            let nr_zones = self
                .reported_zones
                .get(&node.0)
                .copied()
                .unwrap_or(zones.len() as u32);
            Ok(NodeMeta {
                node_id: node.0 as u32,
                nr_zones,
            })
        }

        fn zone_meta(&self, node: NodeHandle, index: u32) -> Result<Option<ZoneMeta>, Fault> {
            let zones = self.nodes.get(node.0 as usize).ok_or(Fault::BadHandle(node.0))?;
            Ok(zones.get(index as usize).map(|(name, present, _)| ZoneMeta {
                zone: ZoneHandle((node.0 << 16) | u64::from(index)),
                name: name.clone(),
                start_pfn: 4096 * u64::from(index),
                spanned_pages: *present + 100,
                present_pages: *present,
            }))
        }

        fn nr_free(&self, zone: ZoneHandle, order: u32) -> Result<u64, Fault> {
            let (node, index) = ((zone.0 >> 16) as usize, (zone.0 & 0xffff) as usize);
            let (_, _, free) = self
                .nodes
                .get(node)
                .and_then(|zones| zones.get(index))
                .ok_or(Fault::BadHandle(zone.0))?;
            Ok(free.get(order as usize).copied().unwrap_or(0))
        }
    }

    fn zone(name: &str, free: &[u64]) -> (String, u64, Vec<u64>) {
        (name.to_string(), 1000, free.to_vec())
    }

    fn two_node_probe() -> SyntheticProbe {
        let free = vec![4, 3, 2, 1, 0, 0, 0, 0, 0, 0, 1];
        SyntheticProbe::new(vec![
            vec![
                zone("DMA", &free),
                zone("DMA32", &free),
                zone("Normal", &free),
            ],
            vec![
                zone("Normal", &free),
                zone("Movable", &free),
                zone("Device", &free),
            ],
        ])
    }

    fn walker(probe: SyntheticProbe) -> (TopologyWalker, Arc<TelemetryStore>) {
        let store = Arc::new(TelemetryStore::new());
        let walker = TopologyWalker::new(Arc::new(probe), store.clone(), &Config::default());
        (walker, store)
    }

    #[test]
    fn full_walk_emits_one_record_per_zone_order() {
        let (walker, store) = walker(two_node_probe());
        let records = walker.walk(WalkMode::AllNodes, Instant::now()).unwrap();

        // 2 nodes * 3 zones * 11 orders.
        assert_eq!(records.len(), 66);
        let keys: HashSet<ZoneKey> = records.iter().map(|r| r.key()).collect();
        assert_eq!(keys.len(), 66);

        assert_eq!(store.zones().len(), 66);
        assert_eq!(store.nodes().len(), 2);
        assert_eq!(store.zones_for_node(1).len(), 33);

        // Every record of this walk carries the same generation.
        assert!(records.iter().all(|r| r.generation == 1));
    }

    #[test]
    fn single_node_mode_walks_only_that_node() {
        let (walker, store) = walker(two_node_probe());
        let records = walker.walk(WalkMode::Node(NodeHandle(1)), Instant::now()).unwrap();
        assert_eq!(records.len(), 33);
        assert!(records.iter().all(|r| r.node_id == 1));
        assert_eq!(store.nodes().len(), 1);
    }

    #[test]
    fn scores_match_the_calculator() {
        let (walker, _) = walker(two_node_probe());
        let records = walker.walk(WalkMode::Node(NodeHandle(0)), Instant::now()).unwrap();

        // free = [4,3,2,1,0,...,0,1]: free_pages = 4+6+8+8+1024 = 1050.
        let order0 = records.iter().find(|r| r.order == 0).unwrap();
        assert_eq!(order0.free_pages, 1050);
        assert_eq!(order0.free_blocks_total, 11);
        assert_eq!(order0.free_blocks_suitable, 1050);
        assert_eq!(order0.unusable_index, 0);
        assert_eq!(order0.fragmentation_index, -1000);
    }

    #[test]
    fn broken_node_is_skipped_not_fatal() {
        let mut probe = two_node_probe();
        probe.broken_nodes.insert(0);
        let (walker, store) = walker(probe);
        let records = walker.walk(WalkMode::AllNodes, Instant::now()).unwrap();

        assert_eq!(records.len(), 33);
        assert!(records.iter().all(|r| r.node_id == 1));
        assert_eq!(store.nodes().len(), 1);
    }

    #[test]
    fn zone_count_is_clamped_to_maximum() {
        let mut probe = two_node_probe();
        // Node claims far more zones than the walker will enumerate.
        probe.reported_zones.insert(0, 40);
        let (walker, store) = walker(probe);
        let records = walker.walk(WalkMode::Node(NodeHandle(0)), Instant::now()).unwrap();

        // Only the three real zones produce records; indexes past them are absent.
        assert_eq!(records.len(), 33);
        assert_eq!(store.nodes()[0].nr_zones, Config::default().max_zones_per_node);
    }

    #[test]
    fn unpopulated_zone_is_skipped() {
        let mut probe = two_node_probe();
        probe.nodes[0][1].1 = 0; // DMA32 has no present pages
        let (walker, _) = walker(probe);
        let records = walker.walk(WalkMode::Node(NodeHandle(0)), Instant::now()).unwrap();
        assert_eq!(records.len(), 22);
        assert!(records.iter().all(|r| r.name != "DMA32"));
    }

    #[test]
    fn walks_within_cooldown_are_throttled() {
        let probe = two_node_probe();
        let store = Arc::new(TelemetryStore::new());
        let config = Config {
            sample_cooldown_secs: Some(10),
            ..Default::default()
        };
        let walker = TopologyWalker::new(Arc::new(probe), store, &config);

        let t0 = Instant::now();
        assert!(walker.walk(WalkMode::AllNodes, t0).is_ok());
        assert!(matches!(
            walker.walk(WalkMode::AllNodes, t0 + Duration::from_secs(1)),
            Err(WalkError::Throttled)
        ));
        assert!(walker.walk(WalkMode::AllNodes, t0 + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn repeated_walks_overwrite_with_new_generation() {
        let (walker, store) = walker(two_node_probe());
        walker.walk(WalkMode::AllNodes, Instant::now()).unwrap();
        walker.walk(WalkMode::AllNodes, Instant::now()).unwrap();

        assert_eq!(store.zones().len(), 66);
        assert!(store.zones().iter().all(|z| z.generation == 2));
    }
}
