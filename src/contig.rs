// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Free-list scan for one zone, aggregating the raw counts the index calculations consume.

use serde::Deserialize;
use serde::Serialize;

use crate::probe::ProbeSource;
use crate::types::ZoneHandle;

/// Aggregate of one scan of a zone's free lists against a target order. Ephemeral; never
/// stored.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContigPageInfo {
    /// Total free pages across all orders.
    pub free_pages: u64,
    /// Total free blocks across all orders.
    pub free_blocks_total: u64,
    /// Free blocks at or above the target order, expressed in target-order units.
    pub free_blocks_suitable: u64,
}

/// `value << shift`, saturating at `u64::MAX` instead of losing bits.
pub(crate) fn shl_saturating(value: u64, shift: u32) -> u64 {
    if value == 0 {
        return 0;
    }
    value
        .checked_shl(shift)
        .filter(|v| v >> shift == value)
        .unwrap_or(u64::MAX)
}

/// Counts free blocks for every order `0..=max_order` of `zone` and derives the aggregates
/// for `suitable_order`.
///
/// A failed read for one order counts as zero blocks for that order; sampling is best
/// effort and the structures under the probe are live.
pub fn fill_contig_page_info(
    probe: &dyn ProbeSource,
    zone: ZoneHandle,
    suitable_order: u32,
    max_order: u32,
) -> ContigPageInfo {
    let mut info = ContigPageInfo::default();
    for order in 0..=max_order {
        let blocks = probe.nr_free(zone, order).unwrap_or(0);
        info.free_blocks_total += blocks;
        info.free_pages = info
            .free_pages
            .saturating_add(shl_saturating(blocks, order));
        if order >= suitable_order {
            info.free_blocks_suitable = info
                .free_blocks_suitable
                .saturating_add(shl_saturating(blocks, order - suitable_order));
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use sync::Mutex;

    use super::*;
    use crate::probe::Fault;
    use crate::probe::NodeMeta;
    use crate::probe::ZoneMeta;
    use crate::types::NodeHandle;

    /// Serves a fixed per-order count table; orders listed in `broken` fail to read.
    struct FreeListProbe {
        counts: Vec<u64>,
        broken: Mutex<Vec<u32>>,
    }

    impl FreeListProbe {
        fn new(counts: &[u64]) -> Self {
            FreeListProbe {
                counts: counts.to_vec(),
                broken: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProbeSource for FreeListProbe {
        fn online_nodes(&self) -> Result<Vec<NodeHandle>, Fault> {
            Ok(vec![])
        }

        fn node_meta(&self, node: NodeHandle) -> Result<NodeMeta, Fault> {
            Err(Fault::BadHandle(node.0))
        }

        fn zone_meta(&self, node: NodeHandle, _index: u32) -> Result<Option<ZoneMeta>, Fault> {
            Err(Fault::BadHandle(node.0))
        }

        fn nr_free(&self, zone: ZoneHandle, order: u32) -> Result<u64, Fault> {
            if self.broken.lock().contains(&order) {
                return Err(Fault::ReadFailed {
                    handle: zone.0,
                    size: 8,
                });
            }
            Ok(self.counts.get(order as usize).copied().unwrap_or(0))
        }
    }

    #[test]
    fn aggregates_across_orders() {
        // orders:        0  1  2  3
        let probe = FreeListProbe::new(&[4, 3, 2, 1]);
        let info = fill_contig_page_info(&probe, ZoneHandle(1), 2, 3);

        assert_eq!(info.free_blocks_total, 10);
        // 4*1 + 3*2 + 2*4 + 1*8
        assert_eq!(info.free_pages, 26);
        // order 2: 2<<0, order 3: 1<<1
        assert_eq!(info.free_blocks_suitable, 4);
    }

    #[test]
    fn suitable_order_zero_counts_all_pages() {
        let probe = FreeListProbe::new(&[4, 3, 2, 1]);
        let info = fill_contig_page_info(&probe, ZoneHandle(1), 0, 3);
        // With a target of order 0, every free page is a suitable block.
        assert_eq!(info.free_blocks_suitable, info.free_pages);
    }

    #[test]
    fn failed_order_read_counts_as_zero() {
        let probe = FreeListProbe::new(&[4, 3, 2, 1]);
        probe.broken.lock().push(1);
        let info = fill_contig_page_info(&probe, ZoneHandle(1), 0, 3);

        assert_eq!(info.free_blocks_total, 7);
        assert_eq!(info.free_pages, 20);
    }

    #[test]
    fn empty_free_lists() {
        let probe = FreeListProbe::new(&[]);
        let info = fill_contig_page_info(&probe, ZoneHandle(1), 0, 10);
        assert_eq!(info, ContigPageInfo::default());
    }
}
