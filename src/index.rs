// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fragmentation scoring, scaled to thousandths with truncating integer division.
//!
//! External consumers compare these scores against kernel-reported values, so the exact
//! division and truncation order below is load bearing. Pathological inputs can push the
//! fragmentation index outside [-1000, 1000]; that is expected and not re-clamped.

use log::warn;

use crate::contig::shl_saturating;
use crate::contig::ContigPageInfo;

/// Fraction (in thousandths) of free memory that is not part of a block of at least
/// `order`. 1000 when there is no free memory at all.
pub fn unusable_free_index(order: u32, info: &ContigPageInfo) -> i64 {
    if info.free_pages == 0 {
        return 1000;
    }
    // Malformed probe data can report more suitable pages than free pages; saturate rather
    // than underflow so garbage input yields a clamped score.
    let suitable_pages = shl_saturating(info.free_blocks_suitable, order);
    let unusable = info.free_pages.saturating_sub(suitable_pages);
    (u128::from(unusable) * 1000 / u128::from(info.free_pages)) as i64
}

/// How much of the lack of a suitable block at `order` is due to fragmentation rather than
/// shortage: near 0 means shortage, near 1000 means fragmentation. 0 when there are no free
/// blocks at all, -1000 when a suitable block already exists.
pub fn fragmentation_index(order: u32, max_order: u32, info: &ContigPageInfo) -> i64 {
    if order > max_order {
        warn!("fragmentation index requested for order {order} > {max_order}");
        return 0;
    }
    if info.free_blocks_total == 0 {
        return 0;
    }
    if info.free_blocks_suitable > 0 {
        return -1000;
    }
    let requested = 1u128 << order;
    let free_ratio = u128::from(info.free_pages) * 1000 / requested;
    1000 - ((1000 + free_ratio) / u128::from(info.free_blocks_total)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(free_pages: u64, free_blocks_total: u64, free_blocks_suitable: u64) -> ContigPageInfo {
        ContigPageInfo {
            free_pages,
            free_blocks_total,
            free_blocks_suitable,
        }
    }

    #[test]
    fn no_free_memory_is_fully_unusable() {
        for order in 0..=10 {
            assert_eq!(unusable_free_index(order, &info(0, 0, 0)), 1000);
            assert_eq!(unusable_free_index(order, &info(0, 7, 3)), 1000);
        }
    }

    #[test]
    fn unusable_index_truncates() {
        // (1000 - (2 << 2)) * 1000 / 1000
        assert_eq!(unusable_free_index(2, &info(1000, 10, 2)), 992);
        // Everything suitable: fully usable.
        assert_eq!(unusable_free_index(0, &info(64, 1, 64)), 0);
    }

    #[test]
    fn unusable_index_saturates_on_malformed_data() {
        // More suitable pages than free pages must not underflow.
        assert_eq!(unusable_free_index(4, &info(100, 2, 1000)), 0);
    }

    #[test]
    fn no_free_blocks_means_no_data() {
        for order in 0..=10 {
            assert_eq!(fragmentation_index(order, 10, &info(500, 0, 0)), 0);
        }
    }

    #[test]
    fn existing_suitable_block_is_never_fragmentations_fault() {
        assert_eq!(fragmentation_index(3, 10, &info(500, 10, 1)), -1000);
        // Malformed suitable > total still takes the same branch without panicking.
        assert_eq!(fragmentation_index(3, 10, &info(500, 10, 999)), -1000);
    }

    #[test]
    fn fragmentation_index_exact_truncation() {
        // 1000 - ((1000 + 500*1000/8) / 10) == 1000 - 6350; outside [-1000, 1000] and
        // deliberately not re-clamped.
        assert_eq!(fragmentation_index(3, 10, &info(500, 10, 0)), -5350);
    }

    #[test]
    fn high_order_shortage_reads_as_fragmentation() {
        // 512 free pages split into 512 single-page blocks: an order-9 block is missing
        // because of fragmentation, not shortage.
        // 1000 - ((1000 + 512*1000/512) / 512) == 1000 - 3
        assert_eq!(fragmentation_index(9, 10, &info(512, 512, 0)), 997);
    }

    #[test]
    fn out_of_contract_order_returns_zero() {
        assert_eq!(fragmentation_index(11, 10, &info(500, 10, 0)), 0);
        assert_eq!(fragmentation_index(u32::MAX, 10, &info(500, 10, 0)), 0);
    }
}
