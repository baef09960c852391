// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Common identifiers shared by the probe boundary, the walker and the store.

use std::fmt;

use enumn::N;
use serde::Deserialize;
use serde::Serialize;

/// Highest sampled order unless configured otherwise; a block of order `k` spans `2^k` pages.
pub const DEFAULT_MAX_ORDER: u32 = 10;

/// Upper bound on zones enumerated per node. Matches MAX_NR_ZONES on the platforms we sample.
pub const MAX_ZONES_PER_NODE: u32 = 6;

/// Zone names reported by the probe are truncated to this many bytes.
pub const ZONE_NAME_LEN: usize = 32;

/// Process names reported with fallback events are truncated to this many bytes.
pub const COMM_LEN: usize = 16;

/// Opaque handle to a node's memory descriptor, valid only for the probe that issued it.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeHandle(pub u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle to a zone, valid only for the probe that issued it.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Default,
)]
pub struct ZoneHandle(pub u64);

impl fmt::Display for ZoneHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Page mobility classification used by the allocator's free lists.
///
/// Fallback events carry these as raw integers; decode with [`MigrateType::n`]. Values the
/// running kernel does not define decode to `None` and should be reported raw.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, N, Serialize, Deserialize)]
pub enum MigrateType {
    Unmovable = 0,
    Movable = 1,
    Reclaimable = 2,
    HighAtomic = 3,
    Cma = 4,
    Isolate = 5,
}

/// Truncates `raw` to at most `max` bytes without splitting a UTF-8 sequence.
pub fn bounded_name(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        return raw.to_string();
    }
    let mut end = max;
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_type_decodes_known_values() {
        assert_eq!(MigrateType::n(0), Some(MigrateType::Unmovable));
        assert_eq!(MigrateType::n(1), Some(MigrateType::Movable));
        assert_eq!(MigrateType::n(5), Some(MigrateType::Isolate));
        assert_eq!(MigrateType::n(6), None);
        assert_eq!(MigrateType::n(-1), None);
    }

    #[test]
    fn bounded_name_truncates() {
        assert_eq!(bounded_name("Normal", ZONE_NAME_LEN), "Normal");
        assert_eq!(bounded_name("abcdefgh", 4), "abcd");
        // Multi-byte characters are not split.
        assert_eq!(bounded_name("aé", 2), "a");
    }
}
