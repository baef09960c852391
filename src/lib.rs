// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buddy-allocator fragmentation telemetry.
//!
//! fragwatch samples a physical page allocator through a pluggable [`probe::ProbeSource`],
//! walking NUMA nodes, zones and power-of-two orders to derive two integer-scaled scores
//! per (zone, order): the unusable free index (how much free memory is not usable at that
//! order) and the fragmentation index (whether a missing block is fragmentation's fault or
//! plain shortage). Independently it folds allocation fallback events into per-CPU and
//! per-process views. Consumers read the latest records from the [`store::TelemetryStore`];
//! [`engine::FragEngine`] wires everything behind a non-blocking ingestion queue.
//!
//! Display, export and the kernel attach mechanism are out of scope; the probe and the
//! store are the two integration surfaces.

pub mod config;
pub mod contig;
pub mod engine;
pub mod fallback;
pub mod index;
pub mod probe;
pub mod rate_limit;
pub mod store;
pub mod topology;
pub mod types;

pub use config::Config;
pub use contig::fill_contig_page_info;
pub use contig::ContigPageInfo;
pub use engine::FragEngine;
pub use fallback::FallbackAggregator;
pub use fallback::FallbackEvent;
pub use fallback::ProcessRecord;
pub use index::fragmentation_index;
pub use index::unusable_free_index;
pub use probe::BuddyinfoProbe;
pub use probe::Fault;
pub use probe::NodeMeta;
pub use probe::ProbeSource;
pub use probe::ZoneMeta;
pub use rate_limit::SampleRateLimiter;
pub use store::TelemetryStore;
pub use topology::NodeInfo;
pub use topology::TopologyWalker;
pub use topology::WalkError;
pub use topology::WalkMode;
pub use topology::ZoneInfo;
pub use topology::ZoneKey;
pub use types::MigrateType;
pub use types::NodeHandle;
pub use types::ZoneHandle;
pub use types::DEFAULT_MAX_ORDER;
