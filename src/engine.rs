// Copyright 2025 The fragwatch Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Glue between the probe's delivery context and the sampling logic.
//!
//! Probe callbacks run in a context that must not block or sleep, so ingestion is a
//! non-blocking `try_send` onto a bounded queue and all real work happens on one worker
//! thread that owns the walker and the aggregator. A full queue drops the command and
//! counts the drop; sampling is best effort by design.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::sync::mpsc::TrySendError;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Context;
use log::debug;
use log::warn;

use crate::config::Config;
use crate::fallback::FallbackAggregator;
use crate::fallback::FallbackEvent;
use crate::probe::ProbeSource;
use crate::store::TelemetryStore;
use crate::topology::TopologyWalker;
use crate::topology::WalkError;
use crate::topology::WalkMode;

enum Command {
    Event(FallbackEvent),
    Walk(WalkMode),
    Shutdown,
}

/// Owns the telemetry store, the worker thread and the ingestion queue.
pub struct FragEngine {
    store: Arc<TelemetryStore>,
    tx: SyncSender<Command>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl FragEngine {
    pub fn new(probe: Arc<dyn ProbeSource>, config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(TelemetryStore::new());
        let walker = TopologyWalker::new(probe, store.clone(), config);
        let aggregator = FallbackAggregator::new(store.clone(), config);
        let (tx, rx) = mpsc::sync_channel(config.queue_depth.max(1));
        let worker = thread::Builder::new()
            .name("fragwatch_worker".to_string())
            .spawn(move || Self::run(rx, walker, aggregator))
            .context("spawning fragwatch worker thread")?;
        Ok(FragEngine {
            store,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Some(worker),
        })
    }

    fn run(rx: Receiver<Command>, walker: TopologyWalker, aggregator: FallbackAggregator) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                Command::Shutdown => break,
                Command::Event(evt) => aggregator.on_event(&evt),
                Command::Walk(mode) => match walker.walk(mode, Instant::now()) {
                    Ok(records) => debug!("walk produced {} zone records", records.len()),
                    Err(WalkError::Throttled) => debug!("walk suppressed by cooldown"),
                    Err(e) => warn!("topology walk failed: {e}"),
                },
            }
        }
    }

    /// Queues one fallback event. Never blocks; returns false if the queue was full and
    /// the event was dropped.
    pub fn handle_event(&self, evt: FallbackEvent) -> bool {
        self.enqueue(Command::Event(evt))
    }

    /// Requests a topology walk. Never blocks; returns false if the queue was full.
    pub fn trigger_walk(&self, mode: WalkMode) -> bool {
        self.enqueue(Command::Walk(mode))
    }

    fn enqueue(&self, cmd: Command) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Commands dropped because the ingestion queue was full.
    pub fn dropped_commands(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// Drains queued commands and joins the worker thread.
    pub fn stop(mut self) {
        self.stop_internal();
    }

    fn stop_internal(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Shutdown must get through even when the queue is momentarily full, and
            // blocking is fine here: stop() is never called from the probe's context.
            let _ = self.tx.send(Command::Shutdown);
            if worker.join().is_err() {
                warn!("fragwatch worker thread panicked");
            }
        }
    }
}

impl Drop for FragEngine {
    fn drop(&mut self) {
        self.stop_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Fault;
    use crate::probe::NodeMeta;
    use crate::probe::ZoneMeta;
    use crate::types::NodeHandle;
    use crate::types::ZoneHandle;

    /// One node, one zone, flat free lists.
    struct OneZoneProbe;

    impl ProbeSource for OneZoneProbe {
        fn online_nodes(&self) -> Result<Vec<NodeHandle>, Fault> {
            Ok(vec![NodeHandle(0)])
        }

        fn node_meta(&self, _node: NodeHandle) -> Result<NodeMeta, Fault> {
            Ok(NodeMeta {
                node_id: 0,
                nr_zones: 1,
            })
        }

        fn zone_meta(&self, _node: NodeHandle, index: u32) -> Result<Option<ZoneMeta>, Fault> {
            if index > 0 {
                return Ok(None);
            }
            Ok(Some(ZoneMeta {
                zone: ZoneHandle(1),
                name: "Normal".to_string(),
                start_pfn: 0,
                spanned_pages: 2048,
                present_pages: 2000,
            }))
        }

        fn nr_free(&self, _zone: ZoneHandle, _order: u32) -> Result<u64, Fault> {
            Ok(2)
        }
    }

    fn test_event(pid: u32, cpu: u32) -> FallbackEvent {
        FallbackEvent {
            pfn: 0xabc,
            alloc_order: 1,
            fallback_order: 3,
            alloc_migratetype: 1,
            fallback_migratetype: 2,
            change_ownership: false,
            pid,
            comm: "stress".to_string(),
            cpu,
            seq: 1,
        }
    }

    #[test]
    fn events_and_walks_flow_through_the_queue() {
        let engine = FragEngine::new(Arc::new(OneZoneProbe), &Config::default()).unwrap();

        assert!(engine.handle_event(test_event(10, 0)));
        assert!(engine.handle_event(test_event(10, 1)));
        assert!(engine.trigger_walk(WalkMode::AllNodes));

        let store = engine.store().clone();
        // stop() drains the queue before joining.
        engine.stop();

        assert_eq!(store.total_fallbacks(), 2);
        assert_eq!(store.process_records()[0].count, 2);
        assert_eq!(store.zones().len(), 11);
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn stop_is_idempotent_through_drop() {
        let engine = FragEngine::new(Arc::new(OneZoneProbe), &Config::default()).unwrap();
        engine.trigger_walk(WalkMode::Node(NodeHandle(0)));
        drop(engine);
    }
}
