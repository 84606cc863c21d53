// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Serialized data processor pool: workers drain the ingress queue, update
//! the per-device state and merge each payload into the durable store.

mod dispatch;
pub mod queue;

pub use queue::{DataQueue, ProcessorItem, PushResult, QueueItem, RawProto, SharedDataQueue};

use crate::app::config::GlobalSettings;
use crate::common::time_utils::current_unix;
use crate::infrastructure::data::submit::ProtoSubmit;
use crate::services::mapping::SharedMappingService;
use crate::services::mitm_mapper::SharedMitmMapper;
use crate::services::stats::SharedStats;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub workers: usize,
    /// Items older than this on dequeue are dropped; 0 disables.
    pub ignore_threshold_secs: i64,
    pub max_requeue: u32,
    pub min_level_iv: i32,
}

impl From<&GlobalSettings> for ProcessorSettings {
    fn from(settings: &GlobalSettings) -> Self {
        Self {
            workers: settings.processor_workers,
            ignore_threshold_secs: settings.processor_ignore_threshold_secs as i64,
            max_requeue: settings.processor_max_requeue,
            min_level_iv: settings.min_level_iv,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_requeue: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dropped_stale: u64,
    pub dropped_requeue: u64,
    pub rejected: u64,
}

impl ProcessorMetrics {
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_requeue: self.dropped_requeue.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker needs to handle one payload.
pub struct DataProcessor {
    mapper: SharedMitmMapper,
    submit: ProtoSubmit,
    stats: SharedStats,
    mapping: SharedMappingService,
    settings: ProcessorSettings,
    metrics: Arc<ProcessorMetrics>,
}

impl DataProcessor {
    pub fn new(
        mapper: SharedMitmMapper,
        submit: ProtoSubmit,
        stats: SharedStats,
        mapping: SharedMappingService,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            mapper,
            submit,
            stats,
            mapping,
            settings,
            metrics: Arc::new(ProcessorMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ProcessorMetrics> {
        self.metrics.clone()
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    fn is_stale(&self, item: &ProcessorItem, now: i64) -> bool {
        let threshold = self.settings.ignore_threshold_secs;
        threshold > 0 && item.arrival_ts < now - threshold
    }

    /// Handles one dequeued item, putting it back on `queue` when the
    /// failure is retryable and attempts remain.
    pub async fn handle(&self, mut item: ProcessorItem, queue: &DataQueue) {
        if self.is_stale(&item, current_unix()) {
            self.metrics.dropped_stale.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                target: "processor",
                origin = %item.origin,
                arrival_ts = item.arrival_ts,
                "Dropping data older than the ignore threshold"
            );
            return;
        }

        match self.process(&item).await {
            Ok(()) => {
                self.metrics.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_requeueable() && item.attempts < self.settings.max_requeue => {
                item.attempts += 1;
                tracing::info!(
                    target: "processor",
                    origin = %item.origin,
                    method = item.payload.method,
                    attempts = item.attempts,
                    error = %e,
                    "Failed submitting data, rescheduling"
                );
                if queue.push(item).await.accepted {
                    self.metrics.requeued.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.dropped_requeue.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(target: "processor", "Queue full, retry dropped");
                }
            }
            Err(e) if e.is_requeueable() => {
                self.metrics.dropped_requeue.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "processor",
                    origin = %item.origin,
                    method = item.payload.method,
                    attempts = item.attempts,
                    error = %e,
                    "Giving up on data after repeated retryable failures"
                );
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "processor",
                    origin = %item.origin,
                    method = item.payload.method,
                    error = %e,
                    "Failed processing data"
                );
            }
        }
    }
}

pub struct ProcessorPool {
    queue: SharedDataQueue,
    handles: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl ProcessorPool {
    pub fn spawn(workers: usize, processor: Arc<DataProcessor>, queue: SharedDataQueue) -> Self {
        let stop = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|id| {
                let processor = processor.clone();
                let queue = queue.clone();
                let stop = stop.clone();
                tokio::spawn(async move { worker_loop(id, processor, queue, stop).await })
            })
            .collect();
        Self {
            queue,
            handles,
            stop,
        }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// One sentinel per worker, then waits up to `grace` for the queue to
    /// drain before stopping the stragglers.
    pub async fn shutdown(self, grace: Duration) {
        for _ in 0..self.handles.len() {
            self.queue.push_shutdown().await;
        }
        let joined = tokio::time::timeout(grace, futures::future::join_all(self.handles)).await;
        if joined.is_err() {
            tracing::warn!(target: "processor", "Processor workers did not drain in time");
            self.stop.cancel();
        }
    }
}

async fn worker_loop(
    id: usize,
    processor: Arc<DataProcessor>,
    queue: SharedDataQueue,
    stop: CancellationToken,
) {
    tracing::info!(target: "processor", worker = id, "Starting serialized data processor");
    while let Some(item) = queue.pop(&stop).await {
        match item {
            QueueItem::Shutdown => {
                tracing::info!(target: "processor", worker = id, "Received signal to stop");
                break;
            }
            QueueItem::Data(item) => {
                let started = std::time::Instant::now();
                processor.handle(item, &queue).await;
                tracing::trace!(
                    target: "processor",
                    worker = id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Finished queue item"
                );
            }
        }
    }
}
