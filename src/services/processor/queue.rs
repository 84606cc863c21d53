// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::geo::Location;
use crate::services::mitm_mapper::LatestPayload;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// One decoded message as forwarded by a device.
#[derive(Clone, Debug, PartialEq)]
pub struct RawProto {
    pub method: i32,
    pub payload: LatestPayload,
    pub device_ts: i64,
    pub location: Option<Location>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorItem {
    pub arrival_ts: i64,
    pub payload: RawProto,
    pub origin: String,
    /// Times the item went back on the queue after a retryable failure.
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueueItem {
    Data(ProcessorItem),
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushResult {
    pub accepted: bool,
    pub depth: usize,
}

/// Bounded FIFO between ingress and the processor pool. A full queue
/// refuses new data so ingress can push back on devices.
pub struct DataQueue {
    capacity: usize,
    queue: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
}

pub type SharedDataQueue = Arc<DataQueue>;

impl DataQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn push(&self, item: ProcessorItem) -> PushResult {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            return PushResult {
                accepted: false,
                depth: queue.len(),
            };
        }
        queue.push_back(QueueItem::Data(item));
        let depth = queue.len();
        drop(queue);
        self.notify.notify_one();
        PushResult {
            accepted: true,
            depth,
        }
    }

    /// Sentinels bypass the capacity bound.
    pub async fn push_shutdown(&self) {
        self.queue.lock().await.push_back(QueueItem::Shutdown);
        self.notify.notify_one();
    }

    pub async fn pop(&self, stop: &CancellationToken) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.queue.lock().await;
                if let Some(item) = queue.pop_front() {
                    if !queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = notified => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn item(origin: &str, method: i32, device_ts: i64) -> ProcessorItem {
        ProcessorItem {
            arrival_ts: device_ts,
            payload: RawProto {
                method,
                payload: LatestPayload::from_json(json!({})),
                device_ts,
                location: None,
            },
            origin: origin.to_string(),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn queue_is_fifo_and_refuses_data_when_full() {
        let q = DataQueue::new(2);
        let stop = CancellationToken::new();

        assert!(q.push(item("a", 106, 1)).await.accepted);
        let second = q.push(item("a", 106, 2)).await;
        assert_eq!(second, PushResult { accepted: true, depth: 2 });
        assert!(!q.push(item("a", 106, 3)).await.accepted);
        q.push_shutdown().await;
        assert_eq!(q.len().await, 3);

        match q.pop(&stop).await {
            Some(QueueItem::Data(first)) => assert_eq!(first.payload.device_ts, 1),
            other => panic!("expected data, got {other:?}"),
        }
        match q.pop(&stop).await {
            Some(QueueItem::Data(next)) => assert_eq!(next.payload.device_ts, 2),
            other => panic!("expected data, got {other:?}"),
        }
        assert_eq!(q.pop(&stop).await, Some(QueueItem::Shutdown));
    }

    #[tokio::test]
    async fn pop_returns_none_once_stopped() {
        let q = DataQueue::new(1);
        let stop = CancellationToken::new();
        stop.cancel();
        assert_eq!(q.pop(&stop).await, None);
    }
}
