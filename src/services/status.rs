// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::common::time_utils::current_unix;
use crate::domain::geo::Location;
use crate::domain::types::{TransportType, WorkerMode};
use crate::services::processor::{ProcessorMetrics, SharedDataQueue};
use crate::services::strategy::WorkerLifecycle;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Last known state of one device as driven by its strategy.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub origin: String,
    pub area: Option<String>,
    pub mode: Option<WorkerMode>,
    pub current_location: Option<Location>,
    pub last_known_location: Option<Location>,
    pub transport: Option<TransportType>,
    pub phase: Option<WorkerLifecycle>,
    pub restart_count: u32,
    pub reboot_count: u32,
    pub last_proto_ts: Option<i64>,
    pub sleeping_until: Option<i64>,
    pub idle: bool,
    pub updated_at: i64,
}

#[derive(Default)]
pub struct StatusBoard {
    devices: DashMap<String, DeviceStatus>,
}

pub type SharedStatusBoard = Arc<StatusBoard>;

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, origin: &str, apply: impl FnOnce(&mut DeviceStatus)) {
        let mut entry = self.devices.entry(origin.to_string()).or_insert_with(|| DeviceStatus {
            origin: origin.to_string(),
            ..Default::default()
        });
        apply(&mut entry);
        entry.updated_at = current_unix();
    }

    pub fn get(&self, origin: &str) -> Option<DeviceStatus> {
        self.devices.get(origin).map(|d| d.clone())
    }

    /// All devices, sorted by origin.
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        let mut all: Vec<DeviceStatus> = self.devices.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.origin.cmp(&b.origin));
        all
    }
}

/// Serves `/status` (JSON) and `/metrics` (Prometheus text). Returns the bound
/// address, or `None` when the port could not be bound.
pub async fn spawn_status_server(
    port: u16,
    board: SharedStatusBoard,
    metrics: Arc<ProcessorMetrics>,
    queue: SharedDataQueue,
    shutdown: CancellationToken,
) -> Option<SocketAddr> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(target: "status", "Status server failed to bind: {}", e);
            return None;
        }
    };

    let local = listener.local_addr().ok();
    if let Some(addr) = local {
        tracing::info!(target: "status", "Status server listening on {}", addr);
    }

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, _)) => {
                    let body = Rendered {
                        board: board.clone(),
                        metrics: metrics.clone(),
                        queue: queue.clone(),
                    };
                    tokio::spawn(async move { body.respond(socket).await });
                }
                Err(e) => {
                    tracing::warn!(target: "status", "Status accept error: {}", e);
                    continue;
                }
            }
        }
    });

    local
}

struct Rendered {
    board: SharedStatusBoard,
    metrics: Arc<ProcessorMetrics>,
    queue: SharedDataQueue,
}

impl Rendered {
    async fn respond(self, mut socket: TcpStream) {
        let mut buf = [0u8; 1024];
        let n = socket.read(&mut buf).await.unwrap_or(0);
        let req = String::from_utf8_lossy(&buf[..n]).to_string();
        let path = req
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .unwrap_or("/");
        let (route, _query) = path.split_once('?').unwrap_or((path, ""));

        let (status, content_type, body) = if route.starts_with("/status") {
            let body = serde_json::to_string(&self.board.snapshot()).unwrap_or_else(|_| "[]".to_string());
            ("200 OK", "application/json", body)
        } else if route.starts_with("/metrics") || route == "/" {
            ("200 OK", "text/plain", self.render_metrics().await)
        } else {
            ("404 Not Found", "text/plain", "not found".to_string())
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        );
        let _ = socket.write_all(response.as_bytes()).await;
    }

    async fn render_metrics(&self) -> String {
        let snap = self.metrics.snapshot();
        let mut body = format!(
            concat!(
                "# TYPE processor_processed counter\nprocessor_processed {}\n",
                "# TYPE processor_failed counter\nprocessor_failed {}\n",
                "# TYPE processor_requeued counter\nprocessor_requeued {}\n",
                "# TYPE processor_dropped_stale counter\nprocessor_dropped_stale {}\n",
                "# TYPE processor_dropped_requeue counter\nprocessor_dropped_requeue {}\n",
                "# TYPE ingress_rejected counter\ningress_rejected {}\n",
                "# TYPE processor_queue_depth gauge\nprocessor_queue_depth {}\n"
            ),
            snap.processed,
            snap.failed,
            snap.requeued,
            snap.dropped_stale,
            snap.dropped_requeue,
            snap.rejected,
            self.queue.len().await
        );

        let devices = self.board.snapshot();
        if !devices.is_empty() {
            body.push_str("# TYPE device_restart_count gauge\n");
            for d in &devices {
                body.push_str(&format!("device_restart_count{{origin=\"{}\"}} {}\n", d.origin, d.restart_count));
            }
            body.push_str("# TYPE device_reboot_count gauge\n");
            for d in &devices {
                body.push_str(&format!("device_reboot_count{{origin=\"{}\"}} {}\n", d.origin, d.reboot_count));
            }
            body.push_str("# TYPE device_last_proto_ts gauge\n");
            for d in &devices {
                body.push_str(&format!(
                    "device_last_proto_ts{{origin=\"{}\"}} {}\n",
                    d.origin,
                    d.last_proto_ts.unwrap_or_default()
                ));
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::processor::DataQueue;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut socket = TcpStream::connect(("127.0.0.1", addr.port())).await.expect("connect");
        socket
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .expect("write");
        let mut out = String::new();
        socket.read_to_string(&mut out).await.expect("read");
        out
    }

    #[test]
    fn board_updates_merge_per_origin() {
        let board = StatusBoard::new();
        board.update("dev2", |s| s.restart_count = 2);
        board.update("dev1", |s| s.mode = Some(WorkerMode::MonMitm));
        board.update("dev2", |s| s.reboot_count = 1);

        let dev2 = board.get("dev2").expect("dev2");
        assert_eq!((dev2.restart_count, dev2.reboot_count), (2, 1));
        let all = board.snapshot();
        assert_eq!(all.iter().map(|d| d.origin.as_str()).collect::<Vec<_>>(), ["dev1", "dev2"]);
    }

    #[tokio::test]
    async fn serves_status_and_metrics() {
        let board = Arc::new(StatusBoard::new());
        board.update("dev1", |s| {
            s.restart_count = 3;
            s.last_proto_ts = Some(1_000);
        });
        let metrics = Arc::new(ProcessorMetrics::default());
        metrics.record_rejected();
        let shutdown = CancellationToken::new();
        let addr = spawn_status_server(0, board, metrics, Arc::new(DataQueue::new(4)), shutdown.clone())
            .await
            .expect("bind");

        let status = get(addr, "/status").await;
        assert!(status.starts_with("HTTP/1.1 200 OK"));
        assert!(status.contains("\"origin\":\"dev1\""));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("ingress_rejected 1"));
        assert!(metrics.contains("device_restart_count{origin=\"dev1\"} 3"));

        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
        shutdown.cancel();
    }
}
