// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! HTTP boundary for the devices: payload batches in, capture filter out,
//! and the command mailbox for the control channel.

use crate::common::time_utils::current_unix;
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use crate::services::device::{DeviceCommand, DeviceReport, SharedMailbox};
use crate::services::mapping::SharedMappingService;
use crate::services::mitm_mapper::{InjectionBundle, LatestPayload, SharedMitmMapper};
use crate::services::processor::{ProcessorItem, ProcessorMetrics, RawProto, SharedDataQueue};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Device timestamps above this are milliseconds.
const MS_TIMESTAMP_FLOOR: i64 = 100_000_000_000;

#[derive(Clone)]
pub struct IngressState {
    pub queue: SharedDataQueue,
    pub mapper: SharedMitmMapper,
    pub mapping: SharedMappingService,
    pub mailbox: SharedMailbox,
    pub metrics: Arc<ProcessorMetrics>,
}

#[derive(Debug, Deserialize)]
struct ProtoEnvelope {
    #[serde(rename = "type", alias = "method")]
    method: i32,
    #[serde(default)]
    payload: Value,
    #[serde(default, alias = "timestamp")]
    device_ts: Option<i64>,
    #[serde(default)]
    location: Option<Location>,
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    origin: String,
    protos: Vec<ProtoEnvelope>,
    #[serde(default)]
    quests_held: Option<Vec<i32>>,
}

#[derive(Debug, Deserialize)]
struct SingleBody {
    origin: String,
    #[serde(flatten)]
    proto: ProtoEnvelope,
    #[serde(default)]
    quests_held: Option<Vec<i32>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MitmBody {
    Batch(BatchBody),
    Single(SingleBody),
}

impl MitmBody {
    fn into_parts(self) -> (String, Vec<ProtoEnvelope>, Option<Vec<i32>>) {
        match self {
            MitmBody::Batch(b) => (b.origin, b.protos, b.quests_held),
            MitmBody::Single(s) => (s.origin, vec![s.proto], s.quests_held),
        }
    }
}

struct IngressFailure(StatusCode, String);

impl IntoResponse for IngressFailure {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"ok": false, "error": self.1}))).into_response()
    }
}

impl From<AppError> for IngressFailure {
    fn from(e: AppError) -> Self {
        IngressFailure(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mitm", post(mitm))
        .route("/control/:origin", get(control))
        .with_state(state)
}

async fn health(State(state): State<IngressState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "queue_depth": state.queue.len().await,
        "queue_capacity": state.queue.capacity(),
    }))
}

fn normalize_device_ts(raw: Option<i64>, arrival_ts: i64) -> i64 {
    match raw {
        Some(ts) if ts >= MS_TIMESTAMP_FLOOR => ts / 1000,
        Some(ts) if ts > 0 => ts,
        _ => arrival_ts,
    }
}

/// Strings are base64 encoded raw messages; anything else is a decoded one.
fn payload_of(value: Value) -> LatestPayload {
    match value {
        Value::String(raw) => match STANDARD.decode(raw.as_bytes()) {
            Ok(bytes) => LatestPayload::Bytes(bytes),
            Err(_) => LatestPayload::Json(Value::String(raw)),
        },
        other => LatestPayload::from_json(other),
    }
}

/// `Authorization: Bearer user:pass` or `Basic base64(user:pass)`.
fn credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, value) = raw.trim().split_once(' ')?;
    let pair = match scheme.to_ascii_lowercase().as_str() {
        "basic" => String::from_utf8(STANDARD.decode(value.trim()).ok()?).ok()?,
        "bearer" => value.trim().to_string(),
        _ => return None,
    };
    let (user, pass) = pair.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn authorize(state: &IngressState, headers: &HeaderMap) -> Result<(), IngressFailure> {
    let Some(auths) = state.mapping.get_auths().await? else {
        return Ok(());
    };
    match credentials(headers) {
        Some((user, pass)) if auths.get(&user) == Some(&pass) => Ok(()),
        _ => Err(IngressFailure(StatusCode::UNAUTHORIZED, "invalid credentials".into())),
    }
}

async fn mitm(
    State(state): State<IngressState>,
    headers: HeaderMap,
    Json(body): Json<MitmBody>,
) -> Result<Json<InjectionBundle>, IngressFailure> {
    authorize(&state, &headers).await?;
    let (origin, protos, quests_held) = body.into_parts();
    if !state.mapping.get_all_loaded_origins().await?.contains(&origin) {
        tracing::warn!(target: "ingress", origin = %origin, "Data from unknown origin");
        return Err(IngressFailure(StatusCode::FORBIDDEN, format!("unknown origin {origin}")));
    }
    if quests_held.is_some() {
        state.mapper.set_quests_held(&origin, quests_held).await;
    }

    let arrival_ts = current_unix();
    let count = protos.len();
    for proto in protos {
        let item = ProcessorItem {
            arrival_ts,
            payload: RawProto {
                method: proto.method,
                payload: payload_of(proto.payload),
                device_ts: normalize_device_ts(proto.device_ts, arrival_ts),
                location: proto.location.filter(Location::is_valid),
            },
            origin: origin.clone(),
            attempts: 0,
        };
        let pushed = state.queue.push(item).await;
        if !pushed.accepted {
            state.metrics.record_rejected();
            tracing::warn!(
                target: "ingress",
                origin = %origin,
                depth = pushed.depth,
                "Processor queue full, refusing data"
            );
            return Err(IngressFailure(
                StatusCode::SERVICE_UNAVAILABLE,
                "processor queue full".into(),
            ));
        }
    }
    tracing::trace!(target: "ingress", origin = %origin, count, "Queued payloads");

    let mut bundle = state.mapper.get_injection_bundle(&origin).await;
    let mut encountered: Vec<u64> = state.mapper.get_encountered(&origin).await.into_keys().collect();
    encountered.sort_unstable();
    bundle.ids_encountered = encountered;
    Ok(Json(bundle))
}

async fn control(
    State(state): State<IngressState>,
    headers: HeaderMap,
    Path(origin): Path<String>,
    Query(report): Query<DeviceReport>,
) -> Result<Json<Vec<DeviceCommand>>, IngressFailure> {
    authorize(&state, &headers).await?;
    Ok(Json(state.mailbox.drain(&origin, report)))
}

/// Binds `bind` and serves ingress until `shutdown` fires.
pub async fn spawn_ingress(
    bind: &str,
    state: IngressState,
    shutdown: CancellationToken,
) -> Result<SocketAddr, AppError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| AppError::Initialization(format!("ingress bind {bind}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| AppError::Initialization(format!("ingress addr: {e}")))?;
    tracing::info!(target: "ingress", %addr, "MITM ingress listening");
    let app = router(state);
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(target: "ingress", error = %e, "Ingress server failed");
        }
    });
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time_utils::current_unix;
    use crate::domain::types::ScanMode;
    use crate::services::device::{CommandMailbox, DeviceCommunicator};
    use crate::services::mapping::model::tests::SAMPLE;
    use crate::services::mapping::{MappingManager, MappingsFile};
    use crate::services::mitm_mapper::{InProcessMitmMapper, InjectedSettings};
    use crate::services::processor::{DataQueue, QueueItem};

    async fn serve(capacity: usize) -> (String, IngressState, CancellationToken) {
        let mapping = Arc::new(MappingManager::new(
            MappingsFile::parse(SAMPLE).expect("sample"),
            None,
        ));
        let state = IngressState {
            queue: Arc::new(DataQueue::new(capacity)),
            mapper: Arc::new(InProcessMitmMapper::new()),
            mapping,
            mailbox: Arc::new(CommandMailbox::new()),
            metrics: Arc::new(ProcessorMetrics::default()),
        };
        let shutdown = CancellationToken::new();
        let addr = spawn_ingress("127.0.0.1:0", state.clone(), shutdown.clone())
            .await
            .expect("bind");
        (format!("http://{addr}"), state, shutdown)
    }

    #[test]
    fn credentials_accept_bearer_and_basic() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer user:secret".parse().unwrap());
        assert_eq!(credentials(&headers), Some(("user".into(), "secret".into())));

        let basic = format!("Basic {}", STANDARD.encode("user:secret"));
        headers.insert(header::AUTHORIZATION, basic.parse().unwrap());
        assert_eq!(credentials(&headers), Some(("user".into(), "secret".into())));

        headers.insert(header::AUTHORIZATION, "Token abc".parse().unwrap());
        assert_eq!(credentials(&headers), None);
    }

    #[test]
    fn device_timestamps_are_normalized() {
        assert_eq!(normalize_device_ts(Some(1_700_000_000_123), 5), 1_700_000_000);
        assert_eq!(normalize_device_ts(Some(1_700_000_000), 5), 1_700_000_000);
        assert_eq!(normalize_device_ts(None, 5), 5);
        assert_eq!(normalize_device_ts(Some(0), 5), 5);
    }

    #[tokio::test]
    async fn batch_is_queued_and_bundle_returned() {
        let (base, state, shutdown) = serve(8).await;
        state
            .mapper
            .set_injection_bundle(
                "dev1",
                InjectionBundle {
                    ids_iv: vec![16],
                    injected_settings: InjectedSettings { scanmode: Some(ScanMode::Ivs) },
                    ..Default::default()
                },
            )
            .await;
        state.mapper.add_encountered("dev1", &[9], current_unix() + 60).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/mitm"))
            .bearer_auth("user:secret")
            .json(&json!({
                "origin": "dev1",
                "quests_held": [0],
                "protos": [
                    {"type": 106, "payload": {"map_cells": []}, "timestamp": 1_700_000_000_000i64},
                    {"type": 4, "payload": {"success": true}}
                ]
            }))
            .send()
            .await
            .expect("send");
        assert_eq!(resp.status(), StatusCode::OK);
        let bundle: InjectionBundle = resp.json().await.expect("bundle");
        assert_eq!(bundle.ids_iv, vec![16]);
        assert_eq!(bundle.ids_encountered, vec![9]);
        assert_eq!(bundle.injected_settings.scanmode, Some(ScanMode::Ivs));

        assert_eq!(state.queue.len().await, 2);
        assert_eq!(state.mapper.get_quests_held("dev1").await, Some(vec![0]));
        let stop = CancellationToken::new();
        match state.queue.pop(&stop).await {
            Some(QueueItem::Data(item)) => {
                assert_eq!(item.payload.method, 106);
                assert_eq!(item.payload.device_ts, 1_700_000_000);
            }
            other => panic!("expected data, got {other:?}"),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn rejects_bad_credentials_unknown_origins_and_full_queue() {
        let (base, state, shutdown) = serve(1).await;
        let client = reqwest::Client::new();
        let single = json!({"origin": "dev1", "type": 106, "payload": {}});

        let resp = client.post(format!("{base}/mitm")).json(&single).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client
            .post(format!("{base}/mitm"))
            .basic_auth("user", Some("secret"))
            .json(&json!({"origin": "ghost", "type": 106, "payload": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        for expected in [StatusCode::OK, StatusCode::SERVICE_UNAVAILABLE] {
            let resp = client
                .post(format!("{base}/mitm"))
                .basic_auth("user", Some("secret"))
                .json(&single)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), expected);
        }
        assert_eq!(state.metrics.snapshot().rejected, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn control_drains_the_mailbox() {
        let (base, state, shutdown) = serve(1).await;
        state.mailbox.start_app("dev2").await.unwrap();

        let commands: Vec<DeviceCommand> = reqwest::Client::new()
            .get(format!("{base}/control/dev2?topmost=true"))
            .bearer_auth("user:secret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(commands, vec![DeviceCommand::StartApp]);
        assert!(state.mailbox.is_app_topmost("dev2").await.unwrap());
        shutdown.cancel();
    }
}
