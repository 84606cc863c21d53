// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Mapping queries over HTTP so strategies and ingress may run on other hosts
//! than the mapping manager.

use super::{MappingService, SharedMappingService};
use crate::app::config::GlobalSettings;
use crate::domain::error::AppError;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const MIN_CACHE_TTL: Duration = Duration::from_secs(60);
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(360);

struct RpcFailure(AppError);

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"ok": false, "error": self.0.to_string()})),
        )
            .into_response()
    }
}

type RpcResult<T> = Result<Json<T>, RpcFailure>;

pub fn router(service: SharedMappingService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/origins", get(origins))
        .route("/auths", get(auths))
        .route("/origins/:origin/safe_items", get(safe_items))
        .route("/origins/:origin/levelmode", get(levelmode))
        .route("/origins/:origin/quest_layer", get(quest_layer))
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn origins(State(service): State<SharedMappingService>) -> RpcResult<HashSet<String>> {
    service.get_all_loaded_origins().await.map(Json).map_err(RpcFailure)
}

async fn auths(
    State(service): State<SharedMappingService>,
) -> RpcResult<Option<HashMap<String, String>>> {
    service.get_auths().await.map(Json).map_err(RpcFailure)
}

async fn safe_items(
    State(service): State<SharedMappingService>,
    Path(origin): Path<String>,
) -> RpcResult<Vec<i32>> {
    service.get_safe_items(&origin).await.map(Json).map_err(RpcFailure)
}

async fn levelmode(
    State(service): State<SharedMappingService>,
    Path(origin): Path<String>,
) -> RpcResult<bool> {
    service.is_levelmode(&origin).await.map(Json).map_err(RpcFailure)
}

async fn quest_layer(
    State(service): State<SharedMappingService>,
    Path(origin): Path<String>,
) -> RpcResult<Option<i32>> {
    service
        .get_quest_layer_to_scan(&origin)
        .await
        .map(Json)
        .map_err(RpcFailure)
}

/// Binds `bind` and serves the mapping RPC until `shutdown` fires.
pub async fn spawn_mapping_rpc(
    bind: &str,
    service: SharedMappingService,
    shutdown: CancellationToken,
) -> Result<SocketAddr, AppError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| AppError::Initialization(format!("mapping rpc bind {bind}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| AppError::Initialization(format!("mapping rpc addr: {e}")))?;
    tracing::info!(target: "mapping", %addr, "Mapping RPC listening");
    let app = router(service);
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(target: "mapping", error = %e, "Mapping RPC server failed");
        }
    });
    Ok(addr)
}

/// Client certificate and trust anchor for mutual TLS.
#[derive(Debug, Clone, Default)]
pub struct ClientTls {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub ca_path: Option<String>,
}

impl ClientTls {
    pub fn from_settings(settings: &GlobalSettings) -> Self {
        Self {
            cert_path: settings.tls_cert_path.clone(),
            key_path: settings.tls_key_path.clone(),
            ca_path: settings.tls_ca_path.clone(),
        }
    }

    fn apply(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder, AppError> {
        let read = |path: &str| {
            std::fs::read(path).map_err(|e| AppError::Config(format!("cannot read {path}: {e}")))
        };
        if let (Some(cert), Some(key)) = (&self.cert_path, &self.key_path) {
            let mut pem = read(cert)?;
            pem.extend(read(key)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| AppError::Config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        if let Some(ca) = &self.ca_path {
            let cert = reqwest::Certificate::from_pem(&read(ca)?)
                .map_err(|e| AppError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder)
    }
}

pub struct MappingRpcClient {
    base: Url,
    http: reqwest::Client,
    ttl: Duration,
    cache: DashMap<String, (Instant, Value)>,
}

impl MappingRpcClient {
    pub fn new(base_url: &str, ttl: Duration, tls: &ClientTls) -> Result<Self, AppError> {
        let base = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid mapping_rpc_url {base_url}: {e}")))?;
        let builder = reqwest::Client::builder().timeout(Duration::from_secs(5));
        let http = tls
            .apply(builder)?
            .build()
            .map_err(|e| AppError::Initialization(format!("mapping rpc client: {e}")))?;
        Ok(Self {
            base,
            http,
            ttl: ttl.clamp(MIN_CACHE_TTL, MAX_CACHE_TTL),
            cache: DashMap::new(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("mapping_rpc_url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn cached<T: DeserializeOwned + Serialize>(&self, segments: &[&str]) -> Result<T, AppError> {
        let key = segments.join("/");
        if let Some(hit) = self.cache.get(&key)
            && hit.0.elapsed() < self.ttl
            && let Ok(value) = serde_json::from_value(hit.1.clone())
        {
            return Ok(value);
        }

        let url = self.endpoint(segments)?;
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AppError::Connection(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::Connection(format!("{url}: status {}", resp.status())));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| AppError::Decode(format!("{url}: {e}")))?;
        let typed: T = serde_json::from_value(value.clone())?;
        self.cache.insert(key, (Instant::now(), value));
        Ok(typed)
    }
}

#[async_trait]
impl MappingService for MappingRpcClient {
    async fn get_all_loaded_origins(&self) -> Result<HashSet<String>, AppError> {
        self.cached(&["origins"]).await
    }

    async fn get_safe_items(&self, origin: &str) -> Result<Vec<i32>, AppError> {
        self.cached(&["origins", origin, "safe_items"]).await
    }

    async fn get_auths(&self) -> Result<Option<HashMap<String, String>>, AppError> {
        self.cached(&["auths"]).await
    }

    async fn is_levelmode(&self, origin: &str) -> Result<bool, AppError> {
        self.cached(&["origins", origin, "levelmode"]).await
    }

    async fn get_quest_layer_to_scan(&self, origin: &str) -> Result<Option<i32>, AppError> {
        self.cached(&["origins", origin, "quest_layer"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::MappingManager;
    use super::super::model::{MappingsFile, tests::SAMPLE};
    use super::*;
    use crate::domain::types::QuestLayer;
    use std::sync::Arc;

    #[tokio::test]
    async fn client_reads_through_server_and_caches() {
        let manager = Arc::new(MappingManager::new(
            MappingsFile::parse(SAMPLE).expect("sample"),
            None,
        ));
        manager.assign("dev1", "stops");
        let shutdown = CancellationToken::new();
        let addr = spawn_mapping_rpc("127.0.0.1:0", manager.clone(), shutdown.clone())
            .await
            .expect("bind");

        let client = MappingRpcClient::new(
            &format!("http://{addr}/"),
            Duration::from_secs(1),
            &ClientTls::default(),
        )
        .expect("client");
        assert_eq!(client.ttl(), MIN_CACHE_TTL);

        let origins = client.get_all_loaded_origins().await.expect("origins");
        assert_eq!(origins.len(), 2);
        assert_eq!(client.get_safe_items("dev1").await.unwrap(), vec![1301]);
        assert!(client.is_levelmode("dev1").await.unwrap());
        assert_eq!(
            client.get_quest_layer_to_scan("dev1").await.unwrap(),
            Some(QuestLayer::NonAr.as_i32())
        );
        assert!(client.get_auths().await.unwrap().is_some());

        // Served from the cache once the assignment changes.
        manager.release("dev1");
        assert!(client.is_levelmode("dev1").await.unwrap());
        assert!(!manager.is_levelmode("dev1").await.unwrap());

        shutdown.cancel();
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = MappingRpcClient::new("not a url", MAX_CACHE_TTL, &ClientTls::default());
        assert!(matches!(err, Err(AppError::Config(_))));
    }
}
