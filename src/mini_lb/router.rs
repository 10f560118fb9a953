use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::bootstrap::{inject_bootstrap, InjectionMode};
use super::broadcast::{AdminCommand, Broadcaster, BroadcastOutcome};
use super::dispatch::{DualDispatcher, PrefillLeaseStats};
use super::error::{Leg, MiniLbError, Result};
use super::selector::PairSelector;
use super::types::{BackendRegistry, MiniLbConfig, ServerPair};

/// Mini Load Balancer for Prefill-Decode Disaggregation
///
/// Pairs every generation request with one prefill server (round-robin) and one
/// decode server (random), tags it with the prefill server's bootstrap address,
/// and sends it to both. Admin commands are broadcast to every server.
pub struct MiniLoadBalancer {
    config: MiniLbConfig,
    client: Client,
    registry: Arc<BackendRegistry>,
    selector: PairSelector,
    dispatcher: DualDispatcher,
    broadcaster: Broadcaster,
}

impl MiniLoadBalancer {
    pub fn new(config: MiniLbConfig) -> Result<Self> {
        let registry = Arc::new(config.registry()?);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MiniLbError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            selector: PairSelector::new(Arc::clone(&registry)),
            dispatcher: DualDispatcher::new(client.clone()),
            broadcaster: Broadcaster::new(client.clone(), Arc::clone(&registry)),
            registry,
            client,
            config,
        })
    }

    pub fn select_pair(&self) -> Result<ServerPair> {
        self.selector.select_pair()
    }

    pub fn lease_stats(&self) -> &Arc<PrefillLeaseStats> {
        self.dispatcher.lease_stats()
    }

    /// Select a pair, inject bootstrap fields and dispatch to `route` on both servers.
    pub async fn route_request(
        &self,
        mut request: Value,
        route: &str,
        mode: InjectionMode,
    ) -> Result<Response> {
        let server_pair = self.selector.select_pair()?;
        inject_bootstrap(&mut request, &server_pair, mode)?;

        let is_stream = request
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.dispatcher
            .dispatch(request, &server_pair, route, is_stream)
            .await
    }

    pub async fn run_admin(&self, command: AdminCommand) -> BroadcastOutcome {
        self.broadcaster.run(command).await
    }

    /// Proxy `/v1/models` from the first prefill server.
    pub async fn get_models(&self) -> Result<Value> {
        let prefill = self.registry.prefill().first().ok_or_else(|| {
            MiniLbError::Configuration("no prefill server configured".to_string())
        })?;
        let url = format!("{}/v1/models", prefill.url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MiniLbError::unavailable(Leg::Prefill, e))?;

        if resp.status() != StatusCode::OK {
            return Err(MiniLbError::BackendStatus {
                status: resp.status(),
                message: format!("Prefill server error: Status {}", resp.status().as_u16()),
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| MiniLbError::unavailable(Leg::Prefill, e))
    }

    /// Create the Axum router with all endpoints
    pub fn create_router(self) -> Router {
        let shared_state = Arc::new(self);

        Router::new()
            .route("/health", get(health_check))
            .route("/health_generate", get(health_generate))
            .route("/flush_cache", post(flush_cache))
            .route("/get_server_info", get(get_server_info))
            .route("/get_model_info", get(get_model_info))
            .route("/generate", post(handle_generate))
            .route("/v1/chat/completions", post(handle_chat_completions))
            .route("/v1/completions", post(handle_completions))
            .route("/v1/models", get(get_models))
            .route("/start_profile", post(start_profile))
            .route("/stop_profile", post(stop_profile))
            .route(
                "/start_expert_distribution_record",
                post(start_expert_distribution_record),
            )
            .route(
                "/stop_expert_distribution_record",
                post(stop_expert_distribution_record),
            )
            .route(
                "/dump_expert_distribution_record",
                post(dump_expert_distribution_record),
            )
            .route("/eplb_rebalance", post(eplb_rebalance))
            .route(
                "/eplb_save_expert_distribution",
                post(eplb_save_expert_distribution),
            )
            .with_state(shared_state)
    }

    /// Start the load balancer server
    pub async fn start(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Starting Mini Load Balancer on {}", addr);
        info!(
            "Prefill servers: {:?}",
            self.registry.prefill().iter().map(|p| &p.url).collect::<Vec<_>>()
        );
        info!("Decode servers: {:?}", self.registry.decode());

        warn!("MiniLB is only for debugging purposes, it uses round-robin prefill and random decode selection!");

        let app = self.create_router();
        let listener = TcpListener::bind(&addr).await?;

        info!("Mini Load Balancer listening on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ===== HTTP Endpoint Handlers =====

type SharedLb = State<Arc<MiniLoadBalancer>>;

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn health_generate(State(lb): SharedLb) -> Response {
    match lb.broadcaster.health_generate_all().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(e.to_json())).into_response()
        }
    }
}

async fn flush_cache(State(lb): SharedLb) -> impl IntoResponse {
    lb.broadcaster.flush_cache_all().await;
    StatusCode::OK
}

async fn get_server_info(State(lb): SharedLb) -> Result<Json<Value>> {
    lb.broadcaster.server_info_all().await.map(Json)
}

async fn get_model_info() -> Json<Value> {
    Json(json!({
        "model_path": "/path/to/dummy/model",
        "tokenizer_path": "/path/to/dummy/tokenizer",
        "is_generation": true,
        "preferred_sampling_params": {"temperature": 0.7, "max_new_tokens": 128},
    }))
}

async fn get_models(State(lb): SharedLb) -> Result<Json<Value>> {
    lb.get_models().await.map(Json)
}

async fn handle_generate(State(lb): SharedLb, Json(request): Json<Value>) -> Response {
    lb.route_request(request, "generate", InjectionMode::Batched)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_chat_completions(State(lb): SharedLb, Json(request): Json<Value>) -> Response {
    lb.route_request(request, "v1/chat/completions", InjectionMode::Single)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn handle_completions(State(lb): SharedLb, Json(request): Json<Value>) -> Response {
    lb.route_request(request, "v1/completions", InjectionMode::Single)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn start_profile(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::StartProfile).await)
}

async fn stop_profile(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::StopProfile).await)
}

async fn start_expert_distribution_record(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::StartExpertDistributionRecord).await)
}

async fn stop_expert_distribution_record(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::StopExpertDistributionRecord).await)
}

async fn dump_expert_distribution_record(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::DumpExpertDistributionRecord).await)
}

async fn eplb_rebalance(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::EplbRebalance).await)
}

async fn eplb_save_expert_distribution(State(lb): SharedLb) -> Json<BroadcastOutcome> {
    Json(lb.run_admin(AdminCommand::EplbSaveExpertDistribution).await)
}
