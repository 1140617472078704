//! Process supervision surface: health/readiness/stats endpoints plus a
//! bearer-token-guarded termination control, modeled directly on the
//! admin API the sensor's ambient stack carries regardless of the rule
//! engine's own Non-goals (metrics/observability are never excluded).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{sleep, Duration},
};
use tracing::{error, info, instrument, warn};

use crate::config::ManagementConfig;
use crate::loader::RuleStore;
use crate::session::SessionRegistry;

/// Shared shutdown signal for graceful termination.
#[derive(Debug)]
pub struct ShutdownSignal {
    pub should_shutdown: Arc<AtomicBool>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            should_shutdown: Arc::clone(&self.should_shutdown),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        let signal = Self {
            should_shutdown: Arc::new(AtomicBool::new(false)),
        };

        let should_shutdown = Arc::clone(&signal.should_shutdown);
        tokio::spawn(async move {
            while !should_shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let _ = sender.send(());
        });

        (signal, receiver)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.should_shutdown.load(Ordering::Relaxed)
    }

    pub fn initiate_shutdown(&self) {
        self.should_shutdown.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct ManagementState {
    pub config: ManagementConfig,
    pub shutdown_signal: ShutdownSignal,
    pub rules: Arc<RuleStore>,
    pub sessions: Arc<SessionRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct TerminationCommand {
    pub reason: String,
    pub grace_period_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct TerminationResponse {
    pub success: bool,
    pub message: String,
    pub grace_period_seconds: u64,
}

async fn auth_middleware(
    State(state): State<ManagementState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let auth_header = request.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok());

    match auth_header {
        Some(auth) if auth.starts_with("Bearer ") => {
            let token = &auth[7..];
            if token == state.config.auth_token {
                Ok(next.run(request).await)
            } else {
                warn!("invalid management API token provided");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
        _ => {
            warn!("missing or invalid Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[instrument(skip(state))]
async fn handle_terminate(
    State(state): State<ManagementState>,
    Json(command): Json<TerminationCommand>,
) -> std::result::Result<Json<TerminationResponse>, StatusCode> {
    info!(
        reason = %command.reason,
        grace_period = command.grace_period_seconds,
        "received termination command"
    );

    let grace_period = std::cmp::min(
        command.grace_period_seconds,
        state.config.shutdown_grace_period_seconds,
    );

    state.shutdown_signal.initiate_shutdown();

    let shutdown_signal = state.shutdown_signal.clone();
    let reason = command.reason.clone();
    tokio::spawn(async move {
        perform_graceful_shutdown(shutdown_signal, reason, grace_period).await;
    });

    Ok(Json(TerminationResponse {
        success: true,
        message: format!("graceful shutdown initiated with a {grace_period} second grace period"),
        grace_period_seconds: grace_period,
    }))
}

#[instrument(skip(_shutdown_signal))]
async fn perform_graceful_shutdown(_shutdown_signal: ShutdownSignal, reason: String, grace_period_seconds: u64) {
    info!(reason = %reason, grace_period = grace_period_seconds, "starting graceful shutdown");
    sleep(Duration::from_secs(grace_period_seconds)).await;
    info!(reason = %reason, "grace period elapsed, terminating process");
    std::process::exit(0);
}

async fn handle_healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn handle_readyz(State(state): State<ManagementState>) -> StatusCode {
    if state.rules.total_rules() > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn handle_stats(State(state): State<ManagementState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "rules_total": state.rules.total_rules(),
        "rules_by_layer": state.rules.stats(),
        "sessions_active": state.sessions.active_sessions(),
    }))
}

fn create_management_router(state: ManagementState) -> Router {
    let guarded = Router::new()
        .route("/control/terminate", post(handle_terminate))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/readyz", get(handle_readyz))
        .route("/stats", get(handle_stats))
        .merge(guarded)
        .with_state(state)
}

#[instrument(skip(config, shutdown_signal, rules, sessions))]
pub async fn start_management_api(
    config: ManagementConfig,
    shutdown_signal: ShutdownSignal,
    rules: Arc<RuleStore>,
    sessions: Arc<SessionRegistry>,
) -> Result<()> {
    if !config.enabled {
        info!("management API is disabled");
        return Ok(());
    }

    let state = ManagementState {
        config: config.clone(),
        shutdown_signal,
        rules,
        sessions,
    };

    let app = create_management_router(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, "management API listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "management API server failed");
        return Err(e.into());
    }

    Ok(())
}
