use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;

use crate::problem::ProblemResponse;
use crate::scheduler::{Scheduler, TriggerOutcome};
use crate::service::SubscriptionService;
use crate::telemetry;

const DEFAULT_HISTORY_LIMIT: u32 = 20;
const MAX_HISTORY_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    scheduler: Scheduler,
    service: SubscriptionService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, scheduler: Scheduler, service: SubscriptionService) -> Self {
        Self {
            metrics,
            scheduler,
            service,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn service(&self) -> &SubscriptionService {
        &self.service
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/cycles", post(trigger_cycle))
        .route("/api/cycles/last", get(last_cycle))
        .route(
            "/api/users/:user_id/subscriptions",
            get(list_subscriptions).post(subscribe),
        )
        .route(
            "/api/users/:user_id/subscriptions/:domain",
            delete(unsubscribe),
        )
        .route("/api/users/:user_id/history", get(history))
        .route(
            "/api/users/:user_id/bookmarks",
            get(list_bookmarks).post(add_bookmark),
        )
        .route(
            "/api/users/:user_id/bookmarks/:domain",
            delete(remove_bookmark),
        )
        .route("/api/check", post(check_domains))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn trigger_cycle(State(state): State<AppState>) -> Result<impl IntoResponse, ProblemResponse> {
    match state.scheduler().trigger() {
        TriggerOutcome::Started => Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" })))),
        TriggerOutcome::AlreadyRunning => Err(ProblemResponse::new(
            StatusCode::CONFLICT,
            "cycle_running",
            "a monitoring cycle is already running",
        )),
    }
}

async fn last_cycle(State(state): State<AppState>) -> Result<impl IntoResponse, ProblemResponse> {
    state
        .scheduler()
        .last_report()
        .await
        .map(Json)
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "no_cycle",
                "no monitoring cycle has finished yet",
            )
        })
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let subscriptions = state.service().list(&user_id).await?;
    Ok(Json(subscriptions))
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    domain: String,
}

async fn subscribe(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<SubscribeRequest>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let outcome = state.service().subscribe(&user_id, &request.domain).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.subscription)))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path((user_id, domain)): Path<(String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    if state.service().unsubscribe(&user_id, &domain).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "subscription_not_found",
            format!("{user_id} is not subscribed to {domain}"),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

async fn history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let entries = state.service().history(&user_id, limit).await?;
    Ok(Json(entries))
}

async fn list_bookmarks(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let bookmarks = state.service().bookmarks(&user_id).await?;
    Ok(Json(bookmarks))
}

async fn add_bookmark(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<SubscribeRequest>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let outcome = state.service().bookmark(&user_id, &request.domain).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.bookmark)))
}

async fn remove_bookmark(
    State(state): State<AppState>,
    Path((user_id, domain)): Path<(String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    if state.service().unbookmark(&user_id, &domain).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "bookmark_not_found",
            format!("{user_id} has not bookmarked {domain}"),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    domains: Vec<String>,
    /// Records reachable results in this user's history when present.
    #[serde(default)]
    user_id: Option<String>,
}

async fn check_domains(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let checks = state
        .service()
        .recheck(request.user_id.as_deref(), &request.domains)
        .await?;
    Ok(Json(checks))
}
