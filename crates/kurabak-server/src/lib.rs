//! HTTP query surface over the kurabak price cache.
//!
//! Reads come straight from the snapshot cache and the history store; the only write
//! path is `POST /api/update`, which runs one refresh of every class.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use kurabak::app::Engine;
use kurabak::prices::{AssetClass, AssetKey, HistoryRange, RefreshOutcome};
use kurabak::staleness::{health_report, HealthStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.coordinator().clock().now()
    }
}

/// Body shape shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
    pub meta: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn respond<T: Serialize>(
    state: &AppState,
    status: StatusCode,
    data: T,
    message: Option<String>,
    meta: Value,
) -> Response {
    let body = Envelope {
        success: status.as_u16() < 400,
        data,
        meta,
        message,
        timestamp: state.now(),
    };
    (status, Json(body)).into_response()
}

fn not_found(state: &AppState, message: String) -> Response {
    respond(state, StatusCode::NOT_FOUND, Value::Null, Some(message), json!({}))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl HistoryParams {
    fn range(&self) -> HistoryRange {
        HistoryRange {
            from: self.from,
            to: self.to,
            limit: Some(self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
        }
    }
}

fn class_prefix(class: AssetClass) -> &'static str {
    match class {
        AssetClass::Currency => "/api/currency",
        AssetClass::Gold => "/api/currency/gold",
        AssetClass::Silver => "/api/currency/silver",
    }
}

fn class_routes(router: Router<AppState>, class: AssetClass) -> Router<AppState> {
    let prefix = class_prefix(class);
    router
        .route(
            &format!("{prefix}/all"),
            get(move |State(state): State<AppState>| list_class(state, class)),
        )
        .route(
            &format!("{prefix}/history/{{code}}"),
            get(
                move |State(state): State<AppState>,
                      Path(code): Path<String>,
                      Query(params): Query<HistoryParams>| {
                    asset_history(state, class, code, params)
                },
            ),
        )
        .route(
            &format!("{prefix}/{{code}}"),
            get(move |State(state): State<AppState>, Path(code): Path<String>| {
                single_asset(state, class, code)
            }),
        )
}

/// Every route of the query surface.
pub fn router(state: AppState) -> Router {
    let router = AssetClass::ALL
        .iter()
        .fold(Router::new(), |router, &class| class_routes(router, class))
        .route("/health", get(health))
        .route("/api/update", post(update))
        .fallback(fallback);
    router.with_state(state)
}

async fn list_class(state: AppState, class: AssetClass) -> Response {
    let view = state.engine.coordinator().cache().view(class);
    if view.is_empty() {
        debug!(class = %class, "class requested before first refresh");
        return respond(
            &state,
            StatusCode::SERVICE_UNAVAILABLE,
            Vec::<Value>::new(),
            Some("data is being prepared, try again shortly".to_string()),
            json!({ "class": class, "count": 0 }),
        );
    }

    let meta = json!({
        "class": class,
        "count": view.len(),
        "generation": view.generation(),
        "last_update": view.latest_fetch(),
        "stale_since": view.stale_since(),
        "source": state.engine.coordinator().source_name(),
    });
    respond(&state, StatusCode::OK, view.snapshots(), None, meta)
}

async fn single_asset(state: AppState, class: AssetClass, code: String) -> Response {
    let key = AssetKey::new(class, &code);
    match state.engine.coordinator().cache().get(&key) {
        Some(snapshot) => {
            let meta = json!({ "class": class, "stale": snapshot.is_stale() });
            respond(&state, StatusCode::OK, snapshot, None, meta)
        }
        None => not_found(&state, format!("{key} not found")),
    }
}

async fn asset_history(
    state: AppState,
    class: AssetClass,
    code: String,
    params: HistoryParams,
) -> Response {
    let key = AssetKey::new(class, &code);
    let range = params.range();
    if let (Some(from), Some(to)) = (range.from, range.to) {
        if from > to {
            return respond(
                &state,
                StatusCode::BAD_REQUEST,
                Value::Null,
                Some("`from` must not be after `to`".to_string()),
                json!({}),
            );
        }
    }

    let points = match state.engine.coordinator().store().query(&key, &range).await {
        Ok(points) => points,
        Err(err) => {
            warn!(key = %key, error = %err, "history query failed");
            return respond(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                Value::Null,
                Some("history is unavailable".to_string()),
                json!({}),
            );
        }
    };

    let known = !points.is_empty() || state.engine.coordinator().cache().get(&key).is_some();
    if !known {
        return not_found(&state, format!("no history for {key}"));
    }

    let meta = json!({
        "key": key,
        "count": points.len(),
        "limit": range.limit,
        "from": range.from,
        "to": range.to,
    });
    respond(&state, StatusCode::OK, points, None, meta)
}

async fn health(State(state): State<AppState>) -> Response {
    let report = health_report(
        state.engine.coordinator(),
        state.engine.staleness_threshold(),
    );
    let status = match report.status {
        HealthStatus::Empty => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Stale => StatusCode::OK,
    };
    let meta = json!({ "status": report.status, "generation": report.generation });
    respond(&state, status, report, None, meta)
}

/// 200 when every class refreshed, 207 when some did, 503 when none did.
pub fn update_status(outcomes: &[RefreshOutcome]) -> StatusCode {
    let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
    if succeeded == outcomes.len() {
        StatusCode::OK
    } else if succeeded > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn update(State(state): State<AppState>) -> Response {
    let outcomes = state.engine.scheduler().trigger_all().await;
    let status = update_status(&outcomes);
    let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
    let meta = json!({
        "succeeded": succeeded,
        "failed": outcomes.len() - succeeded,
    });
    let message = match status {
        StatusCode::OK => "all classes refreshed",
        StatusCode::MULTI_STATUS => "some classes failed to refresh",
        _ => "every class failed to refresh",
    };
    respond(&state, status, outcomes, Some(message.to_string()), meta)
}

async fn fallback(State(state): State<AppState>) -> Response {
    not_found(&state, "no such endpoint".to_string())
}
