use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::hub::{BroadcastHub, SubscriberInfo};
use crate::store::{SnapshotRecord, SnapshotStore};
use crate::usage::aggregate::{self, ModelDailyAverage, RangeSummary, SortKey, TrendPoint};
use crate::usage::{parse_date, CostSummary, DailyActivity, ModelUsage, PricingTable, StatsReader, StatsSnapshot, UsageError};

use super::dto::*;

const DEFAULT_TOP_N: usize = 5;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Shared application state, built once at startup
pub struct AppState {
    pub config: Config,
    pub reader: StatsReader,
    pub pricing: PricingTable,
    pub hub: BroadcastHub,
    pub store: SnapshotStore,
}

fn check_dates(start: Option<&str>, end: Option<&str>) -> Result<(), UsageError> {
    for date in [start, end].into_iter().flatten() {
        parse_date(date)?;
    }
    Ok(())
}

fn history_limit(limit: Option<usize>) -> Result<usize, String> {
    match limit.unwrap_or(DEFAULT_HISTORY_LIMIT) {
        limit @ 1..=MAX_HISTORY_LIMIT => Ok(limit),
        _ => Err(format!("limit must be between 1 and {}", MAX_HISTORY_LIMIT)),
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthDto {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        claude_dir: state.reader.claude_dir().to_string_lossy().to_string(),
        stats_cache_present: state.reader.stats_cache_file().exists(),
    }))
}

/// Current snapshot of the stats cache
pub async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.reader.snapshot().await {
        Some(snapshot) => Json(ApiResponse::success(snapshot)),
        None => Json(ApiResponse::<StatsSnapshot>::error("Stats cache is not available")),
    }
}

pub async fn get_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(state.reader.model_usage().await))
}

pub async fn get_top_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopModelsQuery>,
) -> impl IntoResponse {
    let sort_key = match query.sort_by.as_deref().map(str::parse::<SortKey>).transpose() {
        Ok(key) => key.unwrap_or_default(),
        Err(e) => return Json(ApiResponse::<Vec<ModelUsage>>::error(e.to_string())),
    };

    let models = state.reader.model_usage().await;
    let n = query.n.unwrap_or(DEFAULT_TOP_N);
    Json(ApiResponse::success(aggregate::top_n(&models, n, sort_key)))
}

/// Per-model daily averages over the days each model was used
pub async fn get_model_daily_average(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    if let Err(e) = check_dates(query.start.as_deref(), query.end.as_deref()) {
        return Json(ApiResponse::<BTreeMap<String, ModelDailyAverage>>::error(e.to_string()));
    }
    let days = state
        .reader
        .daily_activity(query.start.as_deref(), query.end.as_deref())
        .await;
    Json(ApiResponse::success(aggregate::daily_model_average(&days)))
}

/// Daily activity, optionally with zero-filled gaps
pub async fn get_daily(State(state): State<Arc<AppState>>, Query(query): Query<DailyQuery>) -> impl IntoResponse {
    if let Err(e) = check_dates(query.start.as_deref(), query.end.as_deref()) {
        return Json(ApiResponse::<Vec<DailyActivity>>::error(e.to_string()));
    }

    let days = state
        .reader
        .daily_activity(query.start.as_deref(), query.end.as_deref())
        .await;

    if !query.fill {
        return Json(ApiResponse::success(days));
    }

    match (query.start.as_deref(), query.end.as_deref()) {
        (Some(start), Some(end)) => match aggregate::fill_missing_dates(&days, start, end) {
            Ok(filled) => Json(ApiResponse::success(filled)),
            Err(e) => Json(ApiResponse::error(e.to_string())),
        },
        _ => Json(ApiResponse::error("fill requires both start and end")),
    }
}

pub async fn get_trends(State(state): State<Arc<AppState>>, Query(query): Query<TrendQuery>) -> impl IntoResponse {
    if let Err(e) = check_dates(query.start.as_deref(), query.end.as_deref()) {
        return Json(ApiResponse::<BTreeMap<String, TrendPoint>>::error(e.to_string()));
    }

    let period = query
        .period_days
        .unwrap_or(state.config.analytics.trend_period_days);
    let days = state
        .reader
        .daily_activity(query.start.as_deref(), query.end.as_deref())
        .await;
    Json(ApiResponse::success(aggregate::trend(&days, period)))
}

pub async fn get_summary(State(state): State<Arc<AppState>>, Query(query): Query<RangeQuery>) -> impl IntoResponse {
    if let Err(e) = check_dates(query.start.as_deref(), query.end.as_deref()) {
        return Json(ApiResponse::<RangeSummary>::error(e.to_string()));
    }

    let days = state.reader.daily_activity(None, None).await;
    Json(ApiResponse::success(aggregate::range_summary(
        &days,
        query.start.as_deref(),
        query.end.as_deref(),
    )))
}

pub async fn get_cost_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models = state.reader.model_usage().await;
    Json(ApiResponse::<CostSummary>::success(state.pricing.summarize(&models)))
}

pub async fn get_daily_cost(State(state): State<Arc<AppState>>, Query(query): Query<RangeQuery>) -> impl IntoResponse {
    if let Err(e) = check_dates(query.start.as_deref(), query.end.as_deref()) {
        return Json(ApiResponse::<BTreeMap<String, f64>>::error(e.to_string()));
    }

    let days = state.reader.daily_activity(None, None).await;
    Json(ApiResponse::success(state.pricing.daily_cost(
        &days,
        query.start.as_deref(),
        query.end.as_deref(),
    )))
}

pub async fn get_cache_hit_rate(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(CacheHitRateDto {
        cache_hit_rate: state.reader.cache_hit_rate().await,
    }))
}

/// Records from the history log
pub async fn get_history(State(state): State<Arc<AppState>>, Query(query): Query<HistoryQuery>) -> impl IntoResponse {
    let limit = match history_limit(query.limit) {
        Ok(limit) => limit,
        Err(message) => return Json(ApiResponse::<Vec<serde_json::Value>>::error(message)),
    };
    match state
        .reader
        .history(query.start.as_deref(), query.end.as_deref(), Some(limit))
        .await
    {
        Ok(records) => Json(ApiResponse::success(records)),
        Err(e) => Json(ApiResponse::<Vec<serde_json::Value>>::error(e.to_string())),
    }
}

/// Stored snapshot headers, newest first
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = match history_limit(query.limit) {
        Ok(limit) => limit,
        Err(message) => return Json(ApiResponse::<Vec<SnapshotRecord>>::error(message)),
    };
    let result = state
        .store
        .run(move |store| store.history(query.start.as_deref(), query.end.as_deref(), limit))
        .await;

    match result {
        Ok(records) => Json(ApiResponse::success(records)),
        Err(e) => Json(ApiResponse::<Vec<SnapshotRecord>>::error(e.to_string())),
    }
}

/// Capture the stats cache into the store now
pub async fn create_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(snapshot) = state.reader.snapshot().await else {
        return Json(ApiResponse::<SnapshotCreatedDto>::error("Stats cache is not available"));
    };

    match state.store.run(move |store| store.save_snapshot(&snapshot)).await {
        Ok(id) => Json(ApiResponse::success(SnapshotCreatedDto { id })),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

pub async fn get_snapshot(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    let result = state
        .store
        .run(move |store| {
            let Some(snapshot) = store.snapshot(id)? else {
                return Ok(None);
            };
            Ok(Some(SnapshotDetailDto {
                snapshot,
                models: store.model_usage_for(id)?,
                daily_activities: store.daily_activities_for(id)?,
            }))
        })
        .await;

    match result {
        Ok(Some(detail)) => Json(ApiResponse::success(detail)),
        Ok(None) => Json(ApiResponse::error(format!("Snapshot {} not found", id))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// Live WebSocket subscribers
pub async fn list_connections(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.connections().await {
        Ok(connections) => Json(ApiResponse::success(connections)),
        Err(e) => Json(ApiResponse::<Vec<SubscriberInfo>>::error(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::DEFAULT_HEARTBEAT_INTERVAL;
    use crate::server::router::create_router;
    use crate::usage::reader::{HISTORY_FILE, STATS_CACHE_FILE};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const CACHE: &str = r#"{
        "dailyActivity": [
            {"date": "2026-01-01", "sessionCount": 2},
            {"date": "2026-01-03", "sessionCount": 4}
        ],
        "dailyModelTokens": [
            {"date": "2026-01-01", "tokensByModel": {"claude-sonnet-4-5-20250929": 1000}},
            {"date": "2026-01-03", "tokensByModel": {"claude-sonnet-4-5-20250929": 3000, "claude-haiku-4-5": 500}}
        ],
        "modelUsage": {
            "claude-sonnet-4-5-20250929": {"inputTokens": 1000000, "outputTokens": 500000},
            "claude-haiku-4-5": {"inputTokens": 10, "outputTokens": 10, "cacheReadInputTokens": 5000}
        }
    }"#;

    fn app(with_cache: bool) -> (TempDir, axum::Router) {
        let dir = TempDir::new().unwrap();
        if with_cache {
            std::fs::write(dir.path().join(STATS_CACHE_FILE), CACHE).unwrap();
            std::fs::write(
                dir.path().join(HISTORY_FILE),
                "{\"display\":\"a\"}\n{\"display\":\"b\"}\n",
            )
            .unwrap();
        }
        let state = AppState {
            config: Config::default(),
            reader: StatsReader::new(dir.path()),
            pricing: PricingTable::builtin(),
            hub: BroadcastHub::new(DEFAULT_HEARTBEAT_INTERVAL),
            store: SnapshotStore::open(dir.path().join("monitor.db")).unwrap(),
        };
        (dir, create_router(Arc::new(state)))
    }

    async fn call(app: &axum::Router, method: &str, uri: &str) -> Value {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app(false);
        let body = call(&app, "GET", "/api/health").await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["stats_cache_present"], false);
    }

    #[tokio::test]
    async fn test_stats_without_cache_is_error() {
        let (_dir, app) = app(false);
        let body = call(&app, "GET", "/api/stats").await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn test_stats_and_models() {
        let (_dir, app) = app(true);
        let stats = call(&app, "GET", "/api/stats").await;
        assert_eq!(stats["data"]["total_sessions"], 6);

        let models = call(&app, "GET", "/api/models").await;
        assert_eq!(models["data"][0]["model"], "claude-sonnet-4-5-20250929");

        let top = call(&app, "GET", "/api/models/top?n=1&sort_by=input_tokens").await;
        assert_eq!(top["data"].as_array().unwrap().len(), 1);

        let bad = call(&app, "GET", "/api/models/top?sort_by=cost").await;
        assert_eq!(bad["success"], false);
    }

    #[tokio::test]
    async fn test_daily_fill_and_validation() {
        let (_dir, app) = app(true);
        let filled = call(&app, "GET", "/api/daily?start=2026-01-01&end=2026-01-03&fill=true").await;
        let days = filled["data"].as_array().unwrap();
        assert_eq!(days.len(), 3);
        assert_eq!(days[1]["date"], "2026-01-02");
        assert_eq!(days[1]["total_tokens"], 0);

        let missing_bound = call(&app, "GET", "/api/daily?start=2026-01-01&fill=true").await;
        assert_eq!(missing_bound["success"], false);

        let bad_date = call(&app, "GET", "/api/daily?start=2026-13-01").await;
        assert_eq!(bad_date["success"], false);
    }

    #[tokio::test]
    async fn test_trends_summary_and_averages() {
        let (_dir, app) = app(true);
        let trends = call(&app, "GET", "/api/trends?period_days=1").await;
        assert_eq!(trends["data"]["2026-01-01"]["growth_rate"], 0.0);
        assert_eq!(trends["data"]["2026-01-03"]["growth_rate"], 250.0);

        let summary = call(&app, "GET", "/api/summary").await;
        assert_eq!(summary["data"]["total_days"], 2);
        assert_eq!(summary["data"]["total_tokens"], 4500);

        let empty = call(&app, "GET", "/api/summary?start=2030-01-01").await;
        assert_eq!(empty["data"]["total_days"], 0);

        let averages = call(&app, "GET", "/api/models/daily-average").await;
        assert_eq!(averages["data"]["claude-haiku-4-5"]["days_present"], 1);
        assert_eq!(averages["data"]["claude-sonnet-4-5-20250929"]["days_present"], 2);
    }

    #[tokio::test]
    async fn test_cost_endpoints() {
        let (_dir, app) = app(true);
        let cost = call(&app, "GET", "/api/cost").await;
        let sonnet = cost["data"]["model_costs"]["claude-sonnet-4-5-20250929"].as_f64().unwrap();
        assert!((sonnet - 10.5).abs() < 1e-9);

        let daily = call(&app, "GET", "/api/cost/daily").await;
        assert_eq!(daily["data"]["2026-01-01"], 0.0);

        let rate = call(&app, "GET", "/api/cache-hit-rate").await;
        assert!(rate["data"]["cache_hit_rate"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_history_endpoint() {
        let (_dir, app) = app(true);
        let body = call(&app, "GET", "/api/history?limit=1").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["display"], "a");
    }

    #[tokio::test]
    async fn test_history_limit_out_of_range() {
        let (_dir, app) = app(true);
        for uri in [
            "/api/history?limit=0",
            "/api/history?limit=1001",
            "/api/snapshots?limit=0",
            "/api/snapshots?limit=1001",
        ] {
            let body = call(&app, "GET", uri).await;
            assert_eq!(body["success"], false, "{}", uri);
            assert!(body["error"].as_str().unwrap().contains("between 1 and 1000"));
        }

        let body = call(&app, "GET", "/api/history?limit=1000").await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let (_dir, app) = app(true);
        let created = call(&app, "POST", "/api/snapshots").await;
        let id = created["data"]["id"].as_i64().unwrap();

        let list = call(&app, "GET", "/api/snapshots").await;
        assert_eq!(list["data"][0]["id"], id);

        let detail = call(&app, "GET", &format!("/api/snapshots/{}", id)).await;
        assert_eq!(detail["data"]["snapshot"]["total_sessions"], 6);
        assert_eq!(detail["data"]["models"].as_array().unwrap().len(), 2);
        assert_eq!(detail["data"]["daily_activities"].as_array().unwrap().len(), 2);

        let missing = call(&app, "GET", "/api/snapshots/9999").await;
        assert_eq!(missing["success"], false);
    }

    #[tokio::test]
    async fn test_connections_empty() {
        let (_dir, app) = app(false);
        let body = call(&app, "GET", "/api/connections").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 0);
    }
}
