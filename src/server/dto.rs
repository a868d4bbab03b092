use serde::{Deserialize, Serialize};

use crate::store::SnapshotRecord;
use crate::usage::{DailyActivity, ModelUsage};

/// Generic API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Optional inclusive `YYYY-MM-DD` bounds
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DailyQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Insert zero-valued days for gaps; needs both bounds
    #[serde(default)]
    pub fill: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TrendQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub period_days: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopModelsQuery {
    pub n: Option<usize>,
    pub sort_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub client_id: Option<String>,
}

#[derive(Serialize)]
pub struct HealthDto {
    pub status: &'static str,
    pub version: &'static str,
    pub claude_dir: String,
    pub stats_cache_present: bool,
}

#[derive(Serialize)]
pub struct CacheHitRateDto {
    pub cache_hit_rate: f64,
}

#[derive(Serialize)]
pub struct SnapshotCreatedDto {
    pub id: i64,
}

/// Snapshot header together with its child rows
#[derive(Serialize)]
pub struct SnapshotDetailDto {
    pub snapshot: SnapshotRecord,
    pub models: Vec<ModelUsage>,
    pub daily_activities: Vec<DailyActivity>,
}
