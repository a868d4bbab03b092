use chrono::{Duration, Local, NaiveDate, TimeZone};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::types::*;

pub const STATS_CACHE_FILE: &str = "stats-cache.json";
pub const HISTORY_FILE: &str = "history.jsonl";

/// Per-model counters as written in `modelUsage`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawModelUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDailyActivity {
    date: String,
    #[serde(default)]
    session_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDailyModelTokens {
    date: String,
    #[serde(default)]
    tokens_by_model: Map<String, Value>,
}

/// Reads the CLI's stats cache and history log from its data directory.
///
/// The reader never writes either file. Missing or malformed input is
/// logged and reported as "no data".
#[derive(Debug, Clone)]
pub struct StatsReader {
    claude_dir: PathBuf,
    stats_cache_file: PathBuf,
    history_file: PathBuf,
}

impl StatsReader {
    pub fn new(claude_dir: impl Into<PathBuf>) -> Self {
        let claude_dir = claude_dir.into();
        Self {
            stats_cache_file: claude_dir.join(STATS_CACHE_FILE),
            history_file: claude_dir.join(HISTORY_FILE),
            claude_dir,
        }
    }

    pub fn claude_dir(&self) -> &Path {
        &self.claude_dir
    }

    pub fn stats_cache_file(&self) -> &Path {
        &self.stats_cache_file
    }

    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    /// Whether `path` refers to the stats cache file
    pub fn is_stats_cache(&self, path: &Path) -> bool {
        if path == self.stats_cache_file {
            return true;
        }
        if path.file_name() != self.stats_cache_file.file_name() {
            return false;
        }
        // Watch events may carry a resolved path while the config holds a symlinked one
        match (path.canonicalize(), self.stats_cache_file.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Read and parse the stats cache document.
    ///
    /// Returns `None` when the file is missing, unreadable or not valid JSON.
    pub async fn read_stats_cache(&self) -> Option<Value> {
        let content = match tokio::fs::read_to_string(&self.stats_cache_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.stats_cache_file.display(), "Stats cache file not found");
                return None;
            }
            Err(e) => {
                tracing::error!(path = %self.stats_cache_file.display(), error = %e, "Failed to read stats cache");
                return None;
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(doc) => {
                tracing::debug!(
                    version = doc.get("version").and_then(|v| v.as_u64()).unwrap_or(0),
                    "Read stats cache"
                );
                Some(doc)
            }
            Err(e) => {
                tracing::error!(path = %self.stats_cache_file.display(), error = %e, "Stats cache is not valid JSON");
                None
            }
        }
    }

    /// Model usage from the stats cache, in document order
    pub async fn model_usage(&self) -> Vec<ModelUsage> {
        match self.read_stats_cache().await {
            Some(doc) => parse_model_usage(&doc),
            None => Vec::new(),
        }
    }

    /// Daily activity from the stats cache within an optional inclusive date range
    pub async fn daily_activity(&self, start: Option<&str>, end: Option<&str>) -> Vec<DailyActivity> {
        match self.read_stats_cache().await {
            Some(doc) => parse_daily_activity(&doc, start, end),
            None => Vec::new(),
        }
    }

    /// Capture a snapshot from a single read of the stats cache
    pub async fn snapshot(&self) -> Option<StatsSnapshot> {
        let doc = self.read_stats_cache().await?;
        Some(snapshot_from_document(&doc))
    }

    /// Share of prompt tokens served from cache: `cache_read / (cache_read + input)`
    pub async fn cache_hit_rate(&self) -> f64 {
        cache_hit_rate(&self.model_usage().await)
    }

    /// Records from the history log, filtered by local-time date range and capped at `limit`.
    ///
    /// Records without a `timestamp` count as timestamp 0. Malformed lines are skipped.
    pub async fn history(
        &self,
        start: Option<&str>,
        end: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, UsageError> {
        let start_ms = start.map(|d| day_start_millis(d, 0)).transpose()?;
        // end date is inclusive: stop before the following midnight
        let end_ms = end.map(|d| day_start_millis(d, 1)).transpose()?;

        let file = match tokio::fs::File::open(&self.history_file).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %self.history_file.display(), error = %e, "History file not available");
                return Ok(Vec::new());
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_no = 0usize;

        while limit.map_or(true, |l| records.len() < l) {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, line = line_no + 1, "Failed to read history line");
                    break;
                }
            };
            line_no += 1;

            if line.trim().is_empty() {
                continue;
            }

            let record: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(line = line_no, error = %e, "Skipping malformed history line");
                    continue;
                }
            };

            if start_ms.is_some() || end_ms.is_some() {
                let ts = record.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0);
                if start_ms.is_some_and(|s| ts < s) || end_ms.is_some_and(|e| ts >= e) {
                    continue;
                }
            }

            records.push(record);
        }

        tracing::debug!(records = records.len(), "Parsed history log");
        Ok(records)
    }
}

/// Milliseconds since the epoch at local midnight of `date` plus `offset_days`
fn day_start_millis(date: &str, offset_days: i64) -> Result<i64, UsageError> {
    let day: NaiveDate = parse_date(date)? + Duration::days(offset_days);
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| UsageError::InvalidDate(date.to_string()))?;
    // DST gaps can skip local midnight; earliest() picks the first valid instant
    let local = Local
        .from_local_datetime(&midnight)
        .earliest()
        .ok_or_else(|| UsageError::InvalidDate(date.to_string()))?;
    Ok(local.timestamp_millis())
}

/// Parse `modelUsage`, skipping entries that fail to parse
pub fn parse_model_usage(doc: &Value) -> Vec<ModelUsage> {
    let Some(models) = doc.get("modelUsage").and_then(|v| v.as_object()) else {
        return Vec::new();
    };

    let mut results = Vec::new();
    for (name, raw) in models {
        let parsed = serde_json::from_value::<RawModelUsage>(raw.clone())
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                let usage = TokenUsage::new(
                    raw.input_tokens,
                    raw.output_tokens,
                    raw.cache_read_input_tokens,
                    raw.cache_creation_input_tokens,
                );
                ModelUsage::new(name.clone(), usage).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(model) => results.push(model),
            Err(e) => tracing::error!(model = %name, error = %e, "Failed to parse model usage"),
        }
    }
    results
}

/// Parse `dailyActivity` joined with `dailyModelTokens`.
///
/// The per-model figures only carry a total, so the token-type split of each
/// [`DailyModelTokens`] is zero and the day total is the sum of model totals.
pub fn parse_daily_activity(doc: &Value, start: Option<&str>, end: Option<&str>) -> Vec<DailyActivity> {
    let model_days: Vec<RawDailyModelTokens> = doc
        .get("dailyModelTokens")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let Some(activities) = doc.get("dailyActivity").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut results = Vec::new();
    for item in activities {
        let raw: RawDailyActivity = match serde_json::from_value(item.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "Failed to parse daily activity entry");
                continue;
            }
        };

        if start.is_some_and(|s| raw.date.as_str() < s) || end.is_some_and(|e| raw.date.as_str() > e) {
            continue;
        }

        let tokens_by_model = model_days
            .iter()
            .rev()
            .find(|d| d.date == raw.date)
            .map(|d| &d.tokens_by_model);

        let mut models = Vec::new();
        let mut total_tokens = 0u64;
        if let Some(tokens_by_model) = tokens_by_model {
            for (model, total) in tokens_by_model {
                let total = total.as_u64().unwrap_or(0);
                total_tokens += total;
                match DailyModelTokens::new(raw.date.clone(), model.clone(), TokenUsage::default(), total) {
                    Ok(entry) => models.push(entry),
                    Err(e) => tracing::warn!(date = %raw.date, model = %model, error = %e, "Skipping daily model entry"),
                }
            }
        }

        match DailyActivity::new(raw.date.clone(), raw.session_count, total_tokens, models) {
            Ok(activity) => results.push(activity),
            Err(e) => tracing::error!(date = %raw.date, error = %e, "Failed to parse daily activity"),
        }
    }
    results
}

/// Build a snapshot from an already parsed stats cache document
pub fn snapshot_from_document(doc: &Value) -> StatsSnapshot {
    StatsSnapshot::new(parse_model_usage(doc), parse_daily_activity(doc, None, None))
}

pub fn cache_hit_rate(models: &[ModelUsage]) -> f64 {
    let cache_read: u64 = models.iter().map(|m| m.usage.cache_read_tokens).sum();
    let input: u64 = models.iter().map(|m| m.usage.input_tokens).sum();
    let requested = cache_read + input;
    if requested == 0 {
        return 0.0;
    }
    cache_read as f64 / requested as f64
}
