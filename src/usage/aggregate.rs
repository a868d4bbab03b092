use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use super::pricing::round_to;
use super::types::{parse_date, DailyActivity, DailyModelTokens, ModelUsage, UsageError, DATE_FORMAT};

/// Trend figures for one day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub total_tokens: u64,
    pub prev_period_avg: f64,
    pub growth_rate: f64,
    pub session_count: u64,
}

/// Summary over a date range
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RangeSummary {
    pub total_days: usize,
    pub total_sessions: u64,
    pub total_tokens: u64,
    pub avg_daily_sessions: f64,
    pub avg_daily_tokens: f64,
    pub max_daily_tokens: u64,
    pub min_daily_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

/// Average per-day usage of one model, over the days it was used
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDailyAverage {
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub avg_cache_read_tokens: f64,
    pub avg_cache_creation_tokens: f64,
    pub days_present: usize,
}

/// Ranking key for [`top_n`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// All four token types
    #[default]
    TotalTokens,
    InputTokens,
    OutputTokens,
}

impl SortKey {
    fn value(&self, model: &ModelUsage) -> u64 {
        match self {
            SortKey::TotalTokens => model.usage.total_with_cache(),
            SortKey::InputTokens => model.usage.input_tokens,
            SortKey::OutputTokens => model.usage.output_tokens,
        }
    }
}

impl FromStr for SortKey {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total_tokens" => Ok(SortKey::TotalTokens),
            "input_tokens" => Ok(SortKey::InputTokens),
            "output_tokens" => Ok(SortKey::OutputTokens),
            other => Err(UsageError::UnknownSortKey(other.to_string())),
        }
    }
}

/// Keep activities whose date lies within `[start, end]`; a missing bound is open.
///
/// Dates are zero-padded `YYYY-MM-DD`, so string order is chronological order.
pub fn filter_by_range(
    activities: &[DailyActivity],
    start: Option<&str>,
    end: Option<&str>,
) -> Vec<DailyActivity> {
    let filtered: Vec<DailyActivity> = activities
        .iter()
        .filter(|a| start.map_or(true, |s| a.date.as_str() >= s))
        .filter(|a| end.map_or(true, |e| a.date.as_str() <= e))
        .cloned()
        .collect();

    tracing::debug!(
        start = start.unwrap_or("-"),
        end = end.unwrap_or("-"),
        kept = filtered.len(),
        "Filtered daily activity by date range"
    );
    filtered
}

/// One entry per calendar date in `[start, end]`, ascending.
///
/// Dates without source data get an empty day; existing entries are reused as-is.
pub fn fill_missing_dates(
    activities: &[DailyActivity],
    start: &str,
    end: &str,
) -> Result<Vec<DailyActivity>, UsageError> {
    let start_date = parse_date(start)?;
    let end_date = parse_date(end)?;

    let by_date: HashMap<&str, &DailyActivity> =
        activities.iter().map(|a| (a.date.as_str(), a)).collect();

    let mut filled = Vec::new();
    let mut current = start_date;
    while current <= end_date {
        let date = current.format(DATE_FORMAT).to_string();
        match by_date.get(date.as_str()) {
            Some(activity) => filled.push((*activity).clone()),
            None => filled.push(DailyActivity::empty(date)),
        }
        current = match current.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    tracing::debug!(
        start,
        end,
        source = activities.len(),
        filled = filled.len(),
        "Filled missing dates"
    );
    Ok(filled)
}

/// Compare each day against the mean of the `period_days` days before it.
pub fn trend(activities: &[DailyActivity], period_days: usize) -> BTreeMap<String, TrendPoint> {
    let mut sorted: Vec<&DailyActivity> = activities.iter().collect();
    sorted.sort_by(|a, b| a.date.cmp(&b.date));

    let mut trends = BTreeMap::new();
    for (i, activity) in sorted.iter().enumerate() {
        let window = &sorted[i.saturating_sub(period_days)..i];

        let prev_period_avg = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|a| a.total_tokens as f64).sum::<f64>() / window.len() as f64
        };

        let growth_rate = pct_change(prev_period_avg, activity.total_tokens as f64);

        trends.insert(
            activity.date.clone(),
            TrendPoint {
                total_tokens: activity.total_tokens,
                prev_period_avg: round_to(prev_period_avg, 2),
                growth_rate: round_to(growth_rate, 2),
                session_count: activity.session_count,
            },
        );
    }

    tracing::debug!(days = trends.len(), period_days, "Computed usage trend");
    trends
}

/// Percentage change from `previous` to `current`; 0.0 when there is no baseline.
fn pct_change(previous: f64, current: f64) -> f64 {
    if previous.abs() < f64::EPSILON {
        0.0
    } else {
        ((current - previous) / previous) * 100.0
    }
}

/// Highest `n` models by `sort_key`; ties keep their original order.
pub fn top_n(models: &[ModelUsage], n: usize, sort_key: SortKey) -> Vec<ModelUsage> {
    let mut ranked: Vec<&ModelUsage> = models.iter().collect();
    // sort_by is stable, so equal keys keep source order
    ranked.sort_by(|a, b| sort_key.value(b).cmp(&sort_key.value(a)));
    ranked.into_iter().take(n).cloned().collect()
}

/// Totals, averages and extremes over the activities in `[start, end]`.
pub fn range_summary(
    activities: &[DailyActivity],
    start: Option<&str>,
    end: Option<&str>,
) -> RangeSummary {
    let filtered = filter_by_range(activities, start, end);
    if filtered.is_empty() {
        return RangeSummary::default();
    }

    let total_days = filtered.len();
    let total_sessions: u64 = filtered.iter().map(|a| a.session_count).sum();
    let total_tokens: u64 = filtered.iter().map(|a| a.total_tokens).sum();
    let max_daily_tokens = filtered.iter().map(|a| a.total_tokens).max().unwrap_or(0);
    let min_daily_tokens = filtered.iter().map(|a| a.total_tokens).min().unwrap_or(0);

    let first_date = filtered.iter().map(|a| a.date.as_str()).min().unwrap_or_default();
    let last_date = filtered.iter().map(|a| a.date.as_str()).max().unwrap_or_default();

    RangeSummary {
        total_days,
        total_sessions,
        total_tokens,
        avg_daily_sessions: round_to(total_sessions as f64 / total_days as f64, 2),
        avg_daily_tokens: round_to(total_tokens as f64 / total_days as f64, 2),
        max_daily_tokens,
        min_daily_tokens,
        start_date: Some(start.unwrap_or(first_date).to_string()),
        end_date: Some(end.unwrap_or(last_date).to_string()),
    }
}

/// Daily model entries grouped by model name
pub fn group_by_model(activities: &[DailyActivity]) -> BTreeMap<String, Vec<DailyModelTokens>> {
    let mut grouped: BTreeMap<String, Vec<DailyModelTokens>> = BTreeMap::new();
    for activity in activities {
        for model in &activity.models {
            grouped.entry(model.model.clone()).or_default().push(model.clone());
        }
    }
    grouped
}

/// Per-model averages, divided by the number of days each model appears.
pub fn daily_model_average(activities: &[DailyActivity]) -> BTreeMap<String, ModelDailyAverage> {
    group_by_model(activities)
        .into_iter()
        .filter(|(_, days)| !days.is_empty())
        .map(|(model, days)| {
            let n = days.len() as f64;
            let sum = |f: fn(&DailyModelTokens) -> u64| days.iter().map(f).sum::<u64>() as f64;
            let average = ModelDailyAverage {
                avg_input_tokens: round_to(sum(|d| d.usage.input_tokens) / n, 2),
                avg_output_tokens: round_to(sum(|d| d.usage.output_tokens) / n, 2),
                avg_cache_read_tokens: round_to(sum(|d| d.usage.cache_read_tokens) / n, 2),
                avg_cache_creation_tokens: round_to(sum(|d| d.usage.cache_creation_tokens) / n, 2),
                days_present: days.len(),
            };
            (model, average)
        })
        .collect()
}

/// Collapse duplicate model entries by summing their usage, keeping first-seen order.
pub fn merge_models(models: &[ModelUsage]) -> Vec<ModelUsage> {
    let mut merged: Vec<ModelUsage> = Vec::new();
    for model in models {
        match merged.iter_mut().find(|m| m.model == model.model) {
            Some(existing) => {
                let usage = existing.usage.add(&model.usage);
                existing.usage = usage;
                existing.total_tokens = usage.total_tokens();
                existing.total_with_cache = usage.total_with_cache();
            }
            None => merged.push(model.clone()),
        }
    }
    merged
}
