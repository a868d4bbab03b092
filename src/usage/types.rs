use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq)]
pub enum UsageError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("model name must not be empty")]
    EmptyModelName,
    #[error("{field} price must not be negative: {value}")]
    NegativePrice { field: &'static str, value: f64 },
    #[error("unknown sort key '{0}', expected total_tokens, input_tokens or output_tokens")]
    UnknownSortKey(String),
}

/// Parse a zero-padded `YYYY-MM-DD` string into a real calendar date.
pub fn parse_date(date: &str) -> Result<NaiveDate, UsageError> {
    // chrono accepts "2026-1-5"; the lexical ordering used for range filters needs zero padding
    if date.len() != 10 {
        return Err(UsageError::InvalidDate(date.to_string()));
    }
    NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| UsageError::InvalidDate(date.to_string()))
}

/// Token counts for the four tracked token types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, cache_read: u64, cache_creation: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: cache_read,
            cache_creation_tokens: cache_creation,
        }
    }

    /// Input plus output tokens
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// All four token types
    pub fn total_with_cache(&self) -> u64 {
        self.total_tokens() + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_with_cache() == 0
    }

    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_read_tokens: self.cache_read_tokens + other.cache_read_tokens,
            cache_creation_tokens: self.cache_creation_tokens + other.cache_creation_tokens,
        }
    }
}

/// Token usage attributed to one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    #[serde(flatten)]
    pub usage: TokenUsage,
    pub total_tokens: u64,
    pub total_with_cache: u64,
}

impl ModelUsage {
    pub fn new(model: impl Into<String>, usage: TokenUsage) -> Result<Self, UsageError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(UsageError::EmptyModelName);
        }
        Ok(Self {
            model,
            total_tokens: usage.total_tokens(),
            total_with_cache: usage.total_with_cache(),
            usage,
        })
    }
}

/// Token usage of one model on one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyModelTokens {
    pub date: String,
    pub model: String,
    #[serde(flatten)]
    pub usage: TokenUsage,
    /// Total reported by the source; the split fields may be unknown (zero)
    pub total_tokens: u64,
}

impl DailyModelTokens {
    pub fn new(
        date: impl Into<String>,
        model: impl Into<String>,
        usage: TokenUsage,
        total_tokens: u64,
    ) -> Result<Self, UsageError> {
        let date = date.into();
        parse_date(&date)?;
        let model = model.into();
        if model.trim().is_empty() {
            return Err(UsageError::EmptyModelName);
        }
        Ok(Self {
            date,
            model,
            usage,
            total_tokens,
        })
    }
}

/// Activity for a single calendar day
#[derive(Debug, Clone, Serialize)]
pub struct DailyActivity {
    pub date: String,
    pub session_count: u64,
    pub total_tokens: u64,
    pub models: Vec<DailyModelTokens>,
}

impl DailyActivity {
    pub fn new(
        date: impl Into<String>,
        session_count: u64,
        total_tokens: u64,
        models: Vec<DailyModelTokens>,
    ) -> Result<Self, UsageError> {
        let date = date.into();
        parse_date(&date)?;
        Ok(Self {
            date,
            session_count,
            total_tokens,
            models,
        })
    }

    /// Zero-valued day with no models
    pub fn empty(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            session_count: 0,
            total_tokens: 0,
            models: Vec::new(),
        }
    }
}

// Model order is display order only
impl PartialEq for DailyActivity {
    fn eq(&self, other: &Self) -> bool {
        if self.date != other.date
            || self.session_count != other.session_count
            || self.total_tokens != other.total_tokens
            || self.models.len() != other.models.len()
        {
            return false;
        }
        self.models.iter().all(|m| other.models.contains(m))
    }
}

/// Point-in-time capture of the stats cache
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Local>,
    pub total_sessions: u64,
    pub total_tokens: u64,
    pub models: Vec<ModelUsage>,
    pub daily_activities: Vec<DailyActivity>,
}

impl StatsSnapshot {
    pub fn new(models: Vec<ModelUsage>, daily_activities: Vec<DailyActivity>) -> Self {
        let total_sessions = daily_activities.iter().map(|a| a.session_count).sum();
        let total_tokens = models.iter().map(|m| m.usage.total_with_cache()).sum();
        Self {
            timestamp: Local::now(),
            total_sessions,
            total_tokens,
            models,
            daily_activities,
        }
    }
}
