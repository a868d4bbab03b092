use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::types::{DailyActivity, ModelUsage, TokenUsage, UsageError};

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Model families whose legacy `3-5` / `3.5` identifiers map to the current generation
const LEGACY_FAMILIES: &[&str] = &["opus", "sonnet", "haiku"];

/// Per-model unit prices in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelPricing {
    pub fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Result<Self, UsageError> {
        for (field, value) in [
            ("input", input),
            ("output", output),
            ("cache_read", cache_read),
            ("cache_write", cache_write),
        ] {
            if value < 0.0 || value.is_nan() {
                return Err(UsageError::NegativePrice { field, value });
            }
        }
        Ok(Self {
            input,
            output,
            cache_read,
            cache_write,
        })
    }

    const fn fixed(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
        }
    }

    /// USD cost of `usage` at these prices
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 / TOKENS_PER_MILLION * self.input
            + usage.output_tokens as f64 / TOKENS_PER_MILLION * self.output
            + usage.cache_read_tokens as f64 / TOKENS_PER_MILLION * self.cache_read
            + usage.cache_creation_tokens as f64 / TOKENS_PER_MILLION * self.cache_write
    }
}

const OPUS: ModelPricing = ModelPricing::fixed(15.0, 75.0, 1.5, 18.75);
const SONNET: ModelPricing = ModelPricing::fixed(3.0, 15.0, 0.3, 3.75);
const HAIKU: ModelPricing = ModelPricing::fixed(0.8, 4.0, 0.08, 1.0);

/// Built-in price list, keys already in normalized form.
const BUILTIN_PRICING: &[(&str, ModelPricing)] = &[
    ("claude-opus-4-5", OPUS),
    ("claude-opus-4-5-20251101", OPUS),
    ("claude-opus-4-5-thinking", OPUS),
    ("claude-opus-4-1", OPUS),
    ("claude-opus-4", OPUS),
    ("claude-sonnet-4-5", SONNET),
    ("claude-sonnet-4-5-20250929", SONNET),
    ("claude-sonnet-4", SONNET),
    ("claude-haiku-4-5", HAIKU),
    ("claude-haiku-4-5-20251001", HAIKU),
];

/// Normalize a model name for matching against the price table.
///
/// Lower-cases, collapses whitespace and underscores into single hyphens,
/// maps legacy `3-5`/`3.5` family names to the current generation and turns
/// dotted minor versions (`4.5`) into hyphen form (`4-5`).
pub fn normalize_model_name(model_name: &str) -> String {
    let lowered = model_name.trim().to_lowercase();
    let normalized = lowered
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if normalized.contains("3-5") || normalized.contains("3.5") {
        if let Some(family) = LEGACY_FAMILIES.iter().find(|f| normalized.contains(*f)) {
            return format!("claude-{}-4-5", family);
        }
    }

    normalized.replace('.', "-")
}

/// Static mapping from normalized model identifier to unit prices.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: Vec<(String, ModelPricing)>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PricingTable {
    pub fn builtin() -> Self {
        Self {
            models: BUILTIN_PRICING
                .iter()
                .map(|(key, pricing)| (key.to_string(), *pricing))
                .collect(),
        }
    }

    /// Built-in table with user supplied prices layered on top.
    ///
    /// Override keys are normalized; an existing key is replaced in place.
    pub fn with_overrides(overrides: &HashMap<String, ModelPricing>) -> Result<Self, UsageError> {
        let mut table = Self::builtin();
        for (name, pricing) in overrides {
            // Re-validate: overrides arrive through serde, bypassing ModelPricing::new
            let pricing = ModelPricing::new(
                pricing.input,
                pricing.output,
                pricing.cache_read,
                pricing.cache_write,
            )?;
            let key = normalize_model_name(name);
            match table.models.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = pricing,
                None => table.models.push((key, pricing)),
            }
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Look up a normalized key: exact match, then substring containment either way.
    pub fn lookup(&self, key: &str) -> Option<&ModelPricing> {
        if key.is_empty() {
            return None;
        }

        if let Some((_, pricing)) = self.models.iter().find(|(k, _)| k == key) {
            return Some(pricing);
        }

        // Longest key wins so "claude-opus-4-5-x" prefers "claude-opus-4-5" over "claude-opus-4"
        let matched = self
            .models
            .iter()
            .filter(|(k, _)| k.contains(key) || key.contains(k.as_str()))
            .max_by_key(|(k, _)| k.len());

        match matched {
            Some((k, pricing)) => {
                tracing::debug!(key, matched = %k, "Fuzzy matched model pricing");
                Some(pricing)
            }
            None => None,
        }
    }

    /// Normalize then look up a raw model name
    pub fn get_model_pricing(&self, model_name: &str) -> Option<&ModelPricing> {
        let pricing = self.lookup(&normalize_model_name(model_name));
        if pricing.is_none() {
            tracing::warn!(model = model_name, "No pricing found for model");
        }
        pricing
    }

    /// USD cost of `usage` for `model_name`; 0.0 for unknown models or empty usage.
    pub fn cost(&self, usage: &TokenUsage, model_name: &str) -> f64 {
        if usage.is_empty() {
            return 0.0;
        }
        match self.get_model_pricing(model_name) {
            Some(pricing) => pricing.cost(usage),
            None => 0.0,
        }
    }

    /// Cost per model, keyed by model name
    pub fn model_costs(&self, models: &[ModelUsage]) -> BTreeMap<String, f64> {
        let mut costs = BTreeMap::new();
        for model in models {
            *costs.entry(model.model.clone()).or_insert(0.0) += self.cost(&model.usage, &model.model);
        }
        costs
    }

    /// Cost summary over a set of model usages
    pub fn summarize(&self, models: &[ModelUsage]) -> CostSummary {
        let costs = self.model_costs(models);
        let total_cost: f64 = costs.values().sum();
        let total_tokens: u64 = models.iter().map(|m| m.usage.total_with_cache()).sum();

        let avg_cost_per_million = if total_tokens > 0 {
            total_cost / total_tokens as f64 * TOKENS_PER_MILLION
        } else {
            0.0
        };

        let model_percentages = costs
            .iter()
            .map(|(model, cost)| {
                let pct = if total_cost > 0.0 {
                    round_to(cost / total_cost * 100.0, 2)
                } else {
                    0.0
                };
                (model.clone(), pct)
            })
            .collect();

        let summary = CostSummary {
            total_cost_usd: round_to(total_cost, 6),
            total_tokens,
            avg_cost_per_million_tokens: round_to(avg_cost_per_million, 6),
            model_costs: costs
                .into_iter()
                .map(|(model, cost)| (model, round_to(cost, 6)))
                .collect(),
            model_percentages,
        };

        tracing::debug!(
            total_cost_usd = summary.total_cost_usd,
            models = summary.model_costs.len(),
            "Computed cost summary"
        );
        summary
    }

    /// Cost per day within an optional inclusive date range.
    ///
    /// Daily model entries only carry split fields when the source provides
    /// them; days whose split is unknown cost 0.0.
    pub fn daily_cost(
        &self,
        activities: &[DailyActivity],
        start: Option<&str>,
        end: Option<&str>,
    ) -> BTreeMap<String, f64> {
        super::aggregate::filter_by_range(activities, start, end)
            .iter()
            .map(|activity| {
                let cost = activity
                    .models
                    .iter()
                    .map(|m| self.cost(&m.usage, &m.model))
                    .sum();
                (activity.date.clone(), cost)
            })
            .collect()
    }
}

/// Aggregate cost view over several models
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub avg_cost_per_million_tokens: f64,
    pub model_costs: BTreeMap<String, f64>,
    pub model_percentages: BTreeMap<String, f64>,
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
