use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

const TOKENS_PER_MTOK: f64 = 1_000_000.0;

/// USD price per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPrice {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / TOKENS_PER_MTOK
    }
}

/// Price used for models the table knows nothing about.
const DEFAULT_PRICE: ModelPrice = ModelPrice::new(3.0, 15.0);

const BUILTIN_PRICES: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", ModelPrice::new(15.0, 75.0)),
    ("claude-sonnet-4", ModelPrice::new(3.0, 15.0)),
    ("claude-3-7-sonnet", ModelPrice::new(3.0, 15.0)),
    ("claude-3-5-sonnet", ModelPrice::new(3.0, 15.0)),
    ("claude-haiku-4-5", ModelPrice::new(1.0, 5.0)),
    ("claude-3-5-haiku", ModelPrice::new(0.8, 4.0)),
    ("gpt-4o", ModelPrice::new(2.5, 10.0)),
    ("gpt-4o-mini", ModelPrice::new(0.15, 0.6)),
    ("gpt-4.1", ModelPrice::new(2.0, 8.0)),
    ("gpt-4.1-mini", ModelPrice::new(0.4, 1.6)),
    ("stub", ModelPrice::new(0.0, 0.0)),
];

/// Maps model names to prices.
///
/// Lookup tries an exact match, then the longest known prefix (so dated
/// snapshots like `claude-sonnet-4-5-20250929` resolve), then the default.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
    default: ModelPrice,
}

impl PriceTable {
    pub fn builtin() -> Self {
        Self {
            prices: BUILTIN_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
            default: DEFAULT_PRICE,
        }
    }

    /// Add or replace prices, e.g. from the `[pricing.models]` config table.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ModelPrice>) -> Self {
        for (model, price) in overrides {
            self.prices.insert(model.clone(), *price);
        }
        self
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        if let Some(price) = self.prices.get(model) {
            return *price;
        }
        let by_prefix = self
            .prices
            .iter()
            .filter(|(known, _)| model.starts_with(known.as_str()))
            .max_by_key(|(known, _)| known.len());
        match by_prefix {
            Some((_, price)) => *price,
            None => {
                tracing::warn!(model, "No price known for model; using default rates");
                self.default
            }
        }
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.price_for(model).cost(usage)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::builtin()
    }
}
