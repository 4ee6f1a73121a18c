//! Static per-model pricing table (spec §3 `UsageRecord`, §4.7).
//!
//! Rates are CNY per 1M tokens, input and output separate, grounded on
//! `original_source/services/token_tracker.py`'s `MODEL_PRICING`.

/// Input/output rate per 1M tokens, plus the upstream provider name stored
/// on `UsageRecord::model_provider`.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub provider: &'static str,
}

const DEFAULT_PRICING: Pricing = Pricing {
    input_per_million: 0.4,
    output_per_million: 1.2,
    provider: "dashscope",
};

const TABLE: &[(&str, Pricing)] = &[
    ("qwen", Pricing { input_per_million: 0.4, output_per_million: 1.2, provider: "dashscope" }),
    ("qwen-turbo", Pricing { input_per_million: 0.3, output_per_million: 0.6, provider: "dashscope" }),
    ("qwen-plus", Pricing { input_per_million: 0.4, output_per_million: 1.2, provider: "dashscope" }),
    ("deepseek", Pricing { input_per_million: 0.4, output_per_million: 2.0, provider: "dashscope" }),
    ("ark-deepseek", Pricing { input_per_million: 0.4, output_per_million: 2.0, provider: "volcengine" }),
    ("kimi", Pricing { input_per_million: 2.0, output_per_million: 6.0, provider: "dashscope" }),
    ("ark-kimi", Pricing { input_per_million: 2.0, output_per_million: 6.0, provider: "volcengine" }),
    ("doubao", Pricing { input_per_million: 0.8, output_per_million: 2.0, provider: "volcengine" }),
    ("ark-doubao", Pricing { input_per_million: 0.8, output_per_million: 2.0, provider: "volcengine" }),
];

/// Wire model name shown on `UsageRecord::model_name`, keyed by alias —
/// grounded on the same source's `model_name_map`.
const MODEL_NAMES: &[(&str, &str)] = &[
    ("qwen", "qwen-plus-latest"),
    ("qwen-turbo", "qwen-turbo-latest"),
    ("qwen-plus", "qwen-plus-latest"),
    ("deepseek", "deepseek-v3"),
    ("ark-deepseek", "deepseek-v3-250324"),
    ("kimi", "moonshot-v1-32k"),
    ("ark-kimi", "kimi-k2-250711"),
    ("doubao", "doubao-seed-1-6-250615"),
    ("ark-doubao", "doubao-seed-1-6-250615"),
];

/// Look up pricing for a model alias, falling back to the Dashscope default
/// rate so an unrecognized alias still produces a (conservative) cost rather
/// than failing the call.
pub fn price_for(model_alias: &str) -> Pricing {
    TABLE
        .iter()
        .find(|(name, _)| *name == model_alias)
        .map(|(_, pricing)| *pricing)
        .unwrap_or(DEFAULT_PRICING)
}

pub fn model_name_for(model_alias: &str) -> String {
    MODEL_NAMES
        .iter()
        .find(|(name, _)| *name == model_alias)
        .map(|(_, wire_name)| wire_name.to_string())
        .unwrap_or_else(|| model_alias.to_string())
}

/// Cost in CNY for the given token counts, rounded to 6 decimal places to
/// match the source system's stored precision.
pub fn cost_for(model_alias: &str, input_tokens: u32, output_tokens: u32) -> (f64, f64, f64) {
    let pricing = price_for(model_alias);
    let input_cost = round6(input_tokens as f64 * pricing.input_per_million / 1_000_000.0);
    let output_cost = round6(output_tokens as f64 * pricing.output_per_million / 1_000_000.0);
    (input_cost, output_cost, round6(input_cost + output_cost))
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_alias_resolves_exact_rate() {
        let p = price_for("kimi");
        assert_eq!(p.input_per_million, 2.0);
        assert_eq!(p.output_per_million, 6.0);
    }

    #[test]
    fn unknown_alias_falls_back_to_default() {
        let p = price_for("totally-unknown-model");
        assert_eq!(p.input_per_million, DEFAULT_PRICING.input_per_million);
    }

    #[test]
    fn cost_matches_hand_computed_example() {
        let (input_cost, output_cost, total) = cost_for("qwen", 1_000_000, 500_000);
        assert_eq!(input_cost, 0.4);
        assert_eq!(output_cost, 0.6);
        assert_eq!(total, 1.0);
    }

    #[test]
    fn model_name_maps_alias_to_wire_name() {
        assert_eq!(model_name_for("ark-kimi"), "kimi-k2-250711");
        assert_eq!(model_name_for("unknown"), "unknown");
    }
}
