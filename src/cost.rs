//! Per-call pricing and session cost accounting.
//!
//! Prices are per million tokens. When a backend reports its token usage the
//! call is priced from that, otherwise from a typical single-frame verdict.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

/// Token usage of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Roughly one webcam JPEG plus the prompt in, one verdict line out.
pub const ESTIMATED_USAGE: Usage = Usage {
    input_tokens: 1_000,
    output_tokens: 50,
};

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Price {
    const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn cost(&self, usage: Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

const PRICE_TABLE: &[(ProviderKind, &str, Price)] = &[
    (ProviderKind::OpenAi, "gpt-4o-mini", Price::new(0.15, 0.60)),
    (ProviderKind::OpenAi, "gpt-4o", Price::new(2.50, 10.00)),
    (ProviderKind::OpenAi, "gpt-4.1-mini", Price::new(0.40, 1.60)),
    (ProviderKind::OpenAi, "gpt-4.1", Price::new(2.00, 8.00)),
    (ProviderKind::AzureOpenAi, "gpt-4o-mini", Price::new(0.15, 0.60)),
    (ProviderKind::AzureOpenAi, "gpt-4o", Price::new(2.50, 10.00)),
    (ProviderKind::AzureOpenAi, "gpt-4.1-mini", Price::new(0.40, 1.60)),
    (ProviderKind::AzureOpenAi, "gpt-4.1", Price::new(2.00, 8.00)),
    (ProviderKind::Anthropic, "claude-sonnet-4", Price::new(3.00, 15.00)),
    (ProviderKind::Anthropic, "claude-haiku-4-5", Price::new(1.00, 5.00)),
    (ProviderKind::Xai, "grok-2-vision", Price::new(2.00, 10.00)),
    (ProviderKind::Gemini, "gemini-2.0-flash", Price::new(0.10, 0.40)),
    (ProviderKind::Gemini, "gemini-1.5-flash", Price::new(0.075, 0.30)),
    (ProviderKind::Gemini, "gemini-1.5-pro", Price::new(1.25, 5.00)),
];

/// Price for `model`, matching the longest known model-name prefix so dated
/// snapshots (`gpt-4o-mini-2024-07-18`) price like their family. Unknown
/// models fall back to a per-provider default.
pub fn price_for(kind: ProviderKind, model: &str) -> Price {
    PRICE_TABLE
        .iter()
        .filter(|(k, name, _)| *k == kind && model.starts_with(name))
        .max_by_key(|(_, name, _)| name.len())
        .map(|(_, _, price)| *price)
        .unwrap_or_else(|| fallback_price(kind))
}

fn fallback_price(kind: ProviderKind) -> Price {
    match kind {
        ProviderKind::OpenAi | ProviderKind::AzureOpenAi => Price::new(1.00, 4.00),
        ProviderKind::Anthropic => Price::new(3.00, 15.00),
        ProviderKind::Xai => Price::new(2.00, 10.00),
        ProviderKind::Gemini => Price::new(0.50, 2.00),
        ProviderKind::Ollama => Price::new(0.0, 0.0),
    }
}

/// Cost of one analysis call. Local Ollama calls are always free.
pub fn call_cost(kind: ProviderKind, model: &str, usage: Option<Usage>) -> f64 {
    if kind == ProviderKind::Ollama {
        return 0.0;
    }
    price_for(kind, model).cost(usage.unwrap_or(ESTIMATED_USAGE))
}

/// Session and lifetime cost accumulators.
///
/// Session totals reset when a session starts; lifetime totals never do.
#[derive(Debug, Clone, Default)]
pub struct CostLedger {
    session_cost: f64,
    session_calls: u64,
    lifetime_cost: f64,
    lifetime_calls: u64,
}

/// Serializable view of the ledger for the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub session_cost: f64,
    pub session_calls: u64,
    pub lifetime_cost: f64,
    pub lifetime_calls: u64,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one completed analysis call.
    pub fn record(&mut self, cost_usd: f64) {
        let cost = if cost_usd.is_finite() { cost_usd.max(0.0) } else { 0.0 };
        self.session_cost += cost;
        self.session_calls += 1;
        self.lifetime_cost += cost;
        self.lifetime_calls += 1;
    }

    pub fn reset_session(&mut self) {
        self.session_cost = 0.0;
        self.session_calls = 0;
    }

    pub fn session_cost(&self) -> f64 {
        self.session_cost
    }

    pub fn session_calls(&self) -> u64 {
        self.session_calls
    }

    pub fn summary(&self) -> CostSummary {
        CostSummary {
            session_cost: self.session_cost,
            session_calls: self.session_calls,
            lifetime_cost: self.lifetime_cost,
            lifetime_calls: self.lifetime_calls,
        }
    }
}
