use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    error::EvalError,
    trace::{Span, TaskTrace, AGENT_LLM_TAG, USER_LLM_TAG},
    types::TokenUsage,
};

/// USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPrice>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(
        mut self,
        model: impl Into<String>,
        prompt_per_million: f64,
        completion_per_million: f64,
    ) -> Self {
        self.models.insert(
            model.into(),
            ModelPrice {
                prompt_per_million,
                completion_per_million,
            },
        );
        self
    }

    /// Cost in USD for one completion. Unknown models price at zero
    /// rather than failing the run.
    pub fn compute_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let Some(price) = self.models.get(model) else {
            warn!(model, "no pricing entry, counting cost as zero");
            return 0.0;
        };
        (prompt_tokens as f64 * price.prompt_per_million
            + completion_tokens as f64 * price.completion_per_million)
            / 1_000_000.0
    }
}

pub static DEFAULT_PRICING: Lazy<PricingTable> = Lazy::new(|| {
    PricingTable::new()
        .with_model("gpt-4o", 2.50, 10.00)
        .with_model("gpt-4o-mini", 0.15, 0.60)
        .with_model("gpt-4.1", 2.00, 8.00)
        .with_model("gpt-4.1-mini", 0.40, 1.60)
        .with_model("o4-mini", 1.10, 4.40)
        .with_model("claude-3-5-sonnet-latest", 3.00, 15.00)
        .with_model("claude-3-5-haiku-latest", 0.80, 4.00)
});

/// Token and dollar totals over one side of the conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl UsageSummary {
    fn absorb(&mut self, model: &str, usage: &TokenUsage, pricing: &PricingTable) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.cost += pricing.compute_cost(
            model,
            u64::from(usage.prompt_tokens),
            u64::from(usage.completion_tokens),
        );
    }
}

/// Walks the task trace and sums token usage and cost over the agent
/// and user-simulator completion spans separately. A tagged span with
/// a missing or unparseable model or usage attribute is malformed and
/// fails the aggregation.
pub fn aggregate_usage(
    trace: &TaskTrace,
    pricing: &PricingTable,
) -> Result<(UsageSummary, UsageSummary), EvalError> {
    let mut agent = UsageSummary::default();
    for span in trace.find_tagged(AGENT_LLM_TAG) {
        let (model, usage) = span_usage(&span)?;
        agent.absorb(&model, &usage, pricing);
    }

    let mut user = UsageSummary::default();
    for span in trace.find_tagged(USER_LLM_TAG) {
        let (model, usage) = span_usage(&span)?;
        user.absorb(&model, &usage, pricing);
    }

    Ok((agent, user))
}

fn span_usage(span: &Span) -> Result<(String, TokenUsage), EvalError> {
    let model = match span.attributes.get("model") {
        Some(Value::String(model)) => model.clone(),
        _ => {
            return Err(EvalError::MalformedUsage {
                span: span.name.clone(),
                message: "missing or non-string model attribute".to_string(),
            })
        }
    };

    let usage_value = span.attributes.get("usage").ok_or_else(|| {
        EvalError::MalformedUsage {
            span: span.name.clone(),
            message: "missing usage attribute".to_string(),
        }
    })?;
    let usage: TokenUsage =
        serde_json::from_value(usage_value.clone()).map_err(|e| EvalError::MalformedUsage {
            span: span.name.clone(),
            message: e.to_string(),
        })?;

    Ok((model, usage))
}
