use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use relay_protocol::openai::create_chat_completions::types::Usage;

/// Rate applied to models with no entry in the table.
pub const DEFAULT_MODEL_RATE: f64 = 30.0;
/// Quota units per call at a per-call rate of 1.0.
const QUOTA_PER_CALL: f64 = 1000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    /// Billed per prompt and completion token.
    #[default]
    Tokens,
    /// Billed per call regardless of token usage.
    Times,
}

/// Multipliers used once the prompt reaches `threshold` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LongContextTier {
    pub threshold: u64,
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    #[serde(default)]
    pub kind: PriceKind,
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_context: Option<LongContextTier>,
}

impl ModelRate {
    pub fn tokens(input: f64, output: f64) -> Self {
        Self {
            kind: PriceKind::Tokens,
            input,
            output,
            long_context: None,
        }
    }

    pub fn times(input: f64) -> Self {
        Self {
            kind: PriceKind::Times,
            input,
            output: 0.0,
            long_context: None,
        }
    }

    pub fn with_long_context(mut self, tier: LongContextTier) -> Self {
        self.long_context = Some(tier);
        self
    }

    /// The tier in effect for a prompt of `prompt_tokens`, if any.
    pub fn tier_for(&self, prompt_tokens: u64) -> Option<&LongContextTier> {
        self.long_context
            .as_ref()
            .filter(|tier| prompt_tokens >= tier.threshold)
    }

    /// `(input, output)` multipliers for a prompt of `prompt_tokens`. Negative
    /// rates count as zero; per-call pricing has no output rate.
    pub fn multipliers(&self, prompt_tokens: u64) -> (f64, f64) {
        let (input, output) = match self.tier_for(prompt_tokens) {
            Some(tier) => (tier.input, tier.output),
            None => (self.input, self.output),
        };
        let output = match self.kind {
            PriceKind::Tokens => output,
            PriceKind::Times => 0.0,
        };
        (input.max(0.0), output.max(0.0))
    }
}

/// Immutable pricing data. Keys of `models` and `completion_ratios` are an
/// exact model name, `name(channel_type)` for a channel-specific entry, or a
/// `prefix*` wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateTableSnapshot {
    pub models: HashMap<String, ModelRate>,
    pub completion_ratios: HashMap<String, f64>,
    pub groups: HashMap<String, f64>,
    pub default_rate: ModelRate,
    /// Image model to size to cost multiplier.
    pub image_sizes: HashMap<String, HashMap<String, f64>>,
}

impl Default for RateTableSnapshot {
    fn default() -> Self {
        let mut image_sizes = HashMap::new();
        image_sizes.insert(
            "dall-e-2".to_string(),
            HashMap::from([
                ("256x256".to_string(), 1.0),
                ("512x512".to_string(), 1.125),
                ("1024x1024".to_string(), 1.25),
            ]),
        );
        image_sizes.insert(
            "dall-e-3".to_string(),
            HashMap::from([
                ("1024x1024".to_string(), 1.0),
                ("1024x1792".to_string(), 2.0),
                ("1792x1024".to_string(), 2.0),
            ]),
        );
        Self {
            models: HashMap::new(),
            completion_ratios: HashMap::new(),
            groups: HashMap::from([("default".to_string(), 1.0)]),
            default_rate: ModelRate::tokens(DEFAULT_MODEL_RATE, DEFAULT_MODEL_RATE),
            image_sizes,
        }
    }
}

/// Channel-specific key, then the exact name, then the longest `prefix*`.
fn lookup<'a, T>(map: &'a HashMap<String, T>, model: &str, channel_type: &str) -> Option<&'a T> {
    if !channel_type.is_empty()
        && let Some(value) = map.get(&format!("{model}({channel_type})"))
    {
        return Some(value);
    }
    if let Some(value) = map.get(model) {
        return Some(value);
    }
    map.iter()
        .filter_map(|(key, value)| {
            key.strip_suffix('*')
                .filter(|prefix| model.starts_with(prefix))
                .map(|prefix| (prefix.len(), value))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, value)| value)
}

/// Everything needed to price one request. Pure: the same usage always yields
/// the same quota.
#[derive(Debug, Clone, PartialEq)]
pub struct RateQuote {
    pub model: String,
    pub rate: ModelRate,
    pub group: String,
    pub group_ratio: f64,
    pub completion_ratio: f64,
}

impl RateQuote {
    pub fn kind(&self) -> PriceKind {
        self.rate.kind
    }

    fn token_quota(&self, tier_tokens: u64, prompt: u64, completion: u64) -> i64 {
        if prompt + completion == 0 {
            return 0;
        }
        let (input, output) = self.rate.multipliers(tier_tokens);
        let input_rate = input * self.group_ratio;
        let output_rate = output * self.completion_ratio * self.group_ratio;
        let quota = (prompt as f64 * input_rate + completion as f64 * output_rate).ceil() as i64;
        if quota <= 0 && (input_rate > 0.0 || output_rate > 0.0) {
            return 1;
        }
        quota.max(0)
    }

    /// Token-priced quota. Zero tokens bill zero; a nonzero rate never bills
    /// less than one.
    pub fn bill_tokens(&self, prompt_tokens: u64, completion_tokens: u64) -> i64 {
        self.token_quota(prompt_tokens, prompt_tokens, completion_tokens)
    }

    /// Per-call quota for `units` calls (image count times size multiplier).
    pub fn bill_calls(&self, units: f64) -> i64 {
        let (input, _) = self.rate.multipliers(0);
        let quota = (QUOTA_PER_CALL * input * self.group_ratio * units).ceil() as i64;
        quota.max(0)
    }

    pub fn final_quota(&self, usage: &Usage, units: f64) -> i64 {
        match self.rate.kind {
            PriceKind::Tokens => self.bill_tokens(usage.prompt_tokens, usage.completion_tokens),
            PriceKind::Times => self.bill_calls(units),
        }
    }

    /// Pre-consumption amount: the prompt plus `pre_consumed_tokens` at the
    /// input rate and `max_tokens` at the output rate, or the per-call quota.
    pub fn estimate(
        &self,
        prompt_tokens: u64,
        max_tokens: u64,
        pre_consumed_tokens: i64,
        units: f64,
    ) -> i64 {
        match self.rate.kind {
            PriceKind::Tokens => {
                let padded = prompt_tokens + pre_consumed_tokens.max(0) as u64;
                self.token_quota(prompt_tokens, padded, max_tokens)
            }
            PriceKind::Times => self.bill_calls(units),
        }
    }

    /// Human-readable rates for the consume log.
    pub fn annotation(&self, prompt_tokens: u64) -> String {
        if self.rate.kind == PriceKind::Times {
            return format!(
                "per-call rate {:.2}, group rate {:.2}",
                self.rate.input, self.group_ratio
            );
        }
        let (input, output) = self.rate.multipliers(prompt_tokens);
        let model_rate = if input == output {
            format!("{input:.2}")
        } else {
            format!("{input:.2} (input) / {output:.2} (output)")
        };
        let mut out = format!(
            "model rate {model_rate}, group rate {:.2}, completion rate {:.2}",
            self.group_ratio, self.completion_ratio
        );
        if let Some(tier) = self.rate.tier_for(prompt_tokens) {
            out.push_str(&format!(", long context >= {}", tier.threshold));
        }
        out
    }
}

/// Process-wide rate lookups. Built once at startup; `reload` swaps in a new
/// snapshot without blocking readers.
#[derive(Debug)]
pub struct RateTable {
    snapshot: ArcSwap<RateTableSnapshot>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self::new(RateTableSnapshot::default())
    }
}

impl RateTable {
    pub fn new(snapshot: RateTableSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn reload(&self, snapshot: RateTableSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn snapshot(&self) -> Arc<RateTableSnapshot> {
        self.snapshot.load_full()
    }

    /// Unknown groups price at 1.0.
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.snapshot
            .load()
            .groups
            .get(group)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn quote(&self, model: &str, channel_type: &str, group: &str) -> RateQuote {
        let snapshot = self.snapshot.load();
        let rate = lookup(&snapshot.models, model, channel_type)
            .copied()
            .unwrap_or(snapshot.default_rate);
        let completion_ratio = lookup(&snapshot.completion_ratios, model, channel_type)
            .copied()
            .unwrap_or(1.0);
        let group_ratio = snapshot.groups.get(group).copied().unwrap_or(1.0);
        RateQuote {
            model: model.to_string(),
            rate,
            group: group.to_string(),
            group_ratio,
            completion_ratio,
        }
    }

    /// Billing units for an image request: `n` times the size multiplier.
    /// `None` when the model has a size table that does not list `size`.
    pub fn image_units(&self, model: &str, size: &str, quality: Option<&str>, n: u32) -> Option<f64> {
        let snapshot = self.snapshot.load();
        let mut ratio = match snapshot.image_sizes.get(model) {
            Some(sizes) => *sizes.get(size)?,
            None => 1.0,
        };
        if model == "dall-e-3" && quality == Some("hd") {
            ratio *= if size == "1024x1024" { 2.0 } else { 1.5 };
        }
        Some(ratio * f64::from(n))
    }
}
