//! Tiered token pricing for chat-style usage.
//!
//! A fixed price is a single tier with `up_to = None`. Tier selection keys
//! off the prompt-side token count (input + cache creation + cache read).

use serde::{Deserialize, Serialize};

use omnigate_protocol::usage::TokenUsage;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheTtlPrice {
    pub ttl_minutes: i64,
    pub cache_creation_price_per_1m: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceTier {
    /// Upper bound in prompt tokens; `None` = ∞.
    #[serde(default)]
    pub up_to: Option<i64>,
    pub input_price_per_1m: f64,
    pub output_price_per_1m: f64,
    #[serde(default)]
    pub cache_creation_price_per_1m: Option<f64>,
    #[serde(default)]
    pub cache_read_price_per_1m: Option<f64>,
    #[serde(default)]
    pub cache_ttl_pricing: Option<Vec<CacheTtlPrice>>,
}

impl PriceTier {
    fn cache_creation_price(&self, ttl_minutes: i64) -> f64 {
        if let Some(ttl_pricing) = &self.cache_ttl_pricing {
            if let Some(entry) = ttl_pricing.iter().find(|p| p.ttl_minutes == ttl_minutes) {
                return entry.cache_creation_price_per_1m;
            }
        }
        self.cache_creation_price_per_1m
            .unwrap_or(self.input_price_per_1m)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TieredPricing {
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    pub price_per_request: f64,
}

impl TieredPricing {
    pub fn flat(input_price_per_1m: f64, output_price_per_1m: f64) -> Self {
        Self {
            tiers: vec![PriceTier {
                up_to: None,
                input_price_per_1m,
                output_price_per_1m,
                ..Default::default()
            }],
            price_per_request: 0.0,
        }
    }

    /// First tier whose bound covers the prompt token count; the last tier
    /// catches everything else.
    pub fn tier_for(&self, prompt_tokens: i64) -> Option<&PriceTier> {
        self.tiers
            .iter()
            .find(|tier| tier.up_to.is_none_or(|bound| prompt_tokens <= bound))
            .or_else(|| self.tiers.last())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub per_request_cost: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input_cost
            + self.output_cost
            + self.cache_creation_cost
            + self.cache_read_cost
            + self.per_request_cost
    }
}

pub fn compute_token_cost(usage: &TokenUsage, pricing: &TieredPricing) -> CostBreakdown {
    let prompt_tokens =
        usage.input_tokens + usage.cache_creation_tokens + usage.cache_read_tokens;
    let Some(tier) = pricing.tier_for(prompt_tokens) else {
        return CostBreakdown {
            per_request_cost: pricing.price_per_request,
            ..Default::default()
        };
    };

    let cache_creation_cost = if usage.cache_creation_tokens_5m > 0
        || usage.cache_creation_tokens_1h > 0
    {
        usage.cache_creation_tokens_5m as f64 / TOKENS_PER_UNIT * tier.cache_creation_price(5)
            + usage.cache_creation_tokens_1h as f64 / TOKENS_PER_UNIT * tier.cache_creation_price(60)
    } else {
        usage.cache_creation_tokens as f64 / TOKENS_PER_UNIT * tier.cache_creation_price(5)
    };

    CostBreakdown {
        input_cost: usage.input_tokens as f64 / TOKENS_PER_UNIT * tier.input_price_per_1m,
        output_cost: usage.output_tokens as f64 / TOKENS_PER_UNIT * tier.output_price_per_1m,
        cache_creation_cost,
        cache_read_cost: usage.cache_read_tokens as f64 / TOKENS_PER_UNIT
            * tier
                .cache_read_price_per_1m
                .unwrap_or(tier.input_price_per_1m * 0.1),
        per_request_cost: pricing.price_per_request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_pricing_matches_hand_computation() {
        let pricing = TieredPricing::flat(2.5, 10.0);
        let usage = TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
            ..Default::default()
        };
        let cost = compute_token_cost(&usage, &pricing);
        assert!((cost.total() - (2.5 + 10.0) / 1_000_000.0).abs() < 1e-12);
    }

    #[test]
    fn tier_selection_by_prompt_tokens() {
        let pricing = TieredPricing {
            tiers: vec![
                PriceTier {
                    up_to: Some(128_000),
                    input_price_per_1m: 2.5,
                    output_price_per_1m: 10.0,
                    ..Default::default()
                },
                PriceTier {
                    up_to: None,
                    input_price_per_1m: 5.0,
                    output_price_per_1m: 20.0,
                    ..Default::default()
                },
            ],
            price_per_request: 0.0,
        };
        assert_eq!(pricing.tier_for(1_000).unwrap().input_price_per_1m, 2.5);
        assert_eq!(pricing.tier_for(200_000).unwrap().input_price_per_1m, 5.0);
    }

    #[test]
    fn ttl_split_uses_ttl_specific_prices() {
        let pricing = TieredPricing {
            tiers: vec![PriceTier {
                up_to: None,
                input_price_per_1m: 3.0,
                output_price_per_1m: 15.0,
                cache_creation_price_per_1m: Some(3.75),
                cache_read_price_per_1m: Some(0.3),
                cache_ttl_pricing: Some(vec![
                    CacheTtlPrice {
                        ttl_minutes: 5,
                        cache_creation_price_per_1m: 3.75,
                    },
                    CacheTtlPrice {
                        ttl_minutes: 60,
                        cache_creation_price_per_1m: 6.0,
                    },
                ]),
            }],
            price_per_request: 0.0,
        };
        let usage = TokenUsage {
            cache_creation_tokens: 2_000_000,
            cache_creation_tokens_5m: 1_000_000,
            cache_creation_tokens_1h: 1_000_000,
            ..Default::default()
        };
        let cost = compute_token_cost(&usage, &pricing);
        assert!((cost.cache_creation_cost - (3.75 + 6.0)).abs() < 1e-9);
    }

    #[test]
    fn per_request_surcharge_is_added() {
        let mut pricing = TieredPricing::flat(1.0, 1.0);
        pricing.price_per_request = 0.002;
        let cost = compute_token_cost(&TokenUsage::default(), &pricing);
        assert_eq!(cost.total(), 0.002);
    }

    #[test]
    fn breakdown_total_is_reconstructible() {
        let pricing = TieredPricing::flat(2.5, 10.0);
        let usage = TokenUsage {
            input_tokens: 1234,
            output_tokens: 567,
            cache_read_tokens: 89,
            ..Default::default()
        };
        let cost = compute_token_cost(&usage, &pricing);
        let recomputed =
            cost.input_cost + cost.output_cost + cost.cache_creation_cost + cost.cache_read_cost
                + cost.per_request_cost;
        assert!((recomputed - cost.total()).abs() < 1e-9);
    }
}
