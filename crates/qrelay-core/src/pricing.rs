use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use qrelay_provider_core::RelayInfo;

/// Per-request pricing snapshot resolved before dispatch.
#[derive(Debug, Clone, Default)]
pub struct PriceData {
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub image_ratio: f64,
    /// Fixed price per request, used when `use_price` is set.
    pub model_price: f64,
    pub use_price: bool,
    /// Upper-bound quota estimate to debit before dispatch.
    pub should_pre_consumed_quota: i64,
}

#[derive(Debug, Clone)]
pub struct PriceError(pub String);

impl fmt::Display for PriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model price lookup failed: {}", self.0)
    }
}

impl Error for PriceError {}

/// Pricing table lookup; the real table lives in an external store.
pub trait PricingResolver: Send + Sync {
    fn resolve(
        &self,
        info: &RelayInfo,
        prompt_tokens: i64,
        max_output_tokens: i64,
    ) -> Result<PriceData, PriceError>;
}

/// Per-model ratio row for the static table.
#[derive(Debug, Clone)]
pub struct ModelPrice {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub image_ratio: f64,
    pub model_price: f64,
    pub use_price: bool,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            model_ratio: 1.0,
            completion_ratio: 1.0,
            cache_ratio: 1.0,
            image_ratio: 1.0,
            model_price: 0.0,
            use_price: false,
        }
    }
}

/// In-process pricing table: per-model rows plus per-group multipliers.
#[derive(Debug, Default)]
pub struct StaticPricing {
    models: HashMap<String, ModelPrice>,
    groups: HashMap<String, f64>,
    default_model: ModelPrice,
    quota_per_unit: f64,
}

impl StaticPricing {
    pub fn new(quota_per_unit: f64) -> Self {
        Self {
            quota_per_unit,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, ratio: f64) -> Self {
        self.groups.insert(group.into(), ratio);
        self
    }
}

impl PricingResolver for StaticPricing {
    fn resolve(
        &self,
        info: &RelayInfo,
        prompt_tokens: i64,
        max_output_tokens: i64,
    ) -> Result<PriceData, PriceError> {
        let row = self
            .models
            .get(&info.upstream_model_name)
            .or_else(|| self.models.get(&info.origin_model_name))
            .unwrap_or(&self.default_model);
        let group_ratio = self.groups.get(&info.group).copied().unwrap_or(1.0);

        let should_pre_consumed_quota = if row.use_price {
            (row.model_price * self.quota_per_unit * group_ratio).ceil() as i64
        } else {
            let tokens = (prompt_tokens + max_output_tokens) as f64;
            (tokens * row.model_ratio * group_ratio).ceil() as i64
        };

        Ok(PriceData {
            model_ratio: row.model_ratio,
            group_ratio,
            completion_ratio: row.completion_ratio,
            cache_ratio: row.cache_ratio,
            image_ratio: row.image_ratio,
            model_price: row.model_price,
            use_price: row.use_price,
            should_pre_consumed_quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use qrelay_provider_core::{ApiType, RelayContext, RelayMode};

    fn make_info(model: &str, group: &str) -> RelayInfo {
        let ctx = RelayContext {
            request_id: "req".to_string(),
            user_id: 1,
            token_id: 1,
            token_unlimited: false,
            token_name: "t".to_string(),
            token_quota: 0,
            channel_id: 1,
            group: group.to_string(),
            api_type: ApiType::Workflow,
            base_url: String::new(),
            api_key: String::new(),
            supports_stream_options: false,
            model_mapping: None,
            prompt_tokens: None,
            param_override: None,
            status_code_mapping: None,
        };
        let mut info = RelayInfo::new(&ctx, RelayMode::ChatCompletions, Bytes::new());
        info.origin_model_name = model.to_string();
        info.upstream_model_name = model.to_string();
        info
    }

    #[test]
    fn ratio_models_estimate_from_tokens() {
        let pricing = StaticPricing::new(500_000.0)
            .with_model(
                "workflow-app",
                ModelPrice {
                    model_ratio: 2.0,
                    ..Default::default()
                },
            )
            .with_group("vip", 0.5);

        let info = make_info("workflow-app", "vip");
        let price = pricing.resolve(&info, 100, 400).unwrap();
        assert_eq!(price.model_ratio, 2.0);
        assert_eq!(price.group_ratio, 0.5);
        assert!(!price.use_price);
        // (100 + 400) * 2.0 * 0.5
        assert_eq!(price.should_pre_consumed_quota, 500);
    }

    #[test]
    fn fixed_price_models_estimate_from_price() {
        let pricing = StaticPricing::new(1_000.0).with_model(
            "workflow-app",
            ModelPrice {
                model_price: 0.25,
                use_price: true,
                ..Default::default()
            },
        );
        let info = make_info("workflow-app", "default");
        let price = pricing.resolve(&info, 100, 0).unwrap();
        assert!(price.use_price);
        // 0.25 * 1000 * 1.0
        assert_eq!(price.should_pre_consumed_quota, 250);
    }

    #[test]
    fn unknown_model_and_group_fall_back_to_defaults() {
        let pricing = StaticPricing::new(500_000.0);
        let info = make_info("anything", "nogroup");
        let price = pricing.resolve(&info, 10, 0).unwrap();
        assert_eq!(price.model_ratio, 1.0);
        assert_eq!(price.group_ratio, 1.0);
        assert_eq!(price.should_pre_consumed_quota, 10);
    }
}
