use std::sync::Arc;

use http::StatusCode;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{error, info, warn};

use qrelay_protocol::openai::Usage;
use qrelay_provider_core::{BuiltInTool, RelayError, RelayInfo, RelayResult};
use qrelay_storage::{ConsumeLogEntry, ConsumeLogSink, QuotaLedger};

use crate::pricing::PriceData;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Converts currency price to quota units.
    pub quota_per_unit: f64,
    pub web_search_price_per_thousand: f64,
    pub file_search_price_per_thousand: f64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: 500_000.0,
            web_search_price_per_thousand: 10.0,
            file_search_price_per_thousand: 2.5,
        }
    }
}

/// A committed pre-consume debit.
///
/// Exactly one of two things happens to it: `settle()` hands the amount to
/// post-consume (which folds it into the final delta), or the guard drops
/// and the full amount is refunded asynchronously. This is the scoped
/// compensation the relay registers at the moment of debit.
#[must_use = "dropping an unsettled pre-consume refunds it"]
pub struct PreConsumed {
    ledger: Arc<dyn QuotaLedger>,
    user_id: i64,
    token_id: i64,
    request_id: String,
    amount: i64,
    settled: bool,
}

impl std::fmt::Debug for PreConsumed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreConsumed")
            .field("user_id", &self.user_id)
            .field("token_id", &self.token_id)
            .field("request_id", &self.request_id)
            .field("amount", &self.amount)
            .field("settled", &self.settled)
            .finish()
    }
}

impl PreConsumed {
    pub fn amount(&self) -> i64 {
        self.amount
    }

    /// Discharge the guard; the caller takes over the amount.
    pub fn settle(mut self) -> i64 {
        self.settled = true;
        self.amount
    }
}

impl Drop for PreConsumed {
    fn drop(&mut self) {
        if self.settled || self.amount == 0 {
            return;
        }
        let ledger = self.ledger.clone();
        let (user_id, token_id, amount) = (self.user_id, self.token_id, self.amount);
        let request_id = std::mem::take(&mut self.request_id);
        info!(
            event = "refund_pre_consumed",
            request_id = %request_id,
            user_id,
            token_id,
            amount
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = ledger.post_consume_quota(user_id, token_id, -amount).await {
                        error!(
                            event = "refund_failed",
                            request_id = %request_id,
                            user_id,
                            token_id,
                            amount,
                            error = %err
                        );
                    }
                });
            }
            Err(_) => error!(
                event = "refund_failed",
                request_id = %request_id,
                error = "no runtime available"
            ),
        }
    }
}

/// Debit an upper-bound quota estimate before dispatch.
///
/// Trust heuristic: a user balance above 100x the estimate, paired with an
/// unlimited token or a token balance above the same bar, skips the debit
/// entirely.
pub async fn pre_consume_quota(
    ledger: &Arc<dyn QuotaLedger>,
    info: &mut RelayInfo,
    token_quota: i64,
    should_pre_consume: i64,
) -> RelayResult<PreConsumed> {
    let user_quota = ledger.get_user_quota(info.user_id).await.map_err(|err| {
        RelayError::local(
            "get_user_quota_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
    })?;
    if user_quota <= 0 {
        return Err(RelayError::local(
            "insufficient_user_quota",
            StatusCode::FORBIDDEN,
            "user quota is not enough",
        ));
    }
    if user_quota - should_pre_consume < 0 {
        return Err(RelayError::local(
            "insufficient_user_quota",
            StatusCode::FORBIDDEN,
            format!(
                "pre-consumed quota failed, user quota: {user_quota}, need quota: {should_pre_consume}"
            ),
        ));
    }
    info.user_quota = user_quota;

    let mut amount = should_pre_consume;
    if user_quota > 100 * should_pre_consume {
        if info.token_unlimited {
            amount = 0;
            info!(
                event = "pre_consume_skipped",
                request_id = %info.request_id,
                user_id = info.user_id,
                user_quota,
                reason = "unlimited_token"
            );
        } else if token_quota > 100 * should_pre_consume {
            amount = 0;
            info!(
                event = "pre_consume_skipped",
                request_id = %info.request_id,
                user_id = info.user_id,
                user_quota,
                token_quota,
                reason = "trusted_token"
            );
        }
    }

    if amount > 0 {
        ledger
            .pre_consume_token_quota(info.token_id, amount)
            .await
            .map_err(|err| {
                RelayError::local(
                    "pre_consume_token_quota_failed",
                    StatusCode::FORBIDDEN,
                    err.to_string(),
                )
            })?;
        ledger
            .decrease_user_quota(info.user_id, amount)
            .await
            .map_err(|err| {
                RelayError::local(
                    "decrease_user_quota_failed",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                )
            })?;
    }

    Ok(PreConsumed {
        ledger: ledger.clone(),
        user_id: info.user_id,
        token_id: info.token_id,
        request_id: info.request_id.clone(),
        amount,
        settled: false,
    })
}

/// Settle the final charge against the reported usage. This step never fails
/// the request: ledger errors are logged, and a consume-log entry is written
/// even when the charge is zero.
#[allow(clippy::too_many_arguments)]
pub async fn post_consume_quota(
    ledger: &dyn QuotaLedger,
    log_sink: &dyn ConsumeLogSink,
    config: &SettlementConfig,
    info: &RelayInfo,
    token_name: &str,
    usage: Option<&Usage>,
    pre_consumed: i64,
    price: &PriceData,
    extra_content: &str,
) {
    let mut content = String::new();
    let fallback;
    let usage = match usage {
        Some(usage) => usage,
        None => {
            fallback = Usage {
                prompt_tokens: info.prompt_tokens,
                completion_tokens: 0,
                total_tokens: info.prompt_tokens,
                prompt_tokens_details: Default::default(),
            };
            content.push_str("(usage missing, possible request error)");
            &fallback
        }
    };

    let prompt_tokens = usage.prompt_tokens;
    let cache_tokens = usage.prompt_tokens_details.cached_tokens;
    let image_tokens = usage.prompt_tokens_details.image_tokens;
    let completion_tokens = usage.completion_tokens;

    let d_prompt = Decimal::from(prompt_tokens);
    let d_cache = Decimal::from(cache_tokens);
    let d_image = Decimal::from(image_tokens);
    let d_completion = Decimal::from(completion_tokens);
    let d_completion_ratio = decimal_from_f64(price.completion_ratio);
    let d_cache_ratio = decimal_from_f64(price.cache_ratio);
    let d_image_ratio = decimal_from_f64(price.image_ratio);
    let d_model_ratio = decimal_from_f64(price.model_ratio);
    let d_group_ratio = decimal_from_f64(price.group_ratio);
    let d_model_price = decimal_from_f64(price.model_price);
    let d_quota_per_unit = decimal_from_f64(config.quota_per_unit);

    let ratio = d_model_ratio * d_group_ratio;

    // built-in tool charges, priced per thousand calls
    let mut d_web_search = Decimal::ZERO;
    let mut d_file_search = Decimal::ZERO;
    let mut web_search_calls = 0;
    let mut file_search_calls = 0;
    if let Some(responses_usage) = &info.responses_usage {
        if let Some(tool) = responses_usage.built_in_tools.get(&BuiltInTool::WebSearchPreview)
            && tool.call_count > 0
        {
            web_search_calls = tool.call_count;
            d_web_search = decimal_from_f64(config.web_search_price_per_thousand)
                * Decimal::from(tool.call_count)
                / Decimal::from(1000)
                * d_group_ratio
                * d_quota_per_unit;
            content.push_str(&format!(
                "web search called {} times, context size {}; ",
                tool.call_count, tool.search_context_size
            ));
        }
        if let Some(tool) = responses_usage.built_in_tools.get(&BuiltInTool::FileSearch)
            && tool.call_count > 0
        {
            file_search_calls = tool.call_count;
            d_file_search = decimal_from_f64(config.file_search_price_per_thousand)
                * Decimal::from(tool.call_count)
                / Decimal::from(1000)
                * d_group_ratio
                * d_quota_per_unit;
            content.push_str(&format!("file search called {} times; ", tool.call_count));
        }
    }

    let mut d_quota = if !price.use_price {
        let non_cached = d_prompt - d_cache;
        let mut prompt_quota = non_cached + d_cache * d_cache_ratio;
        if image_tokens > 0 {
            prompt_quota = (d_prompt - d_image) + d_image * d_image_ratio;
        }
        let completion_quota = d_completion * d_completion_ratio;
        let mut quota = (prompt_quota + completion_quota) * ratio;
        // every non-free request costs at least one unit
        if !ratio.is_zero() && quota <= Decimal::ZERO {
            quota = Decimal::ONE;
        }
        quota
    } else {
        d_model_price * d_quota_per_unit * d_group_ratio
    };
    d_quota += d_web_search;
    d_quota += d_file_search;

    let mut quota = d_quota
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0);
    let total_tokens = prompt_tokens + completion_tokens;

    if !price.use_price {
        content.push_str(&format!(
            "model ratio {:.2}, completion ratio {:.2}, group ratio {:.2}",
            price.model_ratio, price.completion_ratio, price.group_ratio
        ));
    } else {
        content.push_str(&format!(
            "model price {:.2}, group ratio {:.2}",
            price.model_price, price.group_ratio
        ));
    }

    if total_tokens == 0 {
        // the request produced nothing; the log row still goes out so the
        // failure is observable, and the delta below refunds the debit
        quota = 0;
        content.push_str(" (upstream may have timed out)");
        error!(
            event = "consume_zero_tokens",
            request_id = %info.request_id,
            user_id = info.user_id,
            channel_id = info.channel_id,
            token_id = info.token_id,
            model = %info.origin_model_name,
            pre_consumed
        );
    } else {
        if let Err(err) = ledger.update_user_used_quota(info.user_id, quota).await {
            warn!(event = "update_user_used_quota_failed", request_id = %info.request_id, error = %err);
        }
        if let Err(err) = ledger.update_channel_used_quota(info.channel_id, quota).await {
            warn!(event = "update_channel_used_quota_failed", request_id = %info.request_id, error = %err);
        }
    }

    let delta = quota - pre_consumed;
    if delta != 0 {
        if let Err(err) = ledger
            .post_consume_quota(info.user_id, info.token_id, delta)
            .await
        {
            error!(
                event = "post_consume_failed",
                request_id = %info.request_id,
                user_id = info.user_id,
                token_id = info.token_id,
                delta,
                error = %err
            );
        }
    }

    let mut log_model = info.origin_model_name.clone();
    if log_model.starts_with("gpt-4-gizmo") {
        log_model = "gpt-4-gizmo-*".to_string();
        content.push_str(&format!(", model {}", info.origin_model_name));
    } else if log_model.starts_with("gpt-4o-gizmo") {
        log_model = "gpt-4o-gizmo-*".to_string();
        content.push_str(&format!(", model {}", info.origin_model_name));
    }
    if !extra_content.is_empty() {
        content.push_str(", ");
        content.push_str(extra_content);
    }

    let mut other = serde_json::json!({
        "model_ratio": price.model_ratio,
        "group_ratio": price.group_ratio,
        "completion_ratio": price.completion_ratio,
        "cache_tokens": cache_tokens,
        "cache_ratio": price.cache_ratio,
        "model_price": price.model_price,
    });
    if image_tokens != 0 {
        other["image"] = serde_json::json!(true);
        other["image_ratio"] = serde_json::json!(price.image_ratio);
        other["image_output"] = serde_json::json!(image_tokens);
    }
    if web_search_calls > 0 {
        other["web_search"] = serde_json::json!(true);
        other["web_search_call_count"] = serde_json::json!(web_search_calls);
    }
    if file_search_calls > 0 {
        other["file_search"] = serde_json::json!(true);
        other["file_search_call_count"] = serde_json::json!(file_search_calls);
    }

    log_sink.record(ConsumeLogEntry {
        request_id: info.request_id.clone(),
        user_id: info.user_id,
        channel_id: info.channel_id,
        token_id: info.token_id,
        token_name: token_name.to_string(),
        model: log_model,
        prompt_tokens,
        completion_tokens,
        quota,
        pre_consumed_quota: pre_consumed,
        user_quota: info.user_quota,
        use_time_seconds: info.elapsed_seconds(),
        is_stream: info.is_stream,
        group: info.group.clone(),
        content,
        other,
    });
}

fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}
