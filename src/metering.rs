//! 计费：模型定价表 + 用量记录

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::StoreError;
use crate::usage::{UsageLedger, UsageRecord};

/// 单个模型的价格系数（每 token 折算的 quota）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPricing {
    pub input_ratio: f64,
    pub output_ratio: f64,
}

impl ModelPricing {
    pub const fn new(input_ratio: f64, output_ratio: f64) -> Self {
        Self {
            input_ratio,
            output_ratio,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    #[error("no pricing configured for model `{0}`")]
    UnknownModel(String),

    #[error("写入用量失败: {0}")]
    Ledger(#[from] StoreError),
}

/// 内置定价，按 Bedrock 模型 ID（去掉跨区域前缀）
const BUILTIN_PRICING: &[(&str, ModelPricing)] = &[
    ("anthropic.claude-opus-4-1-20250805-v1:0", ModelPricing::new(7.5, 37.5)),
    ("anthropic.claude-opus-4-20250514-v1:0", ModelPricing::new(7.5, 37.5)),
    ("anthropic.claude-sonnet-4-20250514-v1:0", ModelPricing::new(1.5, 7.5)),
    ("anthropic.claude-3-7-sonnet-20250219-v1:0", ModelPricing::new(1.5, 7.5)),
    ("anthropic.claude-3-5-sonnet-20241022-v2:0", ModelPricing::new(1.5, 7.5)),
    ("anthropic.claude-3-5-sonnet-20240620-v1:0", ModelPricing::new(1.5, 7.5)),
    ("anthropic.claude-3-5-haiku-20241022-v1:0", ModelPricing::new(0.4, 2.0)),
    ("anthropic.claude-3-sonnet-20240229-v1:0", ModelPricing::new(1.5, 7.5)),
    ("anthropic.claude-3-haiku-20240307-v1:0", ModelPricing::new(0.125, 0.625)),
    ("anthropic.claude-3-opus-20240229-v1:0", ModelPricing::new(7.5, 37.5)),
    ("anthropic.claude-v2:1", ModelPricing::new(4.0, 12.0)),
    ("anthropic.claude-v2", ModelPricing::new(4.0, 12.0)),
    ("anthropic.claude-instant-v1", ModelPricing::new(0.4, 1.2)),
];

const CROSS_REGION_PREFIXES: &[&str] = &["us.", "eu.", "apac."];

/// 启动时构建，之后只读
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// 内置定价叠加配置文件中的覆盖项
    pub fn with_overrides(overrides: &HashMap<String, ModelPricing>) -> Self {
        let mut entries = HashMap::new();
        for (model, pricing) in BUILTIN_PRICING {
            entries.insert((*model).to_string(), *pricing);
            for prefix in CROSS_REGION_PREFIXES {
                entries.insert(format!("{prefix}{model}"), *pricing);
            }
        }
        for (model, pricing) in overrides {
            entries.insert(model.clone(), *pricing);
        }
        Self { entries }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, ModelPricing)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// 精确匹配，不做别名解析
    pub fn get(&self, model_id: &str) -> Option<&ModelPricing> {
        self.entries.get(model_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn quota(
        &self,
        model_id: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<i64, MeteringError> {
        let pricing = self
            .get(model_id)
            .ok_or_else(|| MeteringError::UnknownModel(model_id.to_string()))?;
        let quota = input_tokens as f64 * pricing.input_ratio
            + output_tokens as f64 * pricing.output_ratio;
        Ok(quota.round() as i64)
    }
}

/// 用量计量器
///
/// `record` 只做一次写入，不重试；调用方决定失败后的处理（通常只记录日志）。
pub struct UsageMeter {
    pricing: PricingTable,
    ledger: Arc<dyn UsageLedger>,
}

impl UsageMeter {
    pub fn new(pricing: PricingTable, ledger: Arc<dyn UsageLedger>) -> Self {
        Self { pricing, ledger }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn quota(
        &self,
        model_id: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<i64, MeteringError> {
        self.pricing.quota(model_id, input_tokens, output_tokens)
    }

    pub fn record(
        &self,
        api_key_name: &str,
        api_key_value: &str,
        model_id: &str,
        input_tokens: i64,
        output_tokens: i64,
        quota: i64,
    ) -> Result<(), MeteringError> {
        self.ledger.insert(&UsageRecord {
            api_key_name: api_key_name.to_string(),
            api_key_value: api_key_value.to_string(),
            model_name: model_id.to_string(),
            input_tokens,
            output_tokens,
            quota,
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    /// quota + record，失败只记录日志，不影响客户端响应
    pub fn settle(
        &self,
        api_key_name: &str,
        api_key_value: &str,
        model_id: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        let quota = match self.quota(model_id, input_tokens, output_tokens) {
            Ok(quota) => quota,
            Err(e) => {
                tracing::error!(
                    model = %model_id,
                    input_tokens,
                    output_tokens,
                    "计费失败，模型缺少定价配置: {}",
                    e
                );
                return;
            }
        };

        match self.record(
            api_key_name,
            api_key_value,
            model_id,
            input_tokens,
            output_tokens,
            quota,
        ) {
            Ok(()) => tracing::info!(
                api_key = %api_key_name,
                model = %model_id,
                input_tokens,
                output_tokens,
                quota,
                "用量已记录"
            ),
            Err(e) => tracing::error!(
                api_key = %api_key_name,
                model = %model_id,
                "{}",
                e
            ),
        }
    }
}
