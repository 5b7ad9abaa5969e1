//! Admin API 业务逻辑

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::NaiveDate;

use crate::apikeys::ApiKeyManager;
use crate::db::StoreError;
use crate::keycache::KeyCache;
use crate::usage::{UsageQuery, UsageStore};

use super::types::{
    AdminErrorResponse, ApiKeyListResponse, CreateApiKeyResponse, UsageListParams,
    UsageListResponse, UsageStatsResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum AdminServiceError {
    #[error("API Key 名称已存在: {0}")]
    DuplicateName(String),

    #[error("API Key 不存在: {0}")]
    NotFound(i64),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("存储错误: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AdminServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateName(name) => Self::DuplicateName(name),
            other => Self::Store(other),
        }
    }
}

impl AdminServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateName(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> AdminErrorResponse {
        match &self {
            Self::DuplicateName(_) => AdminErrorResponse::conflict(self.to_string()),
            Self::NotFound(_) => AdminErrorResponse::not_found(self.to_string()),
            Self::InvalidRequest(_) => AdminErrorResponse::invalid_request(self.to_string()),
            Self::Store(_) => AdminErrorResponse::internal_error(self.to_string()),
        }
    }
}

/// Key 的增删改都经过这里，禁用和删除会同步清理 [`KeyCache`]
pub struct AdminService {
    keys: Arc<ApiKeyManager>,
    usage: Arc<UsageStore>,
    key_cache: Arc<KeyCache>,
}

impl AdminService {
    pub fn new(keys: Arc<ApiKeyManager>, usage: Arc<UsageStore>, key_cache: Arc<KeyCache>) -> Self {
        Self {
            keys,
            usage,
            key_cache,
        }
    }

    pub fn create_api_key(&self, name: &str) -> Result<CreateApiKeyResponse, AdminServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AdminServiceError::InvalidRequest(
                "API Key 名称不能为空".to_string(),
            ));
        }

        let record = self.keys.create_key(name)?;
        tracing::info!(id = record.id, name = %record.name, "已创建 API Key");
        Ok(CreateApiKeyResponse {
            id: record.id,
            name: record.name,
            value: record.value,
        })
    }

    pub fn list_api_keys(&self) -> Result<ApiKeyListResponse, AdminServiceError> {
        Ok(ApiKeyListResponse {
            api_keys: self.keys.list()?,
        })
    }

    pub fn set_api_key_disabled(&self, id: i64, disabled: bool) -> Result<(), AdminServiceError> {
        let record = self
            .keys
            .set_enabled(id, !disabled)?
            .ok_or(AdminServiceError::NotFound(id))?;
        if disabled {
            self.key_cache.invalidate(&record.value);
        }
        tracing::info!(id, name = %record.name, disabled, "已更新 API Key 状态");
        Ok(())
    }

    pub fn delete_api_key(&self, id: i64) -> Result<(), AdminServiceError> {
        let record = self
            .keys
            .delete_key(id)?
            .ok_or(AdminServiceError::NotFound(id))?;
        self.key_cache.invalidate(&record.value);
        tracing::info!(id, name = %record.name, "已删除 API Key");
        Ok(())
    }

    pub fn list_usage(&self, params: UsageListParams) -> Result<UsageListResponse, AdminServiceError> {
        let query = UsageQuery {
            page: params.page.unwrap_or(1),
            page_size: params.page_size.unwrap_or(0),
            apikey_name: params.apikey_name,
            model_name: params.model_name,
            start_date: parse_date("start_time", params.start_time.as_deref())?,
            end_date: parse_date("end_time", params.end_time.as_deref())?,
        };
        let page = self.usage.list(&query)?;
        Ok(UsageListResponse {
            total: page.total,
            items: page.items,
        })
    }

    pub fn usage_stats(&self) -> Result<UsageStatsResponse, AdminServiceError> {
        Ok(UsageStatsResponse {
            stats: self.usage.stats()?,
        })
    }
}

fn parse_date(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, AdminServiceError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                AdminServiceError::InvalidRequest(format!("{field} 格式应为 YYYY-MM-DD: {v}"))
            }),
    }
}
