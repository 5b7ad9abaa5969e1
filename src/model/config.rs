use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::metering::ModelPricing;

/// AWS Bedrock 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedrockConfig {
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing)]
    pub session_token: Option<String>,

    /// 自定义 endpoint（可选），未配置时使用 bedrock-runtime.{region}.amazonaws.com
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// 下发给 Bedrock 的 anthropic_version
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// 客户端模型名 → Bedrock 模型 ID，覆盖内置映射
    #[serde(default)]
    pub model_mappings: HashMap<String, String>,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint: None,
            anthropic_version: default_anthropic_version(),
            timeout_secs: default_timeout_secs(),
            model_mappings: HashMap::new(),
        }
    }
}

impl BedrockConfig {
    pub fn effective_endpoint(&self) -> String {
        match self.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint.trim_end_matches('/').to_string(),
            _ => format!("https://bedrock-runtime.{}.amazonaws.com", self.region),
        }
    }
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 完整监听地址（可选，优先于 host/port）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// 静态文件根目录（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_root: Option<String>,

    /// 启动时写入 Key 存储的默认 API Key
    #[serde(default)]
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub admin_username: Option<String>,

    #[serde(default)]
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,

    /// Key 缓存有效期（秒），0 表示只依赖显式失效
    #[serde(default = "default_key_cache_ttl_secs")]
    pub key_cache_ttl_secs: u64,

    #[serde(default)]
    pub bedrock: BedrockConfig,

    /// 模型定价，覆盖内置定价表
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_anthropic_version() -> String {
    "bedrock-2023-05-31".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_db_path() -> String {
    "bedrock-rs.db".to_string()
}

fn default_key_cache_ttl_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            listen: None,
            web_root: None,
            api_key: None,
            db_path: default_db_path(),
            admin_username: None,
            admin_password: None,
            key_cache_ttl_secs: default_key_cache_ttl_secs(),
            bedrock: BedrockConfig::default(),
            pricing: HashMap::new(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 用进程环境变量补齐未配置的字段
    pub fn merge_env(&mut self) {
        self.merge_env_with(|key| std::env::var(key).ok());
    }

    /// 文件中已配置的值优先，环境变量只填空缺
    pub fn merge_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        fill(&mut self.listen, get("HTTP_LISTEN"));
        fill(&mut self.web_root, get("WEB_ROOT"));
        fill(&mut self.api_key, get("API_KEY"));
        fill(&mut self.admin_username, get("ADMIN_USERNAME"));
        fill(&mut self.admin_password, get("ADMIN_PASSWORD"));
        if let Some(db_path) = get("DB_PATH") {
            if self.db_path == default_db_path() {
                self.db_path = db_path;
            }
        }

        let bedrock = &mut self.bedrock;
        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            if bedrock.region == default_region() {
                bedrock.region = region;
            }
        }
        fill(&mut bedrock.access_key_id, get("AWS_ACCESS_KEY_ID"));
        fill(&mut bedrock.secret_access_key, get("AWS_SECRET_ACCESS_KEY"));
        fill(&mut bedrock.session_token, get("AWS_SESSION_TOKEN"));
        fill(&mut bedrock.endpoint, get("BEDROCK_ENDPOINT"));
    }

    /// 实际监听地址
    pub fn listen_addr(&self) -> String {
        match self.listen.as_deref().map(str::trim) {
            Some(listen) if !listen.is_empty() => listen.to_string(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_password
            .as_ref()
            .is_some_and(|p| !p.trim().is_empty())
    }

    /// 脱敏后的配置 JSON（用于启动日志）
    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.as_ref().is_none_or(|v| v.trim().is_empty()) {
        if let Some(value) = value {
            *slot = Some(value);
        }
    }
}
