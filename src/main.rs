mod admin;
mod anthropic;
mod apikeys;
mod bedrock;
mod common;
mod db;
mod keycache;
mod metering;
mod model;
mod usage;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use model::arg::Args;
use model::config::Config;

#[tokio::main]
async fn main() {
    // .env 可选，不存在时忽略
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let mut config = Config::load(&config_path).unwrap_or_else(|e| {
        tracing::error!("加载配置失败: {}", e);
        std::process::exit(1);
    });
    config.merge_env();

    match config.to_json_pretty() {
        Ok(json) => tracing::debug!("当前配置:\n{}", json),
        Err(e) => tracing::warn!("序列化配置失败: {}", e),
    }

    let conn = db::open(Path::new(&config.db_path)).unwrap_or_else(|e| {
        tracing::error!("打开数据库失败 ({}): {}", config.db_path, e);
        std::process::exit(1);
    });

    let api_keys = Arc::new(apikeys::ApiKeyManager::new(conn.clone()));
    if let Some(initial) = config.api_key.as_deref() {
        if let Err(e) = api_keys.ensure_initial_key(initial) {
            tracing::error!("写入默认 API Key 失败: {}", e);
            std::process::exit(1);
        }
    }
    let usage_store = Arc::new(usage::UsageStore::new(conn));

    let key_cache = Arc::new(keycache::KeyCache::with_ttl_secs(
        api_keys.clone(),
        config.key_cache_ttl_secs,
    ));

    let pricing = metering::PricingTable::with_overrides(&config.pricing);
    tracing::info!("已加载 {} 个模型定价", pricing.len());
    let meter = Arc::new(metering::UsageMeter::new(pricing, usage_store.clone()));

    let client = bedrock::BedrockClient::from_config(&config.bedrock).unwrap_or_else(|e| {
        tracing::error!("创建 Bedrock 客户端失败: {}", e);
        std::process::exit(1);
    });
    tracing::info!(
        "Bedrock endpoint: {} (region={})",
        client.endpoint(),
        config.bedrock.region
    );

    let adapter = anthropic::ProtocolAdapter::new(
        Arc::new(client),
        bedrock::ModelResolver::new(&config.bedrock.model_mappings),
    )
    .with_bedrock_version(config.bedrock.anthropic_version.clone());

    let state = anthropic::AppState::new(key_cache.clone(), adapter, meter);
    let mut app = anthropic::create_router(state);

    if config.admin_enabled() {
        let admin_service = admin::AdminService::new(api_keys, usage_store, key_cache);
        let admin_username = config
            .admin_username
            .clone()
            .unwrap_or_else(|| "admin".to_string());
        let admin_password = config.admin_password.clone().unwrap_or_default();
        let admin_state = admin::AdminState::new(admin_username, admin_password, admin_service);
        app = app.merge(admin::create_admin_router(admin_state));
        tracing::info!("Admin API 已启用");
    }

    let web_root = config.web_root.as_deref().map(Path::new);
    if let Some(root) = web_root {
        tracing::info!("静态文件目录: {}", root.display());
    }
    let app = anthropic::with_fallback(app, web_root);

    let addr = config.listen_addr();
    tracing::info!("启动服务: {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("监听 {} 失败: {}", addr, e);
            std::process::exit(1);
        });
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("服务异常退出: {}", e);
        std::process::exit(1);
    }
}
