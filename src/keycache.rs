//! API Key 校验缓存
//!
//! 读多写少：命中走读锁，未命中回源 [`KeyStore`] 后在写锁下写入。
//! 缓存只是持久化记录的影子，禁用/删除 Key 时由管理端显式 [`KeyCache::invalidate`]。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::apikeys::{ApiKeyRecord, KeyStore};
use crate::common::auth;
use crate::db::StoreError;

#[derive(Debug, Clone)]
struct CacheEntry {
    record: ApiKeyRecord,
    cached_at: Instant,
}

pub struct KeyCache {
    store: Arc<dyn KeyStore>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// 每次 invalidate 加一；回源期间发生过失效则结果不写入缓存
    epoch: AtomicU64,
    /// None 表示条目只会被显式失效
    ttl: Option<Duration>,
}

impl KeyCache {
    pub fn new(store: Arc<dyn KeyStore>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            ttl,
        }
    }

    /// `ttl_secs == 0` 关闭过期
    pub fn with_ttl_secs(store: Arc<dyn KeyStore>, ttl_secs: u64) -> Self {
        let ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs));
        Self::new(store, ttl)
    }

    /// 校验 Key
    ///
    /// - `Ok(Some(record))`：Key 存在且启用
    /// - `Ok(None)`：Key 不存在或已禁用，调用方按未认证处理
    /// - `Err(_)`：存储不可用，不做负缓存
    pub fn validate(&self, secret: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        if let Some(record) = self.lookup_cached(secret) {
            return Ok(Some(record));
        }

        // 并发未命中可能各自回源一次，最后写入者生效；写入是幂等的
        let epoch = self.epoch.load(Ordering::Acquire);
        match self.store.find_enabled_by_value(secret)? {
            Some(record) if record.enabled && auth::constant_time_eq(&record.value, secret) => {
                let mut entries = self.entries.write();
                if self.epoch.load(Ordering::Acquire) == epoch {
                    entries.insert(
                        secret.to_string(),
                        CacheEntry {
                            record: record.clone(),
                            cached_at: Instant::now(),
                        },
                    );
                } else {
                    tracing::debug!("回源期间缓存被失效，本次结果不写入缓存");
                }
                Ok(Some(record))
            }
            _ => {
                self.entries.write().remove(secret);
                Ok(None)
            }
        }
    }

    /// 移除缓存条目，下次校验重新回源
    pub fn invalidate(&self, secret: &str) {
        let mut entries = self.entries.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if entries.remove(secret).is_some() {
            tracing::debug!("API Key 缓存已失效");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn lookup_cached(&self, secret: &str) -> Option<ApiKeyRecord> {
        let entries = self.entries.read();
        let entry = entries.get(secret)?;
        if !entry.record.enabled {
            return None;
        }
        if self.ttl.is_some_and(|ttl| entry.cached_at.elapsed() >= ttl) {
            return None;
        }
        Some(entry.record.clone())
    }
}
