//! API Key 持久化存储

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{SharedConnection, StoreError, format_timestamp};

/// 持久化的 API Key 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    pub value: String,
    pub enabled: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyPublicInfo {
    pub id: i64,
    pub name: String,
    pub value: String,
    pub enabled: bool,
    pub created_at: String,
    pub key_preview: String,
}

/// Key 缓存背后的权威数据源
pub trait KeyStore: Send + Sync {
    /// 只返回启用状态的 Key；不存在或已禁用都返回 `Ok(None)`
    fn find_enabled_by_value(&self, secret: &str) -> Result<Option<ApiKeyRecord>, StoreError>;
}

const SELECT_COLUMNS: &str = "SELECT id, name, value, enabled, created_at FROM apikey";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        value: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}

pub struct ApiKeyManager {
    conn: SharedConnection,
}

impl ApiKeyManager {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// 确保配置文件中的默认 Key 存在
    pub fn ensure_initial_key(&self, value: &str) -> Result<(), StoreError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM apikey WHERE value = ?1", params![value], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_some() {
            return Ok(());
        }

        let default_taken: Option<i64> = conn
            .query_row("SELECT id FROM apikey WHERE name = 'default'", [], |row| {
                row.get(0)
            })
            .optional()?;
        let name = match default_taken {
            None => "default".to_string(),
            Some(_) => format!("default-{}", &Uuid::new_v4().simple().to_string()[..8]),
        };
        conn.execute(
            "INSERT INTO apikey (name, value, enabled, created_at) VALUES (?1, ?2, 1, ?3)",
            params![name, value, format_timestamp(Utc::now())],
        )?;
        tracing::info!(name = %name, "已写入配置中的默认 API Key");
        Ok(())
    }

    pub fn create_key(&self, name: &str) -> Result<ApiKeyRecord, StoreError> {
        let conn = self.conn.lock();
        let taken: Option<i64> = conn
            .query_row("SELECT id FROM apikey WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::DuplicateName(name.to_string()));
        }

        let value = generate_key_value();
        let created_at = format_timestamp(Utc::now());
        conn.execute(
            "INSERT INTO apikey (name, value, enabled, created_at) VALUES (?1, ?2, 1, ?3)",
            params![name, value, created_at],
        )?;
        Ok(ApiKeyRecord {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            value,
            enabled: true,
            created_at,
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<ApiKeyRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<ApiKeyPublicInfo>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))?;
        let keys = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|r| ApiKeyPublicInfo {
                key_preview: preview_key(&r.value),
                id: r.id,
                name: r.name,
                value: r.value,
                enabled: r.enabled,
                created_at: r.created_at,
            })
            .collect();
        Ok(keys)
    }

    /// 修改启用状态，返回修改后的记录（调用方据此清理缓存）
    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<Option<ApiKeyRecord>, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE apikey SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// 删除 Key，返回被删除的记录（调用方据此清理缓存）
    pub fn delete_key(&self, id: i64) -> Result<Option<ApiKeyRecord>, StoreError> {
        let Some(record) = self.get(id)? else {
            return Ok(None);
        };
        self.conn
            .lock()
            .execute("DELETE FROM apikey WHERE id = ?1", params![id])?;
        Ok(Some(record))
    }
}

impl KeyStore for ApiKeyManager {
    fn find_enabled_by_value(&self, secret: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE value = ?1 AND enabled = 1"),
                params![secret],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }
}

/// `bk-` + 64 位十六进制
fn generate_key_value() -> String {
    format!(
        "bk-{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

fn preview_key(raw: &str) -> String {
    let len = raw.len();
    if len <= 8 {
        return "********".to_string();
    }
    format!("{}****{}", &raw[..4], &raw[len.saturating_sub(4)..])
}
