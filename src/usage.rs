//! 用量账本

use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::{ToSql, params, params_from_iter};
use serde::Serialize;

use crate::db::{SharedConnection, StoreError, format_timestamp};

/// 一次请求的用量记录，写入后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub api_key_name: String,
    pub api_key_value: String,
    pub model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub quota: i64,
    pub created_at: DateTime<Utc>,
}

pub trait UsageLedger: Send + Sync {
    fn insert(&self, record: &UsageRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageItem {
    pub id: i64,
    pub apikey_name: String,
    pub model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub quota: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsagePage {
    pub total: i64,
    pub items: Vec<UsageItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStatsRow {
    pub apikey_name: String,
    pub model_name: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub quota: i64,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// 用量查询条件
#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    pub page: u32,
    pub page_size: u32,
    pub apikey_name: Option<String>,
    pub model_name: Option<String>,
    pub start_date: Option<NaiveDate>,
    /// 包含当天
    pub end_date: Option<NaiveDate>,
}

impl UsageQuery {
    fn page(&self) -> u32 {
        self.page.max(1)
    }

    fn page_size(&self) -> u32 {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    fn where_clause(&self) -> (String, Vec<String>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(name) = self.apikey_name.as_ref().filter(|v| !v.is_empty()) {
            conditions.push("apikey_name = ?");
            values.push(name.clone());
        }
        if let Some(model) = self.model_name.as_ref().filter(|v| !v.is_empty()) {
            conditions.push("model_name = ?");
            values.push(model.clone());
        }
        if let Some(start) = self.start_date {
            conditions.push("created_at >= ?");
            values.push(day_start(start));
        }
        if let Some(end) = self.end_date.and_then(|d| d.checked_add_days(Days::new(1))) {
            conditions.push("created_at < ?");
            values.push(day_start(end));
        }

        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), values)
        }
    }
}

fn day_start(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}

pub struct UsageStore {
    conn: SharedConnection,
}

impl UsageStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// 分页查询，按时间倒序
    pub fn list(&self, query: &UsageQuery) -> Result<UsagePage, StoreError> {
        let (where_clause, values) = query.where_clause();
        let conn = self.conn.lock();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM usage{where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let limit = query.page_size() as i64;
        let offset = (query.page() as i64 - 1) * limit;
        let mut bound: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
        bound.push(&limit);
        bound.push(&offset);

        let mut stmt = conn.prepare(&format!(
            "SELECT id, apikey_name, model_name, input_tokens, output_tokens, quota, created_at \
             FROM usage{where_clause} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(bound.as_slice(), |row| {
                Ok(UsageItem {
                    id: row.get(0)?,
                    apikey_name: row.get(1)?,
                    model_name: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                    quota: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UsagePage { total, items })
    }

    /// 按 Key + 模型聚合
    pub fn stats(&self) -> Result<Vec<UsageStatsRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT apikey_name, model_name, COUNT(*), COALESCE(SUM(input_tokens), 0), \
             COALESCE(SUM(output_tokens), 0), COALESCE(SUM(quota), 0) \
             FROM usage GROUP BY apikey_name, model_name ORDER BY apikey_name, model_name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UsageStatsRow {
                    apikey_name: row.get(0)?,
                    model_name: row.get(1)?,
                    requests: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                    quota: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl UsageLedger for UsageStore {
    fn insert(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO usage (apikey_name, apikey_value, model_name, input_tokens, output_tokens, quota, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.api_key_name,
                record.api_key_value,
                record.model_name,
                record.input_tokens,
                record.output_tokens,
                record.quota,
                format_timestamp(record.created_at),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn record(name: &str, model: &str, at: &str) -> UsageRecord {
        UsageRecord {
            api_key_name: name.to_string(),
            api_key_value: format!("bk-{name}"),
            model_name: model.to_string(),
            input_tokens: 10,
            output_tokens: 8,
            quota: 3,
            created_at: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
        }
    }

    fn seeded() -> UsageStore {
        let store = UsageStore::new(db::open_in_memory().unwrap());
        store.insert(&record("alice", "m1", "2026-03-01T10:00:00Z")).unwrap();
        store.insert(&record("alice", "m2", "2026-03-02T23:59:59Z")).unwrap();
        store.insert(&record("bob", "m1", "2026-03-03T00:00:00Z")).unwrap();
        store
    }

    #[test]
    fn test_list_newest_first() {
        let page = seeded().list(&UsageQuery::default()).unwrap();
        assert_eq!(page.total, 3);
        let names: Vec<_> = page.items.iter().map(|i| i.apikey_name.as_str()).collect();
        assert_eq!(names, vec!["bob", "alice", "alice"]);
        assert_eq!(page.items[0].created_at, "2026-03-03T00:00:00Z");
    }

    #[test]
    fn test_filters_and_inclusive_end_date() {
        let store = seeded();
        let query = UsageQuery {
            apikey_name: Some("alice".to_string()),
            end_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            ..Default::default()
        };
        let page = store.list(&query).unwrap();
        assert_eq!(page.total, 2);

        let query = UsageQuery {
            start_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            model_name: Some("m1".to_string()),
            ..Default::default()
        };
        let page = store.list(&query).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].apikey_name, "bob");
    }

    #[test]
    fn test_pagination() {
        let store = seeded();
        let query = UsageQuery {
            page: 2,
            page_size: 2,
            ..Default::default()
        };
        let page = store.list(&query).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);

        // 超过上限回落到默认值
        let query = UsageQuery {
            page_size: 1000,
            ..Default::default()
        };
        assert_eq!(store.list(&query).unwrap().items.len(), 3);
    }

    #[test]
    fn test_stats_grouping() {
        let rows = seeded().stats().unwrap();
        assert_eq!(rows.len(), 3);
        let alice_m1 = rows
            .iter()
            .find(|r| r.apikey_name == "alice" && r.model_name == "m1")
            .unwrap();
        assert_eq!(alice_m1.requests, 1);
        assert_eq!(alice_m1.input_tokens, 10);
        assert_eq!(alice_m1.quota, 3);
    }
}
