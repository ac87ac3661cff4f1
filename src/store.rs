//! SQLite persistence for providers, endpoints, pool configs and logs.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::GatewayError;
use crate::health::{EndpointState, ProviderCounters};
use crate::logsink::LogEntry;
use crate::registry::{ApiFormat, Endpoint, PoolConfig, PoolTag, Provider};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    base_url TEXT NOT NULL,
    api_key TEXT NOT NULL,
    api_format TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    total INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    error INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
    upstream_model TEXT NOT NULL,
    pool TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    weight INTEGER NOT NULL DEFAULT 1,
    min_interval_secs INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    error INTEGER NOT NULL DEFAULT 0,
    avg_latency_ms REAL NOT NULL DEFAULT 0,
    cooldown_until TEXT,
    last_error TEXT,
    last_used TEXT,
    UNIQUE(provider_id, upstream_model, pool)
);

CREATE INDEX IF NOT EXISTS idx_endpoints_pool ON endpoints(pool);

CREATE TABLE IF NOT EXISTS pool_configs (
    pool TEXT PRIMARY KEY NOT NULL,
    virtual_model TEXT NOT NULL,
    cooldown_secs INTEGER NOT NULL DEFAULT 60,
    timeout_secs INTEGER NOT NULL DEFAULT 60,
    max_retries INTEGER
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pool TEXT NOT NULL,
    requested_model TEXT NOT NULL,
    actual_model TEXT NOT NULL,
    provider_name TEXT NOT NULL,
    success INTEGER NOT NULL,
    http_status INTEGER,
    error TEXT,
    latency_ms INTEGER NOT NULL,
    input_tokens INTEGER,
    output_tokens INTEGER,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_created ON logs(id DESC);
"#;

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Filter for log paging.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub pool: Option<PoolTag>,
    pub success: Option<bool>,
    pub provider_name: Option<String>,
}

/// SQLite-backed store. One connection, serialised behind an async mutex;
/// hot-path writes arrive through the log sink's writer task.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert the three pool config rows on first boot, leaving existing
    /// rows untouched.
    pub async fn seed_pool_configs(&self, config: &Config) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        for tag in PoolTag::ALL {
            conn.execute(
                "INSERT OR IGNORE INTO pool_configs (pool, virtual_model, cooldown_secs, timeout_secs, max_retries)
                 VALUES (?1, ?2, ?3, 60, NULL)",
                params![
                    tag.as_str(),
                    config.virtual_model(tag),
                    config.default_cooldown_secs as i64
                ],
            )?;
        }
        Ok(())
    }

    pub async fn load_providers(&self) -> Result<Vec<(Provider, ProviderCounters)>, GatewayError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, base_url, api_key, api_format, enabled, total, success, error, created_at
             FROM providers ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let format_raw: String = row.get(4)?;
            let created_raw: String = row.get(9)?;
            Ok((
                Provider {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    base_url: row.get(2)?,
                    api_key: row.get(3)?,
                    api_format: ApiFormat::from_str(&format_raw).unwrap_or(ApiFormat::OpenAi),
                    enabled: row.get::<_, i64>(5)? != 0,
                    created_at: parse_time(&created_raw).unwrap_or_else(Utc::now),
                },
                ProviderCounters {
                    total: row.get::<_, i64>(6)? as u64,
                    success: row.get::<_, i64>(7)? as u64,
                    error: row.get::<_, i64>(8)? as u64,
                },
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn load_endpoints(&self) -> Result<Vec<(Endpoint, EndpointState)>, GatewayError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, provider_id, upstream_model, pool, enabled, weight, min_interval_secs,
                    priority, total, success, error, avg_latency_ms, cooldown_until, last_error, last_used
             FROM endpoints ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let pool_raw: String = row.get(3)?;
            Ok((
                Endpoint {
                    id: row.get(0)?,
                    provider_id: row.get(1)?,
                    upstream_model: row.get(2)?,
                    pool: PoolTag::from_str(&pool_raw).unwrap_or(PoolTag::Normal),
                    enabled: row.get::<_, i64>(4)? != 0,
                    weight: row.get::<_, i64>(5)?.max(1) as u32,
                    min_interval_secs: row.get::<_, i64>(6)?.max(0) as u32,
                    priority: row.get::<_, i64>(7)? as i32,
                },
                EndpointState {
                    total: row.get::<_, i64>(8)? as u64,
                    success: row.get::<_, i64>(9)? as u64,
                    error: row.get::<_, i64>(10)? as u64,
                    avg_latency_ms: row.get(11)?,
                    cooldown_until: row
                        .get::<_, Option<String>>(12)?
                        .as_deref()
                        .and_then(parse_time),
                    last_error: row.get(13)?,
                    last_used: row
                        .get::<_, Option<String>>(14)?
                        .as_deref()
                        .and_then(parse_time),
                },
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn load_pool_configs(&self) -> Result<Vec<(PoolTag, PoolConfig)>, GatewayError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT pool, virtual_model, cooldown_secs, timeout_secs, max_retries FROM pool_configs",
        )?;
        let rows = stmt.query_map([], |row| {
            let pool_raw: String = row.get(0)?;
            Ok((
                pool_raw,
                PoolConfig {
                    virtual_model: row.get(1)?,
                    cooldown_secs: row.get::<_, i64>(2)?.max(0) as u64,
                    timeout_secs: row.get::<_, i64>(3)?.max(0) as u64,
                    max_retries: row.get::<_, Option<i64>>(4)?.map(|n| n.max(0) as u32),
                },
            ))
        })?;
        let mut configs = Vec::new();
        for row in rows {
            let (raw, config) = row?;
            if let Ok(tag) = PoolTag::from_str(&raw) {
                configs.push((tag, config));
            }
        }
        configs.sort_by_key(|(tag, _)| *tag);
        Ok(configs)
    }

    pub async fn create_provider(
        &self,
        name: &str,
        base_url: &str,
        api_key: &str,
        api_format: ApiFormat,
    ) -> Result<Provider, GatewayError> {
        let created_at = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO providers (name, base_url, api_key, api_format, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![name, base_url, api_key, api_format.as_str(), fmt_time(created_at)],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Provider {
            id,
            name: name.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            api_format,
            enabled: true,
            created_at,
        })
    }

    pub async fn update_provider(&self, provider: &Provider) -> Result<bool, GatewayError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE providers SET name = ?1, base_url = ?2, api_key = ?3, api_format = ?4, enabled = ?5
             WHERE id = ?6",
            params![
                provider.name,
                provider.base_url,
                provider.api_key,
                provider.api_format.as_str(),
                provider.enabled as i64,
                provider.id
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a provider and its endpoints in one transaction.
    pub async fn delete_provider(&self, id: i64) -> Result<bool, GatewayError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM endpoints WHERE provider_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    pub async fn create_endpoint(&self, draft: Endpoint) -> Result<Endpoint, GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO endpoints (provider_id, upstream_model, pool, enabled, weight, min_interval_secs, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                draft.provider_id,
                draft.upstream_model,
                draft.pool.as_str(),
                draft.enabled as i64,
                draft.weight as i64,
                draft.min_interval_secs as i64,
                draft.priority as i64
            ],
        )?;
        Ok(Endpoint {
            id: conn.last_insert_rowid(),
            ..draft
        })
    }

    pub async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<bool, GatewayError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE endpoints SET upstream_model = ?1, pool = ?2, enabled = ?3, weight = ?4,
                    min_interval_secs = ?5, priority = ?6
             WHERE id = ?7",
            params![
                endpoint.upstream_model,
                endpoint.pool.as_str(),
                endpoint.enabled as i64,
                endpoint.weight as i64,
                endpoint.min_interval_secs as i64,
                endpoint.priority as i64,
                endpoint.id
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_endpoint(&self, id: i64) -> Result<bool, GatewayError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM endpoints WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub async fn set_pool_config(
        &self,
        tag: PoolTag,
        config: &PoolConfig,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pool_configs (pool, virtual_model, cooldown_secs, timeout_secs, max_retries)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pool) DO UPDATE SET
                 virtual_model = excluded.virtual_model,
                 cooldown_secs = excluded.cooldown_secs,
                 timeout_secs = excluded.timeout_secs,
                 max_retries = excluded.max_retries",
            params![
                tag.as_str(),
                config.virtual_model,
                config.cooldown_secs as i64,
                config.timeout_secs as i64,
                config.max_retries.map(|n| n as i64)
            ],
        )?;
        Ok(())
    }

    pub async fn update_endpoint_health(
        &self,
        endpoint_id: i64,
        state: &EndpointState,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE endpoints SET total = ?1, success = ?2, error = ?3, avg_latency_ms = ?4,
                    cooldown_until = ?5, last_error = ?6, last_used = ?7
             WHERE id = ?8",
            params![
                state.total as i64,
                state.success as i64,
                state.error as i64,
                state.avg_latency_ms,
                state.cooldown_until.map(fmt_time),
                state.last_error,
                state.last_used.map(fmt_time),
                endpoint_id
            ],
        )?;
        Ok(())
    }

    pub async fn update_provider_counters(
        &self,
        provider_id: i64,
        counters: &ProviderCounters,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE providers SET total = ?1, success = ?2, error = ?3 WHERE id = ?4",
            params![
                counters.total as i64,
                counters.success as i64,
                counters.error as i64,
                provider_id
            ],
        )?;
        Ok(())
    }

    /// Append a log entry and evict the oldest rows past the soft cap.
    pub async fn append_log(&self, entry: &LogEntry, cap: usize) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO logs (pool, requested_model, actual_model, provider_name, success,
                               http_status, error, latency_ms, input_tokens, output_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.pool.as_str(),
                entry.requested_model,
                entry.actual_model,
                entry.provider_name,
                entry.success as i64,
                entry.http_status.map(|s| s as i64),
                entry.error,
                entry.latency_ms as i64,
                entry.input_tokens.map(|n| n as i64),
                entry.output_tokens.map(|n| n as i64),
                fmt_time(entry.created_at)
            ],
        )?;
        conn.execute(
            "DELETE FROM logs WHERE id <= (SELECT MAX(id) FROM logs) - ?1",
            params![cap as i64],
        )?;
        Ok(())
    }

    /// Page the log, newest first, with optional filters. Returns the page
    /// and the total matching row count.
    pub async fn page_logs(
        &self,
        filter: &LogFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<LogEntry>, u64), GatewayError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(pool) = filter.pool {
            clauses.push(format!("pool = ?{}", args.len() + 1));
            args.push(pool.as_str().to_string());
        }
        if let Some(success) = filter.success {
            clauses.push(format!("success = {}", success as i64));
        }
        if let Some(provider) = &filter.provider_name {
            clauses.push(format!("provider_name = ?{}", args.len() + 1));
            args.push(provider.clone());
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().await;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM logs {}", where_sql),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT id, pool, requested_model, actual_model, provider_name, success, http_status,
                    error, latency_ms, input_tokens, output_tokens, created_at
             FROM logs {} ORDER BY id DESC LIMIT {} OFFSET {}",
            where_sql, limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            let pool_raw: String = row.get(1)?;
            let created_raw: String = row.get(11)?;
            Ok(LogEntry {
                id: row.get(0)?,
                pool: PoolTag::from_str(&pool_raw).unwrap_or(PoolTag::Normal),
                requested_model: row.get(2)?,
                actual_model: row.get(3)?,
                provider_name: row.get(4)?,
                success: row.get::<_, i64>(5)? != 0,
                http_status: row.get::<_, Option<i64>>(6)?.map(|s| s as u16),
                error: row.get(7)?,
                latency_ms: row.get::<_, i64>(8)? as u64,
                input_tokens: row.get::<_, Option<i64>>(9)?.map(|n| n as u64),
                output_tokens: row.get::<_, Option<i64>>(10)?.map(|n| n as u64),
                created_at: parse_time(&created_raw).unwrap_or_else(Utc::now),
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok((entries, total as u64))
    }

    pub async fn clear_logs(&self) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM logs", [])?;
        Ok(())
    }

    /// Endpoint health snapshot straight from the store, used by tests and
    /// the stats endpoint after restart.
    pub async fn endpoint_health(&self, id: i64) -> Result<Option<EndpointState>, GatewayError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT total, success, error, avg_latency_ms, cooldown_until, last_error, last_used
             FROM endpoints WHERE id = ?1",
            params![id],
            |row| {
                Ok(EndpointState {
                    total: row.get::<_, i64>(0)? as u64,
                    success: row.get::<_, i64>(1)? as u64,
                    error: row.get::<_, i64>(2)? as u64,
                    avg_latency_ms: row.get(3)?,
                    cooldown_until: row
                        .get::<_, Option<String>>(4)?
                        .as_deref()
                        .and_then(parse_time),
                    last_error: row.get(5)?,
                    last_used: row
                        .get::<_, Option<String>>(6)?
                        .as_deref()
                        .and_then(parse_time),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, success: bool) -> LogEntry {
        LogEntry {
            id: 0,
            pool: PoolTag::Normal,
            requested_model: "sonnet".into(),
            actual_model: "m".into(),
            provider_name: provider.into(),
            success,
            http_status: if success { Some(200) } else { Some(500) },
            error: (!success).then(|| "HTTP 500".to_string()),
            latency_ms: 40,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_provider_endpoint_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let provider = store
            .create_provider("acme", "https://api.acme.dev/v1", "sk-1", ApiFormat::OpenAi)
            .await
            .unwrap();
        assert!(provider.id > 0);

        let endpoint = store
            .create_endpoint(Endpoint::new(0, provider.id, "acme-large", PoolTag::Advanced).with_weight(3))
            .await
            .unwrap();
        assert!(endpoint.id > 0);

        let loaded = store.load_endpoints().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.weight, 3);
        assert_eq!(loaded[0].0.pool, PoolTag::Advanced);
    }

    #[tokio::test]
    async fn test_uniqueness_constraint() {
        let store = Store::open_in_memory().unwrap();
        let provider = store
            .create_provider("acme", "https://api.acme.dev/v1", "sk-1", ApiFormat::OpenAi)
            .await
            .unwrap();
        let draft = Endpoint::new(0, provider.id, "m", PoolTag::Tool);
        store.create_endpoint(draft.clone()).await.unwrap();
        assert!(store.create_endpoint(draft.clone()).await.is_err());

        // Same model in a different pool is fine.
        let other = Endpoint::new(0, provider.id, "m", PoolTag::Normal);
        assert!(store.create_endpoint(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_provider_cascades() {
        let store = Store::open_in_memory().unwrap();
        let provider = store
            .create_provider("acme", "https://api.acme.dev/v1", "sk-1", ApiFormat::OpenAi)
            .await
            .unwrap();
        store
            .create_endpoint(Endpoint::new(0, provider.id, "m", PoolTag::Tool))
            .await
            .unwrap();

        assert!(store.delete_provider(provider.id).await.unwrap());
        assert!(store.load_endpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_persistence_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let provider = store
            .create_provider("acme", "https://api.acme.dev/v1", "sk-1", ApiFormat::OpenAi)
            .await
            .unwrap();
        let endpoint = store
            .create_endpoint(Endpoint::new(0, provider.id, "m", PoolTag::Tool))
            .await
            .unwrap();

        let state = EndpointState {
            total: 10,
            success: 8,
            error: 2,
            avg_latency_ms: 123.5,
            cooldown_until: Some(Utc::now() + chrono::Duration::seconds(60)),
            last_error: Some("HTTP 503".into()),
            last_used: Some(Utc::now()),
        };
        store.update_endpoint_health(endpoint.id, &state).await.unwrap();

        let loaded = store.endpoint_health(endpoint.id).await.unwrap().unwrap();
        assert_eq!(loaded.total, 10);
        assert_eq!(loaded.success, 8);
        assert!(loaded.cooldown_until.is_some());
        assert_eq!(loaded.last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_log_paging_and_filters() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store.append_log(&entry("p1", i % 2 == 0), 100).await.unwrap();
        }
        store.append_log(&entry("p2", true), 100).await.unwrap();

        let (page, total) = store
            .page_logs(&LogFilter::default(), 0, 3)
            .await
            .unwrap();
        assert_eq!(total, 6);
        assert_eq!(page.len(), 3);
        // Newest first.
        assert!(page[0].id > page[1].id);

        let (_, failures) = store
            .page_logs(
                &LogFilter {
                    success: Some(false),
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(failures, 2);

        let (by_provider, n) = store
            .page_logs(
                &LogFilter {
                    provider_name: Some("p2".into()),
                    ..Default::default()
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(by_provider[0].provider_name, "p2");
    }

    #[tokio::test]
    async fn test_log_cap_evicts_oldest() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..10 {
            store.append_log(&entry("p", true), 4).await.unwrap();
        }
        let (page, total) = store.page_logs(&LogFilter::default(), 0, 100).await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(page.len(), 4);
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let store = Store::open_in_memory().unwrap();
        store.append_log(&entry("p", true), 100).await.unwrap();
        store.clear_logs().await.unwrap();
        let (_, total) = store.page_logs(&LogFilter::default(), 0, 10).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .create_provider("acme", "https://api.acme.dev/v1", "sk-1", ApiFormat::OpenAi)
                .await
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let providers = store.load_providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].0.name, "acme");
    }

    #[tokio::test]
    async fn test_pool_config_seed_and_update() {
        let store = Store::open_in_memory().unwrap();
        store.seed_pool_configs(&Config::default()).await.unwrap();

        let configs = store.load_pool_configs().await.unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[0].1.virtual_model, "haiku");

        let mut updated = configs[1].1.clone();
        updated.cooldown_secs = 120;
        store.set_pool_config(PoolTag::Normal, &updated).await.unwrap();

        // Seeding again must not clobber the update.
        store.seed_pool_configs(&Config::default()).await.unwrap();
        let configs = store.load_pool_configs().await.unwrap();
        assert_eq!(configs[1].1.cooldown_secs, 120);
    }
}
