//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{
    BlobDeletionRepo, CacheEntryRepo, CleanupPolicyRepo, RegistryRepo, RuleRepo,
    UpstreamDeleteStats, UpstreamRepo,
};
use crate::store::{MetadataStore, ORPHANED_RUN_MESSAGE};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::config::PgSslMode;
use vreg_core::{CleanupStatus, MAX_RULES_PER_UPSTREAM, UpstreamOrder};

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store. Required when several server instances
/// share one metadata database.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// the environment rather than a URL in a config file.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }
        if let Some(pass) = password {
            opts = opts.password(pass);
        }
        if let Some(mode) = ssl_mode {
            opts = opts.ssl_mode(match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            });
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Alias for `from_url`.
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        Self::from_url(url, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold several commands.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// Ordering helpers
// =============================================================================

/// Load a registry's ordering with the registry row locked, so concurrent
/// reorderings of the same registry serialize.
async fn lock_registry_order(
    conn: &mut PgConnection,
    registry_id: Uuid,
) -> MetadataResult<UpstreamOrder> {
    let locked: Option<Uuid> =
        sqlx::query_scalar("SELECT registry_id FROM registries WHERE registry_id = $1 FOR UPDATE")
            .bind(registry_id)
            .fetch_optional(&mut *conn)
            .await?;
    if locked.is_none() {
        return Err(MetadataError::NotFound(format!("registry {registry_id}")));
    }

    let rows: Vec<(Uuid, i32)> = sqlx::query_as(
        "SELECT upstream_id, position FROM registry_upstreams WHERE registry_id = $1 ORDER BY position",
    )
    .bind(registry_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(UpstreamOrder::from_positions(rows))
}

async fn write_registry_order(
    conn: &mut PgConnection,
    registry_id: Uuid,
    order: &UpstreamOrder,
) -> MetadataResult<()> {
    sqlx::query("DELETE FROM registry_upstreams WHERE registry_id = $1")
        .bind(registry_id)
        .execute(&mut *conn)
        .await?;
    for (upstream_id, position) in order.positions() {
        sqlx::query(
            "INSERT INTO registry_upstreams (registry_id, upstream_id, position) VALUES ($1, $2, $3)",
        )
        .bind(registry_id)
        .bind(upstream_id)
        .bind(position)
        .execute(&mut *conn)
        .await
        .map_err(|e| MetadataError::from_write(e, "write registry ordering"))?;
    }
    Ok(())
}

async fn lock_rule_order(
    conn: &mut PgConnection,
    upstream_id: Uuid,
) -> MetadataResult<UpstreamOrder> {
    let locked: Option<Uuid> =
        sqlx::query_scalar("SELECT upstream_id FROM upstreams WHERE upstream_id = $1 FOR UPDATE")
            .bind(upstream_id)
            .fetch_optional(&mut *conn)
            .await?;
    if locked.is_none() {
        return Err(MetadataError::NotFound(format!("upstream {upstream_id}")));
    }

    let rows: Vec<(Uuid, i32)> = sqlx::query_as(
        "SELECT rule_id, position FROM upstream_rules WHERE upstream_id = $1 ORDER BY position",
    )
    .bind(upstream_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(UpstreamOrder::from_positions(rows).with_capacity_limit(MAX_RULES_PER_UPSTREAM))
}

/// Positions go negative first so the (upstream_id, position) unique
/// constraint never sees two rows on one slot mid-rewrite.
async fn write_rule_order(
    conn: &mut PgConnection,
    upstream_id: Uuid,
    order: &UpstreamOrder,
    now: OffsetDateTime,
) -> MetadataResult<()> {
    sqlx::query("UPDATE upstream_rules SET position = -position WHERE upstream_id = $1")
        .bind(upstream_id)
        .execute(&mut *conn)
        .await?;
    for (rule_id, position) in order.positions() {
        sqlx::query(
            r#"
            UPDATE upstream_rules
            SET position = $1,
                updated_at = CASE WHEN -position = $1 THEN updated_at ELSE $2 END
            WHERE rule_id = $3
            "#,
        )
        .bind(position)
        .bind(now)
        .bind(rule_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn rule_limit_error(err: vreg_core::Error) -> MetadataError {
    match err {
        vreg_core::Error::TooManyUpstreams(max) => {
            MetadataError::Constraint(format!("at most {max} rules per upstream"))
        }
        other => other.into(),
    }
}

async fn enqueue_in_tx(
    conn: &mut PgConnection,
    object_key: &str,
    now: OffsetDateTime,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO blob_deletions (object_key, enqueued_at, attempts, next_attempt_at, last_error)
        VALUES ($1, $2, 0, $2, NULL)
        ON CONFLICT (object_key) DO NOTHING
        "#,
    )
    .bind(object_key)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// Registries
// =============================================================================

#[async_trait]
impl RegistryRepo for PostgresStore {
    async fn create_registry(&self, registry: &RegistryRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO registries (registry_id, group_id, name, kind, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(registry.registry_id)
        .bind(registry.group_id)
        .bind(&registry.name)
        .bind(&registry.kind)
        .bind(registry.enabled)
        .bind(registry.created_at)
        .bind(registry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MetadataError::from_write(e, "registry name already used in group"))?;
        Ok(())
    }

    async fn get_registry(&self, registry_id: Uuid) -> MetadataResult<Option<RegistryRow>> {
        let row = sqlx::query_as::<_, RegistryRow>("SELECT * FROM registries WHERE registry_id = $1")
            .bind(registry_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_registries(&self, group_id: Uuid) -> MetadataResult<Vec<RegistryRow>> {
        let rows = sqlx::query_as::<_, RegistryRow>(
            "SELECT * FROM registries WHERE group_id = $1 ORDER BY name",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_registry(&self, registry: &RegistryRow) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE registries SET name = $1, enabled = $2, updated_at = $3 WHERE registry_id = $4",
        )
        .bind(&registry.name)
        .bind(registry.enabled)
        .bind(registry.updated_at)
        .bind(registry.registry_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MetadataError::from_write(e, "registry name already used in group"))?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!(
                "registry {}",
                registry.registry_id
            )));
        }
        Ok(())
    }

    async fn delete_registry(&self, registry_id: Uuid) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM registry_upstreams WHERE registry_id = $1")
            .bind(registry_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM registries WHERE registry_id = $1")
            .bind(registry_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Upstreams
// =============================================================================

#[async_trait]
impl UpstreamRepo for PostgresStore {
    async fn create_upstream(&self, upstream: &UpstreamRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upstreams (upstream_id, group_id, name, description, kind, url, credential_ref,
                                   cache_validity_hours, default_rule_action, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(upstream.upstream_id)
        .bind(upstream.group_id)
        .bind(&upstream.name)
        .bind(&upstream.description)
        .bind(&upstream.kind)
        .bind(&upstream.url)
        .bind(&upstream.credential_ref)
        .bind(upstream.cache_validity_hours)
        .bind(&upstream.default_rule_action)
        .bind(upstream.created_at)
        .bind(upstream.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MetadataError::from_write(e, "create upstream"))?;
        Ok(())
    }

    async fn get_upstream(&self, upstream_id: Uuid) -> MetadataResult<Option<UpstreamRow>> {
        let row = sqlx::query_as::<_, UpstreamRow>("SELECT * FROM upstreams WHERE upstream_id = $1")
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_upstream(&self, upstream: &UpstreamRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE upstreams
            SET name = $1, description = $2, url = $3, credential_ref = $4,
                cache_validity_hours = $5, default_rule_action = $6, updated_at = $7
            WHERE upstream_id = $8
            "#,
        )
        .bind(&upstream.name)
        .bind(&upstream.description)
        .bind(&upstream.url)
        .bind(&upstream.credential_ref)
        .bind(upstream.cache_validity_hours)
        .bind(&upstream.default_rule_action)
        .bind(upstream.updated_at)
        .bind(upstream.upstream_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!(
                "upstream {}",
                upstream.upstream_id
            )));
        }
        Ok(())
    }

    async fn delete_upstream(
        &self,
        upstream_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<UpstreamDeleteStats>> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT upstream_id FROM upstreams WHERE upstream_id = $1 FOR UPDATE")
                .bind(upstream_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let registries: Vec<Uuid> = sqlx::query_scalar(
            "SELECT registry_id FROM registry_upstreams WHERE upstream_id = $1 ORDER BY registry_id",
        )
        .bind(upstream_id)
        .fetch_all(&mut *tx)
        .await?;

        let enqueued = sqlx::query(
            r#"
            INSERT INTO blob_deletions (object_key, enqueued_at, attempts, next_attempt_at, last_error)
            SELECT object_key, $1, 0, $1, NULL FROM cache_entries WHERE upstream_id = $2
            ON CONFLICT (object_key) DO NOTHING
            "#,
        )
        .bind(now)
        .bind(upstream_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM cache_entries WHERE upstream_id = $1")
            .bind(upstream_id)
            .execute(&mut *tx)
            .await?;

        for registry_id in &registries {
            let mut order = lock_registry_order(&mut tx, *registry_id).await?;
            order.remove(upstream_id)?;
            write_registry_order(&mut tx, *registry_id, &order).await?;
        }

        sqlx::query("DELETE FROM upstream_rules WHERE upstream_id = $1")
            .bind(upstream_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upstreams WHERE upstream_id = $1")
            .bind(upstream_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(UpstreamDeleteStats {
            entries_deleted: deleted.rows_affected(),
            blobs_enqueued: enqueued.rows_affected(),
            registries_detached: registries.len() as u64,
        }))
    }

    async fn attach_upstream(
        &self,
        registry_id: Uuid,
        upstream_id: Uuid,
        position: Option<u32>,
    ) -> MetadataResult<u32> {
        let mut tx = self.pool.begin().await?;

        let registry = sqlx::query_as::<_, RegistryRow>(
            "SELECT * FROM registries WHERE registry_id = $1",
        )
        .bind(registry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("registry {registry_id}")))?;
        let upstream = sqlx::query_as::<_, UpstreamRow>(
            "SELECT * FROM upstreams WHERE upstream_id = $1",
        )
        .bind(upstream_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("upstream {upstream_id}")))?;

        if registry.group_id != upstream.group_id {
            return Err(MetadataError::Constraint(
                "upstream belongs to a different group".to_string(),
            ));
        }
        if registry.kind != upstream.kind {
            return Err(MetadataError::Constraint(format!(
                "upstream kind {} does not match registry kind {}",
                upstream.kind, registry.kind
            )));
        }

        let mut order = lock_registry_order(&mut tx, registry_id).await?;
        let assigned = order.insert(upstream_id, position)?;
        write_registry_order(&mut tx, registry_id, &order).await?;
        tx.commit().await?;
        Ok(assigned)
    }

    async fn detach_upstream(&self, registry_id: Uuid, upstream_id: Uuid) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut order = lock_registry_order(&mut tx, registry_id).await?;
        order.remove(upstream_id).map_err(|_| {
            MetadataError::NotFound(format!(
                "upstream {upstream_id} is not attached to registry {registry_id}"
            ))
        })?;
        write_registry_order(&mut tx, registry_id, &order).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn move_upstream(
        &self,
        registry_id: Uuid,
        upstream_id: Uuid,
        position: u32,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut order = lock_registry_order(&mut tx, registry_id).await?;
        if order.position_of(upstream_id).is_none() {
            return Err(MetadataError::NotFound(format!(
                "upstream {upstream_id} is not attached to registry {registry_id}"
            )));
        }
        order.move_to(upstream_id, position)?;
        write_registry_order(&mut tx, registry_id, &order).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_registry_upstreams(
        &self,
        registry_id: Uuid,
    ) -> MetadataResult<Vec<PositionedUpstreamRow>> {
        let rows = sqlx::query_as::<_, PositionedUpstreamRow>(
            r#"
            SELECT ru.position, u.*
            FROM registry_upstreams ru
            JOIN upstreams u ON u.upstream_id = ru.upstream_id
            WHERE ru.registry_id = $1
            ORDER BY ru.position
            "#,
        )
        .bind(registry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// =============================================================================
// Rules
// =============================================================================

#[async_trait]
impl RuleRepo for PostgresStore {
    async fn create_rule(&self, rule: &RuleRow, position: Option<u32>) -> MetadataResult<RuleRow> {
        let mut tx = self.pool.begin().await?;

        let mut order = lock_rule_order(&mut tx, rule.upstream_id).await?;
        order
            .insert(rule.rule_id, position)
            .map_err(rule_limit_error)?;

        sqlx::query(
            r#"
            INSERT INTO upstream_rules (rule_id, upstream_id, position, pattern, pattern_type, action, target, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(rule.rule_id)
        .bind(rule.upstream_id)
        .bind(order.len() as i32 + 1)
        .bind(&rule.pattern)
        .bind(&rule.pattern_type)
        .bind(&rule.action)
        .bind(&rule.target)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| MetadataError::from_write(e, "create rule"))?;

        write_rule_order(&mut tx, rule.upstream_id, &order, rule.updated_at).await?;

        let row = sqlx::query_as::<_, RuleRow>("SELECT * FROM upstream_rules WHERE rule_id = $1")
            .bind(rule.rule_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn get_rule(&self, rule_id: Uuid) -> MetadataResult<Option<RuleRow>> {
        let row = sqlx::query_as::<_, RuleRow>("SELECT * FROM upstream_rules WHERE rule_id = $1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_rules(&self, upstream_id: Uuid) -> MetadataResult<Vec<RuleRow>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM upstream_rules WHERE upstream_id = $1 ORDER BY position",
        )
        .bind(upstream_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_rule(&self, rule: &RuleRow, position: Option<u32>) -> MetadataResult<RuleRow> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE upstream_rules
            SET pattern = $1, pattern_type = $2, action = $3, target = $4, updated_at = $5
            WHERE rule_id = $6
            "#,
        )
        .bind(&rule.pattern)
        .bind(&rule.pattern_type)
        .bind(&rule.action)
        .bind(&rule.target)
        .bind(rule.updated_at)
        .bind(rule.rule_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("rule {}", rule.rule_id)));
        }

        if let Some(position) = position {
            let mut order = lock_rule_order(&mut tx, rule.upstream_id).await?;
            order.move_to(rule.rule_id, position)?;
            write_rule_order(&mut tx, rule.upstream_id, &order, rule.updated_at).await?;
        }

        let row = sqlx::query_as::<_, RuleRow>("SELECT * FROM upstream_rules WHERE rule_id = $1")
            .bind(rule.rule_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn delete_rule(&self, rule_id: Uuid) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(upstream_id): Option<Uuid> =
            sqlx::query_scalar("SELECT upstream_id FROM upstream_rules WHERE rule_id = $1")
                .bind(rule_id)
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(false);
        };

        // Lock before deleting so a concurrent create sees the final order.
        lock_rule_order(&mut tx, upstream_id).await?;
        sqlx::query("DELETE FROM upstream_rules WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        let order = lock_rule_order(&mut tx, upstream_id).await?;
        write_rule_order(&mut tx, upstream_id, &order, OffsetDateTime::now_utc()).await?;
        tx.commit().await?;
        Ok(true)
    }
}

// =============================================================================
// Cache entries
// =============================================================================

#[async_trait]
impl CacheEntryRepo for PostgresStore {
    async fn lookup_entry(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
    ) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>(
            "SELECT * FROM cache_entries WHERE upstream_id = $1 AND relative_path = $2",
        )
        .bind(upstream_id)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_entry(&self, entry_id: Uuid) -> MetadataResult<Option<CacheEntryRow>> {
        let row =
            sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE entry_id = $1")
                .bind(entry_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn upsert_entry(&self, entry: &NewCacheEntry) -> MetadataResult<CacheEntryRow> {
        let mut tx = self.pool.begin().await?;

        let previous_key: Option<String> = sqlx::query_scalar(
            "SELECT object_key FROM cache_entries WHERE upstream_id = $1 AND relative_path = $2 FOR UPDATE",
        )
        .bind(entry.upstream_id)
        .bind(&entry.relative_path)
        .fetch_optional(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            INSERT INTO cache_entries (
                entry_id, upstream_id, group_id, relative_path, object_key, size_bytes,
                content_type, etag, checksum_sha1, checksum_md5, checksum_sha256,
                integrity_verified, needs_revalidation, upstream_checked_at,
                download_count, last_downloaded_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, FALSE, $13, 0, NULL, $13, $13)
            ON CONFLICT (upstream_id, relative_path) DO UPDATE SET
                object_key = EXCLUDED.object_key,
                size_bytes = EXCLUDED.size_bytes,
                content_type = EXCLUDED.content_type,
                etag = EXCLUDED.etag,
                checksum_sha1 = EXCLUDED.checksum_sha1,
                checksum_md5 = EXCLUDED.checksum_md5,
                checksum_sha256 = EXCLUDED.checksum_sha256,
                integrity_verified = EXCLUDED.integrity_verified,
                needs_revalidation = FALSE,
                upstream_checked_at = EXCLUDED.upstream_checked_at,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.upstream_id)
        .bind(entry.group_id)
        .bind(&entry.relative_path)
        .bind(&entry.object_key)
        .bind(entry.size_bytes)
        .bind(&entry.content_type)
        .bind(&entry.etag)
        .bind(&entry.checksum_sha1)
        .bind(&entry.checksum_md5)
        .bind(&entry.checksum_sha256)
        .bind(entry.integrity_verified)
        .bind(entry.checked_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| MetadataError::from_write(e, "upsert cache entry"))?;

        if let Some(old_key) = previous_key
            && old_key != entry.object_key
        {
            enqueue_in_tx(&mut tx, &old_key, entry.checked_at).await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    async fn record_download(&self, entry_id: Uuid, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE cache_entries SET download_count = download_count + 1, last_downloaded_at = $1 WHERE entry_id = $2",
        )
        .bind(at)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_entry(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<CacheEntryRow>> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query_as::<_, CacheEntryRow>(
            "DELETE FROM cache_entries WHERE upstream_id = $1 AND relative_path = $2 RETURNING *",
        )
        .bind(upstream_id)
        .bind(relative_path)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(entry) = &deleted {
            enqueue_in_tx(&mut tx, &entry.object_key, now).await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn touch_checked(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
        etag: Option<&str>,
        at: OffsetDateTime,
    ) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            UPDATE cache_entries
            SET upstream_checked_at = $1, needs_revalidation = FALSE,
                etag = COALESCE($2, etag), updated_at = $1
            WHERE upstream_id = $3 AND relative_path = $4
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(etag)
        .bind(upstream_id)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_needs_revalidation(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE cache_entries SET needs_revalidation = TRUE WHERE upstream_id = $1 AND relative_path = $2",
        )
        .bind(upstream_id)
        .bind(relative_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_entries_for_upstream(
        &self,
        upstream_id: Uuid,
        limit: u32,
        offset: u64,
    ) -> MetadataResult<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(
            "SELECT * FROM cache_entries WHERE upstream_id = $1 ORDER BY relative_path LIMIT $2 OFFSET $3",
        )
        .bind(upstream_id)
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_evictable(
        &self,
        group_id: Uuid,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            SELECT * FROM cache_entries
            WHERE group_id = $1 AND COALESCE(last_downloaded_at, created_at) < $2
            ORDER BY COALESCE(last_downloaded_at, created_at)
            LIMIT $3
            "#,
        )
        .bind(group_id)
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_if_evictable(
        &self,
        entry_id: Uuid,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<CacheEntryRow>> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            DELETE FROM cache_entries
            WHERE entry_id = $1 AND COALESCE(last_downloaded_at, created_at) < $2
            RETURNING *
            "#,
        )
        .bind(entry_id)
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(entry) = &deleted {
            enqueue_in_tx(&mut tx, &entry.object_key, now).await?;
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

// =============================================================================
// Cleanup policies
// =============================================================================

#[async_trait]
impl CleanupPolicyRepo for PostgresStore {
    async fn upsert_cleanup_policy(
        &self,
        policy: &CleanupPolicyRow,
    ) -> MetadataResult<CleanupPolicyRow> {
        let row = sqlx::query_as::<_, CleanupPolicyRow>(
            r#"
            INSERT INTO cleanup_policies (
                group_id, enabled, cadence_days, keep_n_days_after_download,
                notify_on_success, notify_on_failure, status, next_run_at,
                last_run_started_at, last_run_at, last_run_deleted_size,
                last_run_deleted_entries_count, failure_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'idle', $7, NULL, NULL, 0, 0, NULL, $8, $9)
            ON CONFLICT (group_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                cadence_days = EXCLUDED.cadence_days,
                keep_n_days_after_download = EXCLUDED.keep_n_days_after_download,
                notify_on_success = EXCLUDED.notify_on_success,
                notify_on_failure = EXCLUDED.notify_on_failure,
                next_run_at = COALESCE(cleanup_policies.next_run_at, EXCLUDED.next_run_at),
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(policy.group_id)
        .bind(policy.enabled)
        .bind(policy.cadence_days)
        .bind(policy.keep_n_days_after_download)
        .bind(policy.notify_on_success)
        .bind(policy.notify_on_failure)
        .bind(policy.next_run_at)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<Option<CleanupPolicyRow>> {
        let row = sqlx::query_as::<_, CleanupPolicyRow>(
            "SELECT * FROM cleanup_policies WHERE group_id = $1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM cleanup_policies WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due_cleanup_policies(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<CleanupPolicyRow>> {
        let rows = sqlx::query_as::<_, CleanupPolicyRow>(
            r#"
            SELECT * FROM cleanup_policies
            WHERE enabled AND status <> 'running'
              AND (next_run_at IS NULL OR next_run_at <= $1)
            ORDER BY next_run_at NULLS FIRST
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn try_begin_cleanup_run(
        &self,
        group_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cleanup_policies
            SET status = 'running', last_run_started_at = $1, updated_at = $1
            WHERE group_id = $2 AND enabled AND status <> 'running'
            "#,
        )
        .bind(now)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_cleanup_run(
        &self,
        group_id: Uuid,
        record: &CleanupRunRecord,
    ) -> MetadataResult<()> {
        let next_run_sql = match record.status {
            CleanupStatus::Completed => "$6",
            _ => "COALESCE(next_run_at, $6)",
        };
        let sql = format!(
            r#"
            UPDATE cleanup_policies
            SET status = $1, last_run_at = $2, last_run_deleted_size = $3,
                last_run_deleted_entries_count = $4, failure_message = $5,
                next_run_at = {next_run_sql}, updated_at = $2
            WHERE group_id = $7 AND status = 'running'
            "#
        );
        sqlx::query(&sql)
            .bind(record.status.as_str())
            .bind(record.finished_at)
            .bind(record.deleted_size)
            .bind(record.deleted_entries_count)
            .bind(&record.failure_message)
            .bind(record.next_run_at)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recover_orphaned_cleanup_runs(
        &self,
        started_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cleanup_policies
            SET status = 'failed',
                failure_message = $1,
                next_run_at = COALESCE(next_run_at, $2 + make_interval(days => cadence_days)),
                updated_at = $2
            WHERE status = 'running'
              AND (last_run_started_at IS NULL OR last_run_started_at <= $3)
            "#,
        )
        .bind(ORPHANED_RUN_MESSAGE)
        .bind(now)
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Blob deletion queue
// =============================================================================

#[async_trait]
impl BlobDeletionRepo for PostgresStore {
    async fn enqueue_blob_deletion(
        &self,
        object_key: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO blob_deletions (object_key, enqueued_at, attempts, next_attempt_at, last_error)
            VALUES ($1, $2, 0, $2, NULL)
            ON CONFLICT (object_key) DO NOTHING
            "#,
        )
        .bind(object_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_due_blob_deletions(
        &self,
        now: OffsetDateTime,
        max_attempts: u32,
        limit: u32,
    ) -> MetadataResult<Vec<BlobDeletionRow>> {
        let rows = sqlx::query_as::<_, BlobDeletionRow>(
            r#"
            SELECT * FROM blob_deletions
            WHERE next_attempt_at <= $1 AND attempts < $2
            ORDER BY next_attempt_at
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn complete_blob_deletion(&self, object_key: &str) -> MetadataResult<()> {
        sqlx::query("DELETE FROM blob_deletions WHERE object_key = $1")
            .bind(object_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_blob_deletion(
        &self,
        object_key: &str,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> MetadataResult<i32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE blob_deletions
            SET attempts = attempts + 1, last_error = $1, next_attempt_at = $2
            WHERE object_key = $3
            RETURNING attempts
            "#,
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await?;
        attempts.ok_or_else(|| MetadataError::NotFound(format!("blob deletion {object_key}")))
    }

    async fn list_parked_blob_deletions(
        &self,
        max_attempts: u32,
        limit: u32,
    ) -> MetadataResult<Vec<BlobDeletionRow>> {
        let rows = sqlx::query_as::<_, BlobDeletionRow>(
            "SELECT * FROM blob_deletions WHERE attempts >= $1 ORDER BY enqueued_at LIMIT $2",
        )
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_schema_statements_skips_empty_and_comment_only() {
        let schema = r#"
            -- comment only

            CREATE TABLE foo (id int);
            ;
            -- another comment
            CREATE TABLE bar (id int);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE foo"));
        assert!(statements[1].contains("CREATE TABLE bar"));
    }

    #[test]
    fn embedded_schema_creates_every_table() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        for table in [
            "registries",
            "upstreams",
            "registry_upstreams",
            "upstream_rules",
            "cache_entries",
            "cleanup_policies",
            "blob_deletions",
        ] {
            let needle = format!("CREATE TABLE IF NOT EXISTS {table} (");
            assert!(
                statements.iter().any(|s| s.contains(&needle)),
                "missing table {table}"
            );
        }
    }
}
