//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    BlobDeletionRepo, CacheEntryRepo, CleanupPolicyRepo, RegistryRepo, RuleRepo, UpstreamRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    RegistryRepo
    + UpstreamRepo
    + RuleRepo
    + CacheEntryRepo
    + CleanupPolicyRepo
    + BlobDeletionRepo
    + Send
    + Sync
{
    /// Apply the embedded schema.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database and apply the schema.
    ///
    /// `query_timeout_secs` becomes the busy timeout; SQLite has no
    /// statement-level cancellation.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let busy_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(5));

        let in_memory = path.as_os_str() == ":memory:";
        if !in_memory && let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path.display())
        };
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            // One connection: SQLite serializes writers anyway, and an
            // in-memory database only exists on its own connection.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::UpstreamDeleteStats;
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use uuid::Uuid;
    use vreg_core::{MAX_RULES_PER_UPSTREAM, UpstreamOrder};

    // ---------------------------------------------------------------------
    // Ordering helpers (run inside a transaction)
    // ---------------------------------------------------------------------

    async fn load_registry_order(
        conn: &mut SqliteConnection,
        registry_id: Uuid,
    ) -> MetadataResult<UpstreamOrder> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            "SELECT upstream_id, position FROM registry_upstreams WHERE registry_id = ? ORDER BY position",
        )
        .bind(registry_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(UpstreamOrder::from_positions(rows))
    }

    async fn write_registry_order(
        conn: &mut SqliteConnection,
        registry_id: Uuid,
        order: &UpstreamOrder,
    ) -> MetadataResult<()> {
        sqlx::query("DELETE FROM registry_upstreams WHERE registry_id = ?")
            .bind(registry_id)
            .execute(&mut *conn)
            .await?;
        for (upstream_id, position) in order.positions() {
            sqlx::query(
                "INSERT INTO registry_upstreams (registry_id, upstream_id, position) VALUES (?, ?, ?)",
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

    async fn load_rule_order(
        conn: &mut SqliteConnection,
        upstream_id: Uuid,
    ) -> MetadataResult<UpstreamOrder> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            "SELECT rule_id, position FROM upstream_rules WHERE upstream_id = ? ORDER BY position",
        )
        .bind(upstream_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(UpstreamOrder::from_positions(rows).with_capacity_limit(MAX_RULES_PER_UPSTREAM))
    }

    /// Rewrite rule positions. Positions are first moved to negative values
    /// so the unique (upstream_id, position) index never sees a collision.
    async fn write_rule_order(
        conn: &mut SqliteConnection,
        upstream_id: Uuid,
        order: &UpstreamOrder,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE upstream_rules SET position = -position WHERE upstream_id = ?")
            .bind(upstream_id)
            .execute(&mut *conn)
            .await?;
        for (rule_id, position) in order.positions() {
            sqlx::query(
                "UPDATE upstream_rules SET position = ?, updated_at = CASE WHEN -position = ? THEN updated_at ELSE ? END WHERE rule_id = ?",
            )
            .bind(position)
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
        conn: &mut SqliteConnection,
        object_key: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO blob_deletions (object_key, enqueued_at, attempts, next_attempt_at, last_error) VALUES (?, ?, 0, ?, NULL)",
        )
        .bind(object_key)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Registries
    // ---------------------------------------------------------------------

    #[async_trait]
    impl RegistryRepo for SqliteStore {
        async fn create_registry(&self, registry: &RegistryRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO registries (registry_id, group_id, name, kind, enabled, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
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
            let row =
                sqlx::query_as::<_, RegistryRow>("SELECT * FROM registries WHERE registry_id = ?")
                    .bind(registry_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_registries(&self, group_id: Uuid) -> MetadataResult<Vec<RegistryRow>> {
            let rows = sqlx::query_as::<_, RegistryRow>(
                "SELECT * FROM registries WHERE group_id = ? ORDER BY name",
            )
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_registry(&self, registry: &RegistryRow) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE registries SET name = ?, enabled = ?, updated_at = ? WHERE registry_id = ?",
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
            sqlx::query("DELETE FROM registry_upstreams WHERE registry_id = ?")
                .bind(registry_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM registries WHERE registry_id = ?")
                .bind(registry_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        }
    }

    // ---------------------------------------------------------------------
    // Upstreams and ordering
    // ---------------------------------------------------------------------

    #[async_trait]
    impl UpstreamRepo for SqliteStore {
        async fn create_upstream(&self, upstream: &UpstreamRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upstreams (upstream_id, group_id, name, description, kind, url, credential_ref,
                                       cache_validity_hours, default_rule_action, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
            let row =
                sqlx::query_as::<_, UpstreamRow>("SELECT * FROM upstreams WHERE upstream_id = ?")
                    .bind(upstream_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn update_upstream(&self, upstream: &UpstreamRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE upstreams
                SET name = ?, description = ?, url = ?, credential_ref = ?,
                    cache_validity_hours = ?, default_rule_action = ?, updated_at = ?
                WHERE upstream_id = ?
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
                sqlx::query_scalar("SELECT upstream_id FROM upstreams WHERE upstream_id = ?")
                    .bind(upstream_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_none() {
                return Ok(None);
            }

            let registries: Vec<Uuid> = sqlx::query_scalar(
                "SELECT registry_id FROM registry_upstreams WHERE upstream_id = ?",
            )
            .bind(upstream_id)
            .fetch_all(&mut *tx)
            .await?;

            let enqueued = sqlx::query(
                r#"
                INSERT OR IGNORE INTO blob_deletions (object_key, enqueued_at, attempts, next_attempt_at, last_error)
                SELECT object_key, ?, 0, ?, NULL FROM cache_entries WHERE upstream_id = ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(upstream_id)
            .execute(&mut *tx)
            .await?;

            let deleted = sqlx::query("DELETE FROM cache_entries WHERE upstream_id = ?")
                .bind(upstream_id)
                .execute(&mut *tx)
                .await?;

            for registry_id in &registries {
                let mut order = load_registry_order(&mut tx, *registry_id).await?;
                order.remove(upstream_id)?;
                write_registry_order(&mut tx, *registry_id, &order).await?;
            }

            sqlx::query("DELETE FROM upstream_rules WHERE upstream_id = ?")
                .bind(upstream_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM upstreams WHERE upstream_id = ?")
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

            let registry =
                sqlx::query_as::<_, RegistryRow>("SELECT * FROM registries WHERE registry_id = ?")
                    .bind(registry_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("registry {registry_id}")))?;
            let upstream =
                sqlx::query_as::<_, UpstreamRow>("SELECT * FROM upstreams WHERE upstream_id = ?")
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

            let mut order = load_registry_order(&mut tx, registry_id).await?;
            let assigned = order.insert(upstream_id, position)?;
            write_registry_order(&mut tx, registry_id, &order).await?;
            tx.commit().await?;
            Ok(assigned)
        }

        async fn detach_upstream(
            &self,
            registry_id: Uuid,
            upstream_id: Uuid,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let mut order = load_registry_order(&mut tx, registry_id).await?;
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
            let mut order = load_registry_order(&mut tx, registry_id).await?;
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
                WHERE ru.registry_id = ?
                ORDER BY ru.position
                "#,
            )
            .bind(registry_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    // ---------------------------------------------------------------------
    // Rules
    // ---------------------------------------------------------------------

    #[async_trait]
    impl RuleRepo for SqliteStore {
        async fn create_rule(
            &self,
            rule: &RuleRow,
            position: Option<u32>,
        ) -> MetadataResult<RuleRow> {
            let mut tx = self.pool.begin().await?;

            let upstream_exists: Option<Uuid> =
                sqlx::query_scalar("SELECT upstream_id FROM upstreams WHERE upstream_id = ?")
                    .bind(rule.upstream_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if upstream_exists.is_none() {
                return Err(MetadataError::NotFound(format!(
                    "upstream {}",
                    rule.upstream_id
                )));
            }

            let mut order = load_rule_order(&mut tx, rule.upstream_id).await?;
            order
                .insert(rule.rule_id, position)
                .map_err(rule_limit_error)?;

            // Park the new row past the end; write_rule_order assigns its slot.
            sqlx::query(
                r#"
                INSERT INTO upstream_rules (rule_id, upstream_id, position, pattern, pattern_type, action, target, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
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

            let row = sqlx::query_as::<_, RuleRow>("SELECT * FROM upstream_rules WHERE rule_id = ?")
                .bind(rule.rule_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn get_rule(&self, rule_id: Uuid) -> MetadataResult<Option<RuleRow>> {
            let row = sqlx::query_as::<_, RuleRow>("SELECT * FROM upstream_rules WHERE rule_id = ?")
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_rules(&self, upstream_id: Uuid) -> MetadataResult<Vec<RuleRow>> {
            let rows = sqlx::query_as::<_, RuleRow>(
                "SELECT * FROM upstream_rules WHERE upstream_id = ? ORDER BY position",
            )
            .bind(upstream_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_rule(
            &self,
            rule: &RuleRow,
            position: Option<u32>,
        ) -> MetadataResult<RuleRow> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE upstream_rules
                SET pattern = ?, pattern_type = ?, action = ?, target = ?, updated_at = ?
                WHERE rule_id = ?
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
                let mut order = load_rule_order(&mut tx, rule.upstream_id).await?;
                order.move_to(rule.rule_id, position)?;
                write_rule_order(&mut tx, rule.upstream_id, &order, rule.updated_at).await?;
            }

            let row = sqlx::query_as::<_, RuleRow>("SELECT * FROM upstream_rules WHERE rule_id = ?")
                .bind(rule.rule_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn delete_rule(&self, rule_id: Uuid) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            let Some(upstream_id): Option<Uuid> =
                sqlx::query_scalar("SELECT upstream_id FROM upstream_rules WHERE rule_id = ?")
                    .bind(rule_id)
                    .fetch_optional(&mut *tx)
                    .await?
            else {
                return Ok(false);
            };

            sqlx::query("DELETE FROM upstream_rules WHERE rule_id = ?")
                .bind(rule_id)
                .execute(&mut *tx)
                .await?;
            let order = load_rule_order(&mut tx, upstream_id).await?;
            write_rule_order(&mut tx, upstream_id, &order, OffsetDateTime::now_utc()).await?;
            tx.commit().await?;
            Ok(true)
        }
    }

    // ---------------------------------------------------------------------
    // Cache entries
    // ---------------------------------------------------------------------

    #[async_trait]
    impl CacheEntryRepo for SqliteStore {
        async fn lookup_entry(
            &self,
            upstream_id: Uuid,
            relative_path: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE upstream_id = ? AND relative_path = ?",
            )
            .bind(upstream_id)
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_entry(&self, entry_id: Uuid) -> MetadataResult<Option<CacheEntryRow>> {
            let row =
                sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE entry_id = ?")
                    .bind(entry_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn upsert_entry(&self, entry: &NewCacheEntry) -> MetadataResult<CacheEntryRow> {
            let mut tx = self.pool.begin().await?;

            let previous_key: Option<String> = sqlx::query_scalar(
                "SELECT object_key FROM cache_entries WHERE upstream_id = ? AND relative_path = ?",
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
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 0, NULL, ?, ?)
                ON CONFLICT (upstream_id, relative_path) DO UPDATE SET
                    object_key = excluded.object_key,
                    size_bytes = excluded.size_bytes,
                    content_type = excluded.content_type,
                    etag = excluded.etag,
                    checksum_sha1 = excluded.checksum_sha1,
                    checksum_md5 = excluded.checksum_md5,
                    checksum_sha256 = excluded.checksum_sha256,
                    integrity_verified = excluded.integrity_verified,
                    needs_revalidation = 0,
                    upstream_checked_at = excluded.upstream_checked_at,
                    updated_at = excluded.updated_at
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
            .bind(entry.checked_at)
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
                "UPDATE cache_entries SET download_count = download_count + 1, last_downloaded_at = ? WHERE entry_id = ?",
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
                "DELETE FROM cache_entries WHERE upstream_id = ? AND relative_path = ? RETURNING *",
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
                SET upstream_checked_at = ?, needs_revalidation = 0,
                    etag = COALESCE(?, etag), updated_at = ?
                WHERE upstream_id = ? AND relative_path = ?
                RETURNING *
                "#,
            )
            .bind(at)
            .bind(etag)
            .bind(at)
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
                "UPDATE cache_entries SET needs_revalidation = 1 WHERE upstream_id = ? AND relative_path = ?",
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
                "SELECT * FROM cache_entries WHERE upstream_id = ? ORDER BY relative_path LIMIT ? OFFSET ?",
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
                WHERE group_id = ? AND COALESCE(last_downloaded_at, created_at) < ?
                ORDER BY COALESCE(last_downloaded_at, created_at)
                LIMIT ?
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
                WHERE entry_id = ? AND COALESCE(last_downloaded_at, created_at) < ?
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

    // ---------------------------------------------------------------------
    // Cleanup policies
    // ---------------------------------------------------------------------

    #[async_trait]
    impl CleanupPolicyRepo for SqliteStore {
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
                VALUES (?, ?, ?, ?, ?, ?, 'idle', ?, NULL, NULL, 0, 0, NULL, ?, ?)
                ON CONFLICT (group_id) DO UPDATE SET
                    enabled = excluded.enabled,
                    cadence_days = excluded.cadence_days,
                    keep_n_days_after_download = excluded.keep_n_days_after_download,
                    notify_on_success = excluded.notify_on_success,
                    notify_on_failure = excluded.notify_on_failure,
                    next_run_at = COALESCE(cleanup_policies.next_run_at, excluded.next_run_at),
                    updated_at = excluded.updated_at
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

        async fn get_cleanup_policy(
            &self,
            group_id: Uuid,
        ) -> MetadataResult<Option<CleanupPolicyRow>> {
            let row = sqlx::query_as::<_, CleanupPolicyRow>(
                "SELECT * FROM cleanup_policies WHERE group_id = ?",
            )
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn delete_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM cleanup_policies WHERE group_id = ?")
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
                WHERE enabled = 1 AND status != 'running'
                  AND (next_run_at IS NULL OR next_run_at <= ?)
                ORDER BY next_run_at
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
                SET status = 'running', last_run_started_at = ?, updated_at = ?
                WHERE group_id = ? AND enabled = 1 AND status != 'running'
                "#,
            )
            .bind(now)
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
                vreg_core::CleanupStatus::Completed => "?",
                _ => "COALESCE(next_run_at, ?)",
            };
            let sql = format!(
                r#"
                UPDATE cleanup_policies
                SET status = ?, last_run_at = ?, last_run_deleted_size = ?,
                    last_run_deleted_entries_count = ?, failure_message = ?,
                    next_run_at = {next_run_sql}, updated_at = ?
                WHERE group_id = ? AND status = 'running'
                "#
            );
            sqlx::query(&sql)
                .bind(record.status.as_str())
                .bind(record.finished_at)
                .bind(record.deleted_size)
                .bind(record.deleted_entries_count)
                .bind(&record.failure_message)
                .bind(record.next_run_at)
                .bind(record.finished_at)
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
            let running = sqlx::query_as::<_, CleanupPolicyRow>(
                r#"
                SELECT * FROM cleanup_policies
                WHERE status = 'running'
                  AND (last_run_started_at IS NULL OR last_run_started_at <= ?)
                "#,
            )
            .bind(started_before)
            .fetch_all(&self.pool)
            .await?;

            let mut recovered = 0;
            for policy in running {
                let next_run_at = policy.next_run_at.unwrap_or_else(|| {
                    vreg_core::cleanup::next_run_after(now, policy.cadence_days)
                });
                let result = sqlx::query(
                    r#"
                    UPDATE cleanup_policies
                    SET status = 'failed', failure_message = ?, next_run_at = ?, updated_at = ?
                    WHERE group_id = ? AND status = 'running'
                    "#,
                )
                .bind(ORPHANED_RUN_MESSAGE)
                .bind(next_run_at)
                .bind(now)
                .bind(policy.group_id)
                .execute(&self.pool)
                .await?;
                recovered += result.rows_affected();
            }
            Ok(recovered)
        }
    }

    // ---------------------------------------------------------------------
    // Blob deletion queue
    // ---------------------------------------------------------------------

    #[async_trait]
    impl BlobDeletionRepo for SqliteStore {
        async fn enqueue_blob_deletion(
            &self,
            object_key: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO blob_deletions (object_key, enqueued_at, attempts, next_attempt_at, last_error) VALUES (?, ?, 0, ?, NULL)",
            )
            .bind(object_key)
            .bind(now)
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
                WHERE next_attempt_at <= ? AND attempts < ?
                ORDER BY next_attempt_at
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(i64::from(max_attempts))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn complete_blob_deletion(&self, object_key: &str) -> MetadataResult<()> {
            sqlx::query("DELETE FROM blob_deletions WHERE object_key = ?")
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
                SET attempts = attempts + 1, last_error = ?, next_attempt_at = ?
                WHERE object_key = ?
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
                "SELECT * FROM blob_deletions WHERE attempts >= ? ORDER BY enqueued_at LIMIT ?",
            )
            .bind(i64::from(max_attempts))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

/// Failure message recorded on runs interrupted by a restart.
pub(crate) const ORPHANED_RUN_MESSAGE: &str = "cleanup run interrupted by process restart";

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS registries (
    registry_id BLOB PRIMARY KEY,
    group_id BLOB NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (group_id, name)
);
CREATE INDEX IF NOT EXISTS idx_registries_group ON registries(group_id);

CREATE TABLE IF NOT EXISTS upstreams (
    upstream_id BLOB PRIMARY KEY,
    group_id BLOB NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    kind TEXT NOT NULL,
    url TEXT NOT NULL,
    credential_ref TEXT,
    cache_validity_hours INTEGER NOT NULL DEFAULT 24,
    default_rule_action TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upstreams_group ON upstreams(group_id);

-- Ordered join: positions are 1-based and contiguous per registry
CREATE TABLE IF NOT EXISTS registry_upstreams (
    registry_id BLOB NOT NULL REFERENCES registries(registry_id) ON DELETE CASCADE,
    upstream_id BLOB NOT NULL REFERENCES upstreams(upstream_id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    PRIMARY KEY (registry_id, upstream_id),
    UNIQUE (registry_id, position)
);
CREATE INDEX IF NOT EXISTS idx_registry_upstreams_upstream ON registry_upstreams(upstream_id);

CREATE TABLE IF NOT EXISTS upstream_rules (
    rule_id BLOB PRIMARY KEY,
    upstream_id BLOB NOT NULL REFERENCES upstreams(upstream_id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    pattern TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    action TEXT NOT NULL,
    target TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (upstream_id, position)
);

CREATE TABLE IF NOT EXISTS cache_entries (
    entry_id BLOB PRIMARY KEY,
    upstream_id BLOB NOT NULL REFERENCES upstreams(upstream_id) ON DELETE CASCADE,
    group_id BLOB NOT NULL,
    relative_path TEXT NOT NULL,
    object_key TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_type TEXT,
    etag TEXT,
    checksum_sha1 TEXT NOT NULL,
    checksum_md5 TEXT,
    checksum_sha256 TEXT NOT NULL,
    integrity_verified INTEGER NOT NULL DEFAULT 0,
    needs_revalidation INTEGER NOT NULL DEFAULT 0,
    upstream_checked_at TEXT NOT NULL,
    download_count INTEGER NOT NULL DEFAULT 0,
    last_downloaded_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (upstream_id, relative_path)
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_group ON cache_entries(group_id);

CREATE TABLE IF NOT EXISTS cleanup_policies (
    group_id BLOB PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    cadence_days INTEGER NOT NULL,
    keep_n_days_after_download INTEGER NOT NULL,
    notify_on_success INTEGER NOT NULL DEFAULT 0,
    notify_on_failure INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'idle',
    next_run_at TEXT,
    last_run_started_at TEXT,
    last_run_at TEXT,
    last_run_deleted_size INTEGER NOT NULL DEFAULT 0,
    last_run_deleted_entries_count INTEGER NOT NULL DEFAULT 0,
    failure_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Blob deletion queue: object_key is the idempotency key
CREATE TABLE IF NOT EXISTS blob_deletions (
    object_key TEXT PRIMARY KEY,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_blob_deletions_due ON blob_deletions(next_attempt_at);
"#;
