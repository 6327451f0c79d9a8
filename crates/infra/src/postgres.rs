//! Postgres-backed job store and scope locks.
//!
//! Every mutation is a single conditional statement (or, for replacing a
//! finished timer cycle, one transaction), so the version compare-and-set is
//! enforced by the database:
//!
//! ```sql
//! UPDATE jobs SET ..., version = version + 1
//! WHERE id = $1 AND version = $expected
//! RETURNING version
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! The [`JobStore`] trait is synchronous. Each call runs the async query on
//! the tokio runtime captured at construction via `Handle::block_on`, so the
//! store must be called from plain threads (the scheduler's own threads, or
//! `spawn_blocking`), never from inside an async task.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{instrument, Span};

use jobforge_core::{ExpectedVersion, JobId, ScopeId};
use jobforge_jobs::store::{JobQuery, JobStats, JobStore, LockResult, StoreError};
use jobforge_jobs::types::{Job, JobCategory};
use jobforge_jobs::ScopeLockManager;

const MIGRATION: &str = include_str!("../migrations/0001_create_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id, category, handler_type, handler_configuration, due_time,
    retries_remaining, lock_owner, lock_expiration_time, tenant_id, scope_id,
    is_exclusive, exception_info, repeat_expression, max_iterations, end_date,
    suspended_from, version, created_at, updated_at
"#;

/// Bridge from the synchronous store traits to sqlx.
#[derive(Debug, Clone)]
struct Db {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl Db {
    fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    fn from_current(pool: PgPool) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::storage(
                "postgres adapters require a tokio runtime; construct them inside one",
            )
        })?;
        Ok(Self::new(pool, handle))
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

/// Postgres-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    db: Db,
}

impl PostgresJobStore {
    /// Create a store running its queries on `handle`.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            db: Db::new(pool, handle),
        }
    }

    /// Create a store bound to the runtime of the calling task.
    pub fn from_current(pool: PgPool) -> Result<Self, StoreError> {
        Ok(Self {
            db: Db::from_current(pool)?,
        })
    }

    fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Create the `jobs` and `job_scope_locks` tables if missing.
    #[instrument(skip_all, err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job.id, category = %job.category), err)]
    pub async fn insert_job(&self, job: Job) -> Result<Job, StoreError> {
        let mut job = job;
        job.version = 1;

        let result = insert_statement(&job).execute(self.pool()).await;
        match result {
            Ok(_) => Ok(job),
            Err(e) => Err(map_insert_error(job.id, e)),
        }
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip_all, fields(category = %category, limit = limit, fetched = tracing::field::Empty), err)]
    pub async fn find_due_jobs(
        &self,
        category: JobCategory,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE category = $1
                AND (due_time IS NULL OR due_time <= $2)
                AND (lock_owner IS NULL
                     OR (lock_expiration_time IS NOT NULL AND lock_expiration_time <= $2))
            ORDER BY due_time ASC NULLS FIRST, id ASC
            LIMIT $3
            "#
        ))
        .bind(category.as_str())
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("find_due_jobs", e))?;

        Span::current().record("fetched", rows.len());
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip_all, fields(job_id = %id, owner = %owner), err)]
    pub async fn try_lock_job(
        &self,
        id: JobId,
        owner: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<LockResult, StoreError> {
        let locked: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET lock_owner = $2,
                lock_expiration_time = $3,
                version = version + 1,
                updated_at = $4
            WHERE id = $1
                AND category IN ('timer', 'executable')
                AND (lock_owner IS NULL
                     OR (lock_expiration_time IS NOT NULL AND lock_expiration_time <= $4))
            RETURNING version
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now + lease)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("try_lock_job", e))?;

        if let Some(version) = locked {
            return Ok(LockResult {
                acquired: true,
                current_version: version as u64,
            });
        }
        match self.current_version(id).await? {
            Some(version) => Ok(LockResult {
                acquired: false,
                current_version: version,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn current_version(&self, id: JobId) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;
        Ok(version.map(|v| v as u64))
    }

    #[instrument(skip_all, fields(job_id = %id, owner = %owner), err)]
    pub async fn release_job(
        &self,
        id: JobId,
        owner: &str,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = NULL,
                lock_expiration_time = NULL,
                version = version + 1,
                updated_at = $4
            WHERE id = $1 AND lock_owner = $2 AND version = $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(expected_version as i64)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("release_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(job_id = %id, owner = %owner), err)]
    pub async fn extend_job_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET lock_expiration_time = $3, version = version + 1, updated_at = $4
            WHERE id = $1 AND lock_owner = $2
            RETURNING version
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now + lease)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("extend_job_lock", e))?;
        Ok(version.map(|v| v as u64))
    }

    #[instrument(skip_all, fields(job_id = %job.id, expected_version = expected_version), err)]
    pub async fn update_job(&self, job: &Job, expected_version: u64) -> Result<u64, StoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET category = $3,
                handler_type = $4,
                handler_configuration = $5,
                due_time = $6,
                retries_remaining = $7,
                lock_owner = $8,
                lock_expiration_time = $9,
                tenant_id = $10,
                scope_id = $11,
                is_exclusive = $12,
                exception_info = $13,
                repeat_expression = $14,
                max_iterations = $15,
                end_date = $16,
                suspended_from = $17,
                updated_at = $18,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(expected_version as i64)
        .bind(job.category.as_str())
        .bind(&job.handler_type)
        .bind(&job.handler_configuration)
        .bind(job.due_time)
        .bind(job.retries_remaining as i32)
        .bind(&job.lock_owner)
        .bind(job.lock_expiration_time)
        .bind(&job.tenant_id)
        .bind(job.scope_id.map(uuid::Uuid::from))
        .bind(job.exclusive)
        .bind(&job.exception_info)
        .bind(&job.repeat)
        .bind(job.max_iterations.map(i64::from))
        .bind(job.end_date)
        .bind(job.suspended_from.map(|c| c.as_str()))
        .bind(job.updated_at)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if let Some(version) = version {
            return Ok(version as u64);
        }
        match self.current_version(job.id).await? {
            Some(found) => Err(StoreError::StaleVersion {
                id: job.id,
                expected: expected_version,
                found,
            }),
            None => Err(StoreError::NotFound(job.id)),
        }
    }

    #[instrument(skip_all, fields(job_id = %id, expected = ?expected), err)]
    pub async fn delete_job(&self, id: JobId, expected: ExpectedVersion) -> Result<bool, StoreError> {
        let deleted = match expected {
            ExpectedVersion::Any => sqlx::query("DELETE FROM jobs WHERE id = $1")
                .bind(id.as_uuid())
                .execute(self.pool())
                .await,
            ExpectedVersion::Exact(version) => {
                sqlx::query("DELETE FROM jobs WHERE id = $1 AND version = $2")
                    .bind(id.as_uuid())
                    .bind(version as i64)
                    .execute(self.pool())
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("delete_job", e))?;

        if deleted.rows_affected() > 0 {
            return Ok(true);
        }
        match (expected, self.current_version(id).await?) {
            (ExpectedVersion::Exact(expected), Some(found)) => {
                Err(StoreError::StaleVersion { id, expected, found })
            }
            _ => Ok(false),
        }
    }

    /// Delete the finished cycle and insert `next` in one transaction.
    #[instrument(skip_all, fields(job_id = %id, next_job_id = %next.id, expected_version = expected_version), err)]
    pub async fn replace_job_with_next_cycle(
        &self,
        id: JobId,
        expected_version: u64,
        next: Job,
    ) -> Result<Option<Job>, StoreError> {
        let mut next = next;
        next.version = 1;

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("replace_with_next_cycle", e))?;

        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1 AND version = $2")
            .bind(id.as_uuid())
            .bind(expected_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_with_next_cycle", e))?;

        if deleted.rows_affected() == 0 {
            let found: Option<i64> = sqlx::query_scalar("SELECT version FROM jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("replace_with_next_cycle", e))?;
            return match found {
                Some(found) => Err(StoreError::StaleVersion {
                    id,
                    expected: expected_version,
                    found: found as u64,
                }),
                None => Ok(None),
            };
        }

        insert_statement(&next)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(next.id, e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("replace_with_next_cycle", e))?;
        Ok(Some(next))
    }

    #[instrument(skip_all, err)]
    pub async fn find_expired_job_locks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE lock_expiration_time < $1
            ORDER BY lock_expiration_time ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("find_expired_job_locks", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip_all, err)]
    pub async fn find_stuck_job_locks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE lock_owner IS NOT NULL
                AND (lock_expiration_time IS NULL OR updated_at < $1)
            ORDER BY due_time ASC NULLS FIRST, id ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(sql_limit(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("find_stuck_job_locks", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    pub async fn reset_job_lock(
        &self,
        id: JobId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = NULL,
                lock_expiration_time = NULL,
                version = version + 1,
                updated_at = $3
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected_version as i64)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("reset_job_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, err)]
    pub async fn find_jobs(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR category = $1)
                AND ($2::uuid IS NULL OR scope_id = $2)
                AND ($3::text IS NULL OR handler_type = $3)
                AND ($4::text IS NULL OR tenant_id = $4)
                AND ($5::bool IS NULL OR (lock_owner IS NOT NULL) = $5)
            ORDER BY due_time ASC NULLS FIRST, id ASC
            LIMIT $6
            "#
        ))
        .bind(query.category.map(|c| c.as_str()))
        .bind(query.scope_id.map(uuid::Uuid::from))
        .bind(query.handler_type.as_deref())
        .bind(query.tenant_id.as_deref())
        .bind(query.locked)
        .bind(sql_limit(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("find_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip_all, fields(scope_id = %scope_id), err)]
    pub async fn delete_scope_jobs(&self, scope_id: ScopeId) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE scope_id = $1")
            .bind(scope_id.as_uuid())
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_scope_jobs", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip_all, err)]
    pub async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT category, COUNT(*) AS total, COUNT(lock_owner) AS locked
            FROM jobs
            GROUP BY category
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let category: String = row.try_get("category").map_err(row_error)?;
            let total: i64 = row.try_get("total").map_err(row_error)?;
            let locked: i64 = row.try_get("locked").map_err(row_error)?;
            let total = total as usize;
            match parse_category(&category)? {
                JobCategory::Timer => stats.timer = total,
                JobCategory::Executable => stats.executable = total,
                JobCategory::Suspended => stats.suspended = total,
                JobCategory::DeadLetter => stats.dead_letter = total,
            }
            stats.locked += locked as usize;
        }
        Ok(stats)
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<Job, StoreError> {
        self.db.block_on(self.insert_job(job))
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.db.block_on(self.get_job(id))
    }

    fn find_due(
        &self,
        category: JobCategory,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.db.block_on(self.find_due_jobs(category, now, limit))
    }

    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<LockResult, StoreError> {
        self.db.block_on(self.try_lock_job(id, owner, lease, now))
    }

    fn release(
        &self,
        id: JobId,
        owner: &str,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.db.block_on(self.release_job(id, owner, expected_version, now))
    }

    fn extend_lock(
        &self,
        id: JobId,
        owner: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, StoreError> {
        self.db.block_on(self.extend_job_lock(id, owner, lease, now))
    }

    fn update(&self, job: &Job, expected_version: u64) -> Result<u64, StoreError> {
        self.db.block_on(self.update_job(job, expected_version))
    }

    fn delete(&self, id: JobId, expected: ExpectedVersion) -> Result<bool, StoreError> {
        self.db.block_on(self.delete_job(id, expected))
    }

    fn replace_with_next_cycle(
        &self,
        id: JobId,
        expected_version: u64,
        next: Job,
    ) -> Result<Option<Job>, StoreError> {
        self.db
            .block_on(self.replace_job_with_next_cycle(id, expected_version, next))
    }

    fn find_expired_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.db.block_on(self.find_expired_job_locks(now, limit))
    }

    fn find_stuck_locks(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.db.block_on(self.find_stuck_job_locks(cutoff, limit))
    }

    fn reset_lock(
        &self,
        id: JobId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.db.block_on(self.reset_job_lock(id, expected_version, now))
    }

    fn find(&self, query: &JobQuery, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.db.block_on(self.find_jobs(query, limit))
    }

    fn delete_by_scope(&self, scope_id: ScopeId) -> Result<usize, StoreError> {
        self.db.block_on(self.delete_scope_jobs(scope_id))
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.db.block_on(self.job_stats())
    }
}

/// Scope locks in the `job_scope_locks` table.
#[derive(Debug, Clone)]
pub struct PostgresScopeLocks {
    db: Db,
}

impl PostgresScopeLocks {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            db: Db::new(pool, handle),
        }
    }

    pub fn from_current(pool: PgPool) -> Result<Self, StoreError> {
        Ok(Self {
            db: Db::from_current(pool)?,
        })
    }

    /// Upsert that only overwrites the same holder's lock or an expired one.
    #[instrument(skip_all, fields(scope_id = %scope_id, holder = %holder), err)]
    pub async fn extend_lock(
        &self,
        scope_id: ScopeId,
        holder: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_scope_locks (scope_id, lock_owner, lock_expiration_time)
            VALUES ($1, $2, $3)
            ON CONFLICT (scope_id) DO UPDATE
            SET lock_owner = EXCLUDED.lock_owner,
                lock_expiration_time = EXCLUDED.lock_expiration_time
            WHERE job_scope_locks.lock_owner = EXCLUDED.lock_owner
                OR job_scope_locks.lock_expiration_time <= $4
            "#,
        )
        .bind(scope_id.as_uuid())
        .bind(holder)
        .bind(now + lease)
        .bind(now)
        .execute(&*self.db.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_scope_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(scope_id = %scope_id, holder = %holder), err)]
    pub async fn clear_lock(&self, scope_id: ScopeId, holder: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM job_scope_locks WHERE scope_id = $1 AND lock_owner = $2")
                .bind(scope_id.as_uuid())
                .bind(holder)
                .execute(&*self.db.pool)
                .await
                .map_err(|e| map_sqlx_error("clear_scope_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(scope_id = %scope_id), err)]
    pub async fn lock_owner(
        &self,
        scope_id: ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar(
            r#"
            SELECT lock_owner FROM job_scope_locks
            WHERE scope_id = $1 AND lock_expiration_time > $2
            "#,
        )
        .bind(scope_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.db.pool)
        .await
        .map_err(|e| map_sqlx_error("scope_lock_owner", e))
    }
}

impl ScopeLockManager for PostgresScopeLocks {
    fn extend_scope_lock(
        &self,
        scope_id: ScopeId,
        holder: &str,
        lease: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.db.block_on(self.extend_lock(scope_id, holder, lease, now))
    }

    fn clear_scope_lock(&self, scope_id: ScopeId, holder: &str) -> Result<bool, StoreError> {
        self.db.block_on(self.clear_lock(scope_id, holder))
    }

    fn scope_lock_owner(
        &self,
        scope_id: ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        self.db.block_on(self.lock_owner(scope_id, now))
    }
}

fn insert_statement(job: &Job) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, category, handler_type, handler_configuration, due_time,
            retries_remaining, lock_owner, lock_expiration_time, tenant_id, scope_id,
            is_exclusive, exception_info, repeat_expression, max_iterations, end_date,
            suspended_from, version, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.category.as_str())
    .bind(&job.handler_type)
    .bind(&job.handler_configuration)
    .bind(job.due_time)
    .bind(job.retries_remaining as i32)
    .bind(&job.lock_owner)
    .bind(job.lock_expiration_time)
    .bind(&job.tenant_id)
    .bind(job.scope_id.map(uuid::Uuid::from))
    .bind(job.exclusive)
    .bind(&job.exception_info)
    .bind(&job.repeat)
    .bind(job.max_iterations.map(i64::from))
    .bind(job.end_date)
    .bind(job.suspended_from.map(|c| c.as_str()))
    .bind(job.version as i64)
    .bind(job.created_at)
    .bind(job.updated_at)
}

fn map_insert_error(id: JobId, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::AlreadyExists(id)
        }
        other => map_sqlx_error("insert_job", other),
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_category(raw: &str) -> Result<JobCategory, StoreError> {
    raw.parse::<JobCategory>().map_err(StoreError::Storage)
}

fn row_error(err: sqlx::Error) -> StoreError {
    StoreError::storage(format!("failed to decode job row: {err}"))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let category: String = row.try_get("category").map_err(row_error)?;
    let suspended_from: Option<String> = row.try_get("suspended_from").map_err(row_error)?;
    let retries: i32 = row.try_get("retries_remaining").map_err(row_error)?;
    let max_iterations: Option<i64> = row.try_get("max_iterations").map_err(row_error)?;
    let scope_id: Option<uuid::Uuid> = row.try_get("scope_id").map_err(row_error)?;
    let version: i64 = row.try_get("version").map_err(row_error)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(row_error)?),
        category: parse_category(&category)?,
        handler_type: row.try_get("handler_type").map_err(row_error)?,
        handler_configuration: row.try_get("handler_configuration").map_err(row_error)?,
        due_time: row.try_get("due_time").map_err(row_error)?,
        retries_remaining: u32::try_from(retries).unwrap_or(0),
        lock_owner: row.try_get("lock_owner").map_err(row_error)?,
        lock_expiration_time: row.try_get("lock_expiration_time").map_err(row_error)?,
        tenant_id: row.try_get("tenant_id").map_err(row_error)?,
        scope_id: scope_id.map(ScopeId::from_uuid),
        exclusive: row.try_get("is_exclusive").map_err(row_error)?,
        exception_info: row.try_get("exception_info").map_err(row_error)?,
        repeat: row.try_get("repeat_expression").map_err(row_error)?,
        max_iterations: max_iterations.map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        end_date: row.try_get("end_date").map_err(row_error)?,
        suspended_from: suspended_from.as_deref().map(parse_category).transpose()?,
        version: version as u64,
        created_at: row.try_get("created_at").map_err(row_error)?,
        updated_at: row.try_get("updated_at").map_err(row_error)?,
    })
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("-"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::storage(format!("timed out waiting for a connection in {operation}"))
        }
        other => StoreError::storage(format!("sqlx error in {operation}: {other}")),
    }
}
