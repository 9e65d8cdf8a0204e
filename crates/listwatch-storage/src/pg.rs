use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listwatch_core::{CommitReceipt, RunCommit, RunLease, Strictness, Task, TaskLog, TaskLogEntry};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{StoreError, TaskStore};

const TASK_COLUMNS: &str = r#"
    id, user_id, name, description, location, distance, frequency_minutes,
    notification_target, strictness, is_active, enable_initial_scrape,
    initial_scrape_count, created_at, last_run, next_cooldown, total_runs,
    total_scrapes, total_matches, consecutive_source_failures, logs
"#;

/// Postgres-backed [`TaskStore`]. Run leases live on the task row so lease
/// checks and commits share a row lock.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn to_i64(value: u64, field: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let id: String = row.try_get("id")?;
    let unsigned32 = |field: &str| -> Result<u32, StoreError> {
        let raw: i32 = row.try_get(field)?;
        u32::try_from(raw)
            .map_err(|_| StoreError::Corrupt(format!("task {id}: negative {field}")))
    };
    let unsigned64 = |field: &str| -> Result<u64, StoreError> {
        let raw: i64 = row.try_get(field)?;
        u64::try_from(raw)
            .map_err(|_| StoreError::Corrupt(format!("task {id}: negative {field}")))
    };
    let strictness: String = row.try_get("strictness")?;
    let strictness: Strictness = strictness
        .parse()
        .map_err(|err| StoreError::Corrupt(format!("task {id}: {err}")))?;
    let Json(logs): Json<TaskLog> = row.try_get("logs")?;

    Ok(Task {
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        distance: unsigned32("distance")?,
        frequency_minutes: unsigned32("frequency_minutes")?,
        notification_target: row.try_get("notification_target")?,
        strictness,
        is_active: row.try_get("is_active")?,
        enable_initial_scrape: row.try_get("enable_initial_scrape")?,
        initial_scrape_count: unsigned32("initial_scrape_count")?,
        created_at: row.try_get("created_at")?,
        last_run: row.try_get("last_run")?,
        next_cooldown: row.try_get("next_cooldown")?,
        total_runs: unsigned64("total_runs")?,
        total_scrapes: unsigned64("total_scrapes")?,
        total_matches: unsigned64("total_matches")?,
        consecutive_source_failures: unsigned32("consecutive_source_failures")?,
        logs,
        id,
    })
}

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, user_id, name, description, location, distance, frequency_minutes,
                notification_target, strictness, is_active, enable_initial_scrape,
                initial_scrape_count, created_at, last_run, next_cooldown, total_runs,
                total_scrapes, total_matches, consecutive_source_failures, logs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.location)
        .bind(to_i32(task.distance, "distance")?)
        .bind(to_i32(task.frequency_minutes, "frequency_minutes")?)
        .bind(&task.notification_target)
        .bind(task.strictness.as_str())
        .bind(task.is_active)
        .bind(task.enable_initial_scrape)
        .bind(to_i32(task.initial_scrape_count, "initial_scrape_count")?)
        .bind(task.created_at)
        .bind(task.last_run)
        .bind(task.next_cooldown)
        .bind(to_i64(task.total_runs, "total_runs")?)
        .bind(to_i64(task.total_scrapes, "total_scrapes")?)
        .bind(to_i64(task.total_matches, "total_matches")?)
        .bind(to_i32(task.consecutive_source_failures, "consecutive_source_failures")?)
        .bind(Json(&task.logs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, user_id: Option<&str>) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE ($1::text IS NULL OR user_id = $1) \
             ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn eligible_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE is_active AND next_cooldown <= $1 \
             ORDER BY next_cooldown, id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn set_active(
        &self,
        task_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"))
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = task_from_row(&row)?;
        if active {
            task.resume(now);
        } else {
            task.pause(now);
        }
        // Only the pause flag and its log entry; run bookkeeping belongs to commit_run.
        sqlx::query("UPDATE tasks SET is_active = $2, logs = $3 WHERE id = $1")
            .bind(task_id)
            .bind(task.is_active)
            .bind(Json(&task.logs))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_log(&self, task_id: &str, entry: &TaskLogEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT logs FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let Json(mut logs): Json<TaskLog> = row.try_get("logs")?;
        logs.push(entry.clone());
        sqlx::query("UPDATE tasks SET logs = $2 WHERE id = $1")
            .bind(task_id)
            .bind(Json(&logs))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_seen(&self, task_id: &str, listing_id: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM seen_listings WHERE task_id = $1 AND listing_id = $2)",
        )
        .bind(task_id)
        .bind(listing_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn seen_among(
        &self,
        task_id: &str,
        listing_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let seen: Vec<String> = sqlx::query_scalar(
            "SELECT listing_id FROM seen_listings WHERE task_id = $1 AND listing_id = ANY($2)",
        )
        .bind(task_id)
        .bind(listing_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(seen.into_iter().collect())
    }

    async fn mark_seen(
        &self,
        task_id: &str,
        listing_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO seen_listings (task_id, listing_id, seen_at)
            SELECT $1, UNNEST($2::text[]), $3
            ON CONFLICT (task_id, listing_id) DO NOTHING
            "#,
        )
        .bind(task_id)
        .bind(listing_ids)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn seen_count(&self, task_id: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_listings WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn try_acquire_lease(
        &self,
        task_id: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Option<RunLease>, StoreError> {
        let lease = RunLease::new(task_id, owner, now, ttl);
        let result = sqlx::query(
            r#"
            UPDATE tasks
               SET lease_owner = $2,
                   lease_acquired_at = $3,
                   lease_expires_at = $4
             WHERE id = $1
               AND (lease_owner IS NULL OR lease_expires_at <= $3)
            "#,
        )
        .bind(task_id)
        .bind(lease.owner)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(Some(lease));
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(None)
        } else {
            Err(StoreError::TaskNotFound(task_id.to_string()))
        }
    }

    async fn release_lease(&self, lease: &RunLease) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tasks
               SET lease_owner = NULL,
                   lease_acquired_at = NULL,
                   lease_expires_at = NULL
             WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(&lease.task_id)
        .bind(lease.owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_run(&self, commit: &RunCommit) -> Result<CommitReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS}, lease_owner FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(&commit.task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::TaskNotFound(commit.task_id.clone()))?;

        let lease_owner: Option<Uuid> = row.try_get("lease_owner")?;
        if lease_owner != Some(commit.lease_owner) {
            return Err(StoreError::LeaseLost(commit.task_id.clone()));
        }
        let mut task = task_from_row(&row)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO seen_listings (task_id, listing_id, seen_at)
            SELECT $1, UNNEST($2::text[]), $3
            ON CONFLICT (task_id, listing_id) DO NOTHING
            "#,
        )
        .bind(&commit.task_id)
        .bind(&commit.seen_listing_ids)
        .bind(commit.completed_at)
        .execute(&mut *tx)
        .await?;

        task.apply_commit(commit);
        sqlx::query(
            r#"
            UPDATE tasks
               SET total_runs = $2,
                   total_scrapes = $3,
                   total_matches = $4,
                   consecutive_source_failures = $5,
                   last_run = $6,
                   next_cooldown = $7,
                   logs = $8
             WHERE id = $1
            "#,
        )
        .bind(&task.id)
        .bind(to_i64(task.total_runs, "total_runs")?)
        .bind(to_i64(task.total_scrapes, "total_scrapes")?)
        .bind(to_i64(task.total_matches, "total_matches")?)
        .bind(to_i32(task.consecutive_source_failures, "consecutive_source_failures")?)
        .bind(task.last_run)
        .bind(task.next_cooldown)
        .bind(Json(&task.logs))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommitReceipt {
            newly_seen: inserted.rows_affected() as usize,
            next_cooldown: task.next_cooldown,
        })
    }

    async fn reschedule(
        &self,
        task_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
               SET last_run = $2,
                   next_cooldown = $2 + make_interval(mins => frequency_minutes)
             WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use listwatch_core::{FetchStatus, NewTask};

    async fn test_store() -> Option<PgStore> {
        let url = std::env::var("LISTWATCH_TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    fn sample_task(now: DateTime<Utc>) -> Task {
        NewTask {
            user_id: format!("pg-user-{}", Uuid::new_v4()),
            name: "Desk".into(),
            description: "standing desk".into(),
            location: "10001".into(),
            distance: 10,
            frequency_minutes: 30,
            notification_target: "https://hooks.test/pg".into(),
            strictness: Strictness::LessStrict,
            enable_initial_scrape: false,
            initial_scrape_count: 6,
        }
        .into_task(Uuid::new_v4().to_string(), now)
        .unwrap()
    }

    #[tokio::test]
    async fn pg_round_trips_task_and_commit() {
        let Some(store) = test_store().await else {
            return;
        };
        let now = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let task = sample_task(now);
        store.insert_task(&task).await.unwrap();
        assert_eq!(store.get_task(&task.id).await.unwrap(), Some(task.clone()));

        let owner = Uuid::new_v4();
        let ttl = chrono::Duration::seconds(60);
        let lease = store
            .try_acquire_lease(&task.id, owner, now, ttl)
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .try_acquire_lease(&task.id, Uuid::new_v4(), now, ttl)
            .await
            .unwrap()
            .is_none());

        let receipt = store
            .commit_run(&RunCommit {
                task_id: task.id.clone(),
                lease_owner: owner,
                completed_at: now,
                seen_listing_ids: vec!["1".into(), "2".into()],
                scraped: 2,
                matches: 1,
                count_run: true,
                fetch: FetchStatus::Succeeded,
                advance_cooldown: true,
                log_entry: None,
            })
            .await
            .unwrap();
        assert_eq!(receipt.newly_seen, 2);
        store.release_lease(&lease).await.unwrap();

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.total_matches, 1);
        assert_eq!(stored.next_cooldown, now + chrono::Duration::minutes(30));
        assert_eq!(
            store.mark_seen(&task.id, &["2".into(), "3".into()], now).await.unwrap(),
            1
        );
        assert!(store.delete_task(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn pg_pause_racing_a_commit_keeps_both_writes() {
        let Some(store) = test_store().await else {
            return;
        };
        let now = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let task = sample_task(now);
        store.insert_task(&task).await.unwrap();
        let owner = Uuid::new_v4();
        let lease = store
            .try_acquire_lease(&task.id, owner, now, chrono::Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        let commit = RunCommit {
            task_id: task.id.clone(),
            lease_owner: owner,
            completed_at: now,
            seen_listing_ids: vec!["1".into()],
            scraped: 1,
            matches: 0,
            count_run: true,
            fetch: FetchStatus::Succeeded,
            advance_cooldown: true,
            log_entry: None,
        };
        let (committed, paused) =
            tokio::join!(store.commit_run(&commit), store.set_active(&task.id, false, now));
        committed.unwrap();
        paused.unwrap().unwrap();
        store.release_lease(&lease).await.unwrap();

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.total_runs, 1);
        assert_eq!(stored.last_run, Some(now));
        assert_eq!(stored.next_cooldown, now + chrono::Duration::minutes(30));
        assert!(stored.logs.iter().any(|entry| entry.message == "Task paused"));

        let resumed = store.set_active(&task.id, true, now).await.unwrap().unwrap();
        assert!(resumed.is_active);
        assert_eq!(resumed.total_runs, 1);
        assert!(store.delete_task(&task.id).await.unwrap());
    }
}
