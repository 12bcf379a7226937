//! PostgreSQL job store.
//!
//! One row per job: mirrored filter columns keep conditional lookups
//! sargable, the JSONB `doc` column is the document of record. Conditional
//! updates run as row-locked read-modify-write transactions. Claim-style
//! lookups (no target id) add `SKIP LOCKED` so concurrent scheduler workers
//! never block on or double-claim the same job; id-targeted updates block on
//! the row lock instead, so a transient lock held by another writer never
//! masquerades as a failed expected-state check.

use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppResult;
use crate::model::{Job, StepState};
use crate::store::{apply_mutations, JobFilter, JobMutation, JobStore, StepPatch};

const SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS jobplane;
CREATE TABLE IF NOT EXISTS jobplane.job (
    job_id UUID PRIMARY KEY,
    state SMALLINT NOT NULL,
    state_group TEXT NOT NULL,
    is_cancelled BOOLEAN NOT NULL DEFAULT FALSE,
    delete_job BOOLEAN NOT NULL DEFAULT FALSE,
    cost_settled BOOLEAN NOT NULL DEFAULT TRUE,
    project_id TEXT NOT NULL,
    main_lock TIMESTAMPTZ,
    revert_lock TIMESTAMPTZ,
    doc JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS job_state_idx ON jobplane.job (state, is_cancelled);
CREATE INDEX IF NOT EXISTS job_project_idx ON jobplane.job (project_id);
"#;

/// Expected-state filter rendered against the mirrored columns. Bind order
/// matches [`bind_filter`].
const FILTER_WHERE: &str = r#"
    ($1::UUID IS NULL OR job_id = $1)
    AND (cardinality($2::SMALLINT[]) = 0 OR state = ANY($2))
    AND (cardinality($3::TEXT[]) = 0 OR state_group = ANY($3))
    AND ($4::BOOLEAN IS NULL OR is_cancelled = $4)
    AND ($5::BOOLEAN IS NULL OR delete_job = $5)
    AND ($6::BOOLEAN IS NULL OR cost_settled = $6)
    AND ($7::TEXT IS NULL OR project_id = $7)
    AND ($8::TIMESTAMPTZ IS NULL OR main_lock < $8)
    AND ($9::TIMESTAMPTZ IS NULL OR revert_lock < $9)
"#;

fn bind_filter<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    filter: &JobFilter,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    let states: Vec<i16> = filter.states.iter().map(|s| s.code() as i16).collect();
    let groups: Vec<String> = filter
        .state_groups
        .iter()
        .map(|g| g.as_str().to_string())
        .collect();

    query
        .bind(filter.id)
        .bind(states)
        .bind(groups)
        .bind(filter.is_cancelled)
        .bind(filter.delete_job)
        .bind(filter.cost_settled)
        .bind(filter.project_id.clone())
        .bind(filter.main_locked_before)
        .bind(filter.revert_locked_before)
}

/// Row-lock clause for conditional updates. Claims (no id) skip locked
/// rows and move on to the next candidate; id-targeted updates must wait
/// for the lock, otherwise a concurrent step write on the same job would
/// make the update report a mismatched filter.
fn lock_clause(filter: &JobFilter) -> &'static str {
    if filter.id.is_some() {
        "FOR UPDATE"
    } else {
        "FOR UPDATE SKIP LOCKED"
    }
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the schema and job table if missing.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Job table schema ensured");
        Ok(())
    }

    /// Write the document and its mirrored filter columns back to the row.
    async fn write_row(tx: &mut Transaction<'_, Postgres>, job: &Job) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE jobplane.job SET
                state = $2,
                state_group = $3,
                is_cancelled = $4,
                delete_job = $5,
                cost_settled = $6,
                project_id = $7,
                main_lock = $8,
                revert_lock = $9,
                doc = $10,
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.state.code() as i16)
        .bind(job.state_group.as_str())
        .bind(job.cancellation_info.is_cancelled)
        .bind(job.cancellation_info.delete_job)
        .bind(job.cost_settled())
        .bind(&job.project_id)
        .bind(job.executions.main.process_start_time)
        .bind(job.executions.revert.process_start_time)
        .bind(serde_json::to_value(job)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Load one job row for update, by id.
    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> AppResult<Option<Job>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT doc FROM jobplane.job WHERE job_id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;
        match row {
            Some((doc,)) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }
}

impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobplane.job (
                job_id, state, state_group, is_cancelled, delete_job,
                cost_settled, project_id, main_lock, revert_lock, doc
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(job.state.code() as i16)
        .bind(job.state_group.as_str())
        .bind(job.cancellation_info.is_cancelled)
        .bind(job.cancellation_info.delete_job)
        .bind(job.cost_settled())
        .bind(&job.project_id)
        .bind(job.executions.main.process_start_time)
        .bind(job.executions.revert.process_start_time)
        .bind(serde_json::to_value(job)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Job>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT doc FROM jobplane.job WHERE job_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((doc,)) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> AppResult<Option<Job>> {
        let sql = format!(
            "SELECT doc FROM jobplane.job WHERE {FILTER_WHERE} \
             ORDER BY updated_at ASC LIMIT 1 {}",
            lock_clause(filter)
        );

        let mut tx = self.pool.begin().await?;
        let row: Option<(serde_json::Value,)> = bind_filter(sqlx::query_as(&sql), filter)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((doc,)) = row else {
            return Ok(None);
        };

        let mut job: Job = serde_json::from_value(doc)?;
        apply_mutations(&mut job, mutations);
        Self::write_row(&mut tx, &job).await?;
        tx.commit().await?;

        Ok(Some(job))
    }

    async fn update_many_if(
        &self,
        filter: &JobFilter,
        mutations: &[JobMutation],
    ) -> AppResult<u64> {
        let sql = format!("SELECT doc FROM jobplane.job WHERE {FILTER_WHERE} FOR UPDATE");

        let mut tx = self.pool.begin().await?;
        let rows: Vec<(serde_json::Value,)> = bind_filter(sqlx::query_as(&sql), filter)
            .fetch_all(&mut *tx)
            .await?;

        let mut count = 0;
        for (doc,) in rows {
            let mut job: Job = serde_json::from_value(doc)?;
            apply_mutations(&mut job, mutations);
            Self::write_row(&mut tx, &job).await?;
            count += 1;
        }
        tx.commit().await?;

        Ok(count)
    }

    async fn update_step(&self, id: Uuid, task_id: &str, patch: &StepPatch) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_row(&mut tx, id).await? else {
            return Ok(false);
        };

        let Some(step) = job.step_details.iter_mut().find(|s| s.task_id == task_id) else {
            return Ok(false);
        };
        patch.apply(step);

        Self::write_row(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update_steps_in_states(
        &self,
        id: Uuid,
        from: &[StepState],
        to: StepState,
    ) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;
        let Some(mut job) = Self::lock_row(&mut tx, id).await? else {
            return Ok(0);
        };

        let mut count = 0;
        for step in job
            .step_details
            .iter_mut()
            .filter(|s| from.contains(&s.state))
        {
            step.state = to;
            count += 1;
        }
        if count > 0 {
            Self::write_row(&mut tx, &job).await?;
            tx.commit().await?;
        }
        Ok(count)
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM jobplane.job WHERE job_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_ids(&self, filter: &JobFilter) -> AppResult<Vec<Uuid>> {
        let sql = format!("SELECT job_id FROM jobplane.job WHERE {FILTER_WHERE}");
        let rows: Vec<(Uuid,)> = bind_filter(sqlx::query_as(&sql), filter)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobState;

    #[test]
    fn test_targeted_updates_block_instead_of_skipping() {
        // A concurrent step write holding the row lock must delay an
        // id-targeted transition, not make it report a filter mismatch.
        let targeted = JobFilter::new()
            .with_id(Uuid::new_v4())
            .in_states(JobState::ACTIVE);
        assert_eq!(lock_clause(&targeted), "FOR UPDATE");
    }

    #[test]
    fn test_claims_skip_locked_rows() {
        let claim = JobFilter::new()
            .in_states(&[JobState::ReadyForScheduling])
            .cancelled(false);
        assert_eq!(lock_clause(&claim), "FOR UPDATE SKIP LOCKED");
    }
}
