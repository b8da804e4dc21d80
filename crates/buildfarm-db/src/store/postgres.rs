//! PostgreSQL work store.
//!
//! Claims use `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED LIMIT 1)`
//! so concurrent agents skip rows another transaction is already claiming.

use async_trait::async_trait;
use buildfarm_core::{
    AUTO_TIMER, AgentRecord, AgentState, BatchId, BuildRequest, BuildRun, NewSubJob,
    Registration, ResourceId, ResourceSample, SubJob, TriggerClaim, TriggerOutcome,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    BatchCounts, CONCH_STALE_AFTER, GLOBAL_BRANCH, KillRequest, SYSTEM_DOWN_VARIABLE, WorkStore,
    next_run_after, truncate_status,
};
use crate::{DbError, DbResult};

/// A build request row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRequestRecord {
    id: Uuid,
    description: String,
    script: String,
    branch: String,
    machine: Option<String>,
    machine_lock: Option<String>,
    pending: bool,
    killing: bool,
    killer: Option<String>,
    operator: Option<String>,
    last_good_changelist: i64,
    last_good_at: Option<DateTime<Utc>>,
    last_good_label: Option<String>,
    promotable: bool,
    looping: bool,
    conch_acquired_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    run_interval_minutes: Option<i32>,
    build_run_id: Option<Uuid>,
    parameter: Option<String>,
    config: Option<String>,
    language: Option<String>,
}

impl From<BuildRequestRecord> for BuildRequest {
    fn from(r: BuildRequestRecord) -> Self {
        BuildRequest {
            id: r.id.into(),
            description: r.description,
            script: r.script,
            branch: r.branch,
            machine: r.machine,
            machine_lock: r.machine_lock,
            pending: r.pending,
            killing: r.killing,
            killer: r.killer,
            operator: r.operator,
            last_good_changelist: r.last_good_changelist,
            last_good_at: r.last_good_at,
            last_good_label: r.last_good_label,
            promotable: r.promotable,
            looping: r.looping,
            conch_acquired_at: r.conch_acquired_at,
            next_run_at: r.next_run_at,
            run_interval_minutes: r.run_interval_minutes,
            build_run_id: r.build_run_id.map(Into::into),
            parameter: r.parameter,
            config: r.config,
            language: r.language,
        }
    }
}

/// A triggered claim, with the machine that held the row before the claim.
#[derive(Debug, sqlx::FromRow)]
struct TriggerRecord {
    #[sqlx(flatten)]
    request: BuildRequestRecord,
    prior_machine: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SubJobRecord {
    id: Uuid,
    name: String,
    command: String,
    parameter: String,
    batch: i64,
    game: String,
    platform: String,
    branch: String,
    label: String,
    machine: Option<String>,
    active: bool,
    complete: bool,
    succeeded: bool,
    killing: bool,
    build_run_id: Option<Uuid>,
}

impl From<SubJobRecord> for SubJob {
    fn from(r: SubJobRecord) -> Self {
        SubJob {
            id: r.id.into(),
            name: r.name,
            command: r.command,
            parameter: r.parameter,
            batch: BatchId::from_raw(r.batch),
            game: r.game,
            platform: r.platform,
            branch: r.branch,
            label: r.label,
            machine: r.machine,
            active: r.active,
            complete: r.complete,
            succeeded: r.succeeded,
            killing: r.killing,
            build_run_id: r.build_run_id.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    machine: String,
    state: String,
    started_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    restart: bool,
    load_average: Option<f64>,
    memory_used_percent: Option<f64>,
    disk_free_mb: Option<i64>,
}

impl TryFrom<AgentRow> for AgentRecord {
    type Error = DbError;

    fn try_from(r: AgentRow) -> DbResult<Self> {
        let state = r
            .state
            .parse::<AgentState>()
            .map_err(|e| DbError::InvalidData(e.to_string()))?;
        let sample = r.load_average.map(|load_average| ResourceSample {
            load_average,
            memory_used_percent: r.memory_used_percent.unwrap_or_default(),
            disk_free_mb: r.disk_free_mb.unwrap_or_default(),
        });
        Ok(AgentRecord {
            id: r.id.into(),
            machine: r.machine,
            state,
            started_at: r.started_at,
            heartbeat_at: r.heartbeat_at,
            ended_at: r.ended_at,
            restart: r.restart,
            sample,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRunRecord {
    id: Uuid,
    request_id: Option<Uuid>,
    job_id: Option<Uuid>,
    machine: String,
    script: String,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    changelist: i64,
    label: Option<String>,
    promotable: bool,
}

impl From<BuildRunRecord> for BuildRun {
    fn from(r: BuildRunRecord) -> Self {
        BuildRun {
            id: r.id.into(),
            request_id: r.request_id.map(Into::into),
            job_id: r.job_id.map(Into::into),
            machine: r.machine,
            script: r.script,
            status: r.status,
            started_at: r.started_at,
            ended_at: r.ended_at,
            changelist: r.changelist,
            label: r.label,
            promotable: r.promotable,
        }
    }
}

/// PostgreSQL implementation of WorkStore.
pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn register_agent(&self, machine: &str) -> DbResult<Registration> {
        let mut tx = self.pool.begin().await?;

        let zombied = sqlx::query(
            r#"
            UPDATE agents SET state = 'Zombied', ended_at = NOW()
            WHERE machine = $1 AND state IN ('Connected', 'Building')
            "#,
        )
        .bind(machine)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let released_requests = sqlx::query(
            r#"
            UPDATE build_requests
            SET machine = NULL, build_run_id = NULL, killing = FALSE, conch_acquired_at = NULL
            WHERE machine = $1
            "#,
        )
        .bind(machine)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let orphaned_jobs = sqlx::query(
            "UPDATE sub_jobs SET complete = TRUE, active = FALSE WHERE machine = $1 AND NOT complete",
        )
        .bind(machine)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row = sqlx::query_as::<_, AgentRow>(
            r#"
            INSERT INTO agents (id, machine, state, started_at, heartbeat_at)
            VALUES ($1, $2, 'Connected', NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(machine)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Registration {
            agent: row.try_into()?,
            zombied,
            released_requests,
            orphaned_jobs,
        })
    }

    async fn heartbeat(&self, agent: ResourceId, sample: Option<&ResourceSample>) -> DbResult<()> {
        let result = match sample {
            Some(sample) => {
                sqlx::query(
                    r#"
                    UPDATE agents
                    SET heartbeat_at = NOW(), load_average = $2, memory_used_percent = $3, disk_free_mb = $4
                    WHERE id = $1
                    "#,
                )
                .bind(agent.as_uuid())
                .bind(sample.load_average)
                .bind(sample.memory_used_percent)
                .bind(sample.disk_free_mb)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE agents SET heartbeat_at = NOW() WHERE id = $1")
                    .bind(agent.as_uuid())
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("agent {}", agent)));
        }
        Ok(())
    }

    async fn set_agent_state(&self, agent: ResourceId, state: AgentState) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET state = $2, ended_at = CASE WHEN $2 = 'Dead' THEN NOW() ELSE ended_at END
            WHERE id = $1
            "#,
        )
        .bind(agent.as_uuid())
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_restart(&self, machine: &str) -> DbResult<bool> {
        let result = sqlx::query("UPDATE agents SET restart = TRUE WHERE machine = $1 AND ended_at IS NULL")
            .bind(machine)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restart_requested(&self, agent: ResourceId) -> DbResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT restart FROM agents WHERE id = $1")
            .bind(agent.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("agent {}", agent)))
    }

    async fn list_agents(&self) -> DbResult<Vec<AgentRecord>> {
        let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents ORDER BY machine, started_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn machine_lock(&self, machine: &str) -> DbResult<Option<ResourceId>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM build_requests
            WHERE COALESCE(machine_lock, '') <> '' AND $1 ILIKE machine_lock
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(machine)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(Into::into))
    }

    async fn claim_timed_build(&self, machine: &str, any_machine: bool) -> DbResult<Option<BuildRequest>> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, BuildRequestRecord>(
            r#"
            UPDATE build_requests
            SET machine = $1, operator = $3, pending = FALSE
            WHERE id = (
                SELECT id FROM build_requests
                WHERE COALESCE(machine, '') = ''
                  AND next_run_at <= NOW()
                  AND (($2 AND COALESCE(machine_lock, '') = '')
                       OR (NOT $2 AND COALESCE(machine_lock, '') <> '' AND $1 ILIKE machine_lock))
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(machine)
        .bind(any_machine)
        .bind(AUTO_TIMER)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut record) = record else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let due = record.next_run_at.unwrap_or(now);
        record.next_run_at = next_run_after(due, record.run_interval_minutes, now);
        sqlx::query("UPDATE build_requests SET next_run_at = $2 WHERE id = $1")
            .bind(record.id)
            .bind(record.next_run_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(record.into()))
    }

    async fn claim_triggered_build(&self, machine: &str, any_machine: bool) -> DbResult<Option<TriggerClaim>> {
        let record = sqlx::query_as::<_, TriggerRecord>(
            r#"
            WITH candidate AS (
                SELECT id, machine AS prior_machine FROM build_requests
                WHERE pending
                  AND (($2 AND COALESCE(machine_lock, '') = '')
                       OR (NOT $2 AND COALESCE(machine_lock, '') <> '' AND $1 ILIKE machine_lock))
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE build_requests r
            SET pending = FALSE,
                machine = CASE WHEN COALESCE(c.prior_machine, '') = '' THEN $1 ELSE r.machine END
            FROM candidate c
            WHERE r.id = c.id
            RETURNING r.*, c.prior_machine
            "#,
        )
        .bind(machine)
        .bind(any_machine)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(|r| {
            let already_building = r.prior_machine.is_some_and(|m| !m.is_empty());
            if already_building {
                TriggerClaim::AlreadyBuilding(r.request.into())
            } else {
                TriggerClaim::Claimed(r.request.into())
            }
        }))
    }

    async fn claim_job(&self, machine: &str) -> DbResult<Option<SubJob>> {
        let record = sqlx::query_as::<_, SubJobRecord>(
            r#"
            UPDATE sub_jobs
            SET machine = $1, active = TRUE
            WHERE id = (
                SELECT id FROM sub_jobs
                WHERE NOT complete AND NOT active AND COALESCE(machine, '') = ''
                ORDER BY batch, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(machine)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Into::into))
    }

    async fn create_build_request(&self, request: &BuildRequest) -> DbResult<BuildRequest> {
        let result = sqlx::query_as::<_, BuildRequestRecord>(
            r#"
            INSERT INTO build_requests (
                id, description, script, branch, machine_lock, promotable, looping,
                next_run_at, run_interval_minutes, parameter, config, language
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(&request.description)
        .bind(&request.script)
        .bind(&request.branch)
        .bind(&request.machine_lock)
        .bind(request.promotable)
        .bind(request.looping)
        .bind(request.next_run_at)
        .bind(request.run_interval_minutes)
        .bind(&request.parameter)
        .bind(&request.config)
        .bind(&request.language)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(record) => Ok(record.into()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::Duplicate(
                format!("build request '{}'", request.description),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_build_request(&self, id: ResourceId) -> DbResult<BuildRequest> {
        let record = sqlx::query_as::<_, BuildRequestRecord>("SELECT * FROM build_requests WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build request {}", id)))?;
        Ok(record.into())
    }

    async fn find_build_request(&self, description: &str) -> DbResult<Option<BuildRequest>> {
        let record = sqlx::query_as::<_, BuildRequestRecord>(
            "SELECT * FROM build_requests WHERE LOWER(description) = LOWER($1)",
        )
        .bind(description)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Into::into))
    }

    async fn trigger_build(&self, description: &str, operator: &str) -> DbResult<TriggerOutcome> {
        let triggered = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE build_requests SET pending = TRUE, operator = $2
            WHERE LOWER(description) = LOWER($1) AND COALESCE(machine, '') = ''
            RETURNING id
            "#,
        )
        .bind(description)
        .bind(operator)
        .fetch_optional(&self.pool)
        .await?;

        if triggered.is_some() {
            return Ok(TriggerOutcome::Triggered);
        }
        match self.find_build_request(description).await? {
            Some(_) => Ok(TriggerOutcome::AlreadyBuilding),
            None => Ok(TriggerOutcome::NotFound),
        }
    }

    async fn begin_build(&self, request: ResourceId, machine: &str, script: &str) -> DbResult<BuildRun> {
        let mut tx = self.pool.begin().await?;
        let run_id = Uuid::now_v7();

        let promotable = sqlx::query_scalar::<_, bool>(
            r#"
            UPDATE build_requests
            SET machine = $2, killing = FALSE, killer = NULL, build_run_id = $3
            WHERE id = $1
            RETURNING promotable
            "#,
        )
        .bind(request.as_uuid())
        .bind(machine)
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build request {}", request)))?;

        let record = sqlx::query_as::<_, BuildRunRecord>(
            r#"
            INSERT INTO build_runs (id, request_id, machine, script, status, started_at, promotable)
            VALUES ($1, $2, $3, $4, 'Spawning', NOW(), $5)
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(request.as_uuid())
        .bind(machine)
        .bind(script)
        .bind(promotable)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record.into())
    }

    async fn release_build(&self, request: ResourceId) -> DbResult<BuildRequest> {
        let record = sqlx::query_as::<_, BuildRequestRecord>(
            r#"
            UPDATE build_requests
            SET machine = NULL, killing = FALSE, build_run_id = NULL, conch_acquired_at = NULL
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(request.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build request {}", request)))?;
        Ok(record.into())
    }

    async fn set_last_good(
        &self,
        request: ResourceId,
        changelist: i64,
        at: DateTime<Utc>,
        label: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE build_requests
            SET last_good_changelist = $2, last_good_at = $3,
                last_good_label = COALESCE($4, last_good_label)
            WHERE id = $1
            "#,
        )
        .bind(request.as_uuid())
        .bind(changelist)
        .bind(at)
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_kill(&self, description: &str, killer: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_requests SET killing = TRUE, killer = $2
            WHERE LOWER(description) = LOWER($1) AND COALESCE(machine, '') <> ''
            "#,
        )
        .bind(description)
        .bind(killer)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn poll_kill_build(&self, machine: &str) -> DbResult<Option<KillRequest>> {
        let row = sqlx::query_as::<_, (Uuid, Option<String>)>(
            "SELECT id, killer FROM build_requests WHERE killing AND machine = $1 LIMIT 1",
        )
        .bind(machine)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, killer)| KillRequest { id: id.into(), killer }))
    }

    async fn poll_kill_job(&self, machine: &str) -> DbResult<Option<KillRequest>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM sub_jobs WHERE killing AND NOT complete AND machine = $1 LIMIT 1",
        )
        .bind(machine)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(|id| KillRequest { id: id.into(), killer: None }))
    }

    async fn kill_batch(&self, batch: BatchId) -> DbResult<u64> {
        let result = sqlx::query("UPDATE sub_jobs SET killing = TRUE WHERE batch = $1 AND NOT complete")
            .bind(batch.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn acquire_conch(&self, request: ResourceId) -> DbResult<bool> {
        match self.conch_holder().await? {
            Some((id, _)) if id == request => Ok(true),
            Some((id, at)) => {
                if Utc::now() - at > CONCH_STALE_AFTER {
                    sqlx::query(
                        "UPDATE build_requests SET conch_acquired_at = NULL WHERE id = $1 AND conch_acquired_at = $2",
                    )
                    .bind(id.as_uuid())
                    .bind(at)
                    .execute(&self.pool)
                    .await?;
                }
                Ok(false)
            }
            None => {
                // The partial unique index rejects a second holder that raced us.
                let result = sqlx::query(
                    r#"
                    UPDATE build_requests SET conch_acquired_at = NOW()
                    WHERE id = $1
                      AND NOT EXISTS (SELECT 1 FROM build_requests WHERE conch_acquired_at IS NOT NULL)
                    "#,
                )
                .bind(request.as_uuid())
                .execute(&self.pool)
                .await;
                match result {
                    Ok(done) => Ok(done.rows_affected() == 1),
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn release_conch(&self, request: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE build_requests SET conch_acquired_at = NULL WHERE id = $1")
            .bind(request.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn conch_holder(&self) -> DbResult<Option<(ResourceId, DateTime<Utc>)>> {
        let row = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            "SELECT id, conch_acquired_at FROM build_requests WHERE conch_acquired_at IS NOT NULL LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, at)| (id.into(), at)))
    }

    async fn add_job(&self, job: &NewSubJob) -> DbResult<SubJob> {
        let record = sqlx::query_as::<_, SubJobRecord>(
            r#"
            INSERT INTO sub_jobs (id, name, command, parameter, batch, game, platform, branch, label)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.name)
        .bind(&job.command)
        .bind(&job.parameter)
        .bind(job.batch.as_i64())
        .bind(&job.game)
        .bind(&job.platform)
        .bind(&job.branch)
        .bind(&job.label)
        .fetch_one(&self.pool)
        .await?;
        Ok(record.into())
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<SubJob> {
        let record = sqlx::query_as::<_, SubJobRecord>("SELECT * FROM sub_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("sub-job {}", id)))?;
        Ok(record.into())
    }

    async fn begin_job(&self, job: ResourceId, machine: &str) -> DbResult<BuildRun> {
        let mut tx = self.pool.begin().await?;
        let run_id = Uuid::now_v7();

        let script = sqlx::query_scalar::<_, String>(
            "UPDATE sub_jobs SET build_run_id = $2 WHERE id = $1 RETURNING command",
        )
        .bind(job.as_uuid())
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("sub-job {}", job)))?;

        let record = sqlx::query_as::<_, BuildRunRecord>(
            r#"
            INSERT INTO build_runs (id, job_id, machine, script, status, started_at)
            VALUES ($1, $2, $3, $4, 'Spawning', NOW())
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(job.as_uuid())
        .bind(machine)
        .bind(script)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record.into())
    }

    async fn batch_counts(&self, batch: BatchId) -> DbResult<BatchCounts> {
        let (complete, succeeded) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE succeeded)
            FROM sub_jobs
            WHERE batch = $1 AND complete
            "#,
        )
        .bind(batch.as_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(BatchCounts { complete, succeeded })
    }

    async fn mark_job_succeeded(&self, job: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE sub_jobs SET succeeded = TRUE WHERE id = $1")
            .bind(job.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_job(&self, job: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE sub_jobs SET complete = TRUE, active = FALSE WHERE id = $1")
            .bind(job.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_build_run(&self, id: ResourceId) -> DbResult<BuildRun> {
        let record = sqlx::query_as::<_, BuildRunRecord>("SELECT * FROM build_runs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build run {}", id)))?;
        Ok(record.into())
    }

    async fn set_run_status(&self, run: ResourceId, status: &str) -> DbResult<()> {
        sqlx::query("UPDATE build_runs SET status = $2 WHERE id = $1")
            .bind(run.as_uuid())
            .bind(truncate_status(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_run_changelist(&self, run: ResourceId, changelist: i64) -> DbResult<()> {
        sqlx::query("UPDATE build_runs SET changelist = $2 WHERE id = $1")
            .bind(run.as_uuid())
            .bind(changelist)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_run_label(&self, run: ResourceId, label: &str) -> DbResult<()> {
        sqlx::query("UPDATE build_runs SET label = $2 WHERE id = $1")
            .bind(run.as_uuid())
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_run(&self, run: ResourceId, status: &str) -> DbResult<()> {
        sqlx::query("UPDATE build_runs SET status = $2, ended_at = NOW() WHERE id = $1")
            .bind(run.as_uuid())
            .bind(truncate_status(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn variables(&self, branch: &str) -> DbResult<HashMap<String, String>> {
        // Globals sort first so branch values overwrite them.
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT name, value FROM variables
            WHERE branch = $1 OR branch = $2
            ORDER BY (branch = $2)
            "#,
        )
        .bind(GLOBAL_BRANCH)
        .bind(branch)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn set_variable(&self, branch: &str, name: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO variables (branch, name, value) VALUES ($1, $2, $3)
            ON CONFLICT (branch, name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(branch)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn system_down_message(&self) -> DbResult<Option<String>> {
        let message = sqlx::query_scalar::<_, String>(
            "SELECT value FROM variables WHERE name = $1 AND TRIM(value) <> '' LIMIT 1",
        )
        .bind(SYSTEM_DOWN_VARIABLE)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn record_perf(&self, machine: &str, key: &str, value: i64) -> DbResult<()> {
        sqlx::query("INSERT INTO perf_data (machine, key, value) VALUES ($1, $2, $3)")
            .bind(machine)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
