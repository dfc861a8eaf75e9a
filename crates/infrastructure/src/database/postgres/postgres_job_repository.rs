use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use cronflow_domain::entities::{Job, JobStatus};
use cronflow_domain::repositories::JobRepository;
use cronflow_errors::{SchedulerError, SchedulerResult};

use crate::database::is_unique_violation;

const JOB_COLUMNS: &str = "id, task_id, scheduled_at, started_at, finished_at, \
                           status, retry_count, created_at, updated_at";

pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> SchedulerResult<Job> {
        Ok(Job {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    /// 插入新的pending作业
    ///
    /// `(task_id, scheduled_at)` 唯一索引冲突说明另一个调度器副本已经
    /// 物化了该到期时刻，按 `Conflict` 上报，由调用方判定是否良性。
    #[instrument(skip(self, job), fields(job_id = %job.id, task_id = %job.task_id))]
    async fn enqueue(&self, job: &Job) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, task_id, scheduled_at, started_at, finished_at,
                              status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&job.id)
        .bind(&job.task_id)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.status)
        .bind(job.retry_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    "作业入队成功: ID {}, 任务 {}, 计划时间 {}",
                    job.id, job.task_id, job.scheduled_at
                );
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(SchedulerError::conflict(format!(
                "任务 {} 在 {} 的作业已存在",
                job.task_id, job.scheduled_at
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// 原子认领最旧的pending作业
    ///
    /// 在一个短事务内执行 `SELECT ... FOR UPDATE SKIP LOCKED LIMIT 1`，
    /// 返回前提交以释放行锁。认领后状态仍为pending：worker在调用
    /// `update_status` 之前崩溃的话，作业会被下一次轮询重新拾起。
    #[instrument(skip(self))]
    async fn dequeue(&self) -> SchedulerResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = $1
            ORDER BY scheduled_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(JobStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let job = Self::row_to_job(&row)?;
        tx.commit().await?;

        debug!("作业出队: ID {}, 计划时间 {}", job.id, job.scheduled_at);
        Ok(Some(job))
    }

    /// 在行锁下推进作业状态机
    ///
    /// 重新读取当前行，校验流转合法性，套用时间戳后写回。
    #[instrument(skip(self), fields(job_id = %job_id, target_status = %status))]
    async fn update_status(&self, job_id: &str, status: JobStatus) -> SchedulerResult<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(SchedulerError::job_not_found(job_id));
        };

        let mut job = Self::row_to_job(&row)?;
        if !job.status.can_transition_to(status) {
            return Err(SchedulerError::InvalidTransition {
                from: job.status.to_string(),
                to: status.to_string(),
            });
        }

        job.apply_status(status, Utc::now());

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, started_at = $3, finished_at = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(job.status)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("作业状态更新: ID {}, 新状态 {}", job.id, job.status);
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_job(&row)?)),
            None => Ok(None),
        }
    }
}
