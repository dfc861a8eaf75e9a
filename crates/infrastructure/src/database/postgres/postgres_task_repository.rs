use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use cronflow_domain::entities::{HttpRequestInfo, Task, TaskStatus};
use cronflow_domain::repositories::TaskRepository;
use cronflow_errors::{SchedulerError, SchedulerResult};

use crate::database::is_unique_violation;

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> SchedulerResult<Task> {
        let payload: serde_json::Value = row.try_get("payload")?;
        let payload: HttpRequestInfo = serde_json::from_value(payload)?;

        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            payload,
            status: row.try_get("status")?,
            last_checked_at: row.try_get("last_checked_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    /// 由版本号守护的幂等upsert
    ///
    /// 先尝试 `UPDATE ... WHERE id = $1 AND version = 期望前版本`；
    /// 未命中任何行时回退到插入，主键冲突说明有并发写入者抢先，
    /// 按 `Conflict` 上报。
    #[instrument(skip(self, task), fields(task_id = %task.id, task_version = %task.version))]
    async fn save(&self, task: &Task) -> SchedulerResult<()> {
        let payload = serde_json::to_value(&task.payload)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET name = $2, cron_expression = $3, payload = $4, status = $5,
                updated_at = $6, last_checked_at = $7, version = $8
            WHERE id = $1 AND version = $9
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(&payload)
        .bind(task.status)
        .bind(task.updated_at)
        .bind(task.last_checked_at)
        .bind(task.version)
        .bind(task.version - 1)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("更新任务成功: ID {}, 版本 {}", task.id, task.version);
            return Ok(());
        }

        // 行不存在则插入；行存在但版本不匹配时，插入会撞上主键
        let insert = sqlx::query(
            r#"
            INSERT INTO tasks (id, name, cron_expression, payload, status,
                               created_at, updated_at, last_checked_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(&payload)
        .bind(task.status)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.last_checked_at)
        .bind(task.version)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => {
                debug!("插入任务成功: ID {}, 版本 {}", task.id, task.version);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(SchedulerError::conflict(format!(
                "任务 {} 的版本已被其他写入者推进",
                task.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, cron_expression, payload, status,
                   created_at, updated_at, last_checked_at, version
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => {
                debug!("查询任务不存在: ID {}", id);
                Ok(None)
            }
        }
    }

    async fn find_all_active(&self) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, cron_expression, payload, status,
                   created_at, updated_at, last_checked_at, version
            FROM tasks
            WHERE status = $1
            "#,
        )
        .bind(TaskStatus::Active)
        .fetch_all(&self.pool)
        .await?;

        let tasks: SchedulerResult<Vec<Task>> = rows.iter().map(Self::row_to_task).collect();
        let tasks = tasks?;
        debug!("查询活跃任务成功，返回 {} 个", tasks.len());
        Ok(tasks)
    }
}
