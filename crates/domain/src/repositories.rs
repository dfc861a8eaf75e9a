//! 仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则。所有读取都返回游离快照，
//! 调用方可以自由修改而不影响存储内容。

use async_trait::async_trait;

use cronflow_errors::SchedulerResult;

use crate::entities::{Job, JobStatus, Task};

/// 任务仓储抽象
///
/// `save` 是由版本号守护的幂等upsert：不存在则插入；存在则仅当
/// `task.version == 现有版本 + 1` 时才更新，否则返回 `Conflict`。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save(&self, task: &Task) -> SchedulerResult<()>;
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;
    async fn find_all_active(&self) -> SchedulerResult<Vec<Task>>;
}

/// 作业仓储抽象，同时充当持久化工作队列
///
/// 队列就是jobs表本身：`enqueue` 插入pending行，`dequeue` 以
/// `(scheduled_at, created_at)` 升序原子地认领最旧的pending行，
/// 并发的dequeue绝不会返回同一个作业。
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(&self, job: &Job) -> SchedulerResult<()>;
    async fn dequeue(&self) -> SchedulerResult<Option<Job>>;
    async fn update_status(&self, job_id: &str, status: JobStatus) -> SchedulerResult<Job>;
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Job>>;
}
