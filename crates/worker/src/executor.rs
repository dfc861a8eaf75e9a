use std::sync::Arc;

use tracing::{info, warn};

use cronflow_domain::entities::{Job, JobStatus};
use cronflow_domain::ports::Deliverer;
use cronflow_domain::repositories::{JobRepository, TaskRepository};
use cronflow_errors::{SchedulerError, SchedulerResult};

/// 单步作业执行器
///
/// 每次调用最多处理一个作业，保证tick的延迟有界；并行度由调用方
/// 通过并发调用显式控制，进程内没有队列缓冲。
pub struct JobExecutor {
    job_repo: Arc<dyn JobRepository>,
    task_repo: Arc<dyn TaskRepository>,
    deliverer: Arc<dyn Deliverer>,
}

impl JobExecutor {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        task_repo: Arc<dyn TaskRepository>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Self {
        Self {
            job_repo,
            task_repo,
            deliverer,
        }
    }

    /// 认领并执行一个pending作业
    ///
    /// 队列为空返回 `Ok(None)`。认领后先转入running再投递载荷，
    /// 按投递结果落到success或failed；返回终态的作业快照。
    /// running转换失败时直接返回错误，作业留在原状态等待重试。
    pub async fn run_pending_job(&self) -> SchedulerResult<Option<Job>> {
        let Some(job) = self.job_repo.dequeue().await? else {
            return Ok(None);
        };

        let job = self
            .job_repo
            .update_status(&job.id, JobStatus::Running)
            .await?;
        info!("开始执行作业: ID {}, 任务 {}", job.id, job.task_id);

        let outcome = self.deliver_payload(&job).await;

        let finished = match outcome {
            Ok(()) => {
                self.job_repo
                    .update_status(&job.id, JobStatus::Succeeded)
                    .await?
            }
            Err(e) => {
                warn!("作业 {} 投递失败: {}", job.id, e);
                self.job_repo
                    .update_status(&job.id, JobStatus::Failed)
                    .await?
            }
        };

        info!("作业执行结束: ID {}, 状态 {}", finished.id, finished.status);
        Ok(Some(finished))
    }

    /// 查出作业所属任务并投递其载荷；任务已不存在视为投递失败
    async fn deliver_payload(&self, job: &Job) -> SchedulerResult<()> {
        let task = self
            .task_repo
            .find_by_id(&job.task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(&job.task_id))?;

        self.deliverer.deliver(&task.payload).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use cronflow_domain::entities::{HttpRequestInfo, Task};
    use cronflow_infrastructure::{InMemoryJobRepository, InMemoryTaskRepository};

    use super::*;

    /// 记录调用并按预设结果响应的投递器
    struct MockDeliverer {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockDeliverer {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Deliverer for MockDeliverer {
        async fn deliver(&self, _request: &HttpRequestInfo) -> SchedulerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SchedulerError::Delivery("目标不可达".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 28, 10, 0, 0).unwrap()
    }

    async fn seed_task(repo: &InMemoryTaskRepository, id: &str) {
        let task = Task::new(
            id.to_string(),
            format!("task-{id}"),
            "* * * * *".to_string(),
            HttpRequestInfo {
                url: "http://example.com/webhook".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
                body: Vec::new(),
            },
            now() - Duration::minutes(10),
        );
        repo.save(&task).await.unwrap();
    }

    fn executor(
        job_repo: Arc<InMemoryJobRepository>,
        task_repo: Arc<InMemoryTaskRepository>,
        deliverer: Arc<MockDeliverer>,
    ) -> JobExecutor {
        JobExecutor::new(job_repo, task_repo, deliverer)
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let job_repo = Arc::new(InMemoryJobRepository::new());
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let deliverer = Arc::new(MockDeliverer::succeeding());

        let executor = executor(job_repo, task_repo, Arc::clone(&deliverer));
        let result = executor.run_pending_job().await.unwrap();
        assert!(result.is_none());
        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_delivery_marks_job_succeeded() {
        let job_repo = Arc::new(InMemoryJobRepository::new());
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let deliverer = Arc::new(MockDeliverer::succeeding());

        seed_task(&task_repo, "t1").await;
        let job = Job::new("j1".to_string(), "t1".to_string(), now(), now());
        job_repo.enqueue(&job).await.unwrap();

        let executor = executor(
            Arc::clone(&job_repo),
            task_repo,
            Arc::clone(&deliverer),
        );
        let finished = executor.run_pending_job().await.unwrap().unwrap();

        assert_eq!(finished.status, JobStatus::Succeeded);
        assert!(finished.started_at.is_some());
        assert!(finished.finished_at.is_some());
        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 1);

        let stored = job_repo.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_delivery_marks_job_failed() {
        let job_repo = Arc::new(InMemoryJobRepository::new());
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let deliverer = Arc::new(MockDeliverer::failing());

        seed_task(&task_repo, "t1").await;
        let job = Job::new("j1".to_string(), "t1".to_string(), now(), now());
        job_repo.enqueue(&job).await.unwrap();

        let executor = executor(Arc::clone(&job_repo), task_repo, deliverer);
        let finished = executor.run_pending_job().await.unwrap().unwrap();

        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_task_marks_job_failed() {
        let job_repo = Arc::new(InMemoryJobRepository::new());
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let deliverer = Arc::new(MockDeliverer::succeeding());

        // 任务已被删除，作业仍在队列里
        let job = Job::new("j1".to_string(), "ghost".to_string(), now(), now());
        job_repo.enqueue(&job).await.unwrap();

        let executor = executor(Arc::clone(&job_repo), task_repo, Arc::clone(&deliverer));
        let finished = executor.run_pending_job().await.unwrap().unwrap();

        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_jobs_execute_in_scheduled_order() {
        let job_repo = Arc::new(InMemoryJobRepository::new());
        let task_repo = Arc::new(InMemoryTaskRepository::new());
        let deliverer = Arc::new(MockDeliverer::succeeding());

        seed_task(&task_repo, "t1").await;
        let t0 = now();
        job_repo
            .enqueue(&Job::new("late".to_string(), "t1".to_string(), t0, t0))
            .await
            .unwrap();
        job_repo
            .enqueue(&Job::new(
                "early".to_string(),
                "t1".to_string(),
                t0 - Duration::minutes(1),
                t0,
            ))
            .await
            .unwrap();

        let executor = executor(Arc::clone(&job_repo), task_repo, deliverer);
        let first = executor.run_pending_job().await.unwrap().unwrap();
        let second = executor.run_pending_job().await.unwrap().unwrap();
        assert_eq!(first.id, "early");
        assert_eq!(second.id, "late");

        // 队列清空
        assert!(executor.run_pending_job().await.unwrap().is_none());
    }
}
