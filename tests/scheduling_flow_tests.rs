//! 端到端集成测试
//!
//! 调度器与执行器指向同一组内存存储，验证从任务注册到作业终态的
//! 完整链路：每个到期时刻恰好物化一次，作业按计划时间顺序执行。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use cronflow_dispatcher::JobScheduler;
use cronflow_domain::entities::{HttpRequestInfo, JobStatus, Task};
use cronflow_domain::ports::{Deliverer, IdGenerator, UuidGenerator};
use cronflow_domain::repositories::{JobRepository, TaskRepository};
use cronflow_errors::{SchedulerError, SchedulerResult};
use cronflow_infrastructure::{InMemoryJobRepository, InMemoryTaskRepository};
use cronflow_worker::JobExecutor;

/// 只计数的投递器
struct CountingDeliverer {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingDeliverer {
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
impl Deliverer for CountingDeliverer {
    async fn deliver(&self, _request: &HttpRequestInfo) -> SchedulerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(SchedulerError::Delivery("目标不可达".to_string()))
        } else {
            Ok(())
        }
    }
}

fn sample_task(id: &str, expr: &str, created_at: DateTime<Utc>) -> Task {
    Task::new(
        id.to_string(),
        format!("task-{id}"),
        expr.to_string(),
        HttpRequestInfo {
            url: "http://example.com/webhook".to_string(),
            method: "POST".to_string(),
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]),
            body: br#"{"message":"tick"}"#.to_vec(),
        },
        created_at,
    )
}

struct Harness {
    task_repo: Arc<InMemoryTaskRepository>,
    job_repo: Arc<InMemoryJobRepository>,
    scheduler: JobScheduler,
    executor: JobExecutor,
    deliverer: Arc<CountingDeliverer>,
}

fn harness(deliverer: CountingDeliverer) -> Harness {
    let task_repo = Arc::new(InMemoryTaskRepository::new());
    let job_repo = Arc::new(InMemoryJobRepository::new());
    let deliverer = Arc::new(deliverer);

    let scheduler = JobScheduler::new(
        Arc::clone(&task_repo) as _,
        Arc::clone(&job_repo) as _,
        Arc::new(UuidGenerator),
    );
    let executor = JobExecutor::new(
        Arc::clone(&job_repo) as _,
        Arc::clone(&task_repo) as _,
        Arc::clone(&deliverer) as _,
    );

    Harness {
        task_repo,
        job_repo,
        scheduler,
        executor,
        deliverer,
    }
}

#[tokio::test]
async fn test_full_lifecycle_catch_up_then_execute() {
    let h = harness(CountingDeliverer::succeeding());
    let now = Utc.with_ymd_and_hms(2023, 10, 28, 10, 0, 0).unwrap();

    // 10分钟前创建、从未检查过的每分钟任务
    let task = sample_task("t1", "* * * * *", now - Duration::minutes(5));
    h.task_repo.save(&task).await.unwrap();

    let enqueued = h.scheduler.check_and_enqueue(now).await.unwrap();
    assert_eq!(enqueued, 5);

    // 执行全部积压作业
    let mut finished = Vec::new();
    while let Some(job) = h.executor.run_pending_job().await.unwrap() {
        finished.push(job);
    }

    assert_eq!(finished.len(), 5);
    assert!(finished.iter().all(|j| j.status == JobStatus::Succeeded));
    assert_eq!(h.deliverer.calls.load(Ordering::SeqCst), 5);

    // 按计划时间升序执行
    let times: Vec<_> = finished.iter().map(|j| j.scheduled_at).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);

    // 物化的时刻恰好覆盖 (创建时间, now]，无重无漏
    let expected: HashSet<_> = (0..5).map(|i| now - Duration::minutes(i)).collect();
    let actual: HashSet<_> = times.into_iter().collect();
    assert_eq!(actual, expected);

    // 检查点推进后，同一时刻不会再次物化
    let enqueued = h.scheduler.check_and_enqueue(now).await.unwrap();
    assert_eq!(enqueued, 0);

    // 下一分钟恰好产生一个新作业
    let next = now + Duration::minutes(1);
    let enqueued = h.scheduler.check_and_enqueue(next).await.unwrap();
    assert_eq!(enqueued, 1);
}

#[tokio::test]
async fn test_failed_delivery_lands_in_failed_state() {
    let h = harness(CountingDeliverer::failing());
    let now = Utc.with_ymd_and_hms(2023, 10, 28, 10, 0, 0).unwrap();

    let task = sample_task("t1", "* * * * *", now - Duration::minutes(1));
    h.task_repo.save(&task).await.unwrap();

    h.scheduler.check_and_enqueue(now).await.unwrap();
    let finished = h.executor.run_pending_job().await.unwrap().unwrap();

    assert_eq!(finished.status, JobStatus::Failed);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());

    // 终态吸收：失败的作业不会被再次认领
    assert!(h.executor.run_pending_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_two_scheduler_replicas_materialize_each_occurrence_once() {
    let task_repo = Arc::new(InMemoryTaskRepository::new());
    let job_repo = Arc::new(InMemoryJobRepository::new());
    let now = Utc.with_ymd_and_hms(2023, 10, 28, 10, 0, 0).unwrap();

    let task = sample_task("t1", "* * * * *", now - Duration::minutes(5));
    task_repo.save(&task).await.unwrap();

    let make_scheduler = || {
        JobScheduler::new(
            Arc::clone(&task_repo) as _,
            Arc::clone(&job_repo) as _,
            Arc::new(UuidGenerator),
        )
    };
    let replica_a = make_scheduler();
    let replica_b = make_scheduler();

    // 两个副本同时对同一时刻做调度
    let (a, b) = tokio::join!(
        replica_a.check_and_enqueue(now),
        replica_b.check_and_enqueue(now)
    );
    a.unwrap();
    b.unwrap();

    // 无论交错如何，每个到期时刻只物化一个作业
    let mut times = Vec::new();
    while let Some(job) = job_repo.dequeue().await.unwrap() {
        times.push(job.scheduled_at);
    }
    times.sort();
    let expected: Vec<_> = (0..5).rev().map(|i| now - Duration::minutes(i)).collect();
    assert_eq!(times, expected);

    // 检查点推进到now；版本至少前进一次（落后副本可能空窗口再推进一次）
    let stored = task_repo.find_by_id("t1").await.unwrap().unwrap();
    assert_eq!(stored.last_checked_at, Some(now));
    assert!(stored.version >= 1);
}

#[tokio::test]
async fn test_five_workers_drain_queue_without_overlap() {
    let task_repo = Arc::new(InMemoryTaskRepository::new());
    let job_repo = Arc::new(InMemoryJobRepository::new());
    let deliverer = Arc::new(CountingDeliverer::succeeding());
    let now = Utc.with_ymd_and_hms(2023, 10, 28, 10, 0, 0).unwrap();

    let task = sample_task("t1", "* * * * *", now - Duration::minutes(10));
    task_repo.save(&task).await.unwrap();

    let scheduler = JobScheduler::new(
        Arc::clone(&task_repo) as _,
        Arc::clone(&job_repo) as _,
        Arc::new(UuidGenerator),
    );
    assert_eq!(scheduler.check_and_enqueue(now).await.unwrap(), 10);

    // 5个并发worker，每个处理一个作业
    let mut handles = Vec::new();
    for _ in 0..5 {
        let executor = JobExecutor::new(
            Arc::clone(&job_repo) as _,
            Arc::clone(&task_repo) as _,
            Arc::clone(&deliverer) as _,
        );
        handles.push(tokio::spawn(async move {
            executor.run_pending_job().await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let job = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(seen.insert(job.id.clone()), "作业 {} 被重复执行", job.id);
    }
    assert_eq!(seen.len(), 5);
    assert_eq!(deliverer.calls.load(Ordering::SeqCst), 5);
}
