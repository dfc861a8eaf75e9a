use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use cronflow_domain::entities::{Job, JobStatus};
use cronflow_domain::repositories::JobRepository;
use cronflow_errors::{SchedulerError, SchedulerResult};

#[derive(Default)]
struct JobStoreState {
    jobs: HashMap<String, Job>,
    /// 尚未被认领的pending作业ID
    queue: Vec<String>,
    occurrences: HashSet<(String, DateTime<Utc>)>,
}

/// 单互斥锁之下的作业存储兼工作队列
///
/// 与PostgreSQL实现保持相同的可观测语义：原子地弹出一个pending作业，
/// 已弹出的作业不会再被并发的出队方拿到；状态机由 `update_status`
/// 独立推进。
#[derive(Default)]
pub struct InMemoryJobRepository {
    state: Mutex<JobStoreState>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn enqueue(&self, job: &Job) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;

        if state.jobs.contains_key(&job.id) {
            return Err(SchedulerError::conflict(format!("作业 {} 已存在", job.id)));
        }
        let occurrence = (job.task_id.clone(), job.scheduled_at);
        if state.occurrences.contains(&occurrence) {
            return Err(SchedulerError::conflict(format!(
                "任务 {} 在 {} 的作业已存在",
                job.task_id, job.scheduled_at
            )));
        }

        state.occurrences.insert(occurrence);
        state.queue.push(job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn dequeue(&self) -> SchedulerResult<Option<Job>> {
        let mut state = self.state.lock().await;

        let mut oldest: Option<(usize, DateTime<Utc>, DateTime<Utc>)> = None;
        for (idx, id) in state.queue.iter().enumerate() {
            let Some(job) = state.jobs.get(id) else {
                continue;
            };
            let key = (job.scheduled_at, job.created_at);
            match oldest {
                Some((_, s, c)) if (s, c) <= key => {}
                _ => oldest = Some((idx, key.0, key.1)),
            }
        }

        let Some((idx, _, _)) = oldest else {
            return Ok(None);
        };

        let id = state.queue.remove(idx);
        Ok(state.jobs.get(&id).cloned())
    }

    async fn update_status(&self, job_id: &str, status: JobStatus) -> SchedulerResult<Job> {
        let mut state = self.state.lock().await;

        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(SchedulerError::job_not_found(job_id));
        };

        if !job.status.can_transition_to(status) {
            return Err(SchedulerError::InvalidTransition {
                from: job.status.to_string(),
                to: status.to_string(),
            });
        }

        job.apply_status(status, Utc::now());
        Ok(job.clone())
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(id).cloned())
    }
}
