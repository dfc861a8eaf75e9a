use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use cronflow_domain::entities::{Job, Task};
use cronflow_domain::ports::IdGenerator;
use cronflow_domain::repositories::{JobRepository, TaskRepository};
use cronflow_errors::SchedulerResult;

use crate::cron_utils::ScheduleCache;

/// 追赶式作业调度器
///
/// 多个实例可以指向同一存储并发运行：作业层面靠
/// `(task_id, scheduled_at)` 唯一约束防止重复物化，任务层面靠
/// 乐观版本号保证每个窗口只有一个副本推进检查点。
pub struct JobScheduler {
    task_repo: Arc<dyn TaskRepository>,
    job_repo: Arc<dyn JobRepository>,
    id_gen: Arc<dyn IdGenerator>,
    schedules: ScheduleCache,
}

impl JobScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        job_repo: Arc<dyn JobRepository>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            task_repo,
            job_repo,
            id_gen,
            schedules: ScheduleCache::new(),
        }
    }

    /// 检查全部活跃任务并物化到期作业
    ///
    /// 对每个任务：计算 `(检查点, now]` 窗口内的到期时刻，逐个入队，
    /// 全部成功后把检查点推进到 `now`。单个任务的失败只影响它自己；
    /// 活跃任务列表读取失败则整个tick作废。返回本次入队的作业数。
    pub async fn check_and_enqueue(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let tasks = self.task_repo.find_all_active().await?;

        let mut enqueued_total = 0;
        for task in tasks {
            match self.schedule_task(&task, now).await {
                Some(count) => enqueued_total += count,
                None => continue,
            }
        }

        if enqueued_total > 0 {
            info!("本次调度入队了 {} 个作业", enqueued_total);
        }
        Ok(enqueued_total)
    }

    /// 处理单个任务；失败时返回 `None` 且不推进检查点
    async fn schedule_task(&self, task: &Task, now: DateTime<Utc>) -> Option<usize> {
        let schedule = match self.schedules.get(&task.cron_expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("任务 {} 的CRON表达式无效，本tick跳过: {}", task.id, e);
                return None;
            }
        };

        let due = schedule.due_run_times(task.checkpoint(), now);
        let mut enqueued = 0;

        for run_at in due {
            let job = Job::new(
                self.id_gen.new_id(),
                task.id.clone(),
                run_at,
                now,
            );
            match self.job_repo.enqueue(&job).await {
                Ok(()) => enqueued += 1,
                Err(e) if e.is_conflict() => {
                    // 另一个副本已经物化了这个到期时刻
                    debug!("任务 {} 在 {} 的作业已由其他副本入队", task.id, run_at);
                }
                Err(e) => {
                    // 不推进检查点，同一窗口下个tick重试
                    error!("任务 {} 的作业入队失败，本tick放弃该任务: {}", task.id, e);
                    return None;
                }
            }
        }

        let advanced = task.advance_checkpoint(now);
        match self.task_repo.save(&advanced).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                // 其他副本已推进检查点，并已为该窗口入队
                debug!("任务 {} 的检查点已由其他副本推进", task.id);
            }
            Err(e) => {
                error!("任务 {} 的检查点写回失败: {}", task.id, e);
                return None;
            }
        }

        Some(enqueued)
    }
}
