use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use cronflow_domain::entities::Task;
use cronflow_domain::repositories::TaskRepository;
use cronflow_errors::{SchedulerError, SchedulerResult};

/// 单互斥锁之下的任务存储，与PostgreSQL实现保持相同的可观测语义：
/// 带版本校验的原子upsert，所有读取返回游离快照。
#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<String, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &Task) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(&task.id) {
            if task.version != existing.version + 1 {
                return Err(SchedulerError::conflict(format!(
                    "任务 {} 期望版本 {}, 实际版本 {}",
                    task.id,
                    task.version - 1,
                    existing.version
                )));
            }
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.get(id).cloned())
    }

    async fn find_all_active(&self) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.values().filter(|t| t.is_active()).cloned().collect())
    }
}
