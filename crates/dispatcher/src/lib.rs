//! 调度器
//!
//! 核心的追赶式调度逻辑：每个tick为所有活跃任务计算自上次检查点以来
//! 的全部到期时刻，逐一物化为作业入队，并原子推进检查点。

pub mod cron_utils;
pub mod scheduler;

pub use cron_utils::{CronSchedule, ScheduleCache};
pub use scheduler::JobScheduler;
