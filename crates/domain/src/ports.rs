//! 外部协作者接口
//!
//! 时钟、ID生成器和HTTP投递器的抽象，便于在测试中替换。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use cronflow_errors::SchedulerResult;

use crate::entities::HttpRequestInfo;

/// 可测试的时间源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// UTC墙钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 无冲突的不透明ID生成器
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// UUIDv4生成器
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// 作业的HTTP投递器
///
/// 执行器的工作步骤通过该接口发出任务载荷定义的HTTP请求。
/// 投递最多执行一次尝试；重试策略由上层决定。
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, request: &HttpRequestInfo) -> SchedulerResult<()>;
}
