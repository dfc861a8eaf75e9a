//! 领域实体
//!
//! 定义任务（Task）和作业（Job）两个核心实体。任务是操作员注册的周期性
//! 调度定义；作业是调度器为每个到期时刻物化出的一次执行记录。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务的HTTP请求载荷
///
/// 调度核心将其视为不透明数据，只有投递组件会解释它。
/// 持久化时序列化为JSON文档，`body` 字段以base64编码。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestInfo {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// 任务状态
///
/// 磁盘编码固定为整数（active=0, paused=1），属于持久化契约的一部分。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "PAUSED")]
    Paused,
}

impl TaskStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            TaskStatus::Active => 0,
            TaskStatus::Paused => 1,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, String> {
        match value {
            0 => Ok(TaskStatus::Active),
            1 => Ok(TaskStatus::Paused),
            other => Err(format!("无效的任务状态编码: {other}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i32 as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <i32 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        TaskStatus::from_i32(raw).map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <i32 as sqlx::Encode<sqlx::Postgres>>::encode(self.as_i32(), buf)
    }
}

/// 任务定义
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符（不透明字符串）
/// - `name`: 任务的人类可读名称
/// - `cron_expression`: 5字段cron表达式（分 时 日 月 周），UTC求值
/// - `payload`: 到期时投递的HTTP请求
/// - `status`: 任务状态，只有 Active 的任务才会产生作业
/// - `last_checked_at`: 已物化到的时间点；None 时回退到 `created_at`
/// - `version`: 乐观并发版本号，每次成功写入递增1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub payload: HttpRequestInfo,
    pub status: TaskStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Task {
    /// 创建新任务，初始版本为0
    pub fn new(
        id: String,
        name: String,
        cron_expression: String,
        payload: HttpRequestInfo,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            cron_expression,
            payload,
            status: TaskStatus::Active,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// 检查任务是否处于活跃状态
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Active)
    }

    /// 已物化窗口的上界：从未检查过的任务以创建时间为基准
    pub fn checkpoint(&self) -> DateTime<Utc> {
        self.last_checked_at.unwrap_or(self.created_at)
    }

    /// 推进检查点并递增版本，产生待写回的新快照
    pub fn advance_checkpoint(&self, now: DateTime<Utc>) -> Task {
        let mut advanced = self.clone();
        advanced.last_checked_at = Some(now);
        advanced.updated_at = now;
        advanced.version += 1;
        advanced
    }
}

/// 作业状态
///
/// 状态机沿 pending → running → {success, failed} 单向推进，终态不可离开。
/// 磁盘编码固定为整数（pending=0, running=1, success=2, failed=3）。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded => 2,
            JobStatus::Failed => 3,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, String> {
        match value {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Running),
            2 => Ok(JobStatus::Succeeded),
            3 => Ok(JobStatus::Failed),
            other => Err(format!("无效的作业状态编码: {other}")),
        }
    }

    /// 状态机的合法流转
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// 是否为终态（success/failed）
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "success",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i32 as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <i32 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        JobStatus::from_i32(raw).map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <i32 as sqlx::Encode<sqlx::Postgres>>::encode(self.as_i32(), buf)
    }
}

/// 作业：任务某个到期时刻的一次物化
///
/// `(task_id, scheduled_at)` 全局唯一，保证同一到期时刻在多个调度器
/// 副本并发下也只会入队一次。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// 创建新的待执行作业
    pub fn new(id: String, task_id: String, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_id,
            scheduled_at,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
    }

    /// 按目标状态套用相应的流转动作
    pub fn apply_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        match status {
            JobStatus::Running => self.mark_running(now),
            JobStatus::Succeeded => self.mark_succeeded(now),
            JobStatus::Failed => self.mark_failed(now),
            JobStatus::Pending => {
                self.status = JobStatus::Pending;
                self.updated_at = now;
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
