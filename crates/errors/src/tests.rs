use super::*;

#[test]
fn test_conflict_classification() {
    let err = SchedulerError::conflict("tasks.version 不匹配");
    assert!(err.is_conflict());
    assert!(!err.is_retryable());
    assert!(!err.is_fatal());
}

#[test]
fn test_retryable_classification() {
    assert!(SchedulerError::database_error("连接断开").is_retryable());
    assert!(SchedulerError::Delivery("timeout".to_string()).is_retryable());
    assert!(!SchedulerError::task_not_found("t1").is_retryable());
}

#[test]
fn test_fatal_classification() {
    assert!(SchedulerError::Internal("不变量被破坏".to_string()).is_fatal());
    assert!(SchedulerError::config_error("缺少数据库URL").is_fatal());
    assert!(!SchedulerError::conflict("重复入队").is_fatal());
}

#[test]
fn test_display_contains_ids() {
    let err = SchedulerError::task_not_found("task-42");
    assert!(err.to_string().contains("task-42"));

    let err = SchedulerError::InvalidCron {
        expr: "* * *".to_string(),
        message: "字段数量错误".to_string(),
    };
    assert!(err.to_string().contains("* * *"));
}

#[test]
fn test_from_serde_json_error() {
    let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: SchedulerError = parse_err.into();
    assert!(matches!(err, SchedulerError::Serialization(_)));
}
