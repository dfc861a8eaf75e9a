//! CRON表达式解析与求值
//!
//! 经典5字段形式（分 时 日 月 周），UTC求值，分辨率为一分钟。
//! 每个字段接受数值、`*`、列表 `a,b`、区间 `a-b` 和步进 `*/n`、`a-b/n`。
//! 周字段0-6，0为周日。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use parking_lot::RwLock;

use cronflow_errors::{SchedulerError, SchedulerResult};

/// 求值横跨的最大年数。日月组合不可能成立时（如2月31日）用于终止搜索。
const SEARCH_HORIZON_DAYS: i64 = 365 * 4 + 1;

/// 解析后的CRON调度
///
/// 解析一次即可反复求值；不可变，跨线程共享安全。
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// 解析5字段CRON表达式
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let invalid = |message: String| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            message,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("期望5个字段，实际 {} 个", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59, "分钟").map_err(&invalid)?;
        let hours = parse_field(fields[1], 0, 23, "小时").map_err(&invalid)?;
        let days_of_month = parse_field(fields[2], 1, 31, "日").map_err(&invalid)?;
        let months = parse_field(fields[3], 1, 12, "月").map_err(&invalid)?;
        let days_of_week = parse_field(fields[4], 0, 6, "周").map_err(&invalid)?;

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            // 经典cron：以 `*` 开头的日/周字段视为未限定，
            // 两者都限定时按“任一匹配”取并集
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// 严格大于 `after` 的下一个到期时刻
    ///
    /// 搜索截断到整分钟后逐字段跳跃推进；超出搜索边界返回 `None`。
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);

        loop {
            if t > horizon {
                return None;
            }
            if !self.months.contains(&t.month()) {
                t = next_month_start(&t)?;
                continue;
            }
            if !self.day_matches(&t) {
                t = next_day_start(&t)?;
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
    }

    /// `(from, to]` 窗口内的全部到期时刻，升序
    ///
    /// 左开右闭：恰好落在 `from` 的时刻不会重复发出，恰好落在 `to`
    /// 的时刻会发出。空窗口返回空列表。
    pub fn due_run_times(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut runs = Vec::new();
        let mut cursor = from;
        while let Some(next) = self.next_after(cursor) {
            if next > to {
                break;
            }
            runs.push(next);
            cursor = next;
        }
        runs
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&t.day());
        let dow = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn next_month_start(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn next_day_start(t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Some(Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?))
}

/// 解析单个字段为允许值集合
fn parse_field(raw: &str, min: u32, max: u32, unit: &str) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(format!("{unit}字段包含空项"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("{unit}字段的步长 {step:?} 不是数字"))?;
                if step == 0 {
                    return Err(format!("{unit}字段的步长不能为0"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, min, max, unit)?;
            let hi = parse_value(b, min, max, unit)?;
            if lo > hi {
                return Err(format!("{unit}字段的区间 {range} 上界小于下界"));
            }
            (lo, hi)
        } else {
            if part.contains('/') {
                return Err(format!("{unit}字段的步进只能用于 * 或区间"));
            }
            let v = parse_value(range, min, max, unit)?;
            (v, v)
        };

        let mut v = lo;
        while v <= hi {
            values.insert(v);
            v += step;
        }
    }

    if values.is_empty() {
        return Err(format!("{unit}字段没有任何允许值"));
    }
    Ok(values)
}

fn parse_value(raw: &str, min: u32, max: u32, unit: &str) -> Result<u32, String> {
    let v: u32 = raw
        .parse()
        .map_err(|_| format!("{unit}字段的值 {raw:?} 不是数字"))?;
    if v < min || v > max {
        return Err(format!("{unit}字段的值 {v} 超出范围 {min}-{max}"));
    }
    Ok(v)
}

/// 表达式解析缓存
///
/// 每个唯一的表达式字符串只解析一次；可被多个调度器实例并发使用。
#[derive(Default)]
pub struct ScheduleCache {
    schedules: RwLock<HashMap<String, Arc<CronSchedule>>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, expr: &str) -> SchedulerResult<Arc<CronSchedule>> {
        if let Some(schedule) = self.schedules.read().get(expr) {
            return Ok(Arc::clone(schedule));
        }

        let schedule = Arc::new(CronSchedule::parse(expr)?);
        self.schedules
            .write()
            .insert(expr.to_string(), Arc::clone(&schedule));
        Ok(schedule)
    }
}
