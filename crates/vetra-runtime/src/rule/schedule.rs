//! Cron scheduling helpers for schedule rules.

use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use vetra_core::DatetimeRange;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a compound duration like "30s", "1m30s", "500ms" or "1h".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::Schedule("empty duration".to_string()));
    }
    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let mut unit = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = num
            .parse()
            .map_err(|_| EngineError::Schedule(format!("invalid duration {}", s)))?;
        num.clear();
        let millis = match unit.as_str() {
            "ms" => value,
            "s" => value * 1000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            other => {
                return Err(EngineError::Schedule(format!(
                    "unknown duration unit {} in {}",
                    other, s
                )))
            }
        };
        total += Duration::from_millis(millis as u64);
    }
    if !num.is_empty() {
        return Err(EngineError::Schedule(format!(
            "duration {} is missing a unit",
            s
        )));
    }
    Ok(total)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| EngineError::Schedule(format!("invalid datetime {}: {}", s, e)))
}

/// Whether `now` falls inside any configured range. No ranges means always.
pub fn is_in_schedule_ranges(now: DateTime<Utc>, ranges: &[DatetimeRange]) -> Result<bool> {
    if ranges.is_empty() {
        return Ok(true);
    }
    for r in ranges {
        let begin = parse_datetime(&r.begin)?;
        let end = parse_datetime(&r.end)?;
        if begin > end {
            return Err(EngineError::Schedule(format!(
                "range begin {} is after end {}",
                r.begin, r.end
            )));
        }
        if now >= begin && now <= end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `now` lies after every configured range. No ranges means never.
pub fn is_after_time_ranges(now: DateTime<Utc>, ranges: &[DatetimeRange]) -> bool {
    if ranges.is_empty() {
        return false;
    }
    ranges
        .iter()
        .all(|r| parse_datetime(&r.end).map(|end| now > end).unwrap_or(false))
}

pub fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| EngineError::Schedule(format!("invalid cron {}: {}", expr, e)))
}

/// If the cron's latest activation is still running at `now`, return the
/// remaining duration of that activation.
pub fn is_in_running_schedule(
    expr: &str,
    now: DateTime<Utc>,
    d: Duration,
) -> Result<(bool, Duration)> {
    let schedule = parse_cron(expr)?;
    let window = chrono::Duration::from_std(d)
        .map_err(|e| EngineError::Schedule(format!("invalid duration: {}", e)))?;
    let mut last_fire: Option<DateTime<Utc>> = None;
    for fire in schedule.after(&(now - window)) {
        if fire > now {
            break;
        }
        last_fire = Some(fire);
    }
    match last_fire {
        Some(fire) => {
            let end = fire + window;
            if end > now {
                let remaining = (end - now)
                    .to_std()
                    .map_err(|e| EngineError::Schedule(e.to_string()))?;
                Ok((true, remaining))
            } else {
                Ok((false, Duration::ZERO))
            }
        }
        None => Ok((false, Duration::ZERO)),
    }
}

/// Next fire time of a cron expression, in epoch milliseconds.
pub fn next_schedule_time(expr: &str, now: DateTime<Utc>) -> Result<i64> {
    let schedule = parse_cron(expr)?;
    schedule
        .after(&now)
        .next()
        .map(|t| t.timestamp_millis())
        .ok_or_else(|| EngineError::Schedule(format!("cron {} never fires", expr)))
}

pub type CronEntryId = u64;
type CronJob = Arc<dyn Fn() + Send + Sync>;

/// Background cron: one task per registered entry, firing its job at every
/// schedule match until removed.
#[derive(Default)]
pub struct BackgroundCron {
    next_id: AtomicU64,
    entries: Mutex<HashMap<CronEntryId, JoinHandle<()>>>,
}

impl BackgroundCron {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, expr: &str, job: CronJob) -> Result<CronEntryId> {
        let schedule = parse_cron(expr)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    return;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(next = %next, "cron entry sleeping");
                tokio::time::sleep(wait).await;
                job();
            }
        });
        self.entries.lock().unwrap().insert(id, handle);
        Ok(id)
    }

    pub fn remove(&self, id: CronEntryId) {
        if let Some(handle) = self.entries.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for BackgroundCron {
    fn drop(&mut self) {
        for (_, handle) in self.entries.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(
            parse_duration("1m30s").unwrap(),
            Duration::from_secs(90)
        );
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn test_schedule_ranges() {
        let ranges = vec![DatetimeRange {
            begin: "2024-01-01 00:00:00".to_string(),
            end: "2024-06-30 23:59:59".to_string(),
        }];
        let inside = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        assert!(is_in_schedule_ranges(inside, &ranges).unwrap());
        assert!(!is_in_schedule_ranges(after, &ranges).unwrap());
        assert!(is_after_time_ranges(after, &ranges));
        assert!(!is_after_time_ranges(inside, &ranges));

        // Empty ranges: always in, never after.
        assert!(is_in_schedule_ranges(after, &[]).unwrap());
        assert!(!is_after_time_ranges(after, &[]));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let bad = vec![DatetimeRange {
            begin: "not a date".to_string(),
            end: "2024-06-30 23:59:59".to_string(),
        }];
        assert!(is_in_schedule_ranges(Utc::now(), &bad).is_err());

        let reversed = vec![DatetimeRange {
            begin: "2024-06-30 00:00:00".to_string(),
            end: "2024-01-01 00:00:00".to_string(),
        }];
        assert!(is_in_schedule_ranges(Utc::now(), &reversed).is_err());
    }

    #[test]
    fn test_running_schedule_window() {
        // Fires at the top of every minute for 30 seconds.
        let expr = "0 * * * * *";
        let d = Duration::from_secs(30);

        // 10 s into a minute: running, ~20 s remain.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 10).unwrap();
        let (running, remaining) = is_in_running_schedule(expr, now, d).unwrap();
        assert!(running);
        assert_eq!(remaining, Duration::from_secs(20));

        // 45 s into a minute: the 30 s activation is over.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 45).unwrap();
        let (running, _) = is_in_running_schedule(expr, now, d).unwrap();
        assert!(!running);
    }

    #[test]
    fn test_next_schedule_time() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 30).unwrap();
        let next = next_schedule_time("0 * * * * *", now).unwrap();
        let expect = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();
        assert_eq!(next, expect.timestamp_millis());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(parse_cron("not a cron").is_err());
        assert!(matches!(
            parse_cron("bad").unwrap_err(),
            EngineError::Schedule(_)
        ));
    }

    #[tokio::test]
    async fn test_background_cron_fires_and_removes() {
        let cron = BackgroundCron::new();
        let fired = Arc::new(AtomicU64::new(0));
        let f = fired.clone();
        // Every second.
        let id = cron
            .add("* * * * * *", Arc::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
        cron.remove(id);
        let count = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }
}
