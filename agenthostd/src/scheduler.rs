//! Task scheduler: polls the store for due tasks and hands each to a
//! callback for execution.
//!
//! Critical invariant: `next_run` is advanced (or the task is marked
//! completed, for one-shot tasks) *before* the callback runs, never after.
//! A crash between advancing the schedule and the callback completing loses
//! at most one firing — it can never repeat one indefinitely.
//!
//! Next-run calculation supports three schedule types:
//! - `cron`: parsed via the `cron` crate with timezone support
//! - `interval`: millisecond offset from now
//! - `once`: no next run (task moves to `completed`)

use std::str::FromStr;
use std::time::Duration;

use agenthost_core::PgPool;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// IANA timezone for cron expressions (e.g., "Europe/Berlin").
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timezone: "UTC".to_string(),
        }
    }
}

/// Callback invoked for each due task, after its schedule has already been
/// advanced. Expected to enqueue the task's prompt for execution.
pub type TaskCallback = Box<dyn Fn(DueTask) + Send + Sync>;

/// A task that is due for execution.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub id: String,
    pub group_folder: String,
    pub target_jid: String,
    pub prompt: String,
    pub context_mode: String,
}

/// The `cron` crate requires a seconds-first 6/7-field expression, but task
/// authors (and SPEC_FULL's own E2E-4 scenario) write standard 5-field Unix
/// cron (`"*/5 * * * *"`). Prepend a seconds field of `0` when the
/// expression is 5 fields so both forms parse the same way.
fn normalize_cron_expr(schedule_value: &str) -> String {
    if schedule_value.split_whitespace().count() == 5 {
        format!("0 {schedule_value}")
    } else {
        schedule_value.to_string()
    }
}

/// Calculate the next run time for a task after it completes.
pub fn calculate_next_run(schedule_type: &str, schedule_value: &str, timezone: &str) -> Option<String> {
    match schedule_type {
        "cron" => {
            let normalized = normalize_cron_expr(schedule_value);
            let schedule = match cron::Schedule::from_str(&normalized) {
                Ok(s) => s,
                Err(e) => {
                    error!(cron = schedule_value, err = %e, "invalid cron expression");
                    return None;
                }
            };
            let tz: chrono_tz::Tz = match timezone.parse() {
                Ok(t) => t,
                Err(_) => {
                    warn!(tz = timezone, "invalid timezone, falling back to UTC");
                    chrono_tz::Tz::UTC
                }
            };
            let now = Utc::now().with_timezone(&tz);
            schedule.after(&now).next().map(|dt| dt.with_timezone(&Utc).to_rfc3339())
        }
        "interval" => {
            let ms: u64 = match schedule_value.parse() {
                Ok(v) => v,
                Err(e) => {
                    error!(value = schedule_value, err = %e, "invalid interval ms");
                    return None;
                }
            };
            let next = Utc::now() + chrono::Duration::milliseconds(ms as i64);
            Some(next.to_rfc3339())
        }
        "once" => None,
        other => {
            warn!(schedule_type = other, "unknown schedule type");
            None
        }
    }
}

/// Format a task run result summary for storage.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        format!("Error: {e}")
    } else if let Some(r) = result {
        if r.len() > 200 { r[..200].to_string() } else { r.to_string() }
    } else {
        "Completed".to_string()
    }
}

/// Run the scheduler poll loop. Exits when `shutdown` signal fires.
pub async fn run_scheduler_loop(
    config: SchedulerConfig,
    pool: PgPool,
    on_task: TaskCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        poll_interval_ms = config.poll_interval.as_millis(),
        timezone = %config.timezone,
        "scheduler loop started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler loop shutting down");
                    return;
                }
            }
        }

        let tasks = match pool.get_due_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(err = %e, "failed to query due tasks");
                continue;
            }
        };

        if tasks.is_empty() {
            continue;
        }
        info!(count = tasks.len(), "found due tasks");

        for task in tasks {
            let next_run = calculate_next_run(&task.schedule_type, &task.schedule_value, &config.timezone);
            if let Err(e) = pool.advance_task_schedule(&task.id, next_run.as_deref()).await {
                error!(task_id = %task.id, err = %e, "failed to advance task schedule, skipping this firing");
                continue;
            }
            debug!(task_id = %task.id, group = %task.group_folder, next_run = ?next_run, "dispatching task");
            on_task(DueTask {
                id: task.id,
                group_folder: task.group_folder,
                target_jid: task.target_jid,
                prompt: task.prompt,
                context_mode: task.context_mode,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_next_run_interval() {
        let next = calculate_next_run("interval", "60000", "UTC");
        assert!(next.is_some());
        assert!(next.unwrap().contains('T'));
    }

    #[test]
    fn calculate_next_run_once() {
        assert!(calculate_next_run("once", "", "UTC").is_none());
    }

    #[test]
    fn calculate_next_run_cron() {
        let next = calculate_next_run("cron", "0 * * * * *", "UTC");
        assert!(next.is_some());
    }

    #[test]
    fn calculate_next_run_cron_accepts_five_field_unix_form() {
        let next = calculate_next_run("cron", "*/5 * * * *", "UTC");
        assert!(next.is_some(), "5-field unix cron must parse via seconds-field normalization");
    }

    #[test]
    fn normalize_cron_expr_prepends_seconds_field() {
        assert_eq!(normalize_cron_expr("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron_expr("0 * * * * *"), "0 * * * * *");
    }

    #[test]
    fn calculate_next_run_invalid_cron() {
        assert!(calculate_next_run("cron", "not a cron", "UTC").is_none());
    }

    #[test]
    fn calculate_next_run_invalid_interval() {
        assert!(calculate_next_run("interval", "abc", "UTC").is_none());
    }

    #[test]
    fn calculate_next_run_unknown_type() {
        assert!(calculate_next_run("weekly", "monday", "UTC").is_none());
    }

    #[test]
    fn result_summary_error() {
        assert_eq!(result_summary(None, Some("connection refused")), "Error: connection refused");
    }

    #[test]
    fn result_summary_truncates() {
        let long = "a".repeat(300);
        assert_eq!(result_summary(Some(&long), None).len(), 200);
    }

    #[test]
    fn result_summary_default() {
        assert_eq!(result_summary(None, None), "Completed");
    }

    #[test]
    fn result_summary_short() {
        assert_eq!(result_summary(Some("Done: 42 items processed"), None), "Done: 42 items processed");
    }
}
