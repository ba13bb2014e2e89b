//! Deterministic task bucketing for briefing generation.
//!
//! Pure functions of (task set, filters, reference date): no clock reads, no
//! I/O. A task may land in several buckets at once — overdue AND urgent is
//! the whole point of a morning briefing.

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;

use crate::types::{BriefingPreference, Priority, Task, TaskStatus};

/// Bucketed view of a task snapshot.
#[derive(Debug, Default)]
pub struct TaskBuckets {
    /// Overdue tasks paired with days overdue, most overdue first.
    pub overdue: Vec<(Task, i64)>,
    pub due_today: Vec<Task>,
    pub urgent: Vec<Task>,
    pub high_priority: Vec<Task>,
    pub waiting: Vec<Task>,
    /// Non-terminal tasks not otherwise special.
    pub active: Vec<Task>,
    pub completed_today: Vec<Task>,
}

impl TaskBuckets {
    /// Count of all non-terminal tasks in the snapshot after filtering.
    pub fn active_total(&self) -> usize {
        // overdue/due_today/urgent/high_priority overlap with `active`, so the
        // canonical count comes from re-walking distinct ids.
        let mut ids: Vec<&str> = self
            .overdue
            .iter()
            .map(|(t, _)| t.id.as_str())
            .chain(self.due_today.iter().map(|t| t.id.as_str()))
            .chain(self.urgent.iter().map(|t| t.id.as_str()))
            .chain(self.high_priority.iter().map(|t| t.id.as_str()))
            .chain(self.waiting.iter().map(|t| t.id.as_str()))
            .chain(self.active.iter().map(|t| t.id.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Categorize a task snapshot into briefing buckets.
///
/// Project and priority allow-lists apply first; terminal tasks are excluded
/// from everything except `completed_today`. Due-date comparisons are by
/// calendar day in the reference timezone, never time-of-day.
pub fn bucket_tasks(
    tasks: &[Task],
    prefs: &BriefingPreference,
    today: NaiveDate,
    tz: Tz,
) -> TaskBuckets {
    let mut buckets = TaskBuckets::default();

    for task in tasks {
        if !passes_filters(task, prefs) {
            continue;
        }

        if task.status.is_terminal() {
            if task.status == TaskStatus::Done && completed_on(task, today, tz) {
                buckets.completed_today.push(task.clone());
            }
            continue;
        }

        let due = task
            .due_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        let mut special = false;

        if let Some(due) = due {
            if due < today {
                buckets.overdue.push((task.clone(), (today - due).num_days()));
                special = true;
            } else if due == today {
                buckets.due_today.push(task.clone());
                special = true;
            }
        }

        match task.priority {
            Priority::Urgent => {
                buckets.urgent.push(task.clone());
                special = true;
            }
            Priority::High => {
                buckets.high_priority.push(task.clone());
                special = true;
            }
            _ => {}
        }

        if task.status == TaskStatus::Waiting {
            buckets.waiting.push(task.clone());
            special = true;
        }

        if !special {
            buckets.active.push(task.clone());
        }
    }

    buckets.overdue.sort_by(|a, b| b.1.cmp(&a.1));
    buckets
}

fn passes_filters(task: &Task, prefs: &BriefingPreference) -> bool {
    if !prefs.project_filter.is_empty() {
        let in_project = task
            .project_id
            .as_ref()
            .map(|p| prefs.project_filter.contains(p))
            .unwrap_or(false);
        if !in_project {
            return false;
        }
    }
    if !prefs.priority_filter.is_empty() && !prefs.priority_filter.contains(&task.priority) {
        return false;
    }
    true
}

/// Whether a done task's `completed_at` falls on the reference date,
/// evaluated in the reference timezone.
fn completed_on(task: &Task, today: NaiveDate, tz: Tz) -> bool {
    task.completed_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&tz).date_naive() == today)
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
