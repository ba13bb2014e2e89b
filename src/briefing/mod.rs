//! Daily briefing pipeline.
//!
//! `buckets` deterministically categorizes a task snapshot; `generate`
//! combines the buckets with a language-model digest and falls back to an
//! all-deterministic digest when the model output is unusable. The end user
//! never sees the difference between the two paths.

pub mod buckets;
pub mod generate;

use serde::{Deserialize, Serialize};

use crate::types::{Priority, Task};

/// Cap on the must-do list regardless of how much is on fire.
pub const MUST_DO_CAP: usize = 5;

/// A task surfaced on the must-do list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MustDoItem {
    pub task_id: String,
    pub title: String,
    pub priority: Priority,
    pub due_date: Option<String>,
}

impl MustDoItem {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            priority: task.priority,
            due_date: task.due_date.clone(),
        }
    }
}

/// An overdue task in display shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueItem {
    pub task_id: String,
    pub title: String,
    pub due_date: String,
    pub days_overdue: i64,
}

/// A waiting task with the reason it's blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingItem {
    pub task_id: String,
    pub title: String,
    /// The task description doubles as the "waiting for" reason.
    pub waiting_for: Option<String>,
}

/// The structured daily digest persisted per (workspace, user, date).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefingContent {
    pub top_outcomes: Vec<String>,
    pub must_do: Vec<MustDoItem>,
    pub waiting_on: Vec<WaitingItem>,
    pub defer_suggestions: Vec<String>,
    pub overdue: Vec<OverdueItem>,
    pub summary: String,
    /// False when the deterministic fallback produced this digest.
    pub ai_generated: bool,
}
