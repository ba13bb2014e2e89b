//! Shared domain types.
//!
//! Everything here is serde-serializable so rows can round-trip through the
//! database layer and the dashboard API without bespoke mapping code.

use serde::{Deserialize, Serialize};

// ============================================================================
// Providers
// ============================================================================

/// Supported mailbox providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "gmail" => Some(Provider::Gmail),
            "outlook" => Some(Provider::Outlook),
            _ => None,
        }
    }
}

// ============================================================================
// Task vocabulary
// ============================================================================

/// Task priority. `None` is the default for anything the extractor can't
/// place on the scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    #[default]
    None,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::None => "none",
        }
    }

    /// Lenient parse used on LLM output — anything unrecognized maps to `None`.
    pub fn parse_lenient(s: &str) -> Priority {
        match s.trim().to_lowercase().as_str() {
            "urgent" => Priority::Urgent,
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => Priority::None,
        }
    }
}

/// Task lifecycle status. `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Waiting,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> TaskStatus {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "waiting" => TaskStatus::Waiting,
            "done" => TaskStatus::Done,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Todo,
        }
    }

    /// Terminal states drop out of every briefing bucket except completed-today.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

// ============================================================================
// Scan configuration
// ============================================================================

/// One mailbox-scan configuration per (workspace, user, provider).
///
/// Token columns hold AES-GCM ciphertext (base64); plaintext tokens never
/// touch the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub provider: Provider,
    pub enabled: bool,
    pub scan_interval_hours: i64,
    /// Candidates scoring below this are routed to human review.
    pub confidence_threshold: f64,
    /// "HH:MM"; the window may wrap past midnight (e.g. 22:00 → 06:00).
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub weekend_scan: bool,
    pub access_token_enc: String,
    pub refresh_token_enc: String,
    pub mailbox_address: String,
    pub last_scan_at: Option<String>,
}

// ============================================================================
// Scan log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> ScanStatus {
        match s {
            "completed" => ScanStatus::Completed,
            "failed" => ScanStatus::Failed,
            _ => ScanStatus::Running,
        }
    }
}

/// Append-only record of one scan run. Never mutated after finalization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanLog {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub emails_scanned: i64,
    pub tasks_extracted: i64,
    pub tasks_for_review: i64,
    pub errors: Vec<String>,
    pub status: ScanStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Counters accumulated during a run, folded into the final ScanLog.
#[derive(Debug, Default)]
pub struct ScanTally {
    pub emails_scanned: i64,
    pub tasks_extracted: i64,
    pub tasks_for_review: i64,
    pub errors: Vec<String>,
}

// ============================================================================
// Emails
// ============================================================================

/// Minimal identity returned by a provider's list call — enough to dedup
/// before paying for a detail fetch.
#[derive(Debug, Clone)]
pub struct EmailStub {
    pub id: String,
    /// Present when the provider returns full messages in the list call.
    pub full: Option<NormalizedEmail>,
}

/// Provider-agnostic email shape consumed by the extractor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEmail {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub body: String,
    pub snippet: String,
}

// ============================================================================
// Tasks
// ============================================================================

/// A task candidate extracted from one email. In-memory only; persisted as a
/// `Task` with the review flag applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    /// ISO date (YYYY-MM-DD) when the LLM found one.
    pub due_date: Option<String>,
    /// 0.0–1.0, rounded to 2 decimals.
    pub confidence_score: f64,
}

/// A workspace task row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub due_date: Option<String>,
    pub needs_review: bool,
    pub confidence: Option<f64>,
    pub project_id: Option<String>,
    pub source_id: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

// ============================================================================
// Briefing preferences
// ============================================================================

/// Per-user briefing delivery settings. `defaults` supplies the documented
/// fallbacks when no row exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefingPreference {
    pub workspace_id: String,
    pub user_id: String,
    pub delivery_time: String,
    pub timezone: String,
    pub enabled: bool,
    pub include_email: bool,
    pub project_filter: Vec<String>,
    pub priority_filter: Vec<Priority>,
}

impl BriefingPreference {
    pub fn defaults(workspace_id: &str, user_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            delivery_time: "08:00".to_string(),
            timezone: "America/New_York".to_string(),
            enabled: false,
            include_email: false,
            project_filter: Vec::new(),
            priority_filter: Vec::new(),
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// A notification row for the dashboard to surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub created_at: String,
}

// ============================================================================
// Tests
// ============================================================================
