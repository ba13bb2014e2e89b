//! Dashboard notification rows.
//!
//! Scans emit at most two notifications: a completion summary, and a review
//! prompt when any extracted task fell below the confidence threshold.

use chrono::Utc;
use uuid::Uuid;

use crate::db::{Db, DbError};
use crate::types::{Notification, ScanConfig, ScanTally};

pub const KIND_SCAN_COMPLETE: &str = "scan_complete";
pub const KIND_NEEDS_REVIEW: &str = "needs_review";

/// Record the end-of-scan summary notification.
pub fn notify_scan_complete(db: &Db, config: &ScanConfig, tally: &ScanTally) -> Result<(), DbError> {
    let body = scan_complete_body(tally);
    db.insert_notification(&Notification {
        id: Uuid::new_v4().to_string(),
        workspace_id: config.workspace_id.clone(),
        user_id: config.user_id.clone(),
        kind: KIND_SCAN_COMPLETE.to_string(),
        title: format!("Mailbox scan finished ({})", config.mailbox_address),
        body,
        created_at: Utc::now().to_rfc3339(),
    })
}

/// Record the review prompt for low-confidence tasks.
pub fn notify_needs_review(db: &Db, config: &ScanConfig, count: i64) -> Result<(), DbError> {
    db.insert_notification(&Notification {
        id: Uuid::new_v4().to_string(),
        workspace_id: config.workspace_id.clone(),
        user_id: config.user_id.clone(),
        kind: KIND_NEEDS_REVIEW.to_string(),
        title: "Tasks waiting for review".to_string(),
        body: format!(
            "{} task(s) from your latest mailbox scan need a quick review before they join your list.",
            count
        ),
        created_at: Utc::now().to_rfc3339(),
    })
}

fn scan_complete_body(tally: &ScanTally) -> String {
    let mut body = format!(
        "Scanned {} email(s), extracted {} task(s).",
        tally.emails_scanned, tally.tasks_extracted
    );
    if tally.tasks_for_review > 0 {
        body.push_str(&format!(" {} flagged for review.", tally.tasks_for_review));
    }
    if !tally.errors.is_empty() {
        body.push_str(&format!(" {} email(s) could not be processed.", tally.errors.len()));
    }
    body
}
