//! Briefing generation: model digest with a deterministic safety net.
//!
//! The model only ever contributes judgment calls (top outcomes, deferral
//! suggestions, narrative summary). Everything with a right answer — the
//! must-do list, overdue items, waiting-on list — is computed here and never
//! delegated, so a bad completion degrades the prose, not the facts.

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde_json::Value;

use super::buckets::{bucket_tasks, TaskBuckets};
use super::{BriefingContent, MustDoItem, OverdueItem, WaitingItem, MUST_DO_CAP};
use crate::db::{Db, DbError};
use crate::llm::{extract_json_object, LanguageModel};
use crate::types::{BriefingPreference, Task};

/// Generate a briefing for a task snapshot.
///
/// Always returns usable content: if the model call or its output is
/// unusable in any way, the deterministic fallback fills every section.
pub async fn generate_briefing(
    llm: &dyn LanguageModel,
    tasks: &[Task],
    prefs: &BriefingPreference,
    today: NaiveDate,
) -> BriefingContent {
    let tz: Tz = prefs
        .timezone
        .parse()
        .unwrap_or(chrono_tz::America::New_York);
    let buckets = bucket_tasks(tasks, prefs, today, tz);

    let prompt = build_briefing_prompt(&buckets, today);
    match llm.complete(&prompt).await {
        Ok(response) => match parse_ai_sections(&response) {
            Some(ai) => merge_briefing(&buckets, ai),
            None => {
                log::warn!("briefing: model output unusable, using deterministic fallback");
                fallback_briefing(&buckets)
            }
        },
        Err(e) => {
            log::warn!("briefing: model call failed ({}), using deterministic fallback", e);
            fallback_briefing(&buckets)
        }
    }
}

/// Generate today's briefing for one user and persist it.
///
/// One briefing per (workspace, user, date); regeneration overwrites.
pub async fn run_briefing(
    db: &Db,
    llm: &dyn LanguageModel,
    workspace_id: &str,
    user_id: &str,
) -> Result<BriefingContent, DbError> {
    let prefs = db.preference_or_default(workspace_id, user_id)?;
    let tz: Tz = prefs
        .timezone
        .parse()
        .unwrap_or(chrono_tz::America::New_York);
    let today = chrono::Utc::now().with_timezone(&tz).date_naive();

    let tasks = db.tasks_for_user(workspace_id, user_id)?;
    let content = generate_briefing(llm, &tasks, &prefs, today).await;

    let content_json =
        serde_json::to_string(&content).unwrap_or_else(|_| "{}".to_string());
    db.upsert_briefing(
        workspace_id,
        user_id,
        &today.format("%Y-%m-%d").to_string(),
        &content_json,
    )?;

    log::info!(
        "briefing generated for {}/{} ({} must-do, ai={})",
        workspace_id,
        user_id,
        content.must_do.len(),
        content.ai_generated
    );
    Ok(content)
}

// ============================================================================
// Deterministic sections
// ============================================================================

/// Overdue + due-today + urgent, deduplicated, capped at [`MUST_DO_CAP`].
fn compute_must_do(buckets: &TaskBuckets) -> Vec<MustDoItem> {
    let mut items: Vec<MustDoItem> = Vec::new();
    let mut push = |task: &Task| {
        if items.len() < MUST_DO_CAP && !items.iter().any(|i| i.task_id == task.id) {
            items.push(MustDoItem::from_task(task));
        }
    };

    for (task, _) in &buckets.overdue {
        push(task);
    }
    for task in &buckets.due_today {
        push(task);
    }
    for task in &buckets.urgent {
        push(task);
    }
    items
}

fn compute_overdue(buckets: &TaskBuckets) -> Vec<OverdueItem> {
    buckets
        .overdue
        .iter()
        .map(|(task, days)| OverdueItem {
            task_id: task.id.clone(),
            title: task.title.clone(),
            due_date: task.due_date.clone().unwrap_or_default(),
            days_overdue: *days,
        })
        .collect()
}

fn compute_waiting(buckets: &TaskBuckets) -> Vec<WaitingItem> {
    buckets
        .waiting
        .iter()
        .map(|task| WaitingItem {
            task_id: task.id.clone(),
            title: task.title.clone(),
            waiting_for: task.description.clone(),
        })
        .collect()
}

fn count_summary(buckets: &TaskBuckets) -> String {
    let mut summary = format!(
        "You have {} active task(s), {} urgent.",
        buckets.active_total(),
        buckets.urgent.len()
    );
    if !buckets.overdue.is_empty() {
        summary.push_str(&format!(" {} overdue.", buckets.overdue.len()));
    }
    if !buckets.completed_today.is_empty() {
        summary.push_str(&format!(
            " {} completed today.",
            buckets.completed_today.len()
        ));
    }
    summary
}

/// All-deterministic digest. `defer_suggestions` stays empty: deferral is a
/// judgment call and the model is its only source.
fn fallback_briefing(buckets: &TaskBuckets) -> BriefingContent {
    let must_do = compute_must_do(buckets);
    let top_outcomes = must_do.iter().take(3).map(|i| i.title.clone()).collect();

    BriefingContent {
        top_outcomes,
        must_do,
        waiting_on: compute_waiting(buckets),
        defer_suggestions: Vec::new(),
        overdue: compute_overdue(buckets),
        summary: count_summary(buckets),
        ai_generated: false,
    }
}

// ============================================================================
// AI merge
// ============================================================================

struct AiSections {
    top_outcomes: Vec<String>,
    defer_suggestions: Vec<String>,
    summary: String,
}

/// Parse the model's response, requiring the full expected shape.
/// Anything short of that sends the caller to the fallback path.
fn parse_ai_sections(text: &str) -> Option<AiSections> {
    let json_str = extract_json_object(text)?;
    let val: Value = serde_json::from_str(&json_str).ok()?;

    let top_outcomes = string_array(val.get("top_outcomes")?)?;
    let defer_suggestions = string_array(val.get("defer_suggestions")?)?;
    let summary = val.get("summary")?.as_str()?.trim().to_string();
    if summary.is_empty() {
        return None;
    }

    Some(AiSections {
        top_outcomes,
        defer_suggestions,
        summary,
    })
}

fn string_array(val: &Value) -> Option<Vec<String>> {
    let items = val.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

fn merge_briefing(buckets: &TaskBuckets, ai: AiSections) -> BriefingContent {
    BriefingContent {
        top_outcomes: ai.top_outcomes,
        must_do: compute_must_do(buckets),
        waiting_on: compute_waiting(buckets),
        defer_suggestions: ai.defer_suggestions,
        overdue: compute_overdue(buckets),
        summary: ai.summary,
        ai_generated: true,
    }
}

// ============================================================================
// Prompt
// ============================================================================

fn build_briefing_prompt(buckets: &TaskBuckets, today: NaiveDate) -> String {
    let mut prompt = String::with_capacity(4_000);

    prompt.push_str("You are an executive assistant preparing a morning task briefing. ");
    prompt.push_str("Be concrete and brief; the reader has five minutes.\n\n");
    prompt.push_str(&format!("Today is {}.\n\n", today.format("%A, %B %-d, %Y")));

    prompt.push_str("# Task Backlog\n\n");
    push_section(
        &mut prompt,
        "Overdue",
        buckets
            .overdue
            .iter()
            .map(|(t, days)| format!("{} ({} days overdue)", t.title, days)),
    );
    push_section(
        &mut prompt,
        "Due today",
        buckets.due_today.iter().map(|t| t.title.clone()),
    );
    push_section(
        &mut prompt,
        "Urgent",
        buckets.urgent.iter().map(|t| t.title.clone()),
    );
    push_section(
        &mut prompt,
        "High priority",
        buckets.high_priority.iter().map(|t| t.title.clone()),
    );
    push_section(
        &mut prompt,
        "Waiting on others",
        buckets.waiting.iter().map(|t| t.title.clone()),
    );
    push_section(
        &mut prompt,
        "Other active",
        buckets.active.iter().map(|t| t.title.clone()),
    );
    push_section(
        &mut prompt,
        "Completed today",
        buckets.completed_today.iter().map(|t| t.title.clone()),
    );

    prompt.push_str("\n# Output Format\n\n");
    prompt.push_str(
        "Respond with ONLY a valid JSON object (no markdown fences, no commentary):\n\n",
    );
    prompt.push_str(r#"{
  "top_outcomes": ["The 2-3 outcomes that would make today a win"],
  "defer_suggestions": ["Tasks that can safely wait, with a short reason"],
  "summary": "Two sentences capturing the shape of the day"
}"#);
    prompt.push('\n');

    prompt
}

fn push_section(prompt: &mut String, heading: &str, items: impl Iterator<Item = String>) {
    let lines: Vec<String> = items.collect();
    if lines.is_empty() {
        return;
    }
    prompt.push_str(&format!("## {}\n", heading));
    for line in lines {
        prompt.push_str(&format!("- {}\n", line));
    }
    prompt.push('\n');
}

// ============================================================================
// Tests
// ============================================================================
