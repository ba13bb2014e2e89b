//! Task extraction from email content.
//!
//! Sends sanitized email text to the language model and validates the
//! response into candidate tasks. Fails closed: an unusable model response
//! is a typed failure the caller handles, never a panic, and an empty body
//! never reaches the model at all.

use serde_json::Value;
use thiserror::Error;

use crate::llm::{extract_json_array, LanguageModel, LlmError};
use crate::types::{CandidateTask, NormalizedEmail, Priority};

/// Email bodies are capped before prompting. Anything past this is signature
/// blocks and quoted reply chains, not new task material.
const MAX_BODY_CHARS: usize = 4_000;

/// Confidence assigned when the model omits or mangles the score.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Why an extraction produced no usable candidates.
#[derive(Debug, Error)]
pub enum ExtractionFailure {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Model response was not a JSON array")]
    UnusableResponse,
}

/// Extract candidate tasks from one email.
///
/// Returns `Ok(vec![])` for empty bodies (no model call) and for arrays that
/// validate down to nothing. Callers must handle the failure case explicitly;
/// the orchestrator treats it as zero candidates.
pub async fn extract_tasks(
    llm: &dyn LanguageModel,
    email: &NormalizedEmail,
) -> Result<Vec<CandidateTask>, ExtractionFailure> {
    if email.body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let body = sanitize_body(&email.body);
    let prompt = build_extraction_prompt(&email.subject, &email.sender, &body);

    let response = llm.complete(&prompt).await?;
    parse_extraction_response(&response)
}

// ============================================================================
// Sanitization
// ============================================================================

/// Strip markup and collapse whitespace, capping at [`MAX_BODY_CHARS`].
pub fn sanitize_body(body: &str) -> String {
    let text = if looks_like_html(body) {
        html2text::from_read(body.as_bytes(), 100).unwrap_or_else(|_| body.to_string())
    } else {
        body.to_string()
    };

    // Collapse runs of blank lines and trailing space the conversion leaves behind.
    let collapsed = regex::Regex::new(r"\n{3,}")
        .map(|re| re.replace_all(&text, "\n\n").into_owned())
        .unwrap_or(text);
    let trimmed = collapsed.trim();

    match trimmed.char_indices().nth(MAX_BODY_CHARS) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

fn looks_like_html(body: &str) -> bool {
    let lowered = body.to_lowercase();
    lowered.contains("<html") || lowered.contains("<body") || lowered.contains("<div")
        || lowered.contains("<p>") || lowered.contains("<br")
}

// ============================================================================
// Prompt
// ============================================================================

fn build_extraction_prompt(subject: &str, sender: &str, body: &str) -> String {
    let mut prompt = String::with_capacity(body.len() + 1_500);

    prompt.push_str("You are an assistant that extracts actionable tasks from emails. ");
    prompt.push_str("Only extract things the recipient actually needs to do. ");
    prompt.push_str("Newsletters, confirmations, and FYI threads usually contain no tasks.\n\n");

    prompt.push_str("# Email\n\n");
    prompt.push_str(&format!("From: {}\n", sender));
    prompt.push_str(&format!("Subject: {}\n\n", subject));
    prompt.push_str(body);
    prompt.push_str("\n\n# Output Format\n\n");
    prompt.push_str("Respond with ONLY a valid JSON array (no markdown fences, no commentary). ");
    prompt.push_str("Each element:\n\n");
    prompt.push_str(r#"[
  {
    "title": "Short imperative task title",
    "description": "One sentence of context, or null",
    "priority": "urgent|high|medium|low|none",
    "due_date": "YYYY-MM-DD or null",
    "confidence_score": 0.0
  }
]"#);
    prompt.push_str("\n\nconfidence_score is your certainty (0.0-1.0) that this is a genuine ");
    prompt.push_str("actionable task for the recipient. Return [] if there are no tasks.\n");

    prompt
}

// ============================================================================
// Response validation
// ============================================================================

/// Parse and validate the model's response text.
///
/// Rules: non-array top level is a failure; elements without a non-empty
/// string title are dropped; unknown priorities map to "none"; confidence
/// outside [0,1] or non-numeric defaults to 0.5; scores round to 2 decimals.
pub fn parse_extraction_response(text: &str) -> Result<Vec<CandidateTask>, ExtractionFailure> {
    let json_str = extract_json_array(text).ok_or(ExtractionFailure::UnusableResponse)?;
    let parsed: Value =
        serde_json::from_str(&json_str).map_err(|_| ExtractionFailure::UnusableResponse)?;
    let Value::Array(items) = parsed else {
        return Err(ExtractionFailure::UnusableResponse);
    };

    let mut tasks = Vec::new();
    for item in items {
        let Some(task) = validate_candidate(&item) else {
            continue;
        };
        tasks.push(task);
    }
    Ok(tasks)
}

fn validate_candidate(item: &Value) -> Option<CandidateTask> {
    let title = item
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())?
        .to_string();

    let description = item
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);

    let priority = item
        .get("priority")
        .and_then(Value::as_str)
        .map(Priority::parse_lenient)
        .unwrap_or(Priority::None);

    let due_date = item
        .get("due_date")
        .and_then(Value::as_str)
        .filter(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok())
        .map(str::to_string);

    let confidence_score = item
        .get("confidence_score")
        .and_then(Value::as_f64)
        .filter(|score| (0.0..=1.0).contains(score))
        .unwrap_or(DEFAULT_CONFIDENCE);

    Some(CandidateTask {
        title,
        description,
        priority,
        due_date,
        confidence_score: round2(confidence_score),
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModel {
        calls: AtomicUsize,
        response: String,
    }

    impl CountingModel {
        fn new(response: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: response.to_string(),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn email(body: &str) -> NormalizedEmail {
        NormalizedEmail {
            id: "m1".to_string(),
            subject: "Follow up".to_string(),
            sender: "jane@example.com".to_string(),
            date: "2026-02-07".to_string(),
            body: body.to_string(),
            snippet: String::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_body_skips_llm() {
        let model = CountingModel::new("[]");
        let result = extract_tasks(&model, &email("   \n\t  ")).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extracts_valid_tasks() {
        let model = CountingModel::new(
            r#"[
                {"title": "Send deck", "description": "Updated numbers", "priority": "high",
                 "due_date": "2026-02-10", "confidence_score": 0.92},
                {"title": "", "priority": "low", "confidence_score": 0.9},
                {"title": "Book room", "priority": "someday", "confidence_score": 1.7}
            ]"#,
        );
        let tasks = extract_tasks(&model, &email("Can you send the deck?"))
            .await
            .unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "Send deck");
        assert_eq!(tasks[0].priority, Priority::High);
        assert_eq!(tasks[0].due_date.as_deref(), Some("2026-02-10"));
        assert_eq!(tasks[0].confidence_score, 0.92);

        // Unknown priority defaults to none; out-of-range confidence to 0.5.
        assert_eq!(tasks[1].priority, Priority::None);
        assert_eq!(tasks[1].confidence_score, 0.5);
    }

    #[test]
    fn test_non_array_response_is_failure() {
        assert!(matches!(
            parse_extraction_response(r#"{"title": "not an array"}"#),
            Err(ExtractionFailure::UnusableResponse)
        ));
        assert!(matches!(
            parse_extraction_response("I couldn't find any tasks, sorry!"),
            Err(ExtractionFailure::UnusableResponse)
        ));
    }

    #[test]
    fn test_empty_array_is_ok() {
        assert!(parse_extraction_response("[]").unwrap().is_empty());
    }

    #[test]
    fn test_response_with_markdown_fences() {
        let text = "```json\n[{\"title\": \"Pay invoice\", \"confidence_score\": 0.805}]\n```";
        let tasks = parse_extraction_response(text).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].confidence_score, 0.81);
    }

    #[test]
    fn test_confidence_defaults() {
        let tasks = parse_extraction_response(
            r#"[
                {"title": "A", "confidence_score": "very sure"},
                {"title": "B", "confidence_score": -0.3},
                {"title": "C"}
            ]"#,
        )
        .unwrap();
        assert!(tasks.iter().all(|t| t.confidence_score == 0.5));
    }

    #[test]
    fn test_invalid_due_date_dropped() {
        let tasks = parse_extraction_response(
            r#"[{"title": "A", "due_date": "next Tuesday", "confidence_score": 0.8}]"#,
        )
        .unwrap();
        assert!(tasks[0].due_date.is_none());
    }

    #[test]
    fn test_sanitize_strips_html_and_caps() {
        let html = "<html><body><p>Please review the report.</p></body></html>";
        let sanitized = sanitize_body(html);
        assert!(sanitized.contains("Please review the report."));
        assert!(!sanitized.contains("<p>"));

        let long = "word ".repeat(2_000);
        assert!(sanitize_body(&long).chars().count() <= MAX_BODY_CHARS);
    }
}
