//! Scan orchestration.
//!
//! One function, [`run_scan`], owns the whole pipeline for a single config:
//! gates, token refresh, listing, dedup, extraction, persistence, and
//! notifications. The recurring sweep and the manual trigger are both thin
//! callers of it; the only difference between them is whether the interval
//! gate applies.
//!
//! Failure posture: a provider or model error on one email is recorded in
//! the run's error list and the scan moves on. Only failures that poison the
//! whole run (token refresh, the list call) mark the scan log failed.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use uuid::Uuid;

use thiserror::Error;

use crate::crypto::{CryptoError, TokenCipher};
use crate::db::{Db, DbError};
use crate::extractor::extract_tasks;
use crate::llm::LanguageModel;
use crate::mailbox::{adapter_for, MailboxApi, MailboxError};
use crate::notification::{notify_needs_review, notify_scan_complete};
use crate::secrets::Secrets;
use crate::types::{CandidateTask, ScanConfig, ScanStatus, ScanTally, Task, TaskStatus};

/// Upper bound on messages pulled per scan.
const MAX_RESULTS: u32 = 25;

/// Lookback ceiling for configs that have not scanned in a long time.
const MAX_LOOKBACK_HOURS: i64 = 168;

const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// What initiated a scan. Manual triggers bypass the interval gate but still
/// honor the enabled, quiet-hours, and weekend gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    Manual,
    Scheduled,
}

/// Why a scan did not run. No scan log row exists for a skipped run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    QuietHours,
    Weekend,
    NotDue,
}

/// Result of one scan attempt.
#[derive(Debug)]
pub enum ScanOutcome {
    Skipped(SkipReason),
    Completed {
        log_id: String,
        emails_scanned: i64,
        tasks_extracted: i64,
        tasks_for_review: i64,
        error_count: usize,
    },
    Failed {
        log_id: String,
        error: String,
    },
}

/// Run one scan for one config.
///
/// Database errors propagate; provider and model errors land in the scan
/// log instead. The returned outcome mirrors what was persisted.
pub async fn run_scan(
    db: &Db,
    mailbox: &dyn MailboxApi,
    llm: &dyn LanguageModel,
    cipher: &TokenCipher,
    config: &ScanConfig,
    trigger: ScanTrigger,
) -> Result<ScanOutcome, DbError> {
    let now = Utc::now();
    let local = chrono::Local::now();
    if let Some(reason) = gate(
        config,
        trigger,
        local.weekday(),
        local.hour() * 60 + local.minute(),
        now,
    ) {
        log::debug!("scan skipped for config {}: {:?}", config.id, reason);
        return Ok(ScanOutcome::Skipped(reason));
    }

    let log_id = db.insert_scan_log(&config.workspace_id, &config.user_id)?;
    log::info!(
        "scan started for {} ({}), log {}",
        config.mailbox_address,
        config.provider.as_str(),
        log_id
    );

    let mut tally = ScanTally::default();

    // Refresh first; a dead refresh token means the whole run is off.
    let access_token = match refresh_access_token(db, mailbox, cipher, config).await {
        Ok(token) => token,
        Err(e) => {
            let error = format!("token refresh failed: {}", e);
            log::error!("scan {} aborted: {}", log_id, error);
            tally.errors.push(error.clone());
            db.finalize_scan_log(&log_id, &tally, ScanStatus::Failed)?;
            return Ok(ScanOutcome::Failed { log_id, error });
        }
    };

    let hours_back = lookback_hours(config, now);
    let stubs = match mailbox
        .list_recent(&access_token, hours_back, MAX_RESULTS)
        .await
    {
        Ok(stubs) => stubs,
        Err(e) => {
            let error = format!("message list failed: {}", e);
            log::error!("scan {} aborted: {}", log_id, error);
            tally.errors.push(error.clone());
            db.finalize_scan_log(&log_id, &tally, ScanStatus::Failed)?;
            return Ok(ScanOutcome::Failed { log_id, error });
        }
    };

    let threshold = config.confidence_threshold.clamp(0.0, 1.0);
    for stub in &stubs {
        // Dedup on the provider message id before paying for a detail fetch.
        if db.source_exists(&config.workspace_id, &stub.id)? {
            continue;
        }

        let email = match mailbox.detail(&access_token, stub).await {
            Ok(email) => email,
            Err(e) => {
                tally
                    .errors
                    .push(format!("detail fetch failed for {}: {}", stub.id, e));
                continue;
            }
        };
        tally.emails_scanned += 1;

        let candidates = match extract_tasks(llm, &email).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tally
                    .errors
                    .push(format!("extraction failed for {}: {}", stub.id, e));
                continue;
            }
        };
        if candidates.is_empty() {
            continue;
        }

        // Tasks are never created without a dedup anchor; a failed anchor
        // insert skips the whole email.
        let source_id = match db.insert_source(&config.workspace_id, &stub.id) {
            Ok(id) => id,
            // Lost a race with another run; the other run owns this email.
            Err(DbError::DuplicateSource(_)) => continue,
            Err(e) => {
                tally
                    .errors
                    .push(format!("source insert failed for {}: {}", stub.id, e));
                continue;
            }
        };

        for candidate in candidates {
            let needs_review = candidate.confidence_score < threshold;
            let task = task_from_candidate(config, &source_id, candidate, needs_review);
            if let Err(e) = db.insert_task(&task) {
                tally
                    .errors
                    .push(format!("task insert failed for {}: {}", stub.id, e));
                continue;
            }
            tally.tasks_extracted += 1;
            if needs_review {
                tally.tasks_for_review += 1;
            }
        }
    }

    db.update_last_scan(&config.id, &now.to_rfc3339())?;
    db.finalize_scan_log(&log_id, &tally, ScanStatus::Completed)?;

    // Independent conditions; both may fire for one run.
    if tally.tasks_extracted > 0 {
        notify_scan_complete(db, config, &tally)?;
    }
    if tally.tasks_for_review > 0 {
        notify_needs_review(db, config, tally.tasks_for_review)?;
    }

    log::info!(
        "scan {} completed: {} email(s), {} task(s), {} for review, {} error(s)",
        log_id,
        tally.emails_scanned,
        tally.tasks_extracted,
        tally.tasks_for_review,
        tally.errors.len()
    );
    Ok(ScanOutcome::Completed {
        log_id,
        emails_scanned: tally.emails_scanned,
        tasks_extracted: tally.tasks_extracted,
        tasks_for_review: tally.tasks_for_review,
        error_count: tally.errors.len(),
    })
}

/// Sweep every enabled config, scanning those whose interval has elapsed.
///
/// A failure on one config never blocks the rest of the sweep.
pub async fn run_sweep(
    db: &Db,
    secrets: &Secrets,
    llm: &dyn LanguageModel,
    cipher: &TokenCipher,
) -> Result<Vec<(String, ScanOutcome)>, DbError> {
    let configs = db.list_enabled_configs()?;
    let mut outcomes = Vec::with_capacity(configs.len());

    for config in configs {
        let mailbox = adapter_for(config.provider, secrets.oauth_client(config.provider));
        match run_scan(db, mailbox.as_ref(), llm, cipher, &config, ScanTrigger::Scheduled).await {
            Ok(outcome) => outcomes.push((config.id.clone(), outcome)),
            Err(e) => {
                log::error!("sweep: scan for config {} hit a database error: {}", config.id, e);
            }
        }
    }
    Ok(outcomes)
}

// ============================================================================
// Mailbox connection
// ============================================================================

/// Why connecting a mailbox failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("provider: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("token encryption: {0}")]
    Crypto(#[from] CryptoError),

    #[error("storage: {0}")]
    Db(#[from] DbError),
}

/// Exchange an OAuth consent code and store the resulting token pair,
/// encrypted, as the user's scan config for this provider. An existing
/// config for the same (workspace, user, provider) key is replaced.
pub async fn connect_mailbox(
    db: &Db,
    mailbox: &dyn MailboxApi,
    cipher: &TokenCipher,
    workspace_id: &str,
    user_id: &str,
    code: &str,
) -> Result<ScanConfig, ConnectError> {
    let tokens = mailbox.exchange_code(code).await?;

    let config = ScanConfig {
        id: Uuid::new_v4().to_string(),
        workspace_id: workspace_id.to_string(),
        user_id: user_id.to_string(),
        provider: mailbox.provider(),
        enabled: true,
        scan_interval_hours: 4,
        confidence_threshold: 0.7,
        quiet_hours_start: None,
        quiet_hours_end: None,
        weekend_scan: false,
        access_token_enc: cipher.encrypt(&tokens.access_token)?,
        refresh_token_enc: cipher.encrypt(&tokens.refresh_token)?,
        mailbox_address: tokens.mailbox_address,
        last_scan_at: None,
    };
    db.upsert_scan_config(&config)?;

    log::info!(
        "mailbox {} connected for {}/{} ({})",
        config.mailbox_address,
        workspace_id,
        user_id,
        config.provider.as_str()
    );
    Ok(config)
}

// ============================================================================
// Gates
// ============================================================================

fn gate(
    config: &ScanConfig,
    trigger: ScanTrigger,
    weekday: Weekday,
    minutes_now: u32,
    now: DateTime<Utc>,
) -> Option<SkipReason> {
    if !config.enabled {
        return Some(SkipReason::Disabled);
    }

    if let (Some(start), Some(end)) = (
        config.quiet_hours_start.as_deref().and_then(parse_clock),
        config.quiet_hours_end.as_deref().and_then(parse_clock),
    ) {
        if in_quiet_window(minutes_now, start, end) {
            return Some(SkipReason::QuietHours);
        }
    }

    if !config.weekend_scan && is_weekend(weekday) {
        return Some(SkipReason::Weekend);
    }

    if trigger == ScanTrigger::Scheduled
        && !interval_due(config.last_scan_at.as_deref(), config.scan_interval_hours, now)
    {
        return Some(SkipReason::NotDue);
    }

    None
}

/// Parse "HH:MM" to minutes since midnight.
pub(crate) fn parse_clock(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Whether `now` falls inside the quiet window. Windows may wrap midnight
/// (22:00 → 06:00); a zero-length window never matches.
fn in_quiet_window(now: u32, start: u32, end: u32) -> bool {
    use std::cmp::Ordering;
    match start.cmp(&end) {
        Ordering::Less => now >= start && now < end,
        Ordering::Greater => now >= start || now < end,
        Ordering::Equal => false,
    }
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Whether enough time has passed since the last scan. A config that never
/// scanned is always due. Unparseable timestamps count as never scanned.
fn interval_due(last_scan_at: Option<&str>, interval_hours: i64, now: DateTime<Utc>) -> bool {
    let Some(last) = last_scan_at.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok()) else {
        return true;
    };
    let interval = interval_hours.max(1);
    now.signed_duration_since(last.with_timezone(&Utc)) >= chrono::Duration::hours(interval)
}

// ============================================================================
// Scan body helpers
// ============================================================================

/// Decrypt the refresh token, trade it for a fresh access token, and persist
/// the re-encrypted result before any email work begins.
async fn refresh_access_token(
    db: &Db,
    mailbox: &dyn MailboxApi,
    cipher: &TokenCipher,
    config: &ScanConfig,
) -> Result<String, MailboxError> {
    let refresh_token = cipher
        .decrypt(&config.refresh_token_enc)
        .map_err(|e| MailboxError::RefreshFailed(format!("stored token unreadable: {}", e)))?;

    let refreshed = mailbox.refresh(&refresh_token).await?;

    let access_enc = cipher
        .encrypt(&refreshed.access_token)
        .map_err(|e| MailboxError::RefreshFailed(format!("re-encryption failed: {}", e)))?;
    db.update_access_token(&config.id, &access_enc)
        .map_err(|e| MailboxError::RefreshFailed(format!("token persistence failed: {}", e)))?;

    Ok(refreshed.access_token)
}

/// Hours of mailbox history to request, based on when the config last ran.
fn lookback_hours(config: &ScanConfig, now: DateTime<Utc>) -> i64 {
    let Some(last) = config
        .last_scan_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    else {
        return DEFAULT_LOOKBACK_HOURS;
    };
    let elapsed = now
        .signed_duration_since(last.with_timezone(&Utc))
        .num_hours();
    // One hour of slack covers clock skew and list-time truncation.
    (elapsed + 1).clamp(1, MAX_LOOKBACK_HOURS)
}

fn task_from_candidate(
    config: &ScanConfig,
    source_id: &str,
    candidate: CandidateTask,
    needs_review: bool,
) -> Task {
    Task {
        id: Uuid::new_v4().to_string(),
        workspace_id: config.workspace_id.clone(),
        user_id: config.user_id.clone(),
        title: candidate.title,
        description: candidate.description,
        priority: candidate.priority,
        status: TaskStatus::Todo,
        due_date: candidate.due_date,
        needs_review,
        confidence: Some(candidate.confidence_score),
        project_id: None,
        source_id: Some(source_id.to_string()),
        completed_at: None,
        created_at: Utc::now().to_rfc3339(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::mailbox::{ExchangedTokens, RefreshedToken};
    use crate::notification::{KIND_NEEDS_REVIEW, KIND_SCAN_COMPLETE};
    use crate::types::{EmailStub, NormalizedEmail, Provider, ScanStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    struct MockMailbox {
        emails: Vec<NormalizedEmail>,
        refresh_calls: AtomicUsize,
        fail_detail_ids: Vec<String>,
        fail_refresh: bool,
        exchange: Option<ExchangedTokens>,
    }

    impl MockMailbox {
        fn with_emails(emails: Vec<NormalizedEmail>) -> Self {
            Self {
                emails,
                refresh_calls: AtomicUsize::new(0),
                fail_detail_ids: Vec::new(),
                fail_refresh: false,
                exchange: None,
            }
        }
    }

    #[async_trait]
    impl MailboxApi for MockMailbox {
        fn provider(&self) -> Provider {
            Provider::Gmail
        }

        async fn list_recent(
            &self,
            _access_token: &str,
            _hours_back: i64,
            _max_results: u32,
        ) -> Result<Vec<EmailStub>, MailboxError> {
            Ok(self
                .emails
                .iter()
                .map(|e| EmailStub {
                    id: e.id.clone(),
                    full: None,
                })
                .collect())
        }

        async fn detail(
            &self,
            _access_token: &str,
            stub: &EmailStub,
        ) -> Result<NormalizedEmail, MailboxError> {
            if self.fail_detail_ids.contains(&stub.id) {
                return Err(MailboxError::Api {
                    status: 500,
                    message: "backend flake".to_string(),
                });
            }
            self.emails
                .iter()
                .find(|e| e.id == stub.id)
                .cloned()
                .ok_or_else(|| MailboxError::NotFound(stub.id.clone()))
        }

        async fn exchange_code(&self, _code: &str) -> Result<ExchangedTokens, MailboxError> {
            self.exchange
                .clone()
                .ok_or_else(|| MailboxError::ExchangeFailed("no exchange configured".to_string()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, MailboxError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh {
                return Err(MailboxError::AuthExpired);
            }
            Ok(RefreshedToken {
                access_token: "fresh-access-token".to_string(),
                expires_in_secs: 3600,
            })
        }
    }

    /// Emits one candidate task per call at a fixed confidence.
    struct FixedConfidenceModel(f64);

    #[async_trait]
    impl LanguageModel for FixedConfidenceModel {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(format!(
                r#"[{{"title": "Reply to thread", "priority": "medium", "confidence_score": {}}}]"#,
                self.0
            ))
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn cipher() -> TokenCipher {
        TokenCipher::new("test-key").unwrap()
    }

    fn email(id: &str) -> NormalizedEmail {
        NormalizedEmail {
            id: id.to_string(),
            subject: "Can you reply?".to_string(),
            sender: "pat@example.com".to_string(),
            date: "2026-02-07T10:00:00Z".to_string(),
            body: "Please reply to the thread when you get a chance.".to_string(),
            snippet: String::new(),
        }
    }

    fn config(cipher: &TokenCipher) -> ScanConfig {
        ScanConfig {
            id: Uuid::new_v4().to_string(),
            workspace_id: "ws1".to_string(),
            user_id: "u1".to_string(),
            provider: Provider::Gmail,
            enabled: true,
            scan_interval_hours: 4,
            confidence_threshold: 0.7,
            quiet_hours_start: None,
            quiet_hours_end: None,
            // Tests run on real wall-clock days; never gate on them.
            weekend_scan: true,
            access_token_enc: cipher.encrypt("old-access").unwrap(),
            refresh_token_enc: cipher.encrypt("refresh-token").unwrap(),
            mailbox_address: "u1@example.com".to_string(),
            last_scan_at: None,
        }
    }

    // ------------------------------------------------------------------
    // Gate helpers
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("08:30"), Some(510));
        assert_eq!(parse_clock("00:00"), Some(0));
        assert_eq!(parse_clock("23:59"), Some(1439));
        assert_eq!(parse_clock("24:00"), None);
        assert_eq!(parse_clock("8"), None);
        assert_eq!(parse_clock("garbage"), None);
    }

    #[test]
    fn test_quiet_window_plain() {
        // 09:00 → 17:00
        assert!(in_quiet_window(600, 540, 1020));
        assert!(!in_quiet_window(500, 540, 1020));
        // Start inclusive, end exclusive.
        assert!(in_quiet_window(540, 540, 1020));
        assert!(!in_quiet_window(1020, 540, 1020));
    }

    #[test]
    fn test_quiet_window_wraps_midnight() {
        // 22:00 → 06:00
        let (start, end) = (1320, 360);
        assert!(in_quiet_window(1380, start, end)); // 23:00
        assert!(in_quiet_window(120, start, end)); // 02:00
        assert!(!in_quiet_window(720, start, end)); // 12:00
        assert!(in_quiet_window(1320, start, end)); // at start
        assert!(!in_quiet_window(360, start, end)); // at end
    }

    #[test]
    fn test_quiet_window_zero_length() {
        assert!(!in_quiet_window(600, 600, 600));
    }

    #[test]
    fn test_weekend() {
        assert!(is_weekend(Weekday::Sat));
        assert!(is_weekend(Weekday::Sun));
        assert!(!is_weekend(Weekday::Mon));
        assert!(!is_weekend(Weekday::Fri));
    }

    #[test]
    fn test_interval_due() {
        let now = DateTime::parse_from_rfc3339("2026-02-07T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(interval_due(None, 4, now));
        assert!(interval_due(Some("2026-02-07T08:00:00Z"), 4, now));
        assert!(!interval_due(Some("2026-02-07T09:00:00Z"), 4, now));
        assert!(interval_due(Some("not a timestamp"), 4, now));
        // Non-positive intervals behave as hourly.
        assert!(interval_due(Some("2026-02-07T10:00:00Z"), 0, now));
    }

    #[test]
    fn test_manual_trigger_skips_interval_gate_only() {
        let c = cipher();
        let mut cfg = config(&c);
        cfg.last_scan_at = Some(Utc::now().to_rfc3339());

        let now = Utc::now();
        assert_eq!(
            gate(&cfg, ScanTrigger::Scheduled, Weekday::Wed, 720, now),
            Some(SkipReason::NotDue)
        );
        assert_eq!(gate(&cfg, ScanTrigger::Manual, Weekday::Wed, 720, now), None);

        cfg.enabled = false;
        assert_eq!(
            gate(&cfg, ScanTrigger::Manual, Weekday::Wed, 720, now),
            Some(SkipReason::Disabled)
        );
    }

    #[test]
    fn test_gate_order_quiet_hours_and_weekend() {
        let c = cipher();
        let mut cfg = config(&c);
        cfg.quiet_hours_start = Some("22:00".to_string());
        cfg.quiet_hours_end = Some("06:00".to_string());
        cfg.weekend_scan = false;

        let now = Utc::now();
        // 23:00 on a Saturday: quiet hours reported first.
        assert_eq!(
            gate(&cfg, ScanTrigger::Manual, Weekday::Sat, 1380, now),
            Some(SkipReason::QuietHours)
        );
        // Noon Saturday: weekend.
        assert_eq!(
            gate(&cfg, ScanTrigger::Manual, Weekday::Sat, 720, now),
            Some(SkipReason::Weekend)
        );
        // Noon Wednesday: clear.
        assert_eq!(gate(&cfg, ScanTrigger::Manual, Weekday::Wed, 720, now), None);
    }

    #[test]
    fn test_lookback_hours() {
        let c = cipher();
        let mut cfg = config(&c);
        let now = DateTime::parse_from_rfc3339("2026-02-07T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(lookback_hours(&cfg, now), DEFAULT_LOOKBACK_HOURS);

        cfg.last_scan_at = Some("2026-02-07T06:00:00Z".to_string());
        assert_eq!(lookback_hours(&cfg, now), 7);

        cfg.last_scan_at = Some("2025-01-01T00:00:00Z".to_string());
        assert_eq!(lookback_hours(&cfg, now), MAX_LOOKBACK_HOURS);
    }

    // ------------------------------------------------------------------
    // Full runs
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_disabled_config_touches_nothing() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let mut cfg = config(&c);
        cfg.enabled = false;

        let mailbox = MockMailbox::with_emails(vec![email("m1")]);
        let model = FixedConfidenceModel(0.9);

        let outcome = run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ScanOutcome::Skipped(SkipReason::Disabled)
        ));
        assert_eq!(mailbox.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(db.count_scan_logs("ws1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completed_run_persists_everything() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let cfg = config(&c);
        db.upsert_scan_config(&cfg).unwrap();

        let mailbox = MockMailbox::with_emails(vec![email("m1"), email("m2")]);
        let model = FixedConfidenceModel(0.9);

        let outcome = run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();
        let ScanOutcome::Completed {
            emails_scanned,
            tasks_extracted,
            tasks_for_review,
            error_count,
            ..
        } = outcome
        else {
            panic!("expected completed outcome, got {:?}", outcome);
        };
        assert_eq!(emails_scanned, 2);
        assert_eq!(tasks_extracted, 2);
        assert_eq!(tasks_for_review, 0);
        assert_eq!(error_count, 0);

        // Refreshed access token is re-encrypted and persisted.
        let stored = db.get_scan_config(&cfg.id).unwrap().unwrap();
        assert_eq!(c.decrypt(&stored.access_token_enc).unwrap(), "fresh-access-token");
        assert!(stored.last_scan_at.is_some());

        let logs = db.recent_scan_logs("ws1", "u1", 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ScanStatus::Completed);

        assert_eq!(db.count_tasks("ws1").unwrap(), 2);
        assert_eq!(db.count_notifications("ws1", KIND_SCAN_COMPLETE).unwrap(), 1);
        assert_eq!(db.count_notifications("ws1", KIND_NEEDS_REVIEW).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let cfg = config(&c);
        db.upsert_scan_config(&cfg).unwrap();

        let mailbox = MockMailbox::with_emails(vec![email("m1"), email("m2")]);
        let model = FixedConfidenceModel(0.9);

        run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();
        let outcome = run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();

        let ScanOutcome::Completed {
            emails_scanned,
            tasks_extracted,
            ..
        } = outcome
        else {
            panic!("expected completed outcome");
        };
        // Every message dedups against the first run.
        assert_eq!(emails_scanned, 0);
        assert_eq!(tasks_extracted, 0);
        assert_eq!(db.count_tasks("ws1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_confidence_at_threshold_is_not_flagged() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let cfg = config(&c); // threshold 0.7
        db.upsert_scan_config(&cfg).unwrap();

        let mailbox = MockMailbox::with_emails(vec![email("m1")]);
        let model = FixedConfidenceModel(0.7);

        run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();

        let tasks = db.tasks_for_user("ws1", "u1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].needs_review);
        assert_eq!(db.count_notifications("ws1", KIND_NEEDS_REVIEW).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_flags_and_notifies() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let cfg = config(&c);
        db.upsert_scan_config(&cfg).unwrap();

        let mailbox = MockMailbox::with_emails(vec![email("m1")]);
        let model = FixedConfidenceModel(0.4);

        run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();

        let tasks = db.tasks_for_user("ws1", "u1").unwrap();
        assert!(tasks[0].needs_review);
        assert_eq!(tasks[0].confidence, Some(0.4));
        assert_eq!(db.count_notifications("ws1", KIND_NEEDS_REVIEW).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_one_bad_email_does_not_sink_the_run() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let cfg = config(&c);
        db.upsert_scan_config(&cfg).unwrap();

        let mut mailbox =
            MockMailbox::with_emails(vec![email("m1"), email("m2"), email("m3")]);
        mailbox.fail_detail_ids = vec!["m2".to_string()];
        let model = FixedConfidenceModel(0.9);

        let outcome = run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();
        let ScanOutcome::Completed {
            emails_scanned,
            tasks_extracted,
            error_count,
            ..
        } = outcome
        else {
            panic!("expected completed outcome");
        };
        assert_eq!(emails_scanned, 2);
        assert_eq!(tasks_extracted, 2);
        assert_eq!(error_count, 1);

        let logs = db.recent_scan_logs("ws1", "u1", 10).unwrap();
        assert_eq!(logs[0].status, ScanStatus::Completed);
        assert_eq!(logs[0].errors.len(), 1);
        assert!(logs[0].errors[0].contains("m2"));
    }

    #[tokio::test]
    async fn test_refresh_failure_fails_the_run() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let cfg = config(&c);
        db.upsert_scan_config(&cfg).unwrap();

        let mut mailbox = MockMailbox::with_emails(vec![email("m1")]);
        mailbox.fail_refresh = true;
        let model = FixedConfidenceModel(0.9);

        let outcome = run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Failed { .. }));

        let logs = db.recent_scan_logs("ws1", "u1", 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ScanStatus::Failed);
        assert!(!logs[0].errors.is_empty());
        assert_eq!(db.count_tasks("ws1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_mailbox_stores_encrypted_tokens() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let mut mailbox = MockMailbox::with_emails(vec![]);
        mailbox.exchange = Some(ExchangedTokens {
            access_token: "access-abc".to_string(),
            refresh_token: "refresh-xyz".to_string(),
            mailbox_address: "u1@example.com".to_string(),
        });

        let config = connect_mailbox(&db, &mailbox, &c, "ws1", "u1", "consent-code")
            .await
            .unwrap();
        assert!(config.enabled);
        assert_eq!(config.mailbox_address, "u1@example.com");
        // Plaintext never lands in the row.
        assert_ne!(config.access_token_enc, "access-abc");
        assert_eq!(c.decrypt(&config.access_token_enc).unwrap(), "access-abc");
        assert_eq!(c.decrypt(&config.refresh_token_enc).unwrap(), "refresh-xyz");

        let stored = db.get_scan_config(&config.id).unwrap().unwrap();
        assert_eq!(stored.provider, Provider::Gmail);

        // Reconnecting replaces the row instead of adding a second one.
        connect_mailbox(&db, &mailbox, &c, "ws1", "u1", "consent-code-2")
            .await
            .unwrap();
        assert_eq!(db.list_enabled_configs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_mailbox_exchange_failure() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let mailbox = MockMailbox::with_emails(vec![]);

        let err = connect_mailbox(&db, &mailbox, &c, "ws1", "u1", "bad-code").await;
        assert!(matches!(err, Err(ConnectError::Mailbox(_))));
        assert!(db.list_enabled_configs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_stored_token_fails_the_run() {
        let db = Db::open_in_memory().unwrap();
        let c = cipher();
        let mut cfg = config(&c);
        cfg.refresh_token_enc = "not-ciphertext".to_string();
        db.upsert_scan_config(&cfg).unwrap();

        let mailbox = MockMailbox::with_emails(vec![email("m1")]);
        let model = FixedConfidenceModel(0.9);

        let outcome = run_scan(&db, &mailbox, &model, &c, &cfg, ScanTrigger::Manual)
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Failed { .. }));
        assert_eq!(mailbox.refresh_calls.load(Ordering::SeqCst), 0);
    }
}
