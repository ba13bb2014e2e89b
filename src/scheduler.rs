//! Background scheduler.
//!
//! One loop owns all recurring work: a sweep tick that scans every due
//! config, a briefing check that delivers each user's digest once per local
//! day at their delivery time, and a command channel for manual triggers.
//! The loop never dies on a work error; everything is logged and the next
//! tick starts clean.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;

use crate::briefing::generate::run_briefing;
use crate::crypto::TokenCipher;
use crate::db::Db;
use crate::llm::LanguageModel;
use crate::mailbox::adapter_for;
use crate::scan::{parse_clock, run_scan, run_sweep, ScanTrigger};
use crate::secrets::Secrets;
use crate::types::BriefingPreference;

/// How often the loop wakes to check for due scans and briefings.
const TICK_INTERVAL_SECS: u64 = 300;

const COMMAND_BUFFER: usize = 16;

/// Manual triggers accepted while the loop runs.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Scan one config now, bypassing the interval gate.
    ScanNow { config_id: String },
    /// Generate a briefing now regardless of delivery time.
    BriefNow {
        workspace_id: String,
        user_id: String,
    },
    Shutdown,
}

/// Cloneable sender half for issuing commands to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub async fn send(&self, command: SchedulerCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }
}

pub fn command_channel() -> (SchedulerHandle, mpsc::Receiver<SchedulerCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    (SchedulerHandle { tx }, rx)
}

/// Run the scheduler loop until a `Shutdown` command arrives or every
/// handle is dropped.
pub async fn run(
    db: Arc<Mutex<Db>>,
    secrets: Arc<Secrets>,
    llm: Arc<dyn LanguageModel>,
    cipher: Arc<TokenCipher>,
    mut commands: mpsc::Receiver<SchedulerCommand>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log::info!("scheduler running (tick every {}s)", TICK_INTERVAL_SECS);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&db, &secrets, llm.as_ref(), &cipher).await;
            }
            command = commands.recv() => {
                match command {
                    Some(SchedulerCommand::ScanNow { config_id }) => {
                        manual_scan(&db, &secrets, llm.as_ref(), &cipher, &config_id).await;
                    }
                    Some(SchedulerCommand::BriefNow { workspace_id, user_id }) => {
                        let db = db.lock().await;
                        if let Err(e) = run_briefing(&db, llm.as_ref(), &workspace_id, &user_id).await {
                            log::error!("manual briefing for {}/{} failed: {}", workspace_id, user_id, e);
                        }
                    }
                    Some(SchedulerCommand::Shutdown) | None => {
                        log::info!("scheduler stopping");
                        break;
                    }
                }
            }
        }
    }
}

async fn tick(
    db: &Arc<Mutex<Db>>,
    secrets: &Arc<Secrets>,
    llm: &dyn LanguageModel,
    cipher: &Arc<TokenCipher>,
) {
    {
        let db = db.lock().await;
        match run_sweep(&db, secrets, llm, cipher).await {
            Ok(outcomes) => log::debug!("sweep finished, {} config(s) considered", outcomes.len()),
            Err(e) => log::error!("sweep failed: {}", e),
        }
    }
    deliver_due_briefings(db, llm).await;
}

async fn manual_scan(
    db: &Arc<Mutex<Db>>,
    secrets: &Arc<Secrets>,
    llm: &dyn LanguageModel,
    cipher: &Arc<TokenCipher>,
    config_id: &str,
) {
    let db = db.lock().await;
    let config = match db.get_scan_config(config_id) {
        Ok(Some(config)) => config,
        Ok(None) => {
            log::warn!("manual scan requested for unknown config {}", config_id);
            return;
        }
        Err(e) => {
            log::error!("manual scan lookup for {} failed: {}", config_id, e);
            return;
        }
    };

    let mailbox = adapter_for(config.provider, secrets.oauth_client(config.provider));
    if let Err(e) = run_scan(&db, mailbox.as_ref(), llm, cipher, &config, ScanTrigger::Manual).await
    {
        log::error!("manual scan for config {} failed: {}", config_id, e);
    }
}

/// Generate briefings for users whose delivery time has passed in their own
/// timezone and who have no briefing stored for their local date yet.
async fn deliver_due_briefings(db: &Arc<Mutex<Db>>, llm: &dyn LanguageModel) {
    let db = db.lock().await;
    let prefs = match db.list_enabled_preferences() {
        Ok(prefs) => prefs,
        Err(e) => {
            log::error!("briefing delivery check failed: {}", e);
            return;
        }
    };

    let now = Utc::now();
    for pref in prefs {
        let Some(date) = briefing_due(&pref, now) else {
            continue;
        };
        let already = match db.get_briefing(&pref.workspace_id, &pref.user_id, &date) {
            Ok(row) => row.is_some(),
            Err(e) => {
                log::error!(
                    "briefing lookup for {}/{} failed: {}",
                    pref.workspace_id,
                    pref.user_id,
                    e
                );
                continue;
            }
        };
        if already {
            continue;
        }
        if let Err(e) = run_briefing(&db, llm, &pref.workspace_id, &pref.user_id).await {
            log::error!(
                "briefing delivery for {}/{} failed: {}",
                pref.workspace_id,
                pref.user_id,
                e
            );
        }
    }
}

/// If the user's delivery time has passed in their timezone, the local date
/// a briefing would belong to. `None` before the delivery time or when the
/// preference is malformed.
fn briefing_due(pref: &BriefingPreference, now: DateTime<Utc>) -> Option<String> {
    let tz: Tz = pref.timezone.parse().ok()?;
    let target = parse_clock(&pref.delivery_time)?;
    let local = now.with_timezone(&tz);
    let minutes = local.hour() * 60 + local.minute();
    if minutes >= target {
        Some(local.date_naive().format("%Y-%m-%d").to_string())
    } else {
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
