//! Mailminder: scheduled mailbox scanning, LLM task extraction, and daily
//! briefing generation.
//!
//! The pipeline: a scheduler sweeps enabled scan configs, each scan pulls
//! recent mail through a provider adapter, the extractor turns email text
//! into candidate tasks via a language model, low-confidence candidates are
//! flagged for human review, and a per-user daily briefing digests the
//! resulting task list.

pub mod briefing;
pub mod crypto;
pub mod db;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod mailbox;
pub mod notification;
pub mod scan;
pub mod scheduler;
pub mod secrets;
pub mod types;
