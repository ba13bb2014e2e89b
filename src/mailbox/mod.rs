//! Mailbox provider abstraction.
//!
//! Two adapters normalize provider-specific messages into one shape:
//! - gmail: list returns id stubs, body needs a second round-trip per message
//! - outlook: Microsoft Graph returns full bodies in the list call
//!
//! The orchestrator is provider-agnostic beyond this interface and only
//! assumes the list call returns enough identity to dedup before paying for
//! detail fetches.

pub mod gmail;
pub mod outlook;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::secrets::OAuthClient;
use crate::types::{EmailStub, NormalizedEmail, Provider};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token expired or revoked")]
    AuthExpired,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Retries exhausted")]
    RetriesExhausted,
}

/// Result of an OAuth consent-code exchange.
#[derive(Debug, Clone)]
pub struct ExchangedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub mailbox_address: String,
}

/// Result of a refresh-token grant.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in_secs: u64,
}

/// Provider-agnostic mailbox operations.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    fn provider(&self) -> Provider;

    /// List recent messages. Stubs always carry an id; full bodies ride along
    /// when the provider returns them in the list call.
    async fn list_recent(
        &self,
        access_token: &str,
        hours_back: i64,
        max_results: u32,
    ) -> Result<Vec<EmailStub>, MailboxError>;

    /// Fetch (or unwrap) the normalized form of one message.
    async fn detail(
        &self,
        access_token: &str,
        stub: &EmailStub,
    ) -> Result<NormalizedEmail, MailboxError>;

    /// Exchange an OAuth consent code for a token pair plus mailbox address.
    async fn exchange_code(&self, code: &str) -> Result<ExchangedTokens, MailboxError>;

    /// Trade a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, MailboxError>;
}

/// Build the adapter for a provider tag.
pub fn adapter_for(provider: Provider, oauth: &OAuthClient) -> Box<dyn MailboxApi> {
    match provider {
        Provider::Gmail => Box::new(gmail::GmailApi::new(oauth.clone())),
        Provider::Outlook => Box::new(outlook::OutlookApi::new(oauth.clone())),
    }
}

// ============================================================================
// Retry plumbing (shared by both adapters)
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying transient failures with exponential backoff.
/// Honors Retry-After on 429s.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, MailboxError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(MailboxError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "mailbox retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "mailbox retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(MailboxError::Http(err));
            }
        }
    }

    Err(MailboxError::RetriesExhausted)
}

/// Map a non-success response to the shared error shape, surfacing 401 as
/// `AuthExpired` so callers can distinguish credential death from flakiness.
pub(crate) async fn error_for_response(resp: reqwest::Response) -> MailboxError {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return MailboxError::AuthExpired;
    }
    let message = resp.text().await.unwrap_or_default();
    MailboxError::Api {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(is_retryable_status(reqwest::StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(reqwest::StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_retry_delay_honors_retry_after() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("3");
        assert_eq!(
            retry_delay(1, &policy, Some(&header)),
            Duration::from_secs(3)
        );
        // Capped at 30s regardless of what the server claims.
        let header = reqwest::header::HeaderValue::from_static("600");
        assert_eq!(
            retry_delay(1, &policy, Some(&header)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let policy = RetryPolicy::default();
        let first = retry_delay(1, &policy, None).as_millis();
        let third = retry_delay(3, &policy, None).as_millis();
        assert!(first < 500);
        assert!(third >= 1000);
        assert!(third <= (policy.max_backoff_ms + 150) as u128);
    }
}
