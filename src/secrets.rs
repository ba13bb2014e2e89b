//! Process-level secrets.
//!
//! Read once at startup and passed down explicitly; nothing here is ever
//! logged. A missing required secret fails fast before any state is created.

use thiserror::Error;

use crate::types::Provider;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

/// OAuth client registration for one mailbox provider.
#[derive(Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Everything the engine needs from the environment.
#[derive(Clone)]
pub struct Secrets {
    /// Passphrase for token-at-rest encryption.
    pub token_key: String,
    pub gmail: OAuthClient,
    pub outlook: OAuthClient,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
}

impl Secrets {
    /// Load all secrets from the environment.
    pub fn from_env() -> Result<Self, SecretsError> {
        Ok(Self {
            token_key: required("MAILMINDER_TOKEN_KEY")?,
            gmail: OAuthClient {
                client_id: required("GMAIL_CLIENT_ID")?,
                client_secret: required("GMAIL_CLIENT_SECRET")?,
                redirect_uri: required("GMAIL_REDIRECT_URI")?,
            },
            outlook: OAuthClient {
                client_id: required("OUTLOOK_CLIENT_ID")?,
                client_secret: required("OUTLOOK_CLIENT_SECRET")?,
                redirect_uri: required("OUTLOOK_REDIRECT_URI")?,
            },
            llm_api_key: required("LLM_API_KEY")?,
            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        })
    }

    pub fn oauth_client(&self, provider: Provider) -> &OAuthClient {
        match provider {
            Provider::Gmail => &self.gmail,
            Provider::Outlook => &self.outlook,
        }
    }
}

// Manual Debug so a stray `{:?}` can't leak credentials into logs.
impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

fn required(name: &'static str) -> Result<String, SecretsError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SecretsError::Missing(name)),
    }
}
