//! Outlook adapter (Microsoft Graph).
//!
//! Graph returns full message bodies in the list call, so `detail` usually
//! just unwraps what `list_recent` already carried. The normalized shape is
//! identical to the Gmail adapter's.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    error_for_response, send_with_retry, ExchangedTokens, MailboxApi, MailboxError,
    RefreshedToken, RetryPolicy,
};
use crate::secrets::OAuthClient;
use crate::types::{EmailStub, NormalizedEmail, Provider};

const MESSAGES_URL: &str = "https://graph.microsoft.com/v1.0/me/messages";
const ME_URL: &str = "https://graph.microsoft.com/v1.0/me";
const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const GRAPH_SCOPE: &str = "offline_access Mail.Read User.Read";

const SELECT_FIELDS: &str = "id,subject,from,receivedDateTime,body,bodyPreview";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(default)]
    received_date_time: String,
    #[serde(default)]
    body: Option<ItemBody>,
    #[serde(default)]
    body_preview: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    #[serde(default)]
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(default)]
    content: String,
}

// ============================================================================
// Adapter
// ============================================================================

pub struct OutlookApi {
    client: reqwest::Client,
    oauth: OAuthClient,
}

impl OutlookApi {
    pub fn new(oauth: OAuthClient) -> Self {
        Self {
            client: reqwest::Client::new(),
            oauth,
        }
    }
}

#[async_trait]
impl MailboxApi for OutlookApi {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    async fn list_recent(
        &self,
        access_token: &str,
        hours_back: i64,
        max_results: u32,
    ) -> Result<Vec<EmailStub>, MailboxError> {
        let since = chrono::Utc::now() - chrono::Duration::hours(hours_back.max(0));
        let filter = format!(
            "receivedDateTime ge {}",
            since.format("%Y-%m-%dT%H:%M:%SZ")
        );

        let resp = send_with_retry(
            self.client
                .get(MESSAGES_URL)
                .bearer_auth(access_token)
                .query(&[
                    ("$filter", filter.as_str()),
                    ("$top", &max_results.to_string()),
                    ("$select", SELECT_FIELDS),
                    ("$orderby", "receivedDateTime desc"),
                ]),
            &RetryPolicy::default(),
        )
        .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }

        let list: MessageListResponse = resp.json().await?;
        Ok(list
            .value
            .into_iter()
            .map(|msg| {
                let id = msg.id.clone();
                EmailStub {
                    id,
                    full: Some(normalize_message(msg)),
                }
            })
            .collect())
    }

    async fn detail(
        &self,
        access_token: &str,
        stub: &EmailStub,
    ) -> Result<NormalizedEmail, MailboxError> {
        // The list call already carried the body; only refetch if it didn't.
        if let Some(full) = &stub.full {
            return Ok(full.clone());
        }

        let url = format!("{}/{}", MESSAGES_URL, stub.id);
        let resp = send_with_retry(
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("$select", SELECT_FIELDS)]),
            &RetryPolicy::default(),
        )
        .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MailboxError::NotFound(stub.id.clone()));
        }
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }

        let msg: GraphMessage = resp.json().await?;
        Ok(normalize_message(msg))
    }

    async fn exchange_code(&self, code: &str) -> Result<ExchangedTokens, MailboxError> {
        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailboxError::ExchangeFailed(body));
        }

        let body: serde_json::Value = resp.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| MailboxError::ExchangeFailed("No access_token in response".into()))?
            .to_string();
        let refresh_token = body["refresh_token"]
            .as_str()
            .ok_or_else(|| MailboxError::ExchangeFailed("No refresh_token in response".into()))?
            .to_string();

        let mailbox_address = self.fetch_mailbox_address(&access_token).await?;

        Ok(ExchangedTokens {
            access_token,
            refresh_token,
            mailbox_address,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, MailboxError> {
        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.to_lowercase().contains("invalid_grant") {
                return Err(MailboxError::AuthExpired);
            }
            return Err(MailboxError::RefreshFailed(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| MailboxError::RefreshFailed("No access_token in response".into()))?
            .to_string();
        let expires_in_secs = body["expires_in"].as_u64().unwrap_or(3600);

        Ok(RefreshedToken {
            access_token,
            expires_in_secs,
        })
    }
}

impl OutlookApi {
    async fn fetch_mailbox_address(&self, access_token: &str) -> Result<String, MailboxError> {
        let resp = self
            .client
            .get(ME_URL)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        let body: serde_json::Value = resp.json().await?;
        body["mail"]
            .as_str()
            .or_else(|| body["userPrincipalName"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| MailboxError::ExchangeFailed("No mail address on profile".into()))
    }
}

// ============================================================================
// Normalization
// ============================================================================

fn normalize_message(msg: GraphMessage) -> NormalizedEmail {
    let sender = msg
        .from
        .and_then(|r| r.email_address)
        .map(|a| {
            if a.name.is_empty() {
                a.address
            } else {
                format!("{} <{}>", a.name, a.address)
            }
        })
        .unwrap_or_default();

    NormalizedEmail {
        id: msg.id,
        subject: msg.subject,
        sender,
        date: msg.received_date_time,
        body: msg.body.map(|b| b.content).unwrap_or_default(),
        snippet: msg.body_preview,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "value": [
            {
                "id": "AAMkAGI1",
                "subject": "Quarterly review",
                "from": {"emailAddress": {"name": "Sam Park", "address": "sam@corp.com"}},
                "receivedDateTime": "2026-02-07T14:05:00Z",
                "body": {"contentType": "html", "content": "<p>Please review the attached numbers.</p>"},
                "bodyPreview": "Please review the attached numbers."
            }
        ]
    }"#;

    #[test]
    fn test_list_carries_full_bodies() {
        let list: MessageListResponse = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(list.value.len(), 1);

        let msg = list.value.into_iter().next().unwrap();
        let email = normalize_message(msg);
        assert_eq!(email.id, "AAMkAGI1");
        assert_eq!(email.sender, "Sam Park <sam@corp.com>");
        assert!(email.body.contains("Please review"));
        assert_eq!(email.date, "2026-02-07T14:05:00Z");
    }

    #[test]
    fn test_normalize_missing_from() {
        let json = r#"{"id": "m1", "subject": "s", "receivedDateTime": "", "bodyPreview": ""}"#;
        let msg: GraphMessage = serde_json::from_str(json).unwrap();
        let email = normalize_message(msg);
        assert!(email.sender.is_empty());
        assert!(email.body.is_empty());
    }

    #[test]
    fn test_sender_without_display_name() {
        let json = r#"{
            "id": "m2",
            "subject": "s",
            "from": {"emailAddress": {"address": "noreply@corp.com"}},
            "receivedDateTime": "",
            "bodyPreview": ""
        }"#;
        let msg: GraphMessage = serde_json::from_str(json).unwrap();
        assert_eq!(normalize_message(msg).sender, "noreply@corp.com");
    }
}
