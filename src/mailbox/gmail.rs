//! Gmail API v1 adapter.
//!
//! The list call returns id stubs only, so every message body costs a second
//! round-trip (`format=full`), walking MIME parts for text/plain (preferred)
//! or text/html and decoding the URL-safe base64 payload.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::{
    error_for_response, send_with_retry, ExchangedTokens, MailboxApi, MailboxError,
    RefreshedToken, RetryPolicy,
};
use crate::secrets::OAuthClient;
use crate::types::{EmailStub, NormalizedEmail, Provider};

const MESSAGES_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages";
const PROFILE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/profile";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GmailApi {
    client: reqwest::Client,
    oauth: OAuthClient,
}

impl GmailApi {
    pub fn new(oauth: OAuthClient) -> Self {
        Self {
            client: reqwest::Client::new(),
            oauth,
        }
    }
}

#[async_trait]
impl MailboxApi for GmailApi {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn list_recent(
        &self,
        access_token: &str,
        hours_back: i64,
        max_results: u32,
    ) -> Result<Vec<EmailStub>, MailboxError> {
        let after = chrono::Utc::now().timestamp() - hours_back * 3600;
        let query = format!("in:inbox after:{}", after.max(0));

        let resp = send_with_retry(
            self.client
                .get(MESSAGES_URL)
                .bearer_auth(access_token)
                .query(&[
                    ("q", query.as_str()),
                    ("maxResults", &max_results.to_string()),
                ]),
            &RetryPolicy::default(),
        )
        .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }

        let list: MessageListResponse = resp.json().await?;
        Ok(list
            .messages
            .into_iter()
            .map(|stub| EmailStub {
                id: stub.id,
                full: None,
            })
            .collect())
    }

    async fn detail(
        &self,
        access_token: &str,
        stub: &EmailStub,
    ) -> Result<NormalizedEmail, MailboxError> {
        let url = format!("{}/{}", MESSAGES_URL, stub.id);
        let resp = send_with_retry(
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("format", "full")]),
            &RetryPolicy::default(),
        )
        .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MailboxError::NotFound(stub.id.clone()));
        }
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }

        let detail: MessageDetail = resp.json().await?;
        Ok(normalize_message(detail))
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

impl GmailApi {
    async fn fetch_mailbox_address(&self, access_token: &str) -> Result<String, MailboxError> {
        let resp = self
            .client
            .get(PROFILE_URL)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        let body: serde_json::Value = resp.json().await?;
        body["emailAddress"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| MailboxError::ExchangeFailed("No emailAddress in profile".into()))
    }
}

// ============================================================================
// Normalization
// ============================================================================

fn normalize_message(detail: MessageDetail) -> NormalizedEmail {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);

    let get_header = |name: &str| -> String {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let subject = get_header("Subject");
    let sender = get_header("From");
    let date = get_header("Date");

    let body = detail
        .payload
        .as_ref()
        .and_then(|p| {
            extract_body_text(p, "text/plain").or_else(|| extract_body_text(p, "text/html"))
        })
        .unwrap_or_default();

    NormalizedEmail {
        id: detail.id,
        subject,
        sender,
        date,
        body,
        snippet: detail.snippet,
    }
}

/// Recursively walk MIME parts to find body data matching the target MIME type.
fn extract_body_text(payload: &MessagePayload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_ref()) {
            return decode_url_safe_base64(data);
        }
    }
    for part in &payload.parts {
        if let Some(text) = extract_body_text(part, target_mime) {
            return Some(text);
        }
    }
    None
}

/// Decode URL-safe base64 (no padding) as used by the Gmail API.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)
    }

    #[test]
    fn test_message_list_deserialization() {
        let json = r#"{"messages": [{"id": "msg1"}, {"id": "msg2"}]}"#;
        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.messages.len(), 2);
        assert_eq!(resp.messages[0].id, "msg1");
    }

    #[test]
    fn test_message_list_empty() {
        let json = r#"{"resultSizeEstimate": 0}"#;
        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert!(resp.messages.is_empty());
    }

    #[test]
    fn test_normalize_plain_text_message() {
        let json = format!(
            r#"{{
                "id": "msg123",
                "snippet": "Hey, just checking in...",
                "payload": {{
                    "mimeType": "text/plain",
                    "headers": [
                        {{"name": "From", "value": "Jane Doe <jane@customer.com>"}},
                        {{"name": "Subject", "value": "Re: Project Update"}},
                        {{"name": "Date", "value": "Sat, 7 Feb 2026 09:30:00 -0500"}}
                    ],
                    "body": {{"data": "{}"}}
                }}
            }}"#,
            encode("Can you send the updated deck by Friday?")
        );

        let detail: MessageDetail = serde_json::from_str(&json).unwrap();
        let email = normalize_message(detail);
        assert_eq!(email.id, "msg123");
        assert_eq!(email.sender, "Jane Doe <jane@customer.com>");
        assert_eq!(email.subject, "Re: Project Update");
        assert_eq!(email.body, "Can you send the updated deck by Friday?");
    }

    #[test]
    fn test_normalize_prefers_text_plain_in_multipart() {
        let json = format!(
            r#"{{
                "id": "m1",
                "snippet": "",
                "payload": {{
                    "mimeType": "multipart/alternative",
                    "headers": [],
                    "parts": [
                        {{"mimeType": "text/html", "body": {{"data": "{}"}}}},
                        {{"mimeType": "text/plain", "body": {{"data": "{}"}}}}
                    ]
                }}
            }}"#,
            encode("<p>html version</p>"),
            encode("plain version")
        );

        let detail: MessageDetail = serde_json::from_str(&json).unwrap();
        assert_eq!(normalize_message(detail).body, "plain version");
    }

    #[test]
    fn test_normalize_falls_back_to_html() {
        let json = format!(
            r#"{{
                "id": "m2",
                "snippet": "",
                "payload": {{
                    "mimeType": "multipart/alternative",
                    "headers": [],
                    "parts": [
                        {{"mimeType": "text/html", "body": {{"data": "{}"}}}}
                    ]
                }}
            }}"#,
            encode("<p>only html</p>")
        );

        let detail: MessageDetail = serde_json::from_str(&json).unwrap();
        assert_eq!(normalize_message(detail).body, "<p>only html</p>");
    }

    #[test]
    fn test_normalize_attachment_only_message() {
        let json = r#"{
            "id": "m3",
            "snippet": "attachment",
            "payload": {"mimeType": "application/pdf", "headers": []}
        }"#;
        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        let email = normalize_message(detail);
        assert!(email.body.is_empty());
        assert_eq!(email.snippet, "attachment");
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(decode_url_safe_base64("!!not-base64!!").is_none());
    }
}
