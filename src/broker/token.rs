//! Job credential issuance.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

/// Kinds of tokens the broker asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    JobToken,
}

/// A credential request scoped to one assignment of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTokenRequest {
    /// Identity the broker requests the token as.
    pub principal: String,
    /// Account the job runs under.
    pub username: String,
    pub kind: TokenKind,
    /// `queueId/resubmission`.
    pub extension: String,
    pub validity_secs: u64,
}

impl JobTokenRequest {
    pub fn for_job(
        principal: impl Into<String>,
        username: impl Into<String>,
        queue_id: i64,
        resubmission: i32,
        validity: Duration,
    ) -> Self {
        Self {
            principal: principal.into(),
            username: username.into(),
            kind: TokenKind::JobToken,
            extension: format!("{}/{}", queue_id, resubmission),
            validity_secs: validity.as_secs(),
        }
    }
}

/// Short-lived credential pair handed to the agent with its job.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobToken {
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub serial: Option<String>,
}

impl fmt::Debug for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobToken")
            .field("serial", &self.serial)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// External token issuance service.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, request: &JobTokenRequest) -> Result<JobToken, CredentialError>;

    /// Invalidates whatever was issued for `request`, if anything.
    async fn revoke(&self, request: &JobTokenRequest) -> Result<(), CredentialError>;
}

/// Request timeout for the token service.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// `TokenIssuer` over a JSON HTTP token service.
///
/// `POST {base}/tokens` issues, `POST {base}/tokens/revoke` revokes; both
/// take the `JobTokenRequest` as the body.
pub struct HttpTokenIssuer {
    client: Client,
    base_url: String,
}

impl HttpTokenIssuer {
    /// # Errors
    ///
    /// Returns `CredentialError::Unreachable` if the HTTP client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| CredentialError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, request: &JobTokenRequest) -> Result<reqwest::Response, CredentialError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| CredentialError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.message)
                .unwrap_or(text);

            return Err(CredentialError::Rejected { code, message });
        }

        Ok(response)
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self, request: &JobTokenRequest) -> Result<JobToken, CredentialError> {
        let response = self.post("/tokens", request).await?;

        let token: JobToken = response
            .json()
            .await
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;

        if token.certificate.is_empty() || token.private_key.is_empty() {
            return Err(CredentialError::Malformed(
                "empty certificate or key".to_string(),
            ));
        }

        tracing::debug!(
            extension = %request.extension,
            serial = ?token.serial,
            "Issued job token"
        );

        Ok(token)
    }

    async fn revoke(&self, request: &JobTokenRequest) -> Result<(), CredentialError> {
        self.post("/tokens/revoke", request)
            .await
            .map(|_| ())
            .map_err(|e| CredentialError::RevocationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_carries_queue_id_and_resubmission() {
        let request = JobTokenRequest::for_job("broker", "alice", 42, 3, Duration::from_secs(86_400));
        assert_eq!(request.extension, "42/3");
        assert_eq!(request.kind, TokenKind::JobToken);
        assert_eq!(request.validity_secs, 86_400);
    }

    #[test]
    fn test_request_serializes_kind_in_snake_case() {
        let request = JobTokenRequest::for_job("broker", "alice", 1, 1, Duration::from_secs(60));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"kind\":\"job_token\""));
    }

    #[test]
    fn test_token_debug_hides_key() {
        let token = JobToken {
            certificate: "CERT".to_string(),
            private_key: "SECRET".to_string(),
            serial: Some("01".to_string()),
        };
        let debug = format!("{:?}", token);
        assert!(!debug.contains("SECRET"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let issuer = HttpTokenIssuer::new("http://tokens.local:8080/").unwrap();
        assert_eq!(issuer.base_url(), "http://tokens.local:8080");
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let issuer = HttpTokenIssuer::new("http://127.0.0.1:9").unwrap();
        let request = JobTokenRequest::for_job("broker", "alice", 1, 1, Duration::from_secs(60));
        let result = issuer.issue(&request).await;
        assert!(matches!(result, Err(CredentialError::Unreachable(_))));
    }
}
