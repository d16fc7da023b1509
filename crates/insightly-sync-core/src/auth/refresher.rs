//! OAuth2 refresh-token grant against the Microsoft identity platform.

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::config::{CredentialSet, SyncSettings};

use super::token::{AccessToken, TokenErrorResponse, TokenResponse, DEFAULT_EXPIRES_IN_SECS};

#[derive(Error, Debug)]
pub enum AuthenticationError {
    #[error(
        "Token endpoint rejected the refresh token (HTTP {status}, {code}): {description}. \
         Generate a new REFRESH_TOKEN and update the function app settings"
    )]
    Rejected {
        status: u16,
        code: String,
        description: String,
    },

    #[error("Token request failed: {0}")]
    Api(#[from] ApiError),
}

impl AuthenticationError {
    /// True when the refresh token itself is no longer usable
    pub fn is_credential_expired(&self) -> bool {
        matches!(self, AuthenticationError::Rejected { code, .. } if code == "invalid_grant")
    }
}

/// Result of one refresh: the new access token, plus a rotated refresh token
/// when the endpoint issued one.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct TokenRefresher {
    client: Client,
    token_url: String,
    scope: String,
}

impl TokenRefresher {
    pub fn new(client: Client, settings: &SyncSettings, tenant_id: &str) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            settings.authority_host.trim_end_matches('/'),
            tenant_id
        );
        Self {
            client,
            token_url,
            scope: settings.scopes.join(" "),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// Exchange the configured refresh token for an access token.
    pub async fn refresh(&self, credentials: &CredentialSet) -> Result<AccessToken, AuthenticationError> {
        self.exchange(credentials, &credentials.refresh_token)
            .await
            .map(|grant| grant.access_token)
    }

    /// Exchange `refresh_token` (possibly a rotated one) for a new grant.
    pub async fn exchange(
        &self,
        credentials: &CredentialSet,
        refresh_token: &str,
    ) -> Result<TokenGrant, AuthenticationError> {
        info!(tenant_id = %credentials.tenant_id, "Refreshing access token");

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", self.scope.as_str()),
        ];
        if let Some(ref secret) = credentials.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(ApiError::from)?;

        let status = response.status();
        debug!(status = %status, "Token request completed");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            let code = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            warn!(status = status.as_u16(), code = %code, "Token endpoint rejected refresh");
            return Err(AuthenticationError::Rejected {
                status: status.as_u16(),
                code,
                description: parsed
                    .error_description
                    .map(|d| first_line(&d))
                    .unwrap_or_else(|| format!("HTTP {}", status)),
            });
        }

        let body = response.text().await.map_err(ApiError::from)?;
        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse token response: {}", e))
        })?;

        if token.access_token.is_empty() {
            return Err(ApiError::InvalidResponse("Token response had an empty access_token".to_string()).into());
        }

        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let access_token = AccessToken::new(token.access_token, expires_in);
        info!(
            expires_at = %access_token.expires_at,
            scope = token.scope.as_deref().unwrap_or(""),
            rotated = token.refresh_token.is_some(),
            "Access token acquired"
        );

        Ok(TokenGrant {
            access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

/// AAD descriptions carry trace and correlation ids on later lines
fn first_line(description: &str) -> String {
    description.lines().next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(secret: Option<&str>) -> CredentialSet {
        CredentialSet {
            client_id: "client-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            api_key: "key".to_string(),
            client_secret: secret.map(str::to_string),
        }
    }

    fn refresher(server: &MockServer) -> TokenRefresher {
        let settings = SyncSettings {
            authority_host: server.uri(),
            ..SyncSettings::default()
        };
        TokenRefresher::new(Client::new(), &settings, "tenant-1")
    }

    #[test]
    fn test_token_url_uses_tenant() {
        let refresher = TokenRefresher::new(Client::new(), &SyncSettings::default(), "contoso");
        assert_eq!(
            refresher.token_url(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
    }

    #[tokio::test]
    async fn test_refresh_success_yields_future_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("client_id=client-1"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "Bearer",
                "expires_in": 3599,
                "access_token": "access-1",
                "refresh_token": "refresh-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = refresher(&server)
            .exchange(&credentials(None), "refresh-1")
            .await
            .unwrap();

        assert_eq!(grant.access_token.value, "access-1");
        assert!(grant.access_token.expires_at > Utc::now());
        assert_eq!(grant.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_client_secret_is_sent_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = refresher(&server)
            .refresh(&credentials(Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(token.value, "access-1");
        assert!(token.minutes_until_expiry() >= 59);
    }

    #[tokio::test]
    async fn test_expired_refresh_token_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS700082: The refresh token has expired due to inactivity.\r\nTrace ID: 1\r\nCorrelation ID: 2"
            })))
            .mount(&server)
            .await;

        let err = refresher(&server)
            .refresh(&credentials(None))
            .await
            .unwrap_err();

        assert!(err.is_credential_expired());
        match err {
            AuthenticationError::Rejected { status, description, .. } => {
                assert_eq!(status, 400);
                assert!(description.starts_with("AADSTS700082"));
                assert!(!description.contains("Trace ID"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = refresher(&server)
            .refresh(&credentials(None))
            .await
            .unwrap_err();
        match err {
            AuthenticationError::Rejected { status, code, .. } => {
                assert_eq!(status, 503);
                assert_eq!(code, "unknown_error");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_success_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = refresher(&server)
            .refresh(&credentials(None))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::Api(ApiError::InvalidResponse(_))));
    }
}
