use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::CredentialSet;

use super::refresher::{AuthenticationError, TokenRefresher};
use super::token::AccessToken;

struct CacheState {
    token: Option<AccessToken>,
    /// Starts as the configured refresh token and follows rotations.
    refresh_token: String,
}

/// In-memory access token cache.
///
/// The lock is held across the refresh request, so concurrent callers in a
/// reused host process wait for one refresh instead of racing the endpoint.
pub struct TokenCache {
    refresher: TokenRefresher,
    credentials: Arc<CredentialSet>,
    state: Mutex<CacheState>,
}

impl TokenCache {
    pub fn new(refresher: TokenRefresher, credentials: Arc<CredentialSet>) -> Self {
        let refresh_token = credentials.refresh_token.clone();
        Self {
            refresher,
            credentials,
            state: Mutex::new(CacheState {
                token: None,
                refresh_token,
            }),
        }
    }

    /// Return the cached token, refreshing first if it is missing or near expiry.
    pub async fn access_token(&self) -> Result<AccessToken, AuthenticationError> {
        let mut state = self.state.lock().await;

        if let Some(token) = state.token.as_ref().filter(|t| !t.needs_refresh()) {
            debug!(minutes_left = token.minutes_until_expiry(), "Reusing cached access token");
            return Ok(token.clone());
        }

        let grant = self
            .refresher
            .exchange(&self.credentials, &state.refresh_token)
            .await?;

        if let Some(rotated) = grant.refresh_token {
            if rotated != state.refresh_token {
                debug!("Refresh token rotated");
                state.refresh_token = rotated;
            }
        }
        state.token = Some(grant.access_token.clone());
        Ok(grant.access_token)
    }

    /// The cached token, if any, without refreshing
    pub async fn cached(&self) -> Option<AccessToken> {
        self.state.lock().await.token.clone()
    }

    /// Drop the cached token so the next call refreshes
    pub async fn invalidate(&self) {
        self.state.lock().await.token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use reqwest::Client;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache(server: &MockServer) -> TokenCache {
        let settings = SyncSettings {
            authority_host: server.uri(),
            ..SyncSettings::default()
        };
        let credentials = Arc::new(CredentialSet {
            client_id: "client-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            api_key: "key".to_string(),
            client_secret: None,
        });
        TokenCache::new(
            TokenRefresher::new(Client::new(), &settings, &credentials.tenant_id),
            credentials,
        )
    }

    #[tokio::test]
    async fn test_token_is_reused_until_near_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache(&server);
        assert!(cache.cached().await.is_none());
        let first = cache.access_token().await.unwrap();
        let second = cache.access_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.cached().await, Some(first));
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refreshed_each_time() {
        let server = MockServer::start().await;
        // Inside the refresh buffer from the start
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "expires_in": 60
            })))
            .expect(2)
            .mount(&server)
            .await;

        let cache = cache(&server);
        cache.access_token().await.unwrap();
        cache.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_used_next_time() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "expires_in": 3600,
                "refresh_token": "refresh-2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("refresh_token=refresh-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache(&server);
        assert_eq!(cache.access_token().await.unwrap().value, "access-1");
        cache.invalidate().await;
        assert_eq!(cache.access_token().await.unwrap().value, "access-2");
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_cache_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70008: expired"
            })))
            .mount(&server)
            .await;

        let cache = cache(&server);
        let err = cache.access_token().await.unwrap_err();
        assert!(err.is_credential_expired());
        assert!(cache.cached().await.is_none());
    }
}
