use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::ClientError;

/// Abstraction over token acquisition for one cloud's session.
///
/// Workers hold a long-lived session per cloud; on `Unauthorized` the session
/// is invalidated and the failing call retried exactly once, so the provider
/// must hand out a fresh token after [`invalidate`](Self::invalidate).
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self) -> Result<String, ClientError>;

    /// Drop any cached credential; the next [`token`](Self::token) call
    /// re-authenticates.
    fn invalidate(&self);
}

/// Test token provider: a fixed string without any network call.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }

    fn invalidate(&self) {}
}

/// Production token provider: password authentication against a keystone
/// `POST /auth/tokens` endpoint, with the issued token cached until
/// invalidated.
pub struct PasswordSession {
    http: reqwest::Client,
    auth_url: String,
    username: String,
    password: String,
    project: String,
    cached: RwLock<Option<String>>,
}

impl PasswordSession {
    pub fn new(
        http: reqwest::Client,
        auth_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            http,
            auth_url: auth_url.into(),
            username: username.into(),
            password: password.into(),
            project: project.into(),
            cached: RwLock::new(None),
        }
    }

    async fn authenticate(&self) -> Result<String, ClientError> {
        let url = format!("{}/auth/tokens", self.auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": "Default" },
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.project,
                        "domain": { "name": "Default" },
                    }
                }
            }
        });

        let resp = self.http.post(&url).json(&body).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        if !resp.status().is_success() {
            return Err(ClientError::Internal(format!(
                "token request to {} failed with {}",
                url,
                resp.status()
            )));
        }
        let token = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::Internal(format!("no subject token in response from {}", url))
            })?;
        debug!(auth_url = %self.auth_url, "authenticated session");
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for PasswordSession {
    async fn token(&self) -> Result<String, ClientError> {
        if let Some(token) = self
            .cached
            .read()
            .map_err(|_| ClientError::Internal("session cache poisoned".into()))?
            .clone()
        {
            return Ok(token);
        }
        let token = self.authenticate().await?;
        *self
            .cached
            .write()
            .map_err(|_| ClientError::Internal("session cache poisoned".into()))? =
            Some(token.clone());
        Ok(token)
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.write() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(server: &MockServer) -> PasswordSession {
        PasswordSession::new(
            reqwest::Client::new(),
            server.uri(),
            "dcsync",
            "secret",
            "services",
        )
    }

    #[tokio::test]
    async fn token_is_cached_until_invalidated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/tokens"))
            .respond_with(
                ResponseTemplate::new(201).insert_header("x-subject-token", "issued-token"),
            )
            .expect(2)
            .mount(&server)
            .await;

        let session = session(&server);
        assert_eq!(session.token().await.unwrap(), "issued-token");
        // Cached: no second request.
        assert_eq!(session.token().await.unwrap(), "issued-token");

        session.invalidate();
        assert_eq!(session.token().await.unwrap(), "issued-token");
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/tokens"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(matches!(
            session(&server).token().await,
            Err(ClientError::Unauthorized)
        ));
    }
}
