use std::sync::Arc;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::http::{expect_json, expect_success, AUTH_TOKEN_HEADER};
use crate::session::TokenProvider;

/// One fernet key: its ring index and the key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FernetKey {
    pub id: u32,
    pub key: String,
}

/// Client for one cloud's platform endpoint; the engine only uses its fernet
/// key repo surface.
#[derive(Clone)]
pub struct PlatformClient {
    base: String,
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
}

impl PlatformClient {
    pub fn new(
        base: impl Into<String>,
        http: reqwest::Client,
        token: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            base: base.into(),
            http,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    /// Read the cloud's current fernet key ring.
    pub async fn get_fernet_keys(&self) -> Result<Vec<FernetKey>, ClientError> {
        let url = self.url("/fernet_repo");
        let token = self.token.token().await?;
        let resp = self
            .http
            .get(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?;
        expect_json(resp, StatusCode::OK, &url).await
    }

    /// Install a key ring on a cloud that has none yet.
    pub async fn create_fernet_repo(&self, keys: &[FernetKey]) -> Result<(), ClientError> {
        let url = self.url("/fernet_repo");
        let token = self.token.token().await?;
        let resp = self
            .http
            .post(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(&keys)
            .send()
            .await?;
        expect_success(resp).await
    }

    /// Replace a cloud's key ring with the given one.
    pub async fn update_fernet_repo(&self, keys: &[FernetKey]) -> Result<(), ClientError> {
        let url = self.url("/fernet_repo");
        let token = self.token.token().await?;
        let resp = self
            .http
            .put(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(&keys)
            .send()
            .await?;
        expect_success(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticToken;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> PlatformClient {
        PlatformClient::new(
            server.uri(),
            reqwest::Client::new(),
            Arc::new(StaticToken("secret".into())),
        )
    }

    #[tokio::test]
    async fn key_ring_round_trip() {
        let server = MockServer::start().await;
        let keys = vec![
            FernetKey { id: 0, key: "k0".into() },
            FernetKey { id: 1, key: "k1".into() },
        ];
        Mock::given(method("GET"))
            .and(path("/fernet_repo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&keys))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/fernet_repo"))
            .and(body_json(json!([
                { "id": 0, "key": "k0" },
                { "id": 1, "key": "k1" }
            ])))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(c.get_fernet_keys().await.unwrap(), keys);
        c.update_fernet_repo(&keys).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_maps_to_the_taxonomy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fernet_repo"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        assert!(matches!(
            client(&server).get_fernet_keys().await,
            Err(ClientError::Unauthorized)
        ));
    }
}
