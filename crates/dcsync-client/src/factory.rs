use std::sync::Arc;
use std::time::Duration;

use dcsync_domain::Subcloud;

use crate::dbsync::DbsyncClient;
use crate::endpoints::{CloudEndpoints, EndpointTemplates};
use crate::error::ClientError;
use crate::identity::IdentityClient;
use crate::platform::PlatformClient;
use crate::session::{PasswordSession, TokenProvider};

/// Admin credentials used for both the master and every subcloud session.
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
    pub project: String,
}

/// The three typed clients for one cloud, sharing a single authenticated
/// session. Each sync worker owns two of these bundles: master + subcloud.
#[derive(Clone)]
pub struct CloudClients {
    pub dbsync: DbsyncClient,
    pub identity: IdentityClient,
    pub platform: PlatformClient,
    token: Arc<dyn TokenProvider>,
}

impl CloudClients {
    pub fn new(
        endpoints: &CloudEndpoints,
        token: Arc<dyn TokenProvider>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            dbsync: DbsyncClient::new(&endpoints.dbsync, http.clone(), token.clone()),
            identity: IdentityClient::new(&endpoints.identity, http.clone(), token.clone()),
            platform: PlatformClient::new(&endpoints.platform, http, token.clone()),
            token,
        }
    }

    /// Discard the cached credential so the next call re-authenticates.
    pub fn invalidate_session(&self) {
        self.token.invalidate()
    }
}

/// Builds per-cloud client bundles. The master's endpoints are configured
/// directly; a subcloud's are derived from the endpoint templates and its
/// management address.
pub struct ClientFactory {
    http: reqwest::Client,
    master: CloudEndpoints,
    templates: EndpointTemplates,
    credentials: AdminCredentials,
}

impl ClientFactory {
    pub fn new(
        master: CloudEndpoints,
        templates: EndpointTemplates,
        credentials: AdminCredentials,
        connect_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClientError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            master,
            templates,
            credentials,
        })
    }

    fn session(&self, auth_url: &str) -> Arc<dyn TokenProvider> {
        Arc::new(PasswordSession::new(
            self.http.clone(),
            auth_url,
            &self.credentials.username,
            &self.credentials.password,
            &self.credentials.project,
        ))
    }

    /// A fresh client bundle for the master cloud, with its own session.
    pub fn master_clients(&self) -> CloudClients {
        let token = self.session(&self.master.identity);
        CloudClients::new(&self.master, token, self.http.clone())
    }

    /// A fresh client bundle for one subcloud, with its own session.
    pub fn subcloud_clients(&self, subcloud: &Subcloud) -> CloudClients {
        let endpoints = self.templates.resolve(&subcloud.management_start_ip);
        let token = self.session(&endpoints.identity);
        CloudClients::new(&endpoints, token, self.http.clone())
    }
}
