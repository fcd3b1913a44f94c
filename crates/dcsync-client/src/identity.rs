use std::sync::Arc;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::http::{expect_json, expect_status, AUTH_TOKEN_HEADER};
use crate::session::TokenProvider;

// API-level references, used where the engine works through the identity
// service rather than the replication endpoint: field-level patches, deletes,
// and resolving pre-provisioned resources by name before a role grant.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRole {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain_id: Option<String>,
}

/// Field-level user update, applied through the identity API. Only set
/// fields are sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_project_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct UserEnvelope {
    user: ApiUser,
}

#[derive(Serialize, Deserialize)]
struct UsersEnvelope {
    users: Vec<ApiUser>,
}

#[derive(Serialize, Deserialize)]
struct ProjectEnvelope {
    project: ApiProject,
}

#[derive(Serialize, Deserialize)]
struct ProjectsEnvelope {
    projects: Vec<ApiProject>,
}

#[derive(Serialize, Deserialize)]
struct RoleEnvelope {
    role: ApiRole,
}

#[derive(Serialize, Deserialize)]
struct RolesEnvelope {
    roles: Vec<ApiRole>,
}

#[derive(Deserialize)]
struct RoleAssignmentsEnvelope {
    role_assignments: Vec<serde_json::Value>,
}

/// Client for one cloud's identity-service API (v3 style).
#[derive(Clone)]
pub struct IdentityClient {
    base: String,
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
}

impl IdentityClient {
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

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        let token = self.token.token().await?;
        let resp = self
            .http
            .get(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?;
        expect_json(resp, StatusCode::OK, &url).await
    }

    /// DELETE expecting 204; 404 means already gone and is success.
    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let url = self.url(path);
        let token = self.token.token().await?;
        let resp = self
            .http
            .delete(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?;
        match expect_status(resp, StatusCode::NO_CONTENT).await {
            Err(ClientError::NotFound) => Ok(()),
            other => other,
        }
    }

    // ── Users ─────────────────────────────────────────────────────────────

    pub async fn list_users(&self) -> Result<Vec<ApiUser>, ClientError> {
        let envelope: UsersEnvelope = self.get_json("/users").await?;
        Ok(envelope.users)
    }

    pub async fn get_user(&self, id: &str) -> Result<ApiUser, ClientError> {
        let envelope: UserEnvelope = self.get_json(&format!("/users/{}", id)).await?;
        Ok(envelope.user)
    }

    pub async fn patch_user(&self, id: &str, patch: &UserPatch) -> Result<ApiUser, ClientError> {
        let url = self.url(&format!("/users/{}", id));
        let token = self.token.token().await?;
        let resp = self
            .http
            .patch(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(&serde_json::json!({ "user": patch }))
            .send()
            .await?;
        let envelope: UserEnvelope = expect_json(resp, StatusCode::OK, &url).await?;
        Ok(envelope.user)
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub async fn list_projects(&self) -> Result<Vec<ApiProject>, ClientError> {
        let envelope: ProjectsEnvelope = self.get_json("/projects").await?;
        Ok(envelope.projects)
    }

    pub async fn get_project(&self, id: &str) -> Result<ApiProject, ClientError> {
        let envelope: ProjectEnvelope = self.get_json(&format!("/projects/{}", id)).await?;
        Ok(envelope.project)
    }

    /// Field-level project update; `fields` holds only the attributes to
    /// change.
    pub async fn patch_project(
        &self,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<ApiProject, ClientError> {
        let url = self.url(&format!("/projects/{}", id));
        let token = self.token.token().await?;
        let resp = self
            .http
            .patch(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(&serde_json::json!({ "project": fields }))
            .send()
            .await?;
        let envelope: ProjectEnvelope = expect_json(resp, StatusCode::OK, &url).await?;
        Ok(envelope.project)
    }

    // ── Roles ─────────────────────────────────────────────────────────────

    pub async fn list_roles(&self) -> Result<Vec<ApiRole>, ClientError> {
        let envelope: RolesEnvelope = self.get_json("/roles").await?;
        Ok(envelope.roles)
    }

    pub async fn get_role(&self, id: &str) -> Result<ApiRole, ClientError> {
        let envelope: RoleEnvelope = self.get_json(&format!("/roles/{}", id)).await?;
        Ok(envelope.role)
    }

    /// Field-level role update; `fields` holds only the attributes to
    /// change.
    pub async fn patch_role(
        &self,
        id: &str,
        fields: &serde_json::Value,
    ) -> Result<ApiRole, ClientError> {
        let url = self.url(&format!("/roles/{}", id));
        let token = self.token.token().await?;
        let resp = self
            .http
            .patch(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(&serde_json::json!({ "role": fields }))
            .send()
            .await?;
        let envelope: RoleEnvelope = expect_json(resp, StatusCode::OK, &url).await?;
        Ok(envelope.role)
    }

    // ── Role assignments ──────────────────────────────────────────────────

    pub async fn grant_role(
        &self,
        project_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), ClientError> {
        let url = self.url(&format!(
            "/projects/{}/users/{}/roles/{}",
            project_id, user_id, role_id
        ));
        let token = self.token.token().await?;
        let resp = self
            .http
            .put(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .send()
            .await?;
        expect_status(resp, StatusCode::NO_CONTENT).await
    }

    /// Revoke with absent-is-success semantics.
    pub async fn revoke_role(
        &self,
        project_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), ClientError> {
        self.delete(&format!(
            "/projects/{}/users/{}/roles/{}",
            project_id, user_id, role_id
        ))
        .await
    }

    /// Check whether the grant is visible, used to confirm grant/revoke
    /// round trips before the mapping is persisted.
    pub async fn assignment_exists(
        &self,
        project_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<bool, ClientError> {
        let envelope: RoleAssignmentsEnvelope = self
            .get_json(&format!(
                "/role_assignments?scope.project.id={}&user.id={}&role.id={}",
                project_id, user_id, role_id
            ))
            .await?;
        Ok(!envelope.role_assignments.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticToken;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> IdentityClient {
        IdentityClient::new(
            server.uri(),
            reqwest::Client::new(),
            Arc::new(StaticToken("secret".into())),
        )
    }

    #[tokio::test]
    async fn list_and_get_users() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [ { "id": "u-1", "name": "alice" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/u-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": { "id": "u-1", "name": "alice" }
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(c.list_users().await.unwrap()[0].name, "alice");
        assert_eq!(c.get_user("u-1").await.unwrap().id, "u-1");
    }

    #[tokio::test]
    async fn patch_sends_only_set_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/users/u-1"))
            .and(wiremock::matchers::body_json(json!({
                "user": { "enabled": false }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": { "id": "u-1", "name": "alice", "enabled": false }
            })))
            .mount(&server)
            .await;

        let patch = UserPatch {
            enabled: Some(false),
            ..Default::default()
        };
        let user = client(&server).patch_user("u-1", &patch).await.unwrap();
        assert_eq!(user.enabled, Some(false));
    }

    #[tokio::test]
    async fn grant_and_revoke_role() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/projects/p-1/users/u-1/roles/r-1$"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/projects/p-1/users/u-1/roles/r-1$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = client(&server);
        c.grant_role("p-1", "u-1", "r-1").await.unwrap();
        // 404 on revoke means already revoked.
        c.revoke_role("p-1", "u-1", "r-1").await.unwrap();
    }

    #[tokio::test]
    async fn assignment_exists_checks_the_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/role_assignments"))
            .and(query_param("user.id", "u-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "role_assignments": [ { "role": { "id": "r-1" } } ]
            })))
            .mount(&server)
            .await;

        assert!(client(&server)
            .assignment_exists("p-1", "u-1", "r-1")
            .await
            .unwrap());
    }

}
