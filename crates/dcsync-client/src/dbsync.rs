use std::sync::Arc;

use dcsync_domain::{
    AssignmentRecord, ProjectRecord, RevocationEventRecord, RoleRecord, UserRecord,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::http::{expect_json, expect_status, AUTH_TOKEN_HEADER};
use crate::session::TokenProvider;

// Detail, create and update exchange single records wrapped in a keyed
// envelope; list endpoints return bare arrays. User records are already a
// composite of their two backend rows, so they travel unwrapped.

#[derive(Serialize, Deserialize)]
struct ProjectEnvelope {
    project: ProjectRecord,
}

#[derive(Serialize, Deserialize)]
struct RoleEnvelope {
    role: RoleRecord,
}

#[derive(Serialize, Deserialize)]
struct RevocationEventEnvelope {
    revocation_event: RevocationEventRecord,
}

/// Typed client for the database-replication ("dbsync") endpoint of one
/// cloud. Transfers backend rows verbatim so that primary keys are preserved
/// across clouds.
#[derive(Clone)]
pub struct DbsyncClient {
    base: String,
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
}

impl DbsyncClient {
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

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        let token = self.token.token().await?;
        let resp = self
            .http
            .post(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;
        expect_json(resp, StatusCode::CREATED, &url).await
    }

    async fn put_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        let token = self.token.token().await?;
        let resp = self
            .http
            .put(&url)
            .header(AUTH_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;
        expect_json(resp, StatusCode::OK, &url).await
    }

    /// DELETE with absent-is-success semantics: a 404 means the resource is
    /// already gone, which is what the caller wanted.
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

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, ClientError> {
        self.get_json("/identity/users/").await
    }

    pub async fn user_detail(&self, id: &str) -> Result<UserRecord, ClientError> {
        self.get_json(&format!("/identity/users/{}", id)).await
    }

    pub async fn create_user(&self, record: &UserRecord) -> Result<UserRecord, ClientError> {
        self.post_json("/identity/users/", record).await
    }

    pub async fn update_user(
        &self,
        subcloud_id: &str,
        record: &UserRecord,
    ) -> Result<UserRecord, ClientError> {
        self.put_json(&format!("/identity/users/{}", subcloud_id), record)
            .await
    }

    pub async fn delete_user(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/identity/users/{}", id)).await
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>, ClientError> {
        self.get_json("/identity/projects/").await
    }

    pub async fn project_detail(&self, id: &str) -> Result<ProjectRecord, ClientError> {
        let envelope: ProjectEnvelope =
            self.get_json(&format!("/identity/projects/{}", id)).await?;
        Ok(envelope.project)
    }

    pub async fn create_project(
        &self,
        record: &ProjectRecord,
    ) -> Result<ProjectRecord, ClientError> {
        let envelope: ProjectEnvelope = self
            .post_json(
                "/identity/projects/",
                &ProjectEnvelope {
                    project: record.clone(),
                },
            )
            .await?;
        Ok(envelope.project)
    }

    pub async fn update_project(
        &self,
        subcloud_id: &str,
        record: &ProjectRecord,
    ) -> Result<ProjectRecord, ClientError> {
        let envelope: ProjectEnvelope = self
            .put_json(
                &format!("/identity/projects/{}", subcloud_id),
                &ProjectEnvelope {
                    project: record.clone(),
                },
            )
            .await?;
        Ok(envelope.project)
    }

    pub async fn delete_project(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/identity/projects/{}", id)).await
    }

    // ── Roles ─────────────────────────────────────────────────────────────

    pub async fn list_roles(&self) -> Result<Vec<RoleRecord>, ClientError> {
        self.get_json("/identity/roles/").await
    }

    pub async fn role_detail(&self, id: &str) -> Result<RoleRecord, ClientError> {
        let envelope: RoleEnvelope = self.get_json(&format!("/identity/roles/{}", id)).await?;
        Ok(envelope.role)
    }

    pub async fn create_role(&self, record: &RoleRecord) -> Result<RoleRecord, ClientError> {
        let envelope: RoleEnvelope = self
            .post_json("/identity/roles/", &RoleEnvelope { role: record.clone() })
            .await?;
        Ok(envelope.role)
    }

    pub async fn update_role(
        &self,
        subcloud_id: &str,
        record: &RoleRecord,
    ) -> Result<RoleRecord, ClientError> {
        let envelope: RoleEnvelope = self
            .put_json(
                &format!("/identity/roles/{}", subcloud_id),
                &RoleEnvelope { role: record.clone() },
            )
            .await?;
        Ok(envelope.role)
    }

    pub async fn delete_role(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/identity/roles/{}", id)).await
    }

    // ── Token revocation events ───────────────────────────────────────────

    pub async fn list_revoke_events(&self) -> Result<Vec<RevocationEventRecord>, ClientError> {
        self.get_json("/identity/revoke_events/").await
    }

    /// Fetch one event by its token-revocation audit id.
    pub async fn revoke_event_by_audit(
        &self,
        audit_id: &str,
    ) -> Result<RevocationEventRecord, ClientError> {
        let envelope: RevocationEventEnvelope = self
            .get_json(&format!("/identity/revoke_events/{}", audit_id))
            .await?;
        Ok(envelope.revocation_event)
    }

    /// Fetch one password-change event by its encoded
    /// `<user_id>_<issued_before>` reference.
    pub async fn revoke_event_by_user(
        &self,
        event_ref: &str,
    ) -> Result<RevocationEventRecord, ClientError> {
        let envelope: RevocationEventEnvelope = self
            .get_json(&format!("/identity/revoke_events/users/{}", event_ref))
            .await?;
        Ok(envelope.revocation_event)
    }

    pub async fn create_revoke_event(
        &self,
        record: &RevocationEventRecord,
    ) -> Result<RevocationEventRecord, ClientError> {
        let envelope: RevocationEventEnvelope = self
            .post_json(
                "/identity/revoke_events/",
                &RevocationEventEnvelope {
                    revocation_event: record.clone(),
                },
            )
            .await?;
        Ok(envelope.revocation_event)
    }

    pub async fn delete_revoke_event_by_audit(&self, audit_id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/identity/revoke_events/{}", audit_id))
            .await
    }

    pub async fn delete_revoke_event_by_user(&self, event_ref: &str) -> Result<(), ClientError> {
        self.delete(&format!("/identity/revoke_events/users/{}", event_ref))
            .await
    }

    // ── Role assignments ──────────────────────────────────────────────────

    pub async fn list_assignments(&self) -> Result<Vec<AssignmentRecord>, ClientError> {
        self.get_json("/identity/assignments/").await
    }

    /// Fetch one assignment by its synthetic `<target>_<actor>_<role>` id.
    pub async fn assignment_detail(
        &self,
        assignment_ref: &str,
    ) -> Result<AssignmentRecord, ClientError> {
        self.get_json(&format!("/identity/assignments/{}", assignment_ref))
            .await
    }

    pub async fn create_assignment(
        &self,
        record: &AssignmentRecord,
    ) -> Result<AssignmentRecord, ClientError> {
        self.post_json("/identity/assignments/", record).await
    }
}
