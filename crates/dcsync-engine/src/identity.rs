use dcsync_client::{ClientError, UserPatch};
use dcsync_domain::{
    split_assignment_id, DomainError, ProjectRecord, ResourceType, RoleRecord, UserRecord,
    ADMIN_USER_NAME,
};
use dcsync_store::{OrchJob, SyncStore, WorkItem};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::worker::SyncWorker;

// Handler catalog for the identity endpoint. Creates and updates replicate
// backend records through dbsync so primary keys survive; patches and
// deletes go through the identity API using the mapped subcloud id.

/// Pull `info[key]` (or the bare blob when unwrapped) out of a job's inline
/// resource info.
fn info_section<'a>(job: &'a OrchJob, key: &str) -> Result<&'a Value, EngineError> {
    let info = job
        .resource_info
        .as_ref()
        .ok_or_else(|| DomainError::MalformedResourceInfo {
            resource_type: job.resource_type.to_string(),
            message: "missing resource info".into(),
        })?;
    Ok(info.get(key).unwrap_or(info))
}

/// Subcloud-side resource id carried inline in an update job, used when no
/// mapping exists yet.
fn id_from_info(job: &OrchJob, key: &str) -> Result<String, EngineError> {
    let section = info_section(job, key)?;
    section
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            DomainError::MalformedResourceInfo {
                resource_type: job.resource_type.to_string(),
                message: "missing subcloud resource id".into(),
            }
            .into()
        })
}

impl SyncWorker {
    /// Resolve the subcloud-side id for an update: the mapping wins, the
    /// inline resource info is the fallback.
    async fn update_target_id(&self, item: &WorkItem, key: &str) -> Result<String, EngineError> {
        match self
            .store
            .mapping_by_master(&item.job.source_resource_id, &self.region)
            .await?
        {
            Some(mapping) => Ok(mapping.subcloud_id),
            None => id_from_info(&item.job, key),
        }
    }

    // ── Users ─────────────────────────────────────────────────────────────

    pub(crate) async fn create_user(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let record = self.master.dbsync.user_detail(master_id).await?;

        let created = match self.subcloud.dbsync.create_user(&record).await {
            Ok(created) => created,
            // Someone beat us to it: adopt the existing user.
            Err(ClientError::Conflict) => self.adopt_user(&record).await?,
            Err(e) => return Err(e.into()),
        };

        self.persist_mapping(ResourceType::Users, master_id, created.id())
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %created.id(),
            user = %created.name(),
            "created user"
        );
        Ok(())
    }

    async fn adopt_user(&self, record: &UserRecord) -> Result<UserRecord, EngineError> {
        let existing = self
            .subcloud
            .dbsync
            .list_users()
            .await?
            .into_iter()
            .find(|sc| record.same_identity(sc))
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "user {} conflicts on {} but no identity match found",
                    record.id(),
                    self.region
                ))
            })?;
        info!(
            region = %self.region,
            master_id = %record.id(),
            subcloud_id = %existing.id(),
            "adopting existing user after create conflict"
        );
        Ok(existing)
    }

    pub(crate) async fn update_user(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let subcloud_id = self.update_target_id(item, "user").await?;
        let record = self.master.dbsync.user_detail(master_id).await?;
        let updated = self
            .subcloud
            .dbsync
            .update_user(&subcloud_id, &record)
            .await?;
        self.persist_mapping(ResourceType::Users, master_id, updated.id())
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %updated.id(),
            user = %updated.name(),
            "updated user"
        );
        // The subcloud admin password may just have changed under the cached
        // session.
        if record.name() == ADMIN_USER_NAME {
            info!(region = %self.region, "admin user replicated, rebuilding subcloud session");
            self.subcloud.invalidate_session();
        }
        Ok(())
    }

    pub(crate) async fn patch_user(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot patch user, no equivalent user in subcloud"
            );
            return Ok(());
        };
        let patch: UserPatch = serde_json::from_value(info_section(&item.job, "user")?.clone())
            .map_err(|e| DomainError::MalformedResourceInfo {
                resource_type: item.job.resource_type.to_string(),
                message: e.to_string(),
            })?;
        let user = self
            .subcloud
            .identity
            .patch_user(&mapping.subcloud_id, &patch)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %user.id,
            "patched user"
        );
        Ok(())
    }

    pub(crate) async fn delete_user(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot delete user, no equivalent user in subcloud"
            );
            return Ok(());
        };
        self.subcloud
            .dbsync
            .delete_user(&mapping.subcloud_id)
            .await?;
        self.store.delete_mapping(master_id, &self.region).await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %mapping.subcloud_id,
            "deleted user"
        );
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub(crate) async fn create_project(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let record = self.master.dbsync.project_detail(master_id).await?;

        let created = match self.subcloud.dbsync.create_project(&record).await {
            Ok(created) => created,
            Err(ClientError::Conflict) => self.adopt_project(&record).await?,
            Err(e) => return Err(e.into()),
        };

        self.persist_mapping(ResourceType::Projects, master_id, &created.id)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %created.id,
            project = %created.name,
            "created project"
        );
        Ok(())
    }

    async fn adopt_project(&self, record: &ProjectRecord) -> Result<ProjectRecord, EngineError> {
        let existing = self
            .subcloud
            .dbsync
            .list_projects()
            .await?
            .into_iter()
            .find(|sc| record.same_identity(sc))
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "project {} conflicts on {} but no identity match found",
                    record.id, self.region
                ))
            })?;
        info!(
            region = %self.region,
            master_id = %record.id,
            subcloud_id = %existing.id,
            "adopting existing project after create conflict"
        );
        Ok(existing)
    }

    pub(crate) async fn update_project(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let subcloud_id = self.update_target_id(item, "project").await?;
        let record = self.master.dbsync.project_detail(master_id).await?;
        let updated = self
            .subcloud
            .dbsync
            .update_project(&subcloud_id, &record)
            .await?;
        self.persist_mapping(ResourceType::Projects, master_id, &updated.id)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %updated.id,
            project = %updated.name,
            "updated project"
        );
        Ok(())
    }

    pub(crate) async fn patch_project(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot patch project, no equivalent project in subcloud"
            );
            return Ok(());
        };
        let patch = info_section(&item.job, "project")?.clone();
        let project = self
            .subcloud
            .identity
            .patch_project(&mapping.subcloud_id, &patch)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %project.id,
            "patched project"
        );
        Ok(())
    }

    pub(crate) async fn delete_project(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot delete project, no equivalent project in subcloud"
            );
            return Ok(());
        };
        self.subcloud
            .dbsync
            .delete_project(&mapping.subcloud_id)
            .await?;
        self.store.delete_mapping(master_id, &self.region).await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %mapping.subcloud_id,
            "deleted project"
        );
        Ok(())
    }

    // ── Roles ─────────────────────────────────────────────────────────────

    pub(crate) async fn create_role(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let record = self.master.dbsync.role_detail(master_id).await?;

        let created = match self.subcloud.dbsync.create_role(&record).await {
            Ok(created) => created,
            Err(ClientError::Conflict) => self.adopt_role(&record).await?,
            Err(e) => return Err(e.into()),
        };

        self.persist_mapping(ResourceType::Roles, master_id, &created.id)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %created.id,
            role = %created.name,
            "created role"
        );
        Ok(())
    }

    async fn adopt_role(&self, record: &RoleRecord) -> Result<RoleRecord, EngineError> {
        let existing = self
            .subcloud
            .dbsync
            .list_roles()
            .await?
            .into_iter()
            .find(|sc| record.same_identity(sc))
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "role {} conflicts on {} but no identity match found",
                    record.id, self.region
                ))
            })?;
        info!(
            region = %self.region,
            master_id = %record.id,
            subcloud_id = %existing.id,
            "adopting existing role after create conflict"
        );
        Ok(existing)
    }

    pub(crate) async fn update_role(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let subcloud_id = self.update_target_id(item, "role").await?;
        let record = self.master.dbsync.role_detail(master_id).await?;
        let updated = self
            .subcloud
            .dbsync
            .update_role(&subcloud_id, &record)
            .await?;
        self.persist_mapping(ResourceType::Roles, master_id, &updated.id)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %updated.id,
            role = %updated.name,
            "updated role"
        );
        Ok(())
    }

    pub(crate) async fn patch_role(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot patch role, no equivalent role in subcloud"
            );
            return Ok(());
        };
        let patch = info_section(&item.job, "role")?.clone();
        let role = self
            .subcloud
            .identity
            .patch_role(&mapping.subcloud_id, &patch)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %role.id,
            "patched role"
        );
        Ok(())
    }

    pub(crate) async fn delete_role(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot delete role, no equivalent role in subcloud"
            );
            return Ok(());
        };
        self.subcloud
            .dbsync
            .delete_role(&mapping.subcloud_id)
            .await?;
        self.store.delete_mapping(master_id, &self.region).await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %mapping.subcloud_id,
            "deleted role"
        );
        Ok(())
    }

    // ── Role assignments ──────────────────────────────────────────────────

    /// Grant `<target>_<actor>_<role>` on the subcloud. Referents are
    /// resolved by name: a pre-provisioned subcloud may hold them under
    /// different ids than the master.
    pub(crate) async fn create_assignment(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let parts = split_assignment_id(master_id)?;

        let project_name = self.master.identity.get_project(&parts.target_id).await?.name;
        let user_name = self.master.identity.get_user(&parts.actor_id).await?.name;
        let role_name = self.master.identity.get_role(&parts.role_id).await?.name;

        let sc_project = self
            .subcloud
            .identity
            .list_projects()
            .await?
            .into_iter()
            .find(|p| p.name == project_name)
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "project '{}' not yet replicated to {}",
                    project_name, self.region
                ))
            })?;
        let sc_user = self
            .subcloud
            .identity
            .list_users()
            .await?
            .into_iter()
            .find(|u| u.name == user_name)
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "user '{}' not yet replicated to {}",
                    user_name, self.region
                ))
            })?;
        let sc_role = self
            .subcloud
            .identity
            .list_roles()
            .await?
            .into_iter()
            .find(|r| r.name == role_name)
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "role '{}' not yet replicated to {}",
                    role_name, self.region
                ))
            })?;

        self.subcloud
            .identity
            .grant_role(&sc_project.id, &sc_user.id, &sc_role.id)
            .await?;
        if !self
            .subcloud
            .identity
            .assignment_exists(&sc_project.id, &sc_user.id, &sc_role.id)
            .await?
        {
            return Err(EngineError::Precondition(format!(
                "role grant for {} not visible on {}",
                master_id, self.region
            )));
        }

        let subcloud_id =
            dcsync_domain::compose_assignment_id(&sc_project.id, &sc_user.id, &sc_role.id);
        self.persist_mapping(ResourceType::Assignments, master_id, &subcloud_id)
            .await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id,
            "created role assignment"
        );
        Ok(())
    }

    pub(crate) async fn delete_assignment(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot delete assignment, no equivalent assignment in subcloud"
            );
            return Ok(());
        };

        let parts = match split_assignment_id(&mapping.subcloud_id) {
            Ok(parts) => parts,
            Err(e) => {
                // A malformed stored id can never be revoked; drop the row.
                warn!(region = %self.region, master_id, error = %e, "dropping malformed assignment mapping");
                self.store.delete_mapping(master_id, &self.region).await?;
                return Ok(());
            }
        };

        self.subcloud
            .identity
            .revoke_role(&parts.target_id, &parts.actor_id, &parts.role_id)
            .await?;
        if self
            .subcloud
            .identity
            .assignment_exists(&parts.target_id, &parts.actor_id, &parts.role_id)
            .await?
        {
            return Err(EngineError::Precondition(format!(
                "role assignment {} still visible on {} after revoke",
                master_id, self.region
            )));
        }

        self.store.delete_mapping(master_id, &self.region).await?;
        info!(
            region = %self.region,
            master_id,
            subcloud_id = %mapping.subcloud_id,
            "deleted role assignment"
        );
        Ok(())
    }

    // ── Token revocation events ───────────────────────────────────────────

    pub(crate) async fn create_revoke_event(&self, item: &WorkItem) -> Result<(), EngineError> {
        let audit_id = &item.job.source_resource_id;
        let record = self.master.dbsync.revoke_event_by_audit(audit_id).await?;

        let subcloud_id = match self.subcloud.dbsync.create_revoke_event(&record).await {
            Ok(created) => created.audit_id.unwrap_or_else(|| audit_id.clone()),
            // Revocation events are immutable; an existing one is the one.
            Err(ClientError::Conflict) => audit_id.clone(),
            Err(e) => return Err(e.into()),
        };

        self.persist_mapping(ResourceType::RevokeEvents, audit_id, &subcloud_id)
            .await?;
        info!(region = %self.region, audit_id, "created token revocation event");
        Ok(())
    }

    pub(crate) async fn delete_revoke_event(&self, item: &WorkItem) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot delete revocation event, no equivalent event in subcloud"
            );
            return Ok(());
        };
        self.subcloud
            .dbsync
            .delete_revoke_event_by_audit(&mapping.subcloud_id)
            .await?;
        self.store.delete_mapping(master_id, &self.region).await?;
        info!(region = %self.region, master_id, "deleted token revocation event");
        Ok(())
    }

    pub(crate) async fn create_user_revoke_event(
        &self,
        item: &WorkItem,
    ) -> Result<(), EngineError> {
        // The source id is the url-safe encoded <user_id>_<issued_before>.
        let event_ref = &item.job.source_resource_id;
        let record = self.master.dbsync.revoke_event_by_user(event_ref).await?;

        match self.subcloud.dbsync.create_revoke_event(&record).await {
            Ok(_) | Err(ClientError::Conflict) => {}
            Err(e) => return Err(e.into()),
        }

        self.persist_mapping(ResourceType::UserRevokeEvents, event_ref, event_ref)
            .await?;
        info!(region = %self.region, event_ref, "created password-change revocation event");
        Ok(())
    }

    pub(crate) async fn delete_user_revoke_event(
        &self,
        item: &WorkItem,
    ) -> Result<(), EngineError> {
        let master_id = &item.job.source_resource_id;
        let Some(mapping) = self.store.mapping_by_master(master_id, &self.region).await? else {
            warn!(
                region = %self.region,
                master_id,
                "cannot delete revocation event, no equivalent event in subcloud"
            );
            return Ok(());
        };
        self.subcloud
            .dbsync
            .delete_revoke_event_by_user(&mapping.subcloud_id)
            .await?;
        self.store.delete_mapping(master_id, &self.region).await?;
        info!(region = %self.region, master_id, "deleted password-change revocation event");
        Ok(())
    }
}
