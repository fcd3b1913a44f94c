use chrono::Utc;
use dcsync_domain::{
    user_revoke_event_id, AssignmentRecord, AssignmentView, EndpointType, NamedRef,
    OperationType, ProjectRecord, ResourceType, RevocationEventRecord, RoleRecord, SyncStatus,
    UserRecord,
};
use dcsync_store::{OrchJob, SyncStore};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::worker::SyncWorker;

// The reconciliation audit: pull both sides of each resource type, classify
// every master resource as missing / mismatched / in-sync, adopt
// pre-provisioned subcloud resources via the mapping table, and enqueue
// corrective work for the rest. Resource types run in an order that respects
// referential dependencies, so an assignment is never enqueued before the
// user, project and role it references.

/// A resource type the audit can diff across clouds.
pub(crate) trait Auditable: Clone + Send + Sync {
    const RESOURCE_TYPE: ResourceType;

    /// The resource's id on the cloud the record came from.
    fn resource_id(&self) -> String;

    /// Cheap identity check: same logical resource, attributes may differ.
    fn same_ids(&self, other: &Self) -> bool;

    /// Deep attribute comparison.
    fn same_record(&self, other: &Self) -> bool;

    /// Inline payload for corrective create/update items.
    fn resource_info(&self) -> Option<Value>;
}

impl Auditable for UserRecord {
    const RESOURCE_TYPE: ResourceType = ResourceType::Users;

    fn resource_id(&self) -> String {
        self.id().to_string()
    }

    fn same_ids(&self, other: &Self) -> bool {
        self.same_identity(other)
    }

    fn same_record(&self, other: &Self) -> bool {
        UserRecord::same_record(self, other)
    }

    fn resource_info(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}

impl Auditable for ProjectRecord {
    const RESOURCE_TYPE: ResourceType = ResourceType::Projects;

    fn resource_id(&self) -> String {
        self.id.clone()
    }

    fn same_ids(&self, other: &Self) -> bool {
        self.same_identity(other)
    }

    fn same_record(&self, other: &Self) -> bool {
        ProjectRecord::same_record(self, other)
    }

    fn resource_info(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}

impl Auditable for RoleRecord {
    const RESOURCE_TYPE: ResourceType = ResourceType::Roles;

    fn resource_id(&self) -> String {
        self.id.clone()
    }

    fn same_ids(&self, other: &Self) -> bool {
        self.same_identity(other)
    }

    fn same_record(&self, other: &Self) -> bool {
        RoleRecord::same_record(self, other)
    }

    fn resource_info(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}

impl Auditable for AssignmentView {
    const RESOURCE_TYPE: ResourceType = ResourceType::Assignments;

    fn resource_id(&self) -> String {
        self.synthetic_id()
    }

    // The tuple is the whole record, so identity and attribute comparison
    // coincide and a mismatch state cannot occur.
    fn same_ids(&self, other: &Self) -> bool {
        self.same_resource(other)
    }

    fn same_record(&self, other: &Self) -> bool {
        self.same_resource(other)
    }

    fn resource_info(&self) -> Option<Value> {
        None
    }
}

/// Revocation events created by token revocation, keyed by audit id.
#[derive(Debug, Clone)]
pub(crate) struct AuditedRevokeEvent(pub RevocationEventRecord);

impl Auditable for AuditedRevokeEvent {
    const RESOURCE_TYPE: ResourceType = ResourceType::RevokeEvents;

    fn resource_id(&self) -> String {
        self.0.audit_id.clone().unwrap_or_default()
    }

    fn same_ids(&self, other: &Self) -> bool {
        self.0.same_record(&other.0)
    }

    fn same_record(&self, other: &Self) -> bool {
        self.0.same_record(&other.0)
    }

    fn resource_info(&self) -> Option<Value> {
        serde_json::to_value(&self.0).ok()
    }
}

/// Revocation events created by password changes, keyed by the encoded
/// `<user_id>_<issued_before>` pair.
#[derive(Debug, Clone)]
pub(crate) struct UserRevokeEvent(pub RevocationEventRecord);

impl Auditable for UserRevokeEvent {
    const RESOURCE_TYPE: ResourceType = ResourceType::UserRevokeEvents;

    fn resource_id(&self) -> String {
        match &self.0.user_id {
            Some(user_id) => user_revoke_event_id(user_id, &self.0.issued_before),
            None => String::new(),
        }
    }

    fn same_ids(&self, other: &Self) -> bool {
        self.0.same_record(&other.0)
    }

    fn same_record(&self, other: &Self) -> bool {
        self.0.same_record(&other.0)
    }

    fn resource_info(&self) -> Option<Value> {
        serde_json::to_value(&self.0).ok()
    }
}

/// Discrepancy tally for one resource type's pass.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AuditCounts {
    pub missing: usize,
    pub mismatched: usize,
    pub extra: usize,
    pub adopted: usize,
    pub in_sync: usize,
}

impl AuditCounts {
    /// Adoption only writes a mapping, so an adopted resource is clean.
    pub fn is_clean(&self) -> bool {
        self.missing == 0 && self.mismatched == 0 && self.extra == 0
    }
}

/// Join assignments with the user/project/role lists fetched earlier in the
/// same audit pass. Assignments whose referents are not in those lists are
/// skipped, as are group and domain-scoped assignments.
pub(crate) fn build_assignment_views(
    assignments: &[AssignmentRecord],
    users: &[UserRecord],
    projects: &[ProjectRecord],
    roles: &[RoleRecord],
) -> Vec<AssignmentView> {
    assignments
        .iter()
        .filter(|a| a.is_auditable())
        .filter_map(|a| {
            let user = users.iter().find(|u| u.id() == a.actor_id)?;
            let project = projects.iter().find(|p| p.id == a.target_id)?;
            let role = roles.iter().find(|r| r.id == a.role_id)?;
            Some(AssignmentView {
                project: NamedRef {
                    id: project.id.clone(),
                    name: project.name.clone(),
                    domain_id: project.domain_id.clone(),
                },
                user: NamedRef {
                    id: user.id().to_string(),
                    name: user.name().to_string(),
                    domain_id: user.user.domain_id.clone(),
                },
                role: NamedRef {
                    id: role.id.clone(),
                    name: role.name.clone(),
                    domain_id: role.domain_id.clone(),
                },
            })
        })
        .collect()
}

impl SyncWorker {
    pub(crate) async fn run_audit(&self) -> Result<(), EngineError> {
        match self.endpoint_type {
            EndpointType::Identity => self.run_identity_audit().await,
            EndpointType::Platform => self.run_platform_audit().await,
        }
    }

    /// Key distribution is push-driven; the platform audit only refreshes
    /// the endpoint status so a drained queue can report in-sync.
    async fn run_platform_audit(&self) -> Result<(), EngineError> {
        self.store
            .record_audit_result(&self.region, self.endpoint_type, true, Utc::now())
            .await?;
        if self
            .store
            .queued_count(&self.region, self.endpoint_type)
            .await?
            == 0
        {
            self.store
                .set_sync_status(&self.region, self.endpoint_type, SyncStatus::InSync)
                .await?;
            self.faults
                .mark_recovered(&self.region, self.endpoint_type)
                .await;
        }
        Ok(())
    }

    async fn run_identity_audit(&self) -> Result<(), EngineError> {
        info!(region = %self.region, "identity audit starting");
        let mut clean = true;

        // Users.
        let user_exclusions = self.exclusions.users_for_region(&self.region);
        let m_users: Vec<UserRecord> = self
            .with_master_retry(|| self.master.dbsync.list_users())
            .await?
            .into_iter()
            .filter(|u| !user_exclusions.iter().any(|x| x == u.name()))
            .collect();
        let sc_users: Vec<UserRecord> = self
            .with_subcloud_retry(|| self.subcloud.dbsync.list_users())
            .await?
            .into_iter()
            .filter(|u| !user_exclusions.iter().any(|x| x == u.name()))
            .collect();
        if m_users.is_empty() {
            // An empty master list is suspicious, not actionable.
            info!(region = %self.region, "master returned no users, skipping users pass");
        } else {
            clean &= self.audit_resource_type(&m_users, &sc_users).await?.is_clean();
        }

        // Projects.
        let m_projects: Vec<ProjectRecord> = self
            .with_master_retry(|| self.master.dbsync.list_projects())
            .await?
            .into_iter()
            .filter(|p| !self.exclusions.projects.iter().any(|x| x == &p.name))
            .collect();
        let sc_projects: Vec<ProjectRecord> = self
            .with_subcloud_retry(|| self.subcloud.dbsync.list_projects())
            .await?
            .into_iter()
            .filter(|p| !self.exclusions.projects.iter().any(|x| x == &p.name))
            .collect();
        if m_projects.is_empty() {
            info!(region = %self.region, "master returned no projects, skipping projects pass");
        } else {
            clean &= self
                .audit_resource_type(&m_projects, &sc_projects)
                .await?
                .is_clean();
        }

        // Roles.
        let m_roles: Vec<RoleRecord> = self
            .with_master_retry(|| self.master.dbsync.list_roles())
            .await?
            .into_iter()
            .filter(|r| !self.exclusions.roles.iter().any(|x| x == &r.name))
            .collect();
        let sc_roles: Vec<RoleRecord> = self
            .with_subcloud_retry(|| self.subcloud.dbsync.list_roles())
            .await?
            .into_iter()
            .filter(|r| !self.exclusions.roles.iter().any(|x| x == &r.name))
            .collect();
        if m_roles.is_empty() {
            info!(region = %self.region, "master returned no roles, skipping roles pass");
        } else {
            clean &= self.audit_resource_type(&m_roles, &sc_roles).await?.is_clean();
        }

        // Assignments, enriched with names from the lists above.
        let m_assignments = build_assignment_views(
            &self
                .with_master_retry(|| self.master.dbsync.list_assignments())
                .await?,
            &m_users,
            &m_projects,
            &m_roles,
        );
        let sc_assignments = build_assignment_views(
            &self
                .with_subcloud_retry(|| self.subcloud.dbsync.list_assignments())
                .await?,
            &sc_users,
            &sc_projects,
            &sc_roles,
        );
        if m_assignments.is_empty() {
            debug!(region = %self.region, "no auditable assignments on master");
        } else {
            clean &= self
                .audit_resource_type(&m_assignments, &sc_assignments)
                .await?
                .is_clean();
        }

        // Revocation events, one fetch serving both synthetic types.
        let m_events = self
            .with_master_retry(|| self.master.dbsync.list_revoke_events())
            .await?;
        let sc_events = self
            .with_subcloud_retry(|| self.subcloud.dbsync.list_revoke_events())
            .await?;

        let m_audit_events: Vec<AuditedRevokeEvent> = m_events
            .iter()
            .filter(|e| e.audit_id.is_some())
            .cloned()
            .map(AuditedRevokeEvent)
            .collect();
        let sc_audit_events: Vec<AuditedRevokeEvent> = sc_events
            .iter()
            .filter(|e| e.audit_id.is_some())
            .cloned()
            .map(AuditedRevokeEvent)
            .collect();
        if !m_audit_events.is_empty() {
            clean &= self
                .audit_resource_type(&m_audit_events, &sc_audit_events)
                .await?
                .is_clean();
        }

        let m_user_events: Vec<UserRevokeEvent> = m_events
            .into_iter()
            .filter(|e| e.user_id.is_some())
            .map(UserRevokeEvent)
            .collect();
        let sc_user_events: Vec<UserRevokeEvent> = sc_events
            .into_iter()
            .filter(|e| e.user_id.is_some())
            .map(UserRevokeEvent)
            .collect();
        if !m_user_events.is_empty() {
            clean &= self
                .audit_resource_type(&m_user_events, &sc_user_events)
                .await?
                .is_clean();
        }

        self.store
            .record_audit_result(&self.region, self.endpoint_type, clean, Utc::now())
            .await?;
        if clean {
            if self
                .store
                .queued_count(&self.region, self.endpoint_type)
                .await?
                == 0
            {
                self.store
                    .set_sync_status(&self.region, self.endpoint_type, SyncStatus::InSync)
                    .await?;
                self.faults
                    .mark_recovered(&self.region, self.endpoint_type)
                    .await;
            }
        } else {
            self.mark_out_of_sync().await;
        }
        info!(region = %self.region, clean, "identity audit finished");
        Ok(())
    }

    /// Diff one resource type and enqueue corrective work.
    pub(crate) async fn audit_resource_type<R: Auditable>(
        &self,
        masters: &[R],
        subclouds: &[R],
    ) -> Result<AuditCounts, EngineError> {
        let mut counts = AuditCounts::default();
        let mut matched = vec![false; subclouds.len()];

        for master in masters {
            let master_id = master.resource_id();
            match subclouds.iter().position(|sc| master.same_ids(sc)) {
                None => {
                    if self
                        .map_subcloud_resource(master, subclouds, &mut matched)
                        .await?
                    {
                        counts.adopted += 1;
                        continue;
                    }
                    debug!(
                        region = %self.region,
                        resource = %R::RESOURCE_TYPE,
                        master_id,
                        "missing on subcloud"
                    );
                    self.enqueue_fix(
                        R::RESOURCE_TYPE,
                        OperationType::Create,
                        &master_id,
                        master.resource_info(),
                    )
                    .await?;
                    counts.missing += 1;
                }
                Some(idx) => {
                    matched[idx] = true;
                    let subcloud = &subclouds[idx];
                    // Known resource: keep the id mapping current whether or
                    // not the attributes agree.
                    self.ensure_mapping(R::RESOURCE_TYPE, &master_id, &subcloud.resource_id())
                        .await?;
                    if master.same_record(subcloud) {
                        counts.in_sync += 1;
                    } else {
                        debug!(
                            region = %self.region,
                            resource = %R::RESOURCE_TYPE,
                            master_id,
                            "mismatched on subcloud"
                        );
                        self.enqueue_fix(
                            R::RESOURCE_TYPE,
                            OperationType::Put,
                            &master_id,
                            master.resource_info(),
                        )
                        .await?;
                        counts.mismatched += 1;
                    }
                }
            }
        }

        for (idx, subcloud) in subclouds.iter().enumerate() {
            if matched[idx] {
                continue;
            }
            let subcloud_id = subcloud.resource_id();
            // Only resources the engine itself replicated are deleted; a
            // subcloud resource unknown to the master is left alone.
            if let Some(mapping) = self
                .store
                .mapping_by_subcloud(&self.region, &subcloud_id)
                .await?
            {
                debug!(
                    region = %self.region,
                    resource = %R::RESOURCE_TYPE,
                    master_id = %mapping.master_id,
                    subcloud_id,
                    "extra on subcloud"
                );
                self.enqueue_fix(
                    R::RESOURCE_TYPE,
                    OperationType::Delete,
                    &mapping.master_id,
                    None,
                )
                .await?;
                counts.extra += 1;
            }
        }

        Ok(counts)
    }

    /// Adopt a pre-provisioned subcloud resource: equal attributes and no
    /// existing mapping means the master resource already exists there under
    /// another id, so only the mapping is written.
    async fn map_subcloud_resource<R: Auditable>(
        &self,
        master: &R,
        subclouds: &[R],
        matched: &mut [bool],
    ) -> Result<bool, EngineError> {
        for (idx, subcloud) in subclouds.iter().enumerate() {
            if matched[idx] || !master.same_record(subcloud) {
                continue;
            }
            let subcloud_id = subcloud.resource_id();
            if self
                .store
                .mapping_by_subcloud(&self.region, &subcloud_id)
                .await?
                .is_some()
            {
                continue;
            }
            info!(
                region = %self.region,
                resource = %R::RESOURCE_TYPE,
                master_id = %master.resource_id(),
                subcloud_id,
                "mapping master resource to existing subcloud resource"
            );
            self.persist_mapping(R::RESOURCE_TYPE, &master.resource_id(), &subcloud_id)
                .await?;
            matched[idx] = true;
            return Ok(true);
        }
        Ok(false)
    }

    async fn enqueue_fix(
        &self,
        resource_type: ResourceType,
        operation: OperationType,
        master_id: &str,
        resource_info: Option<Value>,
    ) -> Result<(), EngineError> {
        let job = OrchJob::new(resource_type, operation, master_id, resource_info);
        self.store
            .enqueue(&job, std::slice::from_ref(&self.region))
            .await?;
        Ok(())
    }
}
