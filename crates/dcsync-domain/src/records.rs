use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// Identity records are transported as backend database rows, not public API
// DTOs, so that primary keys survive replication. Role assignments reference
// users, projects and roles by id; replicating through the public API would
// mint fresh ids on the subcloud and leave every assignment dangling.

// ── Users ─────────────────────────────────────────────────────────────────────

/// One row of the password table, nested under its local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordRecord {
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub self_service: bool,
    /// Microseconds since epoch; 0 means unset.
    #[serde(default)]
    pub created_at_int: i64,
    #[serde(default)]
    pub expires_at_int: Option<i64>,
}

/// The local_user row plus its owned password rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalUserRecord {
    pub name: String,
    pub user_id: String,
    pub domain_id: String,
    #[serde(default)]
    pub failed_auth_count: Option<i32>,
    #[serde(default)]
    pub failed_auth_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub passwords: Vec<PasswordRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFields {
    pub id: String,
    pub domain_id: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub default_project_id: Option<String>,
    #[serde(default)]
    pub extra: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active_at: Option<NaiveDate>,
}

/// The full replicated shape of a user: the user row and its local_user row
/// (which owns the password rows). This is exactly what goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user: UserFields,
    pub local_user: LocalUserRecord,
}

impl UserRecord {
    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn name(&self) -> &str {
        &self.local_user.name
    }

    /// Cheap identity check: same (name, domain) or same primary key.
    /// A positive result with a negative [`same_record`](Self::same_record)
    /// marks the resource as mismatched (update needed), not missing.
    pub fn same_identity(&self, other: &UserRecord) -> bool {
        (self.local_user.name == other.local_user.name
            && self.user.domain_id == other.user.domain_id)
            || self.user.id == other.user.id
    }

    /// Deep attribute comparison, including the full password history.
    /// Primary ids are deliberately left out: a pre-provisioned subcloud
    /// user whose attributes all match is the same resource under a
    /// different id, and gets mapped instead of rewritten.
    pub fn same_record(&self, other: &UserRecord) -> bool {
        let same_user = self.user.domain_id == other.user.domain_id
            && self.user.default_project_id == other.user.default_project_id
            && self.user.enabled == other.user.enabled
            && self.user.created_at == other.user.created_at
            && self.user.last_active_at == other.user.last_active_at
            && self.user.extra == other.user.extra;
        if !same_user {
            return false;
        }

        let same_local = self.local_user.domain_id == other.local_user.domain_id
            && self.local_user.name == other.local_user.name
            && self.local_user.failed_auth_count == other.local_user.failed_auth_count
            && self.local_user.failed_auth_at == other.local_user.failed_auth_at;
        if !same_local {
            return false;
        }

        same_password_set(&self.local_user.passwords, &other.local_user.passwords)
    }
}

/// Password histories are equal when they have the same length and every
/// hash on one side appears on the other. Order is not significant.
fn same_password_set(a: &[PasswordRecord], b: &[PasswordRecord]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|pw| {
        b.iter()
            .any(|other| other.password_hash == pw.password_hash)
    })
}

// ── Projects ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub domain_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_domain: bool,
    #[serde(default)]
    pub extra: Value,
}

impl ProjectRecord {
    pub fn same_identity(&self, other: &ProjectRecord) -> bool {
        (self.name == other.name && self.domain_id == other.domain_id) || self.id == other.id
    }

    /// Attribute comparison; the id is left out so pre-provisioned projects
    /// can be adopted.
    pub fn same_record(&self, other: &ProjectRecord) -> bool {
        self.domain_id == other.domain_id
            && self.name == other.name
            && self.extra == other.extra
            && self.description == other.description
            && self.enabled == other.enabled
            && self.parent_id == other.parent_id
            && self.is_domain == other.is_domain
    }
}

// ── Roles ─────────────────────────────────────────────────────────────────────

fn null_domain() -> String {
    crate::types::NULL_DOMAIN_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleRecord {
    pub id: String,
    /// `NULL_DOMAIN_ID` when the role belongs to no domain.
    #[serde(default = "null_domain")]
    pub domain_id: String,
    pub name: String,
    #[serde(default)]
    pub extra: Value,
}

impl RoleRecord {
    pub fn same_identity(&self, other: &RoleRecord) -> bool {
        (self.name == other.name && self.domain_id == other.domain_id) || self.id == other.id
    }

    /// Attribute comparison; the id is left out so pre-provisioned roles can
    /// be adopted.
    pub fn same_record(&self, other: &RoleRecord) -> bool {
        self.domain_id == other.domain_id
            && self.name == other.name
            && self.extra == other.extra
    }
}

// ── Role assignments ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentType {
    UserProject,
    GroupProject,
    UserDomain,
    GroupDomain,
}

/// Backend assignment row. The whole tuple is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    #[serde(rename = "type")]
    pub kind: AssignmentType,
    pub actor_id: String,
    pub target_id: String,
    pub role_id: String,
    #[serde(default)]
    pub inherited: bool,
}

impl AssignmentRecord {
    /// Only project-scoped user assignments are replicated; group and
    /// domain-scoped assignments are skipped by the audit.
    pub fn is_auditable(&self) -> bool {
        self.kind == AssignmentType::UserProject && !self.inherited
    }
}

/// A (name, domain) reference to a user, project or role, used to compare
/// assignments across clouds where the underlying ids may differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: String,
    pub name: String,
    pub domain_id: String,
}

/// Audit view of an assignment, enriched with the names of its referents.
/// An assignment only carries ids; names are resolved against the user,
/// project and role lists fetched earlier in the same audit pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentView {
    pub project: NamedRef,
    pub user: NamedRef,
    pub role: NamedRef,
}

impl AssignmentView {
    /// Synthetic id of this assignment on its own cloud:
    /// `<project_id>_<user_id>_<role_id>`.
    pub fn synthetic_id(&self) -> String {
        compose_assignment_id(&self.project.id, &self.user.id, &self.role.id)
    }

    /// Two assignments are the same resource when user, project and role all
    /// match by (name, domain). There is no separate attribute comparison:
    /// the tuple is the whole record.
    pub fn same_resource(&self, other: &AssignmentView) -> bool {
        self.user.name == other.user.name
            && self.user.domain_id == other.user.domain_id
            && self.role.name == other.role.name
            && self.role.domain_id == other.role.domain_id
            && self.project.name == other.project.name
            && self.project.domain_id == other.project.domain_id
    }
}

/// Build the synthetic assignment id `<target>_<actor>_<role>`.
pub fn compose_assignment_id(target_id: &str, actor_id: &str, role_id: &str) -> String {
    format!("{}_{}_{}", target_id, actor_id, role_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentIdParts {
    pub target_id: String,
    pub actor_id: String,
    pub role_id: String,
}

/// Split a synthetic assignment id back into its parts.
///
/// The component ids are UUID-like and never contain `_`, so a plain split
/// is unambiguous.
pub fn split_assignment_id(id: &str) -> Result<AssignmentIdParts, DomainError> {
    let tags: Vec<&str> = id.split('_').collect();
    if tags.len() < 3 {
        return Err(DomainError::MalformedAssignmentId(id.to_string()));
    }
    Ok(AssignmentIdParts {
        target_id: tags[0].to_string(),
        actor_id: tags[1].to_string(),
        role_id: tags[2].to_string(),
    })
}

// ── Token revocation events ───────────────────────────────────────────────────

/// Backend revocation_event row. The integer `id` is local to each cloud and
/// is never used as a replication key; events created by token revocation
/// carry an `audit_id`, events created by password changes carry a `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEventRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub trust_id: Option<String>,
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub access_token_id: Option<String>,
    pub issued_before: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: DateTime<Utc>,
    #[serde(default)]
    pub audit_id: Option<String>,
    #[serde(default)]
    pub audit_chain_id: Option<String>,
}

impl RevocationEventRecord {
    /// All columns except the local `id` must match. Revocation events have
    /// no mutable attributes, so identity and record comparison coincide.
    pub fn same_record(&self, other: &RevocationEventRecord) -> bool {
        self.domain_id == other.domain_id
            && self.project_id == other.project_id
            && self.user_id == other.user_id
            && self.role_id == other.role_id
            && self.trust_id == other.trust_id
            && self.consumer_id == other.consumer_id
            && self.access_token_id == other.access_token_id
            && self.issued_before == other.issued_before
            && self.expires_at == other.expires_at
            && self.revoked_at == other.revoked_at
            && self.audit_id == other.audit_id
            && self.audit_chain_id == other.audit_chain_id
    }
}

/// Synthetic id for a password-change revocation event:
/// url-safe base64 of `<user_id>_<issued_before>`.
pub fn user_revoke_event_id(user_id: &str, issued_before: &DateTime<Utc>) -> String {
    let raw = format!("{}_{}", user_id, issued_before.to_rfc3339());
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}
