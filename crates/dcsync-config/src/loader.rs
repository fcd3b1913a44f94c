use std::path::{Path, PathBuf};
use std::time::Duration;

use dcsync_domain::RegionName;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawConfig;

pub const DEFAULT_ROTATE_COMMAND: &str = "/usr/bin/keystone-fernet-keys-rotate-active";

const DEFAULT_AUDIT_INTERVAL_SECS: u64 = 300;
const DEFAULT_WORKER_SLEEP_SECS: u64 = 60;
const DEFAULT_BACKOFF_INITIAL_SECS: u64 = 30;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 900;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KEY_ROTATION_HOURS: u64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEndpoints {
    pub dbsync_url: String,
    pub identity_url: String,
    pub platform_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcloudTemplates {
    pub dbsync_url: String,
    pub identity_url: String,
    pub platform_url: String,
}

impl Default for SubcloudTemplates {
    fn default() -> Self {
        Self {
            dbsync_url: "http://{host}:8219/v1.0".into(),
            identity_url: "http://{host}:5000/v3".into(),
            platform_url: "http://{host}:6385/v1".into(),
        }
    }
}

/// Per resource type, names filtered out of both sides before the audit
/// diffs them. These cover bootstrap accounts every cloud provisions for
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionLists {
    pub users: Vec<String>,
    pub roles: Vec<String>,
    pub projects: Vec<String>,
}

impl Default for ExclusionLists {
    fn default() -> Self {
        Self {
            users: ["dbsync", "dcorch", "dcmanager", "heat_admin", "smapi", "fm"]
                .into_iter()
                .map(String::from)
                .collect(),
            roles: ["heat_stack_owner", "heat_stack_user", "ResellerAdmin"]
                .into_iter()
                .map(String::from)
                .collect(),
            projects: Vec::new(),
        }
    }
}

impl ExclusionLists {
    /// User exclusions for one subcloud. Each region provisions a volume
    /// service account named after itself, so that name is appended here.
    pub fn users_for_region(&self, region: &RegionName) -> Vec<String> {
        let mut users = self.users.clone();
        users.push(format!("cinder{}", region));
        users
    }
}

/// Validated engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub master: MasterEndpoints,
    pub credentials: Credentials,
    pub subcloud_templates: SubcloudTemplates,
    pub audit_interval: Duration,
    pub worker_sleep: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    pub key_rotation_interval: Duration,
    pub rotate_command: PathBuf,
    pub hosts_file: Option<PathBuf>,
    pub exclusions: ExclusionLists,
}

/// Load and validate the engine configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!("loaded raw config from {}", path.display());
    convert(raw)
}

fn convert(raw: RawConfig) -> Result<EngineConfig, ConfigError> {
    for (field, value) in [
        ("master.dbsync_url", &raw.master.dbsync_url),
        ("master.identity_url", &raw.master.identity_url),
        ("master.platform_url", &raw.master.platform_url),
    ] {
        if !value.starts_with("http://") && !value.starts_with("https://") {
            return Err(ConfigError::Invalid {
                message: format!("{} must be an http(s) URL, got '{}'", field, value),
            });
        }
    }
    if raw.credentials.username.is_empty() || raw.credentials.password.is_empty() {
        return Err(ConfigError::Invalid {
            message: "credentials.username and credentials.password are required".into(),
        });
    }

    let subcloud = convert_templates(raw.subcloud)?;

    let engine = raw.engine.unwrap_or_default();
    let audit_interval_secs = engine
        .audit_interval_secs
        .unwrap_or(DEFAULT_AUDIT_INTERVAL_SECS);
    let backoff_initial_secs = engine
        .backoff_initial_secs
        .unwrap_or(DEFAULT_BACKOFF_INITIAL_SECS);
    let backoff_max_secs = engine.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS);
    if audit_interval_secs == 0 {
        return Err(ConfigError::Invalid {
            message: "engine.audit_interval_secs must be positive".into(),
        });
    }
    if backoff_initial_secs == 0 || backoff_initial_secs > backoff_max_secs {
        return Err(ConfigError::Invalid {
            message: format!(
                "backoff bounds invalid: initial {}s, max {}s",
                backoff_initial_secs, backoff_max_secs
            ),
        });
    }

    let fernet = raw.fernet.unwrap_or_default();
    let key_rotation_hours = fernet
        .key_rotation_hours
        .unwrap_or(DEFAULT_KEY_ROTATION_HOURS);
    if key_rotation_hours == 0 {
        return Err(ConfigError::Invalid {
            message: "fernet.key_rotation_hours must be positive".into(),
        });
    }

    let exclusions = match raw.exclusions {
        None => ExclusionLists::default(),
        Some(raw_exclusions) => {
            let defaults = ExclusionLists::default();
            ExclusionLists {
                users: raw_exclusions.users.unwrap_or(defaults.users),
                roles: raw_exclusions.roles.unwrap_or(defaults.roles),
                projects: raw_exclusions.projects.unwrap_or(defaults.projects),
            }
        }
    };

    Ok(EngineConfig {
        master: MasterEndpoints {
            dbsync_url: raw.master.dbsync_url,
            identity_url: raw.master.identity_url,
            platform_url: raw.master.platform_url,
        },
        credentials: Credentials {
            username: raw.credentials.username,
            password: raw.credentials.password,
            project: raw.credentials.project.unwrap_or_else(|| "admin".into()),
        },
        subcloud_templates: subcloud,
        audit_interval: Duration::from_secs(audit_interval_secs),
        worker_sleep: Duration::from_secs(
            engine.worker_sleep_secs.unwrap_or(DEFAULT_WORKER_SLEEP_SECS),
        ),
        backoff_initial: Duration::from_secs(backoff_initial_secs),
        backoff_max: Duration::from_secs(backoff_max_secs),
        connect_timeout: Duration::from_secs(
            engine
                .connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        ),
        key_rotation_interval: Duration::from_secs(key_rotation_hours * 3600),
        rotate_command: PathBuf::from(
            fernet
                .rotate_command
                .unwrap_or_else(|| DEFAULT_ROTATE_COMMAND.into()),
        ),
        hosts_file: raw.hosts_file.map(PathBuf::from),
        exclusions,
    })
}

fn convert_templates(
    raw: Option<crate::raw::RawSubcloudTemplates>,
) -> Result<SubcloudTemplates, ConfigError> {
    let defaults = SubcloudTemplates::default();
    let raw = match raw {
        None => return Ok(defaults),
        Some(raw) => raw,
    };
    let templates = SubcloudTemplates {
        dbsync_url: raw.dbsync_url.unwrap_or(defaults.dbsync_url),
        identity_url: raw.identity_url.unwrap_or(defaults.identity_url),
        platform_url: raw.platform_url.unwrap_or(defaults.platform_url),
    };
    for (field, value) in [
        ("subcloud.dbsync_url", &templates.dbsync_url),
        ("subcloud.identity_url", &templates.identity_url),
        ("subcloud.platform_url", &templates.platform_url),
    ] {
        if !value.contains("{host}") {
            return Err(ConfigError::Invalid {
                message: format!("{} must contain a {{host}} placeholder", field),
            });
        }
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_exclusions_cover_the_service_accounts() {
        let exclusions = ExclusionLists::default();
        assert!(exclusions.users.contains(&"dbsync".to_string()));
        assert!(exclusions.roles.contains(&"ResellerAdmin".to_string()));
        assert!(exclusions.projects.is_empty());
    }

    #[test]
    fn user_exclusions_gain_the_regional_volume_account() {
        let exclusions = ExclusionLists::default();
        let users = exclusions.users_for_region(&RegionName::new("subcloud-1"));
        assert!(users.contains(&"cindersubcloud-1".to_string()));
    }
}
