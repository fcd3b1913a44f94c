use serde::{Deserialize, Serialize};

/// Raw YAML representation of the engine configuration file.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawConfig {
    pub master: RawMaster,
    pub credentials: RawCredentials,
    #[serde(default)]
    pub subcloud: Option<RawSubcloudTemplates>,
    #[serde(default)]
    pub engine: Option<RawEngine>,
    #[serde(default)]
    pub fernet: Option<RawFernet>,
    /// dnsmasq-style additional hosts file regenerated on subcloud
    /// add/delete. Absent disables the side effect.
    #[serde(default)]
    pub hosts_file: Option<String>,
    #[serde(default)]
    pub exclusions: Option<RawExclusions>,
}

/// Service URLs of the system controller cloud. The identity URL doubles as
/// the authentication endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawMaster {
    pub dbsync_url: String,
    pub identity_url: String,
    pub platform_url: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub project: Option<String>,
}

/// Subcloud service URL templates with a `{host}` placeholder.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawSubcloudTemplates {
    #[serde(default)]
    pub dbsync_url: Option<String>,
    #[serde(default)]
    pub identity_url: Option<String>,
    #[serde(default)]
    pub platform_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawEngine {
    #[serde(default)]
    pub audit_interval_secs: Option<u64>,
    #[serde(default)]
    pub worker_sleep_secs: Option<u64>,
    #[serde(default)]
    pub backoff_initial_secs: Option<u64>,
    #[serde(default)]
    pub backoff_max_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawFernet {
    #[serde(default)]
    pub key_rotation_hours: Option<u64>,
    #[serde(default)]
    pub rotate_command: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawExclusions {
    #[serde(default)]
    pub users: Option<Vec<String>>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub projects: Option<Vec<String>>,
}
