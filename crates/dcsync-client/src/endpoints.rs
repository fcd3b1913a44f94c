use serde::{Deserialize, Serialize};

/// Resolved service URLs for one cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEndpoints {
    pub dbsync: String,
    pub identity: String,
    pub platform: String,
}

/// URL templates for subcloud services, with a `{host}` placeholder filled
/// from the subcloud's management address. Overridden in tests to point at a
/// mock server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTemplates {
    pub dbsync: String,
    pub identity: String,
    pub platform: String,
}

impl Default for EndpointTemplates {
    fn default() -> Self {
        Self {
            dbsync: "http://{host}:8219/v1.0".into(),
            identity: "http://{host}:5000/v3".into(),
            platform: "http://{host}:6385/v1".into(),
        }
    }
}

impl EndpointTemplates {
    pub fn resolve(&self, host: &str) -> CloudEndpoints {
        CloudEndpoints {
            dbsync: self.dbsync.replace("{host}", host),
            identity: self.identity.replace("{host}", host),
            platform: self.platform.replace("{host}", host),
        }
    }
}
