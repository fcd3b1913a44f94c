use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dcsync_client::{
    ClientError, CloudClients, CloudEndpoints, TokenProvider,
};
use dcsync_config::{Credentials, EngineConfig, ExclusionLists, MasterEndpoints, SubcloudTemplates};
use dcsync_domain::{
    Availability, EndpointType, LocalUserRecord, ManagementState, PasswordRecord, ProjectRecord,
    RegionName, RoleRecord, Subcloud, UserFields, UserRecord,
};
use dcsync_store::{InMemoryStore, SyncStore};
use tokio::sync::{watch, Notify};
use wiremock::MockServer;

use crate::fault::{Faults, RecordingFaultReporter};
use crate::worker::{SyncWorker, WorkerSignals};

/// Token provider that counts session invalidations.
pub(crate) struct CountingToken {
    token: String,
    invalidations: AtomicUsize,
}

impl CountingToken {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingToken {
    async fn token(&self) -> Result<String, ClientError> {
        Ok(self.token.clone())
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        master: MasterEndpoints {
            dbsync_url: "http://127.0.0.1:1".into(),
            identity_url: "http://127.0.0.1:1".into(),
            platform_url: "http://127.0.0.1:1".into(),
        },
        credentials: Credentials {
            username: "dcsync".into(),
            password: "pw".into(),
            project: "services".into(),
        },
        subcloud_templates: SubcloudTemplates::default(),
        audit_interval: Duration::from_secs(300),
        worker_sleep: Duration::from_secs(60),
        backoff_initial: Duration::from_secs(30),
        backoff_max: Duration::from_secs(900),
        connect_timeout: Duration::from_secs(2),
        key_rotation_interval: Duration::from_secs(3600),
        rotate_command: PathBuf::from("true"),
        hosts_file: None,
        exclusions: ExclusionLists::default(),
    }
}

pub(crate) fn test_subcloud(region: &str) -> Subcloud {
    Subcloud {
        region_name: RegionName::new(region),
        software_version: "24.03".into(),
        management_state: ManagementState::Managed,
        availability: Availability::Online,
        management_subnet: "192.168.101.0/24".into(),
        management_start_ip: "192.168.101.2".into(),
        management_end_ip: "192.168.101.50".into(),
        systemcontroller_gateway_ip: "192.168.204.101".into(),
        created_at: Utc::now(),
    }
}

pub(crate) fn user_record(id: &str, name: &str, hashes: &[&str]) -> UserRecord {
    UserRecord {
        user: UserFields {
            id: id.to_string(),
            domain_id: "default".to_string(),
            enabled: Some(true),
            default_project_id: None,
            extra: serde_json::json!({}),
            created_at: None,
            last_active_at: None,
        },
        local_user: LocalUserRecord {
            name: name.to_string(),
            user_id: id.to_string(),
            domain_id: "default".to_string(),
            failed_auth_count: Some(0),
            failed_auth_at: None,
            passwords: hashes
                .iter()
                .map(|h| PasswordRecord {
                    password_hash: Some((*h).to_string()),
                    self_service: false,
                    created_at_int: 1_600_000_000_000_000,
                    expires_at_int: None,
                })
                .collect(),
        },
    }
}

pub(crate) fn project_record(id: &str, name: &str) -> ProjectRecord {
    ProjectRecord {
        id: id.to_string(),
        domain_id: "default".to_string(),
        name: name.to_string(),
        description: None,
        enabled: true,
        parent_id: None,
        is_domain: false,
        extra: serde_json::json!({}),
    }
}

pub(crate) fn role_record(id: &str, name: &str) -> RoleRecord {
    RoleRecord {
        id: id.to_string(),
        domain_id: dcsync_domain::NULL_DOMAIN_ID.to_string(),
        name: name.to_string(),
        extra: serde_json::json!({}),
    }
}

/// A worker wired to two mock clouds and an in-memory store.
pub(crate) struct Harness {
    pub store: Arc<InMemoryStore>,
    pub worker: SyncWorker,
    pub reporter: Arc<RecordingFaultReporter>,
    pub master: MockServer,
    pub subcloud: MockServer,
    pub master_token: Arc<CountingToken>,
    pub subcloud_token: Arc<CountingToken>,
    pub region: RegionName,
    pub enabled_tx: watch::Sender<bool>,
    pub stop_tx: watch::Sender<bool>,
}

pub(crate) async fn harness(endpoint_type: EndpointType) -> Harness {
    let master = MockServer::start().await;
    let subcloud = MockServer::start().await;
    let subcloud_uri = subcloud.uri();
    build_harness(endpoint_type, master, subcloud, subcloud_uri).await
}

/// Like [`harness`], but the subcloud clients point at a closed port.
pub(crate) async fn offline_harness(endpoint_type: EndpointType) -> Harness {
    let master = MockServer::start().await;
    let subcloud = MockServer::start().await;
    build_harness(endpoint_type, master, subcloud, "http://127.0.0.1:1".into()).await
}

async fn build_harness(
    endpoint_type: EndpointType,
    master: MockServer,
    subcloud: MockServer,
    subcloud_uri: String,
) -> Harness {
    let region = RegionName::new("subcloud-1");
    let store = Arc::new(InMemoryStore::new());
    store
        .upsert_subcloud(&test_subcloud(region.as_str()))
        .await
        .unwrap();

    let reporter = Arc::new(RecordingFaultReporter::default());
    let faults = Arc::new(Faults::new(reporter.clone()));
    let master_token = Arc::new(CountingToken::new("master-token"));
    let subcloud_token = Arc::new(CountingToken::new("subcloud-token"));

    let endpoints = |uri: String| CloudEndpoints {
        dbsync: uri.clone(),
        identity: uri.clone(),
        platform: uri,
    };
    let http = reqwest::Client::new();
    let master_clients =
        CloudClients::new(&endpoints(master.uri()), master_token.clone(), http.clone());
    let subcloud_clients =
        CloudClients::new(&endpoints(subcloud_uri), subcloud_token.clone(), http);

    let (enabled_tx, enabled_rx) = watch::channel(true);
    let (stop_tx, stop_rx) = watch::channel(false);
    let signals = WorkerSignals {
        wake: Arc::new(Notify::new()),
        audit_requested: Arc::new(AtomicBool::new(false)),
        enabled: enabled_rx,
        stop: stop_rx,
    };

    let worker = SyncWorker::new(
        region.clone(),
        endpoint_type,
        store.clone(),
        master_clients,
        subcloud_clients,
        faults,
        &test_config(),
        signals,
    );

    Harness {
        store,
        worker,
        reporter,
        master,
        subcloud,
        master_token,
        subcloud_token,
        region,
        enabled_tx,
        stop_tx,
    }
}
