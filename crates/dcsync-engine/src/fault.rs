use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dcsync_domain::{EndpointType, RegionName};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Alarm raised while an endpoint stays out-of-sync.
pub const FAULT_SUBCLOUD_RESOURCE_OUT_OF_SYNC: &str = "DC_SUBCLOUD_RESOURCE_OUT_OF_SYNC";

/// Output contract towards the external fault manager.
#[async_trait]
pub trait FaultReporter: Send + Sync + 'static {
    async fn raise_fault(&self, fault_id: &str, entity_id: &str);
    async fn clear_fault(&self, fault_id: &str, entity_id: &str);
}

/// Default reporter: faults only show up in the logs.
pub struct LogFaultReporter;

#[async_trait]
impl FaultReporter for LogFaultReporter {
    async fn raise_fault(&self, fault_id: &str, entity_id: &str) {
        warn!(fault_id, entity_id, "fault raised");
    }

    async fn clear_fault(&self, fault_id: &str, entity_id: &str) {
        info!(fault_id, entity_id, "fault cleared");
    }
}

/// Test reporter that records every raise/clear.
#[derive(Default)]
pub struct RecordingFaultReporter {
    pub raised: std::sync::Mutex<Vec<String>>,
    pub cleared: std::sync::Mutex<Vec<String>>,
}

impl RecordingFaultReporter {
    pub fn raised_count(&self, entity_id: &str) -> usize {
        self.raised
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == entity_id)
            .count()
    }
}

#[async_trait]
impl FaultReporter for RecordingFaultReporter {
    async fn raise_fault(&self, _fault_id: &str, entity_id: &str) {
        self.raised.lock().unwrap().push(entity_id.to_string());
    }

    async fn clear_fault(&self, _fault_id: &str, entity_id: &str) {
        self.cleared.lock().unwrap().push(entity_id.to_string());
    }
}

/// Edge-triggered fault surface. A fault is raised exactly once when an
/// endpoint goes out-of-sync and cleared once when it recovers; repeated
/// reports of the same condition are absorbed here.
pub struct Faults {
    reporter: Arc<dyn FaultReporter>,
    present: Mutex<HashSet<String>>,
}

impl Faults {
    pub fn new(reporter: Arc<dyn FaultReporter>) -> Self {
        Self {
            reporter,
            present: Mutex::new(HashSet::new()),
        }
    }

    pub fn entity_id(region: &RegionName, endpoint_type: EndpointType) -> String {
        format!("subcloud={}.resource={}", region, endpoint_type)
    }

    pub async fn mark_out_of_sync(&self, region: &RegionName, endpoint_type: EndpointType) {
        let entity_id = Self::entity_id(region, endpoint_type);
        let mut present = self.present.lock().await;
        if present.insert(entity_id.clone()) {
            self.reporter
                .raise_fault(FAULT_SUBCLOUD_RESOURCE_OUT_OF_SYNC, &entity_id)
                .await;
        }
    }

    pub async fn mark_recovered(&self, region: &RegionName, endpoint_type: EndpointType) {
        let entity_id = Self::entity_id(region, endpoint_type);
        let mut present = self.present.lock().await;
        if present.remove(&entity_id) {
            self.reporter
                .clear_fault(FAULT_SUBCLOUD_RESOURCE_OUT_OF_SYNC, &entity_id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fault_is_edge_triggered() {
        let reporter = Arc::new(RecordingFaultReporter::default());
        let faults = Faults::new(reporter.clone());
        let region = RegionName::new("subcloud-1");

        faults.mark_out_of_sync(&region, EndpointType::Identity).await;
        faults.mark_out_of_sync(&region, EndpointType::Identity).await;
        faults.mark_out_of_sync(&region, EndpointType::Identity).await;

        let entity_id = Faults::entity_id(&region, EndpointType::Identity);
        assert_eq!(reporter.raised_count(&entity_id), 1);

        faults.mark_recovered(&region, EndpointType::Identity).await;
        faults.mark_recovered(&region, EndpointType::Identity).await;
        assert_eq!(reporter.cleared.lock().unwrap().len(), 1);

        // A fresh out-of-sync edge raises again.
        faults.mark_out_of_sync(&region, EndpointType::Identity).await;
        assert_eq!(reporter.raised_count(&entity_id), 2);
    }

    #[tokio::test]
    async fn entity_id_format() {
        let region = RegionName::new("subcloud-1");
        assert_eq!(
            Faults::entity_id(&region, EndpointType::Identity),
            "subcloud=subcloud-1.resource=identity"
        );
    }
}
