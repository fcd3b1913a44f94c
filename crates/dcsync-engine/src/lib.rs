pub mod audit;
pub mod backoff;
pub mod error;
pub mod fault;
pub mod fernet;
pub mod hosts;
mod identity;
pub mod manager;
mod platform;
pub mod subcloud;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use backoff::Backoff;
pub use error::EngineError;
pub use fault::{
    FaultReporter, Faults, LogFaultReporter, RecordingFaultReporter,
    FAULT_SUBCLOUD_RESOURCE_OUT_OF_SYNC,
};
pub use fernet::FernetKeyManager;
pub use manager::{build_client_factory, run_audit_scheduler, GenericSyncManager};
pub use subcloud::{SubcloudEngine, SubcloudState};
pub use worker::{SyncWorker, WorkerSignals};
