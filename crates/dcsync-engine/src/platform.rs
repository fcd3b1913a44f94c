use dcsync_client::ClientError;
use dcsync_store::WorkItem;
use tracing::info;

use crate::error::EngineError;
use crate::fernet::keys_from_resource_info;
use crate::worker::SyncWorker;

// Handler catalog for the platform endpoint: installing and replacing the
// fernet key ring pushed out by the key manager.

impl SyncWorker {
    /// Install the master key ring on a freshly added subcloud. If the
    /// subcloud already has a ring, fall through to replacing it.
    pub(crate) async fn create_fernet_repo(&self, item: &WorkItem) -> Result<(), EngineError> {
        let keys = keys_from_resource_info(&item.job)?;
        match self.subcloud.platform.create_fernet_repo(&keys).await {
            Ok(()) => {}
            Err(ClientError::Conflict) => {
                self.subcloud.platform.update_fernet_repo(&keys).await?;
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            region = %self.region,
            keys = keys.len(),
            "installed fernet key ring"
        );
        Ok(())
    }

    /// Replace the subcloud's key ring after a master rotation. A subcloud
    /// that never received a ring gets one installed instead.
    pub(crate) async fn update_fernet_repo(&self, item: &WorkItem) -> Result<(), EngineError> {
        let keys = keys_from_resource_info(&item.job)?;
        match self.subcloud.platform.update_fernet_repo(&keys).await {
            Ok(()) => {}
            Err(ClientError::NotFound) => {
                self.subcloud.platform.create_fernet_repo(&keys).await?;
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            region = %self.region,
            keys = keys.len(),
            "replaced fernet key ring"
        );
        Ok(())
    }
}
