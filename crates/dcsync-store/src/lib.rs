pub mod error;
pub mod memory;
pub mod redb_store;
pub mod state;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;
pub use state::{
    EndpointStatus, OrchJob, OrchRequest, RequestState, ResourceMapping, WorkItem,
};
pub use store::SyncStore;
