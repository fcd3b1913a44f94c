pub mod dbsync;
pub mod endpoints;
pub mod error;
pub mod factory;
mod http;
pub mod identity;
pub mod platform;
pub mod session;

pub use dbsync::DbsyncClient;
pub use endpoints::{CloudEndpoints, EndpointTemplates};
pub use error::ClientError;
pub use factory::{AdminCredentials, ClientFactory, CloudClients};
pub use identity::{ApiProject, ApiRole, ApiUser, IdentityClient, UserPatch};
pub use platform::{FernetKey, PlatformClient};
pub use session::{PasswordSession, StaticToken, TokenProvider};
