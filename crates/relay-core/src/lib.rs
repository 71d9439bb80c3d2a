pub mod auth;
pub mod classify;
pub mod engine;
pub mod mapping;
pub mod upstream_client;
pub mod validate;

pub use auth::{AuthContext, AuthError, AuthSnapshot, DEFAULT_GROUP, TokenAuth, TokenEntry};
pub use classify::{FailureClass, channel_health, classify, should_disable};
pub use engine::{EngineState, InboundRequest, RelayEngine};
pub use mapping::resolve_model;
pub use upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
