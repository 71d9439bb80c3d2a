//! Core relay abstractions.
//!
//! This crate does not depend on axum or a concrete HTTP client. Adaptors build
//! `UpstreamHttpRequest`s and write canonical output to a `Downstream`; a higher
//! layer performs IO and owns the client connection.

pub mod adaptor;
pub mod channel;
pub mod downstream;
pub mod errors;
pub mod estimator;
pub mod headers;
pub mod meta;
pub mod mode;
pub mod normalize;
pub mod registry;
pub mod relay_error;
pub mod stream;
pub mod upstream;
pub mod usage;

pub use adaptor::{Adaptor, ResponseOutcome};
pub use channel::{Channel, ChannelHealth, ChannelRegistry, ChannelStatus, MemoryChannelRegistry};
pub use downstream::{ClientGone, Downstream, DownstreamHead, DownstreamReceiver};
pub use errors::{AdaptorError, AdaptorResult};
pub use estimator::TokenEstimator;
pub use headers::{Headers, header_get, header_remove, header_set};
pub use meta::{ChannelConfig, Meta};
pub use mode::{PROXY_PATH_PREFIX, RelayMode};
pub use normalize::{check_upstream_response, is_error_response, normalize_error_body};
pub use registry::{AdaptorFactory, AdaptorRegistry};
pub use relay_error::RelayError;
pub use upstream::{
    ByteStream, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind, parse_retry_after,
};
pub use usage::finalize_usage;
