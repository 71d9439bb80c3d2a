//! OpenAI-compatible HTTP surface over `RelayEngine`.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{any, get, post};

use relay_core::RelayEngine;

mod auth;
mod handler;
mod response;

pub use auth::TraceId;
pub use response::REQUEST_ID_HEADER;

use auth::relay_auth;
use handler::{list_models, relay_handler};

/// Audio uploads are forwarded in memory.
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct RouterState {
    pub engine: RelayEngine,
}

pub fn relay_router(engine: RelayEngine) -> Router {
    let state = RouterState { engine };

    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(relay_handler))
        .route("/v1/completions", post(relay_handler))
        .route("/v1/embeddings", post(relay_handler))
        .route("/v1/engines/{model}/embeddings", post(relay_handler))
        .route("/v1/moderations", post(relay_handler))
        .route("/v1/images/generations", post(relay_handler))
        .route("/v1/audio/speech", post(relay_handler))
        .route("/v1/audio/transcriptions", post(relay_handler))
        .route("/v1/audio/translations", post(relay_handler))
        .route("/v1/oneapi/proxy/{channel_id}", any(relay_handler))
        .route("/v1/oneapi/proxy/{channel_id}/{*rest}", any(relay_handler))
        .layer(middleware::from_fn_with_state(state.clone(), relay_auth))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
