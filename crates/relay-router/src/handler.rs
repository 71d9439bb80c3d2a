use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Body;
use axum::extract::{Extension, FromRequest, Multipart, State};
use axum::http::{HeaderMap, Method, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::info;

use relay_core::{AuthContext, InboundRequest};
use relay_provider_core::{Headers, HttpMethod, RelayError, RelayMode};

use crate::RouterState;
use crate::auth::TraceId;
use crate::response::{downstream_response, error_response};

/// Every relay path. The mode is chosen from the path inside the engine.
pub(crate) async fn relay_handler(
    State(state): State<RouterState>,
    Extension(auth): Extension<AuthContext>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started_at = Instant::now();
    let Some(method) = HttpMethod::parse(method.as_str()) else {
        let err = RelayError::invalid_request(
            "method_not_allowed",
            format!("{method} is not supported"),
        );
        return error_response(&err, &trace_id);
    };

    let path = uri.path().to_string();
    let form_model = if RelayMode::from_path(&path).is_audio() {
        form_model(&headers, &body).await
    } else {
        None
    };
    let request = InboundRequest {
        trace_id: trace_id.clone(),
        auth,
        method,
        path: path.clone(),
        query: uri.query().map(str::to_string),
        headers: headers_to_vec(&headers),
        body,
        form_model,
    };

    let global = state.engine.global();
    let heartbeat = Duration::from_secs(global.sse_heartbeat_secs);
    let receiver = state.engine.relay(request);
    let response = downstream_response(receiver, &trace_id, heartbeat).await;
    info!(
        event = "downstream_responded",
        trace_id = %trace_id,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started_at.elapsed().as_millis()
    );
    response
}

pub(crate) async fn list_models(
    State(state): State<RouterState>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    Json(state.engine.list_models(&auth.group).await).into_response()
}

/// The `model` field of a multipart upload; the body itself is forwarded
/// untouched.
async fn form_model(headers: &HeaderMap, body: &Bytes) -> Option<String> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return None;
    }
    let req = axum::http::Request::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body.clone()))
        .ok()?;
    let mut multipart = Multipart::from_request(req, &()).await.ok()?;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("model") {
            return field
                .text()
                .await
                .ok()
                .map(|model| model.trim().to_string())
                .filter(|model| !model.is_empty());
        }
    }
    None
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}
