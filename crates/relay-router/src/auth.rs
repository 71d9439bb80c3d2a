use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use relay_core::AuthError;

use crate::RouterState;

/// UUIDv7 assigned to every inbound request.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Resolves the client key to an `AuthContext` and removes every copy of it
/// from the request before any handler sees it.
pub(crate) async fn relay_auth(
    State(state): State<RouterState>,
    mut req: Request,
    next: Next,
) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();

    // Extract before stripping.
    let key = extract_user_key(req.headers(), req.uri().query());
    strip_downstream_auth_headers(req.headers_mut());
    strip_downstream_auth_query(req.uri_mut());

    let auth = match state.engine.authenticate(key.as_deref()) {
        Ok(auth) => auth,
        Err(err) => {
            warn!(
                event = "downstream_unauthorized",
                trace_id = %trace_id,
                path = %req.uri().path(),
                code = err.code()
            );
            return auth_error_response(&err);
        }
    };

    req.extensions_mut().insert(auth);
    req.extensions_mut().insert(TraceId(trace_id));
    next.run(req).await
}

fn auth_error_response(err: &AuthError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::UNAUTHORIZED);
    let mut resp = Response::new(Body::from(err.to_json_bytes()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp.into_response()
}

fn strip_downstream_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
}

fn strip_downstream_auth_query(uri: &mut Uri) {
    let Some(q) = uri.query() else { return };

    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) else {
        return;
    };
    if !pairs.iter().any(|(k, _)| k == "key") {
        return;
    }

    let filtered: Vec<(String, String)> = pairs.into_iter().filter(|(k, _)| k != "key").collect();
    let Ok(new_q) = serde_urlencoded::to_string(&filtered) else {
        return;
    };

    let path = uri.path();
    let new_uri = if new_q.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_q}")
    };
    if let Ok(new_uri) = new_uri.parse() {
        *uri = new_uri;
    }
}

/// `Authorization: Bearer`, then `x-api-key`, then `?key=`.
fn extract_user_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        let prefix = "Bearer ";
        if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = s[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(value) = headers.get("x-api-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }

    let q = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok()?;
    pairs
        .into_iter()
        .find(|(k, _)| k == "key")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
