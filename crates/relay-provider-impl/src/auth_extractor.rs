use relay_provider_core::{Headers, header_get, header_set};

pub fn set_bearer(headers: &mut Headers, api_key: &str) {
    header_set(headers, "Authorization", format!("Bearer {api_key}"));
}

pub fn set_content_type_json(headers: &mut Headers) {
    header_set(headers, "Content-Type", "application/json");
}

/// JSON for plain calls, event stream when the reply is streamed.
pub fn set_accept(headers: &mut Headers, is_stream: bool) {
    let accept = if is_stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    header_set(headers, "Accept", accept);
}

pub fn set_header(headers: &mut Headers, name: &str, value: &str) {
    header_set(headers, name, value);
}

/// Carry the client's `Content-Type` and `Accept` when it sent them; multipart
/// audio uploads depend on the original boundary.
pub fn copy_content_negotiation(inbound: &Headers, outbound: &mut Headers, is_stream: bool) {
    match header_get(inbound, "content-type") {
        Some(content_type) => header_set(outbound, "Content-Type", content_type),
        None => set_content_type_json(outbound),
    }
    match header_get(inbound, "accept") {
        Some(accept) if !is_stream => header_set(outbound, "Accept", accept),
        _ => set_accept(outbound, is_stream),
    }
}
