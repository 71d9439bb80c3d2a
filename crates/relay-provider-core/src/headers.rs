pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(&name))
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Removes every occurrence of `name`, returning the first value.
pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let mut removed = None;
    headers.retain(|(k, v)| {
        if k.eq_ignore_ascii_case(name) {
            if removed.is_none() {
                removed = Some(v.clone());
            }
            false
        } else {
            true
        }
    });
    removed
}

pub fn is_json_content_type(headers: &Headers) -> bool {
    header_get(headers, "content-type")
        .map(|value| value.trim().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

pub fn is_event_stream(headers: &Headers) -> bool {
    header_get(headers, "content-type")
        .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert!(is_json_content_type(&headers));
    }

    #[test]
    fn remove_drops_duplicates() {
        let mut headers: Headers = vec![
            ("Authorization".to_string(), "a".to_string()),
            ("authorization".to_string(), "b".to_string()),
        ];
        assert_eq!(header_remove(&mut headers, "AUTHORIZATION").as_deref(), Some("a"));
        assert!(headers.is_empty());
    }
}
