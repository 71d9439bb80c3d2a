use std::collections::HashMap;

/// Model name sent upstream for `origin`. A missing or empty entry keeps the
/// origin name.
pub fn resolve_model(mapping: &HashMap<String, String>, origin: &str) -> String {
    mapping
        .get(origin)
        .map(|mapped| mapped.trim())
        .filter(|mapped| !mapped.is_empty())
        .unwrap_or(origin)
        .to_string()
}
