//! Provider selection for inbound text.

use super::providers::ProviderRegistry;

/// Provider chosen for one exchange and the input it should receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    pub provider_id: String,
    pub input: &'a str,
}

/// Splits a leading `/<id><whitespace>` directive off `text`.
///
/// Returns `None` when `text` has no such prefix, including a bare `/<id>`
/// with nothing after it.
pub fn split_directive(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('/')?;
    let end = rest.find(char::is_whitespace)?;
    let (id, remainder) = rest.split_at(end);
    if id.is_empty() {
        return None;
    }
    Some((id, remainder.trim_start()))
}

/// Picks the provider for a text message. Only registered ids count as
/// directives; any other slash prefix is ordinary text.
pub fn route_text<'a>(text: &'a str, registry: &ProviderRegistry) -> Route<'a> {
    match split_directive(text) {
        Some((id, input)) if registry.contains(id) => Route {
            provider_id: id.to_lowercase(),
            input,
        },
        _ => Route {
            provider_id: registry.default_text().to_string(),
            input: text,
        },
    }
}
