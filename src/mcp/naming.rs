//! Derivation of the namespaced tool names the hub publishes.

/// Used when a name sanitizes down to nothing.
pub const PLACEHOLDER_NAME: &str = "unnamed";

pub const PREFIX_SEPARATOR: char = '-';

/// Maps any string onto `[A-Za-z0-9_.-]`, never starting with `.` or `-`,
/// never containing `__`, never ending with `_`, and never empty.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            ch
        } else {
            '_'
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out
        .trim_start_matches(['.', '-'])
        .trim_end_matches('_');

    if trimmed.is_empty() {
        PLACEHOLDER_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `sanitize(client) + "-" + sanitize(tool)`.
pub fn prefixed_tool_name(client_name: &str, tool_name: &str) -> String {
    format!(
        "{}{}{}",
        sanitize(client_name),
        PREFIX_SEPARATOR,
        sanitize(tool_name)
    )
}
