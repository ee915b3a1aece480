/// Redaction utilities for debug logging
///
/// Masks credentials and bounds body sizes so that verbose HTTP logging
/// can stay enabled without leaking passwords or flooding the log.

const MASK: &str = "***";

/// Render form fields as an urlencoded preview with secrets masked.
/// Example: [("login", "admin"), ("password", "hunter2")] -> "login=admin&password=***"
pub fn form_preview(fields: &[(&str, &str)], limit: usize) -> String {
    let encoded = fields
        .iter()
        .map(|(key, value)| {
            let value = if is_secret_key(key) {
                MASK.to_string()
            } else {
                urlencoding::encode(value).into_owned()
            };
            format!("{}={}", urlencoding::encode(key), value)
        })
        .collect::<Vec<_>>()
        .join("&");
    truncate(&encoded, limit)
}

/// Trim a response or request body and cap it at `limit` bytes.
pub fn body_preview(body: &str, limit: usize) -> String {
    truncate(body.trim(), limit)
}

/// Mask a bearer/bot token, keeping only the last 4 characters visible.
/// Example: "abcdefgh1234" -> "********1234"
pub fn token(token: &str) -> String {
    let count = token.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let visible: String = token.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), visible)
}

fn is_secret_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("password") || key.eq_ignore_ascii_case("token")
}

/// Cut at a char boundary at or below `limit` and mark the cut.
fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}
