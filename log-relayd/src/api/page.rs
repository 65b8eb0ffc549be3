use shared::protocol::NEW_LOG_EVENT;
use shared::types::CodeEntry;

const TERMINAL_HTML: &str = include_str!("terminal.html");

/// Render the live terminal page for a resolved link. Only the code and the
/// service id reach the page; the credential stays server-side.
pub fn terminal_page(entry: &CodeEntry) -> String {
    TERMINAL_HTML
        .replace("SERVICE_ID_PLACEHOLDER", &escape_html(&entry.service_id))
        .replace("CODE_PLACEHOLDER", &escape_html(&entry.code))
        .replace("NEW_LOG_EVENT_PLACEHOLDER", NEW_LOG_EVENT)
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
