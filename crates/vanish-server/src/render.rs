//! HTML for the retrieval front door.
//!
//! The not-available page is a constant so every failure cause renders the
//! exact same bytes.

use std::time::{Duration, UNIX_EPOCH};

use crate::store::{Revealed, LATEST_DEADLINE};

const STYLE: &str = "body{font-family:ui-monospace,Menlo,monospace;background:#141414;color:#e6e6e6;padding:24px}\
.box{max-width:760px;margin:0 auto}\
.warn{background:#8a1c1c;color:#fff;padding:12px 16px;border-radius:6px;margin:12px 0}\
.secret{background:#262626;padding:16px;border-radius:6px;white-space:pre-wrap;word-break:break-all}\
.meta{color:#9a9a9a;font-size:0.9em}";

pub const INDEX_PAGE: &str = concat!(
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\">",
    "<meta name=\"robots\" content=\"noindex\">",
    "<title>vanish</title></head><body><div class=\"box\">",
    "<h1>vanish</h1>",
    "<p>One-time links for short-lived database credentials.</p>",
    "<ul>",
    "<li>Each link can be opened once, then it is destroyed.</li>",
    "<li>Unopened links expire on their own.</li>",
    "<li>Every view is recorded in the audit log.</li>",
    "</ul>",
    "<p>To view credentials you need a link issued by an access grant.</p>",
    "</div></body></html>"
);

pub const NOT_AVAILABLE_PAGE: &str = concat!(
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\">",
    "<meta name=\"robots\" content=\"noindex\">",
    "<title>Not available</title></head><body><div class=\"box\">",
    "<h1>This link is no longer available</h1>",
    "<p>It has already been viewed, has expired, or never existed.</p>",
    "<p>Request fresh credentials if you still need access.</p>",
    "</div></body></html>"
);

pub const TEMPORARILY_UNAVAILABLE_PAGE: &str = concat!(
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\">",
    "<meta name=\"robots\" content=\"noindex\">",
    "<title>Try again</title></head><body><div class=\"box\">",
    "<h1>Temporarily unavailable</h1>",
    "<p>The service could not complete this request. Try the link again shortly.</p>",
    "</div></body></html>"
);

/// Page showing a revealed secret.
pub fn secret_page(revealed: &Revealed) -> String {
    let content = String::from_utf8_lossy(revealed.payload.as_bytes());
    let burned = if revealed.burned {
        "<p class=\"warn\">This link has been destroyed. Reloading the page will not show the credentials again.</p>"
    } else {
        ""
    };
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<meta name=\"robots\" content=\"noindex\">\
<title>Credentials</title><style>{STYLE}</style></head><body><div class=\"box\">\
<div class=\"warn\">These credentials are temporary. Do not save, screenshot or forward them.</div>\
<h1>Ephemeral credentials</h1>\
<div class=\"secret\">{content}</div>\
{burned}\
<p class=\"meta\">Created: {created}<br>Expires: {expires}</p>\
</div></body></html>",
        content = escape_html(&content),
        created = format_timestamp(revealed.created_at),
        expires = format_timestamp(revealed.expires_at),
    )
}

/// Escape text for an HTML element body.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// RFC 3339 rendering of a Unix-millisecond timestamp. Instants past year
/// 9999 render as `never`.
pub fn format_timestamp(millis: i64) -> String {
    if millis > LATEST_DEADLINE {
        return "never".to_owned();
    }
    let at = UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}
