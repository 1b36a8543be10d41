//! HTML documents returned to the OAuth popup window.

use crate::connectors::Provider;
use crate::profiles::SocialAccountProfile;
use serde_json::json;

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// JSON safe to inline in a `<script>` element.
fn script_json(value: &serde_json::Value) -> String {
    value
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

fn document(title: &str, body: &str, script: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ font-family: system-ui, sans-serif; text-align: center; padding: 3rem 1rem; color: #222; }}
.muted {{ color: #777; font-size: 0.9rem; }}
</style>
</head>
<body>
{body}
<script>{script}</script>
</body>
</html>
"#,
        title = escape_html(title),
        body = body,
        script = script,
    )
}

/// Success page; posts the connection summary to the opener and closes.
pub fn success_page(provider: Provider, profile: &SocialAccountProfile) -> String {
    let message = json!({
        "type": format!("{}-connected", provider),
        "data": {
            "provider": provider.as_str(),
            "username": profile.username,
            "followerCount": profile.follower_count,
            "mediaCount": profile.media_count,
        }
    });

    let body = format!(
        "<h1>{name} connected</h1>\n<p><strong>{username}</strong></p>\n<p>{followers} followers &middot; {media} posts</p>\n<p class=\"muted\">You can close this window.</p>",
        name = provider.display_name(),
        username = escape_html(&profile.username),
        followers = profile.follower_count,
        media = profile.media_count,
    );

    let script = format!(
        "if (window.opener) {{ window.opener.postMessage({}, \"*\"); setTimeout(function () {{ window.close(); }}, 1500); }}",
        script_json(&message)
    );

    document(&format!("{} connected", provider.display_name()), &body, &script)
}

/// Generic failure page. Never includes provider detail.
pub fn error_page(message: &str) -> String {
    let body = format!(
        "<h1>Connection failed</h1>\n<p>{}</p>\n<p class=\"muted\">You can close this window.</p>",
        escape_html(message)
    );
    let script = format!(
        "if (window.opener) {{ window.opener.postMessage({}, \"*\"); }}",
        script_json(&json!({ "type": "connection-error", "message": message }))
    );
    document("Connection failed", &body, &script)
}
