use url::Url;

/// True only for a path on this server: no scheme, no host, and a path
/// starting with `/`.
///
/// Used for post-login `then` targets so they cannot send the browser to
/// another site.
pub fn is_server_relative_url(target: &str) -> bool {
    if !target.starts_with('/') || target.starts_with("//") {
        return false;
    }
    // Browsers read `\` as `/`, turning `/\evil.example` into a protocol-relative URL
    if target.contains('\\') || target.chars().any(char::is_control) {
        return false;
    }
    let Ok(base) = Url::parse("http://server.invalid/") else {
        return false;
    };
    match base.join(target) {
        Ok(resolved) => {
            resolved.scheme() == "http" && resolved.host_str() == Some("server.invalid")
        }
        Err(_) => false,
    }
}
