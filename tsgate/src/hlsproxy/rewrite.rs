//! Playlist URL rewriting.

/// Resolve `.` and `..` path segments. Keeps a leading slash.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            segment => parts.push(segment),
        }
    }

    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Map an upstream URL back under the local path prefix.
///
/// URLs absolute under `base_url` lose the base and gain `prefix`;
/// root-relative URLs gain `prefix`; other relative URLs stay where they
/// are. `.` and `..` segments are resolved; foreign absolute URLs pass
/// through untouched.
pub fn relative_path(base_url: &str, prefix: &str, u: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let prefix = prefix.trim_end_matches('/');

    let (path, query) = match u.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (u, None),
    };

    let rewritten = if path.starts_with("http://") || path.starts_with("https://") {
        match path.strip_prefix(base) {
            Some(rest) if !base.is_empty() && (rest.is_empty() || rest.starts_with('/')) => {
                format!("{prefix}{}", clean_path(rest))
            }
            _ => return u.to_string(),
        }
    } else if path.starts_with('/') {
        format!("{prefix}{}", clean_path(path))
    } else {
        clean_path(path)
    };

    match query {
        Some(query) => format!("{rewritten}?{query}"),
        None => rewritten,
    }
}

/// Walk a playlist line by line and rewrite every URL in place.
///
/// Tag lines (`#…`) have the URL inside a `URI="…"` attribute rewritten;
/// other non-empty lines are whole URLs. Blank lines are preserved.
pub fn playlist_url_walk(text: &str, rewrite: &dyn Fn(&str) -> String) -> String {
    let mut out: Vec<String> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            out.push(String::new());
            continue;
        }

        if line.starts_with('#') {
            if let Some(pos) = line.find("URI=\"") {
                let inner_start = pos + "URI=\"".len();
                if let Some(len) = line[inner_start..].find('"') {
                    let inner = &line[inner_start..inner_start + len];
                    out.push(format!(
                        "{}{}{}",
                        &line[..inner_start],
                        rewrite(inner),
                        &line[inner_start + len..]
                    ));
                    continue;
                }
            }
            out.push(line.to_string());
            continue;
        }

        out.push(rewrite(line));
    }

    let mut result = out.join("\n");
    if text.ends_with('\n') {
        result.push('\n');
    }
    result
}
