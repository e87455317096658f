//! Repository URL canonicalisation.
//!
//! Webhook payloads, ingress requests and stored incidents can all spell
//! the same repository differently (`https://`, `git@`, trailing slash,
//! `.git`, mixed case). Dormant-sentinel matching and allow-list checks
//! compare canonical forms only.

/// Reduce a repository URL to `host/owner/repo` in lowercase.
///
/// Handles `https://`, `http://`, `ssh://`, `git://` and the scp-like
/// `git@host:owner/repo` form. Trailing slashes and a `.git` suffix are
/// stripped.
#[must_use]
pub fn canonical_repo_url(url: &str) -> String {
    let mut s = url.trim().to_string();

    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest.to_string();
            break;
        }
    }

    // scp-like form: git@github.com:owner/repo.git
    if let Some(rest) = s.strip_prefix("git@") {
        s = rest.replacen(':', "/", 1);
    }

    let s = s.trim_end_matches('/');
    let s = s.strip_suffix(".git").unwrap_or(s);
    s.trim_end_matches('/').to_lowercase()
}

/// Whether two repository URLs identify the same repository.
#[must_use]
pub fn urls_match(a: &str, b: &str) -> bool {
    let (a, b) = (canonical_repo_url(a), canonical_repo_url(b));
    !a.is_empty() && a == b
}
