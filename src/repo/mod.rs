//! Registered source repositories and the per-repo task lock.

mod models;
mod repository;

pub use models::Repo;
pub use repository::{LockError, RepoRepository};

/// Normalize a git remote URL for comparison: trim a trailing slash, trim a
/// trailing `.git`, lowercase.
pub fn normalize_remote_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::normalize_remote_url;

    #[test]
    fn normalizes_remote_urls() {
        assert_eq!(
            normalize_remote_url("https://GitHub.com/Acme/Widget.git"),
            "https://github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widget/"),
            "https://github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widget"),
            normalize_remote_url("https://github.com/acme/widget.git/")
        );
    }
}
