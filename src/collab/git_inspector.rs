//! collab::git_inspector
//!
//! Default `RepoInspector` backed by git2.
//!
//! # Architecture
//!
//! This is the single doorway to Git for the release engine. No other
//! module imports `git2`. The repository handle is opened per call so
//! the inspector stays `Send + Sync` without interior locking.
//!
//! `release_exists` is the one forge-touching query: it asks the GitHub
//! API whether a release with the tag name exists, using a token from
//! `GITHUB_TOKEN` / `GH_TOKEN`. Missing remote, non-GitHub remote, or
//! missing token all report `false` rather than failing inspection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::traits::{InspectorError, RepoInspector};
use crate::core::types::CommitSha;
use crate::core::version::Version;

/// Default GitHub API base; overridable for tests.
const GITHUB_API_BASE: &str = "https://api.github.com";

/// git2-backed repository inspector.
#[derive(Debug, Clone)]
pub struct GitInspector {
    repo_root: PathBuf,
    http: reqwest::Client,
    api_base: String,
}

impl GitInspector {
    /// Create an inspector rooted at a repository working tree.
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            http: reqwest::Client::new(),
            api_base: GITHUB_API_BASE.to_string(),
        }
    }

    /// Override the forge API base URL (tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn open(&self) -> Result<git2::Repository, InspectorError> {
        git2::Repository::discover(&self.repo_root)
            .map_err(|_| InspectorError::NotARepo(self.repo_root.display().to_string()))
    }

    fn head_commit(repo: &git2::Repository) -> Result<git2::Oid, InspectorError> {
        let head = repo
            .head()
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;
        head.peel_to_commit()
            .map(|c| c.id())
            .map_err(|e| InspectorError::Git(e.message().to_string()))
    }

    fn resolve_ref(repo: &git2::Repository, refname: &str) -> Result<git2::Oid, InspectorError> {
        let object = repo
            .revparse_single(refname)
            .map_err(|_| InspectorError::RefNotFound(refname.to_string()))?;
        object
            .peel_to_commit()
            .map(|c| c.id())
            .map_err(|e| InspectorError::Git(e.message().to_string()))
    }
}

/// Create an annotated tag at a commit.
///
/// Returns `false` without touching anything when the tag already
/// exists, `true` when the tag was created.
pub fn create_tag(
    repo_root: &Path,
    name: &str,
    sha: &CommitSha,
    message: &str,
) -> Result<bool, InspectorError> {
    let repo = git2::Repository::discover(repo_root)
        .map_err(|_| InspectorError::NotARepo(repo_root.display().to_string()))?;

    if repo.find_reference(&format!("refs/tags/{name}")).is_ok() {
        return Ok(false);
    }

    let oid = git2::Oid::from_str(sha.as_str())
        .map_err(|e| InspectorError::Git(e.message().to_string()))?;
    let object = repo
        .find_object(oid, None)
        .map_err(|e| InspectorError::Git(e.message().to_string()))?;
    let tagger = repo
        .signature()
        .or_else(|_| git2::Signature::now("capstan", "capstan@localhost"))
        .map_err(|e| InspectorError::Git(e.message().to_string()))?;
    repo.tag(name, &object, &tagger, message, false)
        .map_err(|e| InspectorError::Git(e.message().to_string()))?;
    Ok(true)
}

/// Extract `(owner, repo)` from a GitHub remote URL.
///
/// Handles `git@github.com:owner/repo.git` and
/// `https://github.com/owner/repo[.git]` forms; anything else is `None`.
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let rest = if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest
    } else if let Some(rest) = url.strip_prefix("https://github.com/") {
        rest
    } else if let Some(rest) = url.strip_prefix("ssh://git@github.com/") {
        rest
    } else {
        return None;
    };
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let mut parts = rest.splitn(2, '/');
    let owner = parts.next()?.trim();
    let repo = parts.next()?.trim().trim_end_matches('/');
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Derive a logical `owner/repo` identity from a remote URL, falling back
/// to the repository directory name.
pub fn repo_id_from(remote_url: Option<&str>, repo_root: &Path) -> String {
    if let Some((owner, repo)) = remote_url.and_then(parse_github_remote) {
        return format!("{owner}/{repo}");
    }
    repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repository".to_string())
}

#[async_trait]
impl RepoInspector for GitInspector {
    async fn head_sha(&self) -> Result<CommitSha, InspectorError> {
        let repo = self.open()?;
        let oid = Self::head_commit(&repo)?;
        CommitSha::new(oid.to_string()).map_err(|e| InspectorError::Git(e.to_string()))
    }

    async fn is_clean(&self) -> Result<bool, InspectorError> {
        let repo = self.open()?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;
        Ok(statuses.is_empty())
    }

    async fn resolve_commits(
        &self,
        base_ref: &str,
        head: &CommitSha,
    ) -> Result<Vec<CommitSha>, InspectorError> {
        let repo = self.open()?;
        let head_oid = git2::Oid::from_str(head.as_str())
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;

        let mut walk = repo
            .revwalk()
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;
        walk.push(head_oid)
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;

        // An empty base means "everything reachable from head" (first
        // release of a repository).
        if !base_ref.is_empty() {
            let base_oid = Self::resolve_ref(&repo, base_ref)?;
            walk.hide(base_oid).map_err(|e| InspectorError::BadRange {
                base: base_ref.to_string(),
                head: head.to_string(),
                message: e.message().to_string(),
            })?;
        }

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid.map_err(|e| InspectorError::Git(e.message().to_string()))?;
            let sha = CommitSha::new(oid.to_string())
                .map_err(|e| InspectorError::Git(e.to_string()))?;
            commits.push(sha);
        }
        commits.reverse(); // oldest first
        Ok(commits)
    }

    async fn remote_url(&self) -> Result<Option<String>, InspectorError> {
        let repo = self.open()?;
        let result = match repo.find_remote("origin") {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(_) => Ok(None),
        };
        result
    }

    async fn current_branch(&self) -> Result<String, InspectorError> {
        let repo = self.open()?;
        let head = repo
            .head()
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    async fn latest_version_tag(
        &self,
        prefix: &str,
    ) -> Result<Option<(String, Version)>, InspectorError> {
        let repo = self.open()?;
        let names = repo
            .tag_names(None)
            .map_err(|e| InspectorError::Git(e.message().to_string()))?;

        let mut best: Option<(String, Version)> = None;
        for name in names.iter().flatten() {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            let Ok(version) = Version::parse(rest) else {
                continue;
            };
            let better = match &best {
                Some((_, current)) => version > *current,
                None => true,
            };
            if better {
                best = Some((name.to_string(), version));
            }
        }
        Ok(best)
    }

    async fn tag_exists(&self, name: &str) -> Result<bool, InspectorError> {
        let repo = self.open()?;
        let result = Ok(repo.find_reference(&format!("refs/tags/{name}")).is_ok());
        result
    }

    async fn release_exists(&self, name: &str) -> Result<bool, InspectorError> {
        let Some(url) = self.remote_url().await? else {
            return Ok(false);
        };
        let Some((owner, repo)) = parse_github_remote(&url) else {
            return Ok(false);
        };
        let token = match std::env::var("GITHUB_TOKEN").or_else(|_| std::env::var("GH_TOKEN")) {
            Ok(token) if !token.is_empty() => token,
            _ => return Ok(false),
        };

        let endpoint = format!(
            "{}/repos/{owner}/{repo}/releases/tags/{name}",
            self.api_base
        );
        let response = self
            .http
            .get(&endpoint)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "capstan")
            .send()
            .await
            .map_err(|e| InspectorError::Forge(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(InspectorError::Forge(format!(
                "unexpected status {status} from release lookup"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_remote() {
        assert_eq!(
            parse_github_remote("git@github.com:acme/widgets.git"),
            Some(("acme".into(), "widgets".into()))
        );
    }

    #[test]
    fn parses_https_remote() {
        assert_eq!(
            parse_github_remote("https://github.com/acme/widgets"),
            Some(("acme".into(), "widgets".into()))
        );
        assert_eq!(
            parse_github_remote("https://github.com/acme/widgets.git"),
            Some(("acme".into(), "widgets".into()))
        );
    }

    #[test]
    fn rejects_non_github_remotes() {
        assert!(parse_github_remote("https://gitlab.com/acme/widgets").is_none());
        assert!(parse_github_remote("not a url").is_none());
    }

    #[test]
    fn repo_id_falls_back_to_directory_name() {
        assert_eq!(
            repo_id_from(None, Path::new("/home/dev/widgets")),
            "widgets"
        );
        assert_eq!(
            repo_id_from(Some("git@github.com:acme/widgets.git"), Path::new("/x")),
            "acme/widgets"
        );
    }
}
