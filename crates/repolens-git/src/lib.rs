//! Git implementation of the version-control collaborator.

/// Error classification.
pub mod error;

use crate::error::classify;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AutotagOption, Cred, CredentialType, Direction, ErrorCode, FetchOptions, Oid, Remote,
    RemoteCallbacks, Repository, StatusOptions,
};
use repolens_core::{
    CancelCheck, CheckoutInfo, FetchOutcome, VcsError, VcsErrorKind, VersionControl, WorkspaceInfo,
};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const ORIGIN: &str = "origin";
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// [`VersionControl`] backed by libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitBackend;

impl GitBackend {
    /// Create a backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Remote callbacks with credential lookup and, when given, cancellation.
///
/// Credentials are tried from the SSH agent and the git credential helper; the
/// attempt counter stops libgit2 from looping on rejected credentials.
fn remote_callbacks<'a>(cancelled: Option<CancelCheck<'a>>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let config = git2::Config::open_default().ok();
    let mut attempts = 0usize;
    callbacks.credentials(move |url, username, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed: credentials rejected"));
        }
        let user = username.unwrap_or("git");
        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(user);
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(user);
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
            && let Some(config) = &config
            && let Ok(cred) = Cred::credential_helper(config, url, username)
        {
            return Ok(cred);
        }
        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }
        Err(git2::Error::from_str("authentication required but no credentials are available"))
    });
    if let Some(cancelled) = cancelled {
        callbacks.transfer_progress(move |_| !cancelled());
    }
    callbacks
}

fn fetch_options(cancelled: CancelCheck<'_>) -> FetchOptions<'_> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(Some(cancelled)));
    options.download_tags(AutotagOption::None);
    options
}

fn open(workspace: &Path) -> Result<Repository, VcsError> {
    Repository::open(workspace).map_err(|err| classify(&err, false))
}

fn head_info(repo: &Repository) -> Result<CheckoutInfo, VcsError> {
    let head = repo.head().map_err(|err| classify(&err, false))?;
    let branch = head.shorthand().unwrap_or("HEAD").to_owned();
    let commit = head.peel_to_commit().map_err(|err| classify(&err, false))?;
    Ok(CheckoutInfo {
        branch,
        head_commit: commit.id().to_string(),
    })
}

fn cancelled_error() -> VcsError {
    VcsError::new(VcsErrorKind::Cancelled, "operation cancelled")
}

impl VersionControl for GitBackend {
    fn clone_branch(
        &self,
        source: &str,
        dest: &Path,
        branch: Option<&str>,
        cancelled: CancelCheck<'_>,
    ) -> Result<CheckoutInfo, VcsError> {
        if cancelled() {
            return Err(cancelled_error());
        }
        info!(source, dest = %dest.display(), branch = branch.unwrap_or("<default>"), "cloning");

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options(cancelled));
        if let Some(branch) = branch {
            builder.branch(branch);
        }
        let repo = builder
            .clone(source, dest)
            .map_err(|err| classify(&err, cancelled()))?;
        let checkout = head_info(&repo)?;
        debug!(branch = %checkout.branch, head = %checkout.head_commit, "clone finished");
        Ok(checkout)
    }

    fn fetch(
        &self,
        workspace: &Path,
        branch: &str,
        cancelled: CancelCheck<'_>,
    ) -> Result<FetchOutcome, VcsError> {
        if cancelled() {
            return Err(cancelled_error());
        }
        let repo = open(workspace)?;
        ensure_clean(&repo)?;
        let mut remote = repo.find_remote(ORIGIN).map_err(|err| classify(&err, false))?;

        // A stale FETCH_HEAD would hide a branch deleted upstream.
        let fetch_head = repo.path().join("FETCH_HEAD");
        if fetch_head.exists() {
            fs::remove_file(&fetch_head)?;
        }

        let refspec = format!("+refs/heads/{branch}:refs/remotes/{ORIGIN}/{branch}");
        let mut options = fetch_options(cancelled);
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|err| classify(&err, cancelled()))?;

        let Some(remote_head) = fetched_head(&repo, branch)? else {
            return Err(VcsError::new(
                VcsErrorKind::NotFound,
                format!("branch {branch} not found on {ORIGIN}"),
            ));
        };

        let current = head_info(&repo).ok();
        let unchanged = current.is_some_and(|info| {
            info.branch == branch && info.head_commit == remote_head.to_string()
        });
        debug!(workspace = %workspace.display(), branch, head = %remote_head, unchanged, "fetched");
        if unchanged {
            Ok(FetchOutcome::Unchanged)
        } else {
            Ok(FetchOutcome::Updated(remote_head.to_string()))
        }
    }

    fn checkout(&self, workspace: &Path, branch: &str) -> Result<CheckoutInfo, VcsError> {
        let repo = open(workspace)?;
        let tracking = format!("refs/remotes/{ORIGIN}/{branch}");
        let target = repo
            .find_reference(&tracking)
            .and_then(|reference| reference.peel_to_commit())
            .map_err(|err| classify(&err, false))?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.checkout_tree(target.as_object(), Some(&mut checkout))
            .map_err(|err| classify(&err, false))?;

        let local = format!("refs/heads/{branch}");
        repo.reference(&local, target.id(), true, "repolens: checkout")
            .map_err(|err| classify(&err, false))?;
        repo.set_head(&local).map_err(|err| classify(&err, false))?;

        debug!(workspace = %workspace.display(), branch, head = %target.id(), "checked out");
        Ok(CheckoutInfo {
            branch: branch.to_owned(),
            head_commit: target.id().to_string(),
        })
    }

    fn list_remote_branches(&self, source: &str) -> Result<Vec<String>, VcsError> {
        let mut remote = Remote::create_detached(source).map_err(|err| classify(&err, false))?;
        let mut connection = remote
            .connect_auth(Direction::Fetch, Some(remote_callbacks(None)), None)
            .map_err(|err| classify(&err, false))?;
        let mut names: Vec<String> = connection
            .remote()
            .list()
            .map_err(|err| classify(&err, false))?
            .iter()
            .filter_map(|head| head.name().strip_prefix("refs/heads/").map(str::to_owned))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn inspect(&self, workspace: &Path) -> Result<WorkspaceInfo, VcsError> {
        let repo = open(workspace)?;
        let origin_url = repo
            .find_remote(ORIGIN)
            .ok()
            .and_then(|remote| remote.url().map(str::to_owned));
        let head = head_info(&repo)?;
        Ok(WorkspaceInfo {
            origin_url,
            branch: head.branch,
            head_commit: head.head_commit,
        })
    }
}

/// Refuse to touch a workspace whose tracked files were modified in place.
fn ensure_clean(repo: &Repository) -> Result<(), VcsError> {
    let mut options = StatusOptions::new();
    options.include_untracked(false).include_ignored(false);
    let statuses = repo.statuses(Some(&mut options)).map_err(|err| classify(&err, false))?;
    if let Some(path) = statuses.iter().find_map(|entry| entry.path().map(str::to_owned)) {
        return Err(VcsError::new(
            VcsErrorKind::Dirty,
            format!("workspace has local modifications ({path})"),
        ));
    }
    Ok(())
}

/// Commit recorded in FETCH_HEAD for `branch`, if the fetch brought it.
fn fetched_head(repo: &Repository, branch: &str) -> Result<Option<Oid>, VcsError> {
    let wanted = format!("refs/heads/{branch}");
    let mut fetched: Option<Oid> = None;
    let walked = repo.fetchhead_foreach(|name, _url, oid, _is_merge| {
        if name == wanted {
            fetched = Some(*oid);
            false
        } else {
            true
        }
    });
    match walked {
        Ok(()) => Ok(fetched),
        // Stopping the walk early is reported as a user error; a missing
        // FETCH_HEAD means the branch was not fetched.
        Err(err) if matches!(err.code(), ErrorCode::User | ErrorCode::NotFound) => Ok(fetched),
        Err(err) => Err(classify(&err, false)),
    }
}
