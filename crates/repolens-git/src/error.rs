//! Mapping of libgit2 failures onto collaborator failure classes.

use git2::{ErrorClass, ErrorCode};
use repolens_core::{VcsError, VcsErrorKind};

/// Classify a libgit2 error.
///
/// `cancelled` is the state of the cancellation flag when the call failed; a
/// callback abort only counts as cancellation when the flag was raised.
pub fn classify(err: &git2::Error, cancelled: bool) -> VcsError {
    let message = err.message().to_owned();
    if cancelled && matches!(err.code(), ErrorCode::User) {
        return VcsError::new(VcsErrorKind::Cancelled, message);
    }

    let kind = match err.code() {
        ErrorCode::Auth | ErrorCode::Certificate => VcsErrorKind::Auth,
        ErrorCode::NotFound | ErrorCode::UnbornBranch => VcsErrorKind::NotFound,
        ErrorCode::Conflict
        | ErrorCode::MergeConflict
        | ErrorCode::Uncommitted
        | ErrorCode::Modified
        | ErrorCode::IndexDirty => VcsErrorKind::Dirty,
        ErrorCode::Locked | ErrorCode::Directory => VcsErrorKind::Disk,
        _ => match err.class() {
            ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
                from_message(&message).unwrap_or(VcsErrorKind::Network)
            }
            ErrorClass::Os | ErrorClass::Filesystem => VcsErrorKind::Disk,
            ErrorClass::Checkout => VcsErrorKind::Dirty,
            _ => from_message(&message).unwrap_or(VcsErrorKind::Other),
        },
    };
    VcsError::new(kind, message)
}

fn from_message(message: &str) -> Option<VcsErrorKind> {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if has(&["401", "403", "authentication", "credentials", "permission denied"]) {
        Some(VcsErrorKind::Auth)
    } else if has(&[
        "404",
        "not found",
        "could not find",
        "couldn't find",
        "does not appear to be a git repository",
    ]) {
        Some(VcsErrorKind::NotFound)
    } else if has(&["could not resolve", "timed out", "connection", "network"]) {
        Some(VcsErrorKind::Network)
    } else {
        None
    }
}
