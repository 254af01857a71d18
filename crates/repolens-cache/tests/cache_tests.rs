#![allow(missing_docs, clippy::expect_used)]

mod common;

use anyhow::Result;
use common::{ScriptedVcs, eventually, open, open_with, remote, settle, source};
use repolens_cache::{EntryStatus, LockCoordinator, LockMode, LockScope, OrphanPolicy};
use repolens_core::{
    BranchStrategy, CacheError, EntryState, FailureKind, RepoIdentity, VcsErrorKind, VersionControl,
    WorkspaceKey,
};
use std::fs;
use std::time::Duration;

fn identities(cache: &repolens_cache::RepositoryCache) -> Vec<RepoIdentity> {
    cache.entries().into_iter().map(|entry| entry.identity).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_two_evicts_least_recently_used() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| config.max_cached_repos = 2)?;
    let a = remote(&vcs, "a", "a1");
    let b = remote(&vcs, "b", "b1");
    let c = remote(&vcs, "c", "c1");

    for repo in [&a, &b, &c] {
        settle(cache.ensure_cached(repo, None, None)?).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut cached = identities(&cache);
    cached.sort();
    assert_eq!(cached, vec![b.identity().clone(), c.identity().clone()]);
    assert!(!a.root_path(dir.path()).exists());
    assert!(cache.pressure().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_share_one_fetch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    vcs.push(repo.location(), "main", "c2");
    vcs.fetch_gate.close();
    let first = cache.refresh(repo.identity(), Some("main"), None)?;
    let second = cache.refresh(repo.identity(), Some("main"), None)?;
    assert_eq!(
        first.handle().map(|h| h.id()),
        second.handle().map(|h| h.id())
    );

    eventually(|| vcs.fetch_gate.entered() == 1).await?;
    vcs.fetch_gate.open();
    let first = settle(first).await?;
    let second = settle(second).await?;

    assert_eq!(vcs.fetches(), 1);
    let head = |entry: &repolens_core::RepositoryEntry| {
        entry.workspaces[&WorkspaceKey::Shared].head_commit.clone()
    };
    assert_eq!(head(&first), "c2");
    assert_eq!(head(&second), "c2");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_branch_read_proceeds_during_refresh_of_other_branch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| {
        config.lock_timeout = Duration::from_millis(300);
    })?;
    let repo = remote(&vcs, "a", "m1");
    vcs.push(repo.location(), "feature/x", "f1");
    let per_branch = Some(BranchStrategy::PerBranch);
    settle(cache.ensure_cached(&repo, Some("main"), per_branch)?).await?;
    settle(cache.ensure_cached(&repo, Some("feature/x"), per_branch)?).await?;

    vcs.push(repo.location(), "main", "m2");
    vcs.checkout_gate.close();
    let refresh = cache.refresh(repo.identity(), Some("main"), per_branch)?;
    eventually(|| vcs.checkout_gate.entered() == 1).await?;

    let lease = tokio::time::timeout(
        Duration::from_secs(1),
        cache.lease_workspace(repo.identity(), Some("feature/x")),
    )
    .await??;
    assert_eq!(lease.head_commit(), "f1");
    assert!(lease.path().join("README.md").exists());

    let blocked = cache.lease_workspace(repo.identity(), Some("main")).await;
    assert!(matches!(blocked, Err(CacheError::LockTimeout { .. })));

    drop(lease);
    vcs.checkout_gate.open();
    let entry = settle(refresh).await?;
    assert_eq!(entry.workspaces[&WorkspaceKey::Branch("main".into())].head_commit, "m2");
    assert_eq!(entry.workspaces.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_clone_leaves_no_directory_and_retry_clones_again() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");
    vcs.fail_next_clone(VcsErrorKind::Network);

    let err = settle(cache.ensure_cached(&repo, None, None)?)
        .await
        .expect_err("clone must fail");
    assert!(err.to_string().contains("network"));

    let status = cache.status(repo.identity())?;
    let entry = status.entry.expect("tombstone kept");
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.failure.as_ref().map(|f| f.kind), Some(FailureKind::Network));
    assert!(entry.workspaces.is_empty());
    assert!(!repo.root_path(dir.path()).exists());

    let retry = cache.ensure_cached(&repo, None, None)?;
    let EntryStatus::Pending { previous_failure, .. } = &retry else {
        panic!("retry must start a clone");
    };
    assert_eq!(previous_failure.as_ref().map(|f| f.kind), Some(FailureKind::Network));
    let entry = settle(retry).await?;
    assert_eq!(entry.state, EntryState::Ready);
    assert!(entry.failure.is_none());
    assert_eq!(vcs.clones(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_without_upstream_change_is_a_no_op() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");
    let cloned = settle(cache.ensure_cached(&repo, None, None)?).await?;

    let first = settle(cache.refresh(repo.identity(), None, None)?).await?;
    let second = settle(cache.refresh(repo.identity(), None, None)?).await?;

    assert_eq!(first.workspaces, second.workspaces);
    assert_eq!(second.workspaces.len(), 1);
    assert_eq!(second.workspaces[&WorkspaceKey::Shared].head_commit, "c1");
    assert!(second.last_accessed >= cloned.last_accessed);
    assert_eq!(vcs.checkouts(), 0);

    vcs.push(repo.location(), "main", "c2");
    let updated = settle(cache.refresh(repo.identity(), None, None)?).await?;
    assert_eq!(updated.workspaces[&WorkspaceKey::Shared].head_commit, "c2");
    assert_eq!(vcs.checkouts(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leased_entry_is_never_evicted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| config.max_cached_repos = 1)?;
    let a = remote(&vcs, "a", "a1");
    let b = remote(&vcs, "b", "b1");

    settle(cache.ensure_cached(&a, None, None)?).await?;
    let lease = cache.lease_workspace(a.identity(), None).await?;
    settle(cache.ensure_cached(&b, None, None)?).await?;

    assert_eq!(cache.entries().len(), 2);
    let pressure = cache.pressure().expect("pressure reported");
    assert_eq!(pressure.shortfall, 1);
    assert_eq!(pressure.blocked, vec![a.identity().clone()]);
    assert!(lease.path().exists());

    drop(lease);
    let report = cache.enforce_capacity().await?;
    assert_eq!(report.evicted, vec![a.identity().clone()]);
    assert!(report.pressure.is_none());
    assert_eq!(identities(&cache), vec![b.identity().clone()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_clone_rolls_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");

    vcs.clone_gate.close();
    let handle = cache.clone_async(&repo, None, None);
    eventually(|| vcs.clone_gate.entered() == 1).await?;
    handle.cancel();

    let err = handle.wait().await.expect_err("cancelled");
    assert!(matches!(err.as_ref(), CacheError::Cancelled));
    assert!(matches!(cache.status(repo.identity()), Err(CacheError::NotCached(_))));
    assert!(!repo.root_path(dir.path()).exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clone_past_deadline_is_recorded_as_timeout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| {
        config.operation_timeout = Duration::from_millis(200);
    })?;
    let repo = remote(&vcs, "a", "c1");

    vcs.clone_gate.close();
    let err = settle(cache.ensure_cached(&repo, None, None)?)
        .await
        .expect_err("must time out");
    assert!(err.to_string().contains("timed out"));

    let entry = cache.status(repo.identity())?.entry.expect("tombstone");
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.failure.map(|f| f.kind), Some(FailureKind::Timeout));
    assert!(!repo.root_path(dir.path()).exists());
    vcs.clone_gate.open();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_strategy_switches_branch_in_place() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "m1");
    vcs.push(repo.location(), "dev", "d1");

    let main = settle(cache.ensure_cached(&repo, None, None)?).await?;
    let shared_path = main.workspaces[&WorkspaceKey::Shared].path.clone();
    assert_eq!(main.default_branch.as_deref(), Some("main"));

    let status = cache.ensure_cached(&repo, Some("dev"), None)?;
    assert!(matches!(status, EntryStatus::Pending { .. }));
    let dev = settle(status).await?;

    let workspace = &dev.workspaces[&WorkspaceKey::Shared];
    assert_eq!(dev.workspaces.len(), 1);
    assert_eq!(workspace.branch, "dev");
    assert_eq!(workspace.path, shared_path);
    assert_eq!(fs::read_to_string(shared_path.join("README.md"))?, "dev@d1\n");
    assert_eq!(vcs.checkouts(), 1);

    let again = cache.ensure_cached(&repo, Some("dev"), None)?;
    assert!(matches!(again, EntryStatus::Ready { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_branch_without_branch_uses_default() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| {
        config.default_strategy = BranchStrategy::PerBranch;
    })?;
    let repo = remote(&vcs, "a", "m1");

    let entry = settle(cache.ensure_cached(&repo, None, None)?).await?;
    assert_eq!(entry.default_branch.as_deref(), Some("main"));
    assert!(entry.workspaces.contains_key(&WorkspaceKey::Branch("main".into())));
    let path = cache.resolve_workspace_path(repo.identity(), None)?;
    assert!(path.starts_with(repo.root_path(dir.path()).join("branches")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_of_vanished_branch_keeps_entry_ready() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    let err = settle(cache.refresh(repo.identity(), Some("gone"), None)?)
        .await
        .expect_err("branch does not exist");
    assert!(err.to_string().contains("gone"));

    let entry = cache.status(repo.identity())?.entry.expect("entry");
    assert_eq!(entry.state, EntryState::Ready);
    assert_eq!(entry.workspaces[&WorkspaceKey::Shared].branch, "main");
    assert!(matches!(
        cache.resolve_workspace_path(repo.identity(), Some("gone")),
        Err(CacheError::BranchNotFound { .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_refresh_is_recorded_but_workspace_still_served() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    vcs.fail_next_fetch(VcsErrorKind::Auth);
    settle(cache.refresh(repo.identity(), None, None)?)
        .await
        .expect_err("fetch fails");

    let entry = cache.status(repo.identity())?.entry.expect("entry");
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.failure.as_ref().map(|f| f.kind), Some(FailureKind::Auth));
    assert!(matches!(
        cache.ensure_cached(&repo, None, None)?,
        EntryStatus::Ready { .. }
    ));

    let healed = settle(cache.refresh(repo.identity(), None, None)?).await?;
    assert_eq!(healed.state, EntryState::Ready);
    assert!(healed.failure.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_removal_waits_for_readers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| {
        config.lock_timeout = Duration::from_millis(200);
    })?;
    let repo = remote(&vcs, "a", "c1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    let lease = cache.lease_workspace(repo.identity(), None).await?;
    let err = cache.remove(repo.identity()).await.expect_err("leased");
    assert!(err.is_retryable());

    drop(lease);
    assert!(cache.remove(repo.identity()).await?);
    assert!(!repo.root_path(dir.path()).exists());
    assert!(!cache.remove(repo.identity()).await?);
    assert!(matches!(
        cache.refresh(repo.identity(), None, None),
        Err(CacheError::NotCached(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cached_and_remote_branches_are_listed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "m1");
    vcs.push(repo.location(), "feature/x", "f1");

    settle(cache.ensure_cached(&repo, None, None)?).await?;
    settle(cache.ensure_cached(&repo, Some("feature/x"), Some(BranchStrategy::PerBranch))?).await?;

    let cached = cache.list_cached_branches(repo.identity())?;
    let names: Vec<_> = cached.iter().map(|b| (b.branch.as_str(), b.head_commit.as_str())).collect();
    assert_eq!(names, vec![("feature/x", "f1"), ("main", "m1")]);

    let remote_branches = cache.list_remote_branches(&repo).await?;
    assert_eq!(remote_branches, vec!["feature/x".to_owned(), "main".to_owned()]);

    let missing = cache.list_remote_branches(&source("missing")).await;
    assert!(missing.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manifest_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let repo = remote(&vcs, "a", "c1");
    {
        let cache = open(dir.path(), &vcs)?;
        settle(cache.ensure_cached(&repo, None, None)?).await?;
        cache.shutdown().await?;
    }

    let cache = open(dir.path(), &vcs)?;
    assert!(!cache.startup_report().reconcile.found_corruption());
    assert!(matches!(
        cache.ensure_cached(&repo, None, None)?,
        EntryStatus::Ready { .. }
    ));
    assert_eq!(vcs.clones(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn startup_drops_missing_roots_and_adopts_orphans() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let a = remote(&vcs, "a", "a1");
    let b = remote(&vcs, "b", "b1");
    let c = remote(&vcs, "c", "c1");
    {
        let cache = open(dir.path(), &vcs)?;
        settle(cache.ensure_cached(&a, None, None)?).await?;
        settle(cache.ensure_cached(&b, None, None)?).await?;
        cache.shutdown().await?;
    }
    fs::remove_dir_all(a.root_path(dir.path()))?;
    let orphan = c.root_path(dir.path());
    vcs.clone_branch(c.location(), &orphan.join("shared"), None, &|| false)?;

    let cache = open(dir.path(), &vcs)?;
    let report = &cache.startup_report().reconcile;
    assert_eq!(report.dropped, vec![a.identity().clone()]);
    assert_eq!(report.adopted, vec![c.identity().clone()]);

    let mut cached = identities(&cache);
    cached.sort();
    assert_eq!(cached, vec![b.identity().clone(), c.identity().clone()]);
    let adopted = cache.resolve_workspace_path(c.identity(), None)?;
    assert_eq!(adopted, orphan.join("shared"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrecognised_directories_are_quarantined() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let junk = dir.path().join("example.com").join("junk");
    fs::create_dir_all(&junk)?;
    fs::write(junk.join("notes.txt"), "left behind")?;

    let cache = open_with(dir.path(), &vcs, |config| {
        config.orphan_policy = OrphanPolicy::Quarantine;
    })?;
    let report = &cache.startup_report().reconcile;
    assert_eq!(report.quarantined.len(), 1);
    assert!(report.quarantined[0].join("notes.txt").exists());
    assert!(!junk.exists());
    assert!(!dir.path().join("example.com").exists());
    assert!(cache.entries().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_manifest_is_set_aside_and_disk_adopted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let repo = remote(&vcs, "a", "c1");
    {
        let cache = open(dir.path(), &vcs)?;
        settle(cache.ensure_cached(&repo, None, None)?).await?;
        cache.shutdown().await?;
    }
    fs::write(dir.path().join("manifest.json"), "{ not json")?;

    let cache = open(dir.path(), &vcs)?;
    let startup = cache.startup_report();
    assert!(startup.load.corrupt_backup.as_ref().is_some_and(|p| p.exists()));
    assert_eq!(startup.reconcile.adopted, vec![repo.identity().clone()]);
    assert!(matches!(
        cache.ensure_cached(&repo, None, None)?,
        EntryStatus::Ready { .. }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn summary_reports_totals() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "c1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    let summary = cache.summary();
    assert_eq!(summary.entries, 1);
    assert_eq!(summary.ready, 1);
    assert_eq!(summary.capacity, 50);
    assert!(summary.total_bytes > 0);
    assert_eq!(summary.in_flight, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutations_of_one_repository_never_overlap() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "m1");
    vcs.push(repo.location(), "feature", "f1");
    vcs.push(repo.location(), "dev", "d1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    vcs.push(repo.location(), "main", "m2");
    let gated = || vcs.fetch_gate.entered() + vcs.clone_gate.entered();
    let before = gated();
    vcs.fetch_gate.close();
    vcs.clone_gate.close();
    let per_branch = Some(BranchStrategy::PerBranch);
    let jobs = vec![
        cache.refresh(repo.identity(), Some("main"), None)?,
        cache.refresh(repo.identity(), Some("feature"), per_branch)?,
        cache.ensure_cached(&repo, Some("dev"), per_branch)?,
        cache.refresh(repo.identity(), Some("main"), per_branch)?,
    ];
    eventually(|| gated() > before).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gated(), before + 1);

    vcs.fetch_gate.open();
    vcs.clone_gate.open();
    for job in jobs {
        settle(job).await?;
    }

    assert_eq!(vcs.peak_in_flight(repo.location()), 1);
    let entry = cache
        .entries()
        .into_iter()
        .find(|entry| &entry.identity == repo.identity())
        .expect("entry cached");
    assert_eq!(entry.workspaces.len(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn eviction_skips_repository_with_queued_refresh() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| config.max_cached_repos = 2)?;
    let a = remote(&vcs, "a", "a1");
    let b = remote(&vcs, "b", "b1");
    let c = remote(&vcs, "c", "c1");
    vcs.push(a.location(), "feature", "f1");
    for repo in [&a, &b] {
        settle(cache.ensure_cached(repo, None, None)?).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Another process reading `a` keeps the queued refresh waiting inside its
    // mutation lock.
    let a_root = a.root_path(dir.path());
    let outside = LockCoordinator::new(dir.path(), Duration::from_secs(5))?;
    let reader = outside
        .try_acquire(&a_root, LockScope::Repository, LockMode::Exclusive)?
        .expect("repository lock is free");
    let refresh = cache.refresh(a.identity(), Some("feature"), Some(BranchStrategy::PerBranch))?;
    eventually(|| {
        outside
            .try_acquire(&a_root, LockScope::Mutation, LockMode::Exclusive)
            .is_ok_and(|guard| guard.is_none())
    })
    .await?;

    settle(cache.ensure_cached(&c, None, None)?).await?;
    assert!(identities(&cache).contains(a.identity()));
    assert!(a_root.is_dir());
    let report = cache.enforce_capacity().await?;
    assert!(report.evicted.is_empty());
    assert_eq!(report.deferred, vec![a.identity().clone()]);
    assert!(a_root.is_dir());

    drop(reader);
    let entry = settle(refresh).await?;
    assert!(
        entry
            .workspaces
            .contains_key(&WorkspaceKey::for_branch(BranchStrategy::PerBranch, "feature"))
    );
    assert!(a_root.is_dir());
    for repo in [&a, &b, &c] {
        let indexed = identities(&cache).contains(repo.identity());
        assert_eq!(indexed, repo.root_path(dir.path()).exists(), "{}", repo.identity());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lease_during_shared_switch_never_sees_other_branch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open(dir.path(), &vcs)?;
    let repo = remote(&vcs, "a", "m1");
    vcs.push(repo.location(), "dev", "d1");
    settle(cache.ensure_cached(&repo, None, None)?).await?;

    vcs.checkout_gate.close();
    let switch = cache.ensure_cached(&repo, Some("dev"), None)?;
    eventually(|| vcs.checkout_gate.entered() == 1).await?;

    let (lease, ()) = tokio::join!(cache.lease_workspace(repo.identity(), Some("main")), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        vcs.checkout_gate.open();
    });
    match lease {
        Err(CacheError::BranchNotFound { branch, .. }) => assert_eq!(branch, "main"),
        Ok(lease) => {
            assert_eq!(lease.branch(), "main");
            assert_eq!(fs::read_to_string(lease.path().join("README.md"))?, "main@m1\n");
        }
        Err(other) => return Err(other.into()),
    }

    settle(switch).await?;
    let lease = cache.lease_workspace(repo.identity(), Some("dev")).await?;
    assert_eq!(lease.branch(), "dev");
    assert_eq!(fs::read_to_string(lease.path().join("README.md"))?, "dev@d1\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_refresh_does_not_starve_other_repositories() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vcs = ScriptedVcs::new();
    let cache = open_with(dir.path(), &vcs, |config| config.workers = 2)?;
    let a = remote(&vcs, "a", "m1");
    let b = remote(&vcs, "b", "b1");
    vcs.push(a.location(), "feature", "f1");
    settle(cache.ensure_cached(&a, None, None)?).await?;

    vcs.fetch_gate.close();
    let busy = cache.refresh(a.identity(), Some("main"), None)?;
    eventually(|| vcs.fetch_gate.entered() == 1).await?;
    let queued = cache.refresh(a.identity(), Some("feature"), Some(BranchStrategy::PerBranch))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = tokio::time::timeout(
        Duration::from_secs(2),
        settle(cache.ensure_cached(&b, None, None)?),
    )
    .await;
    vcs.fetch_gate.open();
    assert!(other.is_ok(), "clone of an unrelated repository was starved");
    other??;

    settle(busy).await?;
    settle(queued).await?;
    Ok(())
}
