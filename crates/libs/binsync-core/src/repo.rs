//! Repository adapter: a thin, synchronous façade over `git2`.
//!
//! Exposes exactly the primitives `client` needs — branch enumeration,
//! tree reads, index staging, commit, fetch/pull/push, and an environment
//! overlay for authenticated remote operations — and nothing else.
//!
//! [`Repo`] wraps the handle in `Arc<Mutex<git2::Repository>>`. `git2::Repository`
//! is `Send` but not `Sync` (it owns raw libgit2 pointers), so this is the
//! smallest wrapper that lets a `Client` be shared across caller threads
//! with zero `unsafe` — every caller still only ever reaches the
//! repository from the scheduler's single worker thread (§4.2), but the
//! wrapper type itself must be `Send + Sync` to live behind the `Arc` a
//! `Client` hands out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use git2::{
    BranchType, Commit, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository,
    Signature, Tree,
};
use tracing::debug;

use crate::error::{Error, Result};

pub const GITIGNORE_CONTENTS: &str = ".git/*";
pub const GITIGNORE_PATH: &str = ".gitignore";
pub const BINARY_HASH_PATH: &str = "binary_hash";

/// A resolved branch reference, distinguishing local heads from
/// remote-tracking ones for best-ref selection (§4.4.6).
#[derive(Debug, Clone)]
pub struct BranchRef {
    /// Short user-facing name, e.g. `binsync/alice`.
    pub short_name: String,
    pub is_remote: bool,
    /// The configured remote this ref came from, when remote.
    pub remote_name: Option<String>,
    pub target: Oid,
}

/// Scoped environment overlay for remote operations (§4.5, §9). Restores
/// the prior ambient environment on drop, on every exit path.
pub struct EnvOverlayGuard {
    restore: Vec<(String, Option<String>)>,
}

impl EnvOverlayGuard {
    pub fn enter(overlay: &HashMap<String, String>) -> Self {
        let mut restore = Vec::with_capacity(overlay.len());
        for (key, value) in overlay {
            restore.push((key.clone(), std::env::var(key).ok()));
            // SAFETY note: not applicable here, no unsafe is used; std::env::set_var
            // mutates process-global state, acceptable because all repository
            // mutation (and thus all remote operations) is serialized onto the
            // scheduler's single worker thread (§4.2, §5).
            std::env::set_var(key, value);
        }
        Self { restore }
    }
}

impl Drop for EnvOverlayGuard {
    fn drop(&mut self) {
        for (key, prior) in self.restore.drain(..) {
            match prior {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Thread-safe handle onto a single on-disk repository.
#[derive(Clone)]
pub struct Repo {
    inner: Arc<Mutex<Repository>>,
    path: PathBuf,
}

impl Repo {
    fn guard(&self) -> MutexGuard<'_, Repository> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens an existing repository at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(repo)),
            path: path.to_path_buf(),
        })
    }

    /// Initializes a brand-new, empty repository at `path`.
    pub fn init(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let repo = Repository::init(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(repo)),
            path: path.to_path_buf(),
        })
    }

    /// Clones `remote_url` into `path`.
    pub fn clone_remote(remote_url: &str, path: &Path) -> Result<Self> {
        let repo = Repository::clone(remote_url, path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(repo)),
            path: path.to_path_buf(),
        })
    }

    pub fn is_repository(path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    /// Enumerates local and remote-tracking branches whose short name
    /// contains `binsync/`, annotated with origin for best-ref selection.
    pub fn list_binsync_branches(&self) -> Result<Vec<BranchRef>> {
        let repo = self.guard();
        let mut out = Vec::new();
        for item in repo.branches(None)? {
            let (branch, kind) = item?;
            let name = match branch.name()? {
                Some(n) => n.to_string(),
                None => continue,
            };
            if !name.contains("binsync/") {
                continue;
            }
            let Some(target) = branch.get().target() else {
                continue;
            };
            let (is_remote, remote_name, short_name) = match kind {
                BranchType::Local => (false, None, name),
                BranchType::Remote => {
                    // name is "<remote>/binsync/<user>"; split at the first '/'.
                    match name.split_once('/') {
                        Some((remote, rest)) => (true, Some(remote.to_string()), rest.to_string()),
                        None => (true, None, name),
                    }
                }
            };
            out.push(BranchRef {
                short_name,
                is_remote,
                remote_name,
                target,
            });
        }
        Ok(out)
    }

    /// True if a local branch with this short name exists.
    pub fn has_local_branch(&self, short_name: &str) -> Result<bool> {
        let repo = self.guard();
        let x = Ok(repo.find_branch(short_name, BranchType::Local).is_ok());
        x
    }

    /// Finds the remote-tracking counterpart `<remote>/<short_name>`, if any.
    pub fn find_remote_branch(&self, remote: &str, short_name: &str) -> Result<Option<Oid>> {
        let repo = self.guard();
        let full = format!("{remote}/{short_name}");
        let x = match repo.find_branch(&full, BranchType::Remote) {
            Ok(branch) => Ok(branch.get().target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        x
    }

    /// Creates a local branch named `short_name` at `target`, with no
    /// upstream tracking configured.
    pub fn create_branch_at(&self, short_name: &str, target: Oid) -> Result<()> {
        let repo = self.guard();
        let commit = repo.find_commit(target)?;
        repo.branch(short_name, &commit, false)?;
        Ok(())
    }

    /// Creates a local branch named `short_name` tracking `<remote>/<short_name>`.
    pub fn create_tracking_branch(&self, remote: &str, short_name: &str) -> Result<()> {
        let repo = self.guard();
        let full = format!("{remote}/{short_name}");
        let remote_branch = repo.find_branch(&full, BranchType::Remote)?;
        let target = remote_branch
            .get()
            .target()
            .ok_or_else(|| Error::Setup(format!("remote branch {full} has no target")))?;
        let commit = repo.find_commit(target)?;
        let mut local = repo.branch(short_name, &commit, false)?;
        local.set_upstream(Some(&full))?;
        Ok(())
    }

    /// Checks out the local branch `short_name`, updating HEAD and the
    /// working tree/index to match it.
    pub fn checkout_branch(&self, short_name: &str) -> Result<()> {
        let repo = self.guard();
        let refname = format!("refs/heads/{short_name}");
        let obj = repo.revparse_single(&refname)?;
        repo.checkout_tree(&obj, None)?;
        repo.set_head(&refname)?;
        Ok(())
    }

    /// Resolves the head commit and tree of local branch `short_name`.
    pub fn branch_head_tree(&self, short_name: &str) -> Result<(Oid, Vec<u8>)> {
        let repo = self.guard();
        let branch = repo.find_branch(short_name, BranchType::Local)?;
        let commit = branch
            .get()
            .peel_to_commit()
            .map_err(|_| Error::Setup(format!("branch {short_name} has no commits")))?;
        let tree = commit.tree()?;
        Ok((commit.id(), tree.id().as_bytes().to_vec()))
    }

    /// Reads a single blob at `path` from the tree rooted at `tree_oid`.
    pub fn read_tree_entry(&self, tree_oid: Oid, path: &str) -> Result<Option<Vec<u8>>> {
        let repo = self.guard();
        let tree = repo.find_tree(tree_oid)?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) => {
                let obj = entry.to_object(&repo)?;
                match obj.as_blob() {
                    Some(blob) => Ok(Some(blob.content().to_vec())),
                    None => Ok(None),
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Walks every blob under `prefix` in the tree rooted at `tree_oid`,
    /// returning `(relative_path, content)` pairs.
    pub fn walk_tree_blobs(&self, tree_oid: Oid, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let repo = self.guard();
        let tree = repo.find_tree(tree_oid)?;
        let root: Tree<'_> = if prefix.is_empty() {
            tree
        } else {
            match tree.get_path(Path::new(prefix)) {
                Ok(entry) => entry.to_object(&repo)?.peel_to_tree()?,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        };

        let mut out = Vec::new();
        let mut stack = vec![(PathBuf::new(), root)];
        while let Some((base, tree)) = stack.pop() {
            for entry in tree.iter() {
                let name = entry.name().unwrap_or_default();
                let rel = base.join(name);
                let obj = entry.to_object(&repo)?;
                if let Some(blob) = obj.as_blob() {
                    out.push((rel.to_string_lossy().into_owned(), blob.content().to_vec()));
                } else if let Some(subtree) = obj.as_tree() {
                    stack.push((rel, subtree.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Writes `content` to `relative_path` under the working tree and
    /// stages it.
    pub fn write_and_stage(&self, relative_path: &str, content: &[u8]) -> Result<()> {
        let repo = self.guard();
        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::Setup("repository has no working directory".into()))?;
        let full = workdir.join(relative_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, content)?;
        let mut index = repo.index()?;
        index.add_path(Path::new(relative_path))?;
        index.write()?;
        Ok(())
    }

    /// Stages every path matching `<prefix>/*` already present on disk.
    pub fn stage_glob(&self, prefix: &str) -> Result<()> {
        let repo = self.guard();
        let mut index = repo.index()?;
        index.add_all([format!("{prefix}/*")].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    /// True if the current index tree differs from HEAD's tree.
    pub fn index_differs_from_head(&self) -> Result<bool> {
        let repo = self.guard();
        let mut index = repo.index()?;
        let index_tree = repo.find_tree(index.write_tree()?)?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        match head_tree {
            Some(head_tree) => Ok(head_tree.id() != index_tree.id()),
            None => Ok(true),
        }
    }

    /// Commits the current index onto HEAD with `message`, updating the
    /// checked-out branch. Returns the new commit id.
    pub fn commit_index(&self, message: &str, author: &str, email: &str) -> Result<Oid> {
        let repo = self.guard();
        let mut index = repo.index()?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let signature = Signature::now(author, email)?;
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit()?],
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parent_refs)?;
        Ok(oid)
    }

    /// Fetches every ref from `remote`.
    pub fn fetch_all(&self, remote: &str) -> Result<()> {
        let repo = self.guard();
        let mut git_remote = repo.find_remote(remote)?;
        let callbacks = RemoteCallbacks::new();
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(callbacks);
        git_remote.fetch::<&str>(&[], Some(&mut opts), None)?;
        Ok(())
    }

    /// Merges the upstream of the checked-out branch into it, if it has one.
    pub fn merge_upstream_into_head(&self) -> Result<()> {
        let repo = self.guard();
        let head = repo.head()?;
        let head_name = head
            .shorthand()
            .ok_or_else(|| Error::Setup("HEAD has no shorthand name".into()))?
            .to_string();
        let local_branch = repo.find_branch(&head_name, BranchType::Local)?;
        let upstream = local_branch.upstream()?;
        let upstream_oid = upstream
            .get()
            .target()
            .ok_or_else(|| Error::Setup(format!("upstream of {head_name} has no target")))?;
        let annotated = repo.find_annotated_commit(upstream_oid)?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if analysis.is_fast_forward() {
            let mut reference = repo.find_reference(&format!("refs/heads/{head_name}"))?;
            reference.set_target(upstream_oid, "binsync: fast-forward pull")?;
            repo.set_head(&format!("refs/heads/{head_name}"))?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
            return Ok(());
        }
        // Non-fast-forward divergence: skip rather than attempt an
        // automatic merge commit. Annotation trees have no engine-level
        // merge driver (cross-branch merging is an explicit non-goal),
        // so a true divergence on a single user's own branch is left for
        // the next successful fast-forward pull.
        debug!(branch = %head_name, "skipping non-fast-forward merge during pull");
        Ok(())
    }

    /// Pushes `refs/heads/<short_name>` to `remote`.
    pub fn push_branch(&self, remote: &str, short_name: &str) -> Result<()> {
        let repo = self.guard();
        let mut git_remote = repo.find_remote(remote)?;
        let refspec = format!("refs/heads/{short_name}:refs/heads/{short_name}");
        let callbacks = RemoteCallbacks::new();
        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        git_remote.push(&[refspec], Some(&mut opts))?;
        Ok(())
    }

    /// True if `remote` is configured on this repository.
    pub fn has_remote(&self, remote: &str) -> Result<bool> {
        let repo = self.guard();
        let x = Ok(repo.find_remote(remote).is_ok());
        x
    }

    /// Resolves the tree id of the commit `oid` points to.
    pub fn commit_tree(&self, oid: Oid) -> Result<Oid> {
        let repo = self.guard();
        let commit = repo.find_commit(oid)?;
        let x = Ok(commit.tree()?.id());
        x
    }

    /// Returns the authored-date (seconds since epoch) of the commit `oid` points to.
    pub fn authored_date(&self, oid: Oid) -> Result<i64> {
        let repo = self.guard();
        let commit = repo.find_commit(oid)?;
        let x = Ok(commit.author().when().seconds());
        x
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_empty_repository() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        assert!(Repo::is_repository(repo.path()));
    }

    #[test]
    fn write_stage_commit_roundtrip() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        repo.write_and_stage(GITIGNORE_PATH, GITIGNORE_CONTENTS.as_bytes()).unwrap();
        repo.write_and_stage(BINARY_HASH_PATH, b"aa").unwrap();
        assert!(repo.index_differs_from_head().unwrap());

        let oid = repo.commit_index("Root commit", "binsync", "binsync@local").unwrap();
        assert!(!repo.index_differs_from_head().unwrap());

        let date = repo.authored_date(oid).unwrap();
        assert!(date > 0);
    }

    #[test]
    fn read_tree_entry_finds_committed_blob() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        repo.write_and_stage(BINARY_HASH_PATH, b"aa").unwrap();
        repo.commit_index("Root commit", "binsync", "binsync@local").unwrap();

        let repo_raw = Repository::open(dir.path()).unwrap();
        let tree_oid = repo_raw.head().unwrap().peel_to_tree().unwrap().id();
        drop(repo_raw);

        let content = repo.read_tree_entry(tree_oid, BINARY_HASH_PATH).unwrap();
        assert_eq!(content, Some(b"aa".to_vec()));
        assert_eq!(repo.read_tree_entry(tree_oid, "missing").unwrap(), None);
    }

    #[test]
    fn walk_tree_blobs_collects_nested_files_under_prefix() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        repo.write_and_stage("alice/metadata.toml", b"user = \"alice\"").unwrap();
        repo.write_and_stage("alice/notes/extra.toml", b"k = 1").unwrap();
        repo.write_and_stage(BINARY_HASH_PATH, b"aa").unwrap();
        repo.commit_index("Root commit", "binsync", "binsync@local").unwrap();

        let repo_raw = Repository::open(dir.path()).unwrap();
        let tree_oid = repo_raw.head().unwrap().peel_to_tree().unwrap().id();
        drop(repo_raw);

        let mut blobs = repo.walk_tree_blobs(tree_oid, "alice").unwrap();
        blobs.sort_by(|a, b| a.0.cmp(&b.0));
        let paths: Vec<&str> = blobs.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["metadata.toml", "notes/extra.toml"]);
        assert!(repo.walk_tree_blobs(tree_oid, "nobody").unwrap().is_empty());
    }

    #[test]
    fn env_overlay_restores_prior_environment() {
        std::env::set_var("BINSYNC_TEST_OVERLAY_VAR", "before");
        {
            let overlay = HashMap::from([("BINSYNC_TEST_OVERLAY_VAR".to_string(), "after".to_string())]);
            let _guard = EnvOverlayGuard::enter(&overlay);
            assert_eq!(std::env::var("BINSYNC_TEST_OVERLAY_VAR").unwrap(), "after");
        }
        assert_eq!(std::env::var("BINSYNC_TEST_OVERLAY_VAR").unwrap(), "before");
        std::env::remove_var("BINSYNC_TEST_OVERLAY_VAR");
    }
}
