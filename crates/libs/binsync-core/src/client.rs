//! The coordinator: owns the repository adapter, cache, scheduler, and
//! process-level file lock, and implements the public atomic API
//! (§4.4), the attach/initialize algorithm (§4.4.1), and branch-topology
//! policy (§4.4.6).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use git2::Oid;
use tracing::debug;

use crate::auth::{build_env_overlay, AuthHints};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::lock::RepoLock;
use crate::repo::{BranchRef, EnvOverlayGuard, Repo, BINARY_HASH_PATH, GITIGNORE_CONTENTS, GITIGNORE_PATH};
use crate::scheduler::{Priority, Scheduler};
use crate::state::{BlobLoader, StateHandle, User};

pub const ROOT_BRANCH: &str = "binsync/__root__";

pub fn user_branch(username: &str) -> String {
    format!("binsync/{username}")
}

/// Non-fatal condition recorded at attach time (§3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionWarning {
    HashMismatch,
}

/// Validates a username against the naming invariants in §3: must not
/// end with the path separator, must not contain the literal substring
/// `__root__`.
pub fn validate_username(username: &str) -> Result<()> {
    if username.ends_with(std::path::MAIN_SEPARATOR) || username.ends_with('/') {
        return Err(Error::BadUsername(username.to_string()));
    }
    if username.contains("__root__") {
        return Err(Error::BadUsername(username.to_string()));
    }
    Ok(())
}

/// Inputs to [`Client::attach`] (§4.4.1).
pub struct AttachOptions {
    pub master_user: String,
    pub repo_root: Option<PathBuf>,
    pub binary_hash: String,
    pub remote_url: Option<String>,
    pub init: bool,
    pub remote_name: String,
    pub auth_hints: AuthHints,
}

/// Best-ref selection (§4.4.6): among references for the same user,
/// prefer local over remote, then among remotes prefer `remote`.
pub fn best_ref_for_user<'a>(
    branches: &'a [BranchRef],
    username: &str,
    remote: &str,
) -> Option<&'a BranchRef> {
    let short = user_branch(username);
    let mut candidates: Vec<&BranchRef> = branches.iter().filter(|b| b.short_name == short).collect();
    candidates.sort_by_key(|b| {
        let local_rank = if b.is_remote { 1 } else { 0 };
        let remote_rank = if b.remote_name.as_deref() == Some(remote) { 0 } else { 1 };
        (local_rank, remote_rank)
    });
    candidates.into_iter().next()
}

/// Current-tree-for-user (§4.4.6): the single reference with the newest
/// authored date on its head commit, ties broken by encounter order.
pub fn current_tree_for_user<'a>(
    branches: &'a [BranchRef],
    username: &str,
    repo: &Repo,
) -> Result<Option<&'a BranchRef>> {
    let short = user_branch(username);
    let mut best: Option<(&BranchRef, i64)> = None;
    for b in branches.iter().filter(|b| b.short_name == short) {
        let date = repo.authored_date(b.target)?;
        match &best {
            Some((_, best_date)) if *best_date >= date => {}
            _ => best = Some((b, date)),
        }
    }
    Ok(best.map(|(b, _)| b))
}

struct Timestamps {
    last_push: Option<i64>,
    last_pull: Option<i64>,
    last_commit: Option<i64>,
}

/// The repository client (§2 item 4, §4.4).
pub struct Client<S: StateHandle> {
    master_user: String,
    remote: String,
    repo: Repo,
    scheduler: Scheduler,
    cache: Cache<S>,
    auth_hints: AuthHints,
    _lock: RepoLock,
    connection_warnings: Mutex<Vec<ConnectionWarning>>,
    timestamps: Mutex<Timestamps>,
}

impl<S> Client<S>
where
    S: StateHandle + Send + Sync + 'static,
{
    /// Attach to (or initialize) a repository per the resolution policy
    /// in §4.4.1.
    pub fn attach(opts: AttachOptions) -> Result<Self> {
        validate_username(&opts.master_user)?;

        let repo_root = resolve_repo_root(&opts)?;
        let repo = open_or_initialize(&opts, &repo_root)?;

        let mut warnings = Vec::new();
        if let Some(stored) = read_binary_hash(&repo)? {
            if stored != opts.binary_hash {
                warnings.push(ConnectionWarning::HashMismatch);
            }
        }

        let lock = RepoLock::acquire(&repo_root)?;

        ensure_user_branch(&repo, &opts.master_user, &opts.remote_name)?;
        repo.checkout_branch(&user_branch(&opts.master_user))?;

        let mut scheduler = Scheduler::new();
        scheduler.start_worker_thread();

        Ok(Self {
            master_user: opts.master_user,
            remote: opts.remote_name,
            repo,
            scheduler,
            cache: Cache::new(),
            auth_hints: opts.auth_hints,
            _lock: lock,
            connection_warnings: Mutex::new(warnings),
            timestamps: Mutex::new(Timestamps {
                last_push: None,
                last_pull: None,
                last_commit: None,
            }),
        })
    }

    pub fn master_user(&self) -> &str {
        &self.master_user
    }

    pub fn connection_warnings(&self) -> Vec<ConnectionWarning> {
        self.connection_warnings.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn last_push_ts(&self) -> Option<i64> {
        self.timestamps.lock().unwrap_or_else(|p| p.into_inner()).last_push
    }

    pub fn last_pull_ts(&self) -> Option<i64> {
        self.timestamps.lock().unwrap_or_else(|p| p.into_inner()).last_pull
    }

    pub fn last_commit_ts(&self) -> Option<i64> {
        self.timestamps.lock().unwrap_or_else(|p| p.into_inner()).last_commit
    }

    /// `commit_state` (§4.4.2): atomic, not cached. Takes ownership of
    /// `state` for the duration of the call and hands it back so the
    /// host's copy reflects the cleared dirty flag (or the error, on a
    /// rejected external-user commit).
    pub fn commit_state(&self, state: S, msg: &str) -> Result<S> {
        if state.user() != self.master_user {
            return Err(Error::ExternalUserCommit {
                master_user: self.master_user.clone(),
                state_user: state.user().to_string(),
            });
        }

        let repo = self.repo.clone();
        let master_user = self.master_user.clone();
        let branch = user_branch(&master_user);
        let msg = msg.to_string();

        let (committed, state) = self.scheduler.schedule_and_wait(Priority::Fast, move || {
            let mut state = state;
            let outcome = commit_dirty_state(&repo, &branch, &master_user, &mut state, &msg);
            match outcome {
                Ok(true) => state.clear_dirty(),
                Ok(false) => {}
                Err(ref e) => {
                    debug!(error = %e, "commit_state: internal commit failure swallowed, state remains dirty");
                }
            }
            (outcome.unwrap_or(false), state)
        });

        if committed {
            let mut ts = self.timestamps.lock().unwrap_or_else(|p| p.into_inner());
            ts.last_commit = Some(Utc::now().timestamp());
            drop(ts);
            self.refresh_caches()?;
        }

        Ok(state)
    }

    /// `get_state` (§4.4.3): atomic, cached by `(user, version)`.
    pub fn get_state(&self, user: Option<&str>, version: Option<&str>) -> Result<Arc<S>> {
        let user = user.unwrap_or(&self.master_user).to_string();

        if let Some(hit) = self.cache.states.get(&user, version) {
            return Ok(hit);
        }

        let repo = self.repo.clone();
        let remote = self.remote.clone();
        let master_user = self.master_user.clone();
        let user_for_job = user.clone();
        let version_owned = version.map(str::to_string);

        let result: Result<(Oid, S)> = self.scheduler.schedule_and_wait(Priority::Fast, move || {
            let branches = repo.list_binsync_branches()?;
            let branch_ref = best_ref_for_user(&branches, &user_for_job, &remote)
                .ok_or_else(|| Error::NoSuchUser(user_for_job.clone()))?;
            let head = branch_ref.target;
            let tree_oid = repo.commit_tree(head)?;
            let loader = BlobLoader::new(&repo, tree_oid, user_for_job.clone());
            match S::parse(tree_oid, version_owned.as_deref(), &loader) {
                Ok(state) => Ok((head, state)),
                Err(Error::MetadataNotFound(_)) if user_for_job == master_user => {
                    Ok((head, S::empty(&user_for_job)))
                }
                Err(e) => Err(e),
            }
        });

        let (head, state) = result?;
        let state = Arc::new(state);
        self.cache.states.set(&user, version, head, Arc::clone(&state));
        Ok(state)
    }

    /// `users` (§4.4.3 table, enumerate participating users): atomic, cached.
    pub fn users(&self) -> Result<Arc<Vec<User>>> {
        if let Some(hit) = self.cache.users.get() {
            return Ok(hit);
        }

        let repo = self.repo.clone();

        let result: Result<(HashSet<String>, Vec<User>)> =
            self.scheduler.schedule_and_wait(Priority::Fast, move || {
                let branches = repo.list_binsync_branches()?;
                let names: HashSet<String> = branches
                    .iter()
                    .filter(|b| b.short_name != ROOT_BRANCH)
                    .map(|b| b.short_name.clone())
                    .collect();

                let mut users = Vec::new();
                for name in &names {
                    let username = name.trim_start_matches("binsync/").to_string();
                    let target = branches
                        .iter()
                        .filter(|b| &b.short_name == name)
                        .min_by_key(|b| if b.is_remote { 1 } else { 0 })
                        .map(|b| b.target);
                    let Some(target) = target else { continue };
                    let tree_oid = repo.commit_tree(target)?;
                    let loader = BlobLoader::new(&repo, tree_oid, username.clone());
                    match loader.load_toml_from_file("metadata.toml") {
                        Ok(metadata) => users.push(User::from_metadata(&username, &metadata)),
                        Err(_) => users.push(User { username, display_name: None }),
                    }
                }
                Ok((names, users))
            });

        let (names, users) = result?;
        let users = Arc::new(users);
        self.cache.users.set(names, Arc::clone(&users));
        Ok(users)
    }

    /// `has_remote` (§4.4, §9): atomic, never cached (open question resolved
    /// in favor of "always scheduler-evaluated").
    pub fn has_remote(&self) -> Result<bool> {
        let repo = self.repo.clone();
        let remote = self.remote.clone();
        self.scheduler
            .schedule_and_wait(Priority::Fast, move || repo.has_remote(&remote))
    }

    /// `pull` (§4.4.4): atomic, not cached, invalidates the cache on success.
    pub fn pull(&self) -> Result<()> {
        // Absent auth hints, build_env_overlay already yields an empty map
        // (§4.5): proceed with it rather than failing.
        let overlay = build_env_overlay(&self.auth_hints);

        let repo = self.repo.clone();
        let remote = self.remote.clone();
        let master_user = self.master_user.clone();

        let pulled: Result<()> = self.scheduler.schedule_and_wait(Priority::Slow, move || {
            let _env = EnvOverlayGuard::enter(&overlay);

            localize_remote_branches(&repo, &remote)?;
            repo.checkout_branch(ROOT_BRANCH)?;

            if let Err(e) = repo.fetch_all(&remote) {
                debug!(error = %e, "pull: fetch failed, will retry on next update");
                return Ok(());
            }

            let branches = repo.list_binsync_branches()?;
            for b in &branches {
                if b.is_remote || b.short_name.contains("HEAD") {
                    continue;
                }
                if let Err(e) = repo.checkout_branch(&b.short_name) {
                    debug!(branch = %b.short_name, error = %e, "pull: checkout failed");
                    continue;
                }
                if let Err(e) = repo.merge_upstream_into_head() {
                    debug!(branch = %b.short_name, error = %e, "pull: merge failed");
                }
            }
            repo.checkout_branch(&user_branch(&master_user))?;
            Ok(())
        });

        pulled?;

        {
            let mut ts = self.timestamps.lock().unwrap_or_else(|p| p.into_inner());
            ts.last_pull = Some(Utc::now().timestamp());
        }
        self.refresh_caches()?;
        Ok(())
    }

    /// `push` (§4.4.5): atomic, not cached.
    pub fn push(&self) -> Result<()> {
        let overlay = build_env_overlay(&self.auth_hints);
        let repo = self.repo.clone();
        let remote = self.remote.clone();
        let master_user = self.master_user.clone();

        let pushed: Result<()> = self.scheduler.schedule_and_wait(Priority::Average, move || {
            repo.checkout_branch(&user_branch(&master_user))?;
            let _env = EnvOverlayGuard::enter(&overlay);
            if let Err(e) = repo.push_branch(&remote, ROOT_BRANCH) {
                debug!(error = %e, "push: root branch push failed, will retry on next update");
                return Ok(());
            }
            if let Err(e) = repo.push_branch(&remote, &user_branch(&master_user)) {
                debug!(error = %e, "push: user branch push failed, will retry on next update");
                return Ok(());
            }
            Ok(())
        });

        pushed?;
        let mut ts = self.timestamps.lock().unwrap_or_else(|p| p.into_inner());
        ts.last_push = Some(Utc::now().timestamp());
        Ok(())
    }

    /// `update(state, msg)` (§4.4): not atomic itself, composes commit-if-dirty,
    /// pull, push. Returns the (possibly dirty-cleared) state back to the host.
    pub fn update(&self, state: S, msg: &str) -> Result<S> {
        let state = if state.dirty() {
            self.commit_state(state, msg)?
        } else {
            state
        };
        self.pull()?;
        self.push()?;
        Ok(state)
    }

    /// `close` (§4.4): releases the repository handle and the file lock.
    /// Consuming `self` drops the scheduler (joining its worker) and the
    /// lock guard, in that order.
    pub fn close(self) {
        drop(self);
    }

    /// Cache-invalidation sweep (§4.1, §4.4.4): recompute `(branch -> head)`
    /// across user branches and the user-branch name set, submit both to
    /// their caches.
    fn refresh_caches(&self) -> Result<()> {
        let repo = self.repo.clone();
        let heads: Result<(std::collections::HashMap<String, Oid>, HashSet<String>)> =
            self.scheduler.schedule_and_wait(Priority::Fast, move || {
                let branches = repo.list_binsync_branches()?;
                let mut heads = std::collections::HashMap::new();
                let mut names = HashSet::new();
                for b in branches.iter().filter(|b| !b.is_remote && b.short_name != ROOT_BRANCH) {
                    heads.insert(b.short_name.clone(), b.target);
                    names.insert(b.short_name.clone());
                }
                Ok((heads, names))
            });
        let (heads, names) = heads?;
        self.cache.states.update_state_commits(heads);
        self.cache.users.update_user_branches(names);
        Ok(())
    }
}

fn commit_dirty_state(
    repo: &Repo,
    branch: &str,
    master_user: &str,
    state: &mut impl StateHandle,
    msg: &str,
) -> Result<bool> {
    repo.checkout_branch(branch)?;
    state.dump(repo, master_user)?;
    repo.stage_glob(master_user)?;
    if !repo.index_differs_from_head()? {
        return Ok(false);
    }
    let email = format!("{master_user}@binsync.local");
    repo.commit_index(msg, master_user, &email)?;
    Ok(true)
}

fn resolve_repo_root(opts: &AttachOptions) -> Result<PathBuf> {
    if let Some(root) = &opts.repo_root {
        if !root.as_os_str().is_empty() {
            return Ok(root.clone());
        }
    }
    let url = opts
        .remote_url
        .as_ref()
        .ok_or_else(|| Error::Setup("repo_root is empty and no remote_url was supplied".into()))?;
    let last_segment = url.rsplit('/').next().unwrap_or(url);
    let stripped = last_segment.strip_suffix(".git").unwrap_or(last_segment);
    Ok(PathBuf::from(stripped))
}

fn open_or_initialize(opts: &AttachOptions, repo_root: &Path) -> Result<Repo> {
    if let Some(url) = &opts.remote_url {
        let repo = Repo::clone_remote(url, repo_root)?;
        let has_root = repo.has_local_branch(ROOT_BRANCH)?;
        if opts.init {
            if has_root {
                return Err(Error::AlreadyInitialized(repo_root.display().to_string()));
            }
            setup_repo(&repo, &opts.binary_hash)?;
        } else if !has_root {
            let tracked = repo
                .find_remote_branch(&opts.remote_name, ROOT_BRANCH)?
                .is_some();
            if tracked {
                repo.create_tracking_branch(&opts.remote_name, ROOT_BRANCH)?;
            } else {
                return Err(Error::NotABinsyncRepo(ROOT_BRANCH.to_string()));
            }
        }
        return Ok(repo);
    }

    if Repo::is_repository(repo_root) {
        if opts.init {
            return Err(Error::AlreadyInitialized(repo_root.display().to_string()));
        }
        let repo = Repo::open(repo_root)?;
        if !repo.has_local_branch(ROOT_BRANCH)? {
            return Err(Error::NotABinsyncRepo(ROOT_BRANCH.to_string()));
        }
        return Ok(repo);
    }

    if opts.init {
        let repo = Repo::init(repo_root)?;
        setup_repo(&repo, &opts.binary_hash)?;
        return Ok(repo);
    }

    Err(Error::NotABinsyncRepo(ROOT_BRANCH.to_string()))
}

/// Setup procedure for a brand-new repository (§4.4.1).
fn setup_repo(repo: &Repo, binary_hash: &str) -> Result<()> {
    repo.write_and_stage(GITIGNORE_PATH, GITIGNORE_CONTENTS.as_bytes())?;
    repo.write_and_stage(BINARY_HASH_PATH, binary_hash.as_bytes())?;
    let oid = repo.commit_index("Root commit", "binsync", "binsync@binsync.local")?;
    repo.create_branch_at(ROOT_BRANCH, oid)?;
    Ok(())
}

fn read_binary_hash(repo: &Repo) -> Result<Option<String>> {
    let (_head, tree_bytes) = match repo.branch_head_tree(ROOT_BRANCH) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let tree_oid = Oid::from_bytes(&tree_bytes).map_err(Error::from)?;
    let content = repo.read_tree_entry(tree_oid, BINARY_HASH_PATH)?;
    Ok(content.map(|bytes| String::from_utf8_lossy(&bytes).trim_end().to_string()))
}

fn ensure_user_branch(repo: &Repo, username: &str, remote: &str) -> Result<()> {
    let branch = user_branch(username);
    if repo.has_local_branch(&branch)? {
        return Ok(());
    }
    if repo.find_remote_branch(remote, &branch)?.is_some() {
        repo.create_tracking_branch(remote, &branch)?;
        return Ok(());
    }
    let (root_head, _) = repo.branch_head_tree(ROOT_BRANCH)?;
    repo.create_branch_at(&branch, root_head)?;
    Ok(())
}

/// Localize-remote-branches (§4.4.6): create a local tracking branch for
/// every remote ref lacking a local counterpart. Per-branch failures are
/// non-fatal.
fn localize_remote_branches(repo: &Repo, remote: &str) -> Result<()> {
    let branches = repo.list_binsync_branches()?;
    for b in branches.iter().filter(|b| b.is_remote && b.remote_name.as_deref() == Some(remote)) {
        if b.short_name.contains("HEAD") {
            continue;
        }
        if repo.has_local_branch(&b.short_name).unwrap_or(true) {
            continue;
        }
        if let Err(e) = repo.create_tracking_branch(remote, &b.short_name) {
            debug!(branch = %b.short_name, error = %e, "localize_remote_branches: failed to create tracking branch");
        }
    }
    Ok(())
}
