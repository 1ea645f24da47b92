//! Error types for the binsync repository client.
//!
//! Errors are categorized into:
//!
//! - **External errors**: wrapped errors from dependencies (`git2`, `toml`, `io`)
//! - **Attach-time errors**: construction-time failures that abort `Client::attach`
//! - **Runtime errors**: authorization and host-interface failures raised from
//!   the public atomic API
//!
//! Transient VCS/network failures encountered inside `pull`/`push` are never
//! surfaced as this error type: they are logged at debug level and swallowed,
//! per the propagation policy.

use thiserror::Error;

/// The error type for binsync-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Git repository error, surfaced from the underlying `git2` library.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// Standard I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error, raised while parsing `metadata.toml`.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A username violates the naming invariants (§3): it ends with the path
    /// separator, or contains the literal substring `__root__`.
    #[error("bad username: {0:?}")]
    BadUsername(String),

    /// The repository opened or cloned for attach lacks a
    /// `binsync/__root__` branch.
    #[error("not a binsync repository: missing {0} branch")]
    NotABinsyncRepo(String),

    /// `init` was requested over a repository that is already a compatible
    /// binsync repository.
    #[error("repository already initialized at {0}")]
    AlreadyInitialized(String),

    /// Another `Client` holds the process-wide advisory lock on this
    /// repository.
    #[error(
        "lock contention on {path}: another binsync client is already attached; \
         if the previous client crashed, delete {path}"
    )]
    LockContention { path: String },

    /// `commit_state` was called with a state owned by a user other than
    /// the master user of this `Client`.
    #[error("user {master_user} is not allowed to commit state owned by {state_user}")]
    ExternalUserCommit {
        master_user: String,
        state_user: String,
    },

    /// No branch exists for the requested user.
    #[error("no such user {0:?} in repository")]
    NoSuchUser(String),

    /// The host's state module could not locate `metadata.toml` at the
    /// requested tree.
    #[error("metadata not found for user {0:?}")]
    MetadataNotFound(String),

    /// Generic construction or setup failure with a free-form message,
    /// covering repository-setup and clone edge cases that don't warrant
    /// their own variant.
    #[error("{0}")]
    Setup(String),
}

/// A specialized [`Result`] type for binsync-core operations.
pub type Result<T> = core::result::Result<T, Error>;
