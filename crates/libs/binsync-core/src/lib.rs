//! # binsync-core
//!
//! The repository client that synchronizes reverse-engineering annotations
//! across analysts: a single-writer, many-reader coordinator serializing
//! repository mutations through an in-process scheduler, caching derived
//! views keyed by branch-head identifiers, enforcing the `binsync/__root__`
//! / `binsync/<username>` branch topology, and reconciling with a remote
//! over an authenticated transport.
//!
//! ## Key modules
//!
//! - [`client`]: the coordinator — attach/initialize, `commit_state`,
//!   `get_state`, `users`, `pull`, `push`, `update`.
//! - [`scheduler`]: the single-worker, priority-ordered job queue every
//!   atomic operation is routed through.
//! - [`cache`]: the state and users caches, invalidated by branch-head
//!   movement.
//! - [`repo`]: the synchronous `git2` façade the client drives.
//! - [`auth`]: the SSH-agent environment overlay for remote operations.
//! - [`state`]: the host-application contract (`StateHandle`, `User`) plus
//!   a TOML-backed reference implementation used by this crate's own tests.
//!
//! ## Example
//!
//! ```no_run
//! use binsync_core::client::{AttachOptions, Client};
//! use binsync_core::auth::AuthHints;
//! use binsync_core::state::toml_state::TomlState;
//!
//! fn example() -> binsync_core::Result<()> {
//!     let client = Client::<TomlState>::attach(AttachOptions {
//!         master_user: "alice".to_string(),
//!         repo_root: Some("/tmp/binsync-demo".into()),
//!         binary_hash: "deadbeef".to_string(),
//!         remote_url: None,
//!         init: true,
//!         remote_name: "origin".to_string(),
//!         auth_hints: AuthHints::default(),
//!     })?;
//!     println!("attached as {}", client.master_user());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod error;
pub mod lock;
pub mod repo;
pub mod scheduler;
pub mod state;

pub use client::{AttachOptions, Client, ConnectionWarning};
pub use error::{Error, Result};
