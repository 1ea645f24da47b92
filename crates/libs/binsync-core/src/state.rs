//! Host-application interface (§6): the contracts `Client` delegates
//! annotation-schema concerns to, plus a TOML-backed reference
//! implementation used by this crate's own tests so the engine is
//! exercisable without a real host application.

use std::sync::Arc;

use git2::Oid;

use crate::error::{Error, Result};
use crate::repo::Repo;

/// A read-only handle a `StateHandle::parse` implementation can use to
/// pull additional blobs out of the tree it was handed. Modeled as a
/// borrowed reference bounded by the parse call (§9 — no ownership flows
/// back to the state module). Paths are resolved relative to the
/// `<username>/` prefix the loader was scoped to at construction, mirroring
/// `dump`'s `workdir_relative_prefix`.
pub struct BlobLoader<'a> {
    repo: &'a Repo,
    tree: Oid,
    prefix: String,
}

impl<'a> BlobLoader<'a> {
    pub fn new(repo: &'a Repo, tree: Oid, prefix: impl Into<String>) -> Self {
        Self { repo, tree, prefix: prefix.into() }
    }

    /// Reads an arbitrary blob by path, relative to this loader's prefix.
    pub fn load_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = format!("{}/{path}", self.prefix);
        self.repo.read_tree_entry(self.tree, &full)
    }

    /// Loads and parses `filename` relative to this loader's prefix as
    /// TOML, matching the `TOML loader` host contract in §6.
    pub fn load_toml_from_file(&self, filename: &str) -> Result<toml::Value> {
        let bytes = self
            .load_file(filename)?
            .ok_or_else(|| Error::MetadataNotFound(filename.to_string()))?;
        let text = String::from_utf8_lossy(&bytes);
        let value: toml::Value = toml::from_str(&text)?;
        Ok(value)
    }
}

/// A value derived from `metadata.toml` at the head of a user branch
/// (§3). Carries at least the username and enough identity to render in
/// a host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub display_name: Option<String>,
}

impl User {
    /// Host-application `User module` contract: `from_metadata`.
    pub fn from_metadata(username: &str, metadata: &toml::Value) -> Self {
        let display_name = metadata
            .get("display_name")
            .and_then(toml::Value::as_str)
            .map(str::to_string);
        Self {
            username: username.to_string(),
            display_name,
        }
    }
}

/// The opaque per-user annotation snapshot contract (§3, §6). The engine
/// only ever inspects `user()` (for authorization) and `dirty()` (for
/// commit elision) — everything else is implementation-defined by the
/// host application's state module.
pub trait StateHandle: Sized {
    /// Parses this state from `tree`, optionally pinned to a historical
    /// `version` identifier, using `loader` for any additional blob reads.
    fn parse(tree: Oid, version: Option<&str>, loader: &BlobLoader<'_>) -> Result<Self>;

    /// Serializes pending changes into the working-tree index rooted at
    /// `workdir_relative_prefix` (the `<username>/` directory).
    fn dump(&self, repo: &Repo, workdir_relative_prefix: &str) -> Result<()>;

    fn user(&self) -> &str;
    fn dirty(&self) -> bool;
    fn clear_dirty(&mut self);

    /// Synthesizes an empty state owned by `user`, used by `get_state`
    /// when `parse` reports no metadata and the requester is the master
    /// user (first-time-ever case, §4.4.3).
    fn empty(user: &str) -> Self;
}

/// Reference `StateHandle` implementation backed by a flat TOML document
/// at `<username>/metadata.toml`, used by this crate's own test suite.
pub mod toml_state {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct TomlState {
        pub user: String,
        pub payload: toml::Value,
        dirty: bool,
    }

    impl TomlState {
        pub fn new(user: impl Into<String>, payload: toml::Value) -> Self {
            Self {
                user: user.into(),
                payload,
                dirty: true,
            }
        }

        pub fn new_empty(user: impl Into<String>) -> Self {
            Self::new(user, toml::Value::Table(toml::value::Table::new()))
        }
    }

    impl StateHandle for TomlState {
        fn parse(tree: Oid, _version: Option<&str>, loader: &BlobLoader<'_>) -> Result<Self> {
            let value = loader.load_toml_from_file("metadata.toml")?;
            let user = value
                .get("user")
                .and_then(toml::Value::as_str)
                .ok_or_else(|| Error::MetadataNotFound("metadata.toml".to_string()))?
                .to_string();
            let _ = tree;
            Ok(Self {
                user,
                payload: value,
                dirty: false,
            })
        }

        fn dump(&self, repo: &Repo, workdir_relative_prefix: &str) -> Result<()> {
            let mut table = self
                .payload
                .as_table()
                .cloned()
                .unwrap_or_default();
            table.insert("user".to_string(), toml::Value::String(self.user.clone()));
            let doc = toml::Value::Table(table);
            let text = toml::to_string_pretty(&doc)
                .map_err(|e| Error::Setup(format!("failed to serialize state: {e}")))?;
            let path = format!("{workdir_relative_prefix}/metadata.toml");
            repo.write_and_stage(&path, text.as_bytes())
        }

        fn user(&self) -> &str {
            &self.user
        }

        fn dirty(&self) -> bool {
            self.dirty
        }

        fn clear_dirty(&mut self) {
            self.dirty = false;
        }

        fn empty(user: &str) -> Self {
            Self::new_empty(user)
        }
    }
}

/// Convenience alias for the `Arc`-shared value `cache::CachedState`
/// stores and `get_state` hands back to callers.
pub type SharedState<S> = Arc<S>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn user_from_metadata_falls_back_to_no_display_name() {
        let metadata: toml::Value = toml::from_str("user = \"alice\"").unwrap();
        let user = User::from_metadata("alice", &metadata);
        assert_eq!(user.username, "alice");
        assert_eq!(user.display_name, None);
    }
}
