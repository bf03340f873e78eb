use std::collections::BTreeSet;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::debug;

use super::paths::is_conflict_copy;
use super::tags::{TagSource, normalize_tag};
use super::vault::{LocalVault, VaultError};

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid ignore glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Derives the set of documents that currently carry a sync tag.
pub struct ScopeIndex {
    vault: Arc<dyn LocalVault>,
    tags: Arc<dyn TagSource>,
}

impl ScopeIndex {
    pub fn new(vault: Arc<dyn LocalVault>, tags: Arc<dyn TagSource>) -> Self {
        Self { vault, tags }
    }

    pub async fn compute_scope(
        &self,
        sync_tags: &BTreeSet<String>,
        ignore_globs: &[String],
    ) -> Result<BTreeSet<String>, ScopeError> {
        let mut scope = BTreeSet::new();
        if sync_tags.is_empty() {
            return Ok(scope);
        }
        let ignored = compile_globs(ignore_globs)?;
        for path in self.vault.list_documents().await? {
            if is_conflict_copy(&path) || ignored.is_match(&path) {
                continue;
            }
            let raw = match self.tags.tags(&path).await {
                Ok(raw) => raw,
                Err(VaultError::NotFound(_)) => {
                    debug!(path, "document vanished while scanning");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if raw.iter().any(|tag| sync_tags.contains(&normalize_tag(tag))) {
                scope.insert(path);
            }
        }
        Ok(scope)
    }
}

pub fn compile_globs(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}
