//! Publishing generated artifacts to their destination.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use footprint_storage::ArtifactStore;
use serde::Serialize;
use tracing::info;

pub const MANIFEST_FILE: &str = "manifest.json";

/// A generated file, addressed relative to the publish root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub relative_path: PathBuf,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(relative_path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            relative_path: relative_path.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedFile {
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
    /// Destination already held these bytes.
    pub unchanged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub message: String,
    pub published_at: DateTime<Utc>,
    pub files: Vec<PublishedFile>,
    pub dry_run: bool,
}

impl PublishReceipt {
    /// What publishing `artifacts` would produce, without writing anything.
    pub fn preview(artifacts: &[Artifact], message: &str) -> Self {
        Self {
            message: message.to_string(),
            published_at: Utc::now(),
            files: artifacts
                .iter()
                .map(|a| PublishedFile {
                    path: a.relative_path.display().to_string(),
                    sha256: ArtifactStore::sha256_hex(&a.bytes),
                    bytes: a.bytes.len(),
                    unchanged: false,
                })
                .collect(),
            dry_run: true,
        }
    }
}

/// Commits a set of artifacts to a destination as one publish.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, artifacts: &[Artifact], message: &str) -> Result<PublishReceipt>;
}

fn is_contained(path: &Path) -> bool {
    path.components().count() > 0
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Writes artifacts under a local directory, each through temp file and
/// rename. The manifest goes last, so it only ever lists complete files.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    store: ArtifactStore,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: ArtifactStore::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, artifacts: &[Artifact], message: &str) -> Result<PublishReceipt> {
        if let Some(bad) = artifacts.iter().find(|a| !is_contained(&a.relative_path)) {
            bail!(
                "artifact path {} escapes the publish root",
                bad.relative_path.display()
            );
        }

        let mut files = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let stored = self
                .store
                .write_atomic(&artifact.relative_path, &artifact.bytes)
                .await
                .with_context(|| format!("publishing {}", artifact.relative_path.display()))?;
            files.push(PublishedFile {
                path: stored.relative_path.display().to_string(),
                sha256: stored.content_hash,
                bytes: stored.byte_size,
                unchanged: stored.unchanged,
            });
        }

        let receipt = PublishReceipt {
            message: message.to_string(),
            published_at: Utc::now(),
            files,
            dry_run: false,
        };
        let manifest =
            serde_json::to_vec_pretty(&receipt).context("serializing publish manifest")?;
        self.store
            .write_atomic(MANIFEST_FILE, &manifest)
            .await
            .context("writing publish manifest")?;
        info!(
            root = %self.root().display(),
            files = receipt.files.len(),
            "published artifacts"
        );
        Ok(receipt)
    }
}
