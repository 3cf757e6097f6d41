//! Configuration sources
//!
//! A source is polled by the refresh loop and reports the configuration objects
//! it currently holds. Each object is identified by a namespace/name pair and
//! carries a change marker; the store only reparses an object when its marker
//! moves.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Namespace/name pair identifying a configuration object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One configuration object as reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigObject {
    pub object: ObjectRef,
    /// Revision token; unchanged markers are not reparsed.
    pub change_marker: String,
    pub data: Vec<u8>,
    /// Objects without the enable marker are ignored.
    pub enabled: bool,
}

impl ConfigObject {
    /// Enabled object whose change marker is the SHA-256 of its content.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            object: ObjectRef::new(namespace, name),
            change_marker: sha256_hex(&data),
            data,
            enabled: true,
        }
    }
}

/// What a source reports on one poll
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub objects: Vec<ConfigObject>,
    /// Objects the source explicitly reports as deleted since the last poll.
    pub removed: Vec<ObjectRef>,
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<SourceUpdate>;
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// In-memory source whose objects are replaced by the embedding code
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    state: Mutex<StaticState>,
}

#[derive(Debug, Default)]
struct StaticState {
    objects: BTreeMap<ObjectRef, ConfigObject>,
    removed: Vec<ObjectRef>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object
    pub async fn upsert(&self, object: ConfigObject) {
        let mut state = self.state.lock().await;
        state.removed.retain(|removed| removed != &object.object);
        state.objects.insert(object.object.clone(), object);
    }

    /// Delete an object; the next poll reports it as removed
    pub async fn remove(&self, namespace: &str, name: &str) {
        let object = ObjectRef::new(namespace, name);
        let mut state = self.state.lock().await;
        if state.objects.remove(&object).is_some() {
            state.removed.push(object);
        }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<SourceUpdate> {
        let mut state = self.state.lock().await;
        Ok(SourceUpdate {
            objects: state.objects.values().cloned().collect(),
            removed: std::mem::take(&mut state.removed),
        })
    }
}

/// Polls configuration documents laid out as `<root>/<namespace>/<name>.yaml`.
///
/// `.yml` and `.json` files are read as well; when several files share a name
/// the first extension in that order wins. Symlinks are followed and dot-prefixed
/// entries are ignored, which matches how mounted config volumes are laid out.
/// Every file found is enabled and its change marker is the SHA-256 of its
/// content. A file that disappears between two polls is reported as removed.
/// A namespace directory that cannot be listed keeps the objects it had.
#[derive(Debug)]
pub struct DirectoryConfigSource {
    root: PathBuf,
    seen: Mutex<BTreeSet<ObjectRef>>,
}

const DOCUMENT_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

fn extension_rank(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?;
    DOCUMENT_EXTENSIONS.iter().position(|candidate| *candidate == ext)
}

async fn is_dir(entry: &tokio::fs::DirEntry) -> std::io::Result<bool> {
    let file_type = entry.file_type().await?;
    if file_type.is_symlink() {
        return Ok(tokio::fs::metadata(entry.path()).await?.is_dir());
    }
    Ok(file_type.is_dir())
}

impl DirectoryConfigSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Documents in one namespace directory, keyed by object name.
    async fn list_namespace(&self, dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list namespace directory {}", dir.display()))?;

        let mut documents: BTreeMap<String, (usize, PathBuf)> = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(rank) = extension_rank(&path) else {
                continue;
            };
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            // Unreadable entries stay listed; the read reports them.
            if let Ok(true) = is_dir(&entry).await {
                continue;
            }

            let (ignored, kept) = match documents.get(name) {
                Some((existing, kept)) if *existing <= rank => (Some(path.clone()), kept.clone()),
                Some((_, shadowed)) => (Some(shadowed.clone()), path.clone()),
                None => (None, path.clone()),
            };
            if let Some(ignored) = ignored {
                warn!(
                    path = %ignored.display(),
                    kept = %kept.display(),
                    "Ignoring duplicate configuration document"
                );
            }
            let rank = extension_rank(&kept).unwrap_or(rank);
            documents.insert(name.to_string(), (rank, kept));
        }

        Ok(documents
            .into_iter()
            .map(|(name, (_, path))| (name, path))
            .collect())
    }
}

#[async_trait]
impl ConfigSource for DirectoryConfigSource {
    async fn fetch(&self) -> Result<SourceUpdate> {
        let mut entries = tokio::fs::read_dir(&self.root).await.with_context(|| {
            format!(
                "Failed to list configuration directory {}",
                self.root.display()
            )
        })?;

        let mut seen = self.seen.lock().await;
        let mut objects = Vec::new();
        let mut present = BTreeSet::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(namespace) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if namespace.starts_with('.') {
                continue;
            }
            // A namespace whose kind cannot be determined is treated as unlistable.
            if let Ok(false) = is_dir(&entry).await {
                continue;
            }

            let documents = match self.list_namespace(&entry.path()).await {
                Ok(documents) => documents,
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        error = %e,
                        "Failed to scan namespace directory, keeping its objects"
                    );
                    present.extend(
                        seen.iter()
                            .filter(|object| object.namespace == namespace)
                            .cloned(),
                    );
                    continue;
                }
            };

            for (name, path) in documents {
                present.insert(ObjectRef::new(namespace.as_str(), name.as_str()));
                match tokio::fs::read(&path).await {
                    Ok(data) => objects.push(ConfigObject::new(namespace.as_str(), name, data)),
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to read configuration document"
                        );
                    }
                }
            }
        }

        let removed: Vec<ObjectRef> = seen.difference(&present).cloned().collect();
        *seen = present;

        debug!(
            root = %self.root.display(),
            objects = objects.len(),
            removed = removed.len(),
            "Scanned configuration directory"
        );

        Ok(SourceUpdate { objects, removed })
    }
}
