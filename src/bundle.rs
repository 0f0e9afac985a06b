//! Local cache of extracted slide bundles.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<safe id>/            extracted archive
//! <root>/<safe id>/manifest.json
//! <root>/.staging-<id>-<rand>/ in-flight extraction
//! <root>/.retired-<id>-<rand>/ replaced extraction awaiting commit
//! ```

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::task;
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;

use crate::error::SlideError;
use crate::slide::{SlideId, SlideMetadata, SlideVersion};

pub const MANIFEST_FILE: &str = "manifest.json";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Source of bundle archives.
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    async fn fetch(&self, id: &SlideId, url: &str) -> Result<Vec<u8>, SlideError>;
}

/// Fetches `http(s)://` URLs with reqwest and reads `file://` URLs or bare
/// paths from disk.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BundleFetcher for HttpFetcher {
    async fn fetch(&self, id: &SlideId, url: &str) -> Result<Vec<u8>, SlideError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|resp| resp.error_for_status())
                .map_err(|err| SlideError::fetch(id, url, err))?;
            let body = response
                .bytes()
                .await
                .map_err(|err| SlideError::fetch(id, url, err))?;
            return Ok(body.to_vec());
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        fs::read(path)
            .await
            .map_err(|err| SlideError::fetch(id, url, err))
    }
}

/// A bundle directory handed out by [`BundleCache::fetch_and_cache`].
///
/// A fresh extraction keeps the one it replaced under `.retired-*` until
/// [`commit`](Self::commit); [`rollback`](Self::rollback) puts it back so a
/// bundle that fails to parse never costs the last good one.
#[derive(Debug)]
#[must_use = "a fresh bundle must be committed or rolled back"]
pub struct CachedBundle {
    id: SlideId,
    dir: PathBuf,
    fresh: bool,
    previous: Option<PathBuf>,
}

impl CachedBundle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this call downloaded and extracted the archive.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Keeps the new extraction and deletes the one it replaced.
    pub async fn commit(self) -> PathBuf {
        if let Some(previous) = &self.previous {
            if let Err(err) = fs::remove_dir_all(previous).await {
                warn!(path = %previous.display(), error = %err, "failed to remove replaced bundle");
            }
        }
        self.dir
    }

    /// Drops a fresh extraction and moves the previous one back in place.
    pub async fn rollback(self) {
        if !self.fresh {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(slide = %self.id, dir = %self.dir.display(), error = %err, "failed to discard bundle");
                return;
            }
        }
        if let Some(previous) = &self.previous {
            if let Err(err) = fs::rename(previous, &self.dir).await {
                warn!(slide = %self.id, path = %previous.display(), error = %err, "failed to restore previous bundle");
                return;
            }
        }
        debug!(slide = %self.id, restored = self.previous.is_some(), "bundle rolled back");
    }
}

pub struct BundleCache {
    root: PathBuf,
    fetcher: Arc<dyn BundleFetcher>,
}

impl BundleCache {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn BundleFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slide_dir(&self, id: &SlideId) -> PathBuf {
        self.root.join(id.dir_name())
    }

    /// Makes sure the bundle for `version` is extracted in the slide's
    /// directory. Nothing is downloaded when the persisted manifest already
    /// carries `version`. A fresh extraction must be committed once its
    /// content parsed, or rolled back to the previous one.
    #[instrument(skip(self), fields(slide = %id))]
    pub async fn fetch_and_cache(
        &self,
        id: &SlideId,
        url: &str,
        version: &SlideVersion,
    ) -> Result<CachedBundle, SlideError> {
        let dir = self.slide_dir(id);
        if let Some(manifest) = self.read_manifest(id).await {
            if &manifest.timestamp == version {
                debug!(dir = %dir.display(), %version, "bundle already cached");
                return Ok(CachedBundle {
                    id: id.clone(),
                    dir,
                    fresh: false,
                    previous: None,
                });
            }
        }

        let bytes = self.fetcher.fetch(id, url).await?;
        debug!(bytes = bytes.len(), "bundle fetched");

        let root = self.root.clone();
        let target = dir.clone();
        let owner = id.clone();
        let previous = task::spawn_blocking(move || install_archive(&owner, &root, &target, bytes))
            .await
            .map_err(|err| SlideError::extract(id, format!("extraction task failed: {err}")))??;

        info!(dir = %dir.display(), %version, "bundle extracted");
        Ok(CachedBundle {
            id: id.clone(),
            dir,
            fresh: true,
            previous,
        })
    }

    pub async fn read_manifest(&self, id: &SlideId) -> Option<SlideMetadata> {
        read_manifest_at(&self.slide_dir(id)).await
    }

    /// Persists `meta` next to the extracted bundle.
    pub async fn write_manifest(&self, meta: &SlideMetadata) -> Result<(), SlideError> {
        let dir = self.slide_dir(&meta.id);
        let body = serde_json::to_vec_pretty(meta)
            .map_err(|err| SlideError::extract(&meta.id, format!("manifest encode: {err}")))?;
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, body)
            .await
            .map_err(|err| SlideError::extract(&meta.id, format!("{}: {err}", tmp.display())))?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE))
            .await
            .map_err(|err| SlideError::extract(&meta.id, format!("manifest rename: {err}")))
    }

    /// Every slide manifest found under the cache root, ordered by id.
    pub async fn cached_manifests(&self) -> Vec<SlideMetadata> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(root = %self.root.display(), error = %err, "cache root not readable");
                return Vec::new();
            }
        };
        let mut manifests = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if let Some(manifest) = read_manifest_at(&entry.path()).await {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    /// Cleans up after extractions interrupted by a crash. A replaced bundle
    /// whose successor never got a manifest is moved back in place.
    pub async fn purge_staging(&self) {
        let Ok(mut entries) = fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(target) = name
                .strip_prefix(RETIRED_PREFIX)
                .and_then(|rest| rest.rsplit_once('-'))
                .map(|(dir_name, _)| self.root.join(dir_name))
            {
                if self.restore_retired(&entry.path(), &target).await {
                    continue;
                }
            }
            if name.starts_with(STAGING_PREFIX) || name.starts_with(RETIRED_PREFIX) {
                debug!(path = %entry.path().display(), "removing stale staging directory");
                if let Err(err) = fs::remove_dir_all(entry.path()).await {
                    warn!(path = %entry.path().display(), error = %err, "failed to remove staging directory");
                }
            }
        }
    }

    async fn restore_retired(&self, retired: &Path, target: &Path) -> bool {
        if read_manifest_at(target).await.is_some() || read_manifest_at(retired).await.is_none() {
            return false;
        }
        if let Err(err) = fs::remove_dir_all(target).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %target.display(), error = %err, "failed to drop unparsed bundle");
                return false;
            }
        }
        match fs::rename(retired, target).await {
            Ok(()) => {
                info!(path = %target.display(), "restored previous bundle");
                true
            }
            Err(err) => {
                warn!(path = %retired.display(), error = %err, "failed to restore previous bundle");
                false
            }
        }
    }

    /// Removes the slide's directory so the next add fetches again.
    pub async fn evict(&self, id: &SlideId) {
        let dir = self.slide_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(slide = %id, dir = %dir.display(), "bundle evicted"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(slide = %id, dir = %dir.display(), error = %err, "failed to evict bundle"),
        }
    }
}

async fn read_manifest_at(dir: &Path) -> Option<SlideMetadata> {
    let path = dir.join(MANIFEST_FILE);
    let raw = fs::read(&path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable manifest");
            None
        }
    }
}

/// Extracts into a staging sibling and swaps it over `target`. On any
/// failure the staging directory is removed and `target` is untouched.
/// Returns the retired previous extraction, if there was one.
fn install_archive(
    id: &SlideId,
    root: &Path,
    target: &Path,
    bytes: Vec<u8>,
) -> Result<Option<PathBuf>, SlideError> {
    std::fs::create_dir_all(root)
        .map_err(|err| SlideError::extract(id, format!("{}: {err}", root.display())))?;
    let staging = root.join(format!(
        "{STAGING_PREFIX}{}-{:08x}",
        id.dir_name(),
        rand::random::<u32>()
    ));
    let result = extract_into(id, &staging, bytes).and_then(|()| swap_into_place(id, root, &staging, target));
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

fn extract_into(id: &SlideId, staging: &Path, bytes: Vec<u8>) -> Result<(), SlideError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| SlideError::extract(id, format!("not a zip archive: {err}")))?;
    std::fs::create_dir_all(staging)
        .map_err(|err| SlideError::extract(id, format!("{}: {err}", staging.display())))?;
    archive
        .extract(staging)
        .map_err(|err| SlideError::extract(id, err))
}

/// Renames `staging` over `target`, moving the old extraction aside and
/// returning where it went.
fn swap_into_place(
    id: &SlideId,
    root: &Path,
    staging: &Path,
    target: &Path,
) -> Result<Option<PathBuf>, SlideError> {
    let retired = if target.exists() {
        let retired = root.join(format!(
            "{RETIRED_PREFIX}{}-{:08x}",
            id.dir_name(),
            rand::random::<u32>()
        ));
        std::fs::rename(target, &retired)
            .map_err(|err| SlideError::extract(id, format!("moving old bundle aside: {err}")))?;
        Some(retired)
    } else {
        None
    };

    if let Err(err) = std::fs::rename(staging, target) {
        if let Some(retired) = &retired {
            let _ = std::fs::rename(retired, target);
        }
        return Err(SlideError::extract(id, format!("installing bundle: {err}")));
    }

    Ok(retired)
}
