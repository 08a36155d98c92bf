//! Source acquisition
//!
//! A fetcher materializes `{region}.geojson` in the source directory and is
//! a no-op when the file is already there. Releasing a handle deletes the
//! raw file once the region no longer needs it.

use async_trait::async_trait;
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{LoadError, Result};

/// A source file available on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHandle {
    pub region: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, region: &str) -> Result<SourceHandle>;

    /// The local copy of `region`, if one exists, without fetching
    async fn locate(&self, region: &str) -> Result<Option<SourceHandle>>;

    /// Free the local copy; returns the number of bytes released
    async fn release(&self, handle: &SourceHandle) -> Result<u64>;
}

/// Expected location of a region's raw source
pub fn source_path(source_dir: &Path, region: &str) -> PathBuf {
    source_dir.join(format!("{region}.geojson"))
}

async fn existing_handle(region: &str, path: &Path) -> Result<Option<SourceHandle>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(SourceHandle {
            region: region.to_string(),
            path: path.to_path_buf(),
            size_bytes: meta.len(),
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_source(handle: &SourceHandle) -> Result<u64> {
    match tokio::fs::remove_file(&handle.path).await {
        Ok(()) => {
            info!(
                region = %handle.region,
                path = %handle.path.display(),
                freed_mb = handle.size_bytes as f64 / (1024.0 * 1024.0),
                "Deleted raw source file"
            );
            Ok(handle.size_bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Serves files already present in a directory
pub struct LocalDirFetcher {
    source_dir: PathBuf,
    delete_on_release: bool,
}

impl LocalDirFetcher {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            delete_on_release: false,
        }
    }

    pub fn delete_on_release(mut self, delete: bool) -> Self {
        self.delete_on_release = delete;
        self
    }
}

#[async_trait]
impl SourceFetcher for LocalDirFetcher {
    async fn fetch(&self, region: &str) -> Result<SourceHandle> {
        let path = source_path(&self.source_dir, region);
        existing_handle(region, &path)
            .await?
            .ok_or_else(|| LoadError::fetch(region, format!("{} not found", path.display())))
    }

    async fn locate(&self, region: &str) -> Result<Option<SourceHandle>> {
        existing_handle(region, &source_path(&self.source_dir, region)).await
    }

    async fn release(&self, handle: &SourceHandle) -> Result<u64> {
        if self.delete_on_release {
            remove_source(handle).await
        } else {
            Ok(0)
        }
    }
}

/// Downloads `{base_url}/{region}.geojson.zip` and extracts it
pub struct HttpZipFetcher {
    client: reqwest::Client,
    base_url: String,
    source_dir: PathBuf,
}

impl HttpZipFetcher {
    pub fn new(
        base_url: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("geoload/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoadError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            source_dir: source_dir.into(),
        })
    }

    fn archive_url(&self, region: &str) -> String {
        format!("{}/{region}.geojson.zip", self.base_url)
    }

    async fn download(&self, region: &str, dest: &Path) -> Result<u64> {
        let url = self.archive_url(region);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LoadError::fetch(region, e))?;

        if !response.status().is_success() {
            return Err(LoadError::fetch(
                region,
                format!("GET {url} returned {}", response.status()),
            ));
        }

        let partial = dest.with_extension("zip.part");
        let mut file = std::fs::File::create(&partial)?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = std::fs::remove_file(&partial);
                    return Err(LoadError::fetch(region, e));
                }
            };
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
        }
        file.sync_all()?;
        drop(file);

        std::fs::rename(&partial, dest)?;
        Ok(downloaded)
    }
}

/// Pull the region's `.geojson` entry out of a zip archive
fn extract_geojson(archive_path: &Path, region: &str, target: &Path) -> Result<u64> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| LoadError::fetch(region, e))?;

    let wanted = format!("{region}.geojson");
    let mut index = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| LoadError::fetch(region, e))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().rsplit('/').next().unwrap_or_default().to_string();
        if name == wanted {
            index = Some(i);
            break;
        }
        if index.is_none() && name.ends_with(".geojson") {
            index = Some(i);
        }
    }

    let index = index.ok_or_else(|| LoadError::fetch(region, "archive holds no .geojson entry"))?;
    let mut entry = archive
        .by_index(index)
        .map_err(|e| LoadError::fetch(region, e))?;

    let partial = target.with_extension("geojson.part");
    let mut out = std::fs::File::create(&partial)?;
    let written = std::io::copy(&mut entry, &mut out)?;
    out.sync_all()?;
    drop(out);
    std::fs::rename(&partial, target)?;
    Ok(written)
}

#[async_trait]
impl SourceFetcher for HttpZipFetcher {
    async fn fetch(&self, region: &str) -> Result<SourceHandle> {
        let target = source_path(&self.source_dir, region);
        if let Some(handle) = existing_handle(region, &target).await? {
            info!(region, size_bytes = handle.size_bytes, "Source already present, skipping download");
            return Ok(handle);
        }

        tokio::fs::create_dir_all(&self.source_dir).await?;
        let archive = self.source_dir.join(format!("{region}.geojson.zip"));

        let started = Instant::now();
        let result = async {
            let downloaded = self.download(region, &archive).await?;
            info!(
                region,
                bytes = downloaded,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Downloaded archive"
            );

            let archive_path = archive.clone();
            let region_name = region.to_string();
            let target_path = target.clone();
            let extracted = tokio::task::spawn_blocking(move || {
                extract_geojson(&archive_path, &region_name, &target_path)
            })
            .await??;
            info!(region, bytes = extracted, "Extracted source");
            Ok::<_, LoadError>(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(region, error = %e, "Failed to remove downloaded archive");
            }
        }
        result?;

        existing_handle(region, &target)
            .await?
            .ok_or_else(|| LoadError::fetch(region, "source file not found after extraction"))
    }

    async fn locate(&self, region: &str) -> Result<Option<SourceHandle>> {
        existing_handle(region, &source_path(&self.source_dir, region)).await
    }

    async fn release(&self, handle: &SourceHandle) -> Result<u64> {
        remove_source(handle).await
    }
}
