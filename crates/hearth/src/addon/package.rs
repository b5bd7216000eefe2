//! Add-on packages
//!
//! Fetching, verifying and unpacking add-on tarballs. A package is a gzipped
//! tarball with everything under a top-level `package/` directory.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::{Error, Result};

use super::checksum;

/// Directory every package tarball must contain
pub const PACKAGE_DIR: &str = "package";

/// Where install tarballs come from
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Write the resource at `url` to `dest`
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Downloads packages over HTTP(S)
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        debug!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Package(format!("Failed to download {}: {}", url, e)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Package(format!("Failed to download {}: {}", url, e)))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

/// Copies packages from the local filesystem (`file://` URLs or plain paths)
#[derive(Debug, Clone, Default)]
pub struct FileFetcher;

#[async_trait]
impl PackageFetcher for FileFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        tokio::fs::copy(source, dest)
            .await
            .map_err(|e| Error::Package(format!("Failed to read {}: {}", source, e)))?;
        Ok(())
    }
}

/// Compare a file's SHA-256 with the expected hex digest, ignoring case
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = checksum::hash_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::Package(format!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected.trim(),
            actual
        )))
    }
}

pub fn extract_tar_gz(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let file = fs::File::open(source)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| Error::Package(format!("Failed to extract {}: {}", source.display(), e)))?;
    Ok(())
}

/// Recursively copy a directory tree
pub fn copy_dir_all(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
