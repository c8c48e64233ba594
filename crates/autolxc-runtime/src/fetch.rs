//! Base image fetchers: HTTP(S) downloads and local file copies

use crate::{Fetcher, Result, RuntimeError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Downloads over HTTP(S)
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

/// Only HTTPS is allowed for remote hosts; plain HTTP is accepted for localhost.
fn check_url_allowed(url: &str) -> Result<()> {
    if url.starts_with("https://")
        || url.starts_with("http://localhost")
        || url.starts_with("http://127.0.0.1")
        || url.starts_with("http://[::1]")
    {
        Ok(())
    } else {
        Err(RuntimeError::Download {
            url: url.to_string(),
            reason: "only HTTPS URLs are allowed (except localhost)".to_string(),
        })
    }
}

/// Temp path next to `dest`, so the final rename stays on one filesystem
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        check_url_allowed(url)?;
        let download_err = |reason: String| RuntimeError::Download {
            url: url.to_string(),
            reason,
        };

        tracing::info!("Downloading {} to {}", url, dest.display());

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_err(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(download_err(format!("server returned {}", resp.status())));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| download_err(format!("failed to read body: {}", e)))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = partial_path(dest);
        if let Err(e) = tokio::fs::write(&part, &bytes).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(download_err(format!("failed to write {}: {}", part.display(), e)));
        }
        tokio::fs::rename(&part, dest).await?;

        tracing::debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(())
    }
}

/// Copies from the local filesystem; accepts `file://` URLs and plain paths
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let src = Path::new(url.strip_prefix("file://").unwrap_or(url));
        if !src.is_file() {
            return Err(RuntimeError::Download {
                url: url.to_string(),
                reason: format!("{} is not a file", src.display()),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dest)
            .await
            .map_err(|e| RuntimeError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_policy() {
        assert!(check_url_allowed("https://storage.example.com/base.tar.gz").is_ok());
        assert!(check_url_allowed("http://localhost:8080/base.tar").is_ok());
        assert!(check_url_allowed("http://127.0.0.1/base.tar").is_ok());
        assert!(check_url_allowed("http://example.com/base.tar").is_err());
        assert!(check_url_allowed("ftp://example.com/base.tar").is_err());
    }

    #[test]
    fn test_partial_path_is_sibling() {
        let p = partial_path(Path::new("/var/lib/lxc/base_09.tar.gz"));
        assert_eq!(p, PathBuf::from("/var/lib/lxc/base_09.tar.gz.part"));
    }

    #[tokio::test]
    async fn test_file_fetcher_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("image.tar");
        std::fs::write(&src, b"payload").unwrap();
        let dest = tmp.path().join("out").join("copy.tar");

        let url = format!("file://{}", src.display());
        FileFetcher.fetch(&url, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");

        // Bare paths work too
        let dest2 = tmp.path().join("copy2.tar");
        FileFetcher
            .fetch(src.to_str().unwrap(), &dest2)
            .await
            .unwrap();
        assert!(dest2.exists());
    }

    #[tokio::test]
    async fn test_file_fetcher_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FileFetcher
            .fetch("file:///nonexistent/image.tar", &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Download { .. }));
    }

    #[tokio::test]
    async fn test_http_fetcher_rejects_plain_http() {
        let tmp = tempfile::tempdir().unwrap();
        let err = HttpFetcher::new(Duration::from_secs(1))
            .fetch("http://example.com/base.tar", &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Download { .. }));
    }
}
