//! Fetch plumbing for bidscout: HTTP client with retry and charset decoding,
//! a bounded headless-browser pool, and a content-addressed store for debug
//! page dumps.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod browser;
mod http;

pub use browser::{BrowserPool, BrowserPoolConfig, RenderRequest, SCROLL_STEP_PX};
pub use http::{
    classify_reqwest_error, classify_status, decode_body, resolve_url, site_origin, strip_noise,
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
    DEFAULT_USER_AGENT,
};

pub const CRATE_NAME: &str = "bidscout-storage";

/// Page dump written by the debug mode of a scrape.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<run stamp>/<org>/<label>-<hash prefix>.html`. Path separators in the
    /// organization name are replaced so every org gets exactly one directory.
    pub fn page_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        org_name: &str,
        label: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let org_dir: String = org_name
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_whitespace() => '_',
                c => c,
            })
            .collect();
        let org_dir = if org_dir.is_empty() {
            "unknown".to_string()
        } else {
            org_dir
        };
        let short_hash = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(stamp)
            .join(org_dir)
            .join(format!("{label}-{short_hash}.html"))
    }

    /// Writes a fetched page through a temp file and an atomic rename. An
    /// identical page for the same run, org and label is reported as a dedup.
    pub async fn store_page(
        &self,
        captured_at: DateTime<Utc>,
        org_name: &str,
        label: &str,
        html: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(captured_at, org_name, label, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("artifact path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating debug directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking debug page {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn captured_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-05T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn page_paths_are_grouped_by_run_and_org() {
        let store = ArtifactStore::new("/tmp/x");
        let hash = ArtifactStore::sha256_hex(b"<html></html>");
        let path = store.page_relative_path(captured_at(), "서울시 / 본청", "list-p1", &hash);
        assert_eq!(
            path,
            PathBuf::from("20240305_090000")
                .join("서울시___본청")
                .join(format!("list-p1-{}.html", &hash[..16]))
        );
    }

    #[tokio::test]
    async fn identical_pages_are_written_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_page(captured_at(), "가평군청", "list-p1", "<html>rows</html>")
            .await
            .expect("first");
        let second = store
            .store_page(captured_at(), "가평군청", "list-p1", "<html>rows</html>")
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.absolute_path, second.absolute_path);
        let written = std::fs::read_to_string(&first.absolute_path).expect("read back");
        assert_eq!(written, "<html>rows</html>");
    }
}
