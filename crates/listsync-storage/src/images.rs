//! Ordered, content-addressed storage for listing photos.
//!
//! Each item gets its own folder; files are named `{position:03}_{hash}.{ext}`
//! so a plain sorted directory listing yields the listing order.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
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

    /// A fresh folder name for one item's photos.
    pub fn new_folder() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn image_relative_path(
        &self,
        folder: &str,
        position: usize,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "jpg" } else { ext };
        let short_hash = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(folder).join(format!("{position:03}_{short_hash}.{ext}"))
    }

    /// Writes one photo atomically through a temp file and rename.
    pub async fn store_image(
        &self,
        folder: &str,
        position: usize,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredImage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.image_relative_path(folder, position, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(folder);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating image directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            return Ok(StoredImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp image {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Photos of `folder` in listing order. A missing folder is an empty list.
    pub async fn list_images(&self, folder: &str) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.root.join(folder);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking image directory {}", dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading image directory {}", dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if !hidden && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
