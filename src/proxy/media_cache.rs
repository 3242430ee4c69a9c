//! On-disk cache for Grok-generated media under `data/temp/<kind>/`.
//!
//! The cache key is the remote asset path with `/` flattened to `-`.
//! Writes go through a temp file and rename so a cancelled download never
//! leaves a partial entry. Eviction runs asynchronously after each write,
//! never concurrently, deleting oldest-mtime entries until the directory is
//! under its configured byte cap.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::HeaderMap;

use crate::error::{AppError, AppResult};
use crate::proxy::egress::EgressProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    fn download_timeout(&self) -> Duration {
        match self {
            MediaKind::Image => Duration::from_secs(30),
            MediaKind::Video => Duration::from_secs(60),
        }
    }
}

pub fn flatten_asset_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "-")
}

pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

pub struct MediaCache {
    kind: MediaKind,
    dir: PathBuf,
    max_bytes: u64,
    egress: Arc<EgressProxy>,
    assets_base: String,
    evicting: Arc<AtomicBool>,
}

impl MediaCache {
    pub fn new(kind: MediaKind, base_dir: &Path, max_size_mb: u64, egress: Arc<EgressProxy>) -> Self {
        Self {
            kind,
            dir: base_dir.join(kind.as_str()),
            max_bytes: max_size_mb.saturating_mul(1024 * 1024),
            egress,
            assets_base: crate::constants::GROK_ASSETS_BASE_URL.to_string(),
            evicting: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn with_assets_base(mut self, base: &str) -> Self {
        self.assets_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn local_path(&self, asset_path: &str) -> PathBuf {
        self.dir.join(flatten_asset_path(asset_path))
    }

    /// Public URL under which the media handler serves this entry.
    pub fn public_url(&self, asset_path: &str) -> String {
        format!("/images/{}/{}", self.kind.as_str(), flatten_asset_path(asset_path))
    }

    /// Returns the local path of the cached asset, downloading it first if
    /// needed.
    pub async fn get(&self, asset_path: &str, cookie: &str, headers: HeaderMap) -> AppResult<PathBuf> {
        let local = self.local_path(asset_path);
        if tokio::fs::metadata(&local).await.is_ok() {
            return Ok(local);
        }

        let bytes = self.download(asset_path, cookie, headers).await?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Temp-file + rename keeps cancelled downloads from leaving
        // partial entries behind.
        let tmp = local.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &local).await?;

        self.schedule_eviction();
        Ok(local)
    }

    /// Downloads the asset, returns it as a `data:` URL, and removes the
    /// on-disk copy.
    pub async fn get_as_base64(
        &self,
        asset_path: &str,
        cookie: &str,
        headers: HeaderMap,
    ) -> AppResult<String> {
        let local = self.get(asset_path, cookie, headers).await?;
        let bytes = tokio::fs::read(&local).await?;
        let _ = tokio::fs::remove_file(&local).await;
        let mime = content_type_for(&flatten_asset_path(asset_path));
        Ok(format!("data:{};base64,{}", mime, BASE64.encode(bytes)))
    }

    async fn download(&self, asset_path: &str, cookie: &str, headers: HeaderMap) -> AppResult<Vec<u8>> {
        let url = format!("{}/{}", self.assets_base, asset_path.trim_start_matches('/'));
        let timeout = self.kind.download_timeout();

        // Shares the Grok 403 handling: each blocked attempt rotates the
        // egress proxy before retrying.
        const BLOCK_RETRIES: usize = 5;
        let mut last_status = 0u16;
        for attempt in 0..=BLOCK_RETRIES {
            let client = self
                .egress
                .client_for(None, timeout)
                .await
                .map_err(AppError::Unknown)?;
            let resp = client
                .get(&url)
                .headers(headers.clone())
                .header(reqwest::header::COOKIE, cookie)
                .send()
                .await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp.bytes().await?.to_vec());
            }
            last_status = status.as_u16();
            if status.as_u16() == 403 && attempt < BLOCK_RETRIES {
                tracing::warn!(
                    "[MediaCache] {} download blocked (403), rotating proxy (attempt {}/{})",
                    self.kind.as_str(),
                    attempt + 1,
                    BLOCK_RETRIES
                );
                self.egress.force_refresh().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            break;
        }
        Err(AppError::Upstream {
            status: last_status,
            message: format!("media download failed for {}", asset_path),
        })
    }

    fn schedule_eviction(&self) {
        if self.max_bytes == 0 {
            return;
        }
        // One eviction pass at a time.
        if self
            .evicting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let dir = self.dir.clone();
        let max_bytes = self.max_bytes;
        let kind = self.kind;
        let flag = self.evicting.clone();
        tokio::spawn(async move {
            if let Err(e) = evict_oldest(&dir, max_bytes).await {
                tracing::warn!("[MediaCache] {} eviction failed: {}", kind.as_str(), e);
            }
            flag.store(false, Ordering::SeqCst);
        });
    }
}

async fn evict_oldest(dir: &Path, max_bytes: u64) -> std::io::Result<()> {
    let mut entries = Vec::new();
    let mut total: u64 = 0;
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        total += meta.len();
        entries.push((entry.path(), meta.len(), mtime));
    }
    if total <= max_bytes {
        return Ok(());
    }

    entries.sort_by_key(|(_, _, mtime)| *mtime);
    for (path, size, _) in entries {
        if total <= max_bytes {
            break;
        }
        if tokio::fs::remove_file(&path).await.is_ok() {
            total = total.saturating_sub(size);
            tracing::info!("[MediaCache] Evicted {}", path.display());
        }
    }
    Ok(())
}
