//! Read-through cache over `accounts/<project>/*.json` credential files.
//!
//! Entries live for five minutes, directory snapshots for thirty seconds.
//! A filesystem watcher per project directory invalidates the touched file
//! and forces the next list call to rescan; if the watcher cannot be
//! installed the cache degrades to TTL-only behavior.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;

const ENTRY_TTL: Duration = Duration::from_secs(5 * 60);
const SCAN_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct TokenEntry {
    data: Value,
    loaded_at: Instant,
}

#[derive(Default)]
struct ScanState {
    files: Vec<String>,
    scanned_at: Option<Instant>,
}

#[derive(Default)]
struct CacheShared {
    entries: DashMap<String, TokenEntry>,
    scans: DashMap<String, ScanState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub projects: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct TokenFileCache {
    root: PathBuf,
    shared: Arc<CacheShared>,
    watchers: DashMap<String, RecommendedWatcher>,
    /// One writer per credential file within this process; readers may see
    /// stale data up to the entry TTL.
    write_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

fn entry_key(project: &str, filename: &str) -> String {
    format!("{}/{}", project, filename)
}

impl TokenFileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shared: Arc::new(CacheShared::default()),
            watchers: DashMap::new(),
            write_locks: DashMap::new(),
        }
    }

    fn write_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    pub fn token_path(&self, project: &str, filename: &str) -> PathBuf {
        self.project_dir(project).join(filename)
    }

    /// Returns the parsed credential file, reading through on a miss or an
    /// expired entry. A missing file evicts the entry and yields `None`.
    pub async fn get_token(&self, project: &str, filename: &str) -> Option<Value> {
        let key = entry_key(project, filename);
        if let Some(entry) = self.shared.entries.get(&key) {
            if entry.loaded_at.elapsed() < ENTRY_TTL {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.data.clone());
            }
        }
        self.shared.misses.fetch_add(1, Ordering::Relaxed);

        let path = self.token_path(project, filename);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => {
                self.shared.entries.remove(&key);
                return None;
            }
        };
        let data: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[TokenCache] Corrupt credential file {}: {}", path.display(), e);
                self.shared.entries.remove(&key);
                return None;
            }
        };
        self.shared.entries.insert(
            key,
            TokenEntry {
                data: data.clone(),
                loaded_at: Instant::now(),
            },
        );
        Some(data)
    }

    /// Returns the project's `*.json` filenames, rescanning when the
    /// snapshot is stale and installing the directory watcher on first use.
    pub async fn get_token_list(&self, project: &str) -> Vec<String> {
        if let Some(scan) = self.shared.scans.get(project) {
            if let Some(at) = scan.scanned_at {
                if at.elapsed() < SCAN_TTL {
                    return scan.files.clone();
                }
            }
        }

        let dir = self.project_dir(project);
        let mut files = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".json") {
                    files.push(name);
                }
            }
        }
        files.sort();

        self.ensure_watcher(project);
        self.shared.scans.insert(
            project.to_string(),
            ScanState {
                files: files.clone(),
                scanned_at: Some(Instant::now()),
            },
        );
        files
    }

    pub async fn get_all_tokens(&self, project: &str) -> Vec<(String, Value)> {
        let files = self.get_token_list(project).await;
        let lookups = files.into_iter().map(|name| async move {
            let data = self.get_token(project, &name).await;
            data.map(|d| (name, d))
        });
        futures::future::join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn invalidate_token(&self, project: &str, filename: &str) {
        self.shared.entries.remove(&entry_key(project, filename));
    }

    pub fn invalidate_project(&self, project: &str) {
        let prefix = format!("{}/", project);
        self.shared.entries.retain(|k, _| !k.starts_with(&prefix));
        if let Some(mut scan) = self.shared.scans.get_mut(project) {
            scan.scanned_at = None;
        }
    }

    pub async fn preload_project(&self, project: &str) -> usize {
        self.get_all_tokens(project).await.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.shared.entries.len(),
            projects: self.shared.scans.len(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }

    fn ensure_watcher(&self, project: &str) {
        if self.watchers.contains_key(project) {
            return;
        }
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return;
        }

        let shared = self.shared.clone();
        let project_name = project.to_string();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for path in &event.paths {
                        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        if !name.ends_with(".json") {
                            continue;
                        }
                        shared.entries.remove(&entry_key(&project_name, name));
                        if let Some(mut scan) = shared.scans.get_mut(&project_name) {
                            scan.scanned_at = None;
                        }
                        tracing::debug!(
                            "[TokenCache] Watcher invalidated {}/{}",
                            project_name,
                            name
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("[TokenCache] Watcher error for {}: {}", project_name, e);
                }
            }
        });

        match watcher {
            Ok(mut w) => {
                if let Err(e) = w.watch(&dir, RecursiveMode::NonRecursive) {
                    tracing::warn!(
                        "[TokenCache] Failed to watch {} ({}); falling back to TTL-only",
                        dir.display(),
                        e
                    );
                    return;
                }
                self.watchers.insert(project.to_string(), w);
                tracing::info!("[TokenCache] Watching {}", dir.display());
            }
            Err(e) => {
                tracing::warn!(
                    "[TokenCache] Failed to create watcher for {} ({}); falling back to TTL-only",
                    dir.display(),
                    e
                );
            }
        }
    }

    /// Serializes and writes a credential file, then invalidates the entry
    /// so the next read observes the new content.
    pub async fn save_token(&self, project: &str, filename: &str, data: &Value) -> std::io::Result<()> {
        let lock = self.write_lock(&entry_key(project, filename));
        let _guard = lock.lock().await;

        let dir = self.project_dir(project);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        let body = serde_json::to_string_pretty(data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&path, body).await?;
        self.invalidate_token(project, filename);
        self.invalidate_project(project);
        Ok(())
    }

    pub async fn delete_token(&self, project: &str, filename: &str) -> std::io::Result<()> {
        let lock = self.write_lock(&entry_key(project, filename));
        let _guard = lock.lock().await;

        let path = self.token_path(project, filename);
        tokio::fs::remove_file(&path).await?;
        self.invalidate_token(project, filename);
        self.invalidate_project(project);
        Ok(())
    }
}
