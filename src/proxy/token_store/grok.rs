//! Grok SSO token store: a single `accounts/grok/token.json` holding the
//! `ssoNormal` and `ssoSuper` maps keyed by raw SSO value. All mutation is
//! serialized through one async lock; readers go through the shared
//! token-file cache so watcher invalidation applies here too.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::cache::TokenFileCache;
use crate::error::{AppError, AppResult};

pub const GROK_PROJECT: &str = "grok";
pub const GROK_TOKEN_FILE: &str = "token.json";

const MAX_FAILED_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTier {
    Normal,
    Super,
}

impl TokenTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenTier::Normal => "ssoNormal",
            TokenTier::Super => "ssoSuper",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrokTokenEntry {
    #[serde(rename = "createdTime", default)]
    pub created_time: i64,
    /// Quota for non-heavy models; -1 unknown, 0 exhausted, >0 residual.
    #[serde(rename = "remainingQueries", default = "default_unknown_quota")]
    pub remaining_queries: i64,
    #[serde(rename = "heavyremainingQueries", default = "default_unknown_quota")]
    pub heavy_remaining_queries: i64,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(rename = "failedCount", default)]
    pub failed_count: u32,
    #[serde(rename = "lastFailureTime", skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<i64>,
    #[serde(rename = "lastFailureReason", skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

fn default_unknown_quota() -> i64 {
    -1
}

fn default_status() -> String {
    "active".to_string()
}

impl GrokTokenEntry {
    pub fn fresh() -> Self {
        Self {
            created_time: chrono::Utc::now().timestamp_millis(),
            remaining_queries: -1,
            heavy_remaining_queries: -1,
            status: default_status(),
            failed_count: 0,
            last_failure_time: None,
            last_failure_reason: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.status == "expired"
    }

    pub fn quota_for(&self, heavy: bool) -> i64 {
        if heavy {
            self.heavy_remaining_queries
        } else {
            self.remaining_queries
        }
    }

    /// Not expired, under the failure cap, and not known-exhausted for the
    /// requested tier.
    pub fn eligible(&self, heavy: bool) -> bool {
        !self.is_expired() && self.failed_count < MAX_FAILED_COUNT && self.quota_for(heavy) != 0
    }
}

/// BTreeMap keeps token.json output stable across rewrites.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GrokTokenFile {
    #[serde(rename = "ssoNormal", default)]
    pub sso_normal: BTreeMap<String, GrokTokenEntry>,
    #[serde(rename = "ssoSuper", default)]
    pub sso_super: BTreeMap<String, GrokTokenEntry>,
}

impl GrokTokenFile {
    pub fn map(&self, tier: TokenTier) -> &BTreeMap<String, GrokTokenEntry> {
        match tier {
            TokenTier::Normal => &self.sso_normal,
            TokenTier::Super => &self.sso_super,
        }
    }

    fn map_mut(&mut self, tier: TokenTier) -> &mut BTreeMap<String, GrokTokenEntry> {
        match tier {
            TokenTier::Normal => &mut self.sso_normal,
            TokenTier::Super => &mut self.sso_super,
        }
    }

    fn entry_mut(&mut self, sso: &str) -> Option<(&mut GrokTokenEntry, TokenTier)> {
        if self.sso_normal.contains_key(sso) {
            return self.sso_normal.get_mut(sso).map(|e| (e, TokenTier::Normal));
        }
        self.sso_super.get_mut(sso).map(|e| (e, TokenTier::Super))
    }
}

pub struct GrokTokenStore {
    cache: Arc<TokenFileCache>,
    write_lock: Mutex<()>,
}

impl GrokTokenStore {
    pub fn new(cache: Arc<TokenFileCache>) -> Self {
        Self {
            cache,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> GrokTokenFile {
        match self.cache.get_token(GROK_PROJECT, GROK_TOKEN_FILE).await {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("[GrokStore] token.json has unexpected shape: {}", e);
                GrokTokenFile::default()
            }),
            None => GrokTokenFile::default(),
        }
    }

    async fn save(&self, file: &GrokTokenFile) -> AppResult<()> {
        let value = serde_json::to_value(file)?;
        self.cache
            .save_token(GROK_PROJECT, GROK_TOKEN_FILE, &value)
            .await
            .map_err(AppError::Io)
    }

    /// Applies `mutate` to the store under the single-writer lock and
    /// persists the result.
    async fn update<F>(&self, mutate: F) -> AppResult<()>
    where
        F: FnOnce(&mut GrokTokenFile),
    {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await;
        mutate(&mut file);
        self.save(&file).await
    }

    pub async fn add_token(&self, tier: TokenTier, sso: String) -> AppResult<()> {
        self.update(|file| {
            file.map_mut(tier).entry(sso).or_insert_with(GrokTokenEntry::fresh);
        })
        .await
    }

    pub async fn delete_token(&self, tier: TokenTier, sso: &str) -> AppResult<bool> {
        let mut removed = false;
        self.update(|file| {
            removed = file.map_mut(tier).remove(sso).is_some();
        })
        .await?;
        Ok(removed)
    }

    /// Writes observed quotas back after a rate-limit poll or a successful
    /// request. `heavy` selects which counter the value belongs to.
    pub async fn update_limits(&self, sso: &str, heavy: bool, remaining: i64) -> AppResult<()> {
        self.update(|file| {
            if let Some((entry, _)) = file.entry_mut(sso) {
                if heavy {
                    entry.heavy_remaining_queries = remaining;
                } else {
                    entry.remaining_queries = remaining;
                }
            }
        })
        .await
    }

    pub async fn record_success(&self, sso: &str) -> AppResult<()> {
        self.update(|file| {
            if let Some((entry, _)) = file.entry_mut(sso) {
                entry.failed_count = 0;
                entry.last_failure_reason = None;
            }
        })
        .await
    }

    /// Accumulates a failure; at three consecutive failures with a 4xx
    /// status the token is marked expired.
    pub async fn record_failure(&self, sso: &str, status: u16, reason: &str) -> AppResult<()> {
        self.update(|file| {
            if let Some((entry, _)) = file.entry_mut(sso) {
                entry.failed_count += 1;
                entry.last_failure_time = Some(chrono::Utc::now().timestamp_millis());
                entry.last_failure_reason = Some(reason.to_string());
                if entry.failed_count >= MAX_FAILED_COUNT && (400..500).contains(&status) {
                    entry.status = "expired".to_string();
                    tracing::warn!(
                        "[GrokStore] Token expired after {} failures (status {})",
                        entry.failed_count,
                        status
                    );
                }
            }
        })
        .await
    }
}
