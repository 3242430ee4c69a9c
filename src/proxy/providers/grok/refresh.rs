//! Background quota refresher.
//!
//! Every ten minutes each healthy token whose quotas have not been polled
//! for an hour gets both the normal and heavy rate-limit models refreshed,
//! spaced one second apart so the polling itself does not trip rate
//! limits. The first sweep is delayed a few seconds past boot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{GrokClient, HEAVY_RATE_LIMIT_MODEL, NORMAL_RATE_LIMIT_MODEL};

const BOOT_DELAY: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const TOKEN_STALENESS: Duration = Duration::from_secs(60 * 60);
const TOKEN_SPACING: Duration = Duration::from_secs(1);

pub struct GrokRefresher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl GrokRefresher {
    /// Spawns the refresh loop. No-op handle when auto refresh is disabled.
    pub fn start(client: Arc<GrokClient>) -> Self {
        let cancel = CancellationToken::new();
        if !client.config.auto_refresh_tokens {
            tracing::info!("[GrokRefresh] auto_refresh_tokens disabled");
            return Self {
                cancel,
                handle: None,
            };
        }

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(BOOT_DELAY) => {}
                _ = token.cancelled() => return,
            }
            let last_refresh: DashMap<String, Instant> = DashMap::new();
            loop {
                sweep(&client, &last_refresh, &token).await;
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    _ = token.cancelled() => return,
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for GrokRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep(
    client: &GrokClient,
    last_refresh: &DashMap<String, Instant>,
    cancel: &CancellationToken,
) {
    let file = client.store.load().await;
    let tokens: Vec<String> = file
        .sso_normal
        .iter()
        .chain(file.sso_super.iter())
        .filter(|(_, entry)| !entry.is_expired() && entry.failed_count < 3)
        .map(|(sso, _)| sso.clone())
        .collect();

    let mut refreshed = 0usize;
    for sso in tokens {
        if cancel.is_cancelled() {
            return;
        }
        let stale = last_refresh
            .get(&sso)
            .map(|at| at.elapsed() >= TOKEN_STALENESS)
            .unwrap_or(true);
        if !stale {
            continue;
        }

        client
            .poll_rate_limit(&sso, NORMAL_RATE_LIMIT_MODEL, false)
            .await;
        client
            .poll_rate_limit(&sso, HEAVY_RATE_LIMIT_MODEL, true)
            .await;
        last_refresh.insert(sso, Instant::now());
        refreshed += 1;

        tokio::select! {
            _ = tokio::time::sleep(TOKEN_SPACING) => {}
            _ = cancel.cancelled() => return,
        }
    }
    if refreshed > 0 {
        tracing::info!("[GrokRefresh] Refreshed quotas for {} token(s)", refreshed);
    }
}
