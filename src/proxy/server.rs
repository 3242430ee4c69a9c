//! Server bootstrap: wires config into the long-lived services, registers
//! the enabled provider adapters, and runs axum until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;
use crate::proxy::egress::EgressProxy;
use crate::proxy::media_cache::{MediaCache, MediaKind};
use crate::proxy::pool::CredentialPool;
use crate::proxy::providers::deepseek::DeepseekAdapter;
use crate::proxy::providers::grok::{GrokAdapter, GrokClient, GrokRefresher};
use crate::proxy::registry::ProviderRegistry;
use crate::proxy::routes::build_proxy_routes;
use crate::proxy::security::AdminSessionStore;
use crate::proxy::state::{AppState, CoreServices};
use crate::proxy::token_store::{GrokTokenStore, TokenFileCache};

pub struct AxumServer {
    state: AppState,
    refresher: Option<GrokRefresher>,
    shutdown: CancellationToken,
}

impl AxumServer {
    /// Builds every long-lived service and registers the adapters for the
    /// enabled projects.
    pub async fn build(config: AppConfig) -> AppResult<Self> {
        let config = Arc::new(config);
        let tokens = Arc::new(TokenFileCache::new(crate::constants::ACCOUNTS_DIR));
        let pool = Arc::new(CredentialPool::new());
        let registry = Arc::new(ProviderRegistry::new());
        let sessions = Arc::new(AdminSessionStore::new());
        let grok_store = Arc::new(GrokTokenStore::new(tokens.clone()));

        let egress = Arc::new(EgressProxy::new(
            &config.grok.proxy_url,
            &config.grok.proxy_pool_url,
            config.grok.proxy_pool_interval,
        ));

        let media_dir = PathBuf::from(crate::constants::MEDIA_TEMP_DIR);
        let image_cache = Arc::new(MediaCache::new(
            MediaKind::Image,
            &media_dir,
            config.grok.image_cache_max_size_mb,
            egress.clone(),
        ));
        let video_cache = Arc::new(MediaCache::new(
            MediaKind::Video,
            &media_dir,
            config.grok.video_cache_max_size_mb,
            egress.clone(),
        ));

        let mut deepseek_adapter = None;
        if config.project_enabled(crate::proxy::providers::deepseek::PROJECT) {
            let adapter = Arc::new(DeepseekAdapter::new(
                config.deepseek.clone(),
                pool.clone(),
                tokens.clone(),
                egress.clone(),
            ));
            adapter.sync_pool().await;
            let preloaded = tokens
                .preload_project(crate::proxy::providers::deepseek::PROJECT)
                .await;
            info!("[Server] DeepSeek enabled with {} credential file(s)", preloaded);
            registry.register(adapter.clone());
            deepseek_adapter = Some(adapter);
        }

        let mut refresher = None;
        if config.project_enabled("grok") {
            let client = Arc::new(GrokClient::new(
                config.grok.clone(),
                grok_store.clone(),
                egress.clone(),
            ));
            registry.register(Arc::new(GrokAdapter::new(
                client.clone(),
                image_cache.clone(),
                video_cache.clone(),
            )));
            refresher = Some(GrokRefresher::start(client));
            info!("[Server] Grok enabled");
        }

        for project in config.enabled_projects() {
            if !matches!(project.as_str(), "deepseek" | "grok") {
                // Reserved slots (claude, kimi): recognized, never registered.
                warn!("[Server] Project '{}' has no adapter; ignoring", project);
            }
        }

        let core = Arc::new(CoreServices {
            pool,
            tokens,
            grok_store,
            registry,
            egress,
            image_cache,
            video_cache,
            sessions,
            deepseek: deepseek_adapter,
        });

        Ok(Self {
            state: AppState { core, config },
            refresher: refresher.take(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until the shutdown token fires, then stops the background
    /// refresher cleanly.
    pub async fn run(mut self) -> AppResult<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::Config(format!("failed to bind {}: {}", addr, e)))?;
        info!("[Server] Listening on {}", addr);

        let router = build_proxy_routes(self.state.clone());
        let shutdown = self.shutdown.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(AppError::Io);

        if let Some(refresher) = self.refresher.take() {
            refresher.shutdown().await;
        }
        result
    }
}
