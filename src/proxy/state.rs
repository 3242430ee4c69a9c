use std::sync::Arc;

use crate::models::AppConfig;
use crate::proxy::egress::EgressProxy;
use crate::proxy::media_cache::MediaCache;
use crate::proxy::pool::CredentialPool;
use crate::proxy::providers::deepseek::DeepseekAdapter;
use crate::proxy::registry::ProviderRegistry;
use crate::proxy::security::AdminSessionStore;
use crate::proxy::token_store::{GrokTokenStore, TokenFileCache};

pub struct CoreServices {
    pub pool: Arc<CredentialPool>,
    pub tokens: Arc<TokenFileCache>,
    pub grok_store: Arc<GrokTokenStore>,
    pub registry: Arc<ProviderRegistry>,
    pub egress: Arc<EgressProxy>,
    pub image_cache: Arc<MediaCache>,
    pub video_cache: Arc<MediaCache>,
    pub sessions: Arc<AdminSessionStore>,
    /// Present when the deepseek project is enabled; the management surface
    /// re-syncs its pool after credential CRUD.
    pub deepseek: Option<Arc<DeepseekAdapter>>,
}

// Axum application state.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreServices>,
    pub config: Arc<AppConfig>,
}
