use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Bearer tokens that grant access to the public `/v1/*` surface.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    pub deepseek: DeepseekConfig,
    #[serde(default)]
    pub grok: GrokConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    #[serde(default)]
    pub username: String,
    /// Plaintext on first boot; rewritten to `$encrypt$<sha256hex>` by
    /// `modules::system::config::load_or_init`.
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepseekConfig {
    #[serde(default = "default_deepseek_base_url")]
    pub base_url: String,
    #[serde(default = "default_pow_wasm_path")]
    pub pow_wasm_path: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_deepseek_base_url() -> String {
    crate::constants::DEEPSEEK_BASE_URL.to_string()
}

fn default_pow_wasm_path() -> String {
    crate::constants::POW_WASM_DEFAULT_PATH.to_string()
}

fn default_device_id() -> String {
    "web_proxy_api".to_string()
}

impl Default for DeepseekConfig {
    fn default() -> Self {
        Self {
            base_url: default_deepseek_base_url(),
            pow_wasm_path: default_pow_wasm_path(),
            device_id: default_device_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrokConfig {
    #[serde(default = "default_true")]
    pub auto_refresh_tokens: bool,
    #[serde(default = "default_grok_base_url")]
    pub base_url: String,
    /// Static fallback used when `dynamic_statsig` is off.
    #[serde(default)]
    pub x_statsig_id: String,
    #[serde(default = "default_true")]
    pub dynamic_statsig: bool,
    /// `temporary` flag forwarded on every conversation payload.
    #[serde(default = "default_true")]
    pub temporary: bool,
    #[serde(default)]
    pub proxy_url: String,
    #[serde(default)]
    pub proxy_pool_url: String,
    #[serde(default = "default_pool_interval")]
    pub proxy_pool_interval: u64,
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
    #[serde(default = "default_filtered_tags")]
    pub filtered_tags: String,
    #[serde(default)]
    pub show_thinking: bool,
    /// `url` serves generated images from the local media cache; `base64`
    /// inlines them as data URLs.
    #[serde(default = "default_image_mode")]
    pub image_mode: String,
    #[serde(default = "default_image_cache_mb")]
    pub image_cache_max_size_mb: u64,
    #[serde(default = "default_video_cache_mb")]
    pub video_cache_max_size_mb: u64,
}

fn default_true() -> bool {
    true
}

fn default_grok_base_url() -> String {
    crate::constants::GROK_BASE_URL.to_string()
}

fn default_pool_interval() -> u64 {
    300
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![401, 429]
}

fn default_filtered_tags() -> String {
    "xaiartifact,xai:tool_usage_card,grok:render".to_string()
}

fn default_image_mode() -> String {
    "url".to_string()
}

fn default_image_cache_mb() -> u64 {
    512
}

fn default_video_cache_mb() -> u64 {
    1024
}

impl Default for GrokConfig {
    fn default() -> Self {
        Self {
            auto_refresh_tokens: true,
            base_url: default_grok_base_url(),
            x_statsig_id: String::new(),
            dynamic_statsig: true,
            temporary: true,
            proxy_url: String::new(),
            proxy_pool_url: String::new(),
            proxy_pool_interval: default_pool_interval(),
            retry_status_codes: default_retry_status_codes(),
            filtered_tags: default_filtered_tags(),
            show_thinking: false,
            image_mode: default_image_mode(),
            image_cache_max_size_mb: default_image_cache_mb(),
            video_cache_max_size_mb: default_video_cache_mb(),
        }
    }
}

impl AppConfig {
    pub fn project_enabled(&self, name: &str) -> bool {
        self.projects.get(name).map(|p| p.enabled).unwrap_or(false)
    }

    pub fn enabled_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .projects
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_caller_key(&self, bearer: &str) -> bool {
        self.keys.iter().any(|k| k == bearer)
    }
}
