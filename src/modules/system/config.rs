use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;
use crate::utils::crypto;

pub fn config_path() -> PathBuf {
    PathBuf::from(crate::constants::CONFIG_FILE)
}

/// Loads `config.yaml` from the working directory. A missing or unparsable
/// file is a hard error; boot terminates on it (see `main`).
pub fn load_config(path: &Path) -> AppResult<AppConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("failed_to_read_config_file {}: {}", path.display(), e))
    })?;

    serde_yaml::from_str(&content)
        .map_err(|e| AppError::Config(format!("failed_to_parse_config_file: {}", e)))
}

pub fn save_config(path: &Path, config: &AppConfig) -> AppResult<()> {
    let content = serde_yaml::to_string(config)
        .map_err(|e| AppError::Config(format!("failed_to_serialize_config: {}", e)))?;
    fs::write(path, content)
        .map_err(|e| AppError::Config(format!("failed_to_save_config: {}", e)))
}

/// Loads the config and, on first boot, rewrites a plaintext admin password
/// to `$encrypt$<sha256hex>` in place.
///
/// The scheme is unsalted sha256 and is known-weak; it is mirrored only for
/// compatibility with existing config files. Do not reuse it for anything
/// beyond the admin login gate.
pub fn load_or_init(path: &Path) -> AppResult<AppConfig> {
    let mut config = load_config(path)?;

    // Env overrides take precedence over the file.
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.server.port = p;
                    tracing::info!("Using port from environment: {}", p);
                }
                _ => tracing::warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }
    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.server.host = host.trim().to_string();
        }
    }

    if !config.admin.password.is_empty() && !crypto::is_encrypted(&config.admin.password) {
        config.admin.password = crypto::encrypt_secret(&config.admin.password);
        save_config(path, &config)?;
        tracing::info!("Admin password rewritten to $encrypt$ form in {}", path.display());
    }

    Ok(config)
}

pub fn cookies_secure() -> bool {
    std::env::var("NODE_ENV")
        .map(|v| v.trim().eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}
