use std::sync::LazyLock;

pub const DEEPSEEK_BASE_URL: &str = "https://chat.deepseek.com";
pub const GROK_BASE_URL: &str = "https://grok.com";
pub const GROK_ASSETS_BASE_URL: &str = "https://assets.grok.com";

pub const ACCOUNTS_DIR: &str = "accounts";
pub const MEDIA_TEMP_DIR: &str = "data/temp";
pub const CONFIG_FILE: &str = "config.yaml";

pub const POW_WASM_DEFAULT_PATH: &str = "sha3_wasm_bg.7b9ca65ddd.wasm";

// Browser fingerprint sent on every Grok call. Kept in one place so the
// whole header set stays consistent when the impersonated version moves.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
pub const BROWSER_SEC_CH_UA: &str =
    "\"Not?A_Brand\";v=\"99\", \"Chromium\";v=\"130\", \"Google Chrome\";v=\"130\"";

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "viaduct/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
