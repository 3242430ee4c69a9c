mod config;

pub use config::{
    AdminConfig, AppConfig, DeepseekConfig, GrokConfig, ProjectConfig, ServerConfig,
};
