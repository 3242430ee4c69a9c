pub mod auth;
pub mod logging;

pub use auth::admin_session_middleware;
pub use logging::request_log_middleware;
