//! Admin session store for the management surface: opaque ids handed out
//! as an HttpOnly cookie, expiring server-side.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::utils::crypto;

pub const SESSION_COOKIE: &str = "viaduct_session";
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
pub struct AdminSessionStore {
    sessions: DashMap<String, Instant>,
}

impl AdminSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> String {
        let sid = crypto::random_session_id();
        self.sessions.insert(sid.clone(), Instant::now() + SESSION_TTL);
        sid
    }

    pub fn validate(&self, sid: &str) -> bool {
        // The guard from `get` must drop before `remove` touches the map.
        match self.sessions.get(sid) {
            Some(expiry) if *expiry > Instant::now() => return true,
            Some(_) => {}
            None => return false,
        }
        self.sessions.remove(sid);
        false
    }

    pub fn remove(&self, sid: &str) {
        self.sessions.remove(sid);
    }

    /// `Set-Cookie` value for a fresh login. `NODE_ENV=production` adds the
    /// Secure attribute.
    pub fn login_cookie(&self, sid: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE,
            sid,
            SESSION_TTL.as_secs()
        );
        if crate::modules::system::config::cookies_secure() {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn logout_cookie(&self) -> String {
        format!("{}=; Path=/; HttpOnly; Max-Age=0", SESSION_COOKIE)
    }
}

/// Pulls the session id out of a `Cookie` request header.
pub fn session_id_from_cookie_header(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        if name == SESSION_COOKIE && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}
