//! Credential pool with per-model rotation.
//!
//! Each model owns an ordered ring of credential ids, a cursor, and a map
//! of temporary skip windows. Credentials themselves are process-wide and
//! carry a single `in_use` flag; a lease is exclusive until released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_SKIP_MS: u64 = 30_000;

#[derive(Debug, Default)]
struct CredentialSlot {
    in_use: bool,
}

#[derive(Debug)]
struct ModelRing {
    owner: String,
    ring: Vec<String>,
    cursor: usize,
    skips: HashMap<String, Instant>,
}

#[derive(Default)]
struct PoolInner {
    models: HashMap<String, ModelRing>,
    creds: HashMap<String, CredentialSlot>,
}

#[derive(Default)]
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently extends each model's ring with the given credentials and
    /// records the owner tag. A later registration may overwrite the tag
    /// with a non-empty value.
    pub fn register(&self, model_ids: &[String], credential_ids: &[String], owner_tag: &str) {
        let mut inner = self.inner.lock();
        for id in credential_ids {
            inner.creds.entry(id.clone()).or_default();
        }
        for model in model_ids {
            let ring = inner
                .models
                .entry(model.clone())
                .or_insert_with(|| ModelRing {
                    owner: owner_tag.to_string(),
                    ring: Vec::new(),
                    cursor: 0,
                    skips: HashMap::new(),
                });
            if !owner_tag.is_empty() {
                ring.owner = owner_tag.to_string();
            }
            for id in credential_ids {
                if !ring.ring.contains(id) {
                    ring.ring.push(id.clone());
                }
            }
        }
    }

    pub fn owner_tag(&self, model: &str) -> Option<String> {
        self.inner.lock().models.get(model).map(|r| r.owner.clone())
    }

    pub fn acquire(&self, model: &str) -> Option<String> {
        self.acquire_excluding(model, &HashSet::new())
    }

    /// Scans at most `ring.len()` entries starting at the cursor, advancing
    /// it on every step regardless of outcome. A candidate is taken iff it
    /// is not leased, not inside a skip window, not excluded, and still
    /// known to the credential map.
    pub fn acquire_excluding(&self, model: &str, exclude: &HashSet<String>) -> Option<String> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let PoolInner { models, creds } = &mut *guard;
        let ring = models.get_mut(model)?;
        if ring.ring.is_empty() {
            return None;
        }

        for _ in 0..ring.ring.len() {
            let idx = ring.cursor % ring.ring.len();
            ring.cursor = (ring.cursor + 1) % ring.ring.len();
            let candidate = ring.ring[idx].clone();

            if exclude.contains(&candidate) {
                continue;
            }
            if let Some(until) = ring.skips.get(&candidate) {
                if *until > now {
                    continue;
                }
            }
            match creds.get_mut(&candidate) {
                Some(slot) if !slot.in_use => {
                    slot.in_use = true;
                    tracing::debug!("[Pool] Leased {} for model {}", candidate, model);
                    return Some(candidate);
                }
                _ => continue,
            }
        }
        None
    }

    /// Clears the `in_use` flag. Idempotent; releasing an unknown id is a
    /// no-op.
    pub fn release(&self, credential_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.creds.get_mut(credential_id) {
            slot.in_use = false;
        }
    }

    pub fn skip(&self, model: &str, credential_id: &str, duration_ms: u64) {
        let until = Instant::now() + Duration::from_millis(duration_ms);
        let mut inner = self.inner.lock();
        if let Some(ring) = inner.models.get_mut(model) {
            ring.skips.insert(credential_id.to_string(), until);
            tracing::debug!(
                "[Pool] Skipping {} on model {} for {}ms",
                credential_id,
                model,
                duration_ms
            );
        }
    }

    pub fn clear_skip(&self, model: &str, credential_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(ring) = inner.models.get_mut(model) {
            ring.skips.remove(credential_id);
        }
    }

    pub fn is_in_use(&self, credential_id: &str) -> bool {
        self.inner
            .lock()
            .creds
            .get(credential_id)
            .map(|s| s.in_use)
            .unwrap_or(false)
    }

    pub fn ring_len(&self, model: &str) -> usize {
        self.inner
            .lock()
            .models
            .get(model)
            .map(|r| r.ring.len())
            .unwrap_or(0)
    }
}

/// RAII lease over a pooled credential. Dropping the lease releases it, so
/// every exit path (including client disconnect mid-stream) releases
/// exactly once.
pub struct Lease {
    pool: Arc<CredentialPool>,
    model: String,
    credential_id: String,
}

impl Lease {
    pub fn new(pool: Arc<CredentialPool>, model: &str, credential_id: String) -> Self {
        Self {
            pool,
            model: model.to_string(),
            credential_id,
        }
    }

    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    /// Marks the lease's credential for a cooldown window; the lease itself
    /// stays held until drop.
    pub fn skip(&self, duration_ms: u64) {
        self.pool.skip(&self.model, &self.credential_id, duration_ms);
    }

    /// Called on upstream success so a previous transient failure does not
    /// keep the credential benched.
    pub fn clear_skip(&self) {
        self.pool.clear_skip(&self.model, &self.credential_id);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(&self.credential_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(model: &str, creds: &[&str]) -> CredentialPool {
        let pool = CredentialPool::new();
        pool.register(
            &[model.to_string()],
            &creds.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "test",
        );
        pool
    }

    #[test]
    fn acquire_rotates_round_robin() {
        let pool = pool_with("m", &["a", "b"]);
        let first = pool.acquire("m").expect("first lease");
        pool.release(&first);
        let second = pool.acquire("m").expect("second lease");
        assert_ne!(first, second, "cursor should advance past the first pick");
    }

    #[test]
    fn leased_credential_is_not_handed_out_twice() {
        let pool = pool_with("m", &["a"]);
        let first = pool.acquire("m").expect("lease");
        assert!(pool.is_in_use(&first));
        assert_eq!(pool.acquire("m"), None);
        pool.release(&first);
        assert_eq!(pool.acquire("m"), Some(first));
    }

    #[test]
    fn release_is_idempotent() {
        let pool = pool_with("m", &["a"]);
        let id = pool.acquire("m").expect("lease");
        pool.release(&id);
        pool.release(&id);
        assert!(pool.acquire("m").is_some());
    }

    #[test]
    fn skip_window_excludes_credential_until_cleared() {
        let pool = pool_with("m", &["x", "y"]);
        let first = pool.acquire("m").expect("lease x");
        assert_eq!(first, "x");
        pool.release("x");
        pool.skip("m", "x", 60_000);
        assert_eq!(pool.acquire("m"), Some("y".to_string()));
        pool.release("y");
        // Everything else is skipped or leased-out: nothing available.
        assert_eq!(pool.acquire("m"), Some("y".to_string()));
        pool.release("y");
        pool.clear_skip("m", "x");
        // Cursor has moved; x becomes eligible again within one full scan.
        let got = pool.acquire("m").expect("lease after clear");
        assert!(got == "x" || got == "y");
    }

    #[test]
    fn expired_skip_window_readmits_credential() {
        let pool = pool_with("m", &["x"]);
        pool.skip("m", "x", 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.acquire("m"), Some("x".to_string()));
    }

    #[test]
    fn skip_routes_to_sibling_then_expires() {
        let pool = pool_with("m", &["x", "y"]);
        let first = pool.acquire("m").expect("first lease");
        pool.release(&first);
        pool.skip("m", &first, 150);

        let second = pool.acquire("m").expect("second lease");
        assert_ne!(second, first);
        pool.release(&second);

        std::thread::sleep(Duration::from_millis(200));
        let mut seen = HashSet::new();
        for _ in 0..2 {
            let id = pool.acquire("m").expect("lease after expiry");
            seen.insert(id.clone());
            pool.release(&id);
        }
        assert!(seen.contains(&first), "expired skip must readmit the credential");
    }

    #[test]
    fn exhausted_ring_returns_none_and_advances_full_cycle() {
        let pool = pool_with("m", &["a", "b", "c"]);
        pool.skip("m", "a", 60_000);
        pool.skip("m", "b", 60_000);
        pool.skip("m", "c", 60_000);
        assert_eq!(pool.acquire("m"), None);
        // The cursor advanced by exactly ring.len(); the next scan starts
        // where the previous one did.
        pool.clear_skip("m", "a");
        assert_eq!(pool.acquire("m"), Some("a".to_string()));
    }

    #[test]
    fn register_is_idempotent_and_updates_owner() {
        let pool = pool_with("m", &["a"]);
        pool.register(&["m".to_string()], &["a".to_string()], "");
        assert_eq!(pool.ring_len("m"), 1);
        assert_eq!(pool.owner_tag("m").as_deref(), Some("test"));
        pool.register(&["m".to_string()], &[], "renamed");
        assert_eq!(pool.owner_tag("m").as_deref(), Some("renamed"));
    }

    #[test]
    fn acquire_excluding_passes_over_tried_credentials() {
        let pool = pool_with("m", &["a", "b"]);
        let mut tried = HashSet::new();
        tried.insert("a".to_string());
        assert_eq!(pool.acquire_excluding("m", &tried), Some("b".to_string()));
    }

    #[test]
    fn concurrent_acquires_never_double_lease() {
        let pool = Arc::new(pool_with("m", &["a", "b", "c"]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let mut held = 0usize;
                for _ in 0..200 {
                    if let Some(id) = pool.acquire("m") {
                        // While held, nobody else may hold the same id.
                        assert!(pool.is_in_use(&id));
                        held += 1;
                        pool.release(&id);
                    }
                }
                held
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().expect("thread")).sum();
        assert!(total > 0);
        // Everything released at the end.
        for id in ["a", "b", "c"] {
            assert!(!pool.is_in_use(id));
        }
    }

    #[test]
    fn lease_releases_on_drop() {
        let pool = Arc::new(pool_with("m", &["a"]));
        {
            let id = pool.acquire("m").expect("lease");
            let _lease = Lease::new(pool.clone(), "m", id);
            assert!(pool.is_in_use("a"));
        }
        assert!(!pool.is_in_use("a"));
    }
}
