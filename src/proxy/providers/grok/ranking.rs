//! Quota-informed token selection.
//!
//! Candidates are drawn in four bands: normal tokens with unknown quota,
//! normal tokens with known quota (largest residual first), then the same
//! two bands for super tokens. Heavy requests skip the normal bands
//! entirely; super tokens are the only ones allowed to carry them.

use crate::proxy::token_store::{GrokTokenFile, TokenTier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub sso: String,
    pub tier: TokenTier,
}

fn band(
    file: &GrokTokenFile,
    tier: TokenTier,
    heavy: bool,
    out: &mut Vec<Candidate>,
) {
    let mut unused: Vec<&String> = Vec::new();
    let mut used: Vec<(&String, i64)> = Vec::new();
    for (sso, entry) in file.map(tier) {
        if !entry.eligible(heavy) {
            continue;
        }
        match entry.quota_for(heavy) {
            -1 => unused.push(sso),
            remaining if remaining > 0 => used.push((sso, remaining)),
            _ => {}
        }
    }
    used.sort_by(|a, b| b.1.cmp(&a.1));

    out.extend(unused.into_iter().map(|sso| Candidate {
        sso: sso.clone(),
        tier,
    }));
    out.extend(used.into_iter().map(|(sso, _)| Candidate {
        sso: sso.clone(),
        tier,
    }));
}

pub fn rank_candidates(file: &GrokTokenFile, heavy: bool) -> Vec<Candidate> {
    let mut out = Vec::new();
    if !heavy {
        band(file, TokenTier::Normal, heavy, &mut out);
    }
    band(file, TokenTier::Super, heavy, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::token_store::GrokTokenEntry;

    fn entry(remaining: i64, heavy_remaining: i64, status: &str, failed: u32) -> GrokTokenEntry {
        GrokTokenEntry {
            created_time: 0,
            remaining_queries: remaining,
            heavy_remaining_queries: heavy_remaining,
            status: status.to_string(),
            failed_count: failed,
            last_failure_time: None,
            last_failure_reason: None,
        }
    }

    #[test]
    fn heavy_routes_to_super_only() {
        // Scenario: normal A with unknown quota, super B with residual 5.
        let mut file = GrokTokenFile::default();
        file.sso_normal.insert("A".into(), entry(-1, -1, "active", 0));
        file.sso_super.insert("B".into(), entry(-1, 5, "active", 0));

        let heavy = rank_candidates(&file, true);
        assert_eq!(heavy.len(), 1);
        assert_eq!(heavy[0].sso, "B");
        assert_eq!(heavy[0].tier, TokenTier::Super);

        let normal = rank_candidates(&file, false);
        assert_eq!(normal[0].sso, "A", "non-heavy prefers the normal pool first");
    }

    #[test]
    fn unknown_quota_ranks_before_known_and_known_sorts_descending() {
        let mut file = GrokTokenFile::default();
        file.sso_normal.insert("low".into(), entry(2, -1, "active", 0));
        file.sso_normal.insert("high".into(), entry(9, -1, "active", 0));
        file.sso_normal.insert("fresh".into(), entry(-1, -1, "active", 0));

        let order: Vec<String> = rank_candidates(&file, false)
            .into_iter()
            .map(|c| c.sso)
            .collect();
        assert_eq!(order, vec!["fresh", "high", "low"]);
    }

    #[test]
    fn expired_failed_and_exhausted_tokens_are_filtered() {
        let mut file = GrokTokenFile::default();
        file.sso_normal.insert("expired".into(), entry(-1, -1, "expired", 0));
        file.sso_normal.insert("failed".into(), entry(-1, -1, "active", 3));
        file.sso_normal.insert("empty".into(), entry(0, -1, "active", 0));
        file.sso_normal.insert("ok".into(), entry(1, -1, "active", 2));

        let order: Vec<String> = rank_candidates(&file, false)
            .into_iter()
            .map(|c| c.sso)
            .collect();
        assert_eq!(order, vec!["ok"]);
    }

    #[test]
    fn normal_bands_precede_super_bands_for_non_heavy() {
        let mut file = GrokTokenFile::default();
        file.sso_super.insert("s1".into(), entry(-1, -1, "active", 0));
        file.sso_normal.insert("n1".into(), entry(3, -1, "active", 0));

        let order: Vec<String> = rank_candidates(&file, false)
            .into_iter()
            .map(|c| c.sso)
            .collect();
        assert_eq!(order, vec!["n1", "s1"]);
    }

    #[test]
    fn empty_store_yields_no_candidates() {
        let file = GrokTokenFile::default();
        assert!(rank_candidates(&file, false).is_empty());
        assert!(rank_candidates(&file, true).is_empty());
    }
}
