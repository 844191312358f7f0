//! Block list / host predicate
//!
//! Decides whether a host should be short-circuited to `204 No Content` before any origin
//! fetch, under the `remove_ads` / `remove_tracking` flags. The production hostname list is
//! intentionally left pluggable; this ships a small illustrative built-in set behind a
//! predicate a real deployment can swap in, matched by exact host or `*.suffix`.

use std::collections::HashSet;

/// Capability consumed by the Response Pipeline to decide whether to block a host.
pub trait BlockListPredicate: Send + Sync {
    fn should_block(&self, host: &str, remove_ads: bool, remove_tracking: bool) -> bool;
}

/// Small built-in set of well-known ad/tracker hostnames, partitioned into an ads set and a
/// tracking set, matched by exact host or `*.suffix`.
pub struct StaticBlockList {
    ads: HashSet<&'static str>,
    tracking: HashSet<&'static str>,
}

impl StaticBlockList {
    pub fn new() -> Self {
        Self {
            ads: [
                "doubleclick.net",
                "googlesyndication.com",
                "googleadservices.com",
                "adnxs.com",
            ]
            .into_iter()
            .collect(),
            tracking: [
                "google-analytics.com",
                "scorecardresearch.com",
                "segment.io",
                "mixpanel.com",
            ]
            .into_iter()
            .collect(),
        }
    }

    fn matches(set: &HashSet<&'static str>, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        set.iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
    }
}

impl Default for StaticBlockList {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockListPredicate for StaticBlockList {
    fn should_block(&self, host: &str, remove_ads: bool, remove_tracking: bool) -> bool {
        let host = host.to_ascii_lowercase();
        (remove_ads && Self::matches(&self.ads, &host))
            || (remove_tracking && Self::matches(&self.tracking, &host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_exact_and_subdomain_matches_when_flag_is_set() {
        let list = StaticBlockList::new();
        assert!(list.should_block("doubleclick.net", true, true));
        assert!(list.should_block("ad.doubleclick.net", true, true));
        assert!(!list.should_block("example.com", true, true));
    }

    #[test]
    fn respects_independent_ads_and_tracking_flags() {
        let list = StaticBlockList::new();
        assert!(!list.should_block("doubleclick.net", false, true));
        assert!(list.should_block("google-analytics.com", false, true));
        assert!(!list.should_block("google-analytics.com", true, false));
    }

    #[test]
    fn is_case_insensitive() {
        let list = StaticBlockList::new();
        assert!(list.should_block("DoubleClick.NET", true, true));
    }
}
