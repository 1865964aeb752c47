//! Release Router & Canary Rule Engine (C5): decides which release a client sees
//! and validates canary rules before they're allowed to publish.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{CoreError, StoreError};
use crate::model::{CanaryRule, Release};

/// Read/write boundary to release storage. Production persistence is out of
/// scope for this crate.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn latest_published(
        &self,
        namespace_id: i64,
        environment: &str,
    ) -> Result<Option<Release>, StoreError>;

    async fn get(&self, release_id: i64) -> Result<Release, StoreError>;

    async fn save(&self, release: Release) -> Result<(), StoreError>;

    async fn next_version(&self, namespace_id: i64, environment: &str) -> Result<i64, StoreError>;
}

/// Validates a canary rule: percentage in range, every IP range parses, and
/// at least one selector is non-empty.
pub fn validate_canary_rule(rule: &CanaryRule) -> Result<(), CoreError> {
    if rule.percentage > 100 {
        return Err(CoreError::InvalidCanaryRule(format!(
            "percentage {} is out of range 0..=100",
            rule.percentage
        )));
    }
    for range in &rule.ip_ranges {
        if parse_ip_range(range).is_none() {
            return Err(CoreError::InvalidCanaryRule(format!(
                "ip_range {range:?} is not a valid IP or CIDR"
            )));
        }
    }
    if rule.client_ids.is_empty() && rule.ip_ranges.is_empty() && rule.percentage == 0 {
        return Err(CoreError::InvalidCanaryRule(
            "canary rule must set at least one of client_ids, ip_ranges, percentage".into(),
        ));
    }
    Ok(())
}

fn parse_ip_range(range: &str) -> Option<IpNetwork> {
    IpNetwork::from_str(range)
        .ok()
        .or_else(|| range.parse::<IpAddr>().ok().map(IpNetwork::from))
}

/// `client_id` against a whitelist entry that may contain `*` wildcards anywhere:
/// prefix (`abc*`), suffix (`*abc`), or interior (`a*c`). An entry with no `*` is
/// an exact match.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// `(u32 from the first 4 bytes of md5(client_id)) % 100 < percentage`.
fn in_percentage_bucket(client_id: &str, percentage: u8) -> bool {
    if percentage == 0 {
        return false;
    }
    let digest = md5::compute(client_id.as_bytes());
    let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100;
    (bucket as u64) < percentage as u64
}

/// Whether `client_id`/`client_ip` match a canary rule. Match order: client id
/// whitelist, then IP range, then consistent-hash bucket.
pub fn canary_rule_matches(rule: &CanaryRule, client_id: &str, client_ip: Option<&str>) -> bool {
    if rule.client_ids.iter().any(|pat| wildcard_match(pat, client_id)) {
        return true;
    }
    if let Some(ip) = client_ip.and_then(|s| IpAddr::from_str(s).ok()) {
        if rule
            .ip_ranges
            .iter()
            .filter_map(|r| parse_ip_range(r))
            .any(|net| net.contains(ip))
        {
            return true;
        }
    }
    in_percentage_bucket(client_id, rule.percentage)
}

/// Resolves, per client, whether the canary overlay of the latest published
/// release applies.
pub struct ReleaseRouter<S: ReleaseStore> {
    store: S,
}

/// Outcome of resolving a release for one client.
pub struct ResolvedRelease {
    pub release: Option<Release>,
    pub canary_matched: bool,
}

impl<S: ReleaseStore> ReleaseRouter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn resolve_for_client(
        &self,
        namespace_id: i64,
        environment: &str,
        client_id: &str,
        client_ip: Option<&str>,
    ) -> Result<ResolvedRelease, CoreError> {
        let release = self
            .store
            .latest_published(namespace_id, environment)
            .await?;

        let Some(release) = release else {
            return Ok(ResolvedRelease { release: None, canary_matched: false });
        };

        let canary_matched = match (&release.release_type, &release.canary_rule) {
            (crate::model::ReleaseType::Canary, Some(rule)) => {
                canary_rule_matches(rule, client_id, client_ip)
            }
            _ => false,
        };

        Ok(ResolvedRelease { release: Some(release), canary_matched })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_requires_full_equality() {
        assert!(wildcard_match("client-1", "client-1"));
        assert!(!wildcard_match("client-1", "client-12"));
    }

    #[test]
    fn wildcard_prefix_suffix_and_interior() {
        assert!(wildcard_match("client-*", "client-42"));
        assert!(wildcard_match("*-42", "client-42"));
        assert!(wildcard_match("cli*-42", "client-42"));
        assert!(!wildcard_match("other-*", "client-42"));
    }

    #[test]
    fn star_alone_matches_everything() {
        assert!(wildcard_match("*", "anything"));
    }

    #[test]
    fn percentage_bucket_is_deterministic() {
        let a = in_percentage_bucket("client-abc", 50);
        let b = in_percentage_bucket("client-abc", 50);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_percentage_never_matches() {
        for client in ["a", "b", "c", "some-client-id"] {
            assert!(!in_percentage_bucket(client, 0));
        }
    }

    #[test]
    fn hundred_percentage_always_matches() {
        for client in ["a", "b", "c", "some-client-id"] {
            assert!(in_percentage_bucket(client, 100));
        }
    }

    #[test]
    fn validate_rejects_out_of_range_percentage() {
        let rule = CanaryRule { percentage: 101, ..Default::default() };
        assert!(validate_canary_rule(&rule).is_err());
    }

    #[test]
    fn validate_rejects_bad_ip_range() {
        let rule = CanaryRule {
            ip_ranges: vec!["not-an-ip".to_string()],
            ..Default::default()
        };
        assert!(validate_canary_rule(&rule).is_err());
    }

    #[test]
    fn validate_rejects_all_empty_selectors() {
        let rule = CanaryRule::default();
        assert!(validate_canary_rule(&rule).is_err());
    }

    #[test]
    fn validate_accepts_percentage_only() {
        let rule = CanaryRule { percentage: 10, ..Default::default() };
        assert!(validate_canary_rule(&rule).is_ok());
    }

    #[test]
    fn cidr_and_exact_ip_both_parse() {
        assert!(parse_ip_range("10.0.0.0/8").is_some());
        assert!(parse_ip_range("10.0.0.5").is_some());
        assert!(parse_ip_range("garbage").is_none());
    }

    #[test]
    fn ip_range_match_honors_cidr() {
        let rule = CanaryRule {
            ip_ranges: vec!["10.0.0.0/24".to_string()],
            ..Default::default()
        };
        assert!(canary_rule_matches(&rule, "someone", Some("10.0.0.42")));
        assert!(!canary_rule_matches(&rule, "someone", Some("10.0.1.42")));
    }
}
