//! Configuration hashing for change detection.
//!
//! The applied state stores one hash per resource. A resource whose hash
//! is unchanged is not diffed field by field.

use sha2::{Digest, Sha256};

use super::spec::{DeployConfig, ResourceConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of every managed resource, in reconciliation order.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();
        for (key, resource) in config.keyed_resources() {
            hasher.update(key.as_bytes());
            hasher.update(self.hash_resource(&resource).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource.
    ///
    /// Security group rules are sorted first; their order carries no meaning.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let canonical = match resource {
            ResourceConfig::SecurityGroup(group) => {
                let mut group = group.clone();
                group.rules.sort();
                serde_json::to_vec(&ResourceConfig::SecurityGroup(group))
            }
            other => serde_json::to_vec(other),
        };

        let mut hasher = Sha256::new();
        // Serializing plain data cannot fail; fall back to the key regardless.
        match canonical {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(resource.key().as_bytes()),
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleDirection, RuleProtocol, SecurityGroupConfig, SecurityRule};

    fn rule(protocol: RuleProtocol) -> SecurityRule {
        SecurityRule {
            protocol,
            rule_type: RuleDirection::Inbound,
            ip: None,
            size: None,
            range: None,
            icmp_type: None,
            network_id: None,
        }
    }

    fn group(name: &str, rules: Vec<SecurityRule>) -> ResourceConfig {
        ResourceConfig::SecurityGroup(SecurityGroupConfig {
            name: name.to_string(),
            description: None,
            permissions: None,
            uid: None,
            gid: None,
            rules,
            commit: true,
            commit_outdated_only: false,
        })
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let resource = group("web", vec![rule(RuleProtocol::Tcp)]);

        assert_eq!(hasher.hash_resource(&resource), hasher.hash_resource(&resource));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = ConfigHasher::new();
        let a = group("web", vec![]);
        let b = group("db", vec![]);

        assert_ne!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_rule_order_does_not_change_hash() {
        let hasher = ConfigHasher::new();
        let a = group("web", vec![rule(RuleProtocol::Tcp), rule(RuleProtocol::Icmp)]);
        let b = group("web", vec![rule(RuleProtocol::Icmp), rule(RuleProtocol::Tcp)]);

        assert_eq!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
