//! Counter key construction.

use serde::{Deserialize, Serialize};

use super::descriptor::{Dimension, RequestDescriptor};
use super::rules::RateLimitRule;
use super::window::RateLimitTimeInterval;

const KEY_DELIMITER: char = ':';
const ESCAPE: char = '\\';

/// Order in which descriptor fields are folded into a key.
const KEY_FIELDS: [Dimension; 3] = [
    Dimension::RequestType,
    Dimension::Account,
    Dimension::ClientIp,
];

/// Which descriptor fields take part in a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    /// Only the fields the matched rule constrains. Every request matched
    /// by the rule shares one counter per window.
    #[default]
    Rule,
    /// Every field the descriptor carries. A rule then counts each distinct
    /// client separately, including on dimensions it does not constrain.
    Descriptor,
}

/// Key of one window counter in the counter store.
///
/// Format: `{prefix}:type={t}:account={a}:ip={ip}:{INTERVAL}:{bucket}` with
/// absent fields left out. `:` and `\` inside values are escaped with `\`,
/// so distinct inputs never produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CounterKey(String);

impl CounterKey {
    pub fn build(
        prefix: &str,
        scope: KeyScope,
        rule: &RateLimitRule,
        descriptor: &RequestDescriptor,
        interval: RateLimitTimeInterval,
        bucket: i64,
    ) -> Self {
        let mut key = String::with_capacity(64);
        push_escaped(&mut key, prefix);

        for dimension in KEY_FIELDS {
            if scope == KeyScope::Rule && !rule.constrains(dimension) {
                continue;
            }
            if let Some(value) = descriptor.get(dimension) {
                key.push(KEY_DELIMITER);
                key.push_str(dimension.tag());
                key.push('=');
                push_escaped(&mut key, value);
            }
        }

        key.push(KEY_DELIMITER);
        key.push_str(interval.name());
        key.push(KEY_DELIMITER);
        key.push_str(&bucket.to_string());

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == KEY_DELIMITER || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: RateLimitTimeInterval = RateLimitTimeInterval::Minute;

    fn wildcard_rule() -> RateLimitRule {
        RateLimitRule::new(MINUTE, 100)
    }

    fn key(scope: KeyScope, rule: &RateLimitRule, descriptor: &RequestDescriptor, bucket: i64) -> String {
        CounterKey::build("request", scope, rule, descriptor, rule.time_interval, bucket)
            .as_str()
            .to_string()
    }

    #[test]
    fn test_key_layout() {
        let descriptor = RequestDescriptor::default()
            .with_client_ip("10.0.0.1")
            .with_account("u1")
            .with_request_type("login");

        assert_eq!(
            key(KeyScope::Descriptor, &wildcard_rule(), &descriptor, 7),
            "request:type=login:account=u1:ip=10.0.0.1:MINUTE:7"
        );
    }

    #[test]
    fn test_same_fields_same_bucket_same_key() {
        let rule = RateLimitRule::new(MINUTE, 2).with_request_type("login");
        let first = RequestDescriptor::default().with_request_type("login").with_account("u1");
        let second = RequestDescriptor::default().with_account("u1").with_request_type("login");

        assert_eq!(
            key(KeyScope::Descriptor, &rule, &first, 100),
            key(KeyScope::Descriptor, &rule, &second, 100)
        );
        assert_ne!(
            key(KeyScope::Descriptor, &rule, &first, 100),
            key(KeyScope::Descriptor, &rule, &first, 101)
        );
    }

    #[test]
    fn test_interval_is_part_of_key() {
        let descriptor = RequestDescriptor::default().with_account("u1");
        let minute = CounterKey::build("request", KeyScope::Descriptor, &wildcard_rule(), &descriptor, MINUTE, 1);
        let hour = CounterKey::build(
            "request",
            KeyScope::Descriptor,
            &wildcard_rule(),
            &descriptor,
            RateLimitTimeInterval::Hour,
            1,
        );
        assert_ne!(minute, hour);
    }

    #[test]
    fn test_dimension_tags_prevent_collisions() {
        let as_type = RequestDescriptor::default().with_request_type("10.0.0.1");
        let as_ip = RequestDescriptor::default().with_client_ip("10.0.0.1");

        assert_ne!(
            key(KeyScope::Descriptor, &wildcard_rule(), &as_type, 1),
            key(KeyScope::Descriptor, &wildcard_rule(), &as_ip, 1)
        );
    }

    #[test]
    fn test_delimiters_in_values_are_escaped() {
        let joined = RequestDescriptor::default().with_request_type("a:account=b");
        let split = RequestDescriptor::default().with_request_type("a").with_account("b");

        let joined_key = key(KeyScope::Descriptor, &wildcard_rule(), &joined, 1);
        assert_eq!(joined_key, "request:type=a\\:account=b:MINUTE:1");
        assert_ne!(joined_key, key(KeyScope::Descriptor, &wildcard_rule(), &split, 1));
    }

    #[test]
    fn test_rule_scope_folds_only_constrained_fields() {
        let rule = RateLimitRule::new(MINUTE, 2).with_request_type("login");
        let u1 = RequestDescriptor::default().with_request_type("login").with_account("u1");
        let u2 = RequestDescriptor::default().with_request_type("login").with_account("u2");

        assert_eq!(key(KeyScope::Rule, &rule, &u1, 3), "request:type=login:MINUTE:3");
        assert_eq!(key(KeyScope::Rule, &rule, &u1, 3), key(KeyScope::Rule, &rule, &u2, 3));
        assert_ne!(
            key(KeyScope::Descriptor, &rule, &u1, 3),
            key(KeyScope::Descriptor, &rule, &u2, 3)
        );
    }

    #[test]
    fn test_wildcard_rule_under_rule_scope_is_global() {
        let descriptor = RequestDescriptor::default().with_account("u1");
        assert_eq!(key(KeyScope::Rule, &wildcard_rule(), &descriptor, 9), "request:MINUTE:9");
    }
}
