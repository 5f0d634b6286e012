//! Rate limit rules, their loading, and rule resolution.
//!
//! A rule constrains up to three request attributes. An absent or blank
//! matcher is a wildcard. When several rules match a descriptor the most
//! specific one applies, under the total order defined by [`Specificity`].

use std::cmp::Reverse;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::descriptor::{Dimension, RequestDescriptor};
use super::window::RateLimitTimeInterval;
use crate::error::{Result, WardenError};

/// A configured limit: optional matchers, a window, and an allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Account to match (absent or blank matches any account)
    #[serde(default)]
    pub account_id: Option<String>,
    /// Client IP to match (absent or blank matches any IP)
    #[serde(default)]
    pub client_ip: Option<String>,
    /// Request type to match (absent or blank matches any type)
    #[serde(default)]
    pub request_type: Option<String>,
    /// Window the allowance applies to
    pub time_interval: RateLimitTimeInterval,
    /// Requests allowed per window
    pub allowed_number_of_requests: u64,
    /// Optional name for logs and verdicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Rank of a rule among matching candidates. Greater is more specific.
///
/// Ordering, field by field: number of constrained dimensions, then whether
/// the account, the client IP, and the request type are constrained. A rule
/// whose constrained set strictly contains another's always ranks higher;
/// rules constraining different dimensions are ranked account first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    constrained: u8,
    account: bool,
    client_ip: bool,
    request_type: bool,
}

impl RateLimitRule {
    /// A rule that matches every request.
    pub fn new(time_interval: RateLimitTimeInterval, allowed_number_of_requests: u64) -> Self {
        Self {
            account_id: None,
            client_ip: None,
            request_type: None,
            time_interval,
            allowed_number_of_requests,
            name: None,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Concrete matcher for `dimension`, or `None` for a wildcard.
    pub fn matcher(&self, dimension: Dimension) -> Option<&str> {
        let raw = match dimension {
            Dimension::Account => self.account_id.as_deref(),
            Dimension::ClientIp => self.client_ip.as_deref(),
            Dimension::RequestType => self.request_type.as_deref(),
        };
        raw.filter(|v| !v.trim().is_empty())
    }

    pub fn constrains(&self, dimension: Dimension) -> bool {
        self.matcher(dimension).is_some()
    }

    /// Whether every constrained dimension equals the descriptor's value.
    /// A descriptor missing a constrained dimension never matches.
    pub fn matches(&self, descriptor: &RequestDescriptor) -> bool {
        [Dimension::Account, Dimension::ClientIp, Dimension::RequestType]
            .into_iter()
            .all(|dimension| match self.matcher(dimension) {
                None => true,
                Some(expected) => descriptor.get(dimension) == Some(expected),
            })
    }

    pub fn specificity(&self) -> Specificity {
        let account = self.constrains(Dimension::Account);
        let client_ip = self.constrains(Dimension::ClientIp);
        let request_type = self.constrains(Dimension::RequestType);
        Specificity {
            constrained: account as u8 + client_ip as u8 + request_type as u8,
            account,
            client_ip,
            request_type,
        }
    }
}

impl std::fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            return f.write_str(name);
        }

        let matchers: Vec<String> = [Dimension::Account, Dimension::ClientIp, Dimension::RequestType]
            .into_iter()
            .filter_map(|d| self.matcher(d).map(|v| format!("{}={}", d.tag(), v)))
            .collect();
        let matchers = if matchers.is_empty() {
            "*".to_string()
        } else {
            matchers.join(",")
        };

        write!(
            f,
            "{} {}/{}",
            matchers, self.allowed_number_of_requests, self.time_interval
        )
    }
}

/// Rule files hold either a bare list or a document with a `rules` key.
#[derive(Deserialize)]
struct RuleDocument {
    #[serde(default)]
    rules: Vec<RateLimitRule>,
}

/// The validated, immutable collection of configured rules.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Validate and wrap a list of rules. Definition order is kept and
    /// decides ties between equally specific rules.
    pub fn new(rules: Vec<RateLimitRule>) -> Result<Self> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.allowed_number_of_requests == 0 {
                return Err(WardenError::Config(format!(
                    "rule #{} ({}) must allow at least one request",
                    index, rule
                )));
            }

            let shadowed_by = rules[..index].iter().position(|earlier| {
                [Dimension::Account, Dimension::ClientIp, Dimension::RequestType]
                    .into_iter()
                    .all(|d| earlier.matcher(d) == rule.matcher(d))
            });
            if let Some(earlier) = shadowed_by {
                warn!(rule = index, shadowed_by = earlier, "Rule can never apply; an earlier rule has the same matchers");
            }
        }

        Ok(Self { rules })
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parse_error =
            |e: serde_yaml::Error| WardenError::Config(format!("Failed to parse rate limit rules: {}", e));

        let value: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_error)?;
        let rules = if value.is_sequence() {
            serde_yaml::from_value::<Vec<RateLimitRule>>(value).map_err(parse_error)?
        } else {
            serde_yaml::from_value::<RuleDocument>(value)
                .map_err(parse_error)?
                .rules
        };

        Self::new(rules)
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules paired with their definition index, in the order the resolver
    /// prefers them.
    pub fn by_priority(&self) -> Vec<(usize, &RateLimitRule)> {
        let mut ranked: Vec<_> = self.rules.iter().enumerate().collect();
        ranked.sort_by_key(|&(index, rule)| (Reverse(rule.specificity()), index));
        ranked
    }
}

/// Selects the single rule that applies to a descriptor.
#[derive(Debug, Clone)]
pub struct RuleResolver {
    rules: Arc<RuleSet>,
}

impl RuleResolver {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The most specific matching rule, or `None` when no rule matches.
    pub fn resolve(&self, descriptor: &RequestDescriptor) -> Option<&RateLimitRule> {
        self.resolve_indexed(descriptor).map(|(_, rule)| rule)
    }

    /// Like [`resolve`](Self::resolve), also returning the rule's
    /// definition index.
    ///
    /// Candidates are ranked by [`Specificity`]; equally specific rules are
    /// decided by definition order, earliest first.
    pub fn resolve_indexed(&self, descriptor: &RequestDescriptor) -> Option<(usize, &RateLimitRule)> {
        self.rules
            .rules()
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(descriptor))
            .max_by_key(|&(index, rule)| (rule.specificity(), Reverse(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: RateLimitTimeInterval = RateLimitTimeInterval::Minute;
    const HOUR: RateLimitTimeInterval = RateLimitTimeInterval::Hour;

    fn resolver(rules: Vec<RateLimitRule>) -> RuleResolver {
        RuleResolver::new(Arc::new(RuleSet::new(rules).unwrap()))
    }

    fn descriptor(account: Option<&str>, ip: Option<&str>, kind: Option<&str>) -> RequestDescriptor {
        RequestDescriptor::new(
            account.map(str::to_string),
            ip.map(str::to_string),
            kind.map(str::to_string),
        )
    }

    /// Whether `a` constrains every dimension `b` does, plus at least one more.
    fn refines(a: &Specificity, b: &Specificity) -> bool {
        let covers = (a.account || !b.account)
            && (a.client_ip || !b.client_ip)
            && (a.request_type || !b.request_type);
        covers && a.constrained > b.constrained
    }

    fn all_descriptors() -> Vec<RequestDescriptor> {
        let accounts = [None, Some("u1"), Some("u2")];
        let ips = [None, Some("10.0.0.1")];
        let kinds = [None, Some("login"), Some("LOGIN")];

        let mut out = Vec::new();
        for a in accounts {
            for i in ips {
                for k in kinds {
                    out.push(descriptor(a, i, k));
                }
            }
        }
        out
    }

    #[test]
    fn test_parse_rule_list() {
        let yaml = r#"
- request_type: login
  time_interval: MINUTE
  allowed_number_of_requests: 2
- time_interval: HOUR
  allowed_number_of_requests: 100
  name: global
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.rules()[0].request_type.as_deref(), Some("login"));
        assert_eq!(rules.rules()[1].time_interval, HOUR);
        assert_eq!(rules.rules()[1].to_string(), "global");
    }

    #[test]
    fn test_parse_rule_document() {
        let yaml = r#"
rules:
  - account_id: u1
    client_ip: ""
    time_interval: minute
    allowed_number_of_requests: 10
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules.rules()[0].constrains(Dimension::Account));
        assert!(!rules.rules()[0].constrains(Dimension::ClientIp));
    }

    #[test]
    fn test_zero_allowance_rejected() {
        let yaml = r#"
- time_interval: MINUTE
  allowed_number_of_requests: 0
"#;
        assert!(matches!(RuleSet::from_yaml(yaml), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_unknown_interval_rejected() {
        let yaml = r#"
- time_interval: DAY
  allowed_number_of_requests: 5
"#;
        match RuleSet::from_yaml(yaml) {
            Err(WardenError::Config(message)) => assert!(message.contains("DAY"), "{}", message),
            other => panic!("expected a configuration error, got {:?}", other),
        }

        let document = r#"
rules:
  - time_interval: DAY
    allowed_number_of_requests: 5
"#;
        match RuleSet::from_yaml(document) {
            Err(WardenError::Config(message)) => assert!(message.contains("DAY"), "{}", message),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_wildcard_rule_matches_everything() {
        let blank = RateLimitRule::new(MINUTE, 1)
            .with_account("")
            .with_client_ip("  ")
            .with_request_type("");
        for rule in [RateLimitRule::new(MINUTE, 1), blank] {
            for d in all_descriptors() {
                assert!(rule.matches(&d), "{} should match {}", rule, d);
            }
        }
    }

    #[test]
    fn test_constrained_dimension_requires_equal_value() {
        let rules = [
            RateLimitRule::new(MINUTE, 1).with_account("u1"),
            RateLimitRule::new(MINUTE, 1).with_client_ip("10.0.0.1"),
            RateLimitRule::new(MINUTE, 1).with_request_type("login"),
        ];
        let dimensions = [Dimension::Account, Dimension::ClientIp, Dimension::RequestType];

        for (rule, dimension) in rules.iter().zip(dimensions) {
            let expected = rule.matcher(dimension).unwrap();
            for d in all_descriptors() {
                assert_eq!(rule.matches(&d), d.get(dimension) == Some(expected), "{} vs {}", rule, d);
            }
        }
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let rule = RateLimitRule::new(MINUTE, 1).with_request_type("login");
        assert!(!rule.matches(&descriptor(None, None, Some("LOGIN"))));
    }

    #[test]
    fn test_no_rule_matches() {
        let resolver = resolver(vec![RateLimitRule::new(MINUTE, 1).with_account("u1")]);
        assert!(resolver.resolve(&descriptor(Some("u2"), None, None)).is_none());
        assert!(resolver.resolve(&RequestDescriptor::default()).is_none());
    }

    #[test]
    fn test_specific_rule_beats_wildcard() {
        let resolver = resolver(vec![
            RateLimitRule::new(MINUTE, 100),
            RateLimitRule::new(MINUTE, 2).with_request_type("login"),
        ]);

        let rule = resolver.resolve(&descriptor(None, None, Some("login"))).unwrap();
        assert_eq!(rule.allowed_number_of_requests, 2);

        let rule = resolver.resolve(&descriptor(None, None, Some("upload"))).unwrap();
        assert_eq!(rule.allowed_number_of_requests, 100);
    }

    #[test]
    fn test_refining_rule_wins_regardless_of_order() {
        let narrow = RateLimitRule::new(MINUTE, 1)
            .with_account("u1")
            .with_request_type("login");
        let broad = RateLimitRule::new(MINUTE, 50).with_account("u1");
        let d = descriptor(Some("u1"), Some("10.0.0.1"), Some("login"));

        for rules in [vec![narrow.clone(), broad.clone()], vec![broad.clone(), narrow.clone()]] {
            let resolver = resolver(rules);
            for _ in 0..3 {
                assert_eq!(resolver.resolve(&d), Some(&narrow));
            }
        }
    }

    #[test]
    fn test_incomparable_rules_prefer_account_then_ip_then_type() {
        let by_type = RateLimitRule::new(MINUTE, 1).with_request_type("login");
        let by_ip = RateLimitRule::new(MINUTE, 2).with_client_ip("10.0.0.1");
        let by_account = RateLimitRule::new(MINUTE, 3).with_account("u1");
        let full = descriptor(Some("u1"), Some("10.0.0.1"), Some("login"));

        let resolver_all = resolver(vec![by_type.clone(), by_ip.clone(), by_account.clone()]);
        assert_eq!(resolver_all.resolve(&full), Some(&by_account));

        let resolver_no_account = resolver(vec![by_type.clone(), by_ip.clone()]);
        assert_eq!(resolver_no_account.resolve(&full), Some(&by_ip));
    }

    #[test]
    fn test_more_constrained_dimensions_beat_account_priority() {
        let ip_and_type = RateLimitRule::new(MINUTE, 1)
            .with_client_ip("10.0.0.1")
            .with_request_type("login");
        let account = RateLimitRule::new(MINUTE, 2).with_account("u1");
        let resolver = resolver(vec![account, ip_and_type.clone()]);

        let d = descriptor(Some("u1"), Some("10.0.0.1"), Some("login"));
        assert_eq!(resolver.resolve(&d), Some(&ip_and_type));
    }

    #[test]
    fn test_equal_specificity_prefers_first_defined() {
        let minute = RateLimitRule::new(MINUTE, 5).with_request_type("login");
        let hour = RateLimitRule::new(HOUR, 50).with_request_type("login");
        let resolver = resolver(vec![minute.clone(), hour]);

        let (index, rule) = resolver.resolve_indexed(&descriptor(None, None, Some("login"))).unwrap();
        assert_eq!(index, 0);
        assert_eq!(rule, &minute);
    }

    #[test]
    fn test_order_extends_refinement() {
        let rules: Vec<RateLimitRule> = (0..8u8)
            .map(|mask| {
                let mut rule = RateLimitRule::new(MINUTE, 1);
                if mask & 1 != 0 {
                    rule = rule.with_account("u1");
                }
                if mask & 2 != 0 {
                    rule = rule.with_client_ip("10.0.0.1");
                }
                if mask & 4 != 0 {
                    rule = rule.with_request_type("login");
                }
                rule
            })
            .collect();

        for a in &rules {
            for b in &rules {
                if refines(&a.specificity(), &b.specificity()) {
                    assert!(a.specificity() > b.specificity(), "{} should outrank {}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_by_priority_matches_resolution_order() {
        let set = RuleSet::new(vec![
            RateLimitRule::new(MINUTE, 100),
            RateLimitRule::new(MINUTE, 2).with_request_type("login"),
            RateLimitRule::new(MINUTE, 3).with_account("u1"),
            RateLimitRule::new(HOUR, 4).with_request_type("login"),
        ])
        .unwrap();

        let order: Vec<usize> = set.by_priority().into_iter().map(|(index, _)| index).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }
}
