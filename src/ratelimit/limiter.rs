//! Core rate limiter: resolves a rule per descriptor and checks its window.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, trace};

use super::descriptor::RequestDescriptor;
use super::rules::{RateLimitRule, RuleResolver, RuleSet};
use super::window::{WindowLimiter, WindowStatus};
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::CounterStore;

/// Overall or per-descriptor decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    OverLimit,
}

/// The rule a descriptor resolved to.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedRule {
    /// Position of the rule in the configured rule set
    pub index: usize,
    pub rule: RateLimitRule,
}

/// What happened to one descriptor of a request.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptorStatus {
    /// Position of the descriptor in the evaluated request
    pub index: usize,
    pub descriptor: RequestDescriptor,
    /// `None` when no rule applied and the descriptor was skipped
    pub rule: Option<MatchedRule>,
    /// Counter outcome, present whenever a rule applied
    pub window: Option<WindowStatus>,
}

impl DescriptorStatus {
    pub fn code(&self) -> Code {
        match &self.window {
            Some(window) if window.should_limit => Code::OverLimit,
            _ => Code::Ok,
        }
    }
}

/// Decision for a whole request.
///
/// `statuses` lists the descriptors in evaluation order up to and including
/// the one that denied. Descriptors after a denial are not evaluated.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub overall_code: Code,
    pub statuses: Vec<DescriptorStatus>,
}

impl Verdict {
    pub fn should_limit(&self) -> bool {
        self.overall_code == Code::OverLimit
    }

    /// The descriptor that triggered the denial, if any.
    pub fn denied_by(&self) -> Option<&DescriptorStatus> {
        self.statuses
            .last()
            .filter(|status| status.code() == Code::OverLimit)
    }
}

/// The rate limiter shared by all request handlers.
///
/// Holds the immutable rule set and a handle to the counter store. It keeps
/// no per-request state, so one instance serves any number of concurrent
/// evaluations.
pub struct RateLimiter {
    resolver: RuleResolver,
    window: WindowLimiter,
}

impl RateLimiter {
    pub fn new(rules: Arc<RuleSet>, store: Arc<dyn CounterStore>, config: &LimiterConfig) -> Self {
        Self {
            resolver: RuleResolver::new(rules),
            window: WindowLimiter::new(store, config),
        }
    }

    pub fn resolver(&self) -> &RuleResolver {
        &self.resolver
    }

    /// Evaluate a request's descriptors against the current wall clock.
    pub async fn evaluate(&self, descriptors: &[RequestDescriptor]) -> Result<Verdict> {
        self.evaluate_at(descriptors, Utc::now()).await
    }

    /// Evaluate a request's descriptors as of `now`.
    ///
    /// Descriptors are checked in order and each distinct descriptor once.
    /// A descriptor without a matching rule is skipped. The first descriptor
    /// over its limit ends the evaluation with `OverLimit`; counters of the
    /// descriptors after it are left untouched. A store failure aborts the
    /// evaluation with the store error.
    #[instrument(skip(self, descriptors), fields(descriptor_count = descriptors.len()))]
    pub async fn evaluate_at(
        &self,
        descriptors: &[RequestDescriptor],
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut statuses = Vec::with_capacity(descriptors.len());

        for (index, descriptor) in descriptors.iter().enumerate() {
            if !seen.insert(descriptor) {
                trace!(descriptor = %descriptor, "Skipping repeated descriptor");
                continue;
            }

            let Some((rule_index, rule)) = self.resolver.resolve_indexed(descriptor) else {
                trace!(descriptor = %descriptor, "No rule applies");
                statuses.push(DescriptorStatus {
                    index,
                    descriptor: descriptor.clone(),
                    rule: None,
                    window: None,
                });
                continue;
            };

            let window = self.window.check(rule, descriptor, now).await?;
            let over_limit = window.should_limit;

            if over_limit {
                debug!(
                    descriptor = %descriptor,
                    rule = %rule,
                    key = %window.key,
                    count = window.count,
                    limit = window.limit,
                    "Rate limit exceeded"
                );
            }

            statuses.push(DescriptorStatus {
                index,
                descriptor: descriptor.clone(),
                rule: Some(MatchedRule {
                    index: rule_index,
                    rule: rule.clone(),
                }),
                window: Some(window),
            });

            if over_limit {
                return Ok(Verdict {
                    overall_code: Code::OverLimit,
                    statuses,
                });
            }
        }

        Ok(Verdict {
            overall_code: Code::Ok,
            statuses,
        })
    }
}
