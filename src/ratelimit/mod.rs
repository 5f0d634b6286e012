//! Rule resolution and fixed-window admission.

mod descriptor;
mod key;
mod limiter;
mod rules;
mod window;

pub use descriptor::{Dimension, RequestDescriptor};
pub use key::{CounterKey, KeyScope};
pub use limiter::{Code, DescriptorStatus, MatchedRule, RateLimiter, Verdict};
pub use rules::{RateLimitRule, RuleResolver, RuleSet, Specificity};
pub use window::{BucketMode, RateLimitTimeInterval, WindowLimiter, WindowStatus};
