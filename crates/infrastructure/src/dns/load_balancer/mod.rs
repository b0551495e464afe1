//! Upstreams that route each query to one or more member upstreams.

pub mod fallback;
pub mod parallel;
pub mod query_test;
pub mod random;

pub use fallback::FallbackUpstream;
pub use parallel::{race_exchange, ParallelUpstream};
pub use query_test::{should_switch, QueryTestUpstream};
pub use random::RandomUpstream;

use ferrous_forward_application::ports::Upstream;
use ferrous_forward_domain::DomainError;
use std::sync::Arc;

fn member_tags(members: &[Arc<dyn Upstream>]) -> Vec<String> {
    members.iter().map(|m| m.tag().to_string()).collect()
}

fn require_members(tag: &str, members: &[Arc<dyn Upstream>]) -> Result<(), DomainError> {
    if members.is_empty() {
        return Err(DomainError::ConfigError(format!(
            "Upstream '{}' has no member upstreams",
            tag
        )));
    }
    Ok(())
}
