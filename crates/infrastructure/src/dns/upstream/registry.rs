use ferrous_forward_application::ports::Upstream;
use ferrous_forward_application::use_cases::UpstreamGraph;
use ferrous_forward_domain::{Config, DomainError};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use super::factory::UpstreamFactory;

/// Every configured upstream, owned in start order.
pub struct UpstreamRegistry {
    graph: UpstreamGraph,
}

impl UpstreamRegistry {
    pub fn from_config(config: &Config) -> Result<Self, DomainError> {
        Self::from_upstreams(UpstreamFactory::build_all(config)?)
    }

    pub fn from_upstreams(upstreams: Vec<Arc<dyn Upstream>>) -> Result<Self, DomainError> {
        Ok(Self {
            graph: UpstreamGraph::new(upstreams)?,
        })
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Upstream>> {
        self.graph.get(tag).cloned()
    }

    pub fn start_order(&self) -> Vec<&str> {
        self.graph.start_order().iter().map(|u| u.tag()).collect()
    }

    pub fn len(&self) -> usize {
        self.graph.start_order().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn start_all(&self) -> Result<(), DomainError> {
        self.graph.start_all().await?;
        info!(count = self.len(), "All upstreams started");
        Ok(())
    }

    pub async fn close_all(&self) {
        self.graph.close_all().await;
        info!("All upstreams closed");
    }

    /// Per-tag statistics, each tagged with its upstream kind.
    pub fn statistics(&self) -> Map<String, Value> {
        self.graph
            .start_order()
            .iter()
            .map(|u| {
                let mut stats = u.statistics();
                stats.insert("type".into(), Value::from(u.kind()));
                (u.tag().to_string(), Value::Object(stats))
            })
            .collect()
    }
}
