use ferrous_forward_domain::{DomainError, UpstreamEntry};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::ports::Upstream;

/// Something with a tag and the tags it depends on.
pub trait DependencyNode {
    fn node_tag(&self) -> &str;
    fn node_dependencies(&self) -> Vec<String>;
}

impl DependencyNode for UpstreamEntry {
    fn node_tag(&self) -> &str {
        &self.tag
    }

    fn node_dependencies(&self) -> Vec<String> {
        self.dependencies()
    }
}

impl DependencyNode for Arc<dyn Upstream> {
    fn node_tag(&self) -> &str {
        self.tag()
    }

    fn node_dependencies(&self) -> Vec<String> {
        self.dependencies()
    }
}

impl DependencyNode for (String, Vec<String>) {
    fn node_tag(&self) -> &str {
        &self.0
    }

    fn node_dependencies(&self) -> Vec<String> {
        self.1.clone()
    }
}

/// Returns node indices ordered so that every node comes after all of its
/// dependencies. Ties keep declaration order.
pub fn sort_upstreams<N: DependencyNode>(nodes: &[N]) -> Result<Vec<usize>, DomainError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if index.insert(node.node_tag(), i).is_some() {
            return Err(DomainError::DuplicateTag(node.node_tag().to_string()));
        }
    }

    // edges[i] = dependencies of i, dependents[j] = nodes depending on j
    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(nodes.len());
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];

    for (i, node) in nodes.iter().enumerate() {
        let mut deps = Vec::new();
        for dep in node.node_dependencies() {
            let &j = index
                .get(dep.as_str())
                .ok_or_else(|| DomainError::UnknownDependency {
                    upstream: node.node_tag().to_string(),
                    dependency: dep.clone(),
                })?;
            if deps.contains(&j) {
                continue;
            }
            deps.push(j);
            dependents[j].push(i);
            in_degree[i] += 1;
        }
        edges.push(deps);
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    if order.len() < nodes.len() {
        let mut sorted = vec![false; nodes.len()];
        for &i in &order {
            sorted[i] = true;
        }
        return Err(DomainError::CyclicDependency(cycle_trace(
            nodes, &edges, &sorted,
        )));
    }

    Ok(order)
}

/// Follows dependency edges from the first unsorted node until a node
/// repeats, and renders the loop as `a -> b -> a`.
fn cycle_trace<N: DependencyNode>(nodes: &[N], edges: &[Vec<usize>], sorted: &[bool]) -> String {
    let Some(start) = sorted.iter().position(|s| !s) else {
        return String::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        // Every unsorted node still has an unsorted dependency.
        let Some(&next) = edges[current].iter().find(|&&j| !sorted[j]) else {
            break;
        };
        if let Some(&at) = position.get(&next) {
            let mut tags: Vec<&str> = path[at..].iter().map(|&i| nodes[i].node_tag()).collect();
            tags.push(nodes[next].node_tag());
            return tags.join(" -> ");
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path.iter()
        .map(|&i| nodes[i].node_tag())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Upstreams in start order; closing walks the same list backwards.
pub struct UpstreamGraph {
    ordered: Vec<Arc<dyn Upstream>>,
}

impl UpstreamGraph {
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>) -> Result<Self, DomainError> {
        let order = sort_upstreams(&upstreams)?;
        let mut slots: Vec<Option<Arc<dyn Upstream>>> = upstreams.into_iter().map(Some).collect();
        let ordered = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Self { ordered })
    }

    pub fn start_order(&self) -> &[Arc<dyn Upstream>] {
        &self.ordered
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn Upstream>> {
        self.ordered.iter().find(|u| u.tag() == tag)
    }

    /// Starts every upstream in dependency order, closing the already
    /// started ones if any start fails.
    pub async fn start_all(&self) -> Result<(), DomainError> {
        for (i, upstream) in self.ordered.iter().enumerate() {
            if let Err(e) = upstream.start().await {
                tracing::error!(tag = upstream.tag(), error = %e, "Failed to start upstream");
                for started in self.ordered[..i].iter().rev() {
                    started.close().await;
                }
                return Err(e);
            }
            tracing::debug!(tag = upstream.tag(), kind = upstream.kind(), "Upstream started");
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for upstream in self.ordered.iter().rev() {
            upstream.close().await;
            tracing::debug!(tag = upstream.tag(), "Upstream closed");
        }
    }
}
