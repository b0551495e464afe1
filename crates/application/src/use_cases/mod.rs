pub mod upstream_graph;

pub use upstream_graph::{sort_upstreams, DependencyNode, UpstreamGraph};
