//! Ferrous Forward Infrastructure Layer
//!
//! Wire transports, connection pooling, bootstrap resolution, composite
//! upstreams, and the registry that builds them from configuration.

pub mod dns;
pub mod system;
