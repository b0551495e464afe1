pub mod dhcp;
pub mod hosts;
pub mod load_balancer;
pub mod message;
pub mod transport;
pub mod upstream;

pub use dhcp::DhcpUpstream;
pub use hosts::HostsUpstream;
pub use load_balancer::{
    FallbackUpstream, ParallelUpstream, QueryTestUpstream, RandomUpstream,
};
pub use upstream::{GenericUpstream, UpstreamFactory, UpstreamRegistry};
