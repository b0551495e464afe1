#![allow(dead_code)]

mod mock_server;
mod mock_upstream;

pub use mock_server::{answer_for, MockTcpServer, MockUdpServer};
pub use mock_upstream::MockUpstream;

use ferrous_forward_domain::ResolverAddr;
use ferrous_forward_infrastructure::dns::message::build_query;
use ferrous_forward_infrastructure::dns::transport::{Dialer, ServerTarget};
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub fn query(domain: &str) -> Message {
    build_query(domain, RecordType::A).unwrap()
}

pub fn local_target(addr: SocketAddr) -> Arc<ServerTarget> {
    let dialer = Dialer::direct(Duration::from_secs(2));
    Arc::new(ServerTarget::new(ResolverAddr::Ip(addr), dialer, None).unwrap())
}

pub fn first_ip(response: &Message) -> Option<IpAddr> {
    ferrous_forward_infrastructure::dns::message::answer_ips(response)
        .first()
        .copied()
}
