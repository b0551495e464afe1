//! Static answers from regex-matched host rules.

use async_trait::async_trait;
use fancy_regex::Regex;
use ferrous_forward_application::ports::{ExchangeContext, Upstream, UpstreamStatistics};
use ferrous_forward_domain::{DomainError, HostsOptions, HostsRule};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{rdata, RData, Record, RecordType};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, warn};

use super::message::{question_name, question_type, response_to};

/// A listed address, or a prefix answered with a random member address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAddr {
    Ip(IpAddr),
    Net(IpNetwork),
}

impl HostAddr {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        if s.contains('/') {
            return s
                .parse::<IpNetwork>()
                .map(HostAddr::Net)
                .map_err(|e| DomainError::InvalidAddress(format!("{}: {}", s, e)));
        }
        s.parse::<IpAddr>()
            .map(HostAddr::Ip)
            .map_err(|_| DomainError::InvalidAddress(s.to_string()))
    }

    pub fn is_ipv4(&self) -> bool {
        match self {
            HostAddr::Ip(ip) => ip.is_ipv4(),
            HostAddr::Net(net) => net.is_ipv4(),
        }
    }

    pub fn pick(&self, rng: &mut fastrand::Rng) -> IpAddr {
        match self {
            HostAddr::Ip(ip) => *ip,
            HostAddr::Net(IpNetwork::V4(net)) => {
                let host_bits = 32 - u32::from(net.prefix());
                let mask = if host_bits >= 32 {
                    u32::MAX
                } else {
                    (1u32 << host_bits) - 1
                };
                let base = u32::from(net.network());
                IpAddr::V4(Ipv4Addr::from(base | (rng.u32(..) & mask)))
            }
            HostAddr::Net(IpNetwork::V6(net)) => {
                let host_bits = 128 - u32::from(net.prefix());
                let mask = if host_bits >= 128 {
                    u128::MAX
                } else {
                    (1u128 << host_bits) - 1
                };
                let base = u128::from(net.network());
                IpAddr::V6(Ipv6Addr::from(base | (rng.u128(..) & mask)))
            }
        }
    }
}

struct CompiledRule {
    pattern: Regex,
    ipv4: Vec<HostAddr>,
    ipv6: Vec<HostAddr>,
}

impl CompiledRule {
    fn compile(rule: &HostsRule) -> Result<Self, DomainError> {
        let pattern = Regex::new(&rule.pattern).map_err(|e| {
            DomainError::ConfigError(format!("Invalid hosts pattern '{}': {}", rule.pattern, e))
        })?;
        let ipv4 = parse_family(&rule.ipv4, true)?;
        let ipv6 = parse_family(&rule.ipv6, false)?;
        Ok(Self {
            pattern,
            ipv4,
            ipv6,
        })
    }
}

fn parse_family(entries: &[String], v4: bool) -> Result<Vec<HostAddr>, DomainError> {
    entries
        .iter()
        .map(|entry| {
            let addr = HostAddr::parse(entry)?;
            if addr.is_ipv4() != v4 {
                return Err(DomainError::InvalidAddress(format!(
                    "{} listed under the wrong address family",
                    entry
                )));
            }
            Ok(addr)
        })
        .collect()
}

pub struct HostsUpstream {
    tag: String,
    rules: Vec<CompiledRule>,
    ttl: u32,
    fallback: Option<Arc<dyn Upstream>>,
    rng: Mutex<fastrand::Rng>,
    stats: UpstreamStatistics,
}

impl HostsUpstream {
    pub fn new(
        tag: impl Into<String>,
        options: &HostsOptions,
        fallback: Option<Arc<dyn Upstream>>,
    ) -> Result<Self, DomainError> {
        let rules = options
            .rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tag: tag.into(),
            rules,
            ttl: options.ttl,
            fallback,
            rng: Mutex::new(fastrand::Rng::new()),
            stats: UpstreamStatistics::new(),
        })
    }

    fn matching_rule(&self, name: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| match rule.pattern.is_match(name) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(tag = %self.tag, name, error = %e, "Hosts pattern evaluation failed");
                false
            }
        })
    }

    fn answer(&self, query: &Message, addrs: &[HostAddr]) -> Message {
        let mut response = response_to(query, ResponseCode::NoError);
        let Some(name) = query.queries().first().map(|q| q.name().clone()) else {
            return response;
        };
        let mut rng = self.rng.lock();
        for addr in addrs {
            let rdata = match addr.pick(&mut rng) {
                IpAddr::V4(ip) => RData::A(rdata::A(ip)),
                IpAddr::V6(ip) => RData::AAAA(rdata::AAAA(ip)),
            };
            response.add_answer(Record::from_rdata(name.clone(), self.ttl, rdata));
        }
        response
    }

    async fn resolve(&self, ctx: &ExchangeContext, query: Message) -> Result<Message, DomainError> {
        let name = question_name(&query);
        let qtype = question_type(&query);

        if let (Some(name), Some(qtype @ (RecordType::A | RecordType::AAAA))) = (&name, qtype) {
            if let Some(rule) = self.matching_rule(name) {
                let addrs = if qtype == RecordType::A {
                    &rule.ipv4
                } else {
                    &rule.ipv6
                };
                debug!(tag = %self.tag, name = %name, qtype = %qtype, answers = addrs.len(), "Hosts match");
                return Ok(self.answer(&query, addrs));
            }
        }

        match &self.fallback {
            Some(fallback) => fallback.exchange(ctx, query).await,
            None => Ok(response_to(&query, ResponseCode::NXDomain)),
        }
    }
}

#[async_trait]
impl Upstream for HostsUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "hosts"
    }

    fn dependencies(&self) -> Vec<String> {
        self.fallback
            .iter()
            .map(|f| f.tag().to_string())
            .collect()
    }

    async fn exchange(
        &self,
        ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        let result = self.resolve(ctx, query).await;
        self.stats.record(result.is_ok());
        result
    }

    fn statistics(&self) -> Map<String, Value> {
        let mut map = self.stats.to_map();
        map.insert("rules".into(), json!(self.rules.len()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_addr() {
        assert_eq!(
            HostAddr::parse("10.0.0.1").unwrap(),
            HostAddr::Ip("10.0.0.1".parse().unwrap())
        );
        assert!(matches!(HostAddr::parse("10.0.0.0/8").unwrap(), HostAddr::Net(_)));
        assert!(HostAddr::parse("not-an-ip").is_err());
        assert!(HostAddr::parse("10.0.0.0/40").is_err());
    }

    #[test]
    fn test_pick_stays_inside_prefix() {
        let mut rng = fastrand::Rng::with_seed(7);
        let v4 = HostAddr::parse("192.168.4.0/24").unwrap();
        let net: IpNetwork = "192.168.4.0/24".parse().unwrap();
        for _ in 0..100 {
            assert!(net.contains(v4.pick(&mut rng)));
        }

        let v6 = HostAddr::parse("fd00:1::/64").unwrap();
        let net6: IpNetwork = "fd00:1::/64".parse().unwrap();
        for _ in 0..100 {
            assert!(net6.contains(v6.pick(&mut rng)));
        }
    }

    #[test]
    fn test_single_host_prefix() {
        let mut rng = fastrand::Rng::with_seed(1);
        let addr = HostAddr::parse("10.1.2.3/32").unwrap();
        assert_eq!(addr.pick(&mut rng), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_family_mismatch_rejected() {
        assert!(parse_family(&["::1".to_string()], true).is_err());
        assert!(parse_family(&["1.1.1.1".to_string()], false).is_err());
    }
}
