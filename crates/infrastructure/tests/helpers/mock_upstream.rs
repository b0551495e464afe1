use async_trait::async_trait;
use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use ferrous_forward_infrastructure::dns::message::{question_type, response_to};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scriptable upstream: fixed answers, adjustable delay and failure.
pub struct MockUpstream {
    tag: String,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    delay: Mutex<Duration>,
    family_delays: Mutex<Option<(Duration, Duration)>>,
    failing: AtomicBool,
    fail_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl MockUpstream {
    pub fn new(tag: &str) -> Arc<Self> {
        Self::build(tag, Some(Ipv4Addr::new(192, 0, 2, 1)), None)
    }

    pub fn answering(tag: &str, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Arc<Self> {
        Self::build(tag, ipv4, ipv6)
    }

    pub fn with_delay(tag: &str, delay: Duration) -> Arc<Self> {
        let mock = Self::new(tag);
        mock.set_delay(delay);
        mock
    }

    pub fn failing(tag: &str) -> Arc<Self> {
        let mock = Self::new(tag);
        mock.set_failing(true);
        mock
    }

    fn build(tag: &str, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            ipv4,
            ipv6,
            delay: Mutex::new(Duration::ZERO),
            family_delays: Mutex::new(None),
            failing: AtomicBool::new(false),
            fail_remaining: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Separate delays for A and AAAA questions; other types use `set_delay`.
    pub fn set_family_delays(&self, a: Duration, aaaa: Duration) {
        *self.family_delays.lock() = Some((a, aaaa));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The next `n` exchanges fail, later ones succeed.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn exchange(
        &self,
        _ctx: &ExchangeContext,
        query: Message,
    ) -> Result<Message, DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = match (*self.family_delays.lock(), question_type(&query)) {
            (Some((a, _)), Some(RecordType::A)) => a,
            (Some((_, aaaa)), Some(RecordType::AAAA)) => aaaa,
            _ => *self.delay.lock(),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.failing.load(Ordering::SeqCst) {
            return Err(DomainError::TransportConnectionRefused {
                server: self.tag.clone(),
            });
        }

        let mut response = response_to(&query, ResponseCode::NoError);
        let name = query.queries()[0].name().clone();
        let rdata = match question_type(&query) {
            Some(RecordType::A) => self.ipv4.map(|ip| RData::A(A(ip))),
            Some(RecordType::AAAA) => self.ipv6.map(|ip| RData::AAAA(AAAA(ip))),
            _ => None,
        };
        if let Some(rdata) = rdata {
            response.add_answer(Record::from_rdata(name, 60, rdata));
        }
        Ok(response)
    }
}
