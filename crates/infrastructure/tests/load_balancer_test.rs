use ferrous_forward_application::ports::{ExchangeContext, Upstream};
use ferrous_forward_domain::DomainError;
use ferrous_forward_infrastructure::dns::load_balancer::fallback::FallbackSettings;
use ferrous_forward_infrastructure::dns::load_balancer::query_test::QueryTestSettings;
use ferrous_forward_infrastructure::dns::load_balancer::{
    should_switch, FallbackUpstream, ParallelUpstream, QueryTestUpstream, RandomUpstream,
};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

mod helpers;
use helpers::{first_ip, query, MockUpstream};

fn answering(tag: &str, last_octet: u8) -> Arc<MockUpstream> {
    MockUpstream::answering(tag, Some(Ipv4Addr::new(192, 0, 2, last_octet)), None)
}

fn answer_octet(ip: Option<IpAddr>) -> Option<u8> {
    match ip? {
        IpAddr::V4(v4) => Some(v4.octets()[3]),
        IpAddr::V6(_) => None,
    }
}

#[test]
fn test_should_switch_tolerance_band() {
    let tolerance = Duration::from_millis(3);
    assert!(!should_switch(
        Duration::from_millis(100),
        Duration::from_millis(98),
        tolerance
    ));
    assert!(!should_switch(
        Duration::from_millis(100),
        Duration::from_millis(97),
        tolerance
    ));
    assert!(should_switch(
        Duration::from_millis(100),
        Duration::from_millis(96),
        tolerance
    ));
}

#[tokio::test]
async fn test_random_spreads_across_members() {
    let a = answering("a", 1);
    let b = answering("b", 2);
    let random = RandomUpstream::with_seed("random", vec![a.clone(), b.clone()], 7).unwrap();
    let ctx = ExchangeContext::new();

    for _ in 0..64 {
        random.exchange(&ctx, query("example.com")).await.unwrap();
    }

    assert_eq!(a.calls() + b.calls(), 64);
    assert!(a.calls() > 0);
    assert!(b.calls() > 0);
    assert_eq!(random.dependencies(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(random.statistics()["total"], json!(64));
}

#[tokio::test]
async fn test_composites_need_members() {
    assert!(RandomUpstream::new("random", Vec::new()).unwrap_err().is_config());
    assert!(ParallelUpstream::new("parallel", Vec::new()).unwrap_err().is_config());
}

#[tokio::test(start_paused = true)]
async fn test_parallel_fastest_answer_wins() {
    let slow = answering("slow", 1);
    slow.set_delay(Duration::from_millis(500));
    let fast = answering("fast", 2);
    fast.set_delay(Duration::from_millis(20));
    let parallel = ParallelUpstream::new("parallel", vec![slow.clone(), fast.clone()]).unwrap();

    let started = tokio::time::Instant::now();
    let response = parallel
        .exchange(&ExchangeContext::new(), query("example.com"))
        .await
        .unwrap();

    assert_eq!(answer_octet(first_ip(&response)), Some(2));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(slow.calls(), 1);
    assert_eq!(fast.calls(), 1);
}

#[tokio::test]
async fn test_parallel_tolerates_failing_member() {
    let broken = MockUpstream::failing("broken");
    let ok = answering("ok", 9);
    let parallel = ParallelUpstream::new("parallel", vec![broken, ok]).unwrap();

    let response = parallel
        .exchange(&ExchangeContext::new(), query("example.com"))
        .await
        .unwrap();
    assert_eq!(answer_octet(first_ip(&response)), Some(9));
}

#[tokio::test]
async fn test_parallel_all_members_fail() {
    let parallel = ParallelUpstream::new(
        "parallel",
        vec![MockUpstream::failing("a"), MockUpstream::failing("b")],
    )
    .unwrap();

    let err = parallel
        .exchange(&ExchangeContext::new(), query("example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::TransportConnectionRefused { .. }));
    assert_eq!(parallel.statistics()["success"], json!(0));
}

fn fallback_settings() -> FallbackSettings {
    FallbackSettings {
        check_interval: Duration::from_secs(5),
        test_domain: "probe.example".to_string(),
        probe_timeout: Duration::from_secs(2),
    }
}

#[tokio::test(start_paused = true)]
async fn test_fallback_stays_until_main_recovers() {
    let main = answering("main", 1);
    let backup = answering("backup", 2);
    let fallback = FallbackUpstream::new("fb", main.clone(), backup.clone(), fallback_settings());
    fallback.start().await.unwrap();
    let ctx = ExchangeContext::new();

    main.set_failing(true);
    let response = fallback.exchange(&ctx, query("example.com")).await.unwrap();
    assert_eq!(answer_octet(first_ip(&response)), Some(2));
    assert!(!fallback.is_healthy());
    assert_eq!(main.calls(), 1);

    // Main is fine again but no probe has run yet: traffic stays on the fallback.
    main.set_failing(false);
    fallback.exchange(&ctx, query("example.com")).await.unwrap();
    assert_eq!(main.calls(), 1);
    assert_eq!(backup.calls(), 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(fallback.is_healthy());
    assert_eq!(main.calls(), 2);

    let response = fallback.exchange(&ctx, query("example.com")).await.unwrap();
    assert_eq!(answer_octet(first_ip(&response)), Some(1));

    fallback.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_fallback_keeps_probing_failed_main() {
    let main = answering("main", 1);
    let backup = answering("backup", 2);
    let fallback = FallbackUpstream::new("fb", main.clone(), backup.clone(), fallback_settings());
    fallback.start().await.unwrap();

    main.set_failing(true);
    fallback
        .exchange(&ExchangeContext::new(), query("example.com"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(!fallback.is_healthy());
    // One live exchange plus three probes.
    assert_eq!(main.calls(), 4);
    fallback.close().await;
}

#[tokio::test]
async fn test_fallback_both_failing() {
    let fallback = FallbackUpstream::new(
        "fb",
        MockUpstream::failing("main"),
        MockUpstream::failing("backup"),
        fallback_settings(),
    );
    let result = fallback
        .exchange(&ExchangeContext::new(), query("example.com"))
        .await;
    assert!(result.is_err());
    assert_eq!(
        fallback.dependencies(),
        vec!["main".to_string(), "backup".to_string()]
    );
}

fn query_test_settings() -> QueryTestSettings {
    QueryTestSettings {
        test_domain: "probe.example".to_string(),
        interval: Duration::from_secs(600),
        tolerance: Duration::from_millis(3),
        probe_timeout: Duration::from_secs(5),
    }
}

#[tokio::test(start_paused = true)]
async fn test_query_test_switch_threshold() {
    let current = MockUpstream::with_delay("current", Duration::from_millis(100));
    let candidate = MockUpstream::with_delay("candidate", Duration::from_millis(98));
    let upstream =
        QueryTestUpstream::new("qt", vec![current, candidate.clone()], query_test_settings())
            .unwrap();
    assert_eq!(upstream.selected_tag(), "current");

    upstream.probe_now().await;
    assert_eq!(upstream.selected_tag(), "current");

    candidate.set_delay(Duration::from_millis(96));
    upstream.probe_now().await;
    assert_eq!(upstream.selected_tag(), "candidate");

    let stats = upstream.statistics();
    assert_eq!(stats["selected"], json!("candidate"));
    assert_eq!(stats["latency_ms"]["candidate"], json!(96));
}

#[tokio::test(start_paused = true)]
async fn test_query_test_leaves_failed_selection() {
    let current = MockUpstream::with_delay("current", Duration::from_millis(10));
    let candidate = MockUpstream::with_delay("candidate", Duration::from_millis(200));
    let upstream =
        QueryTestUpstream::new("qt", vec![current.clone(), candidate], query_test_settings())
            .unwrap();

    current.set_failing(true);
    upstream.probe_now().await;
    assert_eq!(upstream.selected_tag(), "candidate");
}

#[tokio::test(start_paused = true)]
async fn test_query_test_keeps_selection_when_all_fail() {
    let a = MockUpstream::failing("a");
    let b = MockUpstream::failing("b");
    let upstream = QueryTestUpstream::new("qt", vec![a, b], query_test_settings()).unwrap();

    upstream.probe_now().await;
    assert_eq!(upstream.selected_tag(), "a");
}

#[tokio::test(start_paused = true)]
async fn test_query_test_background_probes() {
    let slow = MockUpstream::with_delay("slow", Duration::from_millis(300));
    let fast = MockUpstream::with_delay("fast", Duration::from_millis(10));
    let upstream =
        QueryTestUpstream::new("qt", vec![slow, fast.clone()], query_test_settings()).unwrap();

    upstream.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(upstream.selected_tag(), "fast");

    let response = upstream
        .exchange(&ExchangeContext::new(), query("example.com"))
        .await
        .unwrap();
    assert!(first_ip(&response).is_some());
    // One probe plus the live query.
    assert_eq!(fast.calls(), 2);
    upstream.close().await;
}
