use ferrous_forward_domain::{BootstrapStrategy, Config, UpstreamKind};
use std::io::Write;

const SAMPLE: &str = r#"
[logging]
level = "debug"

[[upstreams]]
tag = "local"
type = "udp"
address = "192.168.1.1:53"
fallback-tcp = true

[[upstreams]]
tag = "google-dot"
type = "tls"
address = "tls://dns.google"
enable-pipeline = true
idle-timeout = 30
bootstrap = { upstream = "local", strategy = "ipv6-prefer", cache-ttl = 600 }

[[upstreams]]
tag = "cf-doh"
type = "https"
address = "https://cloudflare-dns.com/dns-query"
use-post = true
bootstrap = { upstream = "local" }

[[upstreams]]
tag = "best"
type = "querytest"
upstreams = ["google-dot", "cf-doh"]
tolerance = 5

[[upstreams]]
tag = "main"
type = "fallback"
main-upstream = "best"
fallback-upstream = "local"

[[upstreams]]
tag = "hosts"
type = "hosts"
fallback = "main"
rules = [
    { pattern = "^router\\.lan$", ipv4 = ["192.168.1.1"] },
    { pattern = "\\.test$", ipv4 = ["10.0.0.0/24"], ipv6 = ["fd00::/64"] },
]
"#;

#[test]
fn test_parse_sample_config() {
    let config = Config::from_toml_str(SAMPLE).unwrap();
    config.validate().unwrap();

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.upstreams.len(), 6);

    let dot = config.upstream("google-dot").unwrap();
    match &dot.kind {
        UpstreamKind::Tls(o) => {
            assert!(o.enable_pipeline);
            assert_eq!(o.common.idle_timeout, 30);
            assert_eq!(o.common.connect_timeout, 30);
            let bootstrap = o.common.bootstrap.as_ref().unwrap();
            assert_eq!(bootstrap.strategy, BootstrapStrategy::Ipv6Prefer);
            assert_eq!(bootstrap.cache_ttl, 600);
        }
        other => panic!("expected tls, got {}", other.as_str()),
    }
    assert_eq!(dot.dependencies(), vec!["local".to_string()]);

    let doh = config.upstream("cf-doh").unwrap();
    match &doh.kind {
        UpstreamKind::Https(o) => {
            assert!(o.use_post);
            assert!(!o.http3);
            let bootstrap = o.common.bootstrap.as_ref().unwrap();
            assert_eq!(bootstrap.strategy, BootstrapStrategy::Ipv4Prefer);
        }
        other => panic!("expected https, got {}", other.as_str()),
    }

    let best = config.upstream("best").unwrap();
    match &best.kind {
        UpstreamKind::QueryTest(o) => {
            assert_eq!(o.tolerance, 5);
            assert_eq!(o.test_interval, 600);
        }
        other => panic!("expected querytest, got {}", other.as_str()),
    }

    let main = config.upstream("main").unwrap();
    assert_eq!(main.dependencies(), vec!["best".to_string(), "local".to_string()]);

    let hosts = config.upstream("hosts").unwrap();
    match &hosts.kind {
        UpstreamKind::Hosts(o) => {
            assert_eq!(o.rules.len(), 2);
            assert_eq!(o.ttl, 10);
        }
        other => panic!("expected hosts, got {}", other.as_str()),
    }
}

#[test]
fn test_udp_defaults() {
    let config = Config::from_toml_str(
        r#"
[[upstreams]]
tag = "u"
type = "udp"
address = "1.1.1.1"
"#,
    )
    .unwrap();

    match &config.upstreams[0].kind {
        UpstreamKind::Udp(o) => {
            assert!(!o.fallback_tcp);
            assert_eq!(o.common.query_timeout, 15);
            assert_eq!(o.common.idle_timeout, 60);
            assert_eq!(o.common.retry, 3);
            assert_eq!(o.common.max_idle_conns, 16);
        }
        other => panic!("expected udp, got {}", other.as_str()),
    }
    assert!(config.logging.level == "info");
}

#[test]
fn test_duplicate_tag_rejected() {
    let config = Config::from_toml_str(
        r#"
[[upstreams]]
tag = "a"
type = "udp"
address = "1.1.1.1:53"

[[upstreams]]
tag = "a"
type = "tcp"
address = "1.1.1.1:53"
"#,
    )
    .unwrap();

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("Duplicate upstream tag 'a'"));
}

#[test]
fn test_empty_group_rejected() {
    let config = Config::from_toml_str(
        r#"
[[upstreams]]
tag = "r"
type = "random"
upstreams = []
"#,
    )
    .unwrap();

    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_type_is_parse_error() {
    let result = Config::from_toml_str(
        r#"
[[upstreams]]
tag = "x"
type = "carrier-pigeon"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.upstreams.len(), 6);
}

#[test]
fn test_load_missing_file() {
    assert!(Config::load(Some("/nonexistent/ferrous-forward.toml")).is_err());
}
