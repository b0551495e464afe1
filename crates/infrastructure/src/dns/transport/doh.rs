//! Request model shared by DoH over HTTP/2 and HTTP/3 (RFC 8484).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ferrous_forward_domain::{DomainError, ResolverAddr};
use hickory_proto::op::Message;

use crate::dns::message::{decode, encode, set_message_id};

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// `https://host[:port]/path` for `host`, bracketing IPv6 literals and
/// leaving out the default port.
pub fn endpoint_url(host: &str, addr: &ResolverAddr, path: &str) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    match addr.port() {
        443 => format!("https://{}{}", host, path),
        port => format!("https://{}:{}{}", host, port, path),
    }
}

/// Wire form with the ID zeroed for cache friendliness.
pub fn wire_query(query: &Message) -> Result<Vec<u8>, DomainError> {
    let mut wire = query.clone();
    set_message_id(&mut wire, 0);
    encode(&wire)
}

pub fn get_url(base: &str, wire: &[u8]) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}dns={}", base, separator, URL_SAFE_NO_PAD.encode(wire))
}

/// Decodes a reply body and restores the caller's ID.
pub fn parse_reply(query: &Message, body: &[u8]) -> Result<Message, DomainError> {
    let mut response = decode(body)?;
    set_message_id(&mut response, query.id());
    Ok(response)
}

pub fn status_error(url: &str, status: u16) -> DomainError {
    DomainError::ProtocolError(format!("DoH server {} returned HTTP {}", url, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::build_query;
    use hickory_proto::rr::RecordType;

    #[test]
    fn test_endpoint_url_default_port() {
        let addr: ResolverAddr = "dns.google:443".parse().unwrap();
        assert_eq!(
            endpoint_url("dns.google", &addr, "/dns-query"),
            "https://dns.google/dns-query"
        );
    }

    #[test]
    fn test_endpoint_url_custom_port_and_ipv6() {
        let addr: ResolverAddr = "[2606:4700::1111]:8443".parse().unwrap();
        assert_eq!(
            endpoint_url("2606:4700::1111", &addr, "/q"),
            "https://[2606:4700::1111]:8443/q"
        );
    }

    #[test]
    fn test_get_url_is_unpadded_base64url() {
        let url = get_url("https://a/dns-query", &[0xfb, 0xff, 0x00]);
        assert_eq!(url, "https://a/dns-query?dns=-_8A");
        assert!(get_url("https://a/q?x=1", &[0]).contains("&dns="));
    }

    #[test]
    fn test_wire_query_zeroes_id() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let wire = wire_query(&query).unwrap();
        assert_eq!(&wire[..2], &[0, 0]);

        let reply = parse_reply(&query, &wire).unwrap();
        assert_eq!(reply.id(), query.id());
    }
}
