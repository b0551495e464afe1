//! Small helpers around `hickory_proto::op::Message` shared by every upstream.

use ferrous_forward_domain::DomainError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use std::net::IpAddr;
use std::str::FromStr;

/// Recursive single-question query with a random ID.
pub fn build_query(domain: &str, record_type: RecordType) -> Result<Message, DomainError> {
    let name = Name::from_str(domain).map_err(|e| {
        DomainError::ProtocolError(format!("Invalid domain '{}': {}", domain, e))
    })?;

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new(fastrand::u16(..), MessageType::Query, OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);
    Ok(message)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, DomainError> {
    message
        .to_vec()
        .map_err(|e| DomainError::ProtocolError(format!("Failed to encode DNS message: {}", e)))
}

pub fn decode(bytes: &[u8]) -> Result<Message, DomainError> {
    Message::from_vec(bytes)
        .map_err(|e| DomainError::InvalidDnsResponse(format!("Failed to parse DNS message: {}", e)))
}

/// Reads the ID straight from a wire-format header.
pub fn wire_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn set_wire_id(bytes: &mut [u8], id: u16) {
    if bytes.len() >= 2 {
        bytes[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Rewrites the header ID; `Message` only hands out its header by value.
pub fn set_message_id(message: &mut Message, id: u16) {
    let mut header = *message.header();
    header.set_id(id);
    message.set_header(header);
}

/// Query name lowercased and without the trailing dot.
pub fn question_name(message: &Message) -> Option<String> {
    let query = message.queries().first()?;
    let name = query.name().to_utf8();
    Some(name.trim_end_matches('.').to_ascii_lowercase())
}

pub fn question_type(message: &Message) -> Option<RecordType> {
    message.queries().first().map(|q| q.query_type())
}

/// Response skeleton echoing the request's ID, flags and question.
pub fn response_to(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new(request.id(), MessageType::Response, request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

pub fn answer_ips(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query() {
        let query = build_query("example.com.", RecordType::AAAA).unwrap();
        assert!(query.recursion_desired());
        assert_eq!(question_name(&query).as_deref(), Some("example.com"));
        assert_eq!(question_type(&query), Some(RecordType::AAAA));
    }

    #[test]
    fn test_wire_id() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let mut bytes = encode(&query).unwrap();
        assert_eq!(wire_id(&bytes), Some(query.id()));

        set_wire_id(&mut bytes, 0xBEEF);
        assert_eq!(decode(&bytes).unwrap().id(), 0xBEEF);
        assert_eq!(wire_id(&[0x01]), None);
    }

    #[test]
    fn test_set_message_id_keeps_question() {
        let mut query = build_query("example.com", RecordType::A).unwrap();
        set_message_id(&mut query, 0);
        assert_eq!(query.id(), 0);
        assert!(query.recursion_desired());

        set_message_id(&mut query, 4242);
        let decoded = decode(&encode(&query).unwrap()).unwrap();
        assert_eq!(decoded.id(), 4242);
        assert_eq!(question_name(&decoded).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_response_to_copies_question() {
        let query = build_query("Example.COM", RecordType::A).unwrap();
        let response = response_to(&query, ResponseCode::NXDomain);
        assert_eq!(response.id(), query.id());
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(question_name(&response).as_deref(), Some("example.com"));
    }
}
