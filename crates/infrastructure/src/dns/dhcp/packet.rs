//! DHCPDISCOVER encoding and DHCPOFFER parsing (RFC 2131, RFC 2132).

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: u32 = 0x6382_5363;
const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const FLAG_BROADCAST: u16 = 0x8000;
const FIXED_HEADER_LEN: usize = 236;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS_SERVERS: u8 = 6;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_PARAMETER_LIST: u8 = 55;
const OPT_END: u8 = 255;

const DHCPDISCOVER: u8 = 1;
const DHCPOFFER: u8 = 2;

pub fn build_discover(xid: u32, mac: [u8; 6]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(300);
    buf.put_u8(BOOTREQUEST);
    buf.put_u8(HTYPE_ETHERNET);
    buf.put_u8(mac.len() as u8);
    buf.put_u8(0); // hops
    buf.put_u32(xid);
    buf.put_u16(0); // secs
    buf.put_u16(FLAG_BROADCAST);
    buf.put_bytes(0, 16); // ciaddr, yiaddr, siaddr, giaddr
    buf.put_slice(&mac);
    buf.put_bytes(0, 10); // chaddr padding
    buf.put_bytes(0, 64 + 128); // sname, file
    buf.put_u32(MAGIC_COOKIE);

    buf.put_slice(&[OPT_MESSAGE_TYPE, 1, DHCPDISCOVER]);
    buf.put_slice(&[
        OPT_PARAMETER_LIST,
        3,
        OPT_SUBNET_MASK,
        OPT_ROUTER,
        OPT_DNS_SERVERS,
    ]);
    buf.put_u8(OPT_END);
    buf.to_vec()
}

/// DNS servers from a DHCPOFFER answering `xid`, or `None` for any other
/// packet. An offer without option 6 yields an empty list.
pub fn parse_offer(packet: &[u8], xid: u32) -> Option<Vec<Ipv4Addr>> {
    if packet.len() < FIXED_HEADER_LEN + 4 || packet[0] != BOOTREPLY {
        return None;
    }
    if u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]) != xid {
        return None;
    }
    let cookie = &packet[FIXED_HEADER_LEN..FIXED_HEADER_LEN + 4];
    if u32::from_be_bytes([cookie[0], cookie[1], cookie[2], cookie[3]]) != MAGIC_COOKIE {
        return None;
    }

    let mut message_type = None;
    let mut servers = Vec::new();
    let mut options = &packet[FIXED_HEADER_LEN + 4..];
    while let Some((&code, rest)) = options.split_first() {
        match code {
            OPT_PAD => {
                options = rest;
                continue;
            }
            OPT_END => break,
            _ => {}
        }
        let (&len, rest) = rest.split_first()?;
        let len = len as usize;
        if rest.len() < len {
            return None;
        }
        let (value, rest) = rest.split_at(len);
        match code {
            OPT_MESSAGE_TYPE if len == 1 => message_type = Some(value[0]),
            OPT_DNS_SERVERS => servers.extend(
                value
                    .chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3])),
            ),
            _ => {}
        }
        options = rest;
    }

    (message_type == Some(DHCPOFFER)).then_some(servers)
}
