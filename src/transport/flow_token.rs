//! Flow tokens: an authenticated, opaque encoding of a bound connection
//! tuple, used as the user part of a URI pointing back at ourselves.
use super::{Protocol, SipAddr};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, SocketAddr};

type HmacSha1 = Hmac<Sha1>;

fn flow_tuple(flow: &SipAddr, local: SocketAddr) -> String {
    [
        flow.protocol.to_string(),
        flow.host.clone(),
        flow.port.to_string(),
        local.ip().to_string(),
        local.port().to_string(),
    ]
    .join(",")
}

fn sign(tuple: &str, secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(secret).ok()?;
    mac.update(tuple.as_bytes());
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Encodes `flow`, which must carry its local socket. The plain text is
/// space padded to a multiple of three so the url-safe base64 needs no `=`.
pub fn encode_flow_token(flow: &SipAddr, secret: &[u8]) -> Option<String> {
    let tuple = flow_tuple(flow, flow.local?);
    let mut plain = format!("{},{}", sign(&tuple, secret)?, tuple);
    while plain.len() % 3 != 0 {
        plain.push(' ');
    }
    Some(URL_SAFE.encode(plain))
}

/// Decodes and authenticates a token produced by [`encode_flow_token`]
/// with the same secret.
pub fn decode_flow_token(token: &str, secret: &[u8]) -> Option<SipAddr> {
    let plain = String::from_utf8(URL_SAFE.decode(token).ok()?).ok()?;
    let parts: Vec<&str> = plain.trim_end_matches(' ').split(',').collect();
    let [_, protocol, host, port, local_host, local_port] = parts.as_slice() else {
        return None;
    };

    let local = SocketAddr::new(local_host.parse::<IpAddr>().ok()?, local_port.parse().ok()?);
    let flow = SipAddr::new(protocol.parse::<Protocol>().ok()?, *host, port.parse().ok()?)
        .with_local(local);

    (encode_flow_token(&flow, secret)? == token).then_some(flow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> SipAddr {
        SipAddr::new(Protocol::Tcp, "203.0.113.7", 40123).with_local("10.0.0.1:5060".parse().unwrap())
    }

    #[test]
    fn test_flow_token() {
        let secret = b"0123456789abcdefghij";
        let token = encode_flow_token(&flow(), secret).expect("encode");
        assert!(!token.contains('='));
        assert!(!token.contains('/') && !token.contains('+'));
        assert_eq!(decode_flow_token(&token, secret), Some(flow()));
        assert_eq!(decode_flow_token(&token, b"another secret"), None);
        assert_eq!(decode_flow_token("bm90IGEgdG9rZW4h", secret), None);
        assert_eq!(decode_flow_token("%%%", secret), None);
    }

    #[test]
    fn test_flow_token_needs_local() {
        let remote = SipAddr::new(Protocol::Udp, "203.0.113.7", 5060);
        assert_eq!(encode_flow_token(&remote, b"secret"), None);
    }
}
