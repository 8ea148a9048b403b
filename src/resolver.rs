//! Next-hop resolution: turns a SIP URI into the ordered list of transport
//! addresses to try.
use crate::message::Uri;
use crate::transport::{Protocol, SipAddr};
use async_trait::async_trait;
use futures_util::future::join_all;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use std::{net::IpAddr, time::Duration};
use tracing::{debug, warn};

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Candidate hops for `uri`, best first. Failures yield an empty list.
    async fn resolve(&self, uri: &Uri) -> Vec<SipAddr>;
}

/// One SRV answer, tagged with the protocol its service name asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvTarget {
    protocol: Protocol,
    priority: u16,
    weight: u16,
    port: u16,
    target: String,
}

/// Lowest priority first, heavier weight first within a priority. Ties
/// keep the protocol preference order they were collected in.
fn order_srv(mut targets: Vec<SrvTarget>) -> Vec<SrvTarget> {
    targets.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
    });
    targets
}

fn srv_service(protocol: Protocol) -> Option<&'static str> {
    match protocol {
        Protocol::Udp => Some("_sip._udp"),
        Protocol::Tcp => Some("_sip._tcp"),
        Protocol::Tls => Some("_sips._tcp"),
        Protocol::Ws | Protocol::Wss => None,
    }
}

/// DNS resolver.
///
/// - `transport=ws` targets are used as is (WSS for sips), port 443/80.
/// - IP literals use the `transport` param or UDP.
/// - An explicit port is tried over the `transport` param or UDP, TCP, TLS.
/// - Otherwise SRV records for the `transport` param or TCP, UDP, TLS are
///   used, falling back to every address over TCP, UDP, TLS on default
///   ports.
///
/// NAPTR lookups are left to custom [`Resolver`]s.
#[derive(Clone)]
pub struct DnsResolver {
    dns: TokioAsyncResolver,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn uri_protocol(uri: &Uri) -> Option<Protocol> {
    uri.transport().and_then(|t| t.parse().ok())
}

impl DnsResolver {
    /// Reads the system resolver configuration, or falls back to public
    /// name servers when there is none.
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(2);
        opts.attempts = 1;
        let dns = match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, _)) => TokioAsyncResolver::tokio(config, opts),
            Err(e) => {
                debug!("no system resolver config, using defaults: {}", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
            }
        };
        DnsResolver { dns }
    }

    async fn lookup(host: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = vec![];
                for addr in addrs {
                    if !ips.contains(&addr.ip()) {
                        ips.push(addr.ip());
                    }
                }
                ips
            }
            Err(e) => {
                warn!("failed resolving host {}: {}", host, e);
                vec![]
            }
        }
    }

    async fn lookup_srv(&self, host: &str, protocol: Protocol) -> Vec<SrvTarget> {
        let Some(service) = srv_service(protocol) else {
            return vec![];
        };
        let name = format!("{}.{}", service, host);
        match self.dns.srv_lookup(name.as_str()).await {
            Ok(records) => records
                .iter()
                .map(|srv| SrvTarget {
                    protocol,
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                })
                .collect(),
            Err(e) => {
                debug!("no SRV records for {}: {}", name, e);
                vec![]
            }
        }
    }

    async fn resolve_srv(&self, host: &str, protocols: &[Protocol]) -> Vec<SipAddr> {
        let answers = join_all(protocols.iter().map(|p| self.lookup_srv(host, *p))).await;
        let mut addrs = vec![];
        for target in order_srv(answers.into_iter().flatten().collect()) {
            for ip in Self::lookup(&target.target).await {
                addrs.push(SipAddr::new(target.protocol, ip.to_string(), target.port));
            }
        }
        addrs
    }

    fn expand(ips: &[IpAddr], protocols: &[Protocol], port: Option<u16>) -> Vec<SipAddr> {
        ips.iter()
            .flat_map(|ip| {
                protocols.iter().map(move |protocol| {
                    SipAddr::new(
                        *protocol,
                        ip.to_string(),
                        port.unwrap_or_else(|| protocol.default_port()),
                    )
                })
            })
            .collect()
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, uri: &Uri) -> Vec<SipAddr> {
        let host = uri.host_unbracketed();
        let transport = uri_protocol(uri);

        if transport.is_some_and(|p| p.is_websocket()) {
            let (protocol, default_port) = if uri.is_secure() {
                (Protocol::Wss, 443)
            } else {
                (Protocol::Ws, 80)
            };
            return vec![SipAddr::new(
                protocol,
                host,
                uri.port.unwrap_or(default_port),
            )];
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            let protocol = transport.unwrap_or(Protocol::Udp);
            return Self::expand(&[ip], &[protocol], uri.port);
        }

        let protocols = match (transport, uri.port) {
            (Some(protocol), _) => vec![protocol],
            (None, Some(_)) => vec![Protocol::Udp, Protocol::Tcp, Protocol::Tls],
            (None, None) => vec![Protocol::Tcp, Protocol::Udp, Protocol::Tls],
        };
        if uri.port.is_none() {
            let addrs = self.resolve_srv(host, &protocols).await;
            if !addrs.is_empty() {
                debug!("resolved {} to {} hops through SRV", uri, addrs.len());
                return addrs;
            }
        }
        let ips = Self::lookup(host).await;
        let addrs = Self::expand(&ips, &protocols, uri.port);
        debug!("resolved {} to {} hops", uri, addrs.len());
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn resolve(uri: &str) -> Vec<SipAddr> {
        DnsResolver::new().resolve(&uri.parse().expect("uri")).await
    }

    fn srv(protocol: Protocol, priority: u16, weight: u16, target: &str) -> SrvTarget {
        SrvTarget {
            protocol,
            priority,
            weight,
            port: 5060,
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        assert_eq!(
            resolve("sip:bob@192.0.2.4").await,
            vec![SipAddr::new(Protocol::Udp, "192.0.2.4", 5060)]
        );
        assert_eq!(
            resolve("sip:bob@192.0.2.4;transport=tls").await,
            vec![SipAddr::new(Protocol::Tls, "192.0.2.4", 5061)]
        );
        assert_eq!(
            resolve("sip:bob@[2001:db8::1]:5070;transport=tcp").await,
            vec![SipAddr::new(Protocol::Tcp, "2001:db8::1", 5070)]
        );
    }

    #[tokio::test]
    async fn test_resolve_websocket_bypasses_dns() {
        assert_eq!(
            resolve("sip:bob@ws.example.com;transport=ws").await,
            vec![SipAddr::new(Protocol::Ws, "ws.example.com", 80)]
        );
        assert_eq!(
            resolve("sips:bob@ws.example.com;transport=ws").await,
            vec![SipAddr::new(Protocol::Wss, "ws.example.com", 443)]
        );
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let hops = resolve("sip:bob@localhost:5080").await;
        assert!(!hops.is_empty());
        assert_eq!(hops[0].protocol, Protocol::Udp);
        assert!(hops.iter().all(|h| h.port == 5080));

        // no SRV records for localhost, so every protocol on its default port
        let hops = resolve("sip:bob@localhost").await;
        assert_eq!(hops[0].protocol, Protocol::Tcp);
        assert!(hops
            .iter()
            .any(|h| h.protocol == Protocol::Tls && h.port == 5061));

        let hops = resolve("sip:bob@localhost;transport=udp").await;
        assert!(!hops.is_empty());
        assert!(hops
            .iter()
            .all(|h| h.protocol == Protocol::Udp && h.port == 5060));
    }

    #[tokio::test]
    async fn test_resolve_failure_is_empty() {
        assert!(resolve("sip:bob@does-not-exist.invalid").await.is_empty());
        assert!(resolve("sip:bob@does-not-exist.invalid:5060").await.is_empty());
    }

    #[test]
    fn test_srv_order() {
        let ordered = order_srv(vec![
            srv(Protocol::Tcp, 20, 0, "backup"),
            srv(Protocol::Tcp, 10, 10, "light"),
            srv(Protocol::Udp, 10, 60, "heavy"),
            srv(Protocol::Udp, 10, 10, "light-udp"),
        ]);
        let names: Vec<&str> = ordered.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(names, vec!["heavy", "light", "light-udp", "backup"]);
    }

    #[test]
    fn test_srv_service_names() {
        assert_eq!(srv_service(Protocol::Udp), Some("_sip._udp"));
        assert_eq!(srv_service(Protocol::Tcp), Some("_sip._tcp"));
        assert_eq!(srv_service(Protocol::Tls), Some("_sips._tcp"));
        assert_eq!(srv_service(Protocol::Ws), None);
    }
}
