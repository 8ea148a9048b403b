use crate::{Error, Result};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

/// Transport protocol of a hop or a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Protocol {
    /// Only UDP needs transaction-level retransmission.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Protocol::Udp)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Wss)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    /// Default SIP port used when a Via or URI omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Tls => 5061,
            _ => 5060,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Ws => "WS",
            Protocol::Wss => "WSS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Protocol::Udp),
            "TCP" => Ok(Protocol::Tcp),
            "TLS" => Ok(Protocol::Tls),
            "WS" => Ok(Protocol::Ws),
            "WSS" => Ok(Protocol::Wss),
            other => Err(Error::Error(format!("unknown transport protocol: {}", other))),
        }
    }
}

/// SIP Address
///
/// A resolved next hop: protocol, host and port. `local` is set for
/// flows, i.e. a specific connection accepted or opened on one of our
/// local sockets. Targets carrying `local` are never re-dialled; if the
/// flow is gone the hop is unreachable.
///
/// ```rust
/// use sipstack::transport::{Protocol, SipAddr};
///
/// let addr = SipAddr::new(Protocol::Tcp, "192.168.1.100", 5060);
/// assert_eq!(addr.to_string(), "TCP 192.168.1.100:5060");
/// assert!(addr.get_socketaddr().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub local: Option<SocketAddr>,
}

impl SipAddr {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        let host: String = host.into();
        SipAddr {
            protocol,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            local: None,
        }
    }

    pub fn from_socket(protocol: Protocol, addr: SocketAddr) -> Self {
        SipAddr {
            protocol,
            host: addr.ip().to_string(),
            port: addr.port(),
            local: None,
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// Whether this address names a bound flow rather than a dialable hop.
    pub fn is_flow(&self) -> bool {
        self.local.is_some()
    }

    /// Same hop with the flow binding dropped; used as the connection map key.
    pub fn remote_key(&self) -> SipAddr {
        SipAddr {
            local: None,
            ..self.clone()
        }
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.host.parse().map_err(|_| {
            Error::Error(format!("cannot convert host {} to SocketAddr", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.host_port())?;
        if let Some(local) = self.local {
            write!(f, " via {}", local)?;
        }
        Ok(())
    }
}
