use crate::transaction::TimerTable;
use std::net::{IpAddr, Ipv4Addr};

/// PEM material for the TLS transport.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    // Server certificate chain in PEM format
    pub cert: Option<Vec<u8>>,
    // Server private key in PEM format (PKCS#8 or PKCS#1)
    pub key: Option<Vec<u8>>,
    // Extra root CA certificates in PEM format, trusted next to the webpki roots
    pub ca_certs: Option<Vec<u8>>,
}

impl TlsConfig {
    pub fn is_server_capable(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Everything an [`crate::Endpoint`] needs to bind its transports and run
/// its transactions.
#[derive(Clone, Debug)]
pub struct EndpointOption {
    /// Local address the sockets bind to.
    pub address: IpAddr,
    /// Host advertised in Via headers and matched against Route/Request-URI
    /// to recognise ourselves. Defaults to `address`.
    pub public_address: Option<String>,
    /// UDP and TCP port. `Some(0)` binds an ephemeral port.
    pub port: u16,
    pub udp: bool,
    pub tcp: bool,
    /// TLS listener port; the listener only starts with a server-capable `tls` config.
    pub tls_port: u16,
    pub tls: Option<TlsConfig>,
    pub ws_port: Option<u16>,
    /// When set, outbound UDP requests carry `rport=<remote port>` instead of
    /// the bare `rport` flag.
    pub rport: bool,
    pub max_forwards: u32,
    pub user_agent: Option<String>,
    /// HMAC key for flow tokens. A random one is generated when empty.
    pub flow_secret: Option<Vec<u8>>,
    pub timers: TimerTable,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_address: None,
            port: 5060,
            udp: true,
            tcp: true,
            tls_port: 5061,
            tls: None,
            ws_port: None,
            rport: false,
            max_forwards: 70,
            user_agent: None,
            flow_secret: None,
            timers: TimerTable::default(),
        }
    }
}

impl EndpointOption {
    /// Host used for Via stamping and self-recognition.
    pub fn hostname(&self) -> String {
        if let Some(public) = &self.public_address {
            return public.clone();
        }
        if !self.address.is_unspecified() {
            return self.address.to_string();
        }
        first_interface_address()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }
}

/// First non-loopback IPv4 interface address.
pub fn first_interface_address() -> Option<IpAddr> {
    get_if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .find(|ip| ip.is_ipv4())
}
