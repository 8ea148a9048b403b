use super::{
    channel::ChannelConnection, stream::StreamConnection, tcp::TcpConnection, tls::TlsConnection,
    udp::UdpConnection, websocket::WebSocketConnection, Protocol, SipAddr,
};
use crate::{
    message::{Message, Via},
    Result,
};
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// What the transports report to the endpoint. Remote addresses of
/// inbound traffic always carry the local socket, so they double as flows.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Incoming(Message, SipAddr),
    New(SipAddr),
    Closed(SipAddr),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    Tls(TlsConnection),
    WebSocket(WebSocketConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn protocol(&self) -> Protocol {
        match self {
            SipConnection::Udp(_) => Protocol::Udp,
            SipConnection::Tcp(_) => Protocol::Tcp,
            SipConnection::Tls(_) => Protocol::Tls,
            SipConnection::WebSocket(ws) => ws.get_addr().protocol,
            SipConnection::Channel(channel) => channel.get_addr().protocol,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.protocol().is_reliable()
    }

    /// Sends `msg` to `remote`. Only datagram connections look at `remote`;
    /// stream connections are already bound to their peer.
    pub async fn send(&self, msg: &Message, remote: &SipAddr) -> Result<()> {
        match self {
            SipConnection::Udp(transport) => transport.send(msg, remote).await,
            SipConnection::Tcp(transport) => transport.send_message(msg).await,
            SipConnection::Tls(transport) => transport.send_message(msg).await,
            SipConnection::WebSocket(transport) => transport.send_message(msg).await,
            SipConnection::Channel(transport) => transport.send(msg, remote).await,
        }
    }

    /// Reads a stream connection until the peer goes away.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.serve_loop(sender).await,
            SipConnection::Tls(transport) => transport.serve_loop(sender).await,
            SipConnection::WebSocket(transport) => transport.serve_loop(sender).await,
            SipConnection::Udp(transport) => transport.serve_loop(sender).await,
            SipConnection::Channel(transport) => transport.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.close().await,
            SipConnection::Tls(transport) => transport.close().await,
            SipConnection::WebSocket(transport) => transport.close().await,
            SipConnection::Udp(_) | SipConnection::Channel(_) => Ok(()),
        }
    }
}

impl SipConnection {
    /// Records where an inbound request really came from on its top Via.
    /// `rport` is only filled in when the sender asked for it.
    pub fn update_msg_received(msg: &mut Message, remote: &SipAddr, with_rport: bool) {
        if let Message::Request(rq) = msg {
            if let Some(via) = rq.headers.via_mut().first_mut() {
                Self::build_via_received(via, remote, with_rport);
            }
        }
    }

    pub fn build_via_received(via: &mut Via, remote: &SipAddr, with_rport: bool) {
        via.params.set("received", Some(remote.host.clone()));
        if with_rport && via.params.contains("rport") {
            via.params.set("rport", Some(remote.port.to_string()));
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "TCP {}", t),
            SipConnection::Tls(t) => write!(f, "TLS {}", t),
            SipConnection::WebSocket(t) => write!(f, "{}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TlsConnection> for SipConnection {
    fn from(connection: TlsConnection) -> Self {
        SipConnection::Tls(connection)
    }
}

impl From<WebSocketConnection> for SipConnection {
    fn from(connection: WebSocketConnection) -> Self {
        SipConnection::WebSocket(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
