use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    Protocol, SipAddr, SipConnection, TransportEvent,
};
use crate::{
    message::{parse_message, Message},
    Result,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, trace, warn};

const MAX_DATAGRAM_SIZE: usize = 65535;

struct UdpInner {
    conn: UdpSocket,
    addr: SipAddr,
    local: SocketAddr,
}

/// The single UDP socket of an endpoint. Every UDP flow shares it.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let local = conn.local_addr()?;
        let addr = SipAddr::from_socket(Protocol::Udp, external.unwrap_or(local));

        let t = UdpConnection {
            inner: Arc::new(UdpInner { conn, addr, local }),
        };
        info!("created UDP transport: {} external: {:?}", t, external);
        Ok(t)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    warn!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                data if data.iter().all(|b| b.is_ascii_whitespace()) => continue,
                _ => {}
            }

            let mut msg = match parse_message(&buf[..len]) {
                Some(msg) if msg.check() => msg,
                _ => {
                    debug!("dropping malformed datagram from {} ({} bytes)", addr, len);
                    continue;
                }
            };

            let remote = SipAddr::from_socket(Protocol::Udp, addr).with_local(self.inner.local);
            SipConnection::update_msg_received(&mut msg, &remote, true);

            trace!("received {} {} -> {}", len, addr, self.get_addr());
            sender.send(TransportEvent::Incoming(msg, remote))?;
        }
    }

    #[instrument(skip(self, msg), fields(addr = %self.get_addr()))]
    pub async fn send(&self, msg: &Message, target: &SipAddr) -> Result<()> {
        let destination = target.get_socketaddr()?;
        let buf = msg.to_bytes();

        trace!("sending {} -> {}", buf.len(), destination);

        self.inner
            .conn
            .send_to(&buf, destination)
            .await
            .map_err(|e| crate::Error::TransportLayerError(e.to_string(), target.to_owned()))
            .map(|_| ())
    }

    /// Advertised address (the external one when configured).
    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.local)
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        info!("dropping UDP transport: {}", self.addr);
    }
}
