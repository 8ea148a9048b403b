use crate::transport::{
    tcp::TcpConnection, tls::TlsConnection, websocket::WebSocketConnection, Protocol, SipAddr,
    SipConnection, TransportLayer,
};
use crate::Result;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// What an accepted socket is upgraded to before it becomes a connection.
#[derive(Clone)]
pub enum ListenerKind {
    Tcp,
    Tls(TlsAcceptor),
    Ws,
}

impl ListenerKind {
    pub fn protocol(&self) -> Protocol {
        match self {
            ListenerKind::Tcp => Protocol::Tcp,
            ListenerKind::Tls(_) => Protocol::Tls,
            ListenerKind::Ws => Protocol::Ws,
        }
    }

    async fn upgrade(&self, stream: TcpStream) -> Result<SipConnection> {
        Ok(match self {
            ListenerKind::Tcp => TcpConnection::from_stream(stream)?.into(),
            ListenerKind::Tls(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                TlsConnection::from_stream(tls_stream.into())?.into()
            }
            ListenerKind::Ws => WebSocketConnection::accept(stream, Protocol::Ws)
                .await?
                .into(),
        })
    }
}

pub struct TcpListenerConnectionInner {
    pub local_addr: SipAddr,
    pub kind: ListenerKind,
    listener: std::sync::Mutex<Option<TcpListener>>,
}

/// Accepts stream connections and registers each one with the transport layer.
#[derive(Clone)]
pub struct TcpListenerConnection {
    pub inner: Arc<TcpListenerConnectionInner>,
}

impl TcpListenerConnection {
    pub async fn bind(local: SocketAddr, kind: ListenerKind) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let local_addr = SipAddr::from_socket(kind.protocol(), listener.local_addr()?);
        info!("created {} listener on {}", kind.protocol(), local_addr);
        Ok(TcpListenerConnection {
            inner: Arc::new(TcpListenerConnectionInner {
                local_addr,
                kind,
                listener: std::sync::Mutex::new(Some(listener)),
            }),
        })
    }

    pub fn local_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    /// Spawns the accept loop. It stops with the layer's cancel token.
    pub fn serve_listener(&self, layer: TransportLayer) {
        let listener = match self.inner.listener.lock() {
            Ok(mut listener) => listener.take(),
            Err(_) => None,
        };
        let Some(listener) = listener else {
            warn!("listener already serving: {}", self);
            return;
        };
        let kind = self.inner.kind.clone();
        let token = layer.cancel_token().child_token();
        let local_addr = self.inner.local_addr.clone();

        tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("failed to accept connection on {}: {:?}", local_addr, e);
                            continue;
                        }
                    },
                };
                debug!("new {} connection from {}", kind.protocol(), remote_addr);

                let kind = kind.clone();
                let layer = layer.clone();
                tokio::spawn(async move {
                    match kind.upgrade(stream).await {
                        Ok(connection) => {
                            let remote = match &connection {
                                SipConnection::Tcp(c) => c.remote_addr().clone(),
                                SipConnection::Tls(c) => c.remote_addr().clone(),
                                SipConnection::WebSocket(c) => c.remote_addr().clone(),
                                _ => return,
                            };
                            layer.add_connection(connection, remote);
                        }
                        Err(e) => warn!("failed to set up connection from {}: {}", remote_addr, e),
                    }
                });
            }
            info!("listener stopped: {}", local_addr);
        });
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Listener {}", self.inner.kind.protocol(), self.inner.local_addr)
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
