use crate::{
    message::{parse_message, Message as SipMessage},
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        sip_addr::{Protocol, SipAddr},
        stream::StreamConnection,
        TransportEvent,
    },
    Error, Result,
};
use futures_util::{SinkExt, StreamExt};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{Request, Response},
        http::HeaderValue,
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

const SIP_SUBPROTOCOL: &str = "sip";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

pub struct WebSocketInner {
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub ws_sink: Mutex<WsSink>,
    pub ws_read: Mutex<Option<WsRead>>,
}

#[derive(Clone)]
pub struct WebSocketConnection {
    pub inner: Arc<WebSocketInner>,
}

fn socket_addrs(stream: &MaybeTlsStream<TcpStream>) -> Result<(SocketAddr, SocketAddr)> {
    match stream {
        MaybeTlsStream::Plain(tcp) => Ok((tcp.local_addr()?, tcp.peer_addr()?)),
        _ => Err(Error::Error("unsupported websocket stream".to_string())),
    }
}

impl WebSocketConnection {
    /// Dials `ws://host:port` (or `wss://`) offering the `sip` subprotocol.
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let scheme = if remote.protocol == Protocol::Wss {
            "wss"
        } else {
            "ws"
        };
        let url = format!("{}://{}", scheme, remote.host_port());
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(SIP_SUBPROTOCOL),
        );

        let (ws_stream, _) = connect_async(request).await?;
        let connection = Self::from_stream(ws_stream, remote.protocol)?;
        info!(
            "created WebSocket client connection: {} -> {}",
            connection.get_addr(),
            remote
        );
        Ok(connection)
    }

    pub fn from_stream(ws_stream: WsStream, protocol: Protocol) -> Result<Self> {
        let (local, peer) = socket_addrs(ws_stream.get_ref())?;
        let (ws_sink, ws_read) = ws_stream.split();
        Ok(WebSocketConnection {
            inner: Arc::new(WebSocketInner {
                local_addr: SipAddr::from_socket(protocol, local),
                remote_addr: SipAddr::from_socket(protocol, peer).with_local(local),
                ws_sink: Mutex::new(ws_sink),
                ws_read: Mutex::new(Some(ws_read)),
            }),
        })
    }

    /// Server side handshake; selects the `sip` subprotocol when offered.
    pub async fn accept(stream: TcpStream, protocol: Protocol) -> Result<Self> {
        let callback = |req: &Request, mut response: Response| {
            let offers_sip = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.split(',').any(|p| p.trim() == SIP_SUBPROTOCOL));
            if offers_sip {
                response.headers_mut().insert(
                    "sec-websocket-protocol",
                    HeaderValue::from_static(SIP_SUBPROTOCOL),
                );
            }
            Ok(response)
        };
        let ws_stream =
            tokio_tungstenite::accept_hdr_async(MaybeTlsStream::Plain(stream), callback).await?;
        Self::from_stream(ws_stream, protocol)
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    fn deliver(&self, data: &[u8], sender: &TransportSender) -> Result<()> {
        match parse_message(data) {
            Some(msg) if msg.check() => {
                sender.send(TransportEvent::Incoming(msg, self.inner.remote_addr.clone()))?;
            }
            _ => debug!("dropping malformed websocket message from {}", self.inner.remote_addr),
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamConnection for WebSocketConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    async fn send_message(&self, msg: &SipMessage) -> Result<()> {
        let data = msg.to_string();
        let mut sink = self.inner.ws_sink.lock().await;
        sink.send(Message::Text(data.into())).await?;
        Ok(())
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut sink = self.inner.ws_sink.lock().await;
        sink.send(Message::Binary(data.to_vec().into())).await?;
        Ok(())
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let remote_addr = self.inner.remote_addr.clone();
        let mut ws_read = match self.inner.ws_read.lock().await.take() {
            Some(ws_read) => ws_read,
            None => {
                warn!("websocket connection already served: {}", remote_addr);
                return Ok(());
            }
        };

        while let Some(msg) = ws_read.next().await {
            match msg? {
                Message::Text(text) => self.deliver(text.as_str().as_bytes(), &sender)?,
                Message::Binary(bin) => {
                    if bin.as_ref() == KEEPALIVE_REQUEST {
                        self.send_raw(KEEPALIVE_RESPONSE).await?;
                        continue;
                    }
                    self.deliver(&bin, &sender)?;
                }
                Message::Ping(data) => {
                    let mut sink = self.inner.ws_sink.lock().await;
                    sink.send(Message::Pong(data)).await?;
                }
                Message::Close(_) => {
                    debug!("websocket closed by peer: {}", remote_addr);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.inner.ws_sink.lock().await;
        sink.send(Message::Close(None)).await?;
        Ok(())
    }
}

impl fmt::Display for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.inner.local_addr.protocol,
            self.inner.local_addr.host_port(),
            self.inner.remote_addr.host_port()
        )
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
