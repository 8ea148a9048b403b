use crate::{
    message::Message,
    transport::{
        connection::TransportSender,
        sip_addr::{Protocol, SipAddr},
        stream::{StreamConnection, StreamConnectionInner},
    },
    Result,
};
use std::{fmt, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

type TcpInner =
    StreamConnectionInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

#[derive(Clone)]
pub struct TcpConnection {
    pub inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: &SipAddr) -> Result<Self> {
        let socket_addr = remote.get_socketaddr()?;
        let stream = TcpStream::connect(socket_addr).await?;
        let connection = Self::from_stream(stream)?;
        info!(
            "created TCP client connection: {} -> {}",
            connection.get_addr(),
            remote
        );
        Ok(connection)
    }

    /// Wraps an accepted or freshly connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let local_addr = SipAddr::from_socket(Protocol::Tcp, local);
        let remote_addr = SipAddr::from_socket(Protocol::Tcp, peer).with_local(local);

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            )),
        })
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    async fn send_message(&self, msg: &Message) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_loop(sender).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.inner.local_addr.host_port(),
            self.inner.remote_addr.host_port()
        )
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
