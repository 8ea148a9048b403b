use super::{
    connection::TransportSender,
    sip_addr::{Protocol, SipAddr},
    stream::{StreamConnection, StreamConnectionInner},
};
use crate::{config::TlsConfig, error::Error, message::Message, Result};
use std::{fmt, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector, TlsStream,
};
use tracing::info;

type TlsInner = StreamConnectionInner<
    tokio::io::ReadHalf<TlsStream<TcpStream>>,
    tokio::io::WriteHalf<TlsStream<TcpStream>>,
>;

/// A TLS stream, either dialled by us or accepted by the listener.
#[derive(Clone)]
pub struct TlsConnection {
    pub inner: Arc<TlsInner>,
}

impl TlsConnection {
    pub async fn connect(remote: &SipAddr, connector: &TlsConnector) -> Result<Self> {
        let socket_addr = remote.get_socketaddr()?;
        let server_name = pki_types::ServerName::try_from(remote.host.as_str())
            .map_err(|_| Error::TlsError(format!("invalid server name: {}", remote.host)))?
            .to_owned();

        let stream = TcpStream::connect(socket_addr).await?;
        let tls_stream = connector.connect(server_name, stream).await?;
        let connection = Self::from_stream(tls_stream.into())?;

        info!(
            "created TLS client connection: {} -> {}",
            connection.get_addr(),
            remote
        );
        Ok(connection)
    }

    pub fn from_stream(stream: TlsStream<TcpStream>) -> Result<Self> {
        let (local, peer) = {
            let (tcp, _) = stream.get_ref();
            (tcp.local_addr()?, tcp.peer_addr()?)
        };
        let local_addr = SipAddr::from_socket(Protocol::Tls, local);
        let remote_addr = SipAddr::from_socket(Protocol::Tls, peer).with_local(local);

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(TlsConnection {
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

pub fn create_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = match &config.cert {
        Some(cert_data) => {
            let mut reader = std::io::BufReader::new(cert_data.as_slice());
            rustls_pemfile::certs(&mut reader)
                .collect::<std::result::Result<Vec<_>, std::io::Error>>()
                .map_err(|e| Error::TlsError(format!("failed to parse certificate: {}", e)))?
        }
        None => return Err(Error::TlsError("no certificate provided".to_string())),
    };

    let key = match &config.key {
        Some(key_data) => {
            let mut reader = std::io::BufReader::new(key_data.as_slice());
            let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
                .collect::<std::result::Result<Vec<_>, std::io::Error>>()
                .map_err(|e| Error::TlsError(format!("failed to parse PKCS8 key: {}", e)))?;

            match keys.into_iter().next() {
                Some(key) => pki_types::PrivateKeyDer::Pkcs8(key),
                None => {
                    let mut reader = std::io::BufReader::new(key_data.as_slice());
                    let keys = rustls_pemfile::rsa_private_keys(&mut reader)
                        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
                        .map_err(|e| Error::TlsError(format!("failed to parse RSA key: {}", e)))?;
                    match keys.into_iter().next() {
                        Some(key) => pki_types::PrivateKeyDer::Pkcs1(key),
                        None => {
                            return Err(Error::TlsError("no valid private key found".to_string()))
                        }
                    }
                }
            }
        }
        None => return Err(Error::TlsError("no private key provided".to_string())),
    };

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsError(format!("TLS configuration error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Client side trust: the webpki roots plus any configured CA bundle.
pub fn create_connector(config: Option<&TlsConfig>) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_data) = config.and_then(|c| c.ca_certs.as_ref()) {
        let mut reader = std::io::BufReader::new(ca_data.as_slice());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| Error::TlsError(format!("failed to parse CA: {}", e)))?;
            root_store
                .add(cert)
                .map_err(|e| Error::TlsError(format!("invalid CA certificate: {}", e)))?;
        }
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client_config)))
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
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

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.inner.local_addr.host_port(),
            self.inner.remote_addr.host_port()
        )
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
