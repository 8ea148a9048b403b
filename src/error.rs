use crate::transaction::key::TransactionId;
use crate::transport::SipAddr;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(String),

    #[error("transport layer error: {0} ({1})")]
    TransportLayerError(String, SipAddr),

    #[error("transaction error: {0} ({1})")]
    TransactionError(String, TransactionId),

    #[error("endpoint error: {0}")]
    EndpointError(String),

    #[error("failed to negotiate protection quality: {0}")]
    DigestNegotiationError(String),

    #[error("digest error: {0}")]
    DigestError(String),

    #[error("proxy error: {0}")]
    ProxyError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("address parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("{0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
