use crate::{
    message::{
        parser::{find_head_end, parse_head},
        Message,
    },
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent,
    },
    Error, Result,
};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages on a byte stream by their Content-Length.
#[derive(Debug, Default)]
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(Message),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl std::fmt::Display for SipCodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipCodecType::Message(msg) => write!(f, "{}", msg),
            SipCodecType::KeepaliveRequest => write!(f, "Keepalive Request"),
            SipCodecType::KeepaliveResponse => write!(f, "Keepalive Response"),
        }
    }
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.starts_with(KEEPALIVE_REQUEST) {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }

        if src.starts_with(KEEPALIVE_RESPONSE) {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }

        let head_end = match find_head_end(&src[..]) {
            Some(head_end) => head_end,
            None if src.len() > MAX_SIP_MESSAGE_SIZE => {
                return Err(Error::SipMessageError("SIP message too large".to_string()))
            }
            None => return Ok(None),
        };

        let head = std::str::from_utf8(&src[..head_end])
            .map_err(|e| Error::SipMessageError(format!("invalid UTF-8 in headers: {}", e)))?;
        let mut msg = parse_head(head)
            .ok_or_else(|| Error::SipMessageError("malformed message head".to_string()))?;

        let body_start = head_end + 4;
        let total_len = body_start
            .checked_add(msg.headers().content_length().unwrap_or(0))
            .filter(|len| *len <= MAX_SIP_MESSAGE_SIZE)
            .ok_or_else(|| Error::SipMessageError("SIP message too large".to_string()))?;
        if src.len() < total_len {
            return Ok(None);
        }

        let data = src.split_to(total_len);
        msg.set_content(data[body_start..].to_vec());
        Ok(Some(SipCodecType::Message(msg)))
    }
}

impl Encoder<Message> for SipCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

/// Read/write halves of one stream connection. `remote_addr` carries the
/// local socket so inbound messages are tagged with their flow.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: &Message) -> Result<()> {
        send_to_stream(&self.write_half, msg).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        send_raw_to_stream(&self.write_half, data).await
    }

    /// Returns `Ok` when the peer closes cleanly, `Err` on a read failure.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("connection already served: {}", self.remote_addr);
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];

        loop {
            let n = read_half.read(&mut read_buf).await?;
            if n == 0 {
                info!("connection closed by peer: {}", remote_addr);
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);

            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(SipCodecType::Message(mut msg))) => {
                        if !msg.check() {
                            debug!("dropping message without mandatory headers from {}", remote_addr);
                            continue;
                        }
                        SipConnection::update_msg_received(&mut msg, &remote_addr, false);
                        sender.send(TransportEvent::Incoming(msg, remote_addr.clone()))?;
                    }
                    Ok(Some(SipCodecType::KeepaliveRequest)) => {
                        self.send_raw(KEEPALIVE_RESPONSE).await?;
                    }
                    Ok(Some(SipCodecType::KeepaliveResponse)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        warn!("error decoding message from {}: {}", remote_addr, e);
                        buffer.clear();
                        break;
                    }
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half
            .shutdown()
            .await
            .map_err(|e| Error::Error(format!("failed to shutdown write half: {}", e)))
    }
}

#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: &Message) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub async fn send_to_stream<W>(write_half: &Mutex<W>, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    send_raw_to_stream(write_half, &msg.to_bytes()).await
}

pub async fn send_raw_to_stream<W>(write_half: &Mutex<W>, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut lock = write_half.lock().await;
    lock.write_all(data).await?;
    lock.flush().await?;
    Ok(())
}
