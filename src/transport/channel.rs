use super::{connection::TransportSender, SipAddr, TransportEvent};
use crate::{message::Message, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Outbound traffic of a channel connection: the message and the hop it was
/// sent to.
pub type ChannelOutgoing = UnboundedReceiver<(Message, SipAddr)>;
/// Inbound traffic to inject: the message and the remote it appears to come from.
pub type ChannelIncoming = UnboundedSender<(Message, SipAddr)>;

struct ChannelInner {
    incoming: Mutex<Option<UnboundedReceiver<(Message, SipAddr)>>>,
    outgoing: UnboundedSender<(Message, SipAddr)>,
    addr: SipAddr,
    broken: AtomicBool,
}

/// In-memory connection. Sent messages are recorded on a channel instead of
/// hitting a socket, which lets transactions and the endpoint run without I/O.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn create_connection(addr: SipAddr) -> (Self, ChannelIncoming, ChannelOutgoing) {
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let (outgoing_tx, outgoing_rx) = unbounded_channel();
        let connection = ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming_rx)),
                outgoing: outgoing_tx,
                addr,
                broken: AtomicBool::new(false),
            }),
        };
        (connection, incoming_tx, outgoing_rx)
    }

    pub async fn send(&self, msg: &Message, remote: &SipAddr) -> Result<()> {
        if self.inner.broken.load(Ordering::Relaxed) {
            return Err(crate::Error::TransportLayerError(
                "channel broken".to_string(),
                remote.clone(),
            ));
        }
        self.inner
            .outgoing
            .send((msg.clone(), remote.clone()))
            .map_err(Into::into)
    }

    /// Makes every following send fail.
    pub fn set_broken(&self, broken: bool) {
        self.inner.broken.store(broken, Ordering::Relaxed);
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self
            .inner
            .incoming
            .lock()
            .map_err(|e| crate::Error::Error(e.to_string()))?
            .take();
        let Some(mut incoming) = incoming else {
            return Err(crate::Error::Error(
                "ChannelConnection::serve_loop called twice".to_string(),
            ));
        };
        while let Some((msg, remote)) = incoming.recv().await {
            sender.send(TransportEvent::Incoming(msg, remote))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
