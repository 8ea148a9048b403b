use super::{
    connection::{TransportReceiver, TransportSender},
    tcp::TcpConnection,
    tcp_listener::{ListenerKind, TcpListenerConnection},
    tls::{create_acceptor, create_connector, TlsConnection},
    udp::UdpConnection,
    websocket::WebSocketConnection,
    Protocol, SipAddr, SipConnection, TransportEvent,
};
use crate::{config::EndpointOption, message::Message, Error, Result};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    time::{sleep_until, Instant},
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unreferenced stream connections are closed after this much inactivity.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Receives a description of every error seen on a connection while the
/// holder keeps its [`ConnectionRef`].
pub type ConnectionErrorSender = UnboundedSender<String>;

/// How outbound requests get their top Via rewritten.
#[derive(Debug, Clone, Default)]
pub struct ViaStamp {
    pub host: String,
    pub ports: HashMap<Protocol, u16>,
    pub rport: bool,
}

impl ViaStamp {
    pub fn apply(&self, msg: &mut Message, protocol: Protocol, remote: &SipAddr) {
        let Message::Request(rq) = msg else {
            return;
        };
        let Some(via) = rq.headers.via_mut().first_mut() else {
            return;
        };
        via.host = self.host.clone();
        via.port = Some(
            self.ports
                .get(&protocol)
                .copied()
                .unwrap_or_else(|| protocol.default_port()),
        );
        via.protocol = protocol.to_string();
        if protocol == Protocol::Udp {
            let rport = self.rport.then(|| remote.port.to_string());
            via.params.set("rport", rport);
        }
    }
}

/// A live connection to one remote, shared by every holder of a
/// [`ConnectionRef`] on it.
pub struct Flow {
    pub connection: SipConnection,
    pub remote: SipAddr,
    stamp: Arc<RwLock<ViaStamp>>,
    refs: AtomicUsize,
    next_listener: AtomicU64,
    listeners: Mutex<HashMap<u64, ConnectionErrorSender>>,
    last_activity: Mutex<Instant>,
}

impl Flow {
    pub fn new(
        connection: SipConnection,
        remote: SipAddr,
        stamp: Arc<RwLock<ViaStamp>>,
    ) -> Arc<Self> {
        Arc::new(Flow {
            connection,
            remote,
            stamp,
            refs: AtomicUsize::new(0),
            next_listener: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Takes a reference, optionally listening for connection errors until
    /// the reference is dropped.
    pub fn acquire(self: &Arc<Self>, on_error: Option<ConnectionErrorSender>) -> ConnectionRef {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self.touch();
        let listener = on_error.and_then(|tx| {
            let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
            let mut listeners = self.listeners.lock().ok()?;
            listeners.insert(id, tx);
            Some(id)
        });
        ConnectionRef {
            flow: self.clone(),
            listener,
        }
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn notify_error(&self, reason: &str) {
        if let Ok(listeners) = self.listeners.lock() {
            for tx in listeners.values() {
                tx.send(reason.to_string()).ok();
            }
        }
    }

    fn release(&self, listener: Option<u64>) {
        if let Some(id) = listener {
            if let Ok(mut listeners) = self.listeners.lock() {
                listeners.remove(&id);
            }
        }
        self.refs.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    fn is_stream(&self) -> bool {
        matches!(
            self.connection,
            SipConnection::Tcp(_) | SipConnection::Tls(_) | SipConnection::WebSocket(_)
        )
    }
}

/// Scoped hold on a [`Flow`]. Dropping it releases the reference and
/// removes its error listener.
pub struct ConnectionRef {
    flow: Arc<Flow>,
    listener: Option<u64>,
}

impl ConnectionRef {
    pub fn protocol(&self) -> Protocol {
        self.flow.connection.protocol()
    }

    pub fn is_reliable(&self) -> bool {
        self.protocol().is_reliable()
    }

    pub fn remote(&self) -> &SipAddr {
        &self.flow.remote
    }

    /// Stamps the top Via of requests and sends. A failure is also reported
    /// to every error listener on the flow.
    pub async fn send(&self, mut msg: Message) -> Result<()> {
        let protocol = self.protocol();
        if let Ok(stamp) = self.flow.stamp.read() {
            stamp.apply(&mut msg, protocol, &self.flow.remote);
        }
        self.flow.touch();
        debug!(remote = %self.flow.remote, "send {}", first_line(&msg));
        let result = self.flow.connection.send(&msg, &self.flow.remote).await;
        if let Err(e) = &result {
            warn!(remote = %self.flow.remote, "send failed: {}", e);
            self.flow.notify_error(&e.to_string());
        }
        result
    }

    /// Explicit form of dropping the reference.
    pub fn release(self) {}
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        self.flow.acquire(None)
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.flow.release(self.listener);
    }
}

impl std::fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionRef({})", self.flow.remote)
    }
}

fn first_line(msg: &Message) -> String {
    match msg {
        Message::Request(rq) => format!("{} {}", rq.method, rq.uri),
        Message::Response(rs) => format!("{} {}", rs.status, rs.reason),
    }
}

pub struct TransportLayerInner {
    cancel_token: CancellationToken,
    stamp: Arc<RwLock<ViaStamp>>,
    udp: RwLock<Option<UdpConnection>>,
    flows: Mutex<HashMap<SipAddr, Arc<Flow>>>,
    listens: Mutex<Vec<SipAddr>>,
    connector: Mutex<Option<TlsConnector>>,
    sender: TransportSender,
    receiver: Mutex<Option<TransportReceiver>>,
}

/// Routes by protocol to the UDP socket, the stream connections and the
/// in-memory channels, and hands out reference counted connections.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        let (sender, receiver) = unbounded_channel();
        let inner = TransportLayerInner {
            cancel_token,
            stamp: Arc::new(RwLock::new(ViaStamp::default())),
            udp: RwLock::new(None),
            flows: Mutex::new(HashMap::new()),
            listens: Mutex::new(Vec::new()),
            connector: Mutex::new(None),
            sender,
            receiver: Mutex::new(Some(receiver)),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn set_via_stamp(&self, stamp: ViaStamp) {
        if let Ok(mut current) = self.inner.stamp.write() {
            *current = stamp;
        }
    }

    pub fn via_stamp(&self) -> ViaStamp {
        self.inner
            .stamp
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// The event stream; can be taken once.
    pub fn take_receiver(&self) -> Option<TransportReceiver> {
        self.inner.receiver.lock().ok()?.take()
    }

    pub fn sender(&self) -> TransportSender {
        self.inner.sender.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Binds every transport enabled in `option` and starts serving it.
    pub async fn bind(&self, option: &EndpointOption) -> Result<()> {
        let mut port = option.port;
        let mut ports = HashMap::new();

        if option.udp {
            let udp = UdpConnection::create_connection(
                SocketAddr::new(option.address, port),
                None,
            )
            .await?;
            port = udp.local_addr().port();
            ports.insert(Protocol::Udp, port);
            self.add_udp(udp);
        }
        if option.tcp {
            let listener = TcpListenerConnection::bind(
                SocketAddr::new(option.address, port),
                ListenerKind::Tcp,
            )
            .await?;
            ports.insert(Protocol::Tcp, listener.local_addr().port);
            listener.serve_listener(self.clone());
            self.add_listen(listener.local_addr().clone());
        }
        if let Some(tls) = option.tls.as_ref() {
            if let Ok(mut connector) = self.inner.connector.lock() {
                *connector = Some(create_connector(Some(tls))?);
            }
            if tls.is_server_capable() {
                let listener = TcpListenerConnection::bind(
                    SocketAddr::new(option.address, option.tls_port),
                    ListenerKind::Tls(create_acceptor(tls)?),
                )
                .await?;
                ports.insert(Protocol::Tls, listener.local_addr().port);
                listener.serve_listener(self.clone());
                self.add_listen(listener.local_addr().clone());
            }
        }
        if let Some(ws_port) = option.ws_port {
            let listener = TcpListenerConnection::bind(
                SocketAddr::new(option.address, ws_port),
                ListenerKind::Ws,
            )
            .await?;
            ports.insert(Protocol::Ws, listener.local_addr().port);
            listener.serve_listener(self.clone());
            self.add_listen(listener.local_addr().clone());
        }

        self.set_via_stamp(ViaStamp {
            host: option.hostname(),
            ports,
            rport: option.rport,
        });
        Ok(())
    }

    fn add_listen(&self, addr: SipAddr) {
        if let Ok(mut listens) = self.inner.listens.lock() {
            listens.push(addr);
        }
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner
            .listens
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Installs the datagram socket and starts its receive loop.
    pub fn add_udp(&self, udp: UdpConnection) {
        if let Ok(mut current) = self.inner.udp.write() {
            *current = Some(udp.clone());
        }
        self.add_listen(SipAddr::from_socket(Protocol::Udp, udp.local_addr()));

        let token = self.inner.cancel_token.child_token();
        let sender = self.inner.sender.clone();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                r = udp.serve_loop(sender) => {
                    if let Err(e) = r {
                        warn!("UDP serve loop exited: {}", e);
                    }
                }
            }
        });
    }

    /// Registers a connection to `remote` and starts reading from it.
    pub fn add_connection(&self, connection: SipConnection, remote: SipAddr) -> Arc<Flow> {
        let flow = Flow::new(connection, remote.clone(), self.inner.stamp.clone());
        if let Ok(mut flows) = self.inner.flows.lock() {
            flows.insert(remote.remote_key(), flow.clone());
        }
        info!("added connection: {}", flow.connection);
        self.inner.sender.send(TransportEvent::New(remote)).ok();
        tokio::spawn(Self::serve_flow(self.inner.clone(), flow.clone()));
        flow
    }

    async fn serve_flow(inner: Arc<TransportLayerInner>, flow: Arc<Flow>) {
        let token = inner.cancel_token.child_token();
        let idle = async {
            if flow.is_stream() {
                idle_watch(&flow).await
            } else {
                std::future::pending::<()>().await
            }
        };
        select! {
            _ = token.cancelled() => {}
            r = flow.connection.serve_loop(inner.sender.clone()) => match r {
                Ok(()) if flow.refs() > 0 => flow.notify_error("remote peer disconnected"),
                Ok(()) => {}
                Err(e) => {
                    warn!("connection {} failed: {}", flow.connection, e);
                    flow.notify_error(&e.to_string());
                }
            },
            _ = idle => {
                info!("closing idle connection: {}", flow.connection);
            }
        }

        if let Ok(mut flows) = inner.flows.lock() {
            let key = flow.remote.remote_key();
            if flows.get(&key).is_some_and(|f| Arc::ptr_eq(f, &flow)) {
                flows.remove(&key);
            }
        }
        flow.connection.close().await.ok();
        inner
            .sender
            .send(TransportEvent::Closed(flow.remote.clone()))
            .ok();
    }

    fn lookup(&self, target: &SipAddr) -> Option<Arc<Flow>> {
        let flows = self.inner.flows.lock().ok()?;
        let flow = flows.get(&target.remote_key())?;
        match (target.local, flow.remote.local) {
            (Some(wanted), Some(bound)) if wanted != bound => None,
            _ => Some(flow.clone()),
        }
    }

    fn udp_flow(&self, target: &SipAddr) -> Option<Arc<Flow>> {
        let udp = self.inner.udp.read().ok()?.clone()?;
        Some(Flow::new(
            udp.into(),
            target.clone(),
            self.inner.stamp.clone(),
        ))
    }

    /// Existing connection to `target`, never dialling a new one.
    pub fn get(&self, target: &SipAddr, on_error: Option<ConnectionErrorSender>) -> Option<ConnectionRef> {
        let flow = self.lookup(target).or_else(|| match target.protocol {
            Protocol::Udp => self.udp_flow(target),
            _ => None,
        })?;
        Some(flow.acquire(on_error))
    }

    /// Connection to `target`, reusing an existing one when possible.
    /// Flow targets (with a local socket) are never re-dialled.
    pub async fn open(
        &self,
        target: &SipAddr,
        on_error: Option<ConnectionErrorSender>,
    ) -> Result<ConnectionRef> {
        if let Some(conn) = self.get(target, on_error.clone()) {
            return Ok(conn);
        }
        if target.is_flow() {
            return Err(Error::TransportLayerError(
                "flow is gone".to_string(),
                target.clone(),
            ));
        }

        let connection: SipConnection = match target.protocol {
            Protocol::Udp => {
                return Err(Error::TransportLayerError(
                    "no UDP transport".to_string(),
                    target.clone(),
                ))
            }
            Protocol::Tcp => TcpConnection::connect(target).await?.into(),
            Protocol::Tls => {
                let connector = self.connector()?;
                TlsConnection::connect(target, &connector).await?.into()
            }
            Protocol::Ws | Protocol::Wss => WebSocketConnection::connect(target).await?.into(),
        };
        let flow = self.add_connection(connection, target.clone());
        Ok(flow.acquire(on_error))
    }

    fn connector(&self) -> Result<TlsConnector> {
        let mut connector = self
            .inner
            .connector
            .lock()
            .map_err(|e| Error::TlsError(e.to_string()))?;
        if let Some(connector) = connector.as_ref() {
            return Ok(connector.clone());
        }
        let created = create_connector(None)?;
        *connector = Some(created.clone());
        Ok(created)
    }

    /// Stops every listener and connection.
    pub fn destroy(&self) {
        self.inner.cancel_token.cancel();
        if let Ok(mut flows) = self.inner.flows.lock() {
            flows.clear();
        }
    }
}

async fn idle_watch(flow: &Flow) {
    loop {
        sleep_until(flow.last_activity() + IDLE_TIMEOUT).await;
        if flow.refs() == 0 && flow.last_activity() + IDLE_TIMEOUT <= Instant::now() {
            return;
        }
    }
}
