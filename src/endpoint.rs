use crate::{
    config::EndpointOption,
    message::{HeaderValue, Message, Method, NameAddr, Request, Uri, Via},
    resolver::{DnsResolver, Resolver},
    transaction::{
        generate_branch, make_response, sequential_search, ResponseSender, Transaction,
        TransactionLayer,
    },
    transport::{
        decode_flow_token, encode_flow_token, Protocol, SipAddr, TransportEvent,
        TransportLayer, TransportReceiver,
    },
    Error, Result,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tokio::{select, sync::mpsc::unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const USER_AGENT: &str = "sipstack/0.1";

/// Application entry point for inbound requests. A new non-ACK request
/// already has its server transaction when the handler runs; an `Err`
/// answers it with 500. ACKs that match no transaction arrive here too.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, endpoint: &Endpoint, rq: Request, remote: SipAddr) -> Result<()>;
}

pub struct EndpointInner {
    option: EndpointOption,
    transport_layer: TransportLayer,
    transactions: TransactionLayer,
    resolver: Arc<dyn Resolver>,
    handler: Option<Arc<dyn RequestHandler>>,
    cancel_token: CancellationToken,
    hostname: String,
    flow_secret: Vec<u8>,
    user_agent: String,
}

/// A running SIP engine: transports, transactions and the dispatch between
/// them and the application.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

pub struct EndpointBuilder {
    option: EndpointOption,
    transport_layer: Option<TransportLayer>,
    resolver: Option<Arc<dyn Resolver>>,
    handler: Option<Arc<dyn RequestHandler>>,
    cancel_token: Option<CancellationToken>,
    user_agent: Option<String>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            option: EndpointOption::default(),
            transport_layer: None,
            resolver: None,
            handler: None,
            cancel_token: None,
            user_agent: None,
        }
    }

    pub fn with_option(&mut self, option: EndpointOption) -> &mut Self {
        self.option = option;
        self
    }

    pub fn with_transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_resolver(&mut self, resolver: Arc<dyn Resolver>) -> &mut Self {
        self.resolver.replace(resolver);
        self
    }

    pub fn with_handler(&mut self, handler: Arc<dyn RequestHandler>) -> &mut Self {
        self.handler.replace(handler);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent.replace(user_agent.to_string());
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let option = self.option.clone();
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let flow_secret = option.flow_secret.clone().unwrap_or_else(|| {
            let mut secret = vec![0u8; 20];
            rand::rng().fill(&mut secret[..]);
            secret
        });
        let user_agent = self
            .user_agent
            .take()
            .or_else(|| option.user_agent.clone())
            .unwrap_or_else(|| USER_AGENT.to_string());

        Endpoint {
            inner: Arc::new(EndpointInner {
                hostname: option.hostname(),
                transactions: TransactionLayer::new(option.timers, option.max_forwards),
                transport_layer,
                resolver: self
                    .resolver
                    .take()
                    .unwrap_or_else(|| Arc::new(DnsResolver::new())),
                handler: self.handler.take(),
                cancel_token,
                flow_secret,
                user_agent,
                option,
            }),
        }
    }
}

impl Endpoint {
    /// Dispatches transport events and drives transaction timers until the
    /// cancel token fires. Can run once per transport layer.
    pub async fn serve(&self) -> Result<()> {
        let receiver = self
            .inner
            .transport_layer
            .take_receiver()
            .ok_or_else(|| Error::EndpointError("endpoint is already serving".to_string()))?;
        info!(hostname = %self.inner.hostname, "starting endpoint: {}", self.inner.user_agent);
        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            _ = self.inner.transactions.process_timer() => {}
            _ = self.process_transport(receiver) => {
                info!("transport event stream closed");
            }
        }
        info!("endpoint shutdown");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    /// Shuts down every transaction and transport.
    pub fn destroy(&self) {
        self.inner.transactions.destroy();
        self.inner.transport_layer.destroy();
        self.inner.cancel_token.cancel();
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn option(&self) -> &EndpointOption {
        &self.inner.option
    }

    pub fn transport_layer(&self) -> &TransportLayer {
        &self.inner.transport_layer
    }

    pub fn transaction_layer(&self) -> &TransactionLayer {
        &self.inner.transactions
    }

    async fn process_transport(&self, mut receiver: TransportReceiver) {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, remote) => self.on_message(msg, remote),
                TransportEvent::New(remote) => debug!(%remote, "new connection"),
                TransportEvent::Closed(remote) => debug!(%remote, "connection closed"),
            }
        }
    }

    fn on_message(&self, msg: Message, remote: SipAddr) {
        let existing = match &msg {
            Message::Request(_) => self.inner.transactions.get_server(&msg),
            Message::Response(_) => self.inner.transactions.get_client(&msg),
        };
        if let Some(transaction) = existing {
            if let Err(e) = transaction.message(msg, true) {
                debug!("late message for {:?}: {}", transaction, e);
            }
            return;
        }

        match msg {
            Message::Request(rq) if rq.method == Method::Ack => self.dispatch(rq, remote, None),
            Message::Request(rq) => {
                let Some(connection) = self.inner.transport_layer.get(&remote, None) else {
                    warn!(%remote, "no connection back for {} {}", rq.method, rq.uri);
                    return;
                };
                match self
                    .inner
                    .transactions
                    .create_server_transaction(&rq, connection)
                {
                    Ok(transaction) => self.dispatch(rq, remote, Some(transaction)),
                    Err(e) => warn!(%remote, "cannot create server transaction: {}", e),
                }
            }
            Message::Response(rs) => {
                error!(%remote, "skipping response {} {}: no transaction", rs.status, rs.reason);
            }
        }
    }

    fn dispatch(&self, rq: Request, remote: SipAddr, transaction: Option<Transaction>) {
        let Some(handler) = self.inner.handler.clone() else {
            if let Some(transaction) = transaction {
                transaction.send(make_response(&rq, 501, None)).ok();
            }
            return;
        };
        let failure = transaction
            .as_ref()
            .map(|_| make_response(&rq, 500, None));
        let endpoint = self.clone();
        tokio::spawn(async move {
            let method = rq.method.clone();
            if let Err(e) = handler.handle(&endpoint, rq, remote).await {
                error!("{} handler failed: {}", method, e);
                if let (Some(transaction), Some(rs)) = (transaction, failure) {
                    transaction.send(rs).ok();
                }
            }
        });
    }

    /// Sends a message.
    ///
    /// Responses go out through their server transaction. Requests follow
    /// the Route set: a first route naming us is consumed, a strict route
    /// (no `lr`) swaps places with the Request-URI. A hop naming us is
    /// resolved through its flow token, anything else through the
    /// resolver. ACKs go straight to the first address; every other
    /// request runs a sequential search whose responses reach `tu`.
    pub async fn send(&self, msg: Message, tu: Option<ResponseSender>) -> Result<()> {
        let mut rq = match msg {
            Message::Request(rq) => rq,
            Message::Response(rs) => {
                let transaction = self
                    .inner
                    .transactions
                    .get_server(&rs.clone().into())
                    .ok_or_else(|| {
                        Error::EndpointError(format!("no server transaction for {}", rs.status))
                    })?;
                return transaction.send(rs);
            }
        };

        // requests we originate have no Via yet
        if rq.headers.via().is_empty() && !rq.headers.contains("user-agent") {
            rq.headers
                .insert("user-agent", self.inner.user_agent.clone());
        }
        let hop = self.next_hop(&mut rq);
        let addresses: Vec<SipAddr> = if hop.host_unbracketed() == self.inner.hostname {
            self.decode_flow_uri(&hop).into_iter().collect()
        } else {
            self.inner.resolver.resolve(&hop).await
        };

        if rq.method == Method::Ack {
            return self.send_ack(rq, addresses).await;
        }

        let tu = tu.unwrap_or_else(|| unbounded_channel().0);
        let endpoint = self.clone();
        tokio::spawn(async move {
            sequential_search(
                &endpoint.inner.transactions,
                &endpoint.inner.transport_layer,
                addresses,
                rq,
                tu,
            )
            .await
        });
        Ok(())
    }

    fn next_hop(&self, rq: &mut Request) -> Uri {
        let Some(first) = rq.headers.route().first().cloned() else {
            return rq.uri.clone();
        };
        let hop = first.uri;
        let ours = hop.host_unbracketed() == self.inner.hostname;
        if !ours && hop.params.contains("lr") {
            return hop;
        }
        let mut route = rq.headers.route().to_vec();
        route.remove(0);
        if !ours {
            route.push(NameAddr::new(rq.uri.clone()));
            rq.uri = hop.clone();
        }
        if route.is_empty() {
            rq.headers.remove("route");
        } else {
            rq.headers.insert("route", HeaderValue::AddressList(route));
        }
        hop
    }

    async fn send_ack(&self, mut rq: Request, addresses: Vec<SipAddr>) -> Result<()> {
        // our own hop, above any Via a proxied ACK carries
        let mut via = Via::placeholder();
        via.set_branch(generate_branch());
        rq.headers.via_mut().insert(0, via);
        let Some(address) = addresses.first() else {
            error!("ACK: couldn't resolve {}", rq.uri);
            return Err(Error::EndpointError(format!("cannot resolve {}", rq.uri)));
        };
        let connection = self.inner.transport_layer.open(address, None).await?;
        connection.send(rq.into()).await
    }

    /// URI pointing back at us through `flow`, which must carry its local
    /// socket.
    pub fn encode_flow_uri(&self, flow: &SipAddr) -> Option<Uri> {
        let token = encode_flow_token(flow, &self.inner.flow_secret)?;
        let scheme = if flow.protocol == Protocol::Tls {
            "sips"
        } else {
            "sip"
        };
        Some(Uri::new(scheme, self.inner.hostname.clone()).with_user(token))
    }

    /// The flow a URI produced by [`Endpoint::encode_flow_uri`] names.
    pub fn decode_flow_uri(&self, uri: &Uri) -> Option<SipAddr> {
        if uri.host_unbracketed() != self.inner.hostname {
            return None;
        }
        decode_flow_token(uri.user.as_deref()?, &self.inner.flow_secret)
    }

    pub fn is_flow_uri(&self, uri: &Uri) -> bool {
        self.decode_flow_uri(uri).is_some()
    }
}
