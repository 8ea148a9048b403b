//! Stateless proxy with CANCEL propagation across forwarded branches.
use crate::{
    endpoint::{Endpoint, RequestHandler},
    message::{Message, Method, NameAddr, Request, Response},
    transaction::{make_cancel, make_response, ResponseSender},
    transport::SipAddr,
    Error, Result,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

/// Decides where an inbound request goes, typically by calling
/// [`Proxy::send`] one or more times.
#[async_trait]
pub trait ProxyRouter: Send + Sync {
    async fn route(
        &self,
        proxy: &Proxy,
        endpoint: &Endpoint,
        rq: Request,
        remote: SipAddr,
    ) -> Result<()>;
}

/// Top Via branch, protocol, host and port, Call-ID and CSeq number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId {
    branch: String,
    protocol: String,
    host: String,
    port: Option<u16>,
    call_id: String,
    seq: u32,
}

impl TryFrom<&Message> for ContextId {
    type Error = Error;

    fn try_from(msg: &Message) -> Result<Self> {
        let headers = msg.headers();
        let (Some(via), Some(call_id), Some(cseq)) =
            (headers.top_via(), headers.call_id(), headers.cseq())
        else {
            return Err(Error::ProxyError("message without via, call-id or cseq".to_string()));
        };
        Ok(ContextId {
            branch: via.branch().unwrap_or_default().to_string(),
            protocol: via.protocol.to_ascii_uppercase(),
            host: via.host.clone(),
            port: via.port,
            call_id: call_id.to_string(),
            seq: cseq.seq,
        })
    }
}

#[derive(Default)]
struct ProxyContext {
    // prepared CANCEL per pending fork, keyed by the fork's branch
    cancellers: HashMap<String, Request>,
    cancelled: bool,
}

struct ProxyInner {
    contexts: Mutex<HashMap<ContextId, ProxyContext>>,
    router: Arc<dyn ProxyRouter>,
}

/// Request handler that keeps one context per inbound request so a later
/// CANCEL can reach every branch it was forwarded to.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn new(router: Arc<dyn ProxyRouter>) -> Self {
        Proxy {
            inner: Arc::new(ProxyInner {
                contexts: Mutex::new(HashMap::new()),
                router,
            }),
        }
    }

    /// Number of requests still awaiting a final response.
    pub fn len(&self) -> usize {
        self.inner.contexts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_context(&self, id: &ContextId) -> bool {
        self.inner
            .contexts
            .lock()
            .map(|c| c.contains_key(id))
            .unwrap_or(false)
    }

    fn remove_context(&self, id: &ContextId) {
        if let Ok(mut contexts) = self.inner.contexts.lock() {
            contexts.remove(id);
        }
    }

    /// Forwards `msg` within its proxy context.
    ///
    /// A request's responses go to `tu`, or by default upstream with our
    /// Via removed. A final response ends the context. Messages without a
    /// context are sent as is.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        msg: Message,
        tu: Option<ResponseSender>,
    ) -> Result<()> {
        let id = ContextId::try_from(&msg)?;
        if !self.has_context(&id) {
            return endpoint.send(msg, tu).await;
        }
        match msg {
            Message::Request(rq) => self.forward_request(endpoint, id, rq, tu).await,
            Message::Response(rs) => self.forward_response(endpoint, &id, rs).await,
        }
    }

    async fn forward_request(
        &self,
        endpoint: &Endpoint,
        id: ContextId,
        rq: Request,
        tu: Option<ResponseSender>,
    ) -> Result<()> {
        let (rs_tx, mut rs_rx) = unbounded_channel();
        let route = rq.headers.route().to_vec();
        let original = rq.clone();
        let proxy = self.clone();
        let task_endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(rs) = rs_rx.recv().await {
                proxy
                    .track_fork(&task_endpoint, &id, &original, &route, &rs)
                    .await;
                match &tu {
                    Some(tu) => {
                        tu.send(rs).ok();
                    }
                    None => {
                        let mut rs = rs;
                        rs.headers.via_mut().remove(0);
                        if let Err(e) = proxy.forward_response(&task_endpoint, &id, rs).await {
                            warn!("cannot forward response upstream: {}", e);
                        }
                    }
                }
            }
        });
        endpoint.send(rq.into(), Some(rs_tx)).await
    }

    async fn forward_response(
        &self,
        endpoint: &Endpoint,
        id: &ContextId,
        rs: Response,
    ) -> Result<()> {
        if rs.status >= 200 {
            self.remove_context(id);
        }
        endpoint.send(rs.into(), None).await
    }

    /// Remembers how to cancel the fork a provisional response came from,
    /// or forgets it on its final response.
    async fn track_fork(
        &self,
        endpoint: &Endpoint,
        id: &ContextId,
        rq: &Request,
        route: &[NameAddr],
        rs: &Response,
    ) {
        let Some(via) = rs.headers.top_via() else {
            return;
        };
        let branch = via.branch().unwrap_or_default().to_string();
        let cancel_now = {
            let Ok(mut contexts) = self.inner.contexts.lock() else {
                return;
            };
            let Some(ctx) = contexts.get_mut(id) else {
                return;
            };
            if rs.status >= 200 {
                ctx.cancellers.remove(&branch);
                None
            } else if ctx.cancellers.contains_key(&branch) {
                None
            } else {
                let cancel = make_cancel(rq, via, route);
                ctx.cancellers.insert(branch.clone(), cancel.clone());
                ctx.cancelled.then_some(cancel)
            }
        };
        if let Some(cancel) = cancel_now {
            debug!(branch, "fork answered after CANCEL");
            if let Err(e) = endpoint.send(cancel.into(), None).await {
                warn!("cannot cancel fork {}: {}", branch, e);
            }
        }
    }

    async fn on_cancel(&self, endpoint: &Endpoint, rq: Request) -> Result<()> {
        let id = ContextId::try_from(&Message::Request(rq.clone()))?;
        let cancellers = self.inner.contexts.lock().ok().and_then(|mut contexts| {
            let ctx = contexts.get_mut(&id)?;
            ctx.cancelled = true;
            Some(ctx.cancellers.values().cloned().collect::<Vec<_>>())
        });

        let Some(cancellers) = cancellers else {
            debug!(call_id = %id.call_id, "CANCEL for unknown request");
            return endpoint.send(make_response(&rq, 481, None).into(), None).await;
        };
        endpoint.send(make_response(&rq, 200, None).into(), None).await?;
        info!(call_id = %id.call_id, forks = cancellers.len(), "cancelling forwarded request");
        for cancel in cancellers {
            if let Err(e) = endpoint.send(cancel.into(), None).await {
                warn!("cannot cancel fork: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for Proxy {
    async fn handle(&self, endpoint: &Endpoint, rq: Request, remote: SipAddr) -> Result<()> {
        match rq.method {
            Method::Cancel => return self.on_cancel(endpoint, rq).await,
            // ACK gets no final response that would end a context
            Method::Ack => return self.inner.router.route(self, endpoint, rq, remote).await,
            _ => {}
        }

        let id = ContextId::try_from(&Message::Request(rq.clone()))?;
        if let Ok(mut contexts) = self.inner.contexts.lock() {
            contexts.insert(id.clone(), ProxyContext::default());
        }
        let result = self.inner.router.route(self, endpoint, rq, remote).await;
        if result.is_err() {
            self.remove_context(&id);
        }
        result
    }
}
