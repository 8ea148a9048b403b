use async_trait::async_trait;
use sipstack::{
    message::{Message, Method, Request},
    proxy::{Proxy, ProxyRouter},
    transaction::{make_cancel, make_response},
    transport::{
        channel::{ChannelConnection, ChannelIncoming, ChannelOutgoing},
        Protocol, SipAddr, TransportLayer, ViaStamp,
    },
    Endpoint, EndpointBuilder, EndpointOption, Error, RequestHandler, Result,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const INVITE: &str = "INVITE sip:bob@10.0.0.3;transport=tcp SIP/2.0\r\n\
Via: SIP/2.0/TCP 10.0.0.2:5060;branch=z9hG4bKinvite1\r\n\
Max-Forwards: 70\r\n\
To: <sip:bob@10.0.0.3>\r\n\
From: <sip:alice@10.0.0.2>;tag=a1\r\n\
Call-ID: proxy-1@10.0.0.2\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@10.0.0.2;transport=tcp>\r\n\r\n";

const OPTIONS: &str = "OPTIONS sip:10.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/TCP 10.0.0.2:5060;branch=z9hG4bKoptions1\r\n\
To: <sip:10.0.0.1>\r\n\
From: <sip:alice@10.0.0.2>;tag=o1\r\n\
Call-ID: options-1@10.0.0.2\r\n\
CSeq: 7 OPTIONS\r\n\r\n";

fn request(raw: &str) -> Request {
    match Message::try_from(raw) {
        Ok(Message::Request(rq)) => rq,
        other => panic!("bad test request {:?}", other),
    }
}

struct Peer {
    addr: SipAddr,
    incoming: ChannelIncoming,
    outgoing: ChannelOutgoing,
}

impl Peer {
    fn connect(transport: &TransportLayer, host: &str) -> Self {
        let addr = SipAddr::new(Protocol::Tcp, host, 5060);
        let (channel, incoming, outgoing) =
            ChannelConnection::create_connection(SipAddr::new(Protocol::Tcp, "10.0.0.1", 5060));
        transport.add_connection(channel.into(), addr.clone());
        Peer {
            addr,
            incoming,
            outgoing,
        }
    }

    fn inject(&self, msg: impl Into<Message>) {
        self.incoming
            .send((msg.into(), self.addr.clone()))
            .expect("inject");
    }

    async fn recv(&mut self) -> Message {
        timeout(Duration::from_secs(2), self.outgoing.recv())
            .await
            .expect("nothing sent")
            .expect("channel closed")
            .0
    }

    async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Message::Request(rq) => rq,
            other => panic!("expected a request, got {}", other),
        }
    }

    async fn recv_status(&mut self) -> u16 {
        match self.recv().await {
            Message::Response(rs) => rs.status,
            other => panic!("expected a response, got {}", other),
        }
    }

    async fn is_silent(&mut self) -> bool {
        timeout(Duration::from_millis(300), self.outgoing.recv())
            .await
            .is_err()
    }
}

fn start(handler: Arc<dyn RequestHandler>) -> (Endpoint, TransportLayer) {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    let token = CancellationToken::new();
    let transport = TransportLayer::new(token.child_token());
    transport.set_via_stamp(ViaStamp {
        host: "10.0.0.1".to_string(),
        ..Default::default()
    });
    let endpoint = EndpointBuilder::new()
        .with_option(EndpointOption {
            address: "127.0.0.1".parse().expect("address"),
            public_address: Some("10.0.0.1".to_string()),
            ..Default::default()
        })
        .with_transport_layer(transport.clone())
        .with_handler(handler)
        .with_cancel_token(token)
        .build();
    let serving = endpoint.clone();
    tokio::spawn(async move { serving.serve().await });
    (endpoint, transport)
}

struct Failing;

#[async_trait]
impl RequestHandler for Failing {
    async fn handle(&self, _: &Endpoint, _: Request, _: SipAddr) -> Result<()> {
        Err(Error::Error("handler failed".to_string()))
    }
}

/// Answers 200 to everything and reports what it saw.
struct Recorder(UnboundedSender<(Method, SipAddr)>);

#[async_trait]
impl RequestHandler for Recorder {
    async fn handle(&self, endpoint: &Endpoint, rq: Request, remote: SipAddr) -> Result<()> {
        self.0.send((rq.method.clone(), remote)).ok();
        if rq.method == Method::Ack {
            return Ok(());
        }
        endpoint
            .send(make_response(&rq, 200, None).into(), None)
            .await
    }
}

struct ForwardToRequestUri;

#[async_trait]
impl ProxyRouter for ForwardToRequestUri {
    async fn route(&self, proxy: &Proxy, endpoint: &Endpoint, rq: Request, _: SipAddr) -> Result<()> {
        proxy.send(endpoint, rq.into(), None).await
    }
}

#[tokio::test]
async fn test_handler_error_answers_500() {
    let (_endpoint, transport) = start(Arc::new(Failing));
    let mut alice = Peer::connect(&transport, "10.0.0.2");

    alice.inject(request(OPTIONS));
    assert_eq!(alice.recv_status().await, 500);
    // the retransmission is answered by the transaction, not the handler
    alice.inject(request(OPTIONS));
    assert_eq!(alice.recv_status().await, 500);
}

#[tokio::test]
async fn test_requests_reach_handler_once() {
    let (tx, mut seen) = unbounded_channel();
    let (endpoint, transport) = start(Arc::new(Recorder(tx)));
    let mut alice = Peer::connect(&transport, "10.0.0.2");

    alice.inject(request(OPTIONS));
    assert_eq!(alice.recv_status().await, 200);
    alice.inject(request(OPTIONS));
    assert_eq!(alice.recv_status().await, 200);

    let (method, remote) = seen.recv().await.expect("handled");
    assert_eq!(method, Method::Options);
    assert_eq!(remote, alice.addr);
    assert!(seen.try_recv().is_err());
    assert_eq!(endpoint.transaction_layer().len(), 1);

    // an ACK for a 2xx has its own branch and goes to the handler
    let mut ack = request(INVITE);
    ack.method = Method::Ack;
    ack.headers.via_mut()[0].set_branch("z9hG4bKack2xx");
    alice.inject(ack);
    let (method, _) = seen.recv().await.expect("ack handled");
    assert_eq!(method, Method::Ack);
    assert!(alice.is_silent().await);
}

#[tokio::test]
async fn test_serve_and_shutdown() {
    let endpoint = EndpointBuilder::new()
        .with_option(EndpointOption {
            address: "127.0.0.1".parse().expect("address"),
            ..Default::default()
        })
        .build();
    assert_eq!(endpoint.hostname(), "127.0.0.1");

    let serving = endpoint.clone();
    let handle = tokio::spawn(async move { serving.serve().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    endpoint.shutdown();
    let served = timeout(Duration::from_secs(1), handle)
        .await
        .expect("serve returns")
        .expect("join");
    assert!(served.is_ok());
    // the transport events were consumed by the first run
    assert!(endpoint.serve().await.is_err());
}

#[tokio::test]
async fn test_flow_uri() {
    let (endpoint, transport) = start(Arc::new(Failing));
    let mut alice = Peer::connect(&transport, "10.0.0.2");
    let flow = alice
        .addr
        .clone()
        .with_local("10.0.0.1:5060".parse().expect("local"));

    let uri = endpoint.encode_flow_uri(&flow).expect("flow uri");
    assert_eq!(uri.host, "10.0.0.1");
    assert_eq!(uri.scheme, "sip");
    assert!(endpoint.is_flow_uri(&uri));
    assert_eq!(endpoint.decode_flow_uri(&uri), Some(flow.clone()));

    let mut elsewhere = uri.clone();
    elsewhere.host = "10.9.9.9".to_string();
    assert!(!endpoint.is_flow_uri(&elsewhere));
    assert!(endpoint.encode_flow_uri(&alice.addr).is_none());

    // requests to the flow uri go back over the flow
    let mut rq = request(OPTIONS);
    rq.uri = uri;
    rq.headers.via_mut().clear();
    endpoint.send(rq.into(), None).await.expect("send");
    let sent = alice.recv_request().await;
    assert_eq!(sent.method, Method::Options);
    let via = sent.headers.top_via().expect("via");
    assert_eq!(via.host, "10.0.0.1");
    assert!(via.branch().is_some_and(|b| b.starts_with("z9hG4bK")));
    assert!(sent.headers.contains("user-agent"));
}

#[tokio::test]
async fn test_unknown_flow_gives_404() {
    let (endpoint, _transport) = start(Arc::new(Failing));
    let (tu, mut responses) = unbounded_channel();
    let mut rq = request(OPTIONS);
    rq.uri = "sip:nobody@10.0.0.1".parse().expect("uri");
    endpoint.send(rq.into(), Some(tu)).await.expect("send");
    let rs = responses.recv().await.expect("response");
    assert_eq!(rs.status, 404);
}

#[tokio::test]
async fn test_strict_route_rewrites_request_uri() {
    let (endpoint, transport) = start(Arc::new(Failing));
    let mut bob = Peer::connect(&transport, "10.0.0.3");

    let mut rq = request(OPTIONS);
    rq.uri = "sip:bob@biloxi.example.com".parse().expect("uri");
    rq.headers.insert(
        "route",
        sipstack::message::HeaderValue::AddressList(vec![
            "sip:10.0.0.3;transport=tcp"
                .parse::<sipstack::message::Uri>()
                .expect("route")
                .into(),
        ]),
    );
    endpoint.send(rq.into(), None).await.expect("send");

    let sent = bob.recv_request().await;
    assert_eq!(sent.uri.host, "10.0.0.3");
    let route = sent.headers.route();
    assert_eq!(route.len(), 1);
    assert_eq!(route[0].uri.host, "biloxi.example.com");
}

#[tokio::test]
async fn test_proxy_cancel_after_final_gives_481() {
    let (_endpoint, transport) = start(Arc::new(Proxy::new(Arc::new(ForwardToRequestUri))));
    let mut alice = Peer::connect(&transport, "10.0.0.2");
    let mut bob = Peer::connect(&transport, "10.0.0.3");

    let invite = request(INVITE);
    alice.inject(invite.clone());
    let forwarded = bob.recv_request().await;
    assert_eq!(forwarded.method, Method::Invite);
    assert_eq!(forwarded.headers.via().len(), 2);

    bob.inject(make_response(&forwarded, 200, None));
    assert_eq!(alice.recv_status().await, 200);

    let via = invite.headers.top_via().expect("via").clone();
    alice.inject(make_cancel(&invite, &via, &[]));
    assert_eq!(alice.recv_status().await, 481);
    assert!(bob.is_silent().await);
}

#[tokio::test]
async fn test_proxy_cancel_reaches_pending_fork() {
    let proxy = Proxy::new(Arc::new(ForwardToRequestUri));
    let (_endpoint, transport) = start(Arc::new(proxy.clone()));
    let mut alice = Peer::connect(&transport, "10.0.0.2");
    let mut bob = Peer::connect(&transport, "10.0.0.3");

    let invite = request(INVITE);
    alice.inject(invite.clone());
    let forwarded = bob.recv_request().await;
    bob.inject(make_response(&forwarded, 180, None));
    assert_eq!(alice.recv_status().await, 180);
    assert_eq!(proxy.len(), 1);

    let via = invite.headers.top_via().expect("via").clone();
    alice.inject(make_cancel(&invite, &via, &[]));
    match alice.recv().await {
        Message::Response(rs) => {
            assert_eq!(rs.status, 200);
            assert_eq!(rs.headers.cseq().expect("cseq").method, Method::Cancel);
        }
        other => panic!("unexpected {}", other),
    }

    let cancel = bob.recv_request().await;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.headers.via().len(), 1);
    assert_eq!(
        cancel.headers.top_via().and_then(|v| v.branch()),
        forwarded.headers.top_via().and_then(|v| v.branch())
    );
    assert_eq!(cancel.headers.cseq().expect("cseq").seq, 1);

    // the fork's final response ends the context
    bob.inject(make_response(&forwarded, 487, None));
    assert_eq!(alice.recv_status().await, 487);
    assert!(proxy.is_empty());
}

#[tokio::test]
async fn test_proxy_cancel_before_provisional_fires_on_first_provisional() {
    let proxy = Proxy::new(Arc::new(ForwardToRequestUri));
    let (_endpoint, transport) = start(Arc::new(proxy.clone()));
    let mut alice = Peer::connect(&transport, "10.0.0.2");
    let mut bob = Peer::connect(&transport, "10.0.0.3");

    let invite = request(INVITE);
    alice.inject(invite.clone());
    let forwarded = bob.recv_request().await;

    let via = invite.headers.top_via().expect("via").clone();
    alice.inject(make_cancel(&invite, &via, &[]));
    assert_eq!(alice.recv_status().await, 200);
    // nothing to cancel until the fork answers
    assert!(bob.is_silent().await);

    bob.inject(make_response(&forwarded, 180, None));
    let cancel = bob.recv_request().await;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(
        cancel.headers.top_via().and_then(|v| v.branch()),
        forwarded.headers.top_via().and_then(|v| v.branch())
    );
    assert_eq!(alice.recv_status().await, 180);

    // a second provisional does not cancel again
    bob.inject(make_response(&forwarded, 183, None));
    assert_eq!(alice.recv_status().await, 183);
    assert!(bob.is_silent().await);

    bob.inject(make_response(&forwarded, 487, None));
    assert_eq!(alice.recv_status().await, 487);
    assert!(proxy.is_empty());
}

#[tokio::test]
async fn test_proxied_ack_keeps_upstream_via() {
    let proxy = Proxy::new(Arc::new(ForwardToRequestUri));
    let (_endpoint, transport) = start(Arc::new(proxy.clone()));
    let alice = Peer::connect(&transport, "10.0.0.2");
    let mut bob = Peer::connect(&transport, "10.0.0.3");

    let raw = INVITE
        .replace("INVITE sip:", "ACK sip:")
        .replace("1 INVITE", "1 ACK")
        .replace("z9hG4bKinvite1", "z9hG4bKack1");
    alice.inject(request(&raw));

    let ack = bob.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    let vias = ack.headers.via();
    assert_eq!(vias.len(), 2);
    assert_eq!(vias[0].host, "10.0.0.1");
    assert_ne!(vias[0].branch(), Some("z9hG4bKack1"));
    assert_eq!(vias[1].host, "10.0.0.2");
    assert_eq!(vias[1].branch(), Some("z9hG4bKack1"));
    // ACK never opens a proxy context
    assert!(proxy.is_empty());
}
