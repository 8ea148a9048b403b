use super::{make_response, TransactionLayer};
use crate::{
    message::{Message, Request, Response},
    transport::{
        channel::{ChannelConnection, ChannelIncoming, ChannelOutgoing},
        Flow, Protocol, SipAddr, TransportLayer, ViaStamp,
    },
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod test_client;
mod test_sequential_search;

pub(crate) fn request(method: &str) -> Request {
    let raw = format!(
        "{method} sip:bob@biloxi.example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.example.com>\r\n\
From: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n\
CSeq: 314159 {method}\r\n\r\n"
    );
    match Message::try_from(raw.as_str()) {
        Ok(Message::Request(rq)) => rq,
        other => panic!("bad test request {:?}", other),
    }
}

pub(crate) fn response(method: &str, status: u16) -> Response {
    make_response(&request(method), status, None)
}

pub(crate) struct TestHarness {
    pub transport: TransportLayer,
    pub transactions: TransactionLayer,
    pub target: SipAddr,
    pub channel: ChannelConnection,
    pub flow: Arc<Flow>,
    pub outgoing: ChannelOutgoing,
    _incoming: ChannelIncoming,
}

impl TestHarness {
    /// Transport with one in-memory flow to `10.0.0.2:5060` and a running
    /// timer loop.
    pub fn new(protocol: Protocol) -> Self {
        let transport = TransportLayer::new(CancellationToken::new());
        transport.set_via_stamp(ViaStamp {
            host: "10.0.0.1".to_string(),
            ..Default::default()
        });
        let target = SipAddr::new(protocol, "10.0.0.2", 5060);
        let (channel, incoming, outgoing) =
            ChannelConnection::create_connection(SipAddr::new(protocol, "10.0.0.1", 5060));
        let flow = transport.add_connection(channel.clone().into(), target.clone());

        let transactions = TransactionLayer::default();
        let timer_loop = transactions.clone();
        tokio::spawn(async move { timer_loop.process_timer().await });

        TestHarness {
            transport,
            transactions,
            target,
            channel,
            flow,
            outgoing,
            _incoming: incoming,
        }
    }

    pub async fn next_sent(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(1), self.outgoing.recv())
            .await
            .ok()
            .flatten()
            .map(|(msg, _)| msg)
            .expect("message sent")
    }

    pub fn drain_sent(&mut self) -> Vec<Message> {
        let mut sent = vec![];
        while let Ok((msg, _)) = self.outgoing.try_recv() {
            sent.push(msg);
        }
        sent
    }

    /// Delivers `rs` the way the endpoint does: through the registry.
    pub fn receive_response(&self, rs: Response) {
        let msg: Message = rs.into();
        self.transactions
            .get_client(&msg)
            .expect("client transaction")
            .message(msg, true)
            .expect("transaction alive");
    }
}

#[test]
fn test_generate_branch() {
    let branch = super::generate_branch();
    assert!(branch.starts_with("z9hG4bK"));
    assert_eq!(branch.len(), 7 + super::BRANCH_LEN);
    assert_ne!(branch, super::generate_branch());
    assert_eq!(super::generate_tag().len(), super::TAG_LEN);
}
