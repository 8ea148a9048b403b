use super::{request, TestHarness};
use crate::{
    message::{Message, Method, Response},
    transaction::{make_response, sequential_search, ResponseReceiver},
    transport::{Protocol, SipAddr},
    Result,
};
use tokio::sync::mpsc::unbounded_channel;

async fn collect(mut responses: ResponseReceiver) -> Vec<Response> {
    let mut all = vec![];
    while let Some(rs) = responses.recv().await {
        all.push(rs);
    }
    all
}

fn start_search(h: &TestHarness, addresses: Vec<SipAddr>, method: &str) -> ResponseReceiver {
    let (tu, responses) = unbounded_channel();
    let transactions = h.transactions.clone();
    let transport = h.transport.clone();
    let rq = request(method);
    tokio::spawn(async move {
        sequential_search(&transactions, &transport, addresses, rq, tu).await;
    });
    responses
}

#[tokio::test(start_paused = true)]
async fn test_failover_to_second_address() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Tcp);
    // no UDP socket: opening the first hop fails
    let unreachable = SipAddr::new(Protocol::Udp, "10.0.0.9", 5060);
    let responses = start_search(&h, vec![unreachable, h.target.clone()], "OPTIONS");

    let forwarded = match h.next_sent().await {
        Message::Request(rq) => rq,
        other => panic!("unexpected {:?}", other),
    };
    // our Via on top of the original one
    assert_eq!(forwarded.headers.via().len(), 2);
    assert_eq!(forwarded.headers.via()[1].host, "pc33.atlanta.example.com");
    h.receive_response(make_response(&forwarded, 200, None));

    let statuses: Vec<u16> = collect(responses).await.iter().map(|rs| rs.status).collect();
    assert_eq!(statuses, vec![200]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_send_error_fails_over() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Tcp);
    let (broken, _incoming, _outgoing) = crate::transport::channel::ChannelConnection::create_connection(
        SipAddr::new(Protocol::Tcp, "10.0.0.1", 5060),
    );
    broken.set_broken(true);
    let broken_target = SipAddr::new(Protocol::Tcp, "10.0.0.3", 5060);
    h.transport.add_connection(broken.into(), broken_target.clone());

    let responses = start_search(&h, vec![broken_target, h.target.clone()], "OPTIONS");
    let forwarded = match h.next_sent().await {
        Message::Request(rq) => rq,
        other => panic!("unexpected {:?}", other),
    };
    h.receive_response(make_response(&forwarded, 180, None));
    h.receive_response(make_response(&forwarded, 200, None));

    let statuses: Vec<u16> = collect(responses).await.iter().map(|rs| rs.status).collect();
    assert_eq!(statuses, vec![180, 200]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_committed_attempt_passes_everything() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Tcp);
    let other = SipAddr::new(Protocol::Udp, "10.0.0.9", 5060);
    let responses = start_search(&h, vec![h.target.clone(), other], "INVITE");

    let forwarded = match h.next_sent().await {
        Message::Request(rq) => rq,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(forwarded.method, Method::Invite);
    h.receive_response(make_response(&forwarded, 180, None));
    // committed: a later 503 is passed on instead of searching further
    h.receive_response(make_response(&forwarded, 503, None));

    let statuses: Vec<u16> = collect(responses).await.iter().map(|rs| rs.status).collect();
    assert_eq!(statuses, vec![180, 503]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_search() -> Result<()> {
    let h = TestHarness::new(Protocol::Tcp);
    let statuses: Vec<u16> = collect(start_search(&h, vec![], "OPTIONS"))
        .await
        .iter()
        .map(|rs| rs.status)
        .collect();
    assert_eq!(statuses, vec![404]);

    let unreachable = SipAddr::new(Protocol::Udp, "10.0.0.9", 5060);
    let statuses: Vec<u16> = collect(start_search(&h, vec![unreachable], "OPTIONS"))
        .await
        .iter()
        .map(|rs| rs.status)
        .collect();
    assert_eq!(statuses, vec![503]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lost_flow_is_430() -> Result<()> {
    let h = TestHarness::new(Protocol::Tcp);
    let gone = SipAddr::new(Protocol::Tcp, "203.0.113.5", 40000).with_local("10.0.0.1:5060".parse()?);
    let statuses: Vec<u16> = collect(start_search(&h, vec![gone, h.target.clone()], "OPTIONS"))
        .await
        .iter()
        .map(|rs| rs.status)
        .collect();
    assert_eq!(statuses, vec![430]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_its_via() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Tcp);
    let _responses = start_search(&h, vec![h.target.clone()], "CANCEL");
    match h.next_sent().await {
        Message::Request(rq) => {
            assert_eq!(rq.headers.via().len(), 1);
            assert_eq!(
                rq.headers.top_via().and_then(|v| v.branch()),
                Some("z9hG4bK776asdhds")
            );
        }
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}
