use super::{request, TestHarness};
use crate::{
    message::{Message, Method},
    transaction::make_response,
    transport::Protocol,
    Result,
};
use std::time::Duration;
use tokio::{sync::mpsc::unbounded_channel, time::timeout};

#[tokio::test(start_paused = true)]
async fn test_non_invite_times_out_over_udp() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Udp);
    let conn = h.transport.open(&h.target, None).await?;
    let (tu, mut responses) = unbounded_channel();
    let tx = h
        .transactions
        .create_client_transaction(conn, request("OPTIONS"), tu)?;

    // nothing reaches the user before timer F
    assert!(timeout(Duration::from_millis(31_900), responses.recv())
        .await
        .is_err());
    let rs = responses.recv().await.expect("timeout response");
    assert_eq!(rs.status, 408);
    assert!(responses.recv().await.is_none());
    assert!(tx.is_terminated());

    // sent at 0, 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5 seconds
    let sent = h.drain_sent();
    assert_eq!(sent.len(), 7);
    assert!(sent.iter().all(|m| m.method() == Some(&Method::Options)));
    assert!(h.transactions.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_non_invite_over_tcp_does_not_retransmit() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Tcp);
    let conn = h.transport.open(&h.target, None).await?;
    let (tu, mut responses) = unbounded_channel();
    h.transactions
        .create_client_transaction(conn, request("REGISTER"), tu)?;

    let sent = match h.next_sent().await {
        Message::Request(rq) => rq,
        other => panic!("unexpected {:?}", other),
    };
    let via = sent.headers.top_via().expect("via");
    assert_eq!(via.protocol, "TCP");
    assert_ne!(via.branch(), Some("z9hG4bK776asdhds"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.drain_sent().is_empty());

    h.receive_response(make_response(&sent, 100, None));
    h.receive_response(make_response(&sent, 200, None));
    // retransmission of the final response is absorbed
    h.receive_response(make_response(&sent, 200, None));
    let statuses: Vec<u16> = [
        responses.recv().await.expect("100"),
        responses.recv().await.expect("200"),
    ]
    .iter()
    .map(|rs| rs.status)
    .collect();
    assert_eq!(statuses, vec![100, 200]);
    assert!(responses.recv().await.is_none());
    assert!(h.transactions.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invite_busy_is_acknowledged_once() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Udp);
    let conn = h.transport.open(&h.target, None).await?;
    let (tu, mut responses) = unbounded_channel();
    h.transactions
        .create_client_transaction(conn, request("INVITE"), tu)?;

    let invite = match h.next_sent().await {
        Message::Request(rq) => rq,
        other => panic!("unexpected {:?}", other),
    };
    h.receive_response(make_response(&invite, 486, None));

    let rs = responses.recv().await.expect("486");
    assert_eq!(rs.status, 486);
    // transaction ends after timer D; nothing else reaches the user
    assert!(responses.recv().await.is_none());

    let acks: Vec<Message> = h.drain_sent();
    assert_eq!(acks.len(), 1);
    let ack = match &acks[0] {
        Message::Request(rq) => rq,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(
        ack.headers.top_via().and_then(|v| v.branch()),
        invite.headers.top_via().and_then(|v| v.branch())
    );
    assert_eq!(ack.headers.cseq().map(|c| c.seq), Some(314159));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invite_timer_b() -> Result<()> {
    let mut h = TestHarness::new(Protocol::Udp);
    let conn = h.transport.open(&h.target, None).await?;
    let (tu, mut responses) = unbounded_channel();
    h.transactions
        .create_client_transaction(conn, request("INVITE"), tu)?;

    let rs = responses.recv().await.expect("timeout response");
    assert_eq!(rs.status, 408);
    assert_eq!(h.drain_sent().len(), 7);
    // no ACK for a synthesized timeout
    assert!(responses.recv().await.is_none());
    assert!(h.drain_sent().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_connection() -> Result<()> {
    let h = TestHarness::new(Protocol::Tcp);
    let conn = h.transport.open(&h.target, None).await?;
    let (tu, mut responses) = unbounded_channel();
    let tx = h
        .transactions
        .create_client_transaction(conn, request("INVITE"), tu)?;
    assert_eq!(h.transactions.len(), 1);
    assert_eq!(h.flow.refs(), 1);

    tx.shutdown();
    tx.terminated().await;
    assert!(responses.recv().await.is_none());
    assert!(h.transactions.is_empty());
    assert_eq!(h.flow.refs(), 0);
    assert!(tx.message(make_response(&request("INVITE"), 200, None).into(), true).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_response_finds_its_transaction() -> Result<()> {
    const COUNT: usize = 500;
    let h = TestHarness::new(Protocol::Tcp);
    let mut outgoing = h.outgoing;
    let lookup = h.transactions.clone();
    // answers each request the moment it leaves, from another worker
    let responder = tokio::spawn(async move {
        let mut misses = 0;
        for _ in 0..COUNT {
            let Some((Message::Request(rq), _)) = outgoing.recv().await else {
                break;
            };
            let rs: Message = make_response(&rq, 200, None).into();
            match lookup.get_client(&rs) {
                Some(tx) => {
                    tx.message(rs, true).ok();
                }
                None => misses += 1,
            }
        }
        misses
    });

    let mut pending = vec![];
    for _ in 0..COUNT {
        let conn = h.transport.open(&h.target, None).await?;
        let (tu, responses) = unbounded_channel();
        h.transactions
            .create_client_transaction(conn, request("OPTIONS"), tu)?;
        pending.push(responses);
    }
    assert_eq!(responder.await.expect("responder"), 0);
    for mut responses in pending {
        let rs = timeout(Duration::from_secs(5), responses.recv())
            .await
            .ok()
            .flatten()
            .expect("final response");
        assert_eq!(rs.status, 200);
    }
    Ok(())
}
