use super::{make_response, ResponseSender, TransactionLayer};
use crate::{
    message::{Method, Request, Via},
    transport::{SipAddr, TransportLayer},
};
use std::collections::VecDeque;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

/// Forwards `rq` to each of `addresses` in turn until one gives an answer
/// other than 503.
///
/// Every attempt runs its own client transaction on a fresh branch: an
/// empty Via is pushed once and re-branched per attempt. CANCEL keeps the
/// Via it was built with. Failing to open a connection counts as a 503,
/// or as 430 Flow Failed when the target was a flow. A send error on an
/// open connection is fed into the running transaction as a 503.
///
/// The first response above 100 commits to the current attempt and every
/// later response of it reaches `tu` unfiltered. When the list runs out
/// `tu` gets the last status seen, or 404 when nothing answered.
pub async fn sequential_search(
    transactions: &TransactionLayer,
    transport: &TransportLayer,
    addresses: Vec<SipAddr>,
    mut rq: Request,
    tu: ResponseSender,
) {
    if rq.method != Method::Cancel {
        rq.headers.via_mut().insert(0, Via::placeholder());
    }

    let mut addresses: VecDeque<SipAddr> = addresses.into();
    let mut last_status = None;

    while let Some(address) = addresses.pop_front() {
        let (rs_tx, mut rs_rx) = unbounded_channel();
        let (err_tx, mut err_rx) = unbounded_channel::<String>();

        let attempt = match transport.open(&address, Some(err_tx)).await {
            Ok(connection) => {
                transactions.create_client_transaction(connection, rq.clone(), rs_tx)
            }
            Err(e) => Err(e),
        };
        let transaction = match attempt {
            Ok(transaction) => transaction,
            Err(e) => {
                let status = if address.is_flow() { 430 } else { 503 };
                warn!(%address, status, "cannot reach hop: {}", e);
                last_status = Some(status);
                if status == 503 {
                    continue;
                }
                tu.send(make_response(&rq, status, None)).ok();
                return;
            }
        };
        debug!(id = %transaction.id, %address, "attempt started");

        let unavailable = make_response(&rq, 503, None);
        let attempt_transaction = transaction.clone();
        tokio::spawn(async move {
            // ends once the transaction releases its connection
            while let Some(reason) = err_rx.recv().await {
                info!(id = %attempt_transaction.id, "connection error: {}", reason);
                attempt_transaction
                    .message(unavailable.clone().into(), false)
                    .ok();
            }
        });

        let mut committed = false;
        let mut search_next = false;
        while let Some(rs) = rs_rx.recv().await {
            if !committed {
                last_status = Some(rs.status);
                if rs.status == 503 {
                    search_next = true;
                    break;
                }
                committed = rs.status > 100;
            }
            tu.send(rs).ok();
        }
        if !search_next {
            return;
        }
        debug!(id = %transaction.id, "503, trying next hop");
    }

    let status = last_status.unwrap_or(404);
    info!(status, "no more hops for {} {}", rq.method, rq.uri);
    tu.send(make_response(&rq, status, None)).ok();
}
