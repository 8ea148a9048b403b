use super::{
    client_invite::ClientInvite,
    client_non_invite::ClientNonInvite,
    generate_branch,
    key::TransactionId,
    server_invite::ServerInvite,
    server_non_invite::ServerNonInvite,
    timer::Timer,
    transaction::{TimerFire, Transaction, TransactionKind, TransactionRunner},
    ResponseSender, TimerTable,
};
use crate::{
    message::{Message, Method, Request, Via},
    transport::ConnectionRef,
    Error, Result,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

/// Granularity of the timer loop.
pub const TIMER_INTERVAL: Duration = Duration::from_millis(20);

type TransactionMap = Mutex<HashMap<TransactionId, Transaction>>;

pub struct TransactionLayerInner {
    timers: Arc<Timer<TimerFire>>,
    timer_table: TimerTable,
    max_forwards: u32,
    next_serial: AtomicU64,
    server_transactions: TransactionMap,
    client_transactions: TransactionMap,
}

impl TransactionLayerInner {
    fn map(&self, client: bool) -> &TransactionMap {
        if client {
            &self.client_transactions
        } else {
            &self.server_transactions
        }
    }

    fn register(&self, transaction: &Transaction) {
        let replaced = self
            .map(transaction.kind.is_client())
            .lock()
            .ok()
            .and_then(|mut map| map.insert(transaction.id.clone(), transaction.clone()));
        if let Some(replaced) = replaced {
            debug!(id = %replaced.id, "replacing live transaction");
            replaced.shutdown();
        }
    }

    fn unregister(&self, id: &TransactionId, client: bool, serial: u64) {
        if let Ok(mut map) = self.map(client).lock() {
            if map.get(id).is_some_and(|t| t.serial == serial) {
                map.remove(id);
            }
        }
    }
}

/// Registry of live transactions, one map per direction keyed by
/// [`TransactionId`]. Each transaction runs on its own task; the registry
/// entry and the connection reference are released when it terminates.
#[derive(Clone)]
pub struct TransactionLayer {
    inner: Arc<TransactionLayerInner>,
}

impl Default for TransactionLayer {
    fn default() -> Self {
        Self::new(TimerTable::default(), 70)
    }
}

impl TransactionLayer {
    pub fn new(timer_table: TimerTable, max_forwards: u32) -> Self {
        TransactionLayer {
            inner: Arc::new(TransactionLayerInner {
                timers: Arc::new(Timer::new()),
                timer_table,
                max_forwards,
                next_serial: AtomicU64::new(1),
                server_transactions: Mutex::new(HashMap::new()),
                client_transactions: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn runner(
        &self,
        id: TransactionId,
        client: bool,
        serial: u64,
        connection: ConnectionRef,
        tu: Option<ResponseSender>,
    ) -> TransactionRunner {
        let registry: Weak<TransactionLayerInner> = Arc::downgrade(&self.inner);
        let cleanup_id = id.clone();
        TransactionRunner {
            id,
            connection,
            tu,
            timers: self.inner.timers.clone(),
            cleanup: Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.unregister(&cleanup_id, client, serial);
                }
            }),
        }
    }

    /// Starts the server transaction for a new inbound request. Responses
    /// go out through `connection`, released when the transaction ends.
    pub fn create_server_transaction(
        &self,
        rq: &Request,
        connection: ConnectionRef,
    ) -> Result<Transaction> {
        let id = TransactionId::try_from(&Message::Request(rq.clone()))?;
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let runner = self.runner(id, false, serial, connection, None);
        let timers = self.inner.timer_table;
        let register = |t: &Transaction| self.inner.register(t);
        let transaction = if rq.method == Method::Invite {
            runner.spawn(TransactionKind::ServerInvite, serial, ServerInvite::new(timers), register)
        } else {
            let machine = ServerNonInvite::new(timers);
            runner.spawn(TransactionKind::ServerNonInvite, serial, machine, register)
        };
        info!(id = %transaction.id, "server transaction created");
        Ok(transaction)
    }

    /// Starts a client transaction sending `rq` over `connection`.
    ///
    /// The top Via gets a fresh branch, except for CANCEL which must reuse
    /// the branch of the request it cancels. Retransmission timers only run
    /// over UDP. Responses are delivered on `tu`.
    pub fn create_client_transaction(
        &self,
        connection: ConnectionRef,
        mut rq: Request,
        tu: ResponseSender,
    ) -> Result<Transaction> {
        if rq.method != Method::Cancel {
            let vias = rq.headers.via_mut();
            if vias.is_empty() {
                vias.push(Via::placeholder());
            }
            vias[0].set_branch(generate_branch());
        }
        if rq.headers.cseq().is_none() {
            return Err(Error::TransactionError(
                "cseq missing".to_string(),
                TransactionId::invalid(),
            ));
        }

        let id = TransactionId::try_from(&Message::Request(rq.clone()))?;
        let reliable = connection.is_reliable();
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let runner = self.runner(id, true, serial, connection, Some(tu));
        let timers = self.inner.timer_table;
        let register = |t: &Transaction| self.inner.register(t);
        let transaction = if rq.method == Method::Invite {
            let machine = ClientInvite::new(rq, reliable, timers, self.inner.max_forwards);
            runner.spawn(TransactionKind::ClientInvite, serial, machine, register)
        } else {
            let machine = ClientNonInvite::new(rq, reliable, timers);
            runner.spawn(TransactionKind::ClientNonInvite, serial, machine, register)
        };
        info!(id = %transaction.id, reliable, "client transaction created");
        Ok(transaction)
    }

    fn lookup(&self, msg: &Message, client: bool) -> Option<Transaction> {
        let id = TransactionId::try_from(msg).ok()?;
        self.inner.map(client).lock().ok()?.get(&id).cloned()
    }

    /// Live server transaction matching an inbound request or ACK.
    pub fn get_server(&self, msg: &Message) -> Option<Transaction> {
        self.lookup(msg, false)
    }

    /// Live client transaction matching an inbound response.
    pub fn get_client(&self, msg: &Message) -> Option<Transaction> {
        self.lookup(msg, true)
    }

    pub fn len(&self) -> usize {
        [true, false]
            .iter()
            .filter_map(|client| self.inner.map(*client).lock().ok().map(|m| m.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires due transaction timers until the future is dropped.
    pub async fn process_timer(&self) {
        loop {
            for fire in self.inner.timers.poll(Instant::now()) {
                fire.fire();
            }
            tokio::time::sleep(TIMER_INTERVAL).await;
        }
    }

    /// Shuts down every live transaction.
    pub fn destroy(&self) {
        for client in [true, false] {
            let live: Vec<Transaction> = self
                .inner
                .map(client)
                .lock()
                .map(|map| map.values().cloned().collect())
                .unwrap_or_default();
            for transaction in live {
                transaction.shutdown();
            }
        }
        self.inner.timers.clear();
    }
}
