use super::{key::TransactionId, timer::Timer, ResponseSender};
use crate::{
    message::{Message, Response},
    transport::ConnectionRef,
    Error, Result,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionKind::ClientInvite | TransactionKind::ClientNonInvite
        )
    }

    pub fn is_invite(&self) -> bool {
        matches!(
            self,
            TransactionKind::ClientInvite | TransactionKind::ServerInvite
        )
    }
}

/// RFC 3261 timers. Retransmit timers carry their current interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimer {
    TimerA(Duration), // INVITE request retransmit, doubling from T1
    TimerB,           // INVITE request give-up, 64*T1
    TimerD,           // ACK retransmit window after a non-2xx
    TimerE(Duration), // request retransmit, doubling from T1
    TimerF,           // request give-up, 64*T1
    TimerG(Duration), // final response retransmit, doubling from T1
    TimerH,           // wait for ACK, 64*T1
    TimerI,           // absorb ACK retransmissions, T4
    TimerJ,           // absorb request retransmissions, 64*T1
    TimerK,           // absorb response retransmissions, T4
    TimerL,           // absorb INVITE retransmissions after a 2xx, 64*T1
    TimerM,           // accept forked 2xx responses, 64*T1
}

impl fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionTimer::TimerA(d) => write!(f, "TimerA({:?})", d),
            TransactionTimer::TimerE(d) => write!(f, "TimerE({:?})", d),
            TransactionTimer::TimerG(d) => write!(f, "TimerG({:?})", d),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug)]
pub(crate) enum TransactionSignal {
    /// Inbound message for this transaction. The flag is false for
    /// responses synthesized locally, e.g. on a connection error.
    Message(Message, bool),
    Send(Response),
    Timer(TransactionTimer, u64),
    Shutdown,
}

/// What a state machine asks its runner to do, in order.
#[derive(Debug, PartialEq)]
pub(crate) enum TransactionAction {
    Transmit(Message),
    Deliver(Response),
    Schedule(TransactionTimer, Duration),
    Terminate,
}

/// State plus a generation counter. A timer only fires if the generation
/// it was armed in is still current.
#[derive(Debug)]
pub(crate) struct Phase {
    state: TransactionState,
    epoch: u64,
}

impl Phase {
    pub fn new(state: TransactionState) -> Self {
        Phase { state, epoch: 0 }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Moves to `state`, invalidating every timer armed so far.
    pub fn enter(&mut self, state: TransactionState) {
        self.state = state;
        self.epoch += 1;
    }

    /// Moves to `state` keeping the armed timers alive.
    pub fn advance(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// Forces the terminal state. Returns false when it was already there.
    pub fn terminate(&mut self) -> bool {
        if self.state == TransactionState::Terminated {
            return false;
        }
        self.enter(TransactionState::Terminated);
        true
    }
}

/// Transport independent transaction logic: every input is turned into a
/// list of actions for the runner.
pub(crate) trait StateMachine: Send + 'static {
    fn phase(&self) -> &Phase;

    /// Initial state entry, run by the transaction task once the handle is
    /// registered.
    fn start(&mut self) -> Vec<TransactionAction>;

    fn on_message(&mut self, msg: Message, from_remote: bool) -> Vec<TransactionAction>;

    fn on_send(&mut self, _rs: Response) -> Vec<TransactionAction> {
        vec![]
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction>;

    fn shutdown(&mut self) -> Vec<TransactionAction>;
}

pub(crate) struct TimerFire {
    pub signals: UnboundedSender<TransactionSignal>,
    pub timer: TransactionTimer,
    pub epoch: u64,
}

impl TimerFire {
    pub fn fire(self) {
        self.signals
            .send(TransactionSignal::Timer(self.timer, self.epoch))
            .ok();
    }
}

pub(crate) struct TransactionRunner {
    pub id: TransactionId,
    pub connection: ConnectionRef,
    pub tu: Option<ResponseSender>,
    pub timers: Arc<Timer<TimerFire>>,
    pub cleanup: Box<dyn FnOnce() + Send + Sync>,
}

impl TransactionRunner {
    /// Spawns the task owning `machine` and returns the handle that feeds it.
    /// `register` sees the handle before the task starts, so nothing the
    /// machine transmits can be answered ahead of it.
    pub fn spawn<M: StateMachine>(
        self,
        kind: TransactionKind,
        serial: u64,
        machine: M,
        register: impl FnOnce(&Transaction),
    ) -> Transaction {
        let (signals, receiver) = unbounded_channel();
        let transaction = Transaction {
            id: self.id.clone(),
            kind,
            serial,
            signals: signals.clone(),
        };
        register(&transaction);
        tokio::spawn(self.run(machine, signals, receiver));
        transaction
    }

    async fn run<M: StateMachine>(
        self,
        mut machine: M,
        signals: UnboundedSender<TransactionSignal>,
        mut receiver: UnboundedReceiver<TransactionSignal>,
    ) {
        let mut actions = machine.start();
        loop {
            if self.apply(actions, machine.phase().epoch(), &signals).await {
                break;
            }
            actions = match receiver.recv().await {
                Some(TransactionSignal::Message(msg, from_remote)) => {
                    machine.on_message(msg, from_remote)
                }
                Some(TransactionSignal::Send(rs)) => machine.on_send(rs),
                Some(TransactionSignal::Timer(timer, epoch)) if epoch == machine.phase().epoch() => {
                    debug!(id = %self.id, "{} fired in {:?}", timer, machine.phase().state());
                    machine.on_timer(timer)
                }
                // armed by a state that has been left
                Some(TransactionSignal::Timer(..)) => vec![],
                Some(TransactionSignal::Shutdown) | None => machine.shutdown(),
            };
        }
        receiver.close();
        info!(id = %self.id, "transaction terminated");
        (self.cleanup)();
    }

    /// Runs `actions`; true once the machine terminated.
    async fn apply(
        &self,
        actions: Vec<TransactionAction>,
        epoch: u64,
        signals: &UnboundedSender<TransactionSignal>,
    ) -> bool {
        for action in actions {
            match action {
                TransactionAction::Transmit(msg) => {
                    if let Err(e) = self.connection.send(msg).await {
                        warn!(id = %self.id, "transmit failed: {}", e);
                    }
                }
                TransactionAction::Deliver(rs) => {
                    if let Some(tu) = &self.tu {
                        tu.send(rs).ok();
                    }
                }
                TransactionAction::Schedule(timer, after) => {
                    self.timers.timeout(
                        after,
                        TimerFire {
                            signals: signals.clone(),
                            timer,
                            epoch,
                        },
                    );
                }
                TransactionAction::Terminate => return true,
            }
        }
        false
    }
}

/// Handle on a live transaction. Cloning it does not keep the
/// transaction alive; it ends when its state machine terminates.
#[derive(Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub(crate) serial: u64,
    signals: UnboundedSender<TransactionSignal>,
}

impl Transaction {
    fn signal(&self, signal: TransactionSignal) -> Result<()> {
        self.signals.send(signal).map_err(|_| {
            Error::TransactionError("transaction terminated".to_string(), self.id.clone())
        })
    }

    /// Feeds an inbound request retransmission, ACK or response.
    pub fn message(&self, msg: Message, from_remote: bool) -> Result<()> {
        self.signal(TransactionSignal::Message(msg, from_remote))
    }

    /// Sends a response through a server transaction.
    pub fn send(&self, rs: Response) -> Result<()> {
        if self.kind.is_client() {
            return Err(Error::TransactionError(
                "responses are sent by server transactions".to_string(),
                self.id.clone(),
            ));
        }
        self.signal(TransactionSignal::Send(rs))
    }

    /// Forces the terminal state. Already sent messages are not undone.
    pub fn shutdown(&self) {
        self.signal(TransactionSignal::Shutdown).ok();
    }

    pub fn is_terminated(&self) -> bool {
        self.signals.is_closed()
    }

    /// Resolves once the transaction reached its terminal state.
    pub async fn terminated(&self) {
        self.signals.closed().await
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.id)
    }
}
