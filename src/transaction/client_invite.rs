use super::{
    make_ack, make_response,
    transaction::{
        Phase, StateMachine, TransactionAction, TransactionState, TransactionTimer,
    },
    TimerTable,
};
use crate::message::{Message, Request};

/// INVITE client transaction: Calling -> Proceeding -> {Completed, Accepted} -> Terminated.
///
/// A non-2xx final response is acknowledged by the transaction itself; the
/// ACK is resent for every retransmission of that response. After a 2xx the
/// transaction lingers in Accepted so forked 2xx responses still reach the
/// transaction user.
pub struct ClientInvite {
    phase: Phase,
    request: Request,
    reliable: bool,
    timers: TimerTable,
    max_forwards: u32,
    ack: Option<Request>,
}

impl ClientInvite {
    pub fn new(request: Request, reliable: bool, timers: TimerTable, max_forwards: u32) -> Self {
        ClientInvite {
            phase: Phase::new(TransactionState::Calling),
            request,
            reliable,
            timers,
            max_forwards,
            ack: None,
        }
    }

    fn terminate(&mut self, mut actions: Vec<TransactionAction>) -> Vec<TransactionAction> {
        if self.phase.terminate() {
            actions.push(TransactionAction::Terminate);
        }
        actions
    }
}

impl StateMachine for ClientInvite {
    fn phase(&self) -> &Phase {
        &self.phase
    }

    fn start(&mut self) -> Vec<TransactionAction> {
        let mut actions = vec![TransactionAction::Transmit(self.request.clone().into())];
        if !self.reliable {
            actions.push(TransactionAction::Schedule(
                TransactionTimer::TimerA(self.timers.t1),
                self.timers.t1,
            ));
        }
        actions.push(TransactionAction::Schedule(
            TransactionTimer::TimerB,
            self.timers.timeout,
        ));
        actions
    }

    fn on_message(&mut self, msg: Message, from_remote: bool) -> Vec<TransactionAction> {
        let Message::Response(rs) = msg else {
            return vec![];
        };
        match self.phase.state() {
            TransactionState::Calling | TransactionState::Proceeding => {
                if rs.status < 200 {
                    if self.phase.state() == TransactionState::Calling {
                        self.phase.enter(TransactionState::Proceeding);
                    }
                    vec![TransactionAction::Deliver(rs)]
                } else if rs.status < 300 {
                    self.phase.enter(TransactionState::Accepted);
                    vec![
                        TransactionAction::Deliver(rs),
                        TransactionAction::Schedule(TransactionTimer::TimerM, self.timers.timeout),
                    ]
                } else {
                    self.phase.enter(TransactionState::Completed);
                    let ack = make_ack(&self.request, &rs, self.max_forwards);
                    self.ack = Some(ack.clone());
                    vec![
                        TransactionAction::Deliver(rs),
                        TransactionAction::Transmit(ack.into()),
                        TransactionAction::Schedule(TransactionTimer::TimerD, self.timers.timeout),
                    ]
                }
            }
            // locally synthesized responses are never acknowledged
            TransactionState::Completed if from_remote => self
                .ack
                .clone()
                .map(|ack| vec![TransactionAction::Transmit(ack.into())])
                .unwrap_or_default(),
            TransactionState::Accepted if rs.is_success() => vec![TransactionAction::Deliver(rs)],
            _ => vec![],
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (self.phase.state(), timer) {
            (TransactionState::Calling, TransactionTimer::TimerA(interval)) => {
                let next = interval * 2;
                vec![
                    TransactionAction::Transmit(self.request.clone().into()),
                    TransactionAction::Schedule(TransactionTimer::TimerA(next), next),
                ]
            }
            (TransactionState::Calling, TransactionTimer::TimerB) => {
                let timeout = make_response(&self.request, 408, None);
                self.terminate(vec![TransactionAction::Deliver(timeout)])
            }
            (TransactionState::Completed, TransactionTimer::TimerD)
            | (TransactionState::Accepted, TransactionTimer::TimerM) => self.terminate(vec![]),
            _ => vec![],
        }
    }

    fn shutdown(&mut self) -> Vec<TransactionAction> {
        self.terminate(vec![])
    }
}
