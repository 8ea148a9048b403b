use super::{
    make_response,
    transaction::{
        Phase, StateMachine, TransactionAction, TransactionState, TransactionTimer,
    },
    TimerTable,
};
use crate::message::{Message, Request};

/// Non-INVITE client transaction: Trying -> Proceeding -> Completed -> Terminated.
pub struct ClientNonInvite {
    phase: Phase,
    request: Request,
    reliable: bool,
    timers: TimerTable,
}

impl ClientNonInvite {
    pub fn new(request: Request, reliable: bool, timers: TimerTable) -> Self {
        ClientNonInvite {
            phase: Phase::new(TransactionState::Trying),
            request,
            reliable,
            timers,
        }
    }

    fn terminate(&mut self, mut actions: Vec<TransactionAction>) -> Vec<TransactionAction> {
        if self.phase.terminate() {
            actions.push(TransactionAction::Terminate);
        }
        actions
    }
}

impl StateMachine for ClientNonInvite {
    fn phase(&self) -> &Phase {
        &self.phase
    }

    fn start(&mut self) -> Vec<TransactionAction> {
        let mut actions = vec![TransactionAction::Transmit(self.request.clone().into())];
        if !self.reliable {
            actions.push(TransactionAction::Schedule(
                TransactionTimer::TimerE(self.timers.t1),
                self.timers.t1,
            ));
        }
        actions.push(TransactionAction::Schedule(
            TransactionTimer::TimerF,
            self.timers.timeout,
        ));
        actions
    }

    fn on_message(&mut self, msg: Message, _from_remote: bool) -> Vec<TransactionAction> {
        let Message::Response(rs) = msg else {
            return vec![];
        };
        match self.phase.state() {
            TransactionState::Trying | TransactionState::Proceeding => {
                if rs.status >= 200 {
                    self.phase.enter(TransactionState::Completed);
                    vec![
                        TransactionAction::Deliver(rs),
                        TransactionAction::Schedule(TransactionTimer::TimerK, self.timers.t4),
                    ]
                } else {
                    // Timer F keeps running through Proceeding
                    self.phase.advance(TransactionState::Proceeding);
                    vec![TransactionAction::Deliver(rs)]
                }
            }
            _ => vec![],
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (self.phase.state(), timer) {
            (TransactionState::Trying, TransactionTimer::TimerE(interval)) => {
                let next = interval * 2;
                vec![
                    TransactionAction::Transmit(self.request.clone().into()),
                    TransactionAction::Schedule(TransactionTimer::TimerE(next), next),
                ]
            }
            (
                TransactionState::Trying | TransactionState::Proceeding,
                TransactionTimer::TimerF,
            ) => {
                let timeout = make_response(&self.request, 408, None);
                self.terminate(vec![TransactionAction::Deliver(timeout)])
            }
            (TransactionState::Completed, TransactionTimer::TimerK) => self.terminate(vec![]),
            _ => vec![],
        }
    }

    fn shutdown(&mut self) -> Vec<TransactionAction> {
        self.terminate(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::{request, response};
    use std::time::Duration;

    #[test]
    fn test_retransmit_doubles_until_final_response() {
        let mut tx = ClientNonInvite::new(request("OPTIONS"), false, TimerTable::default());
        let start = tx.start();
        assert_eq!(start.len(), 3);
        assert_eq!(
            start[1],
            TransactionAction::Schedule(
                TransactionTimer::TimerE(Duration::from_millis(500)),
                Duration::from_millis(500)
            )
        );

        let actions = tx.on_timer(TransactionTimer::TimerE(Duration::from_millis(500)));
        assert!(matches!(actions[0], TransactionAction::Transmit(_)));
        assert_eq!(
            actions[1],
            TransactionAction::Schedule(
                TransactionTimer::TimerE(Duration::from_secs(1)),
                Duration::from_secs(1)
            )
        );

        let actions = tx.on_message(response("OPTIONS", 100).into(), true);
        assert!(matches!(actions[..], [TransactionAction::Deliver(_)]));
        assert_eq!(tx.phase().state(), TransactionState::Proceeding);
        // no retransmissions once a provisional arrived
        assert!(tx
            .on_timer(TransactionTimer::TimerE(Duration::from_secs(1)))
            .is_empty());

        let actions = tx.on_message(response("OPTIONS", 200).into(), true);
        assert!(matches!(actions[0], TransactionAction::Deliver(ref rs) if rs.status == 200));
        assert_eq!(tx.phase().state(), TransactionState::Completed);
        // retransmitted final responses are absorbed
        assert!(tx.on_message(response("OPTIONS", 200).into(), true).is_empty());
        assert_eq!(
            tx.on_timer(TransactionTimer::TimerK),
            vec![TransactionAction::Terminate]
        );
    }

    #[test]
    fn test_reliable_transport_has_no_retransmit() {
        let mut tx = ClientNonInvite::new(request("REGISTER"), true, TimerTable::default());
        let start = tx.start();
        assert_eq!(start.len(), 2);
        assert_eq!(
            start[1],
            TransactionAction::Schedule(TransactionTimer::TimerF, Duration::from_secs(32))
        );
        let actions = tx.on_timer(TransactionTimer::TimerF);
        assert!(matches!(actions[0], TransactionAction::Deliver(ref rs) if rs.status == 408));
        assert_eq!(actions[1], TransactionAction::Terminate);
        assert!(tx.shutdown().is_empty());
    }
}
