use super::{
    transaction::{
        Phase, StateMachine, TransactionAction, TransactionState, TransactionTimer,
    },
    TimerTable,
};
use crate::message::{Message, Response};
use tracing::warn;

/// Non-INVITE server transaction: Trying -> Proceeding -> Completed -> Terminated.
pub struct ServerNonInvite {
    phase: Phase,
    last_response: Option<Response>,
    timers: TimerTable,
}

impl ServerNonInvite {
    pub fn new(timers: TimerTable) -> Self {
        ServerNonInvite {
            phase: Phase::new(TransactionState::Trying),
            last_response: None,
            timers,
        }
    }

    fn retransmit(&self) -> Vec<TransactionAction> {
        self.last_response
            .clone()
            .map(|rs| vec![TransactionAction::Transmit(rs.into())])
            .unwrap_or_default()
    }
}

impl StateMachine for ServerNonInvite {
    fn phase(&self) -> &Phase {
        &self.phase
    }

    fn start(&mut self) -> Vec<TransactionAction> {
        vec![]
    }

    fn on_message(&mut self, msg: Message, _from_remote: bool) -> Vec<TransactionAction> {
        if !msg.is_request() {
            return vec![];
        }
        match self.phase.state() {
            TransactionState::Trying
            | TransactionState::Proceeding
            | TransactionState::Completed => self.retransmit(),
            _ => vec![],
        }
    }

    fn on_send(&mut self, rs: Response) -> Vec<TransactionAction> {
        match self.phase.state() {
            TransactionState::Trying | TransactionState::Proceeding => {
                self.last_response = Some(rs.clone());
                let mut actions = vec![TransactionAction::Transmit(rs.clone().into())];
                if rs.status >= 200 {
                    self.phase.enter(TransactionState::Completed);
                    actions.push(TransactionAction::Schedule(
                        TransactionTimer::TimerJ,
                        self.timers.timeout,
                    ));
                } else {
                    self.phase.advance(TransactionState::Proceeding);
                }
                actions
            }
            state => {
                warn!("response {} dropped in {:?}", rs.status, state);
                vec![]
            }
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (self.phase.state(), timer) {
            (TransactionState::Completed, TransactionTimer::TimerJ) => self.shutdown(),
            _ => vec![],
        }
    }

    fn shutdown(&mut self) -> Vec<TransactionAction> {
        if self.phase.terminate() {
            vec![TransactionAction::Terminate]
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::tests::{request, response};
    use std::time::Duration;

    #[test]
    fn test_retransmission_answers() {
        let mut tx = ServerNonInvite::new(TimerTable::default());
        assert!(tx.start().is_empty());
        // nothing sent yet, nothing to repeat
        assert!(tx.on_message(request("OPTIONS").into(), true).is_empty());

        tx.on_send(response("OPTIONS", 100));
        assert_eq!(tx.phase().state(), TransactionState::Proceeding);
        let actions = tx.on_message(request("OPTIONS").into(), true);
        assert!(matches!(actions[..], [TransactionAction::Transmit(Message::Response(ref rs))] if rs.status == 100));

        let actions = tx.on_send(response("OPTIONS", 200));
        assert_eq!(
            actions[1],
            TransactionAction::Schedule(TransactionTimer::TimerJ, Duration::from_secs(32))
        );
        let actions = tx.on_message(request("OPTIONS").into(), true);
        assert!(matches!(actions[..], [TransactionAction::Transmit(Message::Response(ref rs))] if rs.status == 200));

        // a second final response is not sent
        assert!(tx.on_send(response("OPTIONS", 500)).is_empty());
        assert_eq!(tx.on_timer(TransactionTimer::TimerJ), vec![TransactionAction::Terminate]);
    }
}
