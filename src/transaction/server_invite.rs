use super::{
    transaction::{
        Phase, StateMachine, TransactionAction, TransactionState, TransactionTimer,
    },
    TimerTable,
};
use crate::message::{Message, Method, Response};
use tracing::warn;

/// INVITE server transaction: Proceeding -> {Completed -> Confirmed, Accepted} -> Terminated.
///
/// A non-2xx final response is retransmitted with doubling intervals until
/// the ACK arrives or timer H gives up. In Accepted further 2xx responses
/// may still be sent.
pub struct ServerInvite {
    phase: Phase,
    last_response: Option<Response>,
    timers: TimerTable,
}

impl ServerInvite {
    pub fn new(timers: TimerTable) -> Self {
        ServerInvite {
            phase: Phase::new(TransactionState::Proceeding),
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

impl StateMachine for ServerInvite {
    fn phase(&self) -> &Phase {
        &self.phase
    }

    fn start(&mut self) -> Vec<TransactionAction> {
        vec![]
    }

    fn on_message(&mut self, msg: Message, _from_remote: bool) -> Vec<TransactionAction> {
        let Message::Request(rq) = msg else {
            return vec![];
        };
        match self.phase.state() {
            TransactionState::Proceeding => self.retransmit(),
            TransactionState::Completed if rq.method == Method::Ack => {
                self.phase.enter(TransactionState::Confirmed);
                vec![TransactionAction::Schedule(
                    TransactionTimer::TimerI,
                    self.timers.t4,
                )]
            }
            TransactionState::Completed => self.retransmit(),
            _ => vec![],
        }
    }

    fn on_send(&mut self, rs: Response) -> Vec<TransactionAction> {
        match self.phase.state() {
            TransactionState::Proceeding => {
                self.last_response = Some(rs.clone());
                let mut actions = vec![TransactionAction::Transmit(rs.clone().into())];
                if rs.status >= 300 {
                    self.phase.enter(TransactionState::Completed);
                    let t1 = self.timers.t1;
                    actions.push(TransactionAction::Schedule(TransactionTimer::TimerG(t1), t1));
                    actions.push(TransactionAction::Schedule(
                        TransactionTimer::TimerH,
                        self.timers.timeout,
                    ));
                } else if rs.status >= 200 {
                    self.phase.enter(TransactionState::Accepted);
                    actions.push(TransactionAction::Schedule(
                        TransactionTimer::TimerL,
                        self.timers.timeout,
                    ));
                }
                actions
            }
            TransactionState::Accepted if rs.is_success() => {
                self.last_response = Some(rs.clone());
                vec![TransactionAction::Transmit(rs.into())]
            }
            state => {
                warn!("response {} dropped in {:?}", rs.status, state);
                vec![]
            }
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (self.phase.state(), timer) {
            (TransactionState::Completed, TransactionTimer::TimerG(interval)) => {
                let next = interval * 2;
                let mut actions = self.retransmit();
                actions.push(TransactionAction::Schedule(TransactionTimer::TimerG(next), next));
                actions
            }
            (TransactionState::Completed, TransactionTimer::TimerH)
            | (TransactionState::Confirmed, TransactionTimer::TimerI)
            | (TransactionState::Accepted, TransactionTimer::TimerL) => self.shutdown(),
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
    fn test_final_response_retransmitted_until_ack() {
        let mut tx = ServerInvite::new(TimerTable::default());
        assert!(tx.on_message(request("INVITE").into(), true).is_empty());
        tx.on_send(response("INVITE", 180));
        assert_eq!(tx.phase().state(), TransactionState::Proceeding);

        let actions = tx.on_send(response("INVITE", 486));
        assert_eq!(actions.len(), 3);
        assert_eq!(tx.phase().state(), TransactionState::Completed);

        let actions = tx.on_timer(TransactionTimer::TimerG(Duration::from_millis(500)));
        assert!(matches!(actions[0], TransactionAction::Transmit(Message::Response(ref rs)) if rs.status == 486));
        assert_eq!(
            actions[1],
            TransactionAction::Schedule(
                TransactionTimer::TimerG(Duration::from_secs(1)),
                Duration::from_secs(1)
            )
        );
        assert_eq!(tx.on_message(request("INVITE").into(), true).len(), 1);

        let actions = tx.on_message(request("ACK").into(), true);
        assert_eq!(
            actions,
            vec![TransactionAction::Schedule(TransactionTimer::TimerI, Duration::from_secs(5))]
        );
        assert!(tx.on_message(request("INVITE").into(), true).is_empty());
        assert_eq!(tx.on_timer(TransactionTimer::TimerI), vec![TransactionAction::Terminate]);
    }

    #[test]
    fn test_accepted_sends_more_2xx() {
        let mut tx = ServerInvite::new(TimerTable::default());
        tx.on_send(response("INVITE", 200));
        assert_eq!(tx.phase().state(), TransactionState::Accepted);
        assert_eq!(tx.on_send(response("INVITE", 200)).len(), 1);
        assert!(tx.on_send(response("INVITE", 486)).is_empty());
        assert_eq!(tx.on_timer(TransactionTimer::TimerL), vec![TransactionAction::Terminate]);
        assert!(tx.shutdown().is_empty());
    }
}
