//! Transaction layer: the four RFC 3261 state machines, the registry that
//! routes inbound messages to them and the sequential search used to
//! forward a request over a list of candidate hops.
use crate::message::Response;
use rand::{distr::Alphanumeric, Rng};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod client_invite;
pub mod client_non_invite;
pub mod key;
pub mod layer;
pub mod message;
pub mod sequential_search;
pub mod server_invite;
pub mod server_non_invite;
mod timer;
pub mod transaction;

pub use key::TransactionId;
pub use layer::TransactionLayer;
pub use message::{make_ack, make_cancel, make_response, reason_phrase};
pub use sequential_search::sequential_search;
pub use transaction::{Transaction, TransactionKind, TransactionState};

#[cfg(test)]
mod tests;

pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";
pub const BRANCH_LEN: usize = 12;
pub const TAG_LEN: usize = 8;

/// Responses handed from a client transaction to its transaction user.
pub type ResponseSender = UnboundedSender<Response>;
pub type ResponseReceiver = UnboundedReceiver<Response>;

/// Protocol timer values. `t1` is the retransmit base, `t4` the short
/// absorb window and `timeout` the 64*T1 transaction give-up time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTable {
    pub t1: Duration,
    pub t4: Duration,
    pub timeout: Duration,
}

impl Default for TimerTable {
    fn default() -> Self {
        TimerTable {
            t1: Duration::from_millis(500),
            t4: Duration::from_secs(5),
            timeout: Duration::from_secs(32),
        }
    }
}

pub fn random_text(count: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_text(BRANCH_LEN))
}

pub fn generate_tag() -> String {
    random_text(TAG_LEN)
}
