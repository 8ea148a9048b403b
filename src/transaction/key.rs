use crate::message::{Message, Method};
use crate::{Error, Result};
use std::fmt;

/// Correlates a request with its responses and, for INVITE, its ACK.
///
/// The id is `(method, call-id, top via branch)` where the method comes
/// from the CSeq, except that an ACK maps onto the INVITE it acknowledges.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub method: Method,
    pub call_id: String,
    pub branch: String,
}

impl TransactionId {
    pub fn new(method: Method, call_id: impl Into<String>, branch: impl Into<String>) -> Self {
        let method = match method {
            Method::Ack => Method::Invite,
            other => other,
        };
        TransactionId {
            method,
            call_id: call_id.into(),
            branch: branch.into(),
        }
    }

    /// Placeholder used in errors raised before an id could be computed.
    pub fn invalid() -> Self {
        TransactionId {
            method: Method::Other("INVALID".to_string()),
            call_id: String::new(),
            branch: String::new(),
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.method, self.call_id, self.branch)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl TryFrom<&Message> for TransactionId {
    type Error = Error;

    fn try_from(msg: &Message) -> Result<Self> {
        let missing =
            |what: &str| Error::TransactionError(format!("{} missing", what), Self::invalid());
        let headers = msg.headers();
        let call_id = headers.call_id().ok_or_else(|| missing("call-id"))?;
        let branch = headers
            .top_via()
            .ok_or_else(|| missing("via"))?
            .branch()
            .unwrap_or_default();
        let method = match msg {
            Message::Request(rq) if rq.method == Method::Ack => Method::Invite,
            _ => headers.cseq().ok_or_else(|| missing("cseq"))?.method.clone(),
        };
        Ok(TransactionId::new(method, call_id, branch))
    }
}
