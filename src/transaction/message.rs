use crate::message::{CSeq, HeaderValue, Headers, Method, NameAddr, Request, Response, Via};

/// Standard reason phrase for `status`, empty for unknown codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        420 => "Bad Extension",
        421 => "Extension Required",
        423 => "Interval Too Brief",
        430 => "Flow Failed",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        493 => "Undecipherable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        513 => "Message Too Large",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "",
    }
}

/// Builds a response to `rq` carrying its Via, To, From, Call-ID and CSeq.
/// Without an explicit `reason` the standard phrase is used.
pub fn make_response(rq: &Request, status: u16, reason: Option<&str>) -> Response {
    let mut headers = Headers::new();
    for name in ["via", "to", "from", "call-id", "cseq"] {
        if let Some(value) = rq.headers.get(name) {
            headers.insert(name, value.clone());
        }
    }
    Response {
        status,
        reason: reason.unwrap_or_else(|| reason_phrase(status)).to_string(),
        version: rq.version.clone(),
        headers,
        content: vec![],
    }
}

fn request_to(rq: &Request, method: Method, via: Via, to: Option<&NameAddr>) -> Request {
    let mut out = Request::new(method.clone(), rq.uri.clone());
    out.version = rq.version.clone();
    out.headers.insert("via", HeaderValue::Via(vec![via]));
    if let Some(from) = rq.headers.from() {
        out.headers.insert("from", HeaderValue::Address(from.clone()));
    }
    if let Some(to) = to {
        out.headers.insert("to", HeaderValue::Address(to.clone()));
    }
    if let Some(call_id) = rq.headers.call_id() {
        out.headers.insert("call-id", call_id);
    }
    let seq = rq.headers.cseq().map(|c| c.seq).unwrap_or_default();
    out.headers
        .insert("cseq", HeaderValue::CSeq(CSeq { seq, method }));
    out
}

/// ACK for a non-2xx final response to the INVITE `rq`. It reuses the
/// INVITE's top Via and takes To (with the remote tag) from `rs`.
pub fn make_ack(rq: &Request, rs: &Response, max_forwards: u32) -> Request {
    let via = rq.headers.top_via().cloned().unwrap_or_default();
    let mut ack = request_to(rq, Method::Ack, via, rs.headers.to());
    ack.headers
        .insert("max-forwards", max_forwards.to_string());
    ack
}

/// CANCEL for the forwarded `rq`, sent along the same branch (`via`) and
/// route set it was forwarded with.
pub fn make_cancel(rq: &Request, via: &Via, route: &[NameAddr]) -> Request {
    let mut cancel = request_to(rq, Method::Cancel, via.clone(), rq.headers.to());
    if !route.is_empty() {
        cancel
            .headers
            .insert("route", HeaderValue::AddressList(route.to_vec()));
    }
    cancel
}
