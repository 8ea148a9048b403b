//! SIP message model: parse, stringify and minimum-header checks.
use std::fmt;

pub mod header;
pub mod parser;
pub mod uri;

pub use header::{quote, unquote, AuthParams, CSeq, HeaderValue, Headers, NameAddr, Via};
pub use parser::parse_message;
pub use uri::{Params, Uri};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Ack,
    Bye,
    Cancel,
    Info,
    Invite,
    Message,
    Notify,
    Options,
    Prack,
    Publish,
    Refer,
    Register,
    Subscribe,
    Update,
    Other(String),
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "INFO" => Method::Info,
            "INVITE" => Method::Invite,
            "MESSAGE" => Method::Message,
            "NOTIFY" => Method::Notify,
            "OPTIONS" => Method::Options,
            "PRACK" => Method::Prack,
            "PUBLISH" => Method::Publish,
            "REFER" => Method::Refer,
            "REGISTER" => Method::Register,
            "SUBSCRIBE" => Method::Subscribe,
            "UPDATE" => Method::Update,
            _ => Method::Other(s.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Info => "INFO",
            Method::Invite => "INVITE",
            Method::Message => "MESSAGE",
            Method::Notify => "NOTIFY",
            Method::Options => "OPTIONS",
            Method::Prack => "PRACK",
            Method::Publish => "PUBLISH",
            Method::Refer => "REFER",
            Method::Register => "REGISTER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Update => "UPDATE",
            Method::Other(other) => other.as_str(),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: String,
    pub headers: Headers,
    pub content: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: "2.0".to_string(),
            headers: Headers::new(),
            content: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Headers,
    pub content: Vec<u8>,
}

impl Response {
    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl From<Request> for Message {
    fn from(rq: Request) -> Self {
        Message::Request(rq)
    }
}

impl From<Response> for Message {
    fn from(rs: Response) -> Self {
        Message::Response(rs)
    }
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(rq) => &rq.headers,
            Message::Response(rs) => &rs.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(rq) => &mut rq.headers,
            Message::Response(rs) => &mut rs.headers,
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            Message::Request(rq) => &rq.content,
            Message::Response(rs) => &rs.content,
        }
    }

    pub fn set_content(&mut self, content: Vec<u8>) {
        match self {
            Message::Request(rq) => rq.content = content,
            Message::Response(rs) => rs.content = content,
        }
    }

    pub fn method(&self) -> Option<&Method> {
        match self {
            Message::Request(rq) => Some(&rq.method),
            Message::Response(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    /// Minimum headers every message needs before it may reach a transaction.
    pub fn check(&self) -> bool {
        let start_line_ok = match self {
            Message::Request(rq) => !rq.method.to_string().is_empty(),
            Message::Response(rs) => (100..=999).contains(&rs.status),
        };
        let headers = self.headers();
        start_line_ok
            && !headers.via().is_empty()
            && headers.call_id().is_some()
            && headers.to().is_some()
            && headers.from().is_some()
            && headers.cseq().is_some()
    }

    fn start_line(&self) -> String {
        match self {
            Message::Request(rq) => format!("{} {} SIP/{}", rq.method, rq.uri, rq.version),
            Message::Response(rs) => format!("SIP/{} {} {}", rs.version, rs.status, rs.reason),
        }
    }

    /// Wire head including the blank line. Content-Length always reflects the content.
    fn head(&self) -> String {
        let content_length = HeaderValue::ContentLength(self.content().len());
        let mut lines = vec![self.start_line()];
        let mut wrote_length = false;
        for (name, value) in self.headers().iter() {
            if name == "content-length" {
                lines.extend(content_length.lines(name));
                wrote_length = true;
            } else {
                lines.extend(value.lines(name));
            }
        }
        if !wrote_length {
            lines.extend(content_length.lines("content-length"));
        }
        lines.join("\r\n") + "\r\n\r\n"
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = self.head().into_bytes();
        data.extend_from_slice(self.content());
        data
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.head(),
            String::from_utf8_lossy(self.content())
        )
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = crate::Error;

    fn try_from(data: &[u8]) -> crate::Result<Self> {
        parse_message(data).ok_or_else(|| crate::Error::SipMessageError("malformed message".into()))
    }
}

impl TryFrom<&str> for Message {
    type Error = crate::Error;

    fn try_from(data: &str) -> crate::Result<Self> {
        Message::try_from(data.as_bytes())
    }
}
