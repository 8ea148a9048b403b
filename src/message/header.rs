use super::{uri::Params, Method, Uri};
use indexmap::IndexMap;
use std::fmt;

/// Compact header forms, expanded on parse and never emitted.
const COMPACT_FORMS: &[(&str, &str)] = &[
    ("i", "call-id"),
    ("m", "contact"),
    ("e", "content-encoding"),
    ("l", "content-length"),
    ("c", "content-type"),
    ("f", "from"),
    ("s", "subject"),
    ("k", "supported"),
    ("t", "to"),
    ("v", "via"),
];

/// Lowercases a header name and expands its compact form.
pub fn canonical_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    COMPACT_FORMS
        .iter()
        .find(|(compact, _)| *compact == name)
        .map(|(_, full)| full.to_string())
        .unwrap_or(name)
}

/// Wire spelling of a canonical header name.
pub fn pretty_name(name: &str) -> String {
    match name {
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        _ => name
            .split('-')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub version: String,
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Default for Via {
    fn default() -> Self {
        Self {
            version: "2.0".to_string(),
            protocol: "UDP".to_string(),
            host: String::new(),
            port: None,
            params: Params::new(),
        }
    }
}

impl Via {
    /// Empty Via reserved for the next hop; the transport fills in host,
    /// port and protocol on send.
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.params.set("branch", Some(branch.into()));
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/{}/{} {}", self.version, self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

/// `[display-name] <uri>;params`, used by To, From, Contact and the route family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }
}

impl From<Uri> for NameAddr {
    fn from(uri: Uri) -> Self {
        Self::new(uri)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "{} ", name)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Digest style parameter list. Values keep their quotes as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthParams {
    pub scheme: Option<String>,
    pub params: IndexMap<String, String>,
}

impl AuthParams {
    pub fn new(scheme: Option<&str>) -> Self {
        Self {
            scheme: scheme.map(str::to_string),
            params: IndexMap::new(),
        }
    }

    pub fn is_digest(&self) -> bool {
        self.scheme
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("digest"))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn get_unquoted(&self, name: &str) -> Option<String> {
        self.get(name).map(unquote)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.params.insert(name.to_string(), value.into());
    }

    /// Sets `name` only when a value is present.
    pub fn set_opt(&mut self, name: &str, value: Option<String>) {
        if let Some(value) = value {
            self.set(name, value);
        }
    }
}

impl fmt::Display for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{} ", scheme)?;
        }
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", params)
    }
}

/// Wraps `s` in double quotes unless it is already quoted.
pub fn quote(s: &str) -> String {
    if s.starts_with('"') {
        s.to_string()
    } else {
        format!("\"{}\"", s)
    }
}

pub fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Via(Vec<Via>),
    Address(NameAddr),
    AddressList(Vec<NameAddr>),
    CSeq(CSeq),
    ContentLength(usize),
    Auth(Vec<AuthParams>),
    AuthInfo(AuthParams),
    Text(String),
}

impl HeaderValue {
    /// Wire lines for this header, without the trailing CRLF.
    pub(crate) fn lines(&self, name: &str) -> Vec<String> {
        let pretty = pretty_name(name);
        match self {
            HeaderValue::Via(vias) => vias
                .iter()
                .filter(|via| !via.host.is_empty())
                .map(|via| format!("{}: {}", pretty, via))
                .collect(),
            HeaderValue::Auth(list) => list
                .iter()
                .map(|auth| format!("{}: {}", pretty, auth))
                .collect(),
            HeaderValue::AddressList(list) if list.is_empty() => vec![],
            _ => vec![format!("{}: {}", pretty, self)],
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            HeaderValue::Via(vias) => write!(f, "{}", join(vias)),
            HeaderValue::Address(addr) => write!(f, "{}", addr),
            HeaderValue::AddressList(list) => write!(f, "{}", join(list)),
            HeaderValue::CSeq(cseq) => write!(f, "{}", cseq),
            HeaderValue::ContentLength(len) => write!(f, "{}", len),
            HeaderValue::Auth(list) => write!(f, "{}", join(list)),
            HeaderValue::AuthInfo(params) => write!(f, "{}", params),
            HeaderValue::Text(text) => write!(f, "{}", text),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

/// Header map keyed by canonical (lowercase, non-compact) name, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(IndexMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(&canonical_name(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HeaderValue> {
        self.0.get_mut(&canonical_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&canonical_name(name))
    }

    pub fn insert(&mut self, name: &str, value: impl Into<HeaderValue>) -> Option<HeaderValue> {
        self.0.insert(canonical_name(name), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.0.shift_remove(&canonical_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(HeaderValue::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.text("call-id")
    }

    pub fn via(&self) -> &[Via] {
        match self.get("via") {
            Some(HeaderValue::Via(vias)) => vias,
            _ => &[],
        }
    }

    /// Via list, created empty when absent.
    pub fn via_mut(&mut self) -> &mut Vec<Via> {
        let entry = self
            .0
            .entry("via".to_string())
            .or_insert_with(|| HeaderValue::Via(vec![]));
        if !matches!(entry, HeaderValue::Via(_)) {
            *entry = HeaderValue::Via(vec![]);
        }
        match entry {
            HeaderValue::Via(vias) => vias,
            _ => unreachable!("via header was just normalised"),
        }
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via().first()
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        match self.get("cseq") {
            Some(HeaderValue::CSeq(cseq)) => Some(cseq),
            _ => None,
        }
    }

    pub fn address(&self, name: &str) -> Option<&NameAddr> {
        match self.get(name) {
            Some(HeaderValue::Address(addr)) => Some(addr),
            _ => None,
        }
    }

    pub fn to(&self) -> Option<&NameAddr> {
        self.address("to")
    }

    pub fn from(&self) -> Option<&NameAddr> {
        self.address("from")
    }

    pub fn address_list(&self, name: &str) -> &[NameAddr] {
        match self.get(name) {
            Some(HeaderValue::AddressList(list)) => list,
            _ => &[],
        }
    }

    pub fn route(&self) -> &[NameAddr] {
        self.address_list("route")
    }

    pub fn content_length(&self) -> Option<usize> {
        match self.get("content-length") {
            Some(HeaderValue::ContentLength(len)) => Some(*len),
            _ => None,
        }
    }

    pub fn auth(&self, name: &str) -> &[AuthParams] {
        match self.get(name) {
            Some(HeaderValue::Auth(list)) => list,
            _ => &[],
        }
    }

    pub fn auth_info(&self, name: &str) -> Option<&AuthParams> {
        match self.get(name) {
            Some(HeaderValue::AuthInfo(params)) => Some(params),
            _ => None,
        }
    }
}
