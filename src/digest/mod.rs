//! HTTP digest authentication for SIP (RFC 2617 / RFC 3261 section 22).
//!
//! Hash helpers live here; the challenge/sign/verify flows working on a
//! [`DigestContext`] are in [`context`].
use crate::message::unquote;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SecondsFormat, Utc};

pub mod context;
pub use context::{
    authenticate_request, authenticate_response, challenge, sign_request, sign_response,
    Credential, DigestContext,
};


pub const NONCE_SECRET_LEN: usize = 16;

/// md5 over `parts` joined by `:`, lowercase hex.
pub fn compute_hash<T: AsRef<[u8]>>(parts: &[T]) -> String {
    let mut ctx = md5::Context::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            ctx.consume(b":");
        }
        ctx.consume(part.as_ref());
    }
    format!("{:x}", ctx.compute())
}

pub fn user_realm_password_hash(user: &str, realm: &str, password: &str) -> String {
    compute_hash(&[unquote(user), unquote(realm), unquote(password)])
}

pub(crate) fn is_md5_sess(algorithm: Option<&str>) -> bool {
    algorithm.is_some_and(|a| a.eq_ignore_ascii_case("md5-sess"))
}

/// HA1 for the context: the user hash, or for `md5-sess` the hash of
/// user hash, nonce and cnonce.
pub fn compute_ha1(ctx: &DigestContext) -> String {
    let userhash = ctx.userhash.clone().unwrap_or_else(|| {
        user_realm_password_hash(
            ctx.user.as_deref().unwrap_or_default(),
            ctx.realm.as_deref().unwrap_or_default(),
            ctx.password.as_deref().unwrap_or_default(),
        )
    });
    if is_md5_sess(ctx.algorithm.as_deref()) {
        compute_hash(&[
            userhash.as_str(),
            ctx.nonce.as_deref().unwrap_or_default(),
            ctx.cnonce.as_deref().unwrap_or_default(),
        ])
    } else {
        userhash
    }
}

/// Everything that goes into a `response` / `rspauth` value.
#[derive(Debug, Clone, Default)]
pub struct DigestInput<'a> {
    pub ha1: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub nonce: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
    pub qop: Option<&'a str>,
    pub entity: &'a [u8],
}

pub fn compute_response_digest(input: &DigestInput<'_>) -> String {
    match input.qop {
        Some(qop @ "auth-int") => {
            let entity = compute_hash(&[input.entity]);
            let ha2 = compute_hash(&[input.method, input.uri, entity.as_str()]);
            compute_hash(&[
                input.ha1,
                input.nonce,
                input.nc,
                input.cnonce,
                qop,
                ha2.as_str(),
            ])
        }
        Some(qop @ "auth") => {
            let ha2 = compute_hash(&[input.method, input.uri]);
            compute_hash(&[
                input.ha1,
                input.nonce,
                input.nc,
                input.cnonce,
                qop,
                ha2.as_str(),
            ])
        }
        _ => {
            let ha2 = compute_hash(&[input.method, input.uri]);
            compute_hash(&[input.ha1, input.nonce, ha2.as_str()])
        }
    }
}

pub(crate) fn nc_hex(nc: u32) -> String {
    format!("{:08x}", nc)
}

pub(crate) fn random_hex(len: usize) -> String {
    (0..len)
        .map(|_| format!("{:02x}", rand::random::<u8>()))
        .collect()
}

/// Issues nonces of the form `base64(<iso timestamp>;<md5(ts, tag, secret)>)`.
///
/// The secret is fixed per generator so a nonce can later be verified by
/// regenerating it from its embedded timestamp.
#[derive(Debug, Clone)]
pub struct NonceGenerator {
    secret: String,
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self {
            secret: random_hex(NONCE_SECRET_LEN),
        }
    }

    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn generate_nonce(&self, tag: &str, timestamp: Option<DateTime<Utc>>) -> String {
        let timestamp = timestamp
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let hash = compute_hash(&[timestamp.as_str(), tag, self.secret.as_str()]);
        STANDARD.encode(format!("{};{}", timestamp, hash))
    }

    /// Timestamp of a nonce this generator issued for `tag`; `None` when
    /// the nonce is malformed or was not produced here.
    pub fn extract_nonce_timestamp(&self, nonce: &str, tag: &str) -> Option<DateTime<Utc>> {
        let decoded = String::from_utf8(STANDARD.decode(nonce).ok()?).ok()?;
        let mut parts = decoded.split(';');
        let (timestamp, _hash) = (parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .ok()?
            .with_timezone(&Utc);
        (self.generate_nonce(tag, Some(timestamp)) == nonce).then_some(timestamp)
    }
}
