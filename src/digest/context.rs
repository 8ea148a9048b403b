use super::{
    compute_ha1, compute_hash, compute_response_digest, is_md5_sess, nc_hex, random_hex,
    user_realm_password_hash, DigestInput,
};
use crate::message::{quote, unquote, AuthParams, HeaderValue, Request, Response};
use crate::{Error, Result};
use tracing::debug;

pub const CNONCE_LEN: usize = 8;
const DEFAULT_QOP: &str = "auth,auth-int";
const DEFAULT_ALGORITHM: &str = "md5";

/// Secret material for either side of a digest exchange.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub username: String,
    pub password: Option<String>,
    /// Precomputed `md5(user:realm:password)`, used instead of the password.
    pub hash: Option<String>,
    /// Realm to answer; the first challenge is used when unset.
    pub realm: Option<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    fn userhash(&self, realm: &str) -> String {
        self.hash.clone().unwrap_or_else(|| {
            user_realm_password_hash(
                &self.username,
                realm,
                self.password.as_deref().unwrap_or_default(),
            )
        })
    }
}

/// Per-peer digest state. A server keeps one per challenged client, a
/// client one per challenging realm.
#[derive(Debug, Clone, Default)]
pub struct DigestContext {
    pub realm: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub userhash: Option<String>,
    pub ha1: Option<String>,
    pub nonce: Option<String>,
    pub cnonce: Option<String>,
    pub nc: u32,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
    pub domain: Option<String>,
    pub uri: Option<String>,
    /// Challenge came as 407 and credentials travel in Proxy-* headers.
    pub proxy: bool,
}

impl DigestContext {
    pub fn with_realm(realm: impl Into<String>) -> Self {
        Self {
            realm: Some(realm.into()),
            ..Default::default()
        }
    }

    /// Client side qop preference, comma separated, most preferred first.
    pub fn with_qop(mut self, qop: impl Into<String>) -> Self {
        self.qop = Some(qop.into());
        self
    }

    fn authorization_header(&self) -> &'static str {
        if self.proxy {
            "proxy-authorization"
        } else {
            "authorization"
        }
    }

    fn digest(&self, method: &str, entity: &[u8]) -> String {
        let nc = nc_hex(self.nc);
        compute_response_digest(&DigestInput {
            ha1: self.ha1.as_deref().unwrap_or_default(),
            method,
            uri: self.uri.as_deref().unwrap_or_default(),
            nonce: self.nonce.as_deref().unwrap_or_default(),
            nc: &nc,
            cnonce: self.cnonce.as_deref().unwrap_or_default(),
            qop: self.qop.as_deref(),
            entity,
        })
    }
}

/// First Digest entry of `list` for `realm`, or the first entry when no
/// realm is wanted.
fn find_digest_realm<'a>(list: &'a [AuthParams], realm: Option<&str>) -> Option<&'a AuthParams> {
    match realm {
        None => list.first(),
        Some(realm) => list
            .iter()
            .find(|p| p.is_digest() && p.get_unquoted("realm").as_deref() == Some(realm)),
    }
}

fn push_auth(headers: &mut crate::message::Headers, name: &str, params: AuthParams) {
    let mut list = match headers.remove(name) {
        Some(HeaderValue::Auth(list)) => list,
        _ => vec![],
    };
    list.push(params);
    headers.insert(name, HeaderValue::Auth(list));
}

/// Adds a fresh Digest challenge to `rs` (WWW-Authenticate, or
/// Proxy-Authenticate for a 407) and resets the server context for it.
pub fn challenge(ctx: &mut DigestContext, rs: &mut Response) {
    ctx.proxy = rs.status == 407;
    ctx.nonce = Some(random_hex(16));
    ctx.nc = 0;
    ctx.ha1 = None;
    ctx.userhash = None;
    let qop = ctx.qop.get_or_insert_with(|| DEFAULT_QOP.to_string()).clone();
    let algorithm = ctx
        .algorithm
        .get_or_insert_with(|| DEFAULT_ALGORITHM.to_string())
        .clone();

    let mut params = AuthParams::new(Some("Digest"));
    params.set("realm", quote(ctx.realm.as_deref().unwrap_or_default()));
    params.set("qop", quote(&qop));
    params.set("algorithm", quote(&algorithm));
    params.set_opt("nonce", ctx.nonce.as_deref().map(quote));
    params.set_opt("opaque", ctx.opaque.as_deref().map(quote));

    let name = if ctx.proxy {
        "proxy-authenticate"
    } else {
        "www-authenticate"
    };
    push_auth(&mut rs.headers, name, params);
}

/// Verifies the credentials `rq` carries for the context's realm.
///
/// A request without matching credentials clears the nonce so the caller
/// issues a new challenge.
pub fn authenticate_request(ctx: &mut DigestContext, rq: &Request, creds: &Credential) -> bool {
    let response = match find_digest_realm(
        rq.headers.auth(ctx.authorization_header()),
        ctx.realm.as_deref(),
    ) {
        Some(response) => response.clone(),
        None => {
            ctx.nonce = None;
            ctx.userhash = None;
            ctx.algorithm = None;
            ctx.ha1 = None;
            return false;
        }
    };

    let cnonce = response.get_unquoted("cnonce");
    let uri = response.get_unquoted("uri").unwrap_or_default();
    let qop = response
        .get_unquoted("qop")
        .map(|q| q.to_ascii_lowercase());

    ctx.nc += 1;

    if ctx.ha1.is_none() {
        let userhash = creds.userhash(ctx.realm.as_deref().unwrap_or_default());
        ctx.ha1 = Some(if is_md5_sess(ctx.algorithm.as_deref()) {
            compute_hash(&[
                userhash.as_str(),
                ctx.nonce.as_deref().unwrap_or_default(),
                cnonce.as_deref().unwrap_or_default(),
            ])
        } else {
            userhash.clone()
        });
        ctx.userhash = Some(userhash);
    }

    let nc = nc_hex(ctx.nc);
    let method = rq.method.to_string();
    let digest = compute_response_digest(&DigestInput {
        ha1: ctx.ha1.as_deref().unwrap_or_default(),
        method: &method,
        uri: &uri,
        nonce: ctx.nonce.as_deref().unwrap_or_default(),
        nc: &nc,
        cnonce: cnonce.as_deref().unwrap_or_default(),
        qop: qop.as_deref(),
        entity: &rq.content,
    });

    if response.get_unquoted("response").as_deref() == Some(digest.as_str()) {
        ctx.cnonce = cnonce;
        ctx.uri = Some(uri);
        ctx.qop = qop;
        true
    } else {
        debug!(user = %creds.username, "digest mismatch");
        false
    }
}

/// Picks the first qop of the client preference list that the challenge
/// offers, or the first offered when there is no preference.
fn select_qop(offered: Option<&str>, preference: Option<&str>) -> Result<Option<String>> {
    let Some(offered) = offered else {
        return Ok(None);
    };
    let offered = unquote(offered).to_ascii_lowercase();
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
    let Some(preference) = preference else {
        return Ok(offered.first().map(|q| q.to_string()));
    };
    for wanted in preference.split(',').map(str::trim) {
        if let Some(found) = offered.iter().find(|q| **q == wanted) {
            return Ok(Some(found.to_string()));
        }
    }
    Err(Error::DigestNegotiationError(format!(
        "offered {:?}, wanted {}",
        offered, preference
    )))
}

fn init_client_context(ctx: &mut DigestContext, rs: &Response, creds: &Credential) -> Result<()> {
    let header = if rs.status == 407 {
        ctx.proxy = true;
        "proxy-authenticate"
    } else {
        "www-authenticate"
    };
    let challenge = find_digest_realm(rs.headers.auth(header), creds.realm.as_deref())
        .ok_or_else(|| Error::DigestError(format!("no {} challenge in {}", header, rs.status)))?;

    let nonce = challenge.get_unquoted("nonce");
    if ctx.nonce != nonce {
        ctx.nonce = nonce;
        ctx.algorithm = challenge
            .get_unquoted("algorithm")
            .map(|a| a.to_ascii_lowercase());
        ctx.qop = select_qop(challenge.get("qop"), ctx.qop.as_deref())?;
        if ctx.qop.is_some() {
            ctx.nc = 0;
            ctx.cnonce = Some(random_hex(CNONCE_LEN));
        }
        ctx.realm = challenge.get_unquoted("realm");
        ctx.user = Some(creds.username.clone());
        ctx.password = creds.password.clone();
        ctx.userhash = Some(creds.userhash(ctx.realm.as_deref().unwrap_or_default()));
        ctx.ha1 = Some(compute_ha1(ctx));
        ctx.domain = challenge.get_unquoted("domain");
    }
    ctx.opaque = challenge.get_unquoted("opaque");
    Ok(())
}

/// Adds (Proxy-)Authorization to `rq`, answering `challenge_response`
/// when given.
///
/// Any earlier credentials for the same realm are replaced. The context is
/// handed back only when a qop was negotiated, since only then can it sign
/// further requests.
pub fn sign_request(
    mut ctx: DigestContext,
    rq: &mut Request,
    challenge_response: Option<&Response>,
    creds: &Credential,
) -> Result<Option<DigestContext>> {
    if let Some(rs) = challenge_response {
        init_client_context(&mut ctx, rs, creds)?;
    }

    ctx.nc += 1;
    let nc = ctx.qop.as_ref().map(|_| nc_hex(ctx.nc));
    ctx.uri = Some(rq.uri.to_string());
    let response = ctx.digest(&rq.method.to_string(), &rq.content);

    let mut signature = AuthParams::new(Some("Digest"));
    signature.set_opt("realm", ctx.realm.as_deref().map(quote));
    signature.set_opt("username", ctx.user.as_deref().map(quote));
    signature.set_opt("nonce", ctx.nonce.as_deref().map(quote));
    signature.set_opt("uri", ctx.uri.as_deref().map(quote));
    signature.set_opt("nc", nc);
    signature.set_opt("algorithm", ctx.algorithm.clone());
    if ctx.qop.is_some() {
        signature.set_opt("cnonce", ctx.cnonce.as_deref().map(quote));
    }
    signature.set_opt("qop", ctx.qop.clone());
    signature.set_opt("opaque", ctx.opaque.as_deref().map(quote));
    signature.set("response", quote(&response));

    let header = ctx.authorization_header();
    let mut list = match rq.headers.remove(header) {
        Some(HeaderValue::Auth(list)) => list,
        _ => vec![],
    };
    list.retain(|p| p.get_unquoted("realm") != ctx.realm);
    list.push(signature);
    rq.headers.insert(header, HeaderValue::Auth(list));

    Ok(ctx.qop.is_some().then_some(ctx))
}

/// Adds Authentication-Info (mutual authentication) to a response for a
/// request that passed [`authenticate_request`].
pub fn sign_response(ctx: &DigestContext, rs: &mut Response) {
    let mut info = AuthParams::new(None);
    info.set_opt("qop", ctx.qop.clone());
    info.set_opt("cnonce", ctx.cnonce.as_deref().map(quote));
    info.set("nc", nc_hex(ctx.nc));
    info.set("rspauth", quote(&ctx.digest("", &rs.content)));
    rs.headers
        .insert("authentication-info", HeaderValue::AuthInfo(info));
}

/// Checks the server's `rspauth`. `None` when the response carries no
/// Authentication-Info at all.
///
/// A valid response with a `nextnonce` rolls the context over to it.
pub fn authenticate_response(ctx: &mut DigestContext, rs: &Response) -> Option<bool> {
    let header = if ctx.proxy {
        "proxy-authentication-info"
    } else {
        "authentication-info"
    };
    let signature = rs.headers.auth_info(header)?;
    let digest = ctx.digest("", &rs.content);
    if signature.get_unquoted("rspauth").as_deref() != Some(digest.as_str()) {
        return Some(false);
    }
    if let Some(next) = signature.get_unquoted("nextnonce") {
        if ctx.nonce.as_deref() != Some(next.as_str()) {
            ctx.nonce = Some(next);
            ctx.nc = 0;
            if is_md5_sess(ctx.algorithm.as_deref()) {
                ctx.ha1 = Some(compute_hash(&[
                    ctx.userhash.as_deref().unwrap_or_default(),
                    ctx.nonce.as_deref().unwrap_or_default(),
                    ctx.cnonce.as_deref().unwrap_or_default(),
                ]));
            }
        }
    }
    Some(true)
}
