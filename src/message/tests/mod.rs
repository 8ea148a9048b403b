use super::*;

const INVITE: &str = "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
v: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds;rport, SIP/2.0/TCP proxy.example.com:5060;branch=z9hG4bKabc\r\n\
Max-Forwards: 70\r\n\
t: Bob <sip:bob@biloxi.example.com>\r\n\
f: \"Alice Liddell\" <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
i: a84b4c76e66710@pc33.atlanta.example.com\r\n\
CSeq: 314159 INVITE\r\n\
m: <sip:alice@pc33.atlanta.example.com;transport=tcp>\r\n\
Route: <sip:p1.example.com;lr>,\r\n <sip:p2.example.com;lr>\r\n\
Supported: replaces\r\n\
k: timer\r\n\
Proxy-Authorization: Digest username=\"alice\", realm=\"atlanta.example.com\", nonce=\"abc\", uri=\"sip:bob@biloxi.example.com\", response=\"xyz\"\r\n\
c: application/sdp\r\n\
l: 5\r\n\
\r\n\
v=0\r\nextra";

fn parse_invite() -> Request {
    match parse_message(INVITE.as_bytes()) {
        Some(Message::Request(rq)) => rq,
        other => panic!("expected request, got {:?}", other),
    }
}

#[test]
fn test_parse_request() {
    let rq = parse_invite();
    assert_eq!(rq.method, Method::Invite);
    assert_eq!(rq.uri.user.as_deref(), Some("bob"));
    assert_eq!(rq.uri.host, "biloxi.example.com");

    let vias = rq.headers.via();
    assert_eq!(vias.len(), 2);
    assert_eq!(vias[0].branch(), Some("z9hG4bK776asdhds"));
    assert!(vias[0].params.contains("rport"));
    assert_eq!(vias[1].protocol, "TCP");
    assert_eq!(vias[1].port, Some(5060));

    let from = rq.headers.from().expect("from");
    assert_eq!(from.display_name.as_deref(), Some("\"Alice Liddell\""));
    assert_eq!(from.tag(), Some("1928301774"));
    assert_eq!(
        rq.headers.call_id(),
        Some("a84b4c76e66710@pc33.atlanta.example.com")
    );
    let cseq = rq.headers.cseq().expect("cseq");
    assert_eq!(cseq.seq, 314159);
    assert_eq!(cseq.method, Method::Invite);

    let contact = rq.headers.address_list("contact");
    assert_eq!(contact[0].uri.transport().as_deref(), Some("tcp"));

    let route = rq.headers.route();
    assert_eq!(route.len(), 2);
    assert!(route[0].uri.params.contains("lr"));
    assert_eq!(route[1].uri.host, "p2.example.com");

    assert_eq!(rq.headers.text("supported"), Some("replaces,timer"));
    assert_eq!(rq.headers.text("content-type"), Some("application/sdp"));

    let auth = &rq.headers.auth("proxy-authorization")[0];
    assert!(auth.is_digest());
    assert_eq!(auth.get_unquoted("username").as_deref(), Some("alice"));
    assert_eq!(auth.get("response"), Some("\"xyz\""));

    assert_eq!(rq.content, b"v=0\r\n");
}

#[test]
fn test_stringify_uses_full_names() {
    let message = Message::Request(parse_invite());
    let text = message.to_string();
    assert!(text.starts_with("INVITE sip:bob@biloxi.example.com SIP/2.0\r\n"));
    assert!(text.contains("\r\nCall-ID: a84b4c76e66710@pc33.atlanta.example.com\r\n"));
    assert!(text.contains("\r\nCSeq: 314159 INVITE\r\n"));
    assert!(text.contains(
        "\r\nVia: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds;rport\r\n"
    ));
    assert!(text.contains("\r\nVia: SIP/2.0/TCP proxy.example.com:5060;branch=z9hG4bKabc\r\n"));
    assert!(text.contains("\r\nTo: Bob <sip:bob@biloxi.example.com>\r\n"));
    assert!(text.contains("\r\nSupported: replaces,timer\r\n"));
    assert!(text.contains("\r\nContent-Length: 5\r\n"));
    assert!(!text.contains("\r\ni:"));
    assert!(!text.contains("\r\nl:"));
    assert!(text.ends_with("\r\n\r\nv=0\r\n"));
}

#[test]
fn test_round_trip() {
    let message = Message::Request(parse_invite());
    let reparsed = parse_message(&message.to_bytes()).expect("reparse");
    assert_eq!(message, reparsed);

    let response = "SIP/2.0 401 Unauthorized\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1;received=10.0.0.9;rport=5062\r\n\
To: <sip:bob@example.com>;tag=as1\r\n\
From: <sip:alice@example.com>;tag=x\r\n\
Call-ID: 77@10.0.0.1\r\n\
CSeq: 2 REGISTER\r\n\
WWW-Authenticate: Digest realm=\"example.com\",qop=\"auth,auth-int\",nonce=\"n1\",algorithm=MD5\r\n\
Authentication-Info: qop=auth,rspauth=\"abc\",cnonce=\"c\",nc=00000001\r\n\
Record-Route: <sip:p1.example.com;lr>\r\n\
Contact: *\r\n\
Content-Length: 0\r\n\r\n";
    let message = parse_message(response.as_bytes()).expect("parse response");
    let Message::Response(rs) = &message else {
        panic!("expected response");
    };
    assert_eq!(rs.status, 401);
    assert_eq!(rs.reason, "Unauthorized");
    assert_eq!(rs.headers.top_via().and_then(|v| v.params.value("rport")), Some("5062"));
    let challenge = &rs.headers.auth("www-authenticate")[0];
    assert_eq!(challenge.get_unquoted("qop").as_deref(), Some("auth,auth-int"));
    assert_eq!(
        rs.headers
            .auth_info("authentication-info")
            .and_then(|i| i.get_unquoted("rspauth")),
        Some("abc".to_string())
    );
    assert_eq!(rs.headers.text("contact"), Some("*"));

    let reparsed = parse_message(&message.to_bytes()).expect("reparse");
    assert_eq!(message, reparsed);
    assert!(message.to_string().contains("\r\nWWW-Authenticate: Digest realm="));
}

#[test]
fn test_content_length_recomputed() {
    let mut message = Message::Request(parse_invite());
    message.set_content(b"hello world".to_vec());
    assert!(message.to_string().contains("\r\nContent-Length: 11\r\n"));

    let mut rq = Request::new(Method::Options, "sip:example.com".parse().unwrap());
    rq.headers.insert("call-id", "abc");
    let text = Message::Request(rq).to_string();
    assert!(text.ends_with("Call-ID: abc\r\nContent-Length: 0\r\n\r\n"));
}

#[test]
fn test_malformed_messages() {
    assert!(parse_message(b"garbage\r\n\r\n").is_none());
    assert!(parse_message(b"INVITE sip:bob@example.com SIP/2.0\r\nVia: nonsense\r\n\r\n").is_none());
    assert!(parse_message(b"INVITE sip:bob@example.com SIP/2.0\r\nCSeq: 1 INVITE").is_none());

    let no_call_id = "OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1\r\n\
To: <sip:example.com>\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
CSeq: 1 OPTIONS\r\n\r\n";
    let message = parse_message(no_call_id.as_bytes()).expect("parse");
    assert!(!message.check());

    let mut complete = message.clone();
    complete.headers_mut().insert("Call-ID", "x@y");
    assert!(complete.check());
}

#[test]
fn test_uri() {
    let raw = "sips:alice:secret@[2001:db8::1]:5061;transport=tls;lr?subject=hi&priority=urgent";
    let uri: Uri = raw.parse().expect("uri");
    assert_eq!(uri.scheme, "sips");
    assert_eq!(uri.user.as_deref(), Some("alice"));
    assert_eq!(uri.password.as_deref(), Some("secret"));
    assert_eq!(uri.host, "[2001:db8::1]");
    assert_eq!(uri.host_unbracketed(), "2001:db8::1");
    assert_eq!(uri.port, Some(5061));
    assert_eq!(uri.transport().as_deref(), Some("tls"));
    assert!(uri.params.contains("lr"));
    assert_eq!(uri.headers.len(), 2);
    assert_eq!(uri.to_string(), raw);

    let plain: Uri = "sip:example.com".parse().expect("uri");
    assert_eq!(plain.user, None);
    assert_eq!(plain.port, None);
    assert!("not a uri".parse::<Uri>().is_err());
}

#[test]
fn test_quote_unquote() {
    for s in ["", "abc", "realm.example.com", "with space", "a,b;c=d"] {
        assert_eq!(unquote(&quote(s)), s);
    }
    assert_eq!(unquote("plain"), "plain");
}
