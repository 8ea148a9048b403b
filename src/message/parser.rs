use super::{
    header::{canonical_name, AuthParams, CSeq, HeaderValue, Headers, NameAddr, Via},
    uri::{Params, Uri},
    Message, Method, Request, Response,
};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag_no_case, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{all_consuming, map_res, opt, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

type HeaderParser = fn(&str, Option<HeaderValue>) -> Option<HeaderValue>;

/// Parser for each structured header; anything else stays opaque text.
fn header_parser(name: &str) -> HeaderParser {
    match name {
        "to" | "from" | "refer-to" => parse_address,
        "contact" => parse_contact,
        "route" | "record-route" | "path" => parse_address_list,
        "cseq" => parse_cseq,
        "content-length" => parse_content_length,
        "via" => parse_via,
        "www-authenticate" | "proxy-authenticate" | "authorization" | "proxy-authorization" => {
            parse_auth
        }
        "authentication-info" | "proxy-authentication-info" => parse_auth_info,
        _ => parse_text,
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

pub(crate) fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char).parse(input)
}

/// A quoted string, returned with its quotes.
pub(crate) fn quoted_string(input: &str) -> IResult<&str, &str> {
    let (rest, _) = char('"').parse(input)?;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => {
                let end = idx + 2;
                return Ok((&input[end..], &input[..end]));
            }
            _ => {}
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn comma(input: &str) -> IResult<&str, char> {
    delimited(space0, char(','), space0).parse(input)
}

fn slash(input: &str) -> IResult<&str, char> {
    delimited(space0, char('/'), space0).parse(input)
}

fn equals(input: &str) -> IResult<&str, char> {
    delimited(space0, char('='), space0).parse(input)
}

fn scheme(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        .parse(input)
}

fn userinfo(input: &str) -> IResult<&str, &str> {
    terminated(is_not("@;?<>, \t\r\n"), char('@')).parse(input)
}

fn host(input: &str) -> IResult<&str, &str> {
    alt((
        recognize(delimited(char('['), is_not("]"), char(']'))),
        is_not(":;?<>, \t\r\n"),
    ))
    .parse(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    map_res(preceded(char(':'), digit1), |d: &str| d.parse::<u16>()).parse(input)
}

fn uri_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (input, _) = char(';').parse(input)?;
    let (input, name) = is_not("=;?<>, \t\r\n").parse(input)?;
    let (input, value) = opt(preceded(char('='), is_not(";?<>, \t\r\n"))).parse(input)?;
    Ok((input, (name, value)))
}

fn uri_headers(input: &str) -> IResult<&str, Vec<(String, String)>> {
    let (input, raw) = preceded(char('?'), is_not("<>, \t\r\n")).parse(input)?;
    let headers = raw
        .split('&')
        .map(|h| match h.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (h.to_string(), String::new()),
        })
        .collect();
    Ok((input, headers))
}

/// Scheme, userinfo, host and port; no parameters.
fn uri_base(input: &str) -> IResult<&str, Uri> {
    let (input, scheme) = scheme(input)?;
    let (input, _) = char(':').parse(input)?;
    let (input, info) = opt(userinfo).parse(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port).parse(input)?;
    let (user, password) = match info.map(|i| i.split_once(':').unwrap_or((i, ""))) {
        Some((user, "")) => (Some(user.to_string()), None),
        Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
        None => (None, None),
    };
    Ok((
        input,
        Uri {
            scheme: scheme.to_ascii_lowercase(),
            user,
            password,
            host: host.to_string(),
            port,
            params: Params::new(),
            headers: vec![],
        },
    ))
}

pub(crate) fn uri(input: &str) -> IResult<&str, Uri> {
    let (input, mut uri) = uri_base(input)?;
    let (input, params) = many0(uri_param).parse(input)?;
    let (input, headers) = opt(uri_headers).parse(input)?;
    uri.params = params.into_iter().collect();
    uri.headers = headers.unwrap_or_default();
    Ok((input, uri))
}

fn header_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (input, _) = delimited(space0, char(';'), space0).parse(input)?;
    let (input, name) = token(input)?;
    let (input, value) =
        opt(preceded(equals, alt((quoted_string, is_not(";, \t\r\n"))))).parse(input)?;
    Ok((input, (name, value)))
}

fn header_params(input: &str) -> IResult<&str, Params> {
    let (input, params) = many0(header_param).parse(input)?;
    Ok((input, params.into_iter().collect()))
}

pub(crate) fn via(input: &str) -> IResult<&str, Via> {
    let (input, _) = space0(input)?;
    let (input, _) = tag_no_case("SIP").parse(input)?;
    let (input, _) = slash(input)?;
    let (input, version) = token(input)?;
    let (input, _) = slash(input)?;
    let (input, protocol) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(preceded(space0, port)).parse(input)?;
    let (input, params) = header_params(input)?;
    Ok((
        input,
        Via {
            version: version.to_string(),
            protocol: protocol.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

fn display_name(input: &str) -> IResult<&str, &str> {
    alt((quoted_string, recognize(separated_list1(space1, token)))).parse(input)
}

fn bracketed_address(input: &str) -> IResult<&str, NameAddr> {
    let (input, _) = space0(input)?;
    let (input, display_name) = opt(terminated(display_name, space0)).parse(input)?;
    let (input, uri) = map_res(
        delimited(char('<'), is_not(">"), char('>')),
        |s: &str| s.parse::<Uri>(),
    )
    .parse(input)?;
    let (input, params) = header_params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: display_name.map(str::to_string),
            uri,
            params,
        },
    ))
}

/// Bare addr-spec: parameters after the uri belong to the header.
fn bare_address(input: &str) -> IResult<&str, NameAddr> {
    let (input, _) = space0(input)?;
    let (input, uri) = uri_base(input)?;
    let (input, params) = header_params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: None,
            uri,
            params,
        },
    ))
}

pub(crate) fn name_addr(input: &str) -> IResult<&str, NameAddr> {
    alt((bracketed_address, bare_address)).parse(input)
}

fn cseq(input: &str) -> IResult<&str, CSeq> {
    let (input, _) = space0(input)?;
    let (input, seq) = map_res(digit1, |d: &str| d.parse::<u32>()).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, method) = token(input)?;
    Ok((
        input,
        CSeq {
            seq,
            method: Method::from(method),
        },
    ))
}

fn auth_param(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = token(input)?;
    let (input, _) = equals(input)?;
    let (input, value) = alt((quoted_string, is_not(", \t\r\n"))).parse(input)?;
    Ok((input, (name, value)))
}

fn auth_param_list(input: &str) -> IResult<&str, AuthParams> {
    let (input, _) = space0(input)?;
    let (input, list) = separated_list1(comma, auth_param).parse(input)?;
    let mut params = AuthParams::new(None);
    for (name, value) in list {
        params.set(&name.to_ascii_lowercase(), value);
    }
    Ok((input, params))
}

fn credentials(input: &str) -> IResult<&str, AuthParams> {
    let (input, _) = space0(input)?;
    let (input, scheme) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, mut params) = auth_param_list(input)?;
    params.scheme = Some(scheme.to_string());
    Ok((input, params))
}

/// Runs `parser` over the whole (trimmed) value.
fn complete<'a, O>(
    parser: impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
    input: &'a str,
) -> Option<O> {
    all_consuming(parser)
        .parse(input.trim())
        .ok()
        .map(|(_, out)| out)
}

pub(crate) fn parse_cseq_value(value: &str) -> Option<CSeq> {
    complete(cseq, value)
}

fn parse_address(value: &str, _: Option<HeaderValue>) -> Option<HeaderValue> {
    complete(name_addr, value).map(HeaderValue::Address)
}

fn address_list(value: &str, existing: Option<HeaderValue>) -> Option<Vec<NameAddr>> {
    let mut list = match existing {
        Some(HeaderValue::AddressList(list)) => list,
        _ => vec![],
    };
    list.extend(complete(separated_list1(comma, name_addr), value)?);
    Some(list)
}

fn parse_address_list(value: &str, existing: Option<HeaderValue>) -> Option<HeaderValue> {
    address_list(value, existing).map(HeaderValue::AddressList)
}

fn parse_contact(value: &str, existing: Option<HeaderValue>) -> Option<HeaderValue> {
    if value.trim() == "*" {
        return Some(HeaderValue::Text("*".to_string()));
    }
    parse_address_list(value, existing)
}

fn parse_cseq(value: &str, _: Option<HeaderValue>) -> Option<HeaderValue> {
    parse_cseq_value(value).map(HeaderValue::CSeq)
}

fn parse_content_length(value: &str, _: Option<HeaderValue>) -> Option<HeaderValue> {
    value.trim().parse().ok().map(HeaderValue::ContentLength)
}

fn parse_via(value: &str, existing: Option<HeaderValue>) -> Option<HeaderValue> {
    let mut vias = match existing {
        Some(HeaderValue::Via(vias)) => vias,
        _ => vec![],
    };
    vias.extend(complete(separated_list1(comma, via), value)?);
    Some(HeaderValue::Via(vias))
}

fn parse_auth(value: &str, existing: Option<HeaderValue>) -> Option<HeaderValue> {
    let mut list = match existing {
        Some(HeaderValue::Auth(list)) => list,
        _ => vec![],
    };
    list.push(complete(credentials, value)?);
    Some(HeaderValue::Auth(list))
}

fn parse_auth_info(value: &str, _: Option<HeaderValue>) -> Option<HeaderValue> {
    complete(auth_param_list, value).map(HeaderValue::AuthInfo)
}

/// Repeated generic headers are folded into one comma separated value.
fn parse_text(value: &str, existing: Option<HeaderValue>) -> Option<HeaderValue> {
    let value = value.trim();
    match existing {
        Some(HeaderValue::Text(prev)) => Some(HeaderValue::Text(format!("{},{}", prev, value))),
        _ => Some(HeaderValue::Text(value.to_string())),
    }
}

fn sip_version(input: &str) -> IResult<&str, &str> {
    preceded(
        tag_no_case("SIP/"),
        take_while1(|c: char| c.is_ascii_digit() || c == '.'),
    )
    .parse(input)
}

fn status_line(input: &str) -> IResult<&str, (&str, u16, &str)> {
    let (input, version) = sip_version(input)?;
    let (input, _) = space1(input)?;
    let (input, status) = map_res(digit1, |d: &str| d.parse::<u16>()).parse(input)?;
    let (reason, _) = space0(input)?;
    Ok(("", (version, status, reason.trim())))
}

fn request_line(input: &str) -> IResult<&str, (&str, Uri, &str)> {
    let (input, method) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = map_res(is_not(" \t"), |s: &str| s.parse::<Uri>()).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = sip_version(input)?;
    Ok((input.trim_end(), (method, uri, version)))
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = token(input)?;
    let (value, _) = delimited(space0, char(':'), space0).parse(input)?;
    Ok(("", (name, value)))
}

/// Splits the head into logical lines, unfolding continuation lines.
fn unfold(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = vec![];
    for line in head.split("\r\n") {
        match lines.last_mut() {
            Some(last) if line.starts_with([' ', '\t']) => {
                last.push(' ');
                last.push_str(line.trim_start());
            }
            _ => lines.push(line.to_string()),
        }
    }
    lines
}

/// Parses a message head (start line and headers, no blank line).
pub(crate) fn parse_head(head: &str) -> Option<Message> {
    let lines = unfold(head.trim_start());
    let (start, header_lines) = lines.split_first()?;

    let mut headers = Headers::new();
    for line in header_lines {
        if line.is_empty() {
            continue;
        }
        let (_, (name, value)) = header_line(line).ok()?;
        let name = canonical_name(name);
        let existing = headers.remove(&name);
        let parsed = header_parser(&name)(value, existing)?;
        headers.insert(&name, parsed);
    }

    if let Ok((_, (version, status, reason))) = all_consuming(status_line).parse(start.as_str()) {
        return Some(Message::Response(Response {
            status,
            reason: reason.to_string(),
            version: version.to_string(),
            headers,
            content: vec![],
        }));
    }
    let (_, (method, uri, version)) = all_consuming(request_line).parse(start.as_str()).ok()?;
    Some(Message::Request(Request {
        method: Method::from(method),
        uri,
        version: version.to_string(),
        headers,
        content: vec![],
    }))
}

pub(crate) fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses a complete datagram. The body is truncated to Content-Length.
pub fn parse_message(data: &[u8]) -> Option<Message> {
    let head_end = find_head_end(data)?;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let body = &data[head_end + 4..];
    let mut message = parse_head(head)?;
    let len = match message.headers().content_length() {
        Some(len) => len.min(body.len()),
        None => body.len(),
    };
    message.set_content(body[..len].to_vec());
    Some(message)
}
