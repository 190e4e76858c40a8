//! SIP message model and the monitoring parser.
//!
//! The correlation core only needs the start line and the handful of
//! headers that identify transactions and dialogs: `Call-ID`, `From`, `To`,
//! `CSeq` and the topmost `Via`. Header text is decoded as ISO-8859-1 since
//! SIP-I embeds binary ISUP and decoding must preserve every byte.

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

const SIPV2: &str = "SIP/2.0";

/// The known SIP method set. Messages whose CSeq method is outside this set
/// are dropped by the message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Notify,
    Message,
    Options,
    Subscribe,
    Info,
    Update,
    Refer,
    Prack,
    Publish,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "INVITE" => Some(Method::Invite),
            "ACK" => Some(Method::Ack),
            "BYE" => Some(Method::Bye),
            "CANCEL" => Some(Method::Cancel),
            "REGISTER" => Some(Method::Register),
            "NOTIFY" => Some(Method::Notify),
            "MESSAGE" => Some(Method::Message),
            "OPTIONS" => Some(Method::Options),
            "SUBSCRIBE" => Some(Method::Subscribe),
            "INFO" => Some(Method::Info),
            "UPDATE" => Some(Method::Update),
            "REFER" => Some(Method::Refer),
            "PRACK" => Some(Method::Prack),
            "PUBLISH" => Some(Method::Publish),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Notify => "NOTIFY",
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Prack => "PRACK",
            Method::Publish => "PUBLISH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `CSeq` header: sequence number and method token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub num: u32,
    pub method: String,
}

impl CSeq {
    pub fn known_method(&self) -> Option<Method> {
        Method::from_token(&self.method)
    }
}

/// A raw header line, name and value both ISO-8859-1 decoded.
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header collection with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }
}

/// A SIP Request-Line; the method is kept as its raw token.
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
}

/// A SIP Status-Line.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum StartLine {
    Request(RequestLine),
    Status(StatusLine),
}

/// A parsed SIP message: start line, headers, untouched body bytes.
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipMessage {
    /// Parses a SIP message out of a captured payload.
    ///
    /// The header section is decoded byte-for-byte (ISO-8859-1); the body is
    /// carried as-is.
    pub fn parse(payload: &Bytes) -> Result<Self> {
        let (head_len, body_start) = match find_body_split(payload) {
            Some(split) => split,
            None => (payload.len(), payload.len()),
        };
        let head = latin1(&payload[..head_len]);
        let body = payload.slice(body_start..);

        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
        let start_line = lines.next().filter(|line| !line.is_empty()).ok_or_else(|| {
            Error::SipParse("empty message".to_string())
        })?;
        let start = parse_start_line(start_line)?;

        let mut headers = Headers::default();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header value.
                if let Some(last) = headers.0.last_mut() {
                    last.value.push(' ');
                    last.value.push_str(line.trim());
                }
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::SipParse(format!("malformed header line '{line}'")));
            };
            headers.push(expand_compact(name.trim()), value.trim());
        }

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Status(_))
    }

    /// Response status code, if this is a response.
    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Status(status) => Some(status.code),
            StartLine::Request(_) => None,
        }
    }

    /// Request method token, if this is a request.
    pub fn request_method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request(line) => Some(&line.method),
            StartLine::Status(_) => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn from(&self) -> Option<&str> {
        self.headers.get("From")
    }

    pub fn to(&self) -> Option<&str> {
        self.headers.get("To")
    }

    pub fn from_uri(&self) -> Option<&str> {
        self.from().map(uri_of)
    }

    pub fn to_uri(&self) -> Option<&str> {
        self.to().map(uri_of)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from().and_then(|value| param_of(value, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to().and_then(|value| param_of(value, "tag"))
    }

    pub fn cseq(&self) -> Option<CSeq> {
        let value = self.headers.get("CSeq")?;
        let mut parts = value.split_whitespace();
        let num = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some(CSeq { num, method })
    }

    /// `branch` parameter of the topmost `Via`.
    pub fn top_via_branch(&self) -> Option<&str> {
        let via = self.headers.get("Via")?;
        // Only the first hop counts; a combined header lists hops
        // comma-separated.
        let top = via.split(',').next()?;
        param_of(top, "branch")
    }
}

/// Byte-preserving ISO-8859-1 decode.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Returns `(header_section_len, body_offset)`.
fn find_body_split(payload: &[u8]) -> Option<(usize, usize)> {
    if let Some(i) = payload.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((i, i + 4));
    }
    payload
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| (i, i + 2))
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix(SIPV2) {
        let mut parts = rest.trim_start().splitn(2, ' ');
        let code = parts
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| Error::SipParse(format!("bad status line '{line}'")))?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(StartLine::Status(StatusLine { code, reason }));
    }

    let mut parts = line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version)) => (method, uri, version),
        _ => return Err(Error::SipParse(format!("bad request line '{line}'"))),
    };
    if version != SIPV2 {
        return Err(Error::SipParse(format!("unsupported version '{version}'")));
    }
    Ok(StartLine::Request(RequestLine {
        method: method.to_string(),
        uri: uri.to_string(),
    }))
}

/// Expands RFC 3261 compact header names.
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "c" | "C" => "Content-Type",
        "l" | "L" => "Content-Length",
        "e" | "E" => "Content-Encoding",
        "s" | "S" => "Subject",
        "k" | "K" => "Supported",
        other => other,
    }
}

/// The URI part of a `From`/`To` value: the `<...>` content when present,
/// otherwise the value up to the first parameter.
fn uri_of(value: &str) -> &str {
    if let Some(open) = value.find('<') {
        let rest = &value[open + 1..];
        match rest.find('>') {
            Some(close) => &rest[..close],
            None => rest,
        }
    } else {
        value.split(';').next().unwrap_or(value).trim()
    }
}

/// A `;name=value` parameter outside the `<...>` bracket.
fn param_of<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(close) => &value[close + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        (key.trim().eq_ignore_ascii_case(name)).then(|| val.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &[u8] = b"OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKhjhs8ass877\r\n\
        Max-Forwards: 70\r\n\
        To: <sip:carol@chicago.com>\r\n\
        From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 63104 OPTIONS\r\n\
        Contact: <sip:alice@pc33.atlanta.com>\r\n\
        Content-Length: 0\r\n\r\n";

    const RINGING: &[u8] = b"SIP/2.0 180 Ringing\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds;received=192.0.2.1\r\n\
        To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
        From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
        CSeq: 314159 INVITE\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let msg = SipMessage::parse(&Bytes::from_static(OPTIONS)).unwrap();

        assert!(msg.is_request());
        assert_eq!(msg.request_method(), Some("OPTIONS"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710"));
        assert_eq!(msg.to_uri(), Some("sip:carol@chicago.com"));
        assert_eq!(msg.from_tag(), Some("1928301774"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.top_via_branch(), Some("z9hG4bKhjhs8ass877"));

        let cseq = msg.cseq().unwrap();
        assert_eq!(cseq.num, 63104);
        assert_eq!(cseq.method, "OPTIONS");
        assert_eq!(cseq.known_method(), Some(Method::Options));
    }

    #[test]
    fn test_parse_response() {
        let msg = SipMessage::parse(&Bytes::from_static(RINGING)).unwrap();

        assert!(msg.is_response());
        assert_eq!(msg.status_code(), Some(180));
        assert_eq!(msg.to_tag(), Some("a6c85cf"));
        assert_eq!(msg.top_via_branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(msg.cseq().unwrap().method, "INVITE");
    }

    #[test]
    fn test_compact_headers_expand() {
        let raw = Bytes::from_static(
            b"MESSAGE sip:bob@b.com SIP/2.0\r\n\
            i: xyz-1\r\n\
            f: <sip:a@a.com>;tag=1\r\n\
            t: <sip:bob@b.com>\r\n\
            v: SIP/2.0/UDP a.com;branch=z9hG4bK1\r\n\
            CSeq: 1 MESSAGE\r\n\r\nhello",
        );
        let msg = SipMessage::parse(&raw).unwrap();

        assert_eq!(msg.call_id(), Some("xyz-1"));
        assert_eq!(msg.from_uri(), Some("sip:a@a.com"));
        assert_eq!(msg.to_uri(), Some("sip:bob@b.com"));
        assert_eq!(msg.top_via_branch(), Some("z9hG4bK1"));
        assert_eq!(&msg.body[..], b"hello");
    }

    #[test]
    fn test_folded_header_joins() {
        let raw = Bytes::from_static(
            b"INVITE sip:b@b.com SIP/2.0\r\n\
            Call-ID: abc\r\n\
            Subject: first line\r\n\
            \tsecond line\r\n\
            CSeq: 1 INVITE\r\n\r\n",
        );
        let msg = SipMessage::parse(&raw).unwrap();

        assert_eq!(msg.headers.get("Subject"), Some("first line second line"));
    }

    #[test]
    fn test_body_bytes_preserved() {
        // SIP-I style: binary body that is not valid UTF-8.
        let mut raw = Vec::from(&b"INFO sip:b@b.com SIP/2.0\r\nCall-ID: abc\r\n\r\n"[..]);
        raw.extend_from_slice(&[0x01, 0x00, 0xFF, 0xFE, 0x80]);
        let msg = SipMessage::parse(&Bytes::from(raw)).unwrap();

        assert_eq!(&msg.body[..], &[0x01, 0x00, 0xFF, 0xFE, 0x80]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_matches!(
            SipMessage::parse(&Bytes::from_static(b"not sip at all")),
            Err(Error::SipParse(_))
        );
        assert_matches!(
            SipMessage::parse(&Bytes::from_static(b"")),
            Err(Error::SipParse(_))
        );
    }

    #[test]
    fn test_uri_without_brackets() {
        let raw = Bytes::from_static(
            b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
            To: sip:bob@biloxi.com\r\n\
            From: sip:bob@biloxi.com;tag=456248\r\n\
            Call-ID: 843817637684230@998sdasdh09\r\n\
            CSeq: 1826 REGISTER\r\n\r\n",
        );
        let msg = SipMessage::parse(&raw).unwrap();

        assert_eq!(msg.to_uri(), Some("sip:bob@biloxi.com"));
        assert_eq!(msg.from_tag(), Some("456248"));
    }
}
