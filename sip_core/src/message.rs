use core::fmt::Write;
use heapless::{String, Vec};

use crate::{Result, SipError};

pub const MAX_URI_LEN: usize = 128;
pub const MAX_HEADER_NAME: usize = 32;
pub const MAX_HEADER_VALUE: usize = 384;
pub const MAX_REASON_LEN: usize = 64;
pub const MAX_BODY_LEN: usize = 1024;
pub const MAX_HEADERS: usize = 24;
pub const MAX_MESSAGE_LEN: usize = 4096;

pub type SmallString<const N: usize> = String<N>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const SIP_2_0: Version = Version { major: 2, minor: 0 };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmallString<MAX_HEADER_NAME>,
    pub value: SmallString<MAX_HEADER_VALUE>,
}

pub type HeaderList = Vec<Header, MAX_HEADERS>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SmallString<MAX_URI_LEN>,
    pub version: Version,
    pub headers: HeaderList,
    pub body: SmallString<MAX_BODY_LEN>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status_code: u16,
    pub reason: SmallString<MAX_REASON_LEN>,
    pub headers: HeaderList,
    pub body: SmallString<MAX_BODY_LEN>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Header {
    pub fn new(name: &str, value: &str) -> Result<Self> {
        let mut name_buf: SmallString<MAX_HEADER_NAME> = SmallString::new();
        name_buf.push_str(name).map_err(|_| SipError::Capacity)?;
        let mut value_buf: SmallString<MAX_HEADER_VALUE> = SmallString::new();
        value_buf.push_str(value).map_err(|_| SipError::Capacity)?;
        Ok(Header {
            name: name_buf,
            value: value_buf,
        })
    }
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        let mut uri_buf: SmallString<MAX_URI_LEN> = SmallString::new();
        uri_buf.push_str(uri).map_err(|_| SipError::Capacity)?;

        Ok(Self {
            method,
            uri: uri_buf,
            version: Version::SIP_2_0,
            headers: HeaderList::new(),
            body: SmallString::new(),
        })
    }

    pub fn add_header(&mut self, header: Header) -> Result<()> {
        self.headers.push(header).map_err(|_| SipError::Capacity)
    }

    pub fn push_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.add_header(Header::new(name, value)?)
    }

    pub fn set_body(&mut self, body: &str) -> Result<()> {
        self.body.clear();
        self.body.push_str(body).map_err(|_| SipError::Capacity)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.header("CSeq").and_then(parse_cseq)
    }

    pub fn render<const N: usize>(&self) -> Result<SmallString<N>> {
        let mut out: SmallString<N> = SmallString::new();
        write!(
            out,
            "{} {} SIP/{}.{}\r\n",
            self.method, self.uri, self.version.major, self.version.minor
        )
        .map_err(|_| SipError::Capacity)?;
        for header in &self.headers {
            write!(out, "{}: {}\r\n", header.name, header.value)
                .map_err(|_| SipError::Capacity)?;
        }
        write!(out, "\r\n{}", self.body).map_err(|_| SipError::Capacity)?;
        Ok(out)
    }
}

impl Response {
    pub fn new(status_code: u16, reason: &str) -> Result<Self> {
        let mut reason_buf: SmallString<MAX_REASON_LEN> = SmallString::new();
        reason_buf
            .push_str(reason)
            .map_err(|_| SipError::Capacity)?;

        Ok(Self {
            version: Version::SIP_2_0,
            status_code,
            reason: reason_buf,
            headers: HeaderList::new(),
            body: SmallString::new(),
        })
    }

    pub fn add_header(&mut self, header: Header) -> Result<()> {
        self.headers.push(header).map_err(|_| SipError::Capacity)
    }

    pub fn push_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.add_header(Header::new(name, value)?)
    }

    pub fn set_body(&mut self, body: &str) -> Result<()> {
        self.body.clear();
        self.body.push_str(body).map_err(|_| SipError::Capacity)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.header("CSeq").and_then(parse_cseq)
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn render<const N: usize>(&self) -> Result<SmallString<N>> {
        let mut out: SmallString<N> = SmallString::new();
        write!(
            out,
            "SIP/{}.{} {} {}\r\n",
            self.version.major, self.version.minor, self.status_code, self.reason
        )
        .map_err(|_| SipError::Capacity)?;

        for header in &self.headers {
            write!(out, "{}: {}\r\n", header.name, header.value)
                .map_err(|_| SipError::Capacity)?;
        }
        write!(out, "\r\n{}", self.body).map_err(|_| SipError::Capacity)?;
        Ok(out)
    }
}

impl Message {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::Request(r) => r.call_id(),
            Message::Response(r) => r.call_id(),
        }
    }
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
        }
    }
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse one datagram. Requests and responses must carry the headers every
/// transaction needs (Via, From, To, Call-ID, CSeq); anything else is
/// rejected here so callers never see a half-formed message.
pub fn parse_message(input: &str) -> Result<Message> {
    let input = input.trim_start_matches(['\r', '\n']);
    let (head, body) = split_head_body(input);
    let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));
    let first = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or(SipError::Invalid("empty message"))?;

    let message = if first.starts_with("SIP/") {
        parse_response(first, &mut lines, body)?
    } else {
        parse_request(first, &mut lines, body)?
    };

    check_mandatory(&message)?;
    Ok(message)
}

fn split_head_body(input: &str) -> (&str, &str) {
    if let Some(pos) = input.find("\r\n\r\n") {
        (&input[..pos], &input[pos + 4..])
    } else if let Some(pos) = input.find("\n\n") {
        (&input[..pos], &input[pos + 2..])
    } else {
        (input, "")
    }
}

fn parse_request<'a, I>(start_line: &str, lines: &mut I, body: &str) -> Result<Message>
where
    I: Iterator<Item = &'a str>,
{
    let mut parts = start_line.split_whitespace();
    let method = parts.next().ok_or(SipError::Invalid("missing method"))?;
    let uri = parts.next().ok_or(SipError::Invalid("missing uri"))?;
    let version = parts.next().ok_or(SipError::Invalid("missing version"))?;
    if version != "SIP/2.0" {
        return Err(SipError::Invalid("unsupported version"));
    }

    let mut req = Request::new(parse_method(method)?, uri)?;
    parse_headers(lines, &mut req.headers)?;
    set_checked_body(&req.headers, body, &mut req.body)?;
    Ok(Message::Request(req))
}

fn parse_response<'a, I>(start_line: &str, lines: &mut I, body: &str) -> Result<Message>
where
    I: Iterator<Item = &'a str>,
{
    let mut parts = start_line.split_whitespace();
    let version = parts.next().ok_or(SipError::Invalid("missing version"))?;
    if version != "SIP/2.0" {
        return Err(SipError::Invalid("unsupported version"));
    }
    let status: u16 = parts
        .next()
        .ok_or(SipError::Invalid("missing status"))?
        .parse()
        .map_err(|_| SipError::Invalid("status parse"))?;
    if !(100..700).contains(&status) {
        return Err(SipError::Invalid("status out of range"));
    }

    let mut reason: SmallString<MAX_REASON_LEN> = SmallString::new();
    for part in parts {
        if !reason.is_empty() {
            reason.push(' ').map_err(|_| SipError::Capacity)?;
        }
        reason.push_str(part).map_err(|_| SipError::Capacity)?;
    }

    let mut resp = Response::new(status, &reason)?;
    parse_headers(lines, &mut resp.headers)?;
    set_checked_body(&resp.headers, body, &mut resp.body)?;
    Ok(Message::Response(resp))
}

fn parse_headers<'a, I>(lines: &mut I, headers: &mut HeaderList) -> Result<()>
where
    I: Iterator<Item = &'a str>,
{
    for line in lines {
        if line.is_empty() {
            break;
        }

        // Folded continuation of the previous header.
        if line.starts_with([' ', '\t']) {
            let last = headers
                .last_mut()
                .ok_or(SipError::Invalid("continuation without header"))?;
            last.value.push(' ').map_err(|_| SipError::Capacity)?;
            last.value
                .push_str(line.trim())
                .map_err(|_| SipError::Capacity)?;
            continue;
        }

        let mut parts = line.splitn(2, ':');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(SipError::Invalid("header name"))?;
        let value = parts
            .next()
            .ok_or(SipError::Invalid("header value"))?
            .trim();
        headers
            .push(Header::new(canonical_name(name), value)?)
            .map_err(|_| SipError::Capacity)?;
    }

    Ok(())
}

fn set_checked_body(
    headers: &HeaderList,
    raw: &str,
    body: &mut SmallString<MAX_BODY_LEN>,
) -> Result<()> {
    let content = match header_value(headers, "Content-Length") {
        Some(len) => {
            let len: usize = len
                .parse()
                .map_err(|_| SipError::Invalid("content length"))?;
            if len > raw.len() {
                return Err(SipError::Invalid("truncated body"));
            }
            raw.get(..len).ok_or(SipError::Invalid("content length"))?
        }
        None => raw,
    };

    body.clear();
    body.push_str(content).map_err(|_| SipError::Capacity)
}

fn check_mandatory(message: &Message) -> Result<()> {
    let headers = match message {
        Message::Request(r) => &r.headers,
        Message::Response(r) => &r.headers,
    };

    for name in ["Via", "From", "To", "Call-ID"] {
        if header_value(headers, name).is_none() {
            return Err(SipError::Invalid("missing mandatory header"));
        }
    }

    let (_, cseq_method) = header_value(headers, "CSeq")
        .and_then(parse_cseq)
        .ok_or(SipError::Invalid("missing or bad CSeq"))?;

    if let Message::Request(req) = message {
        if cseq_method != req.method {
            return Err(SipError::Invalid("CSeq method mismatch"));
        }
    }
    Ok(())
}

fn canonical_name(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        _ => name,
    }
}

fn parse_method(input: &str) -> Result<Method> {
    match input {
        "REGISTER" => Ok(Method::Register),
        "INVITE" => Ok(Method::Invite),
        "ACK" => Ok(Method::Ack),
        "BYE" => Ok(Method::Bye),
        "CANCEL" => Ok(Method::Cancel),
        "OPTIONS" => Ok(Method::Options),
        "INFO" => Ok(Method::Info),
        _ => Err(SipError::Invalid("unknown method")),
    }
}

pub fn header_value<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// "42 INVITE" -> (42, Invite)
pub fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse::<u32>().ok()?;
    let method = parse_method(parts.next()?).ok()?;
    Some((number, method))
}

/// Best-effort Call-ID extraction from a datagram that failed to parse.
pub fn sniff_call_id(input: &str) -> Option<&str> {
    input.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("Call-ID") || name == "i" {
            Some(value.trim()).filter(|v| !v.is_empty())
        } else {
            None
        }
    })
}

/// Extract the `tag` parameter from a From/To header value.
pub fn tag_param(value: &str) -> Option<&str> {
    header_param(value, "tag")
}

/// Look up a `;name=value` parameter outside the angle-bracketed URI.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// The URI inside a name-addr (`"Bob" <sip:bob@host>;tag=1` -> `sip:bob@host`).
pub fn addr_spec(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}
