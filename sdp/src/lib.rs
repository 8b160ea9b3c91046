//! Minimal SDP offer/answer for a single audio stream.

use core::fmt::Write;
use std::net::{IpAddr, SocketAddr};

use log::debug;
use thiserror::Error;

/// Formats kept from one `m=` line.
pub const MAX_FORMATS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: String,
    pub session_id: u64,
    pub connection_address: String,
    pub media_port: u16,
    /// Payload types in the order the peer listed them.
    pub payload_types: heapless::Vec<u8, MAX_FORMATS>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("invalid SDP: {0}")]
    Invalid(String),
    #[error("no audio stream offered")]
    MissingMedia,
    #[error("no common codec (offered {offered:?})")]
    NoCommonCodec { offered: Vec<u8> },
}

impl SessionDescription {
    /// Offer (or answer) a single payload type on `address:port`.
    pub fn offer(address: IpAddr, port: u16, payload_type: u8, session_id: u64) -> Self {
        let mut payload_types = heapless::Vec::new();
        let _ = payload_types.push(payload_type);
        Self {
            origin: "-".into(),
            session_id,
            connection_address: address.to_string(),
            media_port: port,
            payload_types,
        }
    }

    pub fn payload_type(&self) -> Option<u8> {
        self.payload_types.first().copied()
    }

    pub fn media_endpoint(&self) -> Result<SocketAddr, SdpError> {
        let ip: IpAddr = self
            .connection_address
            .parse()
            .map_err(|_| SdpError::Invalid(format!("connection address {}", self.connection_address)))?;
        Ok(SocketAddr::new(ip, self.media_port))
    }

    pub fn render(&self) -> String {
        let addr_type = if self.connection_address.contains(':') {
            "IP6"
        } else {
            "IP4"
        };
        let mut out = String::new();
        let _ = write!(
            out,
            "v=0\r\no={} {} {} IN {} {}\r\ns=voip\r\nc=IN {} {}\r\nt=0 0\r\nm=audio {} RTP/AVP",
            self.origin,
            self.session_id,
            self.session_id,
            addr_type,
            self.connection_address,
            addr_type,
            self.connection_address,
            self.media_port
        );
        for pt in &self.payload_types {
            let _ = write!(out, " {}", pt);
        }
        out.push_str("\r\n");
        for pt in &self.payload_types {
            if let Some(name) = encoding_name(*pt) {
                let _ = write!(out, "a=rtpmap:{} {}/8000\r\n", pt, name);
            }
        }
        out.push_str("a=ptime:20\r\na=sendrecv\r\n");
        out
    }
}

pub fn parse(input: &str) -> Result<SessionDescription, SdpError> {
    let mut origin = None;
    let mut session_id = 0;
    let mut session_conn: Option<String> = None;
    let mut media_conn: Option<String> = None;
    let mut media: Option<(u16, heapless::Vec<u8, MAX_FORMATS>)> = None;
    let mut in_audio = false;

    for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((kind, value)) = line.split_once('=') else {
            return Err(SdpError::Invalid(format!("line without '=': {}", line)));
        };
        match kind {
            "o" => {
                let mut fields = value.split_whitespace();
                origin = fields.next().map(str::to_owned);
                session_id = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            }
            "c" => {
                let addr = parse_connection(value)?;
                if media.is_some() && in_audio {
                    media_conn = Some(addr);
                } else if media.is_none() {
                    session_conn = Some(addr);
                }
            }
            "m" => {
                in_audio = false;
                if media.is_some() {
                    continue;
                }
                let mut fields = value.split_whitespace();
                if fields.next() != Some("audio") {
                    continue;
                }
                let port: u16 = fields
                    .next()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| SdpError::Invalid("media port".into()))?;
                let _proto = fields.next();
                let mut formats = heapless::Vec::new();
                for fmt in fields {
                    let pt: u8 = fmt
                        .parse()
                        .map_err(|_| SdpError::Invalid(format!("payload type {}", fmt)))?;
                    if formats.push(pt).is_err() {
                        debug!("ignoring payload types beyond {}", MAX_FORMATS);
                        break;
                    }
                }
                media = Some((port, formats));
                in_audio = true;
            }
            _ => {}
        }
    }

    let (media_port, payload_types) = media.ok_or(SdpError::MissingMedia)?;
    if media_port == 0 || payload_types.is_empty() {
        return Err(SdpError::MissingMedia);
    }
    let connection_address = media_conn
        .or(session_conn)
        .ok_or_else(|| SdpError::Invalid("no connection address".into()))?;

    Ok(SessionDescription {
        origin: origin.unwrap_or_else(|| "-".into()),
        session_id,
        connection_address,
        media_port,
        payload_types,
    })
}

fn parse_connection(value: &str) -> Result<String, SdpError> {
    let mut fields = value.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some("IN"), Some("IP4" | "IP6"), Some(addr)) => {
            // Strip a multicast TTL suffix.
            Ok(addr.split('/').next().unwrap_or(addr).to_owned())
        }
        _ => Err(SdpError::Invalid(format!("connection line {}", value))),
    }
}

/// Choose the payload type to use against a peer's description.
///
/// `preferred` wins when the peer lists it; otherwise the first peer payload
/// type we also support is taken.
pub fn negotiate(remote: &SessionDescription, preferred: u8, supported: &[u8]) -> Result<u8, SdpError> {
    if remote.payload_types.contains(&preferred) {
        return Ok(preferred);
    }
    remote
        .payload_types
        .iter()
        .copied()
        .find(|pt| supported.contains(pt))
        .ok_or_else(|| SdpError::NoCommonCodec {
            offered: remote.payload_types.to_vec(),
        })
}

/// rtpmap encoding names for the static payload types we know about.
pub fn encoding_name(payload_type: u8) -> Option<&'static str> {
    match payload_type {
        0 => Some("PCMU"),
        3 => Some("GSM"),
        8 => Some("PCMA"),
        9 => Some("G722"),
        18 => Some("G729"),
        _ => None,
    }
}
