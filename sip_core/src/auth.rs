use core::fmt::Write;

use md5::Digest;

use crate::{message::Header, Result, SipError};

/// Which challenge header a response carried; decides the credentials header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 with `WWW-Authenticate`.
    Www,
    /// 407 with `Proxy-Authenticate`.
    Proxy,
}

impl ChallengeKind {
    pub fn challenge_header(self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn credentials_header(self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(ChallengeKind::Www),
            407 => Some(ChallengeKind::Proxy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub opaque: Option<String>,
    /// Set when the server offered `qop=auth`; `auth-int` alone is treated as no qop.
    pub qop_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Per-request values for `qop=auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QopParams<'a> {
    pub cnonce: &'a str,
    pub nc: u32,
}

/// Parse a `WWW-Authenticate` or `Proxy-Authenticate` value.
pub fn parse_www_authenticate(input: &str) -> Result<DigestChallenge> {
    parse_challenge(ChallengeKind::Www, input)
}

pub fn parse_challenge(kind: ChallengeKind, input: &str) -> Result<DigestChallenge> {
    let mut parts = input.trim().splitn(2, ' ');
    let scheme = parts.next().ok_or(SipError::Invalid("auth scheme"))?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return Err(SipError::Invalid("auth scheme"));
    }
    let params = parts.next().ok_or(SipError::Invalid("auth params"))?;

    let mut realm: Option<String> = None;
    let mut nonce: Option<String> = None;
    let mut opaque: Option<String> = None;
    let mut algorithm = String::from("MD5");
    let mut qop_auth = false;

    for param in split_params(params) {
        let mut kv = param.trim().splitn(2, '=');
        let key = kv.next().ok_or(SipError::Invalid("auth key"))?.trim();
        let raw_val = kv
            .next()
            .ok_or(SipError::Invalid("auth value"))?
            .trim()
            .trim_matches('"');
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(raw_val.to_owned()),
            "nonce" => nonce = Some(raw_val.to_owned()),
            "opaque" => opaque = Some(raw_val.to_owned()),
            "algorithm" => {
                if !raw_val.eq_ignore_ascii_case("md5") {
                    return Err(SipError::Invalid("unsupported digest algorithm"));
                }
                algorithm = raw_val.to_owned();
            }
            "qop" => qop_auth = raw_val.split(',').any(|q| q.trim() == "auth"),
            _ => {}
        }
    }

    Ok(DigestChallenge {
        kind,
        realm: realm.ok_or(SipError::Invalid("realm"))?,
        nonce: nonce.ok_or(SipError::Invalid("nonce"))?,
        algorithm,
        opaque,
        qop_auth,
    })
}

/// Split on commas that are not inside a quoted string.
fn split_params(input: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;
    let mut start = 0;
    let mut out = Vec::new();
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&input[start..]);
    out.into_iter().filter(|p| !p.trim().is_empty())
}

/// Build the credentials header answering `challenge`. A fresh cnonce is drawn
/// when the challenge asks for `qop=auth`.
pub fn authorization_header(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
) -> Result<Header> {
    let cnonce = format!("{:08x}", rand::random::<u32>());
    let qop = challenge.qop_auth.then_some(QopParams {
        cnonce: &cnonce,
        nc: 1,
    });
    credentials_header(challenge, creds, method, uri, qop.as_ref())
}

pub fn credentials_header(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    qop: Option<&QopParams<'_>>,
) -> Result<Header> {
    let response = compute_digest_response(challenge, creds, method, uri, qop)?;
    let mut value = String::new();
    write!(
        value,
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
        creds.username, challenge.realm, challenge.nonce, uri, response, challenge.algorithm
    )
    .map_err(|_| SipError::Capacity)?;
    if let Some(qop) = qop {
        write!(value, ", qop=auth, cnonce=\"{}\", nc={:08x}", qop.cnonce, qop.nc)
            .map_err(|_| SipError::Capacity)?;
    }
    if let Some(opaque) = &challenge.opaque {
        write!(value, ", opaque=\"{}\"", opaque).map_err(|_| SipError::Capacity)?;
    }

    Header::new(challenge.kind.credentials_header(), &value)
}

pub fn compute_digest_response(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    qop: Option<&QopParams<'_>>,
) -> Result<String> {
    let mut a1 = String::new();
    write!(a1, "{}:{}:{}", creds.username, challenge.realm, creds.password)
        .map_err(|_| SipError::Capacity)?;
    let mut a2 = String::new();
    write!(a2, "{}:{}", method, uri).map_err(|_| SipError::Capacity)?;

    let ha1 = md5_hex(a1.as_bytes());
    let ha2 = md5_hex(a2.as_bytes());

    let mut combo = String::new();
    match qop {
        Some(q) => write!(
            combo,
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, challenge.nonce, q.nc, q.cnonce, ha2
        ),
        None => write!(combo, "{}:{}:{}", ha1, challenge.nonce, ha2),
    }
    .map_err(|_| SipError::Capacity)?;

    Ok(md5_hex(combo.as_bytes()))
}

fn md5_hex(data: &[u8]) -> String {
    let digest = md5::Md5::digest(data);
    let mut out = String::new();
    for b in &digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MUFASA: DigestCredentials<'static> = DigestCredentials {
        username: "Mufasa",
        password: "Circle Of Life",
    };

    #[test]
    fn digest_without_qop_matches_reference() {
        let challenge = parse_www_authenticate(
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5"#,
        )
        .unwrap();
        let header = authorization_header(&challenge, &MUFASA, "GET", "/dir/index.html").unwrap();
        assert_eq!(header.name.as_str(), "Authorization");
        assert!(
            header
                .value
                .contains("response=\"670fd8c2df070c60b045671b8b24ff02\""),
            "unexpected header: {}",
            header.value
        );
        assert!(!header.value.contains("qop"));
    }

    #[test]
    fn digest_with_qop_auth_matches_rfc2617() {
        let challenge = parse_challenge(
            ChallengeKind::Proxy,
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        assert!(challenge.qop_auth);
        assert_eq!(
            challenge.opaque.as_deref(),
            Some("5ccc069c403ebaf9f0171e9517f40e41")
        );

        let qop = QopParams {
            cnonce: "0a4f113b",
            nc: 1,
        };
        let header =
            credentials_header(&challenge, &MUFASA, "GET", "/dir/index.html", Some(&qop)).unwrap();
        assert_eq!(header.name.as_str(), "Proxy-Authorization");
        assert!(header
            .value
            .contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.value.contains("nc=00000001"));
        assert!(header
            .value
            .contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn rejects_basic_and_missing_nonce() {
        assert!(parse_www_authenticate("Basic realm=\"x\"").is_err());
        assert!(parse_www_authenticate("Digest realm=\"x\"").is_err());
        assert!(parse_www_authenticate("Digest realm=\"x\", nonce=\"n\", algorithm=SHA-256").is_err());
    }

    #[test]
    fn md5_round_trip_reference() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            md5_hex(b"The quick brown fox jumps over the lazy dog"),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }
}
