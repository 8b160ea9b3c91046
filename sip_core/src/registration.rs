use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{
    auth::{parse_challenge, ChallengeKind, DigestChallenge},
    dialog::{attach_body, base_request, new_tag, UaIdentity},
    message::{header_param, Header, Method, Request, Response},
    Result,
};

pub const REGISTER_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const REGISTER_BACKOFF_CAP: Duration = Duration::from_secs(64);
/// Consecutive failures after which the device reports itself not ready.
pub const NOT_READY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    Registered(u32),
    /// Challenge stored; resend with credentials now.
    AuthRequired,
    /// Challenged again after sending credentials.
    AuthFailed,
    Failed(u16),
}

#[derive(Debug)]
pub struct Registration {
    state: RegistrationState,
    cseq: u32,
    call_id: String,
    from_tag: String,
    requested_expires: u32,
    last_expires: u32,
    last_challenge: Option<DigestChallenge>,
    challenged: bool,
    failures: u32,
    next_attempt: Option<Instant>,
    outstanding: Option<u32>,
}

impl Registration {
    pub fn new(call_id: String, expires: u32) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            cseq: 0,
            call_id,
            from_tag: new_tag(),
            requested_expires: expires,
            last_expires: expires,
            last_challenge: None,
            challenged: false,
            failures: 0,
            next_attempt: None,
            outstanding: None,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_expires(&self) -> u32 {
        self.last_expires
    }

    pub fn last_challenge(&self) -> Option<&DigestChallenge> {
        self.last_challenge.as_ref()
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Arm the first attempt.
    pub fn begin(&mut self, now: Instant) {
        if self.state == RegistrationState::Unregistered {
            self.state = RegistrationState::Registering;
        }
        self.failures = 0;
        self.challenged = false;
        self.outstanding = None;
        self.next_attempt = Some(now);
    }

    /// True when a REGISTER (first attempt, retry or refresh) should go out now.
    pub fn due(&self, now: Instant) -> bool {
        self.outstanding.is_none() && self.next_attempt.is_some_and(|t| now >= t)
    }

    pub fn build_register(
        &mut self,
        identity: &UaIdentity,
        branch: &str,
        auth_header: Option<Header>,
    ) -> Result<Request> {
        let req = self.build(identity, branch, self.requested_expires, auth_header)?;
        self.outstanding = Some(self.cseq);
        self.next_attempt = None;
        if self.state != RegistrationState::Registered {
            self.state = RegistrationState::Registering;
        }
        Ok(req)
    }

    /// REGISTER with `Expires: 0`. Sent once on shutdown; not tracked.
    pub fn build_unregister(
        &mut self,
        identity: &UaIdentity,
        branch: &str,
        auth_header: Option<Header>,
    ) -> Result<Request> {
        self.build(identity, branch, 0, auth_header)
    }

    fn build(
        &mut self,
        identity: &UaIdentity,
        branch: &str,
        expires: u32,
        auth_header: Option<Header>,
    ) -> Result<Request> {
        self.cseq = self.cseq.wrapping_add(1);

        let aor = format!("<{}>", identity.aor());
        let from = format!("{};tag={}", aor, self.from_tag);
        let mut req = base_request(
            Method::Register,
            &identity.registrar_uri(),
            &identity.via(branch),
            &from,
            &aor,
            &self.call_id,
            self.cseq,
        )?;
        req.push_header("Contact", &identity.contact())?;
        req.push_header("Expires", &expires.to_string())?;
        if let Some(auth) = auth_header {
            req.add_header(auth)?;
        }
        attach_body(&mut req.headers, &mut req.body, None)?;
        Ok(req)
    }

    /// Feed a final response for one of our REGISTERs. Returns `None` when it
    /// answers something other than the outstanding request.
    pub fn handle_response(&mut self, resp: &Response, now: Instant) -> Option<RegistrationResult> {
        let (cseq, _) = resp.cseq()?;
        if self.outstanding != Some(cseq) || resp.is_provisional() {
            return None;
        }
        self.outstanding = None;

        let result = match resp.status_code {
            200..=299 => {
                let expires = granted_expires(resp).unwrap_or(self.requested_expires);
                self.last_expires = expires;
                self.state = RegistrationState::Registered;
                self.failures = 0;
                self.challenged = false;
                self.next_attempt = Some(now + Duration::from_secs(self.next_refresh_interval_secs()));
                info!("registered, expires {}s", expires);
                RegistrationResult::Registered(expires)
            }
            code @ (401 | 407) => {
                let challenge = ChallengeKind::from_status(code).and_then(|kind| {
                    let raw = resp.header(kind.challenge_header())?;
                    parse_challenge(kind, raw).ok()
                });
                match challenge {
                    Some(chal) if !self.challenged => {
                        debug!("REGISTER challenged by realm {}", chal.realm);
                        self.last_challenge = Some(chal);
                        self.challenged = true;
                        self.next_attempt = Some(now);
                        RegistrationResult::AuthRequired
                    }
                    Some(_) => {
                        warn!("REGISTER rejected after credentials");
                        self.fail(now);
                        RegistrationResult::AuthFailed
                    }
                    None => {
                        warn!("REGISTER {} without usable challenge", code);
                        self.fail(now);
                        RegistrationResult::Failed(code)
                    }
                }
            }
            code => {
                warn!("REGISTER failed with {}", code);
                self.fail(now);
                RegistrationResult::Failed(code)
            }
        };
        Some(result)
    }

    /// The outstanding REGISTER exhausted its retransmissions.
    pub fn on_timeout(&mut self, cseq: u32, now: Instant) -> Option<RegistrationResult> {
        if self.outstanding != Some(cseq) {
            return None;
        }
        self.outstanding = None;
        warn!("REGISTER timed out");
        self.fail(now);
        Some(RegistrationResult::Failed(408))
    }

    pub fn stop(&mut self) {
        self.state = RegistrationState::Unregistered;
        self.outstanding = None;
        self.next_attempt = None;
        self.failures = 0;
        self.challenged = false;
    }

    fn fail(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.state = RegistrationState::Registering;
        self.challenged = false;
        self.last_challenge = None;
        let delay = backoff(self.failures);
        debug!("next REGISTER attempt in {:?}", delay);
        self.next_attempt = Some(now + delay);
    }

    pub fn next_refresh_interval_secs(&self) -> u64 {
        let expires = self.last_expires.max(5);
        (expires as u64 * 8) / 10
    }
}

/// 1s, 2s, 4s ... capped at 64s.
pub fn backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(6);
    (REGISTER_BACKOFF_BASE * (1u32 << shift)).min(REGISTER_BACKOFF_CAP)
}

fn granted_expires(resp: &Response) -> Option<u32> {
    resp.header("Expires")
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            resp.header("Contact")
                .and_then(|c| header_param(c, "expires"))
                .and_then(|v| v.parse().ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::build_response;

    fn identity() -> UaIdentity {
        UaIdentity {
            user: "100".into(),
            domain: "192.0.2.1".into(),
            local_ip: "192.0.2.50".parse().unwrap(),
            local_port: 5060,
        }
    }

    fn reply(req: &Request, status: u16, extra: &[(&str, &str)]) -> Response {
        let mut resp = build_response(req, status, "X", Some("srv")).unwrap();
        for (name, value) in extra {
            resp.push_header(name, value).unwrap();
        }
        resp
    }

    #[test]
    fn registration_flow() {
        let now = Instant::now();
        let mut reg = Registration::new("reg-1".into(), 120);
        reg.begin(now);
        assert!(reg.due(now));

        let req = reg.build_register(&identity(), "z9hG4bK1", None).unwrap();
        assert_eq!(req.method, Method::Register);
        assert_eq!(req.header("Expires"), Some("120"));
        assert!(!reg.due(now));

        let resp = reply(&req, 200, &[("Expires", "100")]);
        assert_eq!(reg.handle_response(&resp, now), Some(RegistrationResult::Registered(100)));
        assert_eq!(reg.state(), RegistrationState::Registered);
        assert!(!reg.due(now + Duration::from_secs(79)));
        assert!(reg.due(now + Duration::from_secs(80)));
    }

    #[test]
    fn second_challenge_is_auth_failure() {
        let now = Instant::now();
        let mut reg = Registration::new("reg-2".into(), 3600);
        reg.begin(now);
        let challenge = [("WWW-Authenticate", "Digest realm=\"pbx\", nonce=\"n1\"")];

        let first = reg.build_register(&identity(), "z9hG4bK1", None).unwrap();
        assert_eq!(
            reg.handle_response(&reply(&first, 401, &challenge), now),
            Some(RegistrationResult::AuthRequired)
        );
        assert!(reg.due(now));
        assert_eq!(reg.last_challenge().map(|c| c.nonce.as_str()), Some("n1"));

        let second = reg.build_register(&identity(), "z9hG4bK2", None).unwrap();
        assert_eq!(second.cseq(), Some((2, Method::Register)));
        assert_eq!(
            reg.handle_response(&reply(&second, 401, &challenge), now),
            Some(RegistrationResult::AuthFailed)
        );
        assert_eq!(reg.failures(), 1);
        assert!(!reg.due(now));
        assert!(reg.due(now + REGISTER_BACKOFF_BASE));
    }

    #[test]
    fn stale_response_is_ignored() {
        let now = Instant::now();
        let mut reg = Registration::new("reg-3".into(), 3600);
        reg.begin(now);
        let first = reg.build_register(&identity(), "z9hG4bK1", None).unwrap();
        assert!(reg.on_timeout(1, now).is_some());
        let _second = reg.build_register(&identity(), "z9hG4bK2", None).unwrap();
        assert_eq!(reg.handle_response(&reply(&first, 200, &[]), now), None);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(7), Duration::from_secs(64));
        assert_eq!(backoff(40), Duration::from_secs(64));
    }
}
