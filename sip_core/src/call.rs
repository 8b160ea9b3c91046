use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    auth::{authorization_header, parse_challenge, ChallengeKind, DigestChallenge, DigestCredentials},
    dialog::{attach_body, build_response, new_branch, new_call_id, new_tag, Call, DialogRole, UaIdentity},
    message::{parse_message, sniff_call_id, Header, Message, Method, Request, Response, MAX_MESSAGE_LEN},
    registration::{Registration, RegistrationResult, RegistrationState, NOT_READY_THRESHOLD},
    transaction::{
        ClientTransactions, ClientTxEvent, InviteServerTransactionManager, ResponseMatch,
        ServerTxEvent, TransactionKey, T1,
    },
    Result, SipError, ALLOW,
};

/// How long an ended call's identifiers are kept to absorb retransmissions.
pub const ENDED_GRACE: Duration = T1;

/// Everything the signalling core needs from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipConfig {
    pub server: SocketAddr,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub rtp_port: u16,
    pub user: String,
    pub password: String,
    /// The one payload type we offer.
    pub payload_type: u8,
    /// Payload types the media path can decode, accepted in answers.
    pub supported_payload_types: Vec<u8>,
    pub register_expires: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    #[default]
    Idle,
    Registering,
    Registered,
    Ringing,
    Inviting,
    Established,
    Ending,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("authentication failed")]
    Auth,
    #[error("no common codec")]
    Negotiation,
    #[error("transaction timed out")]
    TransactionTimeout,
    #[error("rejected with status {0}")]
    Rejected(u16),
    #[error("malformed message for the active call")]
    Malformed,
}

/// Pure signals for the host automation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Ringing,
    CallEstablished,
    CallEnded,
    Ready,
    NotReady,
    Failed(Failure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaParams {
    pub remote: SocketAddr,
    pub payload_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    Send { dest: SocketAddr, payload: String },
    Lifecycle(LifecycleEvent),
    MediaStart(MediaParams),
    MediaStop,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SipStats {
    pub parse_errors: u32,
    pub unmatched_responses: u32,
    pub retransmissions: u32,
    pub auth_failures: u32,
    pub transaction_timeouts: u32,
    pub rejected_invites: u32,
}

#[derive(Debug)]
struct EndedCall {
    call: Call,
    until: Instant,
}

/// Registration plus at most one call. Single writer of all call state;
/// performs no I/O and returns what has to be sent or announced.
#[derive(Debug)]
pub struct CallStateMachine {
    config: SipConfig,
    identity: UaIdentity,
    registration: Registration,
    started: bool,
    ready: Option<bool>,
    call: Option<Call>,
    ended: Option<EndedCall>,
    client_tx: ClientTransactions,
    server_tx: InviteServerTransactionManager,
    stats: SipStats,
    session_id: u64,
}

impl CallStateMachine {
    pub fn new(config: SipConfig) -> Self {
        let identity = UaIdentity {
            user: config.user.clone(),
            domain: config.server.ip().to_string(),
            local_ip: config.local_ip,
            local_port: config.local_port,
        };
        let registration = Registration::new(new_call_id(config.local_ip), config.register_expires);
        Self {
            identity,
            registration,
            started: false,
            ready: None,
            call: None,
            ended: None,
            client_tx: ClientTransactions::new(),
            server_tx: InviteServerTransactionManager::new(),
            stats: SipStats::default(),
            session_id: u64::from(rand::random::<u32>()),
            config,
        }
    }

    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    pub fn identity(&self) -> &UaIdentity {
        &self.identity
    }

    pub fn stats(&self) -> SipStats {
        self.stats
    }

    pub fn call(&self) -> Option<&Call> {
        self.call.as_ref()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn state(&self) -> CallState {
        if let Some(call) = &self.call {
            return call.state;
        }
        if self.ended.is_some() {
            return CallState::Ended;
        }
        match self.registration.state() {
            RegistrationState::Registered => CallState::Registered,
            RegistrationState::Registering => CallState::Registering,
            RegistrationState::Unregistered if self.started => CallState::Registering,
            RegistrationState::Unregistered => CallState::Idle,
        }
    }

    pub fn start(&mut self, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        if self.started {
            return events;
        }
        info!("registering {} with {}", self.identity.aor(), self.config.server);
        self.started = true;
        self.registration.begin(now);
        self.drive_registration(now, &mut events);
        events
    }

    /// Hang up any call and withdraw the registration.
    pub fn stop(&mut self, now: Instant) -> Vec<CoreEvent> {
        let mut events = self.hangup(now);
        if !self.started {
            return events;
        }

        if self.registration.state() == RegistrationState::Registered {
            let auth = self.register_credentials();
            match self
                .registration
                .build_unregister(&self.identity, &new_branch(), auth)
            {
                Ok(req) => self.emit_request(&req, false, now, &mut events),
                Err(e) => warn!("failed to build unREGISTER: {}", e),
            }
        }
        info!("registration stopped");
        self.registration.stop();
        self.started = false;
        self.set_ready(false, &mut events);
        events
    }

    pub fn dial(
        &mut self,
        target: &str,
        display_name: Option<&str>,
        now: Instant,
    ) -> Result<Vec<CoreEvent>> {
        if self.registration.state() != RegistrationState::Registered {
            return Err(SipError::NotRegistered);
        }
        if self.call.is_some() {
            return Err(SipError::Busy);
        }
        if target.trim().is_empty() {
            return Err(SipError::Invalid("empty dial target"));
        }

        let mut call = Call::outgoing(&self.identity, target, display_name, now);
        let sdp = self.local_sdp(self.config.payload_type);
        let req = call.build_invite(&self.identity, &sdp, None)?;
        info!("dialing {}", call.remote_target);
        self.call = Some(call);

        let mut events = Vec::new();
        self.emit_request(&req, true, now, &mut events);
        Ok(events)
    }

    pub fn answer(&mut self, now: Instant) -> Result<Vec<CoreEvent>> {
        let mut events = Vec::new();
        let call = self
            .call
            .as_mut()
            .filter(|c| c.role == DialogRole::Uas && c.state == CallState::Ringing)
            .ok_or(SipError::InvalidState("no ringing call to answer"))?;
        if call.answered {
            return Ok(events);
        }

        let pt = call.payload_type.unwrap_or(self.config.payload_type);
        let sdp = sdp::SessionDescription::offer(self.config.local_ip, self.config.rtp_port, pt, self.session_id)
            .render();
        let resp = call.invite_response(&self.identity, 200, "OK", Some(&sdp))?;
        call.answered = true;
        let dest = call.invite_source.unwrap_or(self.config.server);
        info!("answering call {}", call.call_id());

        self.server_tx.on_outgoing_response(&resp, dest, now);
        self.emit_response(&resp, dest, &mut events);
        Ok(events)
    }

    /// Safe from any state. BYE only goes out for an established (or answered) call.
    pub fn hangup(&mut self, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let Some(call) = self.call.as_ref() else {
            return events;
        };

        match (call.role, call.state, call.answered) {
            (_, CallState::Established, _) | (DialogRole::Uas, CallState::Ringing, true) => {
                info!("hanging up call {}", call.call_id());
                self.send_bye(now, &mut events);
            }
            (DialogRole::Uas, CallState::Ringing, false) => {
                info!("declining call {}", call.call_id());
                let dest = call.invite_source.unwrap_or(self.config.server);
                match call.invite_response(&self.identity, 603, "Decline", None) {
                    Ok(resp) => {
                        self.server_tx.on_outgoing_response(&resp, dest, now);
                        self.emit_response(&resp, dest, &mut events);
                    }
                    Err(e) => warn!("failed to build 603: {}", e),
                }
                self.end_call(None, now, &mut events);
            }
            (DialogRole::Uac, CallState::Inviting, _) => {
                info!("cancelling call {}", call.call_id());
                match call.build_cancel() {
                    Ok(req) => self.emit_request(&req, true, now, &mut events),
                    Err(e) => warn!("failed to build CANCEL: {}", e),
                }
                self.end_call(None, now, &mut events);
            }
            _ => debug!("hangup ignored in {:?}", call.state),
        }
        events
    }

    /// Feed one raw datagram from the SIP socket.
    pub fn on_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let Ok(text) = core::str::from_utf8(data) else {
            self.stats.parse_errors += 1;
            warn!("dropping non-UTF-8 SIP datagram from {}", from);
            return events;
        };
        if text.trim().is_empty() {
            debug!("keepalive from {}", from);
            return events;
        }

        match parse_message(text) {
            Ok(msg) => self.handle_message(msg, from, now, &mut events),
            Err(e) => {
                self.stats.parse_errors += 1;
                warn!("dropping malformed SIP datagram from {}: {}", from, e);
                let for_active_call = sniff_call_id(text)
                    .is_some_and(|id| self.call.as_ref().is_some_and(|c| c.call_id() == id));
                if for_active_call {
                    self.end_call(Some(Failure::Malformed), now, &mut events);
                }
            }
        }
        events
    }

    pub fn on_message(&mut self, msg: Message, from: SocketAddr, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        self.handle_message(msg, from, now, &mut events);
        events
    }

    /// Run retransmission, timeout, registration and grace timers.
    pub fn poll(&mut self, now: Instant) -> Vec<CoreEvent> {
        let mut events = Vec::new();

        for ev in self.client_tx.poll(now) {
            match ev {
                ClientTxEvent::Retransmit { dest, payload } => {
                    self.stats.retransmissions += 1;
                    events.push(CoreEvent::Send { dest, payload });
                }
                ClientTxEvent::TimedOut(key) => self.on_client_timeout(key, now, &mut events),
            }
        }

        for ev in self.server_tx.poll(now) {
            match ev {
                ServerTxEvent::Retransmit(resp, dest) => {
                    self.stats.retransmissions += 1;
                    self.emit_response(&resp, dest, &mut events);
                }
                ServerTxEvent::AckTimeout { call_id, status } => {
                    let ours = self.call.as_ref().is_some_and(|c| c.call_id() == call_id);
                    if ours && (200..300).contains(&status) {
                        warn!("no ACK for 200 OK on {}", call_id);
                        self.stats.transaction_timeouts += 1;
                        self.send_bye(now, &mut events);
                        self.end_call(Some(Failure::TransactionTimeout), now, &mut events);
                    }
                }
            }
        }

        if self.ended.as_ref().is_some_and(|e| now >= e.until) {
            debug!("ended call released");
            self.ended = None;
        }

        self.drive_registration(now, &mut events);
        events
    }

    fn handle_message(&mut self, msg: Message, from: SocketAddr, now: Instant, events: &mut Vec<CoreEvent>) {
        match msg {
            Message::Response(resp) => self.handle_response(&resp, now, events),
            Message::Request(req) => match req.method {
                Method::Invite => self.on_invite(req, from, now, events),
                Method::Ack => self.on_ack(&req, now, events),
                Method::Bye => self.on_bye(&req, from, now, events),
                Method::Cancel => self.on_cancel(&req, from, now, events),
                Method::Options | Method::Info => self.reply(&req, from, 200, "OK", events),
                Method::Register => self.reply(&req, from, 405, "Method Not Allowed", events),
            },
        }
    }

    fn handle_response(&mut self, resp: &Response, now: Instant, events: &mut Vec<CoreEvent>) {
        let Some(key) = TransactionKey::from_response(resp) else {
            return;
        };

        match self.client_tx.on_response(&key, resp.status_code, now) {
            ResponseMatch::Unmatched => {
                self.stats.unmatched_responses += 1;
                debug!(
                    "dropping unmatched {} for {} {} ({})",
                    resp.status_code, key.cseq, key.method, key.call_id
                );
            }
            ResponseMatch::Retransmission(ack) => {
                if let Some((dest, payload)) = ack {
                    debug!("re-ACKing retransmitted {} on {}", resp.status_code, key.call_id);
                    events.push(CoreEvent::Send { dest, payload });
                }
            }
            ResponseMatch::Provisional | ResponseMatch::Final => match key.method {
                Method::Register => {
                    if !resp.is_provisional() && key.call_id == self.registration.call_id() {
                        self.on_register_response(resp, now, events);
                    }
                }
                Method::Invite => self.on_invite_response(resp, &key, now, events),
                Method::Bye if !resp.is_provisional() => {
                    let ending = self.call.as_ref().is_some_and(|c| {
                        c.call_id() == key.call_id && c.state == CallState::Ending
                    });
                    if ending {
                        self.end_call(None, now, events);
                    }
                }
                _ => debug!("{} {} answered {}", key.method, key.call_id, resp.status_code),
            },
        }
    }

    fn on_register_response(&mut self, resp: &Response, now: Instant, events: &mut Vec<CoreEvent>) {
        match self.registration.handle_response(resp, now) {
            None => debug!("ignoring stale REGISTER response {}", resp.status_code),
            Some(RegistrationResult::Registered(_)) => self.set_ready(true, events),
            Some(RegistrationResult::AuthRequired) => self.drive_registration(now, events),
            Some(RegistrationResult::AuthFailed) => {
                self.stats.auth_failures += 1;
                events.push(CoreEvent::Lifecycle(LifecycleEvent::Failed(Failure::Auth)));
                self.after_register_failure(events);
            }
            Some(RegistrationResult::Failed(_)) => self.after_register_failure(events),
        }
    }

    fn after_register_failure(&mut self, events: &mut Vec<CoreEvent>) {
        // A lapsed registration is reported at once; a first registration only
        // after repeated failures.
        if self.ready == Some(true) || self.registration.failures() >= NOT_READY_THRESHOLD {
            self.set_ready(false, events);
        }
    }

    fn drive_registration(&mut self, now: Instant, events: &mut Vec<CoreEvent>) {
        if !self.started || !self.registration.due(now) {
            return;
        }
        let auth = self.register_credentials();
        match self
            .registration
            .build_register(&self.identity, &new_branch(), auth)
        {
            Ok(req) => self.emit_request(&req, true, now, events),
            Err(e) => warn!("failed to build REGISTER: {}", e),
        }
    }

    fn register_credentials(&self) -> Option<Header> {
        let challenge = self.registration.last_challenge()?;
        self.credentials_for(challenge, Method::Register, &self.identity.registrar_uri())
    }

    fn credentials_for(&self, challenge: &DigestChallenge, method: Method, uri: &str) -> Option<Header> {
        let creds = DigestCredentials {
            username: &self.config.user,
            password: &self.config.password,
        };
        authorization_header(challenge, &creds, method.as_str(), uri)
            .map_err(|e| warn!("failed to build credentials: {}", e))
            .ok()
    }

    fn on_invite_response(&mut self, resp: &Response, key: &TransactionKey, now: Instant, events: &mut Vec<CoreEvent>) {
        let live = self.call.as_ref().is_some_and(|c| {
            c.call_id() == key.call_id && c.role == DialogRole::Uac && c.state == CallState::Inviting
        });
        if !live {
            if !resp.is_provisional() {
                self.close_orphaned_invite(resp, key, now, events);
            }
            return;
        }

        match resp.status_code {
            100..=199 => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                call.learn_remote(resp);
                if !resp.body.is_empty() {
                    match sdp::parse(&resp.body).and_then(|d| d.media_endpoint()) {
                        Ok(endpoint) => {
                            debug!("early media endpoint {}", endpoint);
                            call.remote_rtp = Some(endpoint);
                        }
                        Err(e) => debug!("ignoring provisional SDP: {}", e),
                    }
                }
                if matches!(resp.status_code, 180 | 183) {
                    info!("remote is ringing ({})", resp.status_code);
                }
            }
            200..=299 => self.on_invite_accepted(resp, key, now, events),
            status @ (401 | 407) => self.on_invite_challenged(resp, key, status, now, events),
            status => {
                self.send_ack(resp, key, events);
                warn!("INVITE rejected: {} {}", status, resp.reason);
                self.end_call(Some(Failure::Rejected(status)), now, events);
            }
        }
    }

    fn on_invite_accepted(&mut self, resp: &Response, key: &TransactionKey, now: Instant, events: &mut Vec<CoreEvent>) {
        if let Some(call) = self.call.as_mut() {
            call.learn_remote(resp);
        }
        self.send_ack(resp, key, events);

        let negotiated = self.negotiate(&resp.body);
        let Some(call) = self.call.as_mut() else {
            return;
        };
        match negotiated {
            Ok((remote, payload_type)) => {
                call.state = CallState::Established;
                call.established_at = Some(now);
                call.remote_rtp = Some(remote);
                call.payload_type = Some(payload_type);
                call.media_active = true;
                info!("call {} established, PT {} with {}", call.call_id(), payload_type, remote);
                events.push(CoreEvent::MediaStart(MediaParams { remote, payload_type }));
                events.push(CoreEvent::Lifecycle(LifecycleEvent::CallEstablished));
            }
            Err(e) => {
                warn!("unusable answer on {}: {}", call.call_id(), e);
                self.send_bye(now, events);
                self.end_call(Some(Failure::Negotiation), now, events);
            }
        }
    }

    fn on_invite_challenged(
        &mut self,
        resp: &Response,
        key: &TransactionKey,
        status: u16,
        now: Instant,
        events: &mut Vec<CoreEvent>,
    ) {
        self.send_ack(resp, key, events);

        let already_tried = self.call.as_ref().is_some_and(|c| c.auth_attempted);
        let challenge = ChallengeKind::from_status(status).and_then(|kind| {
            let raw = resp.header(kind.challenge_header())?;
            parse_challenge(kind, raw).ok()
        });

        let retry = match challenge {
            Some(chal) if !already_tried => {
                let uri = self.call.as_ref().map(|c| c.remote_target.clone()).unwrap_or_default();
                let auth = self.credentials_for(&chal, Method::Invite, &uri);
                let sdp = self.local_sdp(self.config.payload_type);
                self.call.as_mut().map(|call| {
                    call.auth_attempted = true;
                    call.build_invite(&self.identity, &sdp, auth)
                })
            }
            _ => None,
        };

        match retry {
            Some(Ok(req)) => {
                debug!("resubmitting INVITE with credentials");
                self.emit_request(&req, true, now, events);
            }
            Some(Err(e)) => {
                warn!("failed to rebuild INVITE: {}", e);
                self.end_call(Some(Failure::Auth), now, events);
            }
            None => {
                warn!("INVITE authentication failed");
                self.stats.auth_failures += 1;
                self.end_call(Some(Failure::Auth), now, events);
            }
        }
    }

    /// A final response for an INVITE whose call is already gone (cancelled or
    /// failed). ACK it; a late 2xx also gets a BYE.
    fn close_orphaned_invite(&mut self, resp: &Response, key: &TransactionKey, now: Instant, events: &mut Vec<CoreEvent>) {
        self.send_ack(resp, key, events);
        if !resp.is_success() {
            return;
        }
        let bye = self
            .ended
            .as_mut()
            .filter(|e| e.call.call_id() == key.call_id)
            .map(|e| {
                e.call.learn_remote(resp);
                e.call.build_in_dialog(Method::Bye, &self.identity)
            });
        match bye {
            Some(Ok(req)) => {
                info!("releasing late answer on {}", key.call_id);
                self.emit_request(&req, true, now, events);
            }
            Some(Err(e)) => warn!("failed to build BYE: {}", e),
            None => debug!("no record of {} to release", key.call_id),
        }
    }

    fn send_ack(&mut self, resp: &Response, key: &TransactionKey, events: &mut Vec<CoreEvent>) {
        let call = self
            .call
            .as_ref()
            .filter(|c| c.call_id() == key.call_id)
            .or_else(|| {
                self.ended
                    .as_ref()
                    .map(|e| &e.call)
                    .filter(|c| c.call_id() == key.call_id)
            });
        let Some(call) = call else {
            debug!("cannot ACK {} on unknown call {}", resp.status_code, key.call_id);
            return;
        };

        let rendered = call
            .build_ack(resp, &self.identity)
            .and_then(|ack| ack.render::<MAX_MESSAGE_LEN>())
            .map(|r| r.as_str().to_owned());
        match rendered {
            Ok(payload) => {
                self.client_tx.set_ack(key, payload.clone());
                events.push(CoreEvent::Send {
                    dest: self.config.server,
                    payload,
                });
            }
            Err(e) => warn!("failed to build ACK: {}", e),
        }
    }

    fn send_bye(&mut self, now: Instant, events: &mut Vec<CoreEvent>) {
        let bye = self.call.as_mut().map(|call| {
            call.state = CallState::Ending;
            call.build_in_dialog(Method::Bye, &self.identity)
        });
        match bye {
            Some(Ok(req)) => self.emit_request(&req, true, now, events),
            Some(Err(e)) => {
                warn!("failed to build BYE: {}", e);
                self.end_call(None, now, events);
            }
            None => {}
        }
    }

    fn on_invite(&mut self, req: Request, from: SocketAddr, now: Instant, events: &mut Vec<CoreEvent>) {
        if self.server_tx.is_retransmission(&req) {
            if let Some(last) = self.server_tx.on_invite(&req, from) {
                debug!("INVITE retransmission, resending {}", last.status_code);
                self.emit_response(&last, from, events);
            }
            return;
        }
        self.server_tx.on_invite(&req, from);

        let Some(call_id) = req.call_id().map(str::to_owned) else {
            return;
        };
        if let Some(call) = &self.call {
            let (status, reason) = if call.call_id() == call_id {
                (488, "Not Acceptable Here")
            } else {
                (486, "Busy Here")
            };
            info!("rejecting INVITE {} with {}", call_id, status);
            self.reject_invite(&req, from, status, reason, now, events);
            return;
        }

        let (remote_rtp, payload_type) = match self.negotiate(&req.body) {
            Ok(v) => v,
            Err(e) => {
                warn!("rejecting INVITE {}: {}", call_id, e);
                self.stats.rejected_invites += 1;
                self.reject_invite(&req, from, 488, "Not Acceptable Here", now, events);
                events.push(CoreEvent::Lifecycle(LifecycleEvent::Failed(Failure::Negotiation)));
                return;
            }
        };

        let mut call = match Call::incoming(req, from, now) {
            Ok(call) => call,
            Err(e) => {
                warn!("cannot track INVITE {}: {}", call_id, e);
                return;
            }
        };
        call.remote_rtp = Some(remote_rtp);
        call.payload_type = Some(payload_type);

        match call.invite_response(&self.identity, 180, "Ringing", None) {
            Ok(resp) => {
                self.server_tx.on_outgoing_response(&resp, from, now);
                self.emit_response(&resp, from, events);
            }
            Err(e) => warn!("failed to build 180: {}", e),
        }
        info!("incoming call {} ringing (PT {})", call_id, payload_type);
        self.call = Some(call);
        events.push(CoreEvent::Lifecycle(LifecycleEvent::Ringing));
    }

    fn reject_invite(
        &mut self,
        req: &Request,
        from: SocketAddr,
        status: u16,
        reason: &str,
        now: Instant,
        events: &mut Vec<CoreEvent>,
    ) {
        let resp = build_response(req, status, reason, Some(&new_tag())).and_then(|mut r| {
            attach_body(&mut r.headers, &mut r.body, None)?;
            Ok(r)
        });
        match resp {
            Ok(resp) => {
                self.server_tx.on_outgoing_response(&resp, from, now);
                self.emit_response(&resp, from, events);
            }
            Err(e) => warn!("failed to build {}: {}", status, e),
        }
    }

    fn on_ack(&mut self, req: &Request, now: Instant, events: &mut Vec<CoreEvent>) {
        let confirmed = self.server_tx.on_ack(req, now);
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let completes_answer = confirmed
            && req.call_id() == Some(call.call_id())
            && call.role == DialogRole::Uas
            && call.state == CallState::Ringing
            && call.answered;
        if !completes_answer {
            debug!("ACK absorbed");
            return;
        }
        let (Some(remote), Some(payload_type)) = (call.remote_rtp, call.payload_type) else {
            return;
        };

        call.state = CallState::Established;
        call.established_at = Some(now);
        call.media_active = true;
        info!("call {} established, PT {} with {}", call.call_id(), payload_type, remote);
        events.push(CoreEvent::MediaStart(MediaParams { remote, payload_type }));
        events.push(CoreEvent::Lifecycle(LifecycleEvent::CallEstablished));
    }

    fn on_bye(&mut self, req: &Request, from: SocketAddr, now: Instant, events: &mut Vec<CoreEvent>) {
        let call_id = req.call_id().unwrap_or_default();

        if let Some(call) = self.call.as_mut().filter(|c| c.call_id() == call_id) {
            info!("remote hung up {}", call_id);
            call.state = CallState::Ending;
            self.reply(req, from, 200, "OK", events);
            self.server_tx.remove_call(call_id);
            self.end_call(None, now, events);
        } else if self.ended.as_ref().is_some_and(|e| e.call.call_id() == call_id) {
            debug!("BYE retransmission for ended call {}", call_id);
            self.reply(req, from, 200, "OK", events);
        } else {
            self.reply(req, from, 481, "Call/Transaction Does Not Exist", events);
        }
    }

    fn on_cancel(&mut self, req: &Request, from: SocketAddr, now: Instant, events: &mut Vec<CoreEvent>) {
        let call_id = req.call_id().unwrap_or_default();
        let Some(call) = self.call.as_ref().filter(|c| c.call_id() == call_id) else {
            self.reply(req, from, 481, "Call/Transaction Does Not Exist", events);
            return;
        };

        // Past the point of no return: the INVITE already has a final answer.
        if call.role != DialogRole::Uas || call.state != CallState::Ringing || call.answered {
            self.reply(req, from, 200, "OK", events);
            return;
        }

        let dest = call.invite_source.unwrap_or(from);
        let terminated = call.invite_response(&self.identity, 487, "Request Terminated", None);
        self.reply(req, from, 200, "OK", events);
        match terminated {
            Ok(resp) => {
                self.server_tx.on_outgoing_response(&resp, dest, now);
                self.emit_response(&resp, dest, events);
            }
            Err(e) => warn!("failed to build 487: {}", e),
        }
        info!("caller cancelled {}", call_id);
        self.end_call(None, now, events);
    }

    fn reply(&mut self, req: &Request, dest: SocketAddr, status: u16, reason: &str, events: &mut Vec<CoreEvent>) {
        let resp = build_response(req, status, reason, Some(&new_tag())).and_then(|mut r| {
            if status == 405 {
                r.push_header("Allow", ALLOW)?;
            }
            attach_body(&mut r.headers, &mut r.body, None)?;
            Ok(r)
        });
        match resp {
            Ok(resp) => self.emit_response(&resp, dest, events),
            Err(e) => warn!("failed to build {} for {}: {}", status, req.method, e),
        }
    }

    fn on_client_timeout(&mut self, key: TransactionKey, now: Instant, events: &mut Vec<CoreEvent>) {
        self.stats.transaction_timeouts += 1;
        warn!("{} transaction {} timed out", key.method, key.call_id);

        match key.method {
            Method::Register if key.call_id == self.registration.call_id() => {
                if self.registration.on_timeout(key.cseq, now).is_some() {
                    self.after_register_failure(events);
                }
            }
            Method::Invite | Method::Bye => {
                if self.call.as_ref().is_some_and(|c| c.call_id() == key.call_id) {
                    self.end_call(Some(Failure::TransactionTimeout), now, events);
                }
            }
            _ => {}
        }
    }

    /// Move the active call to Ended and announce it. The call's identifiers
    /// stay around for the grace period only to absorb retransmissions.
    fn end_call(&mut self, failure: Option<Failure>, now: Instant, events: &mut Vec<CoreEvent>) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        if let Some(failure) = failure {
            warn!("call {} failed: {}", call.call_id(), failure);
            events.push(CoreEvent::Lifecycle(LifecycleEvent::Failed(failure)));
        }
        if call.media_active {
            call.media_active = false;
            events.push(CoreEvent::MediaStop);
        }
        self.server_tx.remove_unanswered(call.call_id());
        call.state = CallState::Ended;
        info!("call {} ended", call.call_id());
        self.ended = Some(EndedCall {
            call,
            until: now + ENDED_GRACE,
        });
        events.push(CoreEvent::Lifecycle(LifecycleEvent::CallEnded));
    }

    fn set_ready(&mut self, ready: bool, events: &mut Vec<CoreEvent>) {
        if self.ready == Some(ready) {
            return;
        }
        // A never-started engine reports nothing.
        if !ready && self.ready.is_none() && !self.started {
            return;
        }
        self.ready = Some(ready);
        let event = if ready {
            LifecycleEvent::Ready
        } else {
            LifecycleEvent::NotReady
        };
        info!("{:?}", event);
        events.push(CoreEvent::Lifecycle(event));
    }

    /// Parse a peer description and pick the payload type and media endpoint.
    fn negotiate(&self, body: &str) -> Result<(SocketAddr, u8)> {
        let desc = sdp::parse(body)?;
        let payload_type = sdp::negotiate(
            &desc,
            self.config.payload_type,
            &self.config.supported_payload_types,
        )?;
        Ok((desc.media_endpoint()?, payload_type))
    }

    fn local_sdp(&self, payload_type: u8) -> String {
        sdp::SessionDescription::offer(
            self.config.local_ip,
            self.config.rtp_port,
            payload_type,
            self.session_id,
        )
        .render()
    }

    fn emit_request(&mut self, req: &Request, track: bool, now: Instant, events: &mut Vec<CoreEvent>) {
        let payload = match req.render::<MAX_MESSAGE_LEN>() {
            Ok(p) => p.as_str().to_owned(),
            Err(e) => {
                warn!("dropping {}: {}", req.method, e);
                return;
            }
        };
        if track {
            if let Some(key) = TransactionKey::from_request(req) {
                self.client_tx.start(key, self.config.server, payload.clone(), now);
            }
        }
        debug!("-> {} {}", req.method, req.uri);
        events.push(CoreEvent::Send {
            dest: self.config.server,
            payload,
        });
    }

    fn emit_response(&mut self, resp: &Response, dest: SocketAddr, events: &mut Vec<CoreEvent>) {
        match resp.render::<MAX_MESSAGE_LEN>() {
            Ok(p) => {
                debug!("-> {} {} to {}", resp.status_code, resp.reason, dest);
                events.push(CoreEvent::Send {
                    dest,
                    payload: p.as_str().to_owned(),
                });
            }
            Err(e) => warn!("dropping {} response: {}", resp.status_code, e),
        }
    }
}
