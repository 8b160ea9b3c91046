use core::fmt::Write;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::{
    call::CallState,
    message::{addr_spec, tag_param, Header, HeaderList, Method, Request, Response, SmallString, MAX_BODY_LEN},
    Result, SipError, USER_AGENT,
};

/// Who we are on the wire: account, registrar domain and local transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UaIdentity {
    pub user: String,
    pub domain: String,
    pub local_ip: IpAddr,
    pub local_port: u16,
}

impl UaIdentity {
    /// Address of record, `sip:user@domain`.
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.user, self.domain)
    }

    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.domain)
    }

    pub fn contact(&self) -> String {
        format!(
            "<sip:{}@{}:{};transport=udp>",
            self.user,
            host_literal(self.local_ip),
            self.local_port
        )
    }

    pub fn via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch={};rport",
            host_literal(self.local_ip),
            self.local_port,
            branch
        )
    }

    /// Normalise a dial string: full SIP URI, `user@host`, or a bare extension.
    pub fn target_uri(&self, target: &str) -> String {
        let target = target.trim();
        if target.starts_with("sip:") {
            target.to_owned()
        } else if target.contains('@') {
            format!("sip:{}", target)
        } else {
            format!("sip:{}@{}", target, self.domain)
        }
    }
}

fn host_literal(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

pub fn new_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

pub fn new_branch() -> String {
    format!("z9hG4bK{:08x}{:04x}", rand::random::<u32>(), rand::random::<u16>())
}

pub fn new_call_id(host: IpAddr) -> String {
    format!(
        "{:08x}{:08x}@{}",
        rand::random::<u32>(),
        rand::random::<u32>(),
        host
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac, // we initiated the call
    Uas, // remote initiated the call
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipDialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

/// One logical phone call, owned by the call state machine.
#[derive(Debug, Clone)]
pub struct Call {
    pub id: SipDialogId,
    pub role: DialogRole,
    pub state: CallState,
    /// CSeq of the last request we sent in this call. Never decreases.
    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
    /// Our From/To value, including our tag.
    pub local_party: String,
    /// Their From/To value, including their tag once known.
    pub remote_party: String,
    pub remote_target: String,
    pub remote_rtp: Option<SocketAddr>,
    pub payload_type: Option<u8>,
    /// The INVITE we sent (UAC) or received (UAS).
    pub invite: Option<Request>,
    pub invite_source: Option<SocketAddr>,
    pub auth_attempted: bool,
    pub answered: bool,
    pub media_active: bool,
    pub started_at: Instant,
    pub established_at: Option<Instant>,
}

impl Call {
    pub fn outgoing(
        identity: &UaIdentity,
        target: &str,
        display_name: Option<&str>,
        now: Instant,
    ) -> Self {
        let local_tag = new_tag();
        let local_party = match display_name.filter(|d| !d.is_empty()) {
            Some(name) => format!("\"{}\" <{}>;tag={}", name.replace('"', ""), identity.aor(), local_tag),
            None => format!("<{}>;tag={}", identity.aor(), local_tag),
        };
        let target_uri = identity.target_uri(target);

        Self {
            id: SipDialogId {
                call_id: new_call_id(identity.local_ip),
                local_tag,
                remote_tag: None,
            },
            role: DialogRole::Uac,
            state: CallState::Inviting,
            local_cseq: 0,
            remote_cseq: None,
            local_party,
            remote_party: format!("<{}>", target_uri),
            remote_target: target_uri,
            remote_rtp: None,
            payload_type: None,
            invite: None,
            invite_source: None,
            auth_attempted: false,
            answered: false,
            media_active: false,
            started_at: now,
            established_at: None,
        }
    }

    pub fn incoming(invite: Request, source: SocketAddr, now: Instant) -> Result<Self> {
        let call_id = invite.call_id().ok_or(SipError::Invalid("missing Call-ID"))?;
        let from = invite.header("From").ok_or(SipError::Invalid("missing From"))?;
        let to = invite.header("To").ok_or(SipError::Invalid("missing To"))?;
        let (cseq, _) = invite.cseq().ok_or(SipError::Invalid("missing CSeq"))?;
        let remote_target = invite
            .header("Contact")
            .map(addr_spec)
            .unwrap_or_else(|| addr_spec(from))
            .to_owned();

        let local_tag = new_tag();
        let id = SipDialogId {
            call_id: call_id.to_owned(),
            local_tag: local_tag.clone(),
            remote_tag: tag_param(from).map(str::to_owned),
        };
        let local_party = format!("{};tag={}", to, local_tag);
        let remote_party = from.to_owned();

        Ok(Self {
            id,
            role: DialogRole::Uas,
            state: CallState::Ringing,
            local_cseq: 0,
            remote_cseq: Some(cseq),
            local_party,
            remote_party,
            remote_target,
            remote_rtp: None,
            payload_type: None,
            invite: Some(invite),
            invite_source: Some(source),
            auth_attempted: false,
            answered: false,
            media_active: false,
            started_at: now,
            established_at: None,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.id.call_id
    }

    /// Build (or rebuild, after a challenge) our INVITE. Every build takes a new CSeq.
    pub fn build_invite(
        &mut self,
        identity: &UaIdentity,
        sdp: &str,
        auth: Option<Header>,
    ) -> Result<Request> {
        self.local_cseq = self.local_cseq.wrapping_add(1);
        let mut req = base_request(
            Method::Invite,
            &self.remote_target,
            &identity.via(&new_branch()),
            &self.local_party,
            &self.remote_party,
            &self.id.call_id,
            self.local_cseq,
        )?;
        req.push_header("Contact", &identity.contact())?;
        req.push_header("Allow", crate::ALLOW)?;
        if let Some(auth) = auth {
            req.add_header(auth)?;
        }
        attach_body(&mut req.headers, &mut req.body, Some(sdp))?;
        self.invite = Some(req.clone());
        Ok(req)
    }

    /// BYE and other in-dialog requests that open their own transaction.
    pub fn build_in_dialog(&mut self, method: Method, identity: &UaIdentity) -> Result<Request> {
        self.local_cseq = self.local_cseq.wrapping_add(1);
        let mut req = base_request(
            method,
            &self.remote_target,
            &identity.via(&new_branch()),
            &self.local_party,
            &self.remote_party,
            &self.id.call_id,
            self.local_cseq,
        )?;
        attach_body(&mut req.headers, &mut req.body, None)?;
        Ok(req)
    }

    /// ACK for a final response to our INVITE. A 2xx ACK is its own transaction
    /// and goes to the remote target; a non-2xx ACK reuses the INVITE's Via.
    pub fn build_ack(&self, resp: &Response, identity: &UaIdentity) -> Result<Request> {
        let invite = self
            .invite
            .as_ref()
            .ok_or(SipError::InvalidState("no INVITE to acknowledge"))?;
        let (cseq, _) = resp.cseq().ok_or(SipError::Invalid("missing CSeq"))?;
        let to = resp.header("To").unwrap_or(&self.remote_party);

        let mut req = if resp.is_success() {
            base_request(
                Method::Ack,
                &self.remote_target,
                &identity.via(&new_branch()),
                &self.local_party,
                to,
                &self.id.call_id,
                cseq,
            )?
        } else {
            let via = invite.header("Via").ok_or(SipError::Invalid("missing Via"))?;
            base_request(
                Method::Ack,
                &invite.uri,
                via,
                &self.local_party,
                to,
                &self.id.call_id,
                cseq,
            )?
        };
        attach_body(&mut req.headers, &mut req.body, None)?;
        Ok(req)
    }

    /// CANCEL mirrors the pending INVITE: same Request-URI, Via, From, To and CSeq number.
    pub fn build_cancel(&self) -> Result<Request> {
        let invite = self
            .invite
            .as_ref()
            .ok_or(SipError::InvalidState("no INVITE to cancel"))?;
        let (cseq, _) = invite.cseq().ok_or(SipError::Invalid("missing CSeq"))?;
        let via = invite.header("Via").ok_or(SipError::Invalid("missing Via"))?;
        let to = invite.header("To").ok_or(SipError::Invalid("missing To"))?;
        let mut req = base_request(
            Method::Cancel,
            &invite.uri,
            via,
            &self.local_party,
            to,
            &self.id.call_id,
            cseq,
        )?;
        attach_body(&mut req.headers, &mut req.body, None)?;
        Ok(req)
    }

    /// Pick up the remote tag and target from a response to our INVITE.
    pub fn learn_remote(&mut self, resp: &Response) {
        if let Some(to) = resp.header("To") {
            if let Some(tag) = tag_param(to) {
                self.id.remote_tag = Some(tag.to_owned());
                self.remote_party = to.to_owned();
            }
        }
        if let Some(contact) = resp.header("Contact") {
            self.remote_target = addr_spec(contact).to_owned();
        }
    }

    /// Response to the INVITE we received, carrying our tag.
    pub fn invite_response(
        &self,
        identity: &UaIdentity,
        status: u16,
        reason: &str,
        sdp: Option<&str>,
    ) -> Result<Response> {
        let invite = self
            .invite
            .as_ref()
            .ok_or(SipError::InvalidState("no INVITE to answer"))?;
        let mut resp = build_response(invite, status, reason, Some(&self.id.local_tag))?;
        if (101..300).contains(&status) {
            resp.push_header("Contact", &identity.contact())?;
        }
        attach_body(&mut resp.headers, &mut resp.body, sdp)?;
        Ok(resp)
    }
}

/// Header skeleton shared by every request we originate.
pub fn base_request(
    method: Method,
    uri: &str,
    via: &str,
    from: &str,
    to: &str,
    call_id: &str,
    cseq: u32,
) -> Result<Request> {
    let mut req = Request::new(method, uri)?;
    req.push_header("Via", via)?;
    req.push_header("Max-Forwards", "70")?;
    req.push_header("From", from)?;
    req.push_header("To", to)?;
    req.push_header("Call-ID", call_id)?;
    req.push_header("CSeq", &format_cseq(cseq, method)?)?;
    req.push_header("User-Agent", USER_AGENT)?;
    Ok(req)
}

/// Build a response to `req`, copying every Via plus From, Call-ID and CSeq.
/// A tag is appended to To when the request did not carry one.
///
/// The returned response has no Content-Length yet; finish it with [`attach_body`].
pub fn build_response(
    req: &Request,
    status: u16,
    reason: &str,
    to_tag: Option<&str>,
) -> Result<Response> {
    let mut resp = Response::new(status, reason)?;

    let mut saw_via = false;
    for via in req.headers.iter().filter(|h| h.name.eq_ignore_ascii_case("Via")) {
        resp.add_header(via.clone())?;
        saw_via = true;
    }
    if !saw_via {
        return Err(SipError::Invalid("missing Via"));
    }

    let from = req.header("From").ok_or(SipError::Invalid("missing From"))?;
    resp.push_header("From", from)?;

    let raw_to = req.header("To").ok_or(SipError::Invalid("missing To"))?;
    match (tag_param(raw_to), to_tag) {
        (None, Some(tag)) => {
            let mut to_value = String::new();
            write!(to_value, "{};tag={}", raw_to, tag).map_err(|_| SipError::Capacity)?;
            resp.push_header("To", &to_value)?;
        }
        _ => resp.push_header("To", raw_to)?,
    }

    let call_id = req.call_id().ok_or(SipError::Invalid("missing Call-ID"))?;
    resp.push_header("Call-ID", call_id)?;
    let cseq = req.header("CSeq").ok_or(SipError::Invalid("missing CSeq"))?;
    resp.push_header("CSeq", cseq)?;
    resp.push_header("User-Agent", USER_AGENT)?;

    Ok(resp)
}

/// Append Content-Type/Content-Length and the SDP body (if any).
pub fn attach_body(
    headers: &mut HeaderList,
    slot: &mut SmallString<MAX_BODY_LEN>,
    sdp: Option<&str>,
) -> Result<()> {
    slot.clear();
    match sdp {
        Some(body) => {
            headers
                .push(Header::new("Content-Type", "application/sdp")?)
                .map_err(|_| SipError::Capacity)?;
            headers
                .push(Header::new("Content-Length", &body.len().to_string())?)
                .map_err(|_| SipError::Capacity)?;
            slot.push_str(body).map_err(|_| SipError::Capacity)
        }
        None => headers
            .push(Header::new("Content-Length", "0")?)
            .map_err(|_| SipError::Capacity),
    }
}

pub fn format_cseq(seq: u32, method: Method) -> Result<String> {
    let mut buf = String::new();
    write!(buf, "{} {}", seq, method).map_err(|_| SipError::Capacity)?;
    Ok(buf)
}
