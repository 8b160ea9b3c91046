use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;

use crate::{Method, Request, Response};

// Timer values from RFC 3261 (assuming UDP/unreliable transport)
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
const TIMER_H: Duration = Duration::from_millis(500 * 64); // 64 * T1
const TIMER_I: Duration = Duration::from_secs(5); // Time to keep transaction after ACK

/// Client requests are resent every T1 this many times before giving up (7 * T1 total).
pub const MAX_RETRANSMITS: u32 = 6;
/// How long an INVITE may sit in Proceeding after a provisional response.
pub const INVITE_PROCEEDING_TIMEOUT: Duration = Duration::from_secs(180);
/// Completed INVITE client transactions stay around to re-ACK retransmitted finals.
pub const INVITE_COMPLETED_LINGER: Duration = Duration::from_secs(32);

/// Responses are matched to requests by (Call-ID, CSeq number, CSeq method) only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub call_id: String,
    pub cseq: u32,
    pub method: Method,
}

impl TransactionKey {
    pub fn new(call_id: &str, cseq: u32, method: Method) -> Self {
        Self {
            call_id: call_id.to_owned(),
            cseq,
            method,
        }
    }

    pub fn from_request(req: &Request) -> Option<Self> {
        let (cseq, method) = req.cseq()?;
        Some(Self::new(req.call_id()?, cseq, method))
    }

    pub fn from_response(resp: &Response) -> Option<Self> {
        let (cseq, method) = resp.cseq()?;
        Some(Self::new(resp.call_id()?, cseq, method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientTxState {
    Trying,
    Proceeding,
    Completed,
}

#[derive(Debug, Clone)]
struct ClientTransaction {
    key: TransactionKey,
    dest: SocketAddr,
    payload: String,
    state: ClientTxState,
    retransmits: u32,
    next_retransmit: Option<Instant>,
    deadline: Option<Instant>,
    ack: Option<String>,
}

impl ClientTransaction {
    fn is_invite(&self) -> bool {
        self.key.method == Method::Invite
    }
}

/// Outcome of feeding a response into the client transaction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatch {
    /// No outstanding request has this (Call-ID, CSeq, method).
    Unmatched,
    Provisional,
    Final,
    /// A final response for an already completed INVITE. Carries the ACK to resend.
    Retransmission(Option<(SocketAddr, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTxEvent {
    Retransmit { dest: SocketAddr, payload: String },
    TimedOut(TransactionKey),
}

#[derive(Debug, Default)]
pub struct ClientTransactions {
    transactions: Vec<ClientTransaction>,
}

impl ClientTransactions {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
        }
    }

    /// Track a request that was just sent.
    pub fn start(&mut self, key: TransactionKey, dest: SocketAddr, payload: String, now: Instant) {
        self.transactions.retain(|t| t.key != key);
        self.transactions.push(ClientTransaction {
            key,
            dest,
            payload,
            state: ClientTxState::Trying,
            retransmits: 0,
            next_retransmit: Some(now + T1),
            deadline: None,
            ack: None,
        });
    }

    pub fn on_response(&mut self, key: &TransactionKey, status: u16, now: Instant) -> ResponseMatch {
        let Some(pos) = self.transactions.iter().position(|t| &t.key == key) else {
            return ResponseMatch::Unmatched;
        };
        let tx = &mut self.transactions[pos];

        match (tx.state, status) {
            (ClientTxState::Completed, s) if s >= 200 => {
                ResponseMatch::Retransmission(tx.ack.clone().map(|ack| (tx.dest, ack)))
            }
            (ClientTxState::Completed, _) => ResponseMatch::Retransmission(None),
            (_, s) if s < 200 => {
                if tx.is_invite() {
                    tx.state = ClientTxState::Proceeding;
                    tx.next_retransmit = None;
                    tx.deadline = Some(now + INVITE_PROCEEDING_TIMEOUT);
                }
                ResponseMatch::Provisional
            }
            _ => {
                if tx.is_invite() {
                    tx.state = ClientTxState::Completed;
                    tx.next_retransmit = None;
                    tx.deadline = Some(now + INVITE_COMPLETED_LINGER);
                } else {
                    self.transactions.remove(pos);
                }
                ResponseMatch::Final
            }
        }
    }

    /// Remember the ACK sent for a completed INVITE so retransmitted finals can be answered.
    pub fn set_ack(&mut self, key: &TransactionKey, payload: String) {
        if let Some(tx) = self.transactions.iter_mut().find(|t| &t.key == key) {
            tx.ack = Some(payload);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Advance retransmit and timeout timers.
    pub fn poll(&mut self, now: Instant) -> Vec<ClientTxEvent> {
        let mut out = Vec::new();

        self.transactions.retain_mut(|tx| {
            if let Some(deadline) = tx.deadline {
                if now >= deadline {
                    if tx.state != ClientTxState::Completed {
                        out.push(ClientTxEvent::TimedOut(tx.key.clone()));
                    }
                    return false;
                }
            }

            let Some(next) = tx.next_retransmit else {
                return true;
            };
            if now < next {
                return true;
            }
            if tx.retransmits >= MAX_RETRANSMITS {
                debug!("{} {} timed out after {} retransmits", tx.key.method, tx.key.call_id, tx.retransmits);
                out.push(ClientTxEvent::TimedOut(tx.key.clone()));
                return false;
            }

            tx.retransmits += 1;
            tx.next_retransmit = Some(next + T1);
            out.push(ClientTxEvent::Retransmit {
                dest: tx.dest,
                payload: tx.payload.clone(),
            });
            true
        });

        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InviteServerTxState {
    Proceeding,
    Completed,
    Confirmed,
}

#[derive(Debug, Clone)]
struct InviteServerTransaction {
    call_id: String,
    cseq: u32,
    remote: SocketAddr,
    last_response: Option<Response>,
    state: InviteServerTxState,
    timer_g_interval: Duration,
    next_timer_g: Option<Instant>,
    deadline_h: Option<Instant>,
    deadline_i: Option<Instant>,
}

impl InviteServerTransaction {
    fn new(call_id: &str, cseq: u32, remote: SocketAddr) -> Self {
        Self {
            call_id: call_id.to_string(),
            cseq,
            remote,
            last_response: None,
            state: InviteServerTxState::Proceeding,
            timer_g_interval: T1,
            next_timer_g: None,
            deadline_h: None,
            deadline_i: None,
        }
    }

    fn matches(&self, call_id: &str, cseq: u32) -> bool {
        self.call_id == call_id && self.cseq == cseq
    }

    fn update_with_response(&mut self, resp: &Response, now: Instant) {
        self.last_response = Some(resp.clone());

        if resp.status_code < 200 {
            return;
        }

        self.state = InviteServerTxState::Completed;
        self.timer_g_interval = T1;
        self.next_timer_g = Some(now + self.timer_g_interval);
        self.deadline_h = Some(now + TIMER_H);
        self.deadline_i = None;
    }

    fn on_ack(&mut self, now: Instant) -> bool {
        if self.state != InviteServerTxState::Completed {
            return false;
        }
        self.state = InviteServerTxState::Confirmed;
        self.next_timer_g = None;
        self.deadline_i = Some(now + TIMER_I);
        true
    }

    fn maybe_retransmit(&mut self, now: Instant) -> Option<Response> {
        if self.state != InviteServerTxState::Completed {
            return None;
        }
        let next = self.next_timer_g?;
        if now < next || self.deadline_h.is_some_and(|h| now >= h) {
            return None;
        }

        let out = self.last_response.clone()?;
        self.timer_g_interval = (self.timer_g_interval * 2).min(T2);
        self.next_timer_g = Some(now + self.timer_g_interval);
        Some(out)
    }

    fn expired(&self, now: Instant) -> bool {
        match self.state {
            InviteServerTxState::Proceeding => false,
            InviteServerTxState::Completed => self.deadline_h.is_some_and(|h| now >= h),
            InviteServerTxState::Confirmed => self.deadline_i.is_some_and(|i| now >= i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTxEvent {
    Retransmit(Response, SocketAddr),
    /// Timer H fired: the final response was never acknowledged.
    AckTimeout { call_id: String, status: u16 },
}

#[derive(Debug, Default)]
pub struct InviteServerTransactionManager {
    transactions: Vec<InviteServerTransaction>,
}

impl InviteServerTransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
        }
    }

    /// Handle an incoming INVITE request. If it is a retransmission,
    /// return the last response to be resent.
    pub fn on_invite(&mut self, req: &Request, remote: SocketAddr) -> Option<Response> {
        let call_id = req.call_id()?;
        let (cseq, _) = req.cseq()?;

        if let Some(tx) = self.transactions.iter().find(|t| t.matches(call_id, cseq)) {
            return tx.last_response.clone();
        }

        self.transactions
            .push(InviteServerTransaction::new(call_id, cseq, remote));
        None
    }

    pub fn is_retransmission(&self, req: &Request) -> bool {
        match (req.call_id(), req.cseq()) {
            (Some(call_id), Some((cseq, _))) => {
                self.transactions.iter().any(|t| t.matches(call_id, cseq))
            }
            _ => false,
        }
    }

    /// Record that we sent a response so the manager can retransmit it later.
    pub fn on_outgoing_response(&mut self, resp: &Response, remote: SocketAddr, now: Instant) {
        let Some((cseq, Method::Invite)) = resp.cseq() else {
            return;
        };
        let Some(call_id) = resp.call_id() else {
            return;
        };

        match self
            .transactions
            .iter_mut()
            .find(|t| t.matches(call_id, cseq))
        {
            Some(t) => t.update_with_response(resp, now),
            None => {
                let mut t = InviteServerTransaction::new(call_id, cseq, remote);
                t.update_with_response(resp, now);
                self.transactions.push(t);
            }
        }
    }

    /// Returns true when the ACK confirmed a final response we were retransmitting.
    pub fn on_ack(&mut self, ack: &Request, now: Instant) -> bool {
        let (Some(call_id), Some((cseq, _))) = (ack.call_id(), ack.cseq()) else {
            return false;
        };

        self.transactions
            .iter_mut()
            .find(|t| t.matches(call_id, cseq))
            .is_some_and(|tx| tx.on_ack(now))
    }

    pub fn remove_call(&mut self, call_id: &str) {
        self.transactions.retain(|t| t.call_id != call_id);
    }

    /// Forget an INVITE of `call_id` that never got a final response.
    /// Answered ones stay until ACKed or Timer H.
    pub fn remove_unanswered(&mut self, call_id: &str) {
        self.transactions
            .retain(|t| t.call_id != call_id || t.state != InviteServerTxState::Proceeding);
    }

    /// Advance timers and produce any retransmissions that should be sent now.
    pub fn poll(&mut self, now: Instant) -> Vec<ServerTxEvent> {
        let mut out = Vec::new();

        for tx in &mut self.transactions {
            if let Some(resp) = tx.maybe_retransmit(now) {
                out.push(ServerTxEvent::Retransmit(resp, tx.remote));
            }
        }

        self.transactions.retain(|tx| {
            if !tx.expired(now) {
                return true;
            }
            if tx.state == InviteServerTxState::Completed {
                let status = tx.last_response.as_ref().map_or(0, |r| r.status_code);
                out.push(ServerTxEvent::AckTimeout {
                    call_id: tx.call_id.clone(),
                    status,
                });
            }
            false
        });

        out
    }
}
