//! SIP user-agent core: message model, digest auth, transactions,
//! registration and the call state machine.
//!
//! Nothing in this crate performs I/O. Every entry point takes the current
//! `Instant` and returns [`CoreEvent`]s describing what the caller has to
//! send or announce.

use thiserror::Error;

pub mod auth;
pub mod call;
pub mod dialog;
pub mod message;
pub mod registration;
pub mod transaction;

pub use auth::{
    authorization_header, compute_digest_response, parse_www_authenticate, ChallengeKind,
    DigestChallenge, DigestCredentials,
};
pub use call::{
    CallState, CallStateMachine, CoreEvent, Failure, LifecycleEvent, MediaParams, SipConfig,
    SipStats,
};
pub use dialog::{Call, DialogRole, SipDialogId, UaIdentity};
pub use message::{
    header_value, parse_cseq, parse_message, sniff_call_id, Header, Message, Method, Request,
    Response, SmallString, MAX_MESSAGE_LEN,
};
pub use registration::{Registration, RegistrationResult, RegistrationState};
pub use transaction::{
    ClientTransactions, ClientTxEvent, InviteServerTransactionManager, ResponseMatch,
    ServerTxEvent, TransactionKey,
};

/// Value sent in `User-Agent` on every request and response we originate.
pub const USER_AGENT: &str = concat!("sip_core/", env!("CARGO_PKG_VERSION"));

/// Methods we answer, advertised in `Allow`.
pub const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, INFO";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipError {
    #[error("message exceeds fixed capacity")]
    Capacity,
    #[error("invalid message: {0}")]
    Invalid(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("registration has not succeeded")]
    NotRegistered,
    #[error("another call is in progress")]
    Busy,
    #[error("sdp: {0}")]
    Sdp(#[from] sdp::SdpError),
}

pub type Result<T> = std::result::Result<T, SipError>;
