use std::io;
use std::net::SocketAddr;

use sip_core::SipError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("send to {dest}: {source}")]
    Send {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("receive: {0}")]
    Receive(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum VoipError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("sip: {0}")]
    Sip(#[from] SipError),
}
