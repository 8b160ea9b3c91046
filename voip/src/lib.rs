//! Embeddable SIP phone: registration, one call at a time and its G.711
//! audio, driven by a single cooperative [`VoipEngine::tick`].
//!
//! The host supplies two non-blocking datagram sockets, an
//! [`AudioTransport`] and an [`EventSink`]; no threads are spawned.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod net;

#[cfg(test)]
mod tests;

pub use audio::{AudioFrame, AudioIoError, AudioTransport, Direction};
pub use config::{AudioFormat, Gain, GainConfig, RegistrationConfig, RegistrationConfigBuilder};
pub use engine::{EngineStats, VoipEngine};
pub use error::{ConfigError, TransportError, VoipError};
pub use events::EventSink;
pub use net::{bind_udp, DatagramSocket};

pub use rtp_audio::{Codec, RtpStats};
pub use sip_core::{CallState, Failure, LifecycleEvent, RegistrationState, SipStats};
