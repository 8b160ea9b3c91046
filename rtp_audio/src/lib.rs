//! RTP media for one call: header codec, G.711, sequence tracking, playout
//! buffering and gain.

pub mod codecs;
pub mod error;
pub mod gain;
pub mod jitter;
pub mod rtp;
pub mod session;
pub mod stream;

pub use codecs::Codec;
pub use error::AudioError;
pub use gain::GainStage;
pub use jitter::{JitterBuffer, Playout};
pub use rtp::{RtpHeader, RtpPacket, MAX_PACKET_LEN, MAX_PAYLOAD};
pub use session::{RtpSession, RtpStats, SeqClass};
pub use stream::{PcmFrame, RtpStream, MAX_FRAME_SAMPLES};
