pub mod alaw;
pub mod ulaw;

use heapless::Vec;

use crate::{error::AudioError, rtp::MAX_PAYLOAD};

/// The G.711 pair. One byte per sample at 8 kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Pcmu,
    Pcma,
}

impl Codec {
    /// Payload types in order of local preference.
    pub const SUPPORTED: [u8; 2] = [0, 8];

    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type {
            0 => Some(Codec::Pcmu),
            8 => Some(Codec::Pcma),
            _ => None,
        }
    }

    pub fn payload_type(self) -> u8 {
        match self {
            Codec::Pcmu => 0,
            Codec::Pcma => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Pcmu => "PCMU",
            Codec::Pcma => "PCMA",
        }
    }

    pub fn clock_rate(self) -> u32 {
        8000
    }

    pub fn encode(self, pcm: &[i16]) -> Result<Vec<u8, MAX_PAYLOAD>, AudioError> {
        if pcm.len() > MAX_PAYLOAD {
            return Err(AudioError::BufferFull);
        }
        let encode_sample: fn(i16) -> u8 = match self {
            Codec::Pcmu => ulaw::encode_sample,
            Codec::Pcma => alaw::encode_sample,
        };
        Ok(pcm.iter().map(|&s| encode_sample(s)).collect())
    }

    pub fn decode(self, payload: &[u8]) -> Result<Vec<i16, MAX_PAYLOAD>, AudioError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(AudioError::BufferFull);
        }
        let decode_sample: fn(u8) -> i16 = match self {
            Codec::Pcmu => ulaw::decode_sample,
            Codec::Pcma => alaw::decode_sample,
        };
        Ok(payload.iter().map(|&b| decode_sample(b)).collect())
    }
}

impl TryFrom<u8> for Codec {
    type Error = AudioError;

    fn try_from(payload_type: u8) -> Result<Self, Self::Error> {
        Codec::from_payload_type(payload_type).ok_or(AudioError::UnsupportedCodec(payload_type))
    }
}
