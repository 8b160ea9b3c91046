//! Validated, immutable engine configuration.

use std::net::{IpAddr, SocketAddr};

use rtp_audio::{Codec, GainStage, MAX_FRAME_SAMPLES};
use sip_core::SipConfig;

use crate::error::ConfigError;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_RTP_PORT: u16 = 1234;
pub const DEFAULT_REGISTER_EXPIRES: u32 = 3600;
pub const DEFAULT_MIC_GAIN: Gain = Gain::Linear(2);
pub const DEFAULT_AMP_GAIN: Gain = Gain::Linear(6);

const MAX_LINEAR_GAIN: u8 = 16;
const DB_RANGE: core::ops::RangeInclusive<i8> = -40..=24;

/// A gain setting: whole-number multiplier or decibels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    Linear(u8),
    Decibels(i8),
}

impl Gain {
    pub fn stage(self) -> GainStage {
        match self {
            Gain::Linear(n) => GainStage::from_linear(n),
            Gain::Decibels(db) => GainStage::from_db(db),
        }
    }

    fn validate(self, field: &'static str) -> Result<(), ConfigError> {
        match self {
            Gain::Linear(n) if n > MAX_LINEAR_GAIN => Err(ConfigError::invalid(
                field,
                format!("linear gain {} above {}", n, MAX_LINEAR_GAIN),
            )),
            Gain::Decibels(db) if !DB_RANGE.contains(&db) => Err(ConfigError::invalid(
                field,
                format!("{} dB outside {:?}", db, DB_RANGE),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainConfig {
    pub mic: Gain,
    pub amp: Gain,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            mic: DEFAULT_MIC_GAIN,
            amp: DEFAULT_AMP_GAIN,
        }
    }
}

/// PCM format exchanged with the host audio transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u8,
    pub frame_samples: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            bits_per_sample: 16,
            frame_samples: 160,
        }
    }
}

impl AudioFormat {
    pub fn frame_duration(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.frame_samples as u64 * 1_000_000 / self.sample_rate as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate != 8000 {
            return Err(ConfigError::invalid("audio.sample_rate", "G.711 runs at 8000 Hz"));
        }
        if self.bits_per_sample != 16 {
            return Err(ConfigError::invalid("audio.bits_per_sample", "only 16-bit PCM is supported"));
        }
        if self.frame_samples == 0 || self.frame_samples > MAX_FRAME_SAMPLES {
            return Err(ConfigError::invalid(
                "audio.frame_samples",
                format!("must be 1..={}", MAX_FRAME_SAMPLES),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    sip_ip: IpAddr,
    sip_port: u16,
    local_ip: IpAddr,
    local_port: u16,
    rtp_port: u16,
    user: String,
    password: String,
    codec: Codec,
    gain: GainConfig,
    start_on_boot: bool,
    register_expires: u32,
    audio: AudioFormat,
}

impl RegistrationConfig {
    pub fn builder() -> RegistrationConfigBuilder {
        RegistrationConfigBuilder::default()
    }

    pub fn sip_server(&self) -> SocketAddr {
        SocketAddr::new(self.sip_ip, self.sip_port)
    }

    pub fn sip_local(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.local_port)
    }

    pub fn rtp_local(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.rtp_port)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn gain(&self) -> GainConfig {
        self.gain
    }

    pub fn start_on_boot(&self) -> bool {
        self.start_on_boot
    }

    pub fn register_expires(&self) -> u32 {
        self.register_expires
    }

    pub fn audio(&self) -> AudioFormat {
        self.audio
    }

    /// The signalling view of this configuration.
    pub fn sip_config(&self) -> SipConfig {
        SipConfig {
            server: self.sip_server(),
            local_ip: self.local_ip,
            local_port: self.local_port,
            rtp_port: self.rtp_port,
            user: self.user.clone(),
            password: self.password.clone(),
            payload_type: self.codec.payload_type(),
            supported_payload_types: Codec::SUPPORTED.to_vec(),
            register_expires: self.register_expires,
        }
    }
}

/// How the codec was picked in the builder.
#[derive(Debug, Clone, Copy)]
enum CodecChoice {
    PayloadType(u8),
    /// Firmware-style selector: 0 is PCMU, 1 is PCMA.
    Index(u8),
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationConfigBuilder {
    sip_ip: Option<IpAddr>,
    sip_port: Option<u16>,
    local_ip: Option<IpAddr>,
    local_port: Option<u16>,
    rtp_port: Option<u16>,
    user: Option<String>,
    password: String,
    codec: Option<CodecChoice>,
    gain: GainConfig,
    start_on_boot: bool,
    register_expires: Option<u32>,
    audio: AudioFormat,
}

impl RegistrationConfigBuilder {
    pub fn sip_server(mut self, ip: IpAddr, port: u16) -> Self {
        self.sip_ip = Some(ip);
        self.sip_port = Some(port);
        self
    }

    pub fn sip_ip(mut self, ip: IpAddr) -> Self {
        self.sip_ip = Some(ip);
        self
    }

    pub fn local(mut self, ip: IpAddr, port: u16) -> Self {
        self.local_ip = Some(ip);
        self.local_port = Some(port);
        self
    }

    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    pub fn rtp_port(mut self, port: u16) -> Self {
        self.rtp_port = Some(port);
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = password.into();
        self
    }

    /// RTP payload type to offer: 0 (PCMU) or 8 (PCMA). This is not the
    /// firmware's `codec` index, where PCMA is 1; see [`codec_index`].
    ///
    /// [`codec_index`]: Self::codec_index
    pub fn codec(mut self, payload_type: u8) -> Self {
        self.codec = Some(CodecChoice::PayloadType(payload_type));
        self
    }

    /// Codec by the firmware's selector: 0 is PCMU, 1 is PCMA.
    pub fn codec_index(mut self, index: u8) -> Self {
        self.codec = Some(CodecChoice::Index(index));
        self
    }

    pub fn mic_gain(mut self, gain: Gain) -> Self {
        self.gain.mic = gain;
        self
    }

    pub fn amp_gain(mut self, gain: Gain) -> Self {
        self.gain.amp = gain;
        self
    }

    pub fn start_on_boot(mut self, enabled: bool) -> Self {
        self.start_on_boot = enabled;
        self
    }

    pub fn register_expires(mut self, seconds: u32) -> Self {
        self.register_expires = Some(seconds);
        self
    }

    pub fn audio(mut self, format: AudioFormat) -> Self {
        self.audio = format;
        self
    }

    pub fn build(self) -> Result<RegistrationConfig, ConfigError> {
        let sip_ip = self.sip_ip.ok_or(ConfigError::Missing("sip_ip"))?;
        let local_ip = self.local_ip.ok_or(ConfigError::Missing("local_ip"))?;
        let user = self.user.ok_or(ConfigError::Missing("user"))?;
        let codec_choice = self.codec.ok_or(ConfigError::Missing("codec"))?;

        if sip_ip.is_unspecified() {
            return Err(ConfigError::invalid("sip_ip", "unspecified address"));
        }
        if local_ip.is_unspecified() {
            return Err(ConfigError::invalid("local_ip", "must be the address peers can reach"));
        }

        let sip_port = self.sip_port.unwrap_or(DEFAULT_SIP_PORT);
        let local_port = self.local_port.unwrap_or(DEFAULT_SIP_PORT);
        let rtp_port = self.rtp_port.unwrap_or(DEFAULT_RTP_PORT);
        for (field, port) in [("sip_port", sip_port), ("local_port", local_port), ("rtp_port", rtp_port)] {
            if port == 0 {
                return Err(ConfigError::invalid(field, "port 0"));
            }
        }
        if rtp_port == local_port {
            return Err(ConfigError::invalid("rtp_port", "collides with the SIP port"));
        }

        if user.is_empty() || user.chars().any(|c| c.is_whitespace() || matches!(c, '@' | ':' | ';' | '<' | '>')) {
            return Err(ConfigError::invalid("user", format!("{:?} is not a SIP user part", user)));
        }

        let codec = match codec_choice {
            CodecChoice::PayloadType(pt) => Codec::from_payload_type(pt)
                .ok_or_else(|| ConfigError::invalid("codec", format!("unsupported payload type {}", pt)))?,
            CodecChoice::Index(index) => Codec::SUPPORTED
                .get(index as usize)
                .copied()
                .and_then(Codec::from_payload_type)
                .ok_or_else(|| ConfigError::invalid("codec", format!("unknown codec index {}", index)))?,
        };

        self.gain.mic.validate("mic_gain")?;
        self.gain.amp.validate("amp_gain")?;

        let register_expires = self.register_expires.unwrap_or(DEFAULT_REGISTER_EXPIRES);
        if register_expires == 0 {
            return Err(ConfigError::invalid("register_expires", "must be non-zero"));
        }

        self.audio.validate()?;

        Ok(RegistrationConfig {
            sip_ip,
            sip_port,
            local_ip,
            local_port,
            rtp_port,
            user,
            password: self.password,
            codec,
            gain: self.gain,
            start_on_boot: self.start_on_boot,
            register_expires,
            audio: self.audio,
        })
    }
}
