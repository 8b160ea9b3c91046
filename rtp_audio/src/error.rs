use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("invalid packet")]
    InvalidPacket,
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("buffer full")]
    BufferFull,
    #[error("unexpected payload type {0}")]
    PayloadTypeMismatch(u8),
    #[error("unexpected SSRC {0:#010x}")]
    SsrcMismatch(u32),
    #[error("media from an unexpected host")]
    UnexpectedSource,
    #[error("unsupported payload type {0}")]
    UnsupportedCodec(u8),
}
