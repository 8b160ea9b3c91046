use heapless::Vec;

use crate::error::AudioError;

pub const RTP_VERSION: u8 = 2;
pub const HEADER_LEN: usize = 12;
/// Largest payload we send or accept: 64 ms of G.711 at 8 kHz.
pub const MAX_PAYLOAD: usize = 512;
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_PAYLOAD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
        }
    }
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            ..Self::default()
        }
    }

    /// Fixed 12-byte header. CSRC lists and extensions are never sent.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let b0 = (self.version & 0b11) << 6 | ((self.padding as u8) << 5) | ((self.extension as u8) << 4);
        let b1 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        let seq = self.sequence_number.to_be_bytes();
        let ts = self.timestamp.to_be_bytes();
        let ssrc = self.ssrc.to_be_bytes();
        [
            b0, b1, seq[0], seq[1], ts[0], ts[1], ts[2], ts[3], ssrc[0], ssrc[1], ssrc[2], ssrc[3],
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<const N: usize> {
    pub header: RtpHeader,
    pub payload: Vec<u8, N>,
}

impl<const N: usize> RtpPacket<N> {
    pub fn new(header: RtpHeader, payload: &[u8]) -> Result<Self, AudioError> {
        let payload = Vec::from_slice(payload).map_err(|_| AudioError::BufferFull)?;
        Ok(Self { header, payload })
    }

    pub fn pack(&self) -> Result<Vec<u8, MAX_PACKET_LEN>, AudioError> {
        let mut out: Vec<u8, MAX_PACKET_LEN> = Vec::new();
        out.extend_from_slice(&self.header.to_bytes())
            .map_err(|_| AudioError::BufferFull)?;
        out.extend_from_slice(&self.payload)
            .map_err(|_| AudioError::BufferFull)?;
        Ok(out)
    }

    /// Parse a received datagram. CSRC entries and a header extension are
    /// skipped; trailing padding is removed from the payload.
    pub fn unpack(bytes: &[u8]) -> Result<Self, AudioError> {
        if bytes.len() < HEADER_LEN {
            return Err(AudioError::InvalidPacket);
        }

        let b0 = bytes[0];
        let b1 = bytes[1];
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(AudioError::UnsupportedVersion(version));
        }

        let header = RtpHeader {
            version,
            padding: (b0 & 0x20) != 0,
            extension: (b0 & 0x10) != 0,
            csrc_count: b0 & 0x0f,
            marker: (b1 & 0x80) != 0,
            payload_type: b1 & 0x7f,
            sequence_number: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        };

        let mut start = HEADER_LEN + 4 * header.csrc_count as usize;
        if header.extension {
            let ext = bytes.get(start..start + 4).ok_or(AudioError::InvalidPacket)?;
            let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
            start += 4 + 4 * words;
        }

        let mut end = bytes.len();
        if header.padding {
            let pad = *bytes.last().ok_or(AudioError::InvalidPacket)? as usize;
            if pad == 0 || pad > end {
                return Err(AudioError::InvalidPacket);
            }
            end -= pad;
        }
        if start > end {
            return Err(AudioError::InvalidPacket);
        }

        let payload = Vec::from_slice(&bytes[start..end]).map_err(|_| AudioError::BufferFull)?;
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pack_unpack() {
        let header = RtpHeader {
            marker: true,
            ..RtpHeader::new(0, 42, 160, 0x11223344)
        };
        let packet: RtpPacket<4> = RtpPacket::new(header, &[1, 2, 3, 4]).unwrap();
        let bytes = packet.pack().unwrap();
        assert_eq!(&bytes[..4], &[0x80, 0x80, 0x00, 42]);
        let unpacked: RtpPacket<4> = RtpPacket::unpack(&bytes).unwrap();
        assert_eq!(unpacked.header, header);
        assert_eq!(unpacked.payload, packet.payload);
    }

    #[test]
    fn skips_csrc_extension_and_padding() {
        let mut bytes = std::vec::Vec::new();
        // V=2, P=1, X=1, CC=1
        bytes.extend_from_slice(&[0xB1, 0x08, 0x00, 0x07, 0, 0, 0, 160, 0xde, 0xad, 0xbe, 0xef]);
        bytes.extend_from_slice(&[1, 2, 3, 4]); // CSRC
        bytes.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01, 9, 9, 9, 9]); // one-word extension
        bytes.extend_from_slice(&[0xd5, 0xd5]);
        bytes.extend_from_slice(&[0, 0, 3]); // three bytes of padding

        let packet: RtpPacket<16> = RtpPacket::unpack(&bytes).unwrap();
        assert_eq!(packet.header.payload_type, 8);
        assert_eq!(packet.header.sequence_number, 7);
        assert_eq!(packet.header.csrc_count, 1);
        assert_eq!(packet.payload.as_slice(), &[0xd5, 0xd5]);
    }

    #[test]
    fn rejects_short_and_foreign_packets() {
        assert_eq!(RtpPacket::<8>::unpack(&[0x80; 11]), Err(AudioError::InvalidPacket));

        let mut v1 = RtpHeader::new(0, 1, 0, 1).to_bytes();
        v1[0] = 0x40;
        assert_eq!(RtpPacket::<8>::unpack(&v1), Err(AudioError::UnsupportedVersion(1)));

        let mut truncated_ext = RtpHeader::new(0, 1, 0, 1).to_bytes().to_vec();
        truncated_ext[0] |= 0x10;
        assert_eq!(RtpPacket::<8>::unpack(&truncated_ext), Err(AudioError::InvalidPacket));

        let big = [0u8; 20];
        let mut oversized = RtpHeader::new(0, 1, 0, 1).to_bytes().to_vec();
        oversized.extend_from_slice(&big);
        assert_eq!(RtpPacket::<8>::unpack(&oversized), Err(AudioError::BufferFull));
    }
}
