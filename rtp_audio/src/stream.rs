use std::net::SocketAddr;

use heapless::Vec;
use log::{debug, warn};

use crate::{
    codecs::Codec,
    error::AudioError,
    jitter::{JitterBuffer, Playout, DEFAULT_DEPTH},
    rtp::{RtpPacket, MAX_PACKET_LEN, MAX_PAYLOAD},
    session::{RtpSession, RtpStats, SeqClass},
};

/// Largest frame the playout path handles: 60 ms at 8 kHz.
pub const MAX_FRAME_SAMPLES: usize = 480;

pub type PcmFrame = Vec<i16, MAX_FRAME_SAMPLES>;

/// Room for one partly played packet plus the next one.
const CARRY_SAMPLES: usize = 2 * MAX_FRAME_SAMPLES;

/// One call's media: outgoing packetizer, incoming classifier, playout buffer.
#[derive(Debug)]
pub struct RtpStream {
    codec: Codec,
    signaled: SocketAddr,
    remote: SocketAddr,
    session: RtpSession,
    jitter: JitterBuffer<DEFAULT_DEPTH, MAX_FRAME_SAMPLES>,
    /// Received samples not yet played, when packets are longer than a frame.
    carry: Vec<i16, CARRY_SAMPLES>,
}

impl RtpStream {
    pub fn new(codec: Codec, remote: SocketAddr, ssrc: u32, frame_samples: usize) -> Self {
        Self::with_session(codec, remote, RtpSession::new(ssrc, codec.payload_type()), frame_samples)
    }

    pub fn with_session(codec: Codec, remote: SocketAddr, session: RtpSession, frame_samples: usize) -> Self {
        Self {
            codec,
            signaled: remote,
            remote,
            session,
            jitter: JitterBuffer::new(frame_samples),
            carry: Vec::new(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Where outgoing packets go: the signalled endpoint until media arrives
    /// from the peer, then the observed source.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn session(&self) -> &RtpSession {
        &self.session
    }

    pub fn stats(&self) -> &RtpStats {
        self.session.stats()
    }

    /// Encode one PCM frame into a ready-to-send datagram.
    pub fn packetize(&mut self, pcm: &[i16]) -> Result<Vec<u8, MAX_PACKET_LEN>, AudioError> {
        let payload = self.codec.encode(pcm)?;
        let header = self.session.next_header(pcm.len() as u32);
        RtpPacket::<MAX_PAYLOAD>::new(header, &payload)?.pack()
    }

    /// Classify, decode and queue one received datagram.
    pub fn receive(&mut self, datagram: &[u8]) -> Result<SeqClass, AudioError> {
        let packet = match RtpPacket::<MAX_PAYLOAD>::unpack(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                self.session.stats_mut().malformed += 1;
                return Err(err);
            }
        };

        let class = self.session.on_receive(&packet.header)?;
        match class {
            SeqClass::Resync => {
                self.jitter.reset();
                self.carry.clear();
            }
            SeqClass::Duplicate | SeqClass::Stale => {
                debug!("rtp: dropping {:?} seq {}", class, packet.header.sequence_number);
                return Ok(class);
            }
            _ => {}
        }

        let pcm = self.codec.decode(&packet.payload)?;
        if pcm.len() > MAX_FRAME_SAMPLES {
            self.session.stats_mut().truncated += 1;
            warn!(
                "rtp: {} samples in seq {}, playing only {}",
                pcm.len(),
                packet.header.sequence_number,
                MAX_FRAME_SAMPLES
            );
        }
        self.jitter.push_frame(packet.header.sequence_number, &pcm);
        Ok(class)
    }

    /// Like [`receive`](Self::receive) for a datagram from `source`. Only the
    /// signalled host is accepted (any port, for NAT); the port of the last
    /// accepted packet becomes the send target.
    pub fn receive_from(&mut self, source: SocketAddr, datagram: &[u8]) -> Result<SeqClass, AudioError> {
        if source.ip() != self.signaled.ip() {
            self.session.stats_mut().foreign_source += 1;
            return Err(AudioError::UnexpectedSource);
        }
        let class = self.receive(datagram)?;
        if class.is_playable() && source != self.remote {
            debug!("rtp: peer observed at {}", source);
            self.remote = source;
        }
        Ok(class)
    }

    /// Next frame for the speaker and whether it carries received audio.
    /// Packets longer than the frame are played across several calls.
    pub fn playout(&mut self) -> (PcmFrame, bool) {
        let frame_len = self.jitter.frame_len();
        let mut real = !self.carry.is_empty();

        if self.carry.len() < frame_len {
            let (frame, playout) = self.jitter.pop_frame();
            if playout == Playout::Concealed {
                self.session.stats_mut().concealed += 1;
            }
            if self.carry.is_empty() && frame.len() == frame_len {
                return (frame, playout.is_real());
            }
            if playout != Playout::Silence {
                real |= playout.is_real();
                let _ = self.carry.extend_from_slice(&frame);
            }
        }

        let take = frame_len.min(self.carry.len());
        let mut out = PcmFrame::new();
        let _ = out.extend_from_slice(&self.carry[..take]);
        while out.len() < frame_len {
            let _ = out.push(0);
        }
        let rest = self.carry.len() - take;
        self.carry.rotate_left(take);
        self.carry.truncate(rest);
        (out, real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "192.0.2.9:7078".parse().unwrap()
    }

    fn pair(codec: Codec) -> (RtpStream, RtpStream) {
        let pt = codec.payload_type();
        let tx = RtpStream::with_session(codec, remote(), RtpSession::with_initial(0xaa, pt, 1000, 0), 160);
        let rx = RtpStream::with_session(codec, remote(), RtpSession::with_initial(0xbb, pt, 0, 0), 160);
        (tx, rx)
    }

    fn tone() -> [i16; 160] {
        let mut pcm = [0i16; 160];
        for (i, s) in pcm.iter_mut().enumerate() {
            *s = if i % 20 < 10 { 4000 } else { -4000 };
        }
        pcm
    }

    #[test]
    fn packets_flow_from_sender_to_speaker() {
        let (mut tx, mut rx) = pair(Codec::Pcma);
        let first = tx.packetize(&tone()).unwrap();
        assert_eq!(first.len(), 12 + 160);
        assert_eq!(first[1], 8);
        assert_eq!(rx.receive(&first).unwrap(), SeqClass::First);

        let second = tx.packetize(&tone()).unwrap();
        assert_eq!(rx.receive(&second).unwrap(), SeqClass::InOrder);
        assert_eq!(tx.session().local_seq(), 1002);

        let (frame, real) = rx.playout();
        assert!(real);
        assert_eq!(frame.len(), 160);
        assert!((frame[0] - 4000).abs() < 200);
        assert_eq!(rx.stats().packets_received, 2);
    }

    #[test]
    fn loss_is_counted_and_concealed() {
        let (mut tx, mut rx) = pair(Codec::Pcmu);
        let packets: std::vec::Vec<_> = (0..4).map(|_| tx.packetize(&tone()).unwrap()).collect();

        rx.receive(&packets[0]).unwrap();
        assert!(rx.playout().1);
        assert_eq!(rx.receive(&packets[2]).unwrap(), SeqClass::Loss(1));
        rx.receive(&packets[3]).unwrap();
        assert!(!rx.playout().1);
        assert!(rx.playout().1);
        assert_eq!(rx.stats().lost, 1);
        assert_eq!(rx.stats().concealed, 1);

        assert_eq!(rx.receive(&packets[2]).unwrap(), SeqClass::Duplicate);
    }

    #[test]
    fn long_packets_are_played_across_frames() {
        let (mut tx, mut rx) = pair(Codec::Pcmu);
        rx.receive(&tx.packetize(&[1000; 240]).unwrap()).unwrap();
        rx.receive(&tx.packetize(&[-1000; 240]).unwrap()).unwrap();

        let (first, real) = rx.playout();
        assert!(real);
        assert_eq!(first.len(), 160);
        assert!(first.iter().all(|&s| (s - 1000).abs() < 100));

        let (second, real) = rx.playout();
        assert!(real);
        assert!(second[..80].iter().all(|&s| s > 900));
        assert!(second[80..].iter().all(|&s| s < -900));

        let (third, real) = rx.playout();
        assert!(real);
        assert!(third.iter().all(|&s| s < -900));

        let (after, real) = rx.playout();
        assert!(!real);
        assert_eq!(after.len(), 160);
        assert_eq!(rx.stats().truncated, 0);
        assert_eq!(rx.stats().concealed, 0);
    }

    #[test]
    fn a_lone_long_packet_is_padded_at_its_end() {
        let (mut tx, mut rx) = pair(Codec::Pcma);
        rx.receive(&tx.packetize(&[2000; 240]).unwrap()).unwrap();
        assert!(rx.playout().1);
        let (tail, real) = rx.playout();
        assert!(real);
        assert!(tail[..80].iter().all(|&s| s > 1800));
        assert!(tail[80..].iter().all(|&s| s == 0));
        assert!(!rx.playout().1);
    }

    #[test]
    fn media_from_other_hosts_is_refused_and_port_is_latched() {
        let (mut tx, mut rx) = pair(Codec::Pcmu);
        let packet = tx.packetize(&tone()).unwrap();
        let stranger: SocketAddr = "198.51.100.1:7078".parse().unwrap();
        assert_eq!(rx.receive_from(stranger, &packet), Err(AudioError::UnexpectedSource));
        assert_eq!(rx.stats().foreign_source, 1);

        let natted: SocketAddr = "192.0.2.9:40000".parse().unwrap();
        assert_eq!(rx.receive_from(natted, &packet).unwrap(), SeqClass::First);
        assert_eq!(rx.remote(), natted);
    }

    #[test]
    fn malformed_datagrams_are_counted() {
        let (_, mut rx) = pair(Codec::Pcmu);
        assert_eq!(rx.receive(&[0x80, 0]), Err(AudioError::InvalidPacket));
        assert_eq!(rx.stats().malformed, 1);
        let (silence, real) = rx.playout();
        assert!(!real);
        assert!(silence.iter().all(|&s| s == 0));
        assert_eq!(silence.len(), 160);
    }
}
