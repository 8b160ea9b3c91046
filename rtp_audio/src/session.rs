//! Per-call RTP sequence and timestamp bookkeeping.
//!
//! The receive side keeps the highest sequence number seen (the window head)
//! and a 64-packet history bitmap behind it, in the manner of RFC 3550 A.1.

use log::{debug, warn};

use crate::{error::AudioError, rtp::RtpHeader};

/// How far behind the head a missing packet may arrive and still be played.
pub const REORDER_TOLERANCE: u16 = 8;
/// Largest forward jump accepted without probation.
pub const MAX_DROPOUT: u16 = 3000;
/// Consecutive in-sequence packets a new SSRC must send before it replaces
/// the current source.
pub const MIN_SEQUENTIAL: u8 = 2;
const HISTORY: i32 = 64;

/// How a received packet relates to the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqClass {
    /// First packet of the stream.
    First,
    /// Exactly head + 1.
    InOrder,
    /// Ahead of head + 1; the value is the number of packets skipped.
    Loss(u16),
    /// A missing packet arriving late but inside the tolerance.
    Reordered,
    Duplicate,
    /// Too old to play.
    Stale,
    /// Window restarted after a confirmed discontinuity or a new source.
    Resync,
}

impl SeqClass {
    /// Whether the packet's audio should be played.
    pub fn is_playable(self) -> bool {
        !matches!(self, SeqClass::Duplicate | SeqClass::Stale)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub lost: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub reordered: u64,
    pub resyncs: u64,
    pub ssrc_mismatches: u64,
    pub payload_type_mismatches: u64,
    pub malformed: u64,
    pub foreign_source: u64,
    pub concealed: u64,
    /// Packets with more samples than a playout frame can hold.
    pub truncated: u64,
}

#[derive(Debug)]
pub struct RtpSession {
    ssrc: u32,
    payload_type: u8,
    local_seq: u16,
    local_timestamp: u32,
    remote_ssrc: Option<u32>,
    remote_head: Option<u16>,
    received: u64,
    bad_seq: Option<u16>,
    candidate: Option<Candidate>,
    stats: RtpStats,
}

/// A new SSRC on probation.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    ssrc: u32,
    next_seq: u16,
    seen: u8,
}

impl RtpSession {
    /// Random initial sequence number and timestamp.
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self::with_initial(ssrc, payload_type, rand::random(), rand::random())
    }

    pub fn with_initial(ssrc: u32, payload_type: u8, seq: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            payload_type,
            local_seq: seq,
            local_timestamp: timestamp,
            remote_ssrc: None,
            remote_head: None,
            received: 0,
            bad_seq: None,
            candidate: None,
            stats: RtpStats::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Sequence number the next outgoing packet will carry.
    pub fn local_seq(&self) -> u16 {
        self.local_seq
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.remote_ssrc
    }

    /// Highest sequence number received so far.
    pub fn remote_head(&self) -> Option<u16> {
        self.remote_head
    }

    pub fn stats(&self) -> &RtpStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RtpStats {
        &mut self.stats
    }

    /// Header for the next outgoing packet of `samples` samples. Advances the
    /// sequence number by one and the timestamp by the sample count.
    pub fn next_header(&mut self, samples: u32) -> RtpHeader {
        let header = RtpHeader::new(self.payload_type, self.local_seq, self.local_timestamp, self.ssrc);
        self.local_seq = self.local_seq.wrapping_add(1);
        self.local_timestamp = self.local_timestamp.wrapping_add(samples);
        self.stats.packets_sent += 1;
        header
    }

    /// Validate a received header and classify it against the window.
    pub fn on_receive(&mut self, header: &RtpHeader) -> Result<SeqClass, AudioError> {
        if header.payload_type != self.payload_type {
            self.stats.payload_type_mismatches += 1;
            return Err(AudioError::PayloadTypeMismatch(header.payload_type));
        }
        match self.remote_ssrc {
            Some(ssrc) if ssrc != header.ssrc => {
                if !self.probe_source(header) {
                    self.stats.ssrc_mismatches += 1;
                    return Err(AudioError::SsrcMismatch(header.ssrc));
                }
                warn!("rtp: remote ssrc changed {:#010x} -> {:#010x}", ssrc, header.ssrc);
                self.stats.packets_received += 1;
                self.stats.resyncs += 1;
                return Ok(SeqClass::Resync);
            }
            Some(_) => self.candidate = None,
            None => self.remote_ssrc = Some(header.ssrc),
        }

        self.stats.packets_received += 1;
        let class = self.classify(header.sequence_number);
        match class {
            SeqClass::Loss(n) => {
                self.stats.lost += n as u64;
                debug!("rtp: {} packet(s) lost before seq {}", n, header.sequence_number);
            }
            SeqClass::Reordered => {
                self.stats.reordered += 1;
                self.stats.lost = self.stats.lost.saturating_sub(1);
            }
            SeqClass::Duplicate => self.stats.duplicates += 1,
            SeqClass::Stale => self.stats.stale += 1,
            SeqClass::Resync => {
                self.stats.resyncs += 1;
                warn!("rtp: sequence resync at {}", header.sequence_number);
            }
            SeqClass::First | SeqClass::InOrder => {}
        }
        Ok(class)
    }

    fn classify(&mut self, seq: u16) -> SeqClass {
        let Some(head) = self.remote_head else {
            self.restart(seq);
            return SeqClass::First;
        };

        let delta = seq.wrapping_sub(head) as i16 as i32;
        if delta > 0 && delta <= MAX_DROPOUT as i32 {
            self.bad_seq = None;
            self.received = if delta >= HISTORY { 0 } else { self.received << delta };
            self.received |= 1;
            self.remote_head = Some(seq);
            return match delta {
                1 => SeqClass::InOrder,
                gap => SeqClass::Loss((gap - 1) as u16),
            };
        }

        if delta <= 0 && -delta < HISTORY {
            let bit = 1u64 << -delta;
            if self.received & bit != 0 {
                return SeqClass::Duplicate;
            }
            if -delta <= REORDER_TOLERANCE as i32 {
                self.received |= bit;
                return SeqClass::Reordered;
            }
            return SeqClass::Stale;
        }

        // Far outside the window: wait for the next packet to confirm the
        // new position before following it.
        if self.bad_seq == Some(seq) {
            self.restart(seq);
            return SeqClass::Resync;
        }
        self.bad_seq = Some(seq.wrapping_add(1));
        SeqClass::Stale
    }

    /// Track a foreign SSRC. Returns true once it has sent enough packets in
    /// sequence to take over; the window then restarts at its sequence.
    fn probe_source(&mut self, header: &RtpHeader) -> bool {
        let seen = match self.candidate {
            Some(c) if c.ssrc == header.ssrc && c.next_seq == header.sequence_number => c.seen + 1,
            _ => 1,
        };
        if seen < MIN_SEQUENTIAL {
            self.candidate = Some(Candidate {
                ssrc: header.ssrc,
                next_seq: header.sequence_number.wrapping_add(1),
                seen,
            });
            return false;
        }
        self.candidate = None;
        self.remote_ssrc = Some(header.ssrc);
        self.restart(header.sequence_number);
        true
    }

    fn restart(&mut self, seq: u16) {
        self.remote_head = Some(seq);
        self.received = 1;
        self.bad_seq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSRC: u32 = 0x5eed;

    fn packet(seq: u16) -> RtpHeader {
        RtpHeader::new(0, seq, seq as u32 * 160, SSRC)
    }

    fn receive(session: &mut RtpSession, seq: u16) -> SeqClass {
        session.on_receive(&packet(seq)).unwrap()
    }

    fn primed(head: u16) -> RtpSession {
        let mut session = RtpSession::with_initial(1, 0, 0, 0);
        for seq in head - 20..=head {
            receive(&mut session, seq);
        }
        session
    }

    #[test]
    fn sender_advances_once_per_packet() {
        let mut session = RtpSession::with_initial(7, 8, 65535, 1000);
        let first = session.next_header(160);
        let second = session.next_header(160);
        assert_eq!((first.sequence_number, first.timestamp), (65535, 1000));
        assert_eq!((second.sequence_number, second.timestamp), (0, 1160));
        assert_eq!(second.payload_type, 8);
        assert_eq!(second.ssrc, 7);
        assert_eq!(session.stats().packets_sent, 2);
    }

    #[test]
    fn next_sequence_advances_without_loss() {
        let mut session = primed(100);
        assert_eq!(receive(&mut session, 101), SeqClass::InOrder);
        assert_eq!(session.remote_head(), Some(101));
        assert_eq!(session.stats().lost, 0);
    }

    #[test]
    fn gap_reports_exact_loss() {
        let mut session = primed(100);
        assert_eq!(receive(&mut session, 105), SeqClass::Loss(4));
        assert_eq!(session.stats().lost, 4);

        assert_eq!(receive(&mut session, 103), SeqClass::Reordered);
        assert_eq!(session.stats().lost, 3);
        assert_eq!(session.stats().reordered, 1);
        assert_eq!(receive(&mut session, 103), SeqClass::Duplicate);
    }

    #[test]
    fn sixteen_behind_is_dropped() {
        let mut session = primed(100);
        assert_eq!(receive(&mut session, 100 - 0x10), SeqClass::Duplicate);

        let mut sparse = RtpSession::with_initial(1, 0, 0, 0);
        receive(&mut sparse, 50);
        receive(&mut sparse, 100);
        assert_eq!(receive(&mut sparse, 100 - 0x10), SeqClass::Stale);
        assert!(!SeqClass::Stale.is_playable());
        assert_eq!(sparse.remote_head(), Some(100));
        assert_eq!(sparse.stats().stale, 1);
    }

    #[test]
    fn window_wraps_around_sequence_space() {
        let mut session = RtpSession::with_initial(1, 0, 0, 0);
        assert_eq!(receive(&mut session, 65534), SeqClass::First);
        assert_eq!(receive(&mut session, 65535), SeqClass::InOrder);
        assert_eq!(receive(&mut session, 1), SeqClass::Loss(1));
        assert_eq!(receive(&mut session, 0), SeqClass::Reordered);
    }

    #[test]
    fn large_jump_needs_confirmation() {
        let mut session = primed(100);
        assert_eq!(receive(&mut session, 40000), SeqClass::Stale);
        assert_eq!(session.remote_head(), Some(100));
        assert_eq!(receive(&mut session, 40001), SeqClass::Resync);
        assert_eq!(session.remote_head(), Some(40001));
        assert_eq!(receive(&mut session, 40002), SeqClass::InOrder);
    }

    #[test]
    fn new_ssrc_takes_over_after_probation() {
        let mut session = primed(100);
        let switched = |seq: u16| {
            let mut h = packet(seq);
            h.ssrc = 0xb0b;
            h
        };

        assert_eq!(session.on_receive(&switched(9000)), Err(AudioError::SsrcMismatch(0xb0b)));
        assert_eq!(session.on_receive(&switched(9001)), Ok(SeqClass::Resync));
        assert_eq!(session.remote_ssrc(), Some(0xb0b));
        assert_eq!(session.remote_head(), Some(9001));
        for seq in 9002..9100 {
            assert_eq!(session.on_receive(&switched(seq)), Ok(SeqClass::InOrder));
        }
        assert_eq!(session.stats().ssrc_mismatches, 1);
        assert_eq!(session.stats().resyncs, 1);

        // The old source is now the stranger.
        assert_eq!(session.on_receive(&packet(101)), Err(AudioError::SsrcMismatch(SSRC)));
    }

    #[test]
    fn interleaved_stray_ssrc_never_takes_over() {
        let mut session = primed(100);
        for (i, seq) in (101..111u16).enumerate() {
            let mut stray = packet(5000 + i as u16 * 2);
            stray.ssrc = 77;
            assert!(session.on_receive(&stray).is_err());
            assert!(session.on_receive(&packet(seq)).is_ok());
        }
        assert_eq!(session.remote_ssrc(), Some(SSRC));
        assert_eq!(session.stats().ssrc_mismatches, 10);
    }

    #[test]
    fn foreign_ssrc_and_payload_type_are_rejected() {
        let mut session = primed(100);
        let mut other = packet(101);
        other.ssrc = 99;
        assert_eq!(session.on_receive(&other), Err(AudioError::SsrcMismatch(99)));

        let mut wrong_pt = packet(101);
        wrong_pt.payload_type = 8;
        assert_eq!(session.on_receive(&wrong_pt), Err(AudioError::PayloadTypeMismatch(8)));

        assert_eq!(session.stats().ssrc_mismatches, 1);
        assert_eq!(session.stats().payload_type_mismatches, 1);
        assert_eq!(session.remote_head(), Some(100));
    }
}
