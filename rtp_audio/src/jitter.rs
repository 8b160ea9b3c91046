use heapless::Vec;

/// Frames held for playout at 20 ms each.
pub const DEFAULT_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct JitterFrame<const FRAME: usize> {
    pub seq: u16,
    pub samples: Vec<i16, FRAME>,
}

/// What `pop_frame` handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playout {
    /// The expected frame.
    Frame,
    /// The expected frame never arrived; silence stands in for it.
    Concealed,
    /// Nothing to play yet.
    Silence,
}

impl Playout {
    pub fn is_real(self) -> bool {
        self == Playout::Frame
    }
}

/// Reorders decoded frames by RTP sequence number. Frames shorter than
/// `frame_len` are padded with silence; longer ones are kept whole, up to
/// `FRAME` samples, and handed back as they are.
#[derive(Debug)]
pub struct JitterBuffer<const CAP: usize, const FRAME: usize> {
    next_seq: Option<u16>,
    frame_len: usize,
    frames: Vec<JitterFrame<FRAME>, CAP>,
}

impl<const CAP: usize, const FRAME: usize> Default for JitterBuffer<CAP, FRAME> {
    fn default() -> Self {
        Self::new(FRAME)
    }
}

impl<const CAP: usize, const FRAME: usize> JitterBuffer<CAP, FRAME> {
    pub fn new(frame_len: usize) -> Self {
        Self {
            next_seq: None,
            frame_len: frame_len.clamp(1, FRAME),
            frames: Vec::new(),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn reset(&mut self) {
        self.next_seq = None;
        self.frames.clear();
    }

    /// Queue a decoded frame. Returns false when it was dropped as late or
    /// already buffered. Samples beyond `FRAME` are discarded.
    pub fn push_frame(&mut self, seq: u16, samples: &[i16]) -> bool {
        if let Some(next) = self.next_seq {
            if distance(next, seq) < 0 {
                return false;
            }
        }
        if self.frames.iter().any(|f| f.seq == seq) {
            return false;
        }

        if self.frames.is_full() {
            if let Some(pos) = self.oldest() {
                let evicted = self.frames.swap_remove(pos);
                if self.next_seq.is_some_and(|next| distance(next, evicted.seq) >= 0) {
                    self.next_seq = Some(evicted.seq.wrapping_add(1));
                }
            }
        }

        let mut buf: Vec<i16, FRAME> = Vec::new();
        for s in samples.iter().copied().take(FRAME) {
            let _ = buf.push(s);
        }
        while buf.len() < self.frame_len {
            let _ = buf.push(0);
        }

        self.frames.push(JitterFrame { seq, samples: buf }).is_ok()
    }

    pub fn pop_frame(&mut self) -> (Vec<i16, FRAME>, Playout) {
        if self.frames.is_empty() {
            return (self.silence(), Playout::Silence);
        }

        let expected = match self.next_seq {
            Some(s) => s,
            None => {
                let Some(first) = self.oldest().map(|pos| self.frames[pos].seq) else {
                    return (self.silence(), Playout::Silence);
                };
                self.next_seq = Some(first);
                first
            }
        };

        if let Some(pos) = self.frames.iter().position(|f| f.seq == expected) {
            let frame = self.frames.swap_remove(pos);
            self.next_seq = Some(expected.wrapping_add(1));
            return (frame.samples, Playout::Frame);
        }

        // Buffer is backed up behind a hole: jump to the oldest frame.
        if self.frames.is_full() {
            if let Some(pos) = self.oldest() {
                let frame = self.frames.swap_remove(pos);
                self.next_seq = Some(frame.seq.wrapping_add(1));
                return (frame.samples, Playout::Frame);
            }
        }

        // Later frames are waiting, so the expected one is most likely lost.
        if self.frames.len() >= 2 {
            self.next_seq = Some(expected.wrapping_add(1));
            return (self.silence(), Playout::Concealed);
        }

        (self.silence(), Playout::Silence)
    }

    fn oldest(&self) -> Option<usize> {
        let first = self.frames.first()?.seq;
        self.frames
            .iter()
            .enumerate()
            .min_by_key(|(_, f)| distance(first, f.seq))
            .map(|(pos, _)| pos)
    }

    fn silence(&self) -> Vec<i16, FRAME> {
        let mut buf: Vec<i16, FRAME> = Vec::new();
        for _ in 0..self.frame_len {
            let _ = buf.push(0);
        }
        buf
    }
}

fn distance(from: u16, to: u16) -> i16 {
    to.wrapping_sub(from) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_buffer_reordering() {
        let mut jb: JitterBuffer<4, 4> = JitterBuffer::new(4);
        jb.push_frame(2, &[20, 21, 22, 23]);
        jb.push_frame(1, &[10, 11, 12, 13]);

        let (f1, p1) = jb.pop_frame();
        assert_eq!(p1, Playout::Frame);
        assert_eq!(f1[..], [10, 11, 12, 13]);

        let (f2, p2) = jb.pop_frame();
        assert!(p2.is_real());
        assert_eq!(f2[..], [20, 21, 22, 23]);

        let (f3, p3) = jb.pop_frame();
        assert_eq!(p3, Playout::Silence);
        assert_eq!(f3[..], [0, 0, 0, 0]);
    }

    #[test]
    fn underrun_does_not_skip_ahead() {
        let mut jb: JitterBuffer<3, 3> = JitterBuffer::new(3);
        jb.push_frame(5, &[1, 2, 3]);
        assert_eq!(jb.pop_frame().1, Playout::Frame);

        // Two silent ticks while the network stalls.
        assert_eq!(jb.pop_frame().1, Playout::Silence);
        assert_eq!(jb.pop_frame().1, Playout::Silence);

        jb.push_frame(6, &[4, 5, 6]);
        let (frame, playout) = jb.pop_frame();
        assert_eq!(playout, Playout::Frame);
        assert_eq!(frame[..], [4, 5, 6]);
    }

    #[test]
    fn conceals_a_lost_frame_once_later_ones_queue_up() {
        let mut jb: JitterBuffer<10, 2> = JitterBuffer::new(2);
        jb.push_frame(10, &[1, 1]);
        assert_eq!(jb.pop_frame().1, Playout::Frame);

        jb.push_frame(12, &[3, 3]);
        assert_eq!(jb.pop_frame().1, Playout::Silence);
        jb.push_frame(13, &[4, 4]);
        assert_eq!(jb.pop_frame().1, Playout::Concealed);

        let (frame, playout) = jb.pop_frame();
        assert_eq!(playout, Playout::Frame);
        assert_eq!(frame[..], [3, 3]);
        assert_eq!(jb.pop_frame().0[..], [4, 4]);
    }

    #[test]
    fn drops_late_and_duplicate_frames() {
        let mut jb: JitterBuffer<4, 2> = JitterBuffer::new(2);
        assert!(jb.push_frame(100, &[1, 1]));
        assert!(!jb.push_frame(100, &[1, 1]));
        jb.pop_frame();
        assert!(!jb.push_frame(99, &[9, 9]));
        assert!(!jb.push_frame(100, &[9, 9]));
        assert!(jb.is_empty());
    }

    #[test]
    fn long_frames_are_kept_whole() {
        let mut jb: JitterBuffer<4, 8> = JitterBuffer::new(4);
        jb.push_frame(1, &[1, 2, 3, 4, 5, 6]);
        let (frame, playout) = jb.pop_frame();
        assert_eq!(playout, Playout::Frame);
        assert_eq!(frame[..], [1, 2, 3, 4, 5, 6]);

        jb.push_frame(2, &[7; 10]);
        assert_eq!(jb.pop_frame().0.len(), 8);
    }

    #[test]
    fn full_buffer_evicts_oldest_and_pads_short_frames() {
        let mut jb: JitterBuffer<3, 4> = JitterBuffer::new(4);
        for seq in [65534u16, 65535, 0, 1] {
            assert!(jb.push_frame(seq, &[seq as i16]));
        }
        assert_eq!(jb.len(), 3);
        let (frame, playout) = jb.pop_frame();
        assert_eq!(playout, Playout::Frame);
        assert_eq!(frame[..], [-1, 0, 0, 0]);
    }
}
