//! Seam between the engine and the host's microphone and speaker.

use heapless::Vec;
use rtp_audio::{PcmFrame, MAX_FRAME_SAMPLES};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

/// One block of 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub direction: Direction,
    pub samples: PcmFrame,
}

impl AudioFrame {
    pub fn new(direction: Direction, samples: &[i16]) -> Self {
        let len = samples.len().min(MAX_FRAME_SAMPLES);
        let mut buf = Vec::new();
        let _ = buf.extend_from_slice(&samples[..len]);
        Self {
            direction,
            samples: buf,
        }
    }

    pub fn silence(direction: Direction, len: usize) -> Self {
        let mut samples = Vec::new();
        for _ in 0..len.min(MAX_FRAME_SAMPLES) {
            let _ = samples.push(0);
        }
        Self { direction, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AudioIoError {
    /// The speaker has no room for another frame right now.
    #[error("speaker buffer full")]
    Overrun,
    #[error("audio device error")]
    Device,
}

/// Non-blocking, frame-at-a-time audio I/O.
pub trait AudioTransport {
    /// Next captured frame, or `None` when none is ready yet.
    fn read_mic_frame(&mut self) -> Option<AudioFrame>;

    fn write_speaker_frame(&mut self, frame: &AudioFrame) -> Result<(), AudioIoError>;

    /// Media is about to flow.
    fn start(&mut self) {}

    /// The call carrying media has ended.
    fn stop(&mut self) {}
}

impl<T: AudioTransport + ?Sized> AudioTransport for Box<T> {
    fn read_mic_frame(&mut self) -> Option<AudioFrame> {
        (**self).read_mic_frame()
    }

    fn write_speaker_frame(&mut self, frame: &AudioFrame) -> Result<(), AudioIoError> {
        (**self).write_speaker_frame(frame)
    }

    fn start(&mut self) {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}
