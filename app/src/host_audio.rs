use std::io::Write;
use std::path::Path;

use log::{info, warn};
use voip::{AudioFrame, AudioIoError, AudioTransport, Direction};

const SAMPLE_RATE: u32 = 8_000;
const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 3000.0;

/// Host stand-in for the codec chip: the microphone plays a steady tone and
/// everything sent to the speaker is kept and written out as a WAV file
/// when the call ends.
#[derive(Debug)]
pub struct HostAudio {
    frame_samples: usize,
    phase: u32,
    speaker: Vec<i16>,
}

impl HostAudio {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            phase: 0,
            speaker: Vec::new(),
        }
    }

    fn dump_wav_to_path<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        if self.speaker.is_empty() {
            return Ok(());
        }

        let channels = 1u16;
        let bits_per_sample = 16u16;
        let byte_rate = SAMPLE_RATE * channels as u32 * (bits_per_sample as u32 / 8);
        let block_align = channels * bits_per_sample / 8;
        let data_len = (self.speaker.len() * 2) as u32;
        let chunk_size = 4 + (8 + 16) + (8 + data_len);

        let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);

        f.write_all(b"RIFF")?;
        f.write_all(&chunk_size.to_le_bytes())?;
        f.write_all(b"WAVE")?;

        f.write_all(b"fmt ")?;
        f.write_all(&16u32.to_le_bytes())?;
        f.write_all(&1u16.to_le_bytes())?;
        f.write_all(&channels.to_le_bytes())?;
        f.write_all(&SAMPLE_RATE.to_le_bytes())?;
        f.write_all(&byte_rate.to_le_bytes())?;
        f.write_all(&block_align.to_le_bytes())?;
        f.write_all(&bits_per_sample.to_le_bytes())?;

        f.write_all(b"data")?;
        f.write_all(&data_len.to_le_bytes())?;
        for sample in &self.speaker {
            f.write_all(&sample.to_le_bytes())?;
        }
        f.flush()
    }
}

impl AudioTransport for HostAudio {
    fn read_mic_frame(&mut self) -> Option<AudioFrame> {
        let step = TONE_HZ / SAMPLE_RATE as f32;
        let mut frame = AudioFrame::silence(Direction::Capture, self.frame_samples);
        for sample in frame.samples.iter_mut() {
            let t = self.phase as f32 * step;
            *sample = ((t * std::f32::consts::TAU).sin() * TONE_AMPLITUDE) as i16;
            self.phase = (self.phase + 1) % SAMPLE_RATE;
        }
        Some(frame)
    }

    fn write_speaker_frame(&mut self, frame: &AudioFrame) -> Result<(), AudioIoError> {
        self.speaker.extend_from_slice(&frame.samples);
        Ok(())
    }

    fn start(&mut self) {
        self.speaker.clear();
        self.phase = 0;
    }

    fn stop(&mut self) {
        let path = format!("call_{:08x}.wav", rand::random::<u32>());
        match self.dump_wav_to_path(&path) {
            Ok(()) if !self.speaker.is_empty() => {
                info!("wrote {} ({} samples of received audio)", path, self.speaker.len())
            }
            Ok(()) => {}
            Err(e) => warn!("failed to write {}: {}", path, e),
        }
        self.speaker.clear();
    }
}
