/// Fixed gain applied to a block of PCM samples. Gain is held in Q12
/// (1.0 = 4096); results saturate at the i16 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainStage {
    gain_q12: i32,
}

impl Default for GainStage {
    fn default() -> Self {
        Self::UNITY
    }
}

impl GainStage {
    pub const UNITY: Self = Self { gain_q12: 1 << 12 };

    pub const fn from_q12(gain_q12: i32) -> Self {
        Self { gain_q12 }
    }

    /// Whole-number multiplier, 0 mutes.
    pub const fn from_linear(factor: u8) -> Self {
        Self {
            gain_q12: (factor as i32) << 12,
        }
    }

    pub fn from_db(db: i8) -> Self {
        let factor = 10f32.powf(db as f32 / 20.0);
        Self {
            gain_q12: (factor * 4096.0).round() as i32,
        }
    }

    pub fn q12(&self) -> i32 {
        self.gain_q12
    }

    pub fn apply(&self, frame: &mut [i16]) {
        if self.gain_q12 == Self::UNITY.gain_q12 {
            return;
        }
        let gain = self.gain_q12 as i64;
        for s in frame {
            let y = (*s as i64 * gain) >> 12;
            *s = y.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
        }
    }
}
