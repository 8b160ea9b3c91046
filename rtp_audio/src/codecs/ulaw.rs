//! G.711 μ-law (PCMU, payload type 0).

const BIAS: i32 = 0x84;
const CLIP: i16 = 32635;

pub fn encode_sample(sample: i16) -> u8 {
    let clamped = sample.clamp(-CLIP, CLIP);
    let sign = ((clamped >> 8) & 0x80) as u8;
    let magnitude = if clamped < 0 {
        (!clamped as i32) + BIAS
    } else {
        clamped as i32 + BIAS
    };

    let mut exponent: u8 = 0;
    let mut tmp = magnitude >> 7;
    while tmp > 1 && exponent < 7 {
        tmp >>= 1;
        exponent += 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

pub fn decode_sample(code: u8) -> i16 {
    #[cfg(feature = "table_decode")]
    {
        DECODE_TABLE[code as usize]
    }
    #[cfg(not(feature = "table_decode"))]
    {
        expand(code)
    }
}

const fn expand(code: u8) -> i16 {
    let byte = !code;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;

    let magnitude = ((((mantissa as i32) << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

#[cfg(feature = "table_decode")]
static DECODE_TABLE: [i16; 256] = {
    let mut t = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = expand(i as u8);
        i += 1;
    }
    t
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_survives_a_round_trip() {
        for b in 0u8..=255 {
            let pcm = decode_sample(b);
            assert_eq!(decode_sample(encode_sample(pcm)), pcm, "byte 0x{b:02x} changed PCM");
        }
    }

    #[test]
    fn zero_codes() {
        assert_eq!(decode_sample(0xFF), 0);
        assert_eq!(decode_sample(0x7F), 0);
        assert_eq!(encode_sample(0), 0xFF);
    }

    #[test]
    fn table_matches_expansion() {
        for b in 0u8..=255 {
            assert_eq!(decode_sample(b), expand(b), "mismatch at byte 0x{b:02x}");
        }
    }

    #[test]
    fn extremes_clip() {
        assert_eq!(encode_sample(i16::MAX), 0x80);
        assert_eq!(encode_sample(i16::MIN), 0x00);
        assert_eq!(decode_sample(0x80), 32124);
    }
}
