//! G.711 A-law (PCMA, payload type 8).

/// Segment end points for the 13-bit magnitude.
const SEG_END: [i16; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    match SEG_END.iter().position(|&end| pcm <= end) {
        None => 0x7F ^ mask,
        Some(seg) => {
            let shift = if seg < 2 { 1 } else { seg };
            let code = ((seg as u8) << 4) | ((pcm >> shift) & 0x0F) as u8;
            code ^ mask
        }
    }
}

pub fn decode_sample(code: u8) -> i16 {
    let a = code ^ 0x55;
    let mut t = ((a & 0x0F) as i16) << 4;
    let seg = (a & 0x70) >> 4;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & 0x80 != 0 {
        t
    } else {
        -t
    }
}
