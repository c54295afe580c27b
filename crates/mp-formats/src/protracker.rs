//! ProTracker MOD load and save.
//!
//! Layout: 20-byte song name, 31 sample headers of 30 bytes, song
//! length, restart byte, 128 position bytes, 4-byte magic, pattern
//! data, then the concatenated sample payloads.

use log::{debug, trace, warn};
use mp_ir::{Cell, Module, Pattern, Sample, CHANNELS, NUM_SAMPLES, ROWS};

use crate::reader::ByteReader;
use crate::FormatError;

/// Size of one pattern on the wire: 64 rows of 4 four-byte events.
pub const PATTERN_SIZE: usize = ROWS * CHANNELS * 4;

/// 4-channel magics accepted on load. Saving always writes the first.
const MAGICS: [&[u8; 4]; 4] = [b"M.K.", b"M!K!", b"FLT4", b"4CHN"];

/// Load a MOD image.
pub fn load_mod(data: &[u8]) -> Result<Module, FormatError> {
    let mut r = ByteReader::new(data);
    let mut module = Module::default();

    module.name = r.read_array()?;

    for index in 0..NUM_SAMPLES {
        module.samples[index] = read_sample_header(&mut r, index)?;
    }

    module.song.length = r.read_u8()?;
    if module.song.length as usize > mp_ir::NUM_POSITIONS {
        warn!("song length {} clamped to {}", module.song.length, mp_ir::NUM_POSITIONS);
        module.song.length = mp_ir::NUM_POSITIONS as u8;
    }
    module.song.restart = r.read_u8()?;
    module.song.positions = r.read_array()?;

    let magic: [u8; 4] = r.read_array()?;
    if !MAGICS.iter().any(|m| **m == magic) {
        return Err(FormatError::Unsupported(format!(
            "magic {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }

    // Pattern storage covers the highest pattern referenced anywhere in
    // the position table, live or not.
    let num_patterns = module.song.positions.iter().copied().max().unwrap_or(0) as usize + 1;
    for _ in 0..num_patterns {
        module.patterns.push(read_pattern(&mut r)?);
    }

    for (index, sample) in module.samples.iter_mut().enumerate() {
        if sample.is_empty() {
            continue;
        }
        let bytes = sample.length as usize * 2;
        sample.data = r.read_bytes(bytes)?.to_vec();
        trace!(" #{} - {} bytes", index + 1, bytes);
    }

    debug!(
        "loaded '{}': {} positions, {} patterns, {} samples",
        module.name_str(),
        module.song.length,
        module.patterns.len(),
        module.samples.iter().filter(|s| !s.is_empty()).count()
    );

    Ok(module)
}

fn read_sample_header(r: &mut ByteReader<'_>, index: usize) -> Result<Sample, FormatError> {
    let mut sample = Sample {
        name: r.read_array()?,
        length: r.read_u16_be()?,
        finetone: r.read_u8()?,
        volume: r.read_u8()?,
        repeat_offset: r.read_u16_be()?,
        repeat_length: r.read_u16_be()?,
        data: Vec::new(),
    };

    if sample.volume > 64 {
        warn!("sample #{}: volume {} clamped to 64", index + 1, sample.volume);
        sample.volume = 64;
    }

    if sample.is_looping() {
        let end = sample.repeat_offset as u32 + sample.repeat_length as u32;
        if sample.repeat_offset >= sample.length {
            warn!("sample #{}: loop starts past the end, loop dropped", index + 1);
            sample.repeat_offset = 0;
            sample.repeat_length = 1;
        } else if end > sample.length as u32 {
            let fixed = sample.length - sample.repeat_offset;
            warn!(
                "sample #{}: loop truncated ({} -> {} words)",
                index + 1,
                sample.repeat_length,
                fixed
            );
            sample.repeat_length = fixed;
        }
    }

    Ok(sample)
}

fn read_pattern(r: &mut ByteReader<'_>) -> Result<Pattern, FormatError> {
    let bytes = r.read_bytes(PATTERN_SIZE)?;
    let mut pattern = Pattern::new();
    for row in 0..ROWS {
        for channel in 0..CHANNELS {
            let at = (row * CHANNELS + channel) * 4;
            *pattern.cell_mut(row, channel) =
                Cell::from_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
    }
    Ok(pattern)
}

/// Save a MOD image, appending to `out`.
pub fn save_mod(module: &Module, out: &mut Vec<u8>) {
    out.extend_from_slice(&module.name);

    for sample in &module.samples {
        out.extend_from_slice(&sample.name);
        out.extend_from_slice(&sample.length.to_be_bytes());
        out.push(sample.finetone);
        out.push(sample.volume);
        out.extend_from_slice(&sample.repeat_offset.to_be_bytes());
        out.extend_from_slice(&sample.repeat_length.to_be_bytes());
    }

    out.push(module.song.length);
    out.push(module.song.restart);
    out.extend_from_slice(&module.song.positions);
    out.extend_from_slice(MAGICS[0]);

    for pattern in &module.patterns {
        for row in 0..ROWS {
            for channel in 0..CHANNELS {
                out.extend_from_slice(&pattern.cell(row, channel).to_bytes());
            }
        }
    }

    for sample in &module.samples {
        out.extend_from_slice(&sample.data);
    }

    debug!(
        "saved '{}': {} patterns, {} bytes",
        module.name_str(),
        module.patterns.len(),
        out.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_magic() {
        let mut image = vec![0u8; 1084];
        image[1080..1084].copy_from_slice(b"8CHN");
        assert!(matches!(load_mod(&image), Err(FormatError::Unsupported(_))));
    }

    #[test]
    fn rejects_short_input() {
        assert!(matches!(load_mod(&[0u8; 100]), Err(FormatError::UnexpectedEof)));

        // Valid header claiming one pattern, but no pattern bytes follow.
        let mut image = vec![0u8; 1084];
        image[1080..1084].copy_from_slice(b"M.K.");
        assert!(matches!(load_mod(&image), Err(FormatError::UnexpectedEof)));
    }

    #[test]
    fn loop_overflow_is_repaired() {
        let mut image = vec![0u8; 1084 + PATTERN_SIZE + 8];
        image[1080..1084].copy_from_slice(b"M.K.");
        // sample #1: length 4 words, loop 2..=5 (one word too long)
        image[20 + 22] = 0;
        image[20 + 23] = 4;
        image[20 + 26] = 0;
        image[20 + 27] = 2;
        image[20 + 28] = 0;
        image[20 + 29] = 3;

        let module = load_mod(&image).unwrap();
        assert_eq!(module.samples[0].repeat_offset, 2);
        assert_eq!(module.samples[0].repeat_length, 2);
    }
}
