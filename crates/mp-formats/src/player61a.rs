//! The Player 6.1A load and save.
//!
//! Pattern data is stored as four independent per-channel tracks of
//! variable-length events:
//!
//! ```text
//! onnnnnni iiiicccc bbbbbbbb   note, instrument and command
//! o110cccc bbbbbbbb            command only
//! o1110nnn nnniiiii            note and instrument
//! o1111111                     empty event
//! ```
//!
//! `o` is the compression bit; when set, a run directive follows:
//!
//! ```text
//! 00nnnnnn                     n empty rows follow
//! 10nnnnnn                     repeat this event for n more rows
//! 01nnnnnn oooooooo            decode n+1 entries from o bytes back
//! 11nnnnnn oooooooo oooooooo   same, with a 16-bit back offset
//! ```

use std::collections::HashMap;

use arrayvec::ArrayVec;
use log::{debug, trace, warn};
use mp_ir::{
    effect, index_from_period, period_from_index, Cell, Effect, Module, Pattern, SongOrder,
    CHANNELS, NUM_SAMPLES, ROWS,
};

use crate::options::Options;
use crate::reader::ByteReader;
use crate::FormatError;

const SIGNATURE: &[u8; 4] = b"P61A";

// Event shape selectors (low seven bits of byte 0).
const CHANNEL_COMMAND: u8 = 0x60;
const CHANNEL_NOTE_INSTRUMENT: u8 = 0x70;
const CHANNEL_EMPTY: u8 = 0x7F;
const CHANNEL_COMPRESSED: u8 = 0x80;

// Directive encodings.
const COMPRESSION_DATA_BITS: u8 = 0x3F;
const COMPRESSION_EMPTY_ROWS: u8 = 0x00;
const COMPRESSION_REPEAT_ROWS: u8 = 0x80;
const COMPRESSION_JUMP: u8 = 0x40;
const COMPRESSION_JUMP_LONG: u8 = 0x80;

const SAMPLE_RECORD_SIZE: usize = 6;
const PATTERN_OFFSET_SIZE: usize = 2 * CHANNELS;

/// Back references may nest; anything deeper than this is a cycle, not
/// a module.
const MAX_RECURSION: usize = 16;

/// An encoded channel event, one to three bytes.
type EventBytes = ArrayVec<u8, 3>;

// ---------------------------------------------------------------------------
// Event codec
// ---------------------------------------------------------------------------

/// Encode one cell, normalizing the effect column on the way and
/// accumulating the observed commands into `usecode`.
fn encode_event(cell: &Cell, usecode: &mut u32) -> EventBytes {
    let note = index_from_period(cell.period);
    let instrument = cell.sample;
    let mut fx = cell.effect;

    let mut has_command = !fx.is_none();
    match fx.cmd {
        effect::CMD_ARPEGGIO => {
            // Arpeggio travels as command 8.
            if fx.arg != 0 {
                fx.cmd = effect::CMD_8;
            }
        }
        effect::CMD_SLIDE_UP | effect::CMD_SLIDE_DOWN => {
            has_command = fx.arg != 0;
        }
        effect::CMD_SET_VOLUME => {
            if fx.arg > 64 {
                fx.arg = 64;
            }
        }
        effect::CMD_8 => {
            // 8xy plays as E8y.
            fx.arg = (effect::ECMD_E8 << 4) | (fx.arg & 0x0F);
            fx.cmd = effect::CMD_EXTENDED;
        }
        effect::CMD_EXTENDED => match fx.ext_cmd() {
            effect::ECMD_FILTER => {
                fx.arg = (fx.arg & 1) << 1;
            }
            effect::ECMD_CUT_SAMPLE if fx.ext_val() == 0 => {
                // EC0 cuts on tick zero, which is a plain volume wipe.
                fx = Effect::new(effect::CMD_SET_VOLUME, 0);
            }
            effect::ECMD_FINESLIDE_UP
            | effect::ECMD_FINESLIDE_DOWN
            | effect::ECMD_RETRIGGER_SAMPLE
            | effect::ECMD_FINE_VOLUME_SLIDE_UP
            | effect::ECMD_FINE_VOLUME_SLIDE_DOWN
            | effect::ECMD_DELAY_SAMPLE
            | effect::ECMD_DELAY_PATTERN => {
                has_command = fx.ext_val() != 0;
            }
            _ => {}
        },
        // Continue-slide, continue-vibrato, volume-slide, position-jump
        // and pattern-break keep their argument bytes untouched.
        _ => {}
    }

    if has_command {
        *usecode |= if fx.cmd == effect::CMD_EXTENDED {
            1 << (fx.ext_cmd() + 16)
        } else {
            1 << fx.cmd
        };
    } else {
        fx = Effect::NONE;
    }

    let mut out = EventBytes::new();
    if note == 0 && instrument == 0 && !has_command {
        out.push(CHANNEL_EMPTY);
    } else if note != 0 && instrument != 0 && !has_command {
        out.push(CHANNEL_NOTE_INSTRUMENT | ((note >> 3) & 0x07));
        out.push(((note << 5) & 0xE0) | (instrument & 0x1F));
    } else if note == 0 && instrument == 0 {
        out.push(CHANNEL_COMMAND | (fx.cmd & 0x0F));
        out.push(fx.arg);
    } else {
        out.push(((note << 1) & 0x7E) | ((instrument >> 4) & 0x01));
        out.push(((instrument << 4) & 0xF0) | (fx.cmd & 0x0F));
        out.push(fx.arg);
    }
    out
}

/// Wire length of an event, from its first byte. Shape classification
/// uses bits 0..6 only; the compression bit rides on top of any shape.
fn event_length(b0: u8) -> usize {
    if b0 & CHANNEL_EMPTY == CHANNEL_EMPTY {
        1
    } else if b0 & CHANNEL_NOTE_INSTRUMENT == CHANNEL_NOTE_INSTRUMENT {
        2
    } else if b0 & CHANNEL_COMMAND == CHANNEL_COMMAND {
        2
    } else {
        3
    }
}

/// Materialize an event back to its MOD cell form.
fn decode_event(b: &[u8; 3]) -> Cell {
    let mut cell = Cell::empty();
    let b0 = b[0];

    if b0 & CHANNEL_EMPTY == CHANNEL_EMPTY {
        // empty
    } else if b0 & CHANNEL_NOTE_INSTRUMENT == CHANNEL_NOTE_INSTRUMENT {
        let note = ((b0 & 0x07) << 3) | ((b[1] & 0xE0) >> 5);
        cell.period = period_from_index(note);
        cell.sample = b[1] & 0x1F;
    } else if b0 & CHANNEL_COMMAND == CHANNEL_COMMAND {
        cell.effect = Effect::new(b0 & 0x0F, b[1]);
    } else {
        let note = (b0 & 0x7E) >> 1;
        cell.period = period_from_index(note);
        cell.sample = ((b0 & 0x01) << 4) | ((b[1] & 0xF0) >> 4);
        cell.effect = Effect::new(b[1] & 0x0F, b[2]);
    }

    // Command 8 is arpeggio on the MOD side.
    if cell.effect.cmd == effect::CMD_8 {
        cell.effect.cmd = effect::CMD_ARPEGGIO;
    }

    cell
}

// ---------------------------------------------------------------------------
// Track decoding
// ---------------------------------------------------------------------------

/// Decode one channel's events into `pattern`, starting at byte `pos`
/// of the track region. `budget` limits how many entries to consume
/// (0 = fill the pattern); back references recurse with their own
/// budget. Returns the row cursor after the last decoded entry.
fn decode_track(
    region: &[u8],
    mut pos: usize,
    pattern: &mut Pattern,
    channel: usize,
    mut row: usize,
    budget: usize,
    depth: usize,
) -> Result<usize, FormatError> {
    if depth >= MAX_RECURSION {
        return Err(FormatError::Malformed("back references nest too deep"));
    }

    let mut budget = budget;
    while row < ROWS {
        let start = pos;
        let b0 = *region.get(pos).ok_or(FormatError::UnexpectedEof)?;
        pos += 1;

        let mut event = [b0, 0, 0];
        for slot in event.iter_mut().take(event_length(b0)).skip(1) {
            *slot = *region.get(pos).ok_or(FormatError::UnexpectedEof)?;
            pos += 1;
        }
        let cell = decode_event(&event);

        if b0 & CHANNEL_EMPTY == CHANNEL_EMPTY {
            // An empty event with a directive defers entirely to it.
            if b0 & CHANNEL_COMPRESSED == 0 {
                row += 1;
            }
        } else {
            *pattern.cell_mut(row, channel) = cell;
            row += 1;
        }
        trace!(" {:02} {:04x}: {}", row, start, cell);

        if b0 & CHANNEL_COMPRESSED != 0 {
            let d0 = *region.get(pos).ok_or(FormatError::UnexpectedEof)?;
            pos += 1;

            if d0 & COMPRESSION_JUMP != 0 {
                let entries = (d0 & COMPRESSION_DATA_BITS) as usize + 1;
                let mut distance = *region.get(pos).ok_or(FormatError::UnexpectedEof)? as usize;
                pos += 1;
                if d0 & COMPRESSION_JUMP_LONG != 0 {
                    let lo = *region.get(pos).ok_or(FormatError::UnexpectedEof)? as usize;
                    pos += 1;
                    distance = (distance << 8) | lo;
                }
                trace!(
                    " ({} jump {} {:04x})",
                    if d0 & COMPRESSION_JUMP_LONG != 0 { "long" } else { "short" },
                    entries,
                    distance
                );

                let back = pos
                    .checked_sub(distance)
                    .ok_or(FormatError::Malformed("back reference before track data"))?;
                row = decode_track(region, back, pattern, channel, row, entries, depth + 1)?;
            } else if d0 & COMPRESSION_REPEAT_ROWS != 0 {
                let repeats = (d0 & COMPRESSION_DATA_BITS) as usize;
                trace!(" (repeat {})", repeats);
                for _ in 0..repeats {
                    if row >= ROWS {
                        return Err(FormatError::Malformed("row repeat past end of pattern"));
                    }
                    *pattern.cell_mut(row, channel) = cell;
                    row += 1;
                }
            } else {
                let empties = (d0 & COMPRESSION_DATA_BITS) as usize;
                trace!(" (empty {})", empties);
                row += empties;
                if row > ROWS {
                    return Err(FormatError::Malformed("empty run past end of pattern"));
                }
            }
        }

        if budget > 0 {
            budget -= 1;
            if budget == 0 {
                break;
            }
        }
    }

    Ok(row)
}

// ---------------------------------------------------------------------------
// Track compression
// ---------------------------------------------------------------------------

/// Rewrite a flat track, collapsing runs into directives. Empty runs
/// fold onto the preceding event when it has no directive yet; repeated
/// rows become repeat directives.
fn compress_track(events: &[EventBytes]) -> Vec<u8> {
    let mut out = Vec::new();
    // byte index of the last event that can still take a directive
    let mut attach: Option<usize> = None;

    let mut i = 0;
    while i < events.len() {
        let event = &events[i];
        let mut run = 1;
        while i + run < events.len() && events[i + run] == *event {
            run += 1;
        }

        if event.as_slice() == [CHANNEL_EMPTY] {
            if run == 1 {
                out.push(CHANNEL_EMPTY);
                attach = None;
            } else if let Some(at) = attach.take() {
                // A predecessor occupies a row, so the run fits one
                // directive.
                out[at] |= CHANNEL_COMPRESSED;
                out.push(COMPRESSION_EMPTY_ROWS | run as u8);
            } else {
                let mut left = run;
                while left > 0 {
                    if left == 1 {
                        out.push(CHANNEL_EMPTY);
                        left -= 1;
                    } else {
                        let chunk = left.min(COMPRESSION_DATA_BITS as usize);
                        out.push(CHANNEL_EMPTY | CHANNEL_COMPRESSED);
                        out.push(COMPRESSION_EMPTY_ROWS | chunk as u8);
                        left -= chunk;
                    }
                }
            }
        } else {
            let at = out.len();
            out.extend_from_slice(event);
            if run > 1 {
                out[at] |= CHANNEL_COMPRESSED;
                out.push(COMPRESSION_REPEAT_ROWS | (run as u8 - 1));
                attach = None;
            } else {
                attach = Some(at);
            }
        }

        i += run;
    }

    out
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

struct SampleRecord {
    length: u16,
    finetone: u8,
    volume: u8,
    repeat_offset: u16,
}

fn build_samples(module: &Module, usecode: &mut u32) -> (Vec<SampleRecord>, Vec<u8>) {
    debug!("building sample table");

    let usage = module.used_samples();
    let mut records = Vec::new();
    let mut payload = Vec::new();

    for (index, sample) in module.samples.iter().enumerate() {
        if !usage[index] {
            continue;
        }

        let record = if sample.is_empty() {
            payload.extend_from_slice(&[0, 0]);
            SampleRecord { length: 1, finetone: 0, volume: 0, repeat_offset: 0xFFFF }
        } else if sample.is_looping() {
            // Everything past the repeat window is never played.
            let length = (sample.repeat_offset as u32 + sample.repeat_length as u32)
                .min(sample.length as u32) as u16;
            trace!(" #{} - {} bytes (looped)", index + 1, length as usize * 2);
            if length != sample.length {
                warn!(
                    "looped sample #{} truncated ({} -> {} bytes)",
                    index + 1,
                    sample.length as usize * 2,
                    length as usize * 2
                );
            }
            let bytes = (length as usize * 2).min(sample.data.len());
            payload.extend_from_slice(&sample.data[..bytes]);
            SampleRecord {
                length,
                finetone: sample.finetone,
                volume: sample.volume.min(64),
                repeat_offset: sample.repeat_offset,
            }
        } else {
            trace!(" #{} - {} bytes", index + 1, sample.length as usize * 2);
            payload.extend_from_slice(&sample.data);
            SampleRecord {
                length: sample.length,
                finetone: sample.finetone,
                volume: sample.volume.min(64),
                repeat_offset: 0xFFFF,
            }
        };

        if record.finetone != 0 {
            *usecode |= 1;
        }
        records.push(record);
    }

    debug!(" {} samples used", records.len());
    (records, payload)
}

fn build_patterns(
    module: &Module,
    compress: bool,
    usecode: &mut u32,
) -> Result<(Vec<u8>, Vec<[u16; CHANNELS]>), FormatError> {
    debug!("converting patterns");

    let mut tracks: Vec<u8> = Vec::new();
    let mut offsets = vec![[0u16; CHANNELS]; module.patterns.len()];
    let mut seen: HashMap<Vec<u8>, u16> = HashMap::new();

    for channel in 0..CHANNELS {
        for (index, pattern) in module.patterns.iter().enumerate() {
            let mut events = Vec::with_capacity(ROWS);
            for row in 0..ROWS {
                events.push(encode_event(pattern.cell(row, channel), usecode));
            }

            let bytes = if compress {
                compress_track(&events)
            } else {
                events.iter().flat_map(|e| e.iter().copied()).collect()
            };

            let offset = if compress && seen.contains_key(&bytes) {
                let at = seen[&bytes];
                trace!("pattern #{} channel {}: sharing track at {:04x}", index, channel, at);
                at
            } else {
                let at = u16::try_from(tracks.len())
                    .map_err(|_| FormatError::Malformed("pattern data exceeds 64k"))?;
                tracks.extend_from_slice(&bytes);
                if compress {
                    seen.insert(bytes, at);
                }
                at
            };
            offsets[index][channel] = offset;
        }
    }

    Ok((tracks, offsets))
}

fn write_song(
    out: &mut Vec<u8>,
    song: &SongOrder,
    options: &Options,
    records: &[SampleRecord],
    offsets: &[[u16; CHANNELS]],
    tracks: &[u8],
) -> Result<(), FormatError> {
    let mut sample_offset = 4
        + SAMPLE_RECORD_SIZE * records.len()
        + PATTERN_OFFSET_SIZE * offsets.len()
        + song.live().len()
        + 1
        + tracks.len();
    let pad = sample_offset & 1 != 0;
    if pad {
        sample_offset += 1;
    }
    let sample_offset = u16::try_from(sample_offset)
        .map_err(|_| FormatError::Malformed("sample data offset exceeds 64k"))?;

    if options.has("sign", false) {
        trace!(" - adding signature");
        out.extend_from_slice(SIGNATURE);
    }

    out.extend_from_slice(&sample_offset.to_be_bytes());
    out.push(offsets.len() as u8);
    out.push(records.len() as u8);

    for record in records {
        out.extend_from_slice(&record.length.to_be_bytes());
        out.push(record.finetone);
        out.push(record.volume);
        out.extend_from_slice(&record.repeat_offset.to_be_bytes());
    }

    for channels in offsets {
        for offset in channels {
            out.extend_from_slice(&offset.to_be_bytes());
        }
    }

    out.extend_from_slice(song.live());
    out.push(0xFF);

    out.extend_from_slice(tracks);

    if pad {
        out.push(0);
    }

    Ok(())
}

/// Save a P61A image, appending to `out`. Options: `sign` prepends the
/// signature, `compress_patterns` (default on) collapses track runs,
/// `song` / `samples` (default on) select which halves to write.
pub fn save_p61a(module: &Module, options: &Options, out: &mut Vec<u8>) -> Result<(), FormatError> {
    debug!("converting to The Player 6.1A");

    if options.has("4bit", false) {
        return Err(FormatError::Unimplemented("4-bit sample compression"));
    }
    if options.has("delta", false) {
        return Err(FormatError::Unimplemented("delta sample encoding"));
    }
    if module.patterns.len() > 255 {
        return Err(FormatError::Malformed("too many patterns"));
    }

    let mut usecode: u32 = 0;
    let (records, sample_data) = build_samples(module, &mut usecode);
    let (tracks, offsets) =
        build_patterns(module, options.has("compress_patterns", true), &mut usecode)?;

    trace!("usecode: {:08x}", usecode);

    if options.has("song", true) {
        debug!(" - writing song data");
        write_song(out, &module.song, options, &records, &offsets, &tracks)?;
    }

    if options.has("samples", true) {
        debug!(" - writing sample data");
        out.extend_from_slice(&sample_data);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load a P61A image. Sample slot identity is not stored in the file;
/// the dense sample table maps onto module slots 1..=N.
pub fn load_p61a(data: &[u8]) -> Result<Module, FormatError> {
    debug!("loading The Player 6.1A module");

    let base = match data.get(..SIGNATURE.len()) {
        Some(head) if head == SIGNATURE => &data[SIGNATURE.len()..],
        _ => data,
    };

    let mut r = ByteReader::new(base);
    let sample_offset = r.read_u16_be()? as usize;
    let pattern_count = r.read_u8()? as usize;
    let sample_count = r.read_u8()? as usize;
    trace!(
        "header: sample offset {}, {} patterns, {} samples",
        sample_offset,
        pattern_count,
        sample_count
    );

    if pattern_count == 0 {
        return Err(FormatError::Malformed("zero patterns in header"));
    }
    if sample_count > NUM_SAMPLES {
        return Err(FormatError::Malformed("sample count exceeds the slot table"));
    }

    let mut module = Module::default();

    for index in 0..sample_count {
        let length = r.read_u16_be()?;
        let finetone = r.read_u8()?;
        let volume = r.read_u8()?;
        let repeat_offset = r.read_u16_be()?;
        trace!(
            " #{:02} - length: {:04x}, finetone: {}, volume: {}, repeat offset: {:04x}",
            index + 1,
            length,
            finetone,
            volume,
            repeat_offset
        );

        let sample = &mut module.samples[index];
        sample.length = length;
        sample.finetone = finetone & 0x0F;
        sample.volume = volume;
        if repeat_offset == 0xFFFF {
            sample.repeat_offset = 0;
            sample.repeat_length = 1;
        } else {
            if repeat_offset > length {
                return Err(FormatError::Malformed("sample loop starts past its end"));
            }
            sample.repeat_offset = repeat_offset;
            sample.repeat_length = length - repeat_offset;
        }
    }

    let mut offsets = Vec::with_capacity(pattern_count);
    for _ in 0..pattern_count {
        let mut channels = [0u16; CHANNELS];
        for offset in &mut channels {
            *offset = r.read_u16_be()?;
        }
        offsets.push(channels);
    }

    let mut terminated = false;
    for index in 0..=module.song.positions.len() {
        let byte = r.read_u8()?;
        if byte == 0xFF {
            module.song.length = index as u8;
            terminated = true;
            break;
        }
        if index == module.song.positions.len() {
            break;
        }
        module.song.positions[index] = byte;
    }
    if !terminated {
        return Err(FormatError::Malformed("unterminated position list"));
    }
    module.song.restart = 127;

    // Tracks sit directly after the position terminator; back references
    // may reach anywhere earlier in this region.
    let region = &base[r.pos()..];
    for (index, channels) in offsets.iter().enumerate() {
        let mut pattern = Pattern::new();
        for (channel, &offset) in channels.iter().enumerate() {
            trace!("pattern #{}, track #{}:", index, channel);
            decode_track(region, offset as usize, &mut pattern, channel, 0, 0, 0)?;
        }
        module.patterns.push(pattern);
    }

    let mut samples = ByteReader::new(base);
    samples.seek(sample_offset);
    for index in 0..sample_count {
        let sample = &mut module.samples[index];
        if sample.length == 0 {
            continue;
        }
        let bytes = sample.length as usize * 2;
        sample.data = samples.read_bytes(bytes)?.to_vec();
    }

    debug!(
        "loaded {} patterns, {} positions, {} samples",
        module.patterns.len(),
        module.song.length,
        sample_count
    );

    Ok(module)
}
