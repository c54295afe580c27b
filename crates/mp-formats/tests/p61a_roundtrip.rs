//! P61A codec tests: save/load round trips, output modes, bounds.

use mp_formats::{load_p61a, save_p61a, FormatError, Options};
use mp_ir::{effect, Cell, Effect, Module, Pattern, Sample};

fn options(s: &str) -> Options {
    Options::parse(s)
}

fn save(module: &Module, opts: &str) -> Vec<u8> {
    let mut out = Vec::new();
    save_p61a(module, &options(opts), &mut out).unwrap_or_else(|e| panic!("save failed: {}", e));
    out
}

/// A module shaped the way P61A can represent it exactly: no name, dense
/// sample slots all referenced from live patterns, restart at 127.
fn dense_module() -> Module {
    let mut module = Module::default();
    module.song.length = 2;
    module.song.positions[..2].copy_from_slice(&[0, 1]);
    module.song.restart = 127;

    let mut first = Pattern::new();
    *first.cell_mut(0, 0) = Cell { period: 856, sample: 1, effect: Effect::NONE };
    *first.cell_mut(4, 1) = Cell {
        period: 428,
        sample: 2,
        effect: Effect::new(effect::CMD_SET_VOLUME, 0x30),
    };
    *first.cell_mut(8, 2) = Cell {
        period: 0,
        sample: 0,
        effect: Effect::new(effect::CMD_VIBRATO, 0x42),
    };
    module.patterns.push(first);

    let mut second = Pattern::new();
    for row in 16..24 {
        *second.cell_mut(row, 3) = Cell { period: 113, sample: 2, effect: Effect::NONE };
    }
    module.patterns.push(second);

    module.samples[0] = Sample {
        length: 4,
        volume: 64,
        repeat_length: 1,
        data: vec![0x11; 8],
        ..Sample::default()
    };
    module.samples[1] = Sample {
        length: 6,
        finetone: 2,
        volume: 48,
        repeat_offset: 2,
        repeat_length: 4,
        data: vec![0x22; 12],
        ..Sample::default()
    };

    module
}

#[test]
fn dense_module_round_trips() {
    let module = dense_module();
    let image = save(&module, "");
    let loaded = load_p61a(&image).unwrap_or_else(|e| panic!("load failed: {}", e));
    assert_eq!(loaded, module);
}

#[test]
fn flat_and_compressed_tracks_decode_identically() {
    let module = dense_module();
    let compressed = save(&module, "");
    let flat = save(&module, "-compress_patterns");

    assert!(compressed.len() < flat.len());
    assert_eq!(load_p61a(&compressed).unwrap(), load_p61a(&flat).unwrap());
}

#[test]
fn decoding_is_deterministic() {
    let image = save(&dense_module(), "");
    assert_eq!(load_p61a(&image).unwrap(), load_p61a(&image).unwrap());
}

#[test]
fn arpeggio_survives_the_round_trip() {
    let mut module = dense_module();
    module.patterns[0].cell_mut(2, 0).effect = Effect::new(effect::CMD_ARPEGGIO, 0x17);

    let loaded = load_p61a(&save(&module, "")).unwrap();
    assert_eq!(loaded.patterns[0].cell(2, 0).effect, Effect::new(effect::CMD_ARPEGGIO, 0x17));
}

#[test]
fn empty_used_sample_gets_the_canonical_record() {
    // slot 1 is referenced but holds no data
    let mut module = Module::default();
    module.song.length = 1;
    let mut pattern = Pattern::new();
    *pattern.cell_mut(0, 0) = Cell { period: 856, sample: 1, effect: Effect::NONE };
    module.patterns.push(pattern);

    let image = save(&module, "");
    assert_eq!(image[2], 1, "pattern count");
    assert_eq!(image[3], 1, "sample count");
    assert_eq!(&image[4..10], &[0x00, 0x01, 0x00, 0x00, 0xFF, 0xFF]);

    // and its placeholder payload is one zero word
    let sample_offset = u16::from_be_bytes([image[0], image[1]]) as usize;
    assert_eq!(&image[sample_offset..], &[0, 0]);
}

#[test]
fn unreferenced_samples_are_not_written() {
    let mut module = dense_module();
    module.samples[2] = Sample { length: 2, data: vec![0x77; 4], ..Sample::default() };

    let image = save(&module, "");
    assert_eq!(image[3], 2, "only referenced slots are counted");

    let loaded = load_p61a(&image).unwrap();
    assert!(loaded.samples[2].is_empty());
}

#[test]
fn signature_is_optional_and_skipped() {
    let module = dense_module();
    let plain = save(&module, "");
    let signed = save(&module, "sign");

    assert_eq!(&signed[..4], b"P61A");
    assert_eq!(&signed[4..], &plain[..]);
    assert_eq!(load_p61a(&signed).unwrap(), load_p61a(&plain).unwrap());
}

#[test]
fn song_and_samples_can_be_written_separately() {
    let module = dense_module();
    let both = save(&module, "");
    let song_only = save(&module, "-samples");
    let samples_only = save(&module, "-song");

    let mut glued = song_only.clone();
    glued.extend_from_slice(&samples_only);
    assert_eq!(glued, both);

    // the header's sample offset points exactly past the song half
    let sample_offset = u16::from_be_bytes([both[0], both[1]]) as usize;
    assert_eq!(sample_offset, song_only.len());
}

#[test]
fn looped_sample_tail_is_cut_on_save() {
    let mut module = dense_module();
    // 8 words of data but the loop ends at word 6
    module.samples[1] = Sample {
        length: 8,
        volume: 48,
        repeat_offset: 2,
        repeat_length: 4,
        data: vec![0x22; 16],
        ..Sample::default()
    };

    let loaded = load_p61a(&save(&module, "")).unwrap();
    assert_eq!(loaded.samples[1].length, 6);
    assert_eq!(loaded.samples[1].repeat_offset, 2);
    assert_eq!(loaded.samples[1].repeat_length, 4);
    assert_eq!(loaded.samples[1].data.len(), 12);
}

#[test]
fn declared_but_unimplemented_options_fail() {
    let module = dense_module();
    let mut out = Vec::new();
    assert!(matches!(
        save_p61a(&module, &options("4bit[1-4]"), &mut out),
        Err(FormatError::Unimplemented(_))
    ));
    assert!(matches!(
        save_p61a(&module, &options("delta"), &mut out),
        Err(FormatError::Unimplemented(_))
    ));
    // disabled surfaces are fine
    save_p61a(&module, &options("-4bit,-delta"), &mut out).unwrap();
}

#[test]
fn malformed_headers_are_rejected() {
    // zero patterns
    assert!(matches!(
        load_p61a(&[0x00, 0x10, 0, 0]),
        Err(FormatError::Malformed(_))
    ));
    // sample count past the slot table
    assert!(matches!(
        load_p61a(&[0x00, 0x10, 1, 32]),
        Err(FormatError::Malformed(_))
    ));
    // truncated mid-header
    assert!(matches!(load_p61a(&[0x00]), Err(FormatError::UnexpectedEof)));
}

#[test]
fn unterminated_position_list_is_rejected() {
    // header, no samples, one pattern-offset record, then zeros with no
    // 0xFF terminator anywhere in the 128 position slots
    let mut image = vec![0x00, 0x40, 1, 0];
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&[0; 200]);

    assert!(matches!(load_p61a(&image), Err(FormatError::Malformed(_))));
}
