//! Effect-column cleaning.

use log::debug;
use mp_ir::effect::{CMD_EXTENDED, CMD_SET_VOLUME, CMD_SLIDE_TO_NOTE, ECMD_E8, ECMD_SET_FINETUNE};
use mp_ir::{Effect, Module, NUM_SAMPLES};

/// Remove no-op effects and normalize the rest.
///
/// Slide-to-note without a note or argument does nothing; a finetune
/// override matching the sample's own finetune does nothing; volumes
/// above 64 are clamped. Under `drop_e8`, every E8x is removed as well.
pub fn clean_effects(module: &mut Module, drop_e8: bool) {
    let finetones: Vec<u8> = module.samples.iter().map(|s| s.finetone & 0x0F).collect();

    let mut cleaned = 0usize;
    let mut clamped = 0usize;

    module.for_each_cell_mut(|cell| {
        let fx = cell.effect;
        match fx.cmd {
            CMD_SLIDE_TO_NOTE if cell.period == 0 && fx.arg == 0 => {
                cell.effect = Effect::NONE;
                cleaned += 1;
            }
            CMD_SET_VOLUME if fx.arg > 64 => {
                cell.effect.arg = 64;
                clamped += 1;
            }
            CMD_EXTENDED => {
                let same_finetune = cell.sample != 0
                    && (cell.sample as usize) <= NUM_SAMPLES
                    && finetones[cell.sample as usize - 1] == fx.ext_val();
                if fx.ext_cmd() == ECMD_SET_FINETUNE && same_finetune {
                    cell.effect = Effect::NONE;
                    cleaned += 1;
                } else if fx.ext_cmd() == ECMD_E8 && drop_e8 {
                    cell.effect = Effect::NONE;
                    cleaned += 1;
                }
            }
            _ => {}
        }
    });

    debug!("cleaned {} effects, clamped {} volumes", cleaned, clamped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_ir::{Pattern, Sample};

    fn module() -> Module {
        let mut module = Module::default();
        module.patterns.push(Pattern::new());
        module.song.length = 1;
        module
    }

    #[test]
    fn pointless_slide_to_note_is_dropped() {
        let mut m = module();
        m.patterns[0].cell_mut(0, 0).effect = Effect::new(CMD_SLIDE_TO_NOTE, 0);
        // with a note present, the slide has a target and stays
        m.patterns[0].cell_mut(1, 0).period = 428;
        m.patterns[0].cell_mut(1, 0).effect = Effect::new(CMD_SLIDE_TO_NOTE, 0);
        // with an argument it keeps sliding and stays
        m.patterns[0].cell_mut(2, 0).effect = Effect::new(CMD_SLIDE_TO_NOTE, 4);

        clean_effects(&mut m, false);

        assert!(m.patterns[0].cell(0, 0).effect.is_none());
        assert!(!m.patterns[0].cell(1, 0).effect.is_none());
        assert!(!m.patterns[0].cell(2, 0).effect.is_none());
    }

    #[test]
    fn loud_volumes_are_clamped() {
        let mut m = module();
        m.patterns[0].cell_mut(0, 0).effect = Effect::new(CMD_SET_VOLUME, 0x7F);

        clean_effects(&mut m, false);

        assert_eq!(m.patterns[0].cell(0, 0).effect, Effect::new(CMD_SET_VOLUME, 64));
    }

    #[test]
    fn redundant_finetune_is_dropped() {
        let mut m = module();
        m.samples[2] = Sample { length: 2, finetone: 3, data: vec![0; 4], ..Sample::default() };

        let cell = m.patterns[0].cell_mut(0, 0);
        cell.sample = 3;
        cell.effect = Effect::new(CMD_EXTENDED, 0x53);

        let cell = m.patterns[0].cell_mut(1, 0);
        cell.sample = 3;
        cell.effect = Effect::new(CMD_EXTENDED, 0x55);

        clean_effects(&mut m, false);

        assert!(m.patterns[0].cell(0, 0).effect.is_none());
        assert_eq!(m.patterns[0].cell(1, 0).effect, Effect::new(CMD_EXTENDED, 0x55));
    }

    #[test]
    fn e8_is_only_dropped_on_request() {
        let mut m = module();
        m.patterns[0].cell_mut(0, 0).effect = Effect::new(CMD_EXTENDED, 0x84);

        clean_effects(&mut m, false);
        assert_eq!(m.patterns[0].cell(0, 0).effect, Effect::new(CMD_EXTENDED, 0x84));

        clean_effects(&mut m, true);
        assert!(m.patterns[0].cell(0, 0).effect.is_none());
    }
}
