//! Sample-table passes.

use log::debug;
use mp_ir::{Module, Sample, NUM_SAMPLES};

/// Strip trailing zero words from sample payloads.
///
/// Looping samples are only touched under `trim_loops`, and never cut
/// into the repeat window.
pub fn trim_samples(module: &mut Module, trim_loops: bool) {
    for (index, sample) in module.samples.iter_mut().enumerate() {
        if sample.is_empty() {
            continue;
        }
        let floor = if sample.is_looping() {
            if !trim_loops {
                continue;
            }
            sample.repeat_offset as usize + sample.repeat_length as usize
        } else {
            0
        };

        let mut words = sample.length as usize;
        while words > floor {
            let at = (words - 1) * 2;
            if sample.data.get(at) == Some(&0) && sample.data.get(at + 1) == Some(&0) {
                words -= 1;
            } else {
                break;
            }
        }

        if words < sample.length as usize {
            debug!(
                "sample #{}: trimmed {} -> {} bytes",
                index + 1,
                sample.length as usize * 2,
                words * 2
            );
            sample.length = words as u16;
            sample.data.truncate(words * 2);
        }
    }
}

/// Clear every sample slot that no live pattern references. Indices of
/// the remaining slots are preserved.
pub fn remove_unused_samples(module: &mut Module) {
    let usage = module.used_samples();
    let mut removed = 0;

    for (index, sample) in module.samples.iter_mut().enumerate() {
        if usage[index] {
            continue;
        }
        if !sample.is_empty() {
            removed += 1;
        }
        sample.clear();
    }

    debug!("removed {} unused samples", removed);
}

fn samples_identical(a: &Sample, b: &Sample) -> bool {
    a.length == b.length
        && a.finetone == b.finetone
        && a.volume == b.volume
        && a.repeat_offset == b.repeat_offset
        && a.repeat_length == b.repeat_length
        && a.data == b.data
}

/// Merge sample slots with identical headers and payloads. Pattern
/// data is rewritten to the lowest-indexed representative; duplicate
/// slots are cleared.
pub fn remove_identical_samples(module: &mut Module) {
    // redirect[n] is the 1-based slot that events referencing n should use
    let mut redirect: [u8; NUM_SAMPLES + 1] = [0; NUM_SAMPLES + 1];
    for (slot, entry) in redirect.iter_mut().enumerate() {
        *entry = slot as u8;
    }

    let mut merged = 0;
    for i in 0..NUM_SAMPLES {
        if module.samples[i].is_empty() || redirect[i + 1] != (i + 1) as u8 {
            continue;
        }
        for j in (i + 1)..NUM_SAMPLES {
            if redirect[j + 1] != (j + 1) as u8 {
                continue;
            }
            if samples_identical(&module.samples[i], &module.samples[j]) {
                redirect[j + 1] = (i + 1) as u8;
                merged += 1;
            }
        }
    }

    if merged == 0 {
        return;
    }

    module.for_each_cell_mut(|cell| {
        if let Some(&to) = redirect.get(cell.sample as usize) {
            cell.sample = to;
        }
    });

    for slot in 1..=NUM_SAMPLES {
        if redirect[slot] != slot as u8 {
            module.samples[slot - 1].clear();
        }
    }

    debug!("merged {} duplicate samples", merged);
}

/// Reassign dense slot indices 1..=k, keeping the original order, and
/// rewrite pattern data to match. Slots that are empty and unreferenced
/// are squeezed out.
pub fn compact_sample_indexes(module: &mut Module) {
    let usage = module.used_samples();

    // mapping[n] is the new 1-based index of old slot n, 0 = dropped
    let mut mapping: [u8; NUM_SAMPLES + 1] = [0; NUM_SAMPLES + 1];
    let mut next = 0usize;
    for slot in 1..=NUM_SAMPLES {
        if usage[slot - 1] || !module.samples[slot - 1].is_empty() {
            next += 1;
            mapping[slot] = next as u8;
        }
    }

    let old = std::mem::replace(&mut module.samples, std::array::from_fn(|_| Sample::default()));
    for (index, sample) in old.into_iter().enumerate() {
        let to = mapping[index + 1];
        if to != 0 {
            module.samples[to as usize - 1] = sample;
        }
    }

    module.for_each_cell_mut(|cell| {
        if let Some(&to) = mapping.get(cell.sample as usize) {
            cell.sample = to;
        }
    });

    debug!("compacted sample table to {} slots", next);
}
