//! Property tests over the translation tables and the granule lifecycle

mod fold_identity;
mod granule_scrub;
mod ripas_range;
mod walk_top;

use realm_model::rtt::{RttSpace, RttState};
use realm_model::types::{align_down, level_size, Ipa, Pa, GRANULE_SIZE, RTT_MAX_LEVEL};

pub const ROOT: Pa = 0x9000_0000;

/// 40-bit realm starting at level 0 with a single tree.
pub fn space() -> RttSpace {
    RttSpace::new(40, 0, vec![vec![ROOT]])
}

/// Creates the missing tables covering `ipa` down to `depth`, drawing table
/// granules from `next`.
pub fn map_tables(space: &mut RttSpace, ipa: Ipa, depth: u8, next: &mut Pa) {
    for level in 1..=depth.min(RTT_MAX_LEVEL) {
        let base = align_down(ipa, level_size(level - 1));
        let walk = space.walk(0, base, level - 1).unwrap();
        if walk.level == level - 1 && walk.entry.state != RttState::Table {
            space.create_table(0, base, level, *next).unwrap();
            *next += GRANULE_SIZE;
        }
    }
}
