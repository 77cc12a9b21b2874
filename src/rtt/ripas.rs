//! Range operations over protected leaves: RIPAS initialisation, RIPAS
//! change and S2AP overlay changes.
//!
//! Each operation walks the range entry by entry and returns how far it got.
//! Only a failure on the very first entry is an error; later failures end
//! the range early so the caller can resume or give up.

use super::{Ripas, RttEntry, RttError, RttSpace, RttState, Walk};
use crate::types::{align_down, is_aligned, level_size, Ipa, GRANULE_SIZE, RTT_MAX_LEVEL};

enum Step {
    Apply(RttEntry),
    Stop,
    Fail(RttError),
}

impl RttSpace {
    fn check_protected_range(&self, base: Ipa, top: Ipa) -> Result<(), RttError> {
        if !is_aligned(base, GRANULE_SIZE) || !is_aligned(top, GRANULE_SIZE) {
            return Err(RttError::Input("range not granule aligned"));
        }
        if top <= base {
            return Err(RttError::Input("empty range"));
        }
        if top > self.unprotected_base() {
            return Err(RttError::Input("range leaves the protected half"));
        }
        Ok(())
    }

    /// Visits `[base, top)` in `tree`, one leaf-most entry per iteration,
    /// without writing anything. Returns how far the range got and the
    /// entries to write. Entries that do not fit inside the range end the walk.
    fn range_plan(
        &self,
        tree: usize,
        base: Ipa,
        top: Ipa,
        mut step: impl FnMut(&Walk) -> Step,
    ) -> Result<(Ipa, Vec<(Walk, RttEntry)>), RttError> {
        let mut cursor = base;
        let mut updates = Vec::new();
        while cursor < top {
            let walk = self.walk(tree, cursor, RTT_MAX_LEVEL)?;
            let size = level_size(walk.level);
            let fits = is_aligned(cursor, size) && cursor + size <= top;
            let outcome = if fits {
                step(&walk)
            } else {
                Step::Fail(RttError::Walk {
                    tree,
                    level: walk.level,
                })
            };
            match outcome {
                Step::Apply(entry) => {
                    updates.push((walk, entry));
                    cursor += size;
                }
                Step::Fail(err) if cursor == base => return Err(err),
                Step::Fail(_) | Step::Stop => break,
            }
        }
        Ok((cursor, updates))
    }

    fn range_update(
        &mut self,
        tree: usize,
        base: Ipa,
        top: Ipa,
        step: impl FnMut(&Walk) -> Step,
    ) -> Result<Ipa, RttError> {
        let (reached, updates) = self.range_plan(tree, base, top, step)?;
        for (walk, entry) in &updates {
            self.set_entry(walk, *entry);
        }
        Ok(reached)
    }

    /// Sets RAM on UNASSIGNED protected entries of a NEW realm.
    pub fn init_ripas(&mut self, base: Ipa, top: Ipa) -> Result<Ipa, RttError> {
        self.check_protected_range(base, top)?;
        self.range_update(0, base, top, |walk| {
            if walk.entry.state != RttState::Unassigned {
                return Step::Fail(RttError::State {
                    tree: 0,
                    level: walk.level,
                });
            }
            let mut entry = walk.entry;
            entry.ripas = Some(Ripas::Ram);
            Step::Apply(entry)
        })
    }

    /// Applies a realm-requested RIPAS change. An unaligned `top` is
    /// truncated to the granule boundary below it. DESTROYED content is only
    /// overwritten when `change_destroyed` is set; otherwise the range ends
    /// there.
    pub fn set_ripas(
        &mut self,
        base: Ipa,
        top: Ipa,
        ripas: Ripas,
        change_destroyed: bool,
    ) -> Result<Ipa, RttError> {
        let aligned_top = align_down(top, GRANULE_SIZE);
        if top > base && aligned_top == base && is_aligned(base, GRANULE_SIZE) {
            return Ok(base);
        }
        let top = aligned_top;
        self.check_protected_range(base, top)?;
        self.range_update(0, base, top, |walk| {
            let entry = walk.entry;
            let destroyed = entry.state == RttState::Destroyed || entry.ripas == Some(Ripas::Destroyed);
            if destroyed && !change_destroyed {
                return Step::Stop;
            }
            match entry.state {
                RttState::Unassigned | RttState::Assigned => {
                    let mut updated = entry;
                    updated.ripas = Some(ripas);
                    Step::Apply(updated)
                }
                RttState::Destroyed => {
                    let mut updated = RttEntry::unassigned(Some(ripas));
                    updated.s2ap = entry.s2ap;
                    Step::Apply(updated)
                }
                RttState::AssignedNs | RttState::Table => Step::Fail(RttError::State {
                    tree: 0,
                    level: walk.level,
                }),
            }
        })
    }

    /// Sets the S2AP overlay index on the entries of `tree` covering the range.
    pub fn set_s2ap(&mut self, tree: usize, base: Ipa, top: Ipa, index: u8) -> Result<Ipa, RttError> {
        self.check_tree(tree)?;
        self.check_protected_range(base, top)?;
        self.range_update(tree, base, top, s2ap_step(tree, index))
    }

    /// Sets the S2AP overlay index across the primary and every auxiliary
    /// tree. All trees are checked before any entry is written, and every
    /// tree is written only up to the least progress any of them can make.
    pub fn set_s2ap_all(&mut self, base: Ipa, top: Ipa, index: u8) -> Result<Ipa, RttError> {
        self.check_protected_range(base, top)?;
        // Trees stop only at entry boundaries, and those nest, so the least
        // reach is one every tree can stop at.
        let mut next = top;
        for tree in 0..self.tree_count() {
            let (reached, _) = self.range_plan(tree, base, top, s2ap_step(tree, index))?;
            next = next.min(reached);
        }
        for tree in 0..self.tree_count() {
            self.range_update(tree, base, next, s2ap_step(tree, index))?;
        }
        Ok(next)
    }
}

fn s2ap_step(tree: usize, index: u8) -> impl FnMut(&Walk) -> Step {
    move |walk| match walk.entry.state {
        RttState::Table | RttState::AssignedNs => Step::Fail(RttError::State {
            tree,
            level: walk.level,
        }),
        _ => {
            let mut entry = walk.entry;
            entry.s2ap = index;
            Step::Apply(entry)
        }
    }
}
