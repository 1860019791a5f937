//! Generational mode.
//!
//! Minor collections traverse only what young objects and touched old
//! objects reach, and sweep only young objects. Ages live in the object
//! headers, so "young" is a header test rather than a list segment.

use super::GcPhase;
use crate::config::GcMode;
use crate::heap::{GcObject, UpVal};
use crate::state::Vm;
use lunette_core::object::{Age, GcList, GcRef};
use std::mem;
use tracing::debug;

impl Vm {
    /// Every non-fixed object, in arena order.
    fn collectable_handles(&self) -> Vec<GcRef> {
        self.heap
            .handles()
            .into_iter()
            .filter(|&r| self.heap.header(r).is_some_and(|h| h.list() != GcList::Fixed))
            .collect()
    }

    fn is_thread(&self, r: GcRef) -> bool {
        matches!(self.heap.get(r), Some(GcObject::Thread(_)))
    }

    fn remove_from_lists(&mut self, r: GcRef, list: GcList) {
        match list {
            GcList::FinObj => self.gc.finobj.retain(|&o| o != r),
            GcList::ToBeFnz => self.gc.tobefnz.retain(|&o| o != r),
            _ => {}
        }
    }

    /// Free dead objects and age everything else to old. Threads stay gray
    /// in `grayagain`; open upvalues stay gray.
    fn sweep_to_old(&mut self) {
        for r in self.collectable_handles() {
            let Some(h) = self.heap.header(r) else { continue };
            if h.is_white() {
                let list = h.list();
                self.remove_from_lists(r, list);
                self.free_obj(r);
                continue;
            }
            if let Some(h) = self.heap.header_mut(r) {
                h.set_age(Age::Old);
            }
            if self.is_thread(r) {
                self.link_grayagain(r);
            } else if matches!(self.heap.get(r), Some(GcObject::Upval(UpVal::Open { .. }))) {
                self.set_gray(r);
            } else {
                self.set_black(r);
            }
        }
    }

    /// Sweep young objects: dead ones are freed, new survivors go back to
    /// white as survivals, the rest advance one age.
    fn sweep_gen(&mut self) {
        let cw = self.gc.current_white;
        for r in self.collectable_handles() {
            let Some(h) = self.heap.header(r) else { continue };
            if !h.age().is_young() {
                continue;
            }
            if h.is_white() {
                debug_assert!(!h.is_old());
                let list = h.list();
                self.remove_from_lists(r, list);
                self.free_obj(r);
            } else if let Some(h) = self.heap.header_mut(r) {
                if h.age() == Age::New {
                    h.make_white(cw);
                    h.set_age(Age::Survival);
                } else {
                    h.set_age(h.age().next());
                }
            }
        }
    }

    /// Old1 objects become old; black ones are revisited since they may
    /// point to young objects.
    fn mark_old(&mut self) {
        for r in self.collectable_handles() {
            let Some(h) = self.heap.header_mut(r) else { continue };
            if h.age() == Age::Old1 {
                debug_assert!(!h.is_white());
                h.change_age(Age::Old1, Age::Old);
                if h.is_black() {
                    self.really_mark(r);
                }
            }
        }
    }

    /// Rebuild `grayagain` after a generational cycle from the objects left
    /// in any gray list: touched objects and threads stay, the rest leave.
    fn correct_gray_lists(&mut self) {
        let mut all = mem::take(&mut self.gc.grayagain);
        all.append(&mut self.gc.weak);
        all.append(&mut self.gc.allweak);
        all.append(&mut self.gc.ephemeron);
        let mut kept = Vec::with_capacity(all.len());
        for r in all {
            let is_thread = self.is_thread(r);
            let Some(h) = self.heap.header_mut(r) else { continue };
            if h.is_white() {
                continue;
            }
            if h.age() == Age::Touched1 {
                // black, for the next barrier
                h.set_black();
                h.change_age(Age::Touched1, Age::Touched2);
                kept.push(r);
            } else if is_thread {
                kept.push(r);
            } else {
                if h.age() == Age::Touched2 {
                    h.change_age(Age::Touched2, Age::Old);
                }
                h.set_black();
            }
        }
        kept.dedup();
        self.gc.grayagain = kept;
    }

    fn finish_gen_cycle(&mut self) {
        self.correct_gray_lists();
        self.heap.strings.check_size();
        // skip the restart
        self.gc.phase = GcPhase::Propagate;
        if !self.gc.emergency {
            self.call_all_pending_finalizers();
        }
    }

    fn young_collection(&mut self) {
        debug_assert_eq!(self.gc.phase, GcPhase::Propagate);
        let before = self.heap.total_bytes();
        self.mark_old();
        self.atomic();
        self.gc.phase = GcPhase::SwpAllGc;
        self.sweep_gen();
        debug!(
            target: "lunette::gc",
            before,
            after = self.heap.total_bytes(),
            "minor collection"
        );
        self.finish_gen_cycle();
    }

    /// Turn the result of a full mark into the first generation.
    fn atomic_to_gen(&mut self) {
        self.gc.clear_gray_lists();
        self.gc.phase = GcPhase::SwpAllGc;
        self.sweep_to_old();
        self.gc.kind = GcMode::Generational;
        self.gc.lastatomic = 0;
        self.gc.estimate = self.heap.total_bytes();
        self.finish_gen_cycle();
    }

    /// Debt so the next minor collection starts after `genminormul`% growth.
    fn set_minor_debt(&mut self) {
        let total = self.heap.total_bytes() as isize;
        self.heap.set_debt(-((total / 100) * self.gc.genminormul as isize));
    }

    /// Switch to generational mode with a full collection. Returns the
    /// objects traversed.
    pub(crate) fn enter_gen(&mut self) -> usize {
        self.run_until(GcPhase::Pause);
        self.run_until(GcPhase::Propagate);
        let numobjs = self.atomic();
        self.atomic_to_gen();
        self.set_minor_debt();
        numobjs
    }

    /// Switch to incremental mode: everything becomes new and white.
    pub(crate) fn enter_inc(&mut self) {
        let cw = self.gc.current_white;
        for r in self.collectable_handles() {
            if let Some(h) = self.heap.header_mut(r) {
                h.reset(cw);
            }
        }
        self.gc.phase = GcPhase::Pause;
        self.gc.kind = GcMode::Incremental;
        self.gc.lastatomic = 0;
    }

    pub(crate) fn full_gen(&mut self) -> usize {
        self.enter_inc();
        self.enter_gen()
    }

    /// After a bad major collection: collect incrementally-style and go
    /// back to generational mode only once a collection frees enough.
    fn step_gen_full(&mut self) {
        let lastatomic = self.gc.lastatomic;
        if self.gc.kind == GcMode::Generational {
            self.enter_inc();
        }
        self.run_until(GcPhase::Propagate);
        let newatomic = self.atomic();
        if newatomic < lastatomic + (lastatomic >> 3) {
            self.atomic_to_gen();
            self.set_minor_debt();
        } else {
            self.gc.estimate = self.heap.total_bytes();
            self.enter_sweep();
            self.run_until(GcPhase::Pause);
            self.set_pause();
            self.gc.lastatomic = newatomic;
        }
    }

    pub(crate) fn gen_step(&mut self) {
        if self.gc.lastatomic != 0 {
            self.step_gen_full();
            return;
        }
        let majorbase = self.gc.estimate;
        let majorinc = (majorbase / 100) * self.gc.genmajormul as usize;
        let total = self.heap.total_bytes();
        if self.heap.debt() > 0 && total > majorbase + majorinc {
            let numobjs = self.full_gen();
            debug!(target: "lunette::gc", numobjs, total = self.heap.total_bytes(), "major collection");
            if self.heap.total_bytes() >= majorbase + majorinc / 2 {
                // bad collection: wait long for the next (major) one
                self.gc.lastatomic = numobjs;
                self.set_pause();
            }
        } else {
            self.young_collection();
            self.set_minor_debt();
            self.gc.estimate = majorbase;
        }
    }
}
