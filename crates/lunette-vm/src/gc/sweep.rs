//! Sweeping: freeing dead objects and repainting survivors.

use super::{GcPhase, GCSWEEPMAX};
use crate::heap::{GcObject, UpVal};
use crate::state::Vm;
use lunette_core::object::{GcList, GcRef};
use tracing::trace;

impl Vm {
    pub(crate) fn enter_sweep(&mut self) {
        self.gc.phase = GcPhase::SwpAllGc;
        self.gc.sweep_cursor = 0;
    }

    /// Free one object. The caller takes it off any collector list.
    pub(crate) fn free_obj(&mut self, r: GcRef) {
        match self.heap.get(r) {
            Some(GcObject::Thread(_)) => {
                self.close_upvals_of(r, 0);
                self.twups.retain(|&t| t != r);
            }
            Some(GcObject::Upval(UpVal::Open { .. })) => self.unlink_upval(r),
            None => return,
            _ => {}
        }
        self.heap.remove(r);
    }

    /// Sweep one batch of `list`; when the list is done move on to `next`.
    pub(crate) fn sweep_step(&mut self, list: GcList, next: GcPhase) -> usize {
        let olddebt = self.heap.debt();
        let count = match list {
            GcList::AllGc => self.sweep_allgc_batch(),
            GcList::FinObj => self.sweep_finobj(),
            GcList::ToBeFnz => self.sweep_tobefnz(),
            GcList::Fixed => None,
        };
        self.gc.estimate = (self.gc.estimate as isize + self.heap.debt() - olddebt).max(0) as usize;
        match count {
            Some(n) => n,
            None => {
                self.gc.phase = next;
                self.gc.sweep_cursor = 0;
                0
            }
        }
    }

    /// Dead objects are painted with the other white; live ones get the
    /// current white and a fresh age.
    fn sweep_one(&mut self, r: GcRef) -> bool {
        let cw = self.gc.current_white;
        let Some(h) = self.heap.header_mut(r) else { return false };
        if h.is_dead(cw) {
            self.free_obj(r);
            false
        } else {
            h.reset(cw);
            true
        }
    }

    /// Up to `GCSWEEPMAX` objects of the ordinary list, or `None` once the
    /// arena has been walked.
    fn sweep_allgc_batch(&mut self) -> Option<usize> {
        let cap = self.heap.capacity();
        if self.gc.sweep_cursor >= cap {
            return None;
        }
        let mut count = 0;
        while count < GCSWEEPMAX && self.gc.sweep_cursor < cap {
            let idx = self.gc.sweep_cursor;
            self.gc.sweep_cursor += 1;
            let Some(r) = self.heap.handle_at(idx) else { continue };
            if self.heap.header(r).is_some_and(|h| h.list() == GcList::AllGc) {
                self.sweep_one(r);
                count += 1;
            }
        }
        trace!(target: "lunette::gc", swept = count, cursor = self.gc.sweep_cursor, "sweep batch");
        Some(count)
    }

    fn sweep_finobj(&mut self) -> Option<usize> {
        if self.gc.sweep_cursor > 0 {
            return None;
        }
        self.gc.sweep_cursor = 1;
        let objs = std::mem::take(&mut self.gc.finobj);
        let count = objs.len();
        let mut kept = Vec::with_capacity(count);
        for r in objs {
            if self.sweep_one(r) {
                kept.push(r);
            }
        }
        // finalizers registered during the sweep come after the survivors
        kept.append(&mut self.gc.finobj);
        self.gc.finobj = kept;
        Some(count)
    }

    fn sweep_tobefnz(&mut self) -> Option<usize> {
        if self.gc.sweep_cursor > 0 {
            return None;
        }
        self.gc.sweep_cursor = 1;
        let pending: Vec<GcRef> = self.gc.tobefnz.iter().copied().collect();
        for &r in &pending {
            // marked in the atomic phase, so never dead here
            self.sweep_one(r);
        }
        Some(pending.len())
    }
}
