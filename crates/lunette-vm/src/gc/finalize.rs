//! Finalizers: registration, separation of unreachable objects, and the
//! calls to `__gc`.

use super::{GcPhase, GcStop};
use crate::callinfo::CallStatus;
use crate::config::GcMode;
use crate::metamethod::{fast_tm, Tm};
use crate::state::Vm;
use lunette_core::object::{GcList, GcRef};
use lunette_core::value::TValue;
use tracing::debug;

impl Vm {
    /// Register `o` for finalization if its new metatable `mt` has `__gc`.
    pub fn check_finalizer(&mut self, o: GcRef, mt: Option<GcRef>) {
        let already = self.heap.header(o).map_or(true, |h| h.to_finalize());
        if already
            || fast_tm(&self.heap, mt, self.tm.get(Tm::Gc)).is_none()
            || self.gc.stp.contains(GcStop::CLS)
        {
            return;
        }
        let cw = self.gc.current_white;
        let sweeping = self.gc.phase.is_sweep();
        if let Some(h) = self.heap.header_mut(o) {
            if sweeping {
                // "sweep" it now: it leaves the list being swept
                h.make_white(cw);
            }
            h.set_list(GcList::FinObj);
            h.set_finalized(true);
        }
        self.gc.finobj.push(o);
    }

    /// Move unreachable objects (all of them with `all`) from `finobj` to
    /// the end of `tobefnz`, newest registration first.
    pub(crate) fn separate_tobefnz(&mut self, all: bool) {
        let objs = std::mem::take(&mut self.gc.finobj);
        let mut kept = Vec::with_capacity(objs.len());
        let mut moved = Vec::new();
        for &r in objs.iter().rev() {
            if all || self.is_white(r) {
                moved.push(r);
            } else {
                kept.push(r);
            }
        }
        kept.reverse();
        for &r in &moved {
            if let Some(h) = self.heap.header_mut(r) {
                h.set_list(GcList::ToBeFnz);
            }
        }
        self.gc.finobj = kept;
        self.gc.tobefnz.extend(moved);
    }

    /// Take the next object to finalize and make it ordinary again.
    fn udata_to_finalize(&mut self) -> Option<GcRef> {
        let o = self.gc.tobefnz.pop_front()?;
        let cw = self.gc.current_white;
        let sweeping = self.gc.phase.is_sweep();
        if let Some(h) = self.heap.header_mut(o) {
            h.set_list(GcList::AllGc);
            h.set_finalized(false);
            if sweeping {
                h.make_white(cw);
            }
        }
        Some(o)
    }

    /// Call one pending finalizer. Errors become warnings.
    pub(crate) fn gctm(&mut self) {
        debug_assert!(!self.gc.emergency);
        let Some(o) = self.udata_to_finalize() else { return };
        let Some(v) = self.heap.header(o).and_then(|h| TValue::from_gc(o, h.tag())) else {
            return;
        };
        let Some(tm) = self.get_tm_by_obj(v, Tm::Gc) else { return };
        let old_allowhook = self.th().allowhook;
        let old_stp = self.gc.stp;
        self.gc.stp |= GcStop::GC;
        self.th_mut().allowhook = false;
        let top = self.th().top;
        {
            let th = self.th_mut();
            th.stack[top] = tm;
            th.stack[top + 1] = v;
            th.top = top + 2;
            th.ci_mut().callstatus |= CallStatus::FIN;
        }
        let result = self.protected_call(|vm| vm.call_noyield_at(top, 0), top, 0);
        self.th_mut().ci_mut().callstatus.remove(CallStatus::FIN);
        self.th_mut().allowhook = old_allowhook;
        self.gc.stp = old_stp;
        if result.is_err() {
            self.warn_error("__gc");
            self.th_mut().top -= 1;
        }
    }

    /// Run up to `n` pending finalizers; returns how many ran.
    pub(crate) fn run_a_few_finalizers(&mut self, n: usize) -> usize {
        let mut i = 0;
        while i < n && !self.gc.tobefnz.is_empty() {
            self.gctm();
            i += 1;
        }
        i
    }

    pub(crate) fn call_all_pending_finalizers(&mut self) {
        while !self.gc.tobefnz.is_empty() {
            self.gctm();
        }
    }

    /// Teardown: run every finalizer, then free everything.
    pub(crate) fn free_all_objects(&mut self) {
        self.gc.stp = GcStop::CLS;
        self.change_mode(GcMode::Incremental);
        self.separate_tobefnz(true);
        debug_assert!(self.gc.finobj.is_empty());
        let pending = self.gc.tobefnz.len();
        self.call_all_pending_finalizers();
        debug!(target: "lunette::gc", finalized = pending, objects = self.heap.len(), "freeing all objects");
        let main = self.main_thread;
        self.close_upvals_of(main, 0);
        self.twups.clear();
        for r in self.heap.handles() {
            self.heap.remove(r);
        }
        self.gc.clear_gray_lists();
        self.gc.phase = GcPhase::Pause;
    }
}
