//! Marking: roots, gray-list propagation and the atomic phase.

use super::GcPhase;
use crate::heap::{GcObject, UpVal};
use crate::metamethod::{fast_tm, Tm};
use crate::state::Vm;
use lunette_core::object::GcRef;
use lunette_core::table::WeakMode;
use lunette_core::value::TValue;
use std::mem;

impl Vm {
    #[inline]
    pub(crate) fn is_white(&self, r: GcRef) -> bool {
        self.heap.header(r).is_some_and(|h| h.is_white())
    }

    #[inline]
    pub(crate) fn is_black(&self, r: GcRef) -> bool {
        self.heap.header(r).is_some_and(|h| h.is_black())
    }

    #[inline]
    pub(crate) fn mark_object(&mut self, r: GcRef) {
        if self.is_white(r) {
            self.really_mark(r);
        }
    }

    #[inline]
    pub(crate) fn mark_value(&mut self, v: TValue) {
        if let Some(r) = v.gc_ref() {
            self.mark_object(r);
        }
    }

    fn mark_opt(&mut self, r: Option<GcRef>) {
        if let Some(r) = r {
            self.mark_object(r);
        }
    }

    /// Paint `r` gray and queue it, or blacken it directly when it has
    /// nothing to traverse.
    pub(crate) fn really_mark(&mut self, r: GcRef) {
        enum Plan {
            Black,
            Upval { open: bool, v: TValue },
            BareUserdata(Option<GcRef>),
            Gray,
        }
        let plan = match self.heap.get(r) {
            None => return,
            Some(GcObject::String(_)) => Plan::Black,
            Some(GcObject::Upval(uv)) => match *uv {
                UpVal::Open { thread, level } => Plan::Upval {
                    open: true,
                    v: self.heap.get_thread(thread).stack[level],
                },
                UpVal::Closed(v) => Plan::Upval { open: false, v },
            },
            Some(GcObject::Userdata(u)) if u.user_values.is_empty() => {
                Plan::BareUserdata(u.metatable)
            }
            Some(_) => Plan::Gray,
        };
        match plan {
            Plan::Black => self.set_black(r),
            Plan::Upval { open, v } => {
                if open {
                    // open upvalues stay gray
                    self.set_gray(r);
                } else {
                    self.set_black(r);
                }
                self.mark_value(v);
            }
            Plan::BareUserdata(mt) => {
                self.mark_opt(mt);
                self.set_black(r);
            }
            Plan::Gray => {
                self.set_gray(r);
                self.gc.gray.push(r);
            }
        }
    }

    #[inline]
    pub(crate) fn set_gray(&mut self, r: GcRef) {
        if let Some(h) = self.heap.header_mut(r) {
            h.set_gray();
        }
    }

    #[inline]
    pub(crate) fn set_black(&mut self, r: GcRef) {
        if let Some(h) = self.heap.header_mut(r) {
            h.set_black();
        }
    }

    /// Keep `r` in `grayagain`, gray, for the atomic phase.
    pub(crate) fn link_grayagain(&mut self, r: GcRef) {
        self.set_gray(r);
        self.gc.grayagain.push(r);
    }

    /// Relink an object touched in this cycle; advance one touched in the
    /// previous cycle.
    fn gen_link(&mut self, r: GcRef) {
        use lunette_core::object::Age;
        match self.heap.header(r).map(|h| h.age()) {
            Some(Age::Touched1) => self.link_grayagain(r),
            Some(Age::Touched2) => {
                if let Some(h) = self.heap.header_mut(r) {
                    h.change_age(Age::Touched2, Age::Old);
                }
            }
            _ => {}
        }
    }

    fn mark_metatables(&mut self) {
        for mt in self.type_mt {
            self.mark_opt(mt);
        }
    }

    fn mark_being_finalized(&mut self) -> usize {
        let pending: Vec<GcRef> = self.gc.tobefnz.iter().copied().collect();
        for &r in &pending {
            self.mark_object(r);
        }
        pending.len()
    }

    fn mark_roots(&mut self) {
        self.mark_object(self.main_thread);
        self.mark_object(self.current);
        for i in 0..self.resumers.len() {
            let r = self.resumers[i];
            self.mark_object(r);
        }
        self.mark_object(self.registry);
        self.mark_metatables();
    }

    /// Start a cycle from the roots.
    pub(crate) fn restart_collection(&mut self) {
        self.gc.clear_gray_lists();
        self.mark_roots();
        self.mark_being_finalized();
    }

    /// Traverse one gray object; returns the work done.
    pub(crate) fn propagate_mark(&mut self) -> usize {
        let Some(r) = self.gc.gray.pop() else { return 0 };
        self.set_black(r);
        match self.heap.get(r) {
            Some(GcObject::Table(_)) => self.traverse_table(r),
            Some(GcObject::Userdata(_)) => self.traverse_userdata(r),
            Some(GcObject::LuaClosure(_)) => self.traverse_lua_closure(r),
            Some(GcObject::NativeClosure(_)) => self.traverse_native_closure(r),
            Some(GcObject::Proto(_)) => self.traverse_proto(r),
            Some(GcObject::Thread(_)) => self.traverse_thread(r),
            _ => 0,
        }
    }

    pub(crate) fn propagate_all(&mut self) -> usize {
        let mut work = 0;
        while !self.gc.gray.is_empty() {
            work += self.propagate_mark();
        }
        work
    }

    /// Weakness of table `t`, from its `__mode` metafield.
    pub(crate) fn weak_mode(&self, t: GcRef) -> WeakMode {
        let mt = self.heap.get_table(t).metatable;
        fast_tm(&self.heap, mt, self.tm.get(Tm::Mode))
            .and_then(|m| self.heap.string_bytes(m))
            .map_or(WeakMode::Strong, WeakMode::from_mode)
    }

    fn traverse_table(&mut self, r: GcRef) -> usize {
        let mt = self.heap.get_table(r).metatable;
        self.mark_opt(mt);
        match self.weak_mode(r) {
            WeakMode::Strong => self.traverse_strong_table(r),
            WeakMode::WeakValues => self.traverse_weak_value(r),
            WeakMode::Ephemeron => {
                self.traverse_ephemeron(r, false);
            }
            // nothing to traverse now
            WeakMode::AllWeak => self.gc.allweak.push(r),
        }
        self.heap.get_table(r).traverse_cost()
    }

    fn traverse_strong_table(&mut self, r: GcRef) {
        let t = self.heap.get_table_mut(r);
        t.remove_dead_keys();
        let slots: Vec<TValue> = t
            .array_values()
            .iter()
            .copied()
            .chain(t.hash_entries().flat_map(|(k, v)| [k, v]))
            .collect();
        for v in slots {
            self.mark_value(v);
        }
        self.gen_link(r);
    }

    fn traverse_weak_value(&mut self, r: GcRef) {
        let t = self.heap.get_table_mut(r);
        t.remove_dead_keys();
        // a non-empty array part may hold white values
        let mut has_clears = !t.array_values().is_empty();
        let entries: Vec<(TValue, TValue)> = t.hash_entries().collect();
        for (k, v) in entries {
            self.mark_value(k);
            if !has_clears && self.is_cleared(v) {
                has_clears = true;
            }
        }
        if self.gc.phase == GcPhase::Atomic && has_clears {
            self.gc.weak.push(r);
        } else {
            self.link_grayagain(r);
        }
    }

    /// Mark values whose key is reachable. With `inv` the hash part is
    /// walked backwards. Returns whether anything was marked.
    pub(crate) fn traverse_ephemeron(&mut self, r: GcRef, inv: bool) -> bool {
        let mut marked = false;
        let mut has_clears = false;
        let mut has_ww = false;
        let t = self.heap.get_table_mut(r);
        t.remove_dead_keys();
        let array: Vec<TValue> = t.array_values().to_vec();
        let mut entries: Vec<(TValue, TValue)> = t.hash_entries().collect();
        if inv {
            entries.reverse();
        }
        for v in array {
            if let Some(vr) = v.gc_ref().filter(|&vr| self.is_white(vr)) {
                marked = true;
                self.really_mark(vr);
            }
        }
        for (k, v) in entries {
            let white_value = v.gc_ref().filter(|&vr| self.is_white(vr));
            if self.is_cleared(k) {
                has_clears = true;
                if white_value.is_some() {
                    has_ww = true;
                }
            } else if let Some(vr) = white_value {
                marked = true;
                self.really_mark(vr);
            }
        }
        if self.gc.phase == GcPhase::Propagate {
            self.link_grayagain(r);
        } else if has_ww {
            self.gc.ephemeron.push(r);
        } else if has_clears {
            self.gc.allweak.push(r);
        } else {
            self.gen_link(r);
        }
        marked
    }

    fn traverse_userdata(&mut self, r: GcRef) -> usize {
        let u = self.heap.get_userdata(r);
        let mt = u.metatable;
        let values = u.user_values.clone();
        self.mark_opt(mt);
        for v in &values {
            self.mark_value(*v);
        }
        self.gen_link(r);
        1 + values.len()
    }

    fn traverse_lua_closure(&mut self, r: GcRef) -> usize {
        let cl = self.heap.get_closure(r);
        let proto = cl.proto;
        let upvals = cl.upvals.clone();
        self.mark_object(proto);
        for uv in upvals.iter().flatten() {
            self.mark_object(*uv);
        }
        1 + upvals.len()
    }

    fn traverse_native_closure(&mut self, r: GcRef) -> usize {
        let values = self.heap.get_native(r).upvalues.clone();
        for v in &values {
            self.mark_value(*v);
        }
        1 + values.len()
    }

    fn traverse_proto(&mut self, r: GcRef) -> usize {
        let p = self.heap.get_proto(r);
        let mut refs: Vec<GcRef> = Vec::with_capacity(p.constants.len() + p.protos.len());
        refs.extend(p.source);
        refs.extend(p.constants.iter().filter_map(|v| v.gc_ref()));
        refs.extend(p.upvalues.iter().filter_map(|u| u.name));
        refs.extend(p.protos.iter().copied());
        refs.extend(p.locvars.iter().filter_map(|l| l.name));
        let work = 1 + p.constants.len() + p.upvalues.len() + p.protos.len() + p.locvars.len();
        for r in refs {
            self.mark_object(r);
        }
        work
    }

    fn traverse_thread(&mut self, r: GcRef) -> usize {
        let old = self.heap.header(r).is_some_and(|h| h.is_old());
        if old || self.gc.phase == GcPhase::Propagate {
            self.link_grayagain(r);
        }
        let top = self.heap.get_thread(r).top;
        for i in 0..top {
            let v = self.heap.get_thread(r).stack[i];
            self.mark_value(v);
        }
        let th = self.heap.get_thread(r);
        let upvals: Vec<GcRef> = th.open_upval.iter().map(|&(_, uv)| uv).collect();
        // errors held by pcalls that are unrolling
        let pending: Vec<TValue> = th.frames[..=th.ci]
            .iter()
            .filter_map(|ci| ci.recover.as_ref())
            .map(|e| self.error_value(e))
            .collect();
        for uv in upvals {
            self.mark_object(uv);
        }
        for v in pending {
            self.mark_value(v);
        }
        if self.gc.phase == GcPhase::Atomic {
            let th = self.heap.get_thread_mut(r);
            th.stack[top..].fill(TValue::Nil);
            if !th.in_twups && !th.open_upval.is_empty() {
                th.in_twups = true;
                self.twups.push(r);
            }
        } else if !self.gc.emergency {
            // stacks do not change in an emergency cycle
            self.shrink_stack_of(r);
        }
        1 + self.heap.get_thread(r).stack_size()
    }

    /// Mark the values of open upvalues of threads that are unmarked or
    /// have no upvalues left, and drop those threads from `twups`.
    fn remark_upvals(&mut self) -> usize {
        let mut work = 0;
        let threads = mem::take(&mut self.twups);
        for th in threads {
            work += 1;
            let has_upvals = self.heap.get_thread(th).has_open_upvals();
            if !self.is_white(th) && has_upvals {
                self.twups.push(th);
                continue;
            }
            let t = self.heap.get_thread_mut(th);
            t.in_twups = false;
            let upvals: Vec<GcRef> = t.open_upval.iter().map(|&(_, uv)| uv).collect();
            for uv in upvals {
                work += 1;
                if !self.is_white(uv) {
                    let v = self.heap.upval_value(uv);
                    self.mark_value(v);
                }
            }
        }
        work
    }

    /// Retraverse ephemeron tables until marking settles, alternating
    /// direction between passes.
    pub(crate) fn converge_ephemerons(&mut self) {
        let mut inv = false;
        loop {
            let tables = mem::take(&mut self.gc.ephemeron);
            let mut changed = false;
            for t in tables {
                self.set_black(t);
                if self.traverse_ephemeron(t, inv) {
                    self.propagate_all();
                    changed = true;
                }
            }
            inv = !inv;
            if !changed {
                break;
            }
        }
    }

    /// The indivisible end of marking. Returns the work done.
    pub(crate) fn atomic(&mut self) -> usize {
        let mut work = 0;
        let grayagain = mem::take(&mut self.gc.grayagain);
        self.gc.phase = GcPhase::Atomic;
        self.mark_roots();
        work += self.propagate_all();
        work += self.remark_upvals();
        work += self.propagate_all();
        self.gc.gray = grayagain;
        work += self.propagate_all();
        self.converge_ephemerons();
        // all strongly reachable objects are marked
        self.clear_by_values(Weak::Values, 0);
        self.clear_by_values(Weak::All, 0);
        let orig_weak = self.gc.weak.len();
        let orig_all = self.gc.allweak.len();
        self.separate_tobefnz(false);
        work += self.mark_being_finalized();
        work += self.propagate_all();
        self.converge_ephemerons();
        // resurrected objects are marked too
        self.clear_by_keys(Weak::Ephemeron);
        self.clear_by_keys(Weak::All);
        self.clear_by_values(Weak::Values, orig_weak);
        self.clear_by_values(Weak::All, orig_all);
        self.gc.current_white = self.gc.current_white.other_white();
        debug_assert!(self.gc.gray.is_empty());
        work
    }
}

/// Selects one of the weak-table worklists.
#[derive(Clone, Copy)]
pub(crate) enum Weak {
    Values,
    Ephemeron,
    All,
}
