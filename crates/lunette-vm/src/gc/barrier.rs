//! Write barriers.
//!
//! Forward barriers mark the stored object (used for upvalues, closures and
//! prototypes); backward barriers regray the owner (used for tables and
//! userdata, which are written often).

use crate::config::GcMode;
use crate::state::Vm;
use lunette_core::object::{Age, GcRef};
use lunette_core::value::TValue;

impl Vm {
    /// Barrier for storing `v` into `owner`.
    #[inline]
    pub fn barrier(&mut self, owner: GcRef, v: TValue) {
        if let Some(r) = v.gc_ref() {
            self.obj_barrier(owner, r);
        }
    }

    /// Barrier for making `owner` point to `target`.
    #[inline]
    pub fn obj_barrier(&mut self, owner: GcRef, target: GcRef) {
        if self.is_black(owner) && self.is_white(target) {
            self.barrier_forward(owner, target);
        }
    }

    fn barrier_forward(&mut self, owner: GcRef, target: GcRef) {
        if self.gc.phase.keeps_invariant() {
            self.really_mark(target);
            if self.heap.header(owner).is_some_and(|h| h.is_old()) {
                if let Some(h) = self.heap.header_mut(target) {
                    h.set_age(Age::Old0);
                }
            }
        } else if self.gc.kind == GcMode::Incremental {
            // sweeping: whiten the owner to avoid further barriers
            let cw = self.gc.current_white;
            if let Some(h) = self.heap.header_mut(owner) {
                h.make_white(cw);
            }
        }
    }

    /// Barrier for storing `v` into table or userdata `owner`.
    #[inline]
    pub fn barrier_back(&mut self, owner: GcRef, v: TValue) {
        if let Some(r) = v.gc_ref() {
            if self.is_black(owner) && self.is_white(r) {
                self.barrier_back_slow(owner);
            }
        }
    }

    fn barrier_back_slow(&mut self, owner: GcRef) {
        let Some(age) = self.heap.header(owner).map(|h| h.age()) else { return };
        if age == Age::Touched2 {
            // already in grayagain
            self.set_gray(owner);
        } else {
            self.link_grayagain(owner);
        }
        if age.is_old() {
            if let Some(h) = self.heap.header_mut(owner) {
                h.set_age(Age::Touched1);
            }
        }
    }
}
