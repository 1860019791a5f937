//! Heap consistency checks for tests and fuzzing.

use crate::config::GcMode;
use crate::heap::{GcObject, UpVal};
use crate::state::Vm;
use lunette_core::object::GcRef;
use lunette_core::table::WeakMode;

/// A black object that points to a white one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorViolation {
    pub owner: GcRef,
    pub target: GcRef,
}

impl Vm {
    /// Objects `r` refers to directly. Threads are left out: their stacks
    /// are written without barriers and rescanned in the atomic phase.
    fn references(&self, r: GcRef) -> Vec<GcRef> {
        let mut out = Vec::new();
        match self.heap.get(r) {
            Some(GcObject::Table(t)) => {
                out.extend(t.metatable);
                out.extend(t.entries().flat_map(|(k, v)| [k.gc_ref(), v.gc_ref()]).flatten());
            }
            Some(GcObject::Userdata(u)) => {
                out.extend(u.metatable);
                out.extend(u.user_values.iter().filter_map(|v| v.gc_ref()));
            }
            Some(GcObject::LuaClosure(cl)) => {
                out.push(cl.proto);
                out.extend(cl.upvals.iter().flatten());
            }
            Some(GcObject::NativeClosure(cl)) => {
                out.extend(cl.upvalues.iter().filter_map(|v| v.gc_ref()));
            }
            Some(GcObject::Proto(p)) => {
                out.extend(p.source);
                out.extend(p.constants.iter().filter_map(|v| v.gc_ref()));
                out.extend(p.upvalues.iter().filter_map(|u| u.name));
                out.extend(p.protos.iter().copied());
                out.extend(p.locvars.iter().filter_map(|l| l.name));
            }
            Some(GcObject::Upval(UpVal::Closed(v))) => out.extend(v.gc_ref()),
            _ => {}
        }
        out
    }

    /// Whether the object behind `r` is gray or black.
    pub fn is_marked(&self, r: GcRef) -> bool {
        self.heap.header(r).is_some_and(|h| !h.is_white())
    }

    /// Check that no black object points to a white one. Only meaningful
    /// while an incremental cycle is marking; otherwise always `Ok`. Weak
    /// tables are skipped since they may keep white entries until cleared.
    pub fn check_color_invariant(&self) -> Result<(), ColorViolation> {
        if self.gc.kind != GcMode::Incremental || !self.gc.phase.keeps_invariant() {
            return Ok(());
        }
        for owner in self.heap.handles() {
            if !self.is_black(owner) {
                continue;
            }
            if matches!(self.heap.get(owner), Some(GcObject::Table(_)))
                && self.weak_mode(owner) != WeakMode::Strong
            {
                continue;
            }
            if let Some(target) = self.references(owner).into_iter().find(|&t| self.is_white(t)) {
                return Err(ColorViolation { owner, target });
            }
        }
        Ok(())
    }
}
