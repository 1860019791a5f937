//! Embedding API: a stack-oriented interface for native code.
//!
//! Positive indices count from the running function's first argument,
//! negative ones from the top. [`REGISTRY_INDEX`] names the registry and
//! [`upvalue_index`] the upvalues of the running native closure.

use crate::callinfo::{code_nresults, has_to_close, CallStatus, KContext, KFunction, NativeFn};
use crate::error::{LuaError, LuaResult, Status};
use crate::func::CloseStatus;
use crate::heap::{GcObject, NativeClosure, Userdata};
use crate::state::Vm;
use crate::thread::StkId;
use lunette_core::object::GcRef;
use lunette_core::table::Table;
use lunette_core::value::TValue;
use std::any::Any;

/// Pseudo-index of the registry.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Pseudo-index of upvalue `i` (1-based) of the running native closure.
#[inline]
pub const fn upvalue_index(i: i32) -> i32 {
    REGISTRY_INDEX - i
}

/// Where an index points.
enum Slot {
    Stack(StkId),
    Registry,
    Upvalue(GcRef, usize),
    None,
}

impl Vm {
    fn slot(&self, idx: i32) -> Slot {
        let th = self.th();
        let ci = th.ci();
        if idx > 0 {
            let s = ci.func + idx as usize;
            if s < th.top {
                Slot::Stack(s)
            } else {
                Slot::None
            }
        } else if idx > REGISTRY_INDEX {
            debug_assert!(idx != 0 && (-idx) as usize <= th.top - (ci.func + 1), "invalid index");
            Slot::Stack((th.top as isize + idx as isize) as usize)
        } else if idx == REGISTRY_INDEX {
            Slot::Registry
        } else {
            let n = (REGISTRY_INDEX - idx) as usize;
            match th.stack[ci.func] {
                TValue::NativeFn(r) if n <= self.heap.get_native(r).upvalues.len() => {
                    Slot::Upvalue(r, n - 1)
                }
                _ => Slot::None,
            }
        }
    }

    /// Stack position of `idx`; `None` for pseudo-indices and indices
    /// past the top.
    fn stack_slot(&self, idx: i32) -> Option<StkId> {
        match self.slot(idx) {
            Slot::Stack(s) => Some(s),
            _ => {
                debug_assert!(false, "stack index expected");
                None
            }
        }
    }

    /// Value at `idx`; nil for an index past the top.
    pub fn value(&self, idx: i32) -> TValue {
        match self.slot(idx) {
            Slot::Stack(s) => self.th().stack[s],
            Slot::Registry => self.registry(),
            Slot::Upvalue(cl, i) => self.heap.get_native(cl).upvalues[i],
            Slot::None => TValue::Nil,
        }
    }

    /// Absolute form of `idx`, stable across pushes and pops.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            let th = self.th();
            (th.top - th.ci().func) as i32 + idx
        }
    }

    // ---- Stack ----

    /// Values in the running function's frame.
    pub fn get_top(&self) -> usize {
        let th = self.th();
        th.top - (th.ci().func + 1)
    }

    /// Set the top to `idx`: new slots become nil; to-be-closed variables
    /// dropped from the stack are closed.
    pub fn set_top(&mut self, idx: i32) -> LuaResult<()> {
        let (func, top) = {
            let th = self.th();
            (th.ci().func, th.top)
        };
        let newtop = if idx >= 0 {
            let newtop = func + 1 + idx as usize;
            if newtop > top {
                self.th_mut().stack[top..newtop].fill(TValue::Nil);
            }
            newtop
        } else {
            debug_assert!((-(idx + 1)) as usize <= top - (func + 1), "invalid new top");
            (top as isize + idx as isize + 1) as usize
        };
        let closing = self.th().tbclist.last().is_some_and(|&tbc| tbc >= newtop);
        let newtop = if newtop < top && closing {
            debug_assert!(has_to_close(self.th().ci().nresults));
            self.close(newtop, CloseStatus::KeepTop, false)?
        } else {
            newtop
        };
        self.th_mut().top = newtop;
        Ok(())
    }

    pub fn push(&mut self, v: TValue) -> LuaResult<()> {
        let top = self.th().top;
        self.th_mut().stack[top] = v;
        self.inc_top()
    }

    /// Drop `n` values. To-be-closed slots must be closed first with
    /// [`Vm::set_top`] or [`Vm::close_slot`].
    pub fn pop(&mut self, n: usize) {
        let th = self.th_mut();
        debug_assert!(th.top >= n);
        th.top -= n;
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.value(idx);
        self.push(v)
    }

    /// Copy the value at `from` into `to`. Writing an upvalue of the running
    /// native closure takes a barrier.
    pub fn copy(&mut self, from: i32, to: i32) {
        let v = self.value(from);
        match self.slot(to) {
            Slot::Stack(s) => self.th_mut().stack[s] = v,
            Slot::Upvalue(cl, i) => {
                self.heap.get_native_mut(cl).upvalues[i] = v;
                self.barrier(cl, v);
            }
            Slot::Registry | Slot::None => debug_assert!(false, "invalid copy target"),
        }
    }

    /// Make sure `n` more values fit. Returns false if the stack would pass
    /// its limit or memory runs out.
    pub fn ensure_stack(&mut self, n: usize) -> bool {
        let (free, used) = {
            let th = self.th();
            (th.stack_last() - th.top, th.top)
        };
        let ok = if free > n {
            true
        } else if used + n + crate::config::EXTRA_STACK > self.config.max_stack {
            false
        } else {
            matches!(self.grow_stack(n, false), Ok(true))
        };
        if ok {
            let top = self.th().top;
            let ci = self.th_mut().ci_mut();
            if ci.top < top + n {
                ci.top = top + n;
            }
        }
        ok
    }

    // ---- Reading values ----

    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        match self.value(idx) {
            TValue::Int(i) => Some(i),
            TValue::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < -(i64::MIN as f64) => {
                Some(f as i64)
            }
            _ => None,
        }
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        !self.value(idx).is_falsy()
    }

    /// Contents of a string value, lossily decoded.
    pub fn to_string_lossy(&self, v: TValue) -> Option<String> {
        self.heap
            .string_bytes(v)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn type_name_at(&self, idx: i32) -> &'static str {
        match self.slot(idx) {
            Slot::None => "no value",
            _ => self.value(idx).type_name(),
        }
    }

    // ---- Creating objects ----

    pub fn new_table(&mut self, narr: usize, nrec: usize) -> LuaResult<GcRef> {
        let t = self.alloc(GcObject::Table(Table::new(narr, nrec)))?;
        self.push(TValue::Table(t))?;
        self.check_gc();
        Ok(t)
    }

    /// Intern and push a string.
    pub fn push_string(&mut self, s: &str) -> LuaResult<GcRef> {
        let r = self.intern(s.as_bytes())?;
        self.push(TValue::Str(r))?;
        self.check_gc();
        Ok(r)
    }

    /// Push a full userdata holding `data` with `nuvalue` nil user values.
    pub fn new_userdata(&mut self, data: Box<dyn Any>, size: usize, nuvalue: usize) -> LuaResult<GcRef> {
        let u = self.alloc(GcObject::Userdata(Userdata {
            metatable: None,
            user_values: vec![TValue::Nil; nuvalue],
            data,
            size,
        }))?;
        self.push(TValue::Userdata(u))?;
        self.check_gc();
        Ok(u)
    }

    /// Set user value `n` (1-based) of the userdata at `idx` to the value on
    /// top, popping it. False if the userdata has no such value.
    pub fn set_user_value(&mut self, idx: i32, n: usize) -> bool {
        let TValue::Userdata(u) = self.value(idx) else { return false };
        let v = self.value(-1);
        self.pop(1);
        let uv = &mut self.heap.get_userdata_mut(u).user_values;
        match n.checked_sub(1).and_then(|i| uv.get_mut(i)) {
            Some(slot) => {
                *slot = v;
                self.barrier_back(u, v);
                true
            }
            None => false,
        }
    }

    /// Pop `n` values and push a native closure that owns them as upvalues.
    /// Without upvalues the function is pushed as a light function.
    pub fn push_native_closure(&mut self, name: &'static str, f: NativeFn, n: usize) -> LuaResult<()> {
        if n == 0 {
            let lf = self.register_native(name, f);
            return self.push(lf);
        }
        let upvalues = {
            let th = self.th();
            th.stack[th.top - n..th.top].to_vec()
        };
        let cl = self.alloc(GcObject::NativeClosure(NativeClosure { func: f, upvalues }))?;
        self.pop(n);
        self.push(TValue::NativeFn(cl))?;
        self.check_gc();
        Ok(())
    }

    // ---- Tables and metatables ----

    /// Push `t[k]` without metamethods, where `k` is on top (replaced).
    pub fn raw_get(&mut self, idx: i32) -> TValue {
        let Some(t) = self.value(idx).as_table_ref() else {
            debug_assert!(false, "table expected");
            return TValue::Nil;
        };
        let key = self.value(-1);
        let v = self.heap.get_table(t).raw_get(key);
        let top = self.th().top;
        self.th_mut().stack[top - 1] = v;
        v
    }

    /// `t[k] = v` without metamethods, with `k` and `v` on top (popped).
    pub fn raw_set(&mut self, idx: i32) -> LuaResult<()> {
        let Some(t) = self.value(idx).as_table_ref() else {
            return Err(self.run_error("table expected"));
        };
        let (k, v) = (self.value(-2), self.value(-1));
        self.table_set(t, k, v)?;
        self.pop(2);
        Ok(())
    }

    /// Push `t[n]` without metamethods.
    pub fn raw_geti(&mut self, idx: i32, n: i64) -> LuaResult<TValue> {
        let Some(t) = self.value(idx).as_table_ref() else {
            return Err(self.run_error("table expected"));
        };
        let v = self.heap.get_table(t).raw_geti(n);
        self.push(v)?;
        Ok(v)
    }

    /// `t[n] = v` without metamethods, with `v` on top (popped).
    pub fn raw_seti(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let Some(t) = self.value(idx).as_table_ref() else {
            return Err(self.run_error("table expected"));
        };
        let v = self.value(-1);
        self.table_seti(t, n, v);
        self.pop(1);
        Ok(())
    }

    /// Raw assignment to table `t`, with the write barrier.
    pub fn table_set(&mut self, t: GcRef, k: TValue, v: TValue) -> LuaResult<()> {
        if let Err(e) = self.heap.get_table_mut(t).raw_set(k, v) {
            return Err(self.run_error(&e.to_string()));
        }
        self.barrier_back(t, k);
        self.barrier_back(t, v);
        self.heap.recharge(t);
        Ok(())
    }

    pub fn table_seti(&mut self, t: GcRef, n: i64, v: TValue) {
        self.heap.get_table_mut(t).raw_seti(n, v);
        self.barrier_back(t, v);
        self.heap.recharge(t);
    }

    /// Push the metatable of the value at `idx`; false (nothing pushed) if
    /// it has none.
    pub fn push_metatable(&mut self, idx: i32) -> LuaResult<bool> {
        match self.get_metatable(self.value(idx)) {
            Some(mt) => {
                self.push(TValue::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at
    /// `idx`. Tables and full userdata get their own metatable; other
    /// values share one per basic type. A metatable with `__gc` marks the
    /// object for finalization.
    pub fn set_metatable(&mut self, idx: i32) {
        let obj = self.value(idx);
        let mt = match self.value(-1) {
            TValue::Table(t) => Some(t),
            v => {
                debug_assert!(v.is_nil(), "table expected");
                None
            }
        };
        match obj {
            TValue::Table(t) => {
                self.heap.get_table_mut(t).metatable = mt;
                if let Some(m) = mt {
                    self.obj_barrier(t, m);
                    self.check_finalizer(t, mt);
                }
            }
            TValue::Userdata(u) => {
                self.heap.get_userdata_mut(u).metatable = mt;
                if let Some(m) = mt {
                    self.obj_barrier(u, m);
                    self.check_finalizer(u, mt);
                }
            }
            v => self.set_type_metatable(v.base_type(), mt),
        }
        self.pop(1);
    }

    // ---- Calls ----

    /// Call the function below the `nargs` topmost values. With a
    /// continuation `k` on a yieldable thread, a yield inside the callee
    /// suspends the running native function, which resumes in `k`.
    pub fn call_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        ctx: KContext,
        k: Option<KFunction>,
    ) -> LuaResult<()> {
        debug_assert!(self.th().status == Status::Ok, "cannot do calls on non-normal thread");
        let func = self.th().top - (nargs + 1);
        let r = match k {
            Some(k) if self.th().is_yieldable() => {
                let ci = self.th_mut().ci_mut();
                ci.k = Some(k);
                ci.ctx = ctx;
                self.call_at(func, nresults)
            }
            _ => self.call_noyield_at(func, nresults),
        };
        self.unprotected(r)?;
        self.adjust_results(nresults);
        Ok(())
    }

    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        self.call_k(nargs, nresults, 0, None)
    }

    /// Protected call. `errfunc` is the index of a message handler (0 for
    /// none). On error the stack holds only the error object above the
    /// called function's slot.
    ///
    /// With a continuation on a yieldable thread the call runs unprotected
    /// inside the running native frame: an error (or yield) propagates as
    /// `Err` up to `resume`, which hands it back to this frame and then
    /// runs `k` with the final status.
    pub fn pcall_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        errfunc: i32,
        ctx: KContext,
        k: Option<KFunction>,
    ) -> LuaResult<Status> {
        debug_assert!(self.th().status == Status::Ok, "cannot do calls on non-normal thread");
        let ef = if errfunc == 0 { 0 } else { self.stack_slot(errfunc).unwrap_or(0) };
        let func = self.th().top - (nargs + 1);
        let status = match k {
            Some(k) if self.th().is_yieldable() => {
                let (old_errfunc, allowhook) = {
                    let th = self.th();
                    (th.errfunc, th.allowhook)
                };
                {
                    let ci = self.th_mut().ci_mut();
                    ci.k = Some(k);
                    ci.ctx = ctx;
                    ci.funcidx = func;
                    ci.old_errfunc = old_errfunc;
                    ci.callstatus.set(CallStatus::OAH, allowhook);
                    ci.callstatus |= CallStatus::YPCALL;
                }
                self.th_mut().errfunc = ef;
                self.call_at(func, nresults)?;
                let ci = self.th_mut().ci_mut();
                ci.callstatus.remove(CallStatus::YPCALL);
                let old = ci.old_errfunc;
                self.th_mut().errfunc = old;
                Status::Ok
            }
            _ => match self.protected_call(|vm| vm.call_noyield_at(func, nresults), func, ef) {
                Ok(()) => Status::Ok,
                Err(e) => e.status(),
            },
        };
        self.adjust_results(nresults);
        Ok(status)
    }

    pub fn pcall(&mut self, nargs: usize, nresults: i32, errfunc: i32) -> Status {
        match self.pcall_k(nargs, nresults, errfunc, 0, None) {
            Ok(status) => status,
            Err(e) => e.status(),
        }
    }

    /// Raise the value on top as an error.
    pub fn error(&mut self) -> LuaError {
        let v = self.value(-1);
        self.pop(1);
        if v == TValue::Str(self.memerrmsg) {
            return LuaError::Memory;
        }
        self.error_msg(v)
    }

    // ---- To-be-closed slots ----

    /// Mark the slot at `idx` as a to-be-closed variable of the running
    /// native function.
    pub fn to_close(&mut self, idx: i32) -> LuaResult<()> {
        let Some(level) = self.stack_slot(idx) else {
            return Ok(());
        };
        debug_assert!(self.th().tbclist.last().map_or(true, |&l| l < level));
        self.new_tbc_upval(level)?;
        let ci = self.th_mut().ci_mut();
        if !has_to_close(ci.nresults) {
            ci.nresults = code_nresults(ci.nresults);
        }
        Ok(())
    }

    /// Close the to-be-closed slot at `idx` and set it to nil.
    pub fn close_slot(&mut self, idx: i32) -> LuaResult<()> {
        let Some(level) = self.stack_slot(idx) else {
            return Ok(());
        };
        debug_assert!(self.th().tbclist.last() == Some(&level), "no variable to close at given level");
        let level = self.close(level, CloseStatus::KeepTop, false)?;
        self.th_mut().stack[level] = TValue::Nil;
        Ok(())
    }
}

impl Vm {
    /// Yield `nresults` values from the running native function without a
    /// continuation.
    #[inline]
    pub fn yield_values(&mut self, nresults: usize) -> LuaResult<usize> {
        self.yield_k(nresults, 0, None)
    }
}
