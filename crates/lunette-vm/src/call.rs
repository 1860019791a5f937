//! Call protocol: entering functions, returning results, tail calls.

use crate::callinfo::{decode_nresults, has_to_close, CallInfo, CallStatus, NativeFn, MULTRET};
use crate::config::LUA_MINSTACK;
use crate::error::{LuaError, LuaResult};
use crate::func::CloseStatus;
use crate::hook::{HookEvent, HookMask};
use crate::metamethod::Tm;
use crate::state::Vm;
use crate::thread::StkId;
use lunette_core::object::GcRef;
use lunette_core::value::TValue;

impl Vm {
    // ---- Frame cache ----

    /// Advance to the next frame, reusing a cached one when available.
    pub(crate) fn next_ci(&mut self) -> usize {
        let cur = self.current;
        let th = self.heap.get_thread_mut(cur);
        th.ci += 1;
        let grew = th.ci == th.frames.len();
        if grew {
            th.frames.push(CallInfo::default());
        }
        let ci = th.ci;
        if grew {
            self.heap.recharge(cur);
        }
        ci
    }

    /// Free half of the cached frames above the running one.
    pub(crate) fn shrink_ci_of(&mut self, th: GcRef) {
        let t = self.heap.get_thread_mut(th);
        let used = t.ci + 1;
        let unused = t.frames.len() - used;
        let keep = (unused + 1) / 2;
        if keep < unused {
            t.frames.truncate(used + keep);
            t.frames.shrink_to(used + keep);
            self.heap.recharge(th);
        }
    }

    fn prep_callinfo(&mut self, func: StkId, nresults: i32, status: CallStatus, top: StkId) -> usize {
        let ci = self.next_ci();
        self.frame_mut(ci).reinit(func, nresults, status, top);
        ci
    }

    // ---- Entering functions ----

    /// Put the `__call` metamethod of the value at `func` below it, so that
    /// the value becomes the first argument.
    pub(crate) fn try_func_tm(&mut self, func: StkId) -> LuaResult<StkId> {
        self.check_stack_gc(1)?;
        let v = self.th().stack[func];
        let Some(tm) = self.get_tm_by_obj(v, Tm::Call) else {
            return Err(self.run_error(&format!("attempt to call a {} value", v.type_name())));
        };
        let th = self.th_mut();
        let top = th.top;
        th.stack.copy_within(func..top, func + 1);
        th.top = top + 1;
        th.stack[func] = tm;
        Ok(func)
    }

    /// Prepare a call to the value at `func` with arguments up to `top`.
    ///
    /// Native functions run to completion here and `None` is returned.
    /// For an interpreted function a new frame is pushed and returned; the
    /// caller runs it through the dispatcher.
    pub fn precall(&mut self, mut func: StkId, nresults: i32) -> LuaResult<Option<usize>> {
        loop {
            match self.th().stack[func] {
                TValue::NativeFn(r) => {
                    let f = self.heap.get_native(r).func;
                    self.precall_native(func, nresults, f)?;
                    return Ok(None);
                }
                TValue::LightFn(lf) => {
                    let Some(f) = self.native_fn(lf) else {
                        return Err(self.run_error("attempt to call an unregistered native function"));
                    };
                    self.precall_native(func, nresults, f)?;
                    return Ok(None);
                }
                TValue::LuaFn(cl) => {
                    let p = self.heap.get_proto(self.heap.get_closure(cl).proto);
                    let (nfixparams, fsize) = (p.num_params as usize, p.max_stack_size as usize);
                    self.check_stack_gc(fsize)?;
                    let ci = self.prep_callinfo(func, nresults, CallStatus::empty(), func + 1 + fsize);
                    let th = self.th_mut();
                    let narg = th.top - func - 1;
                    if narg < nfixparams {
                        // complete missing arguments
                        th.stack[th.top..func + 1 + nfixparams].fill(TValue::Nil);
                        th.top = func + 1 + nfixparams;
                    }
                    return Ok(Some(ci));
                }
                _ => func = self.try_func_tm(func)?,
            }
        }
    }

    fn precall_native(&mut self, func: StkId, nresults: i32, f: NativeFn) -> LuaResult<usize> {
        self.check_stack_gc(LUA_MINSTACK)?;
        let top = self.th().top;
        let ci = self.prep_callinfo(func, nresults, CallStatus::C, top + LUA_MINSTACK);
        if self.th().hookmask.contains(HookMask::CALL) {
            let narg = top - func - 1;
            self.hook(HookEvent::Call, -1, 1, narg)?;
        }
        let n = f(self)?;
        let n = n.min(self.th().top - (self.frame(ci).func + 1));
        self.poscall(ci, n)?;
        Ok(n)
    }

    /// Prepare a tail call from frame `ci` to the function at `func` with
    /// `narg1` values (function included). `delta` undoes the vararg shift
    /// of `ci`. Returns `Some(n)` when a native function ran and left `n`
    /// results; `None` when `ci` now runs the interpreted callee.
    pub fn pretailcall(
        &mut self,
        ci: usize,
        mut func: StkId,
        mut narg1: usize,
        delta: usize,
    ) -> LuaResult<Option<usize>> {
        loop {
            match self.th().stack[func] {
                TValue::NativeFn(r) => {
                    let f = self.heap.get_native(r).func;
                    return self.precall_native(func, MULTRET, f).map(Some);
                }
                TValue::LightFn(lf) => {
                    let Some(f) = self.native_fn(lf) else {
                        return Err(self.run_error("attempt to call an unregistered native function"));
                    };
                    return self.precall_native(func, MULTRET, f).map(Some);
                }
                TValue::LuaFn(cl) => {
                    let p = self.heap.get_proto(self.heap.get_closure(cl).proto);
                    let (nfixparams, fsize) = (p.num_params as usize, p.max_stack_size as usize);
                    self.check_stack_gc(fsize.saturating_sub(delta))?;
                    let th = self.th_mut();
                    let frame = &mut th.frames[ci];
                    frame.func -= delta;
                    let base = frame.func;
                    // move down function and arguments
                    th.stack.copy_within(func..func + narg1, base);
                    while narg1 <= nfixparams {
                        th.stack[base + narg1] = TValue::Nil;
                        narg1 += 1;
                    }
                    let frame = &mut th.frames[ci];
                    frame.top = base + 1 + fsize;
                    frame.savedpc = 0;
                    frame.callstatus |= CallStatus::TAIL;
                    th.top = base + narg1;
                    return Ok(None);
                }
                _ => {
                    func = self.try_func_tm(func)?;
                    narg1 += 1;
                }
            }
        }
    }

    // ---- Returning ----

    /// Finish frame `ci`, whose `nres` results are on top of the stack:
    /// fire the return hook, move the results to the function slot and
    /// pop the frame.
    pub fn poscall(&mut self, ci: usize, nres: usize) -> LuaResult<()> {
        let wanted = self.frame(ci).nresults;
        if !self.th().hookmask.is_empty() && !has_to_close(wanted) {
            self.ret_hook(ci, nres)?;
        }
        let res = self.frame(ci).func;
        self.move_results(ci, res, nres, wanted)?;
        self.th_mut().ci = ci - 1;
        Ok(())
    }

    fn move_results(&mut self, ci: usize, mut res: StkId, mut nres: usize, wanted: i32) -> LuaResult<()> {
        let wanted = match wanted {
            0 => {
                self.th_mut().top = res;
                return Ok(());
            }
            1 => {
                let th = self.th_mut();
                th.stack[res] = if nres == 0 {
                    TValue::Nil
                } else {
                    th.stack[th.top - nres]
                };
                th.top = res + 1;
                return Ok(());
            }
            MULTRET => nres,
            w if has_to_close(w) => {
                // native frame with pending to-be-closed variables
                {
                    let frame = self.frame_mut(ci);
                    frame.callstatus |= CallStatus::CLSRET;
                    frame.nres = nres;
                }
                res = self.close(res, CloseStatus::KeepTop, true)?;
                self.frame_mut(ci).callstatus.remove(CallStatus::CLSRET);
                if !self.th().hookmask.is_empty() {
                    // the hook runs after the closing methods
                    self.ret_hook(ci, nres)?;
                }
                match decode_nresults(w) {
                    MULTRET => nres,
                    w => w as usize,
                }
            }
            w => w as usize,
        };
        let top = self.th().top;
        if res + wanted > top {
            self.check_stack(res + wanted - top)?;
        }
        let th = self.th_mut();
        let firstresult = th.top - nres;
        if nres > wanted {
            nres = wanted;
        }
        th.stack.copy_within(firstresult..firstresult + nres, res);
        th.stack[res + nres..res + wanted].fill(TValue::Nil);
        th.top = res + wanted;
        Ok(())
    }

    /// After a call with `MULTRET` results, make sure the running frame's
    /// limit covers them.
    pub(crate) fn adjust_results(&mut self, nres: i32) {
        let th = self.th_mut();
        let ci = th.ci;
        if nres <= MULTRET && th.frames[ci].top < th.top {
            th.frames[ci].top = th.top;
        }
    }

    // ---- Calls from Rust ----

    /// Call the function at `func`, counting one more nested native call
    /// (`inc`) and, for `noyield`, one more non-yieldable call.
    pub(crate) fn ccall(&mut self, func: StkId, nresults: i32, inc: u32, noyield: bool) -> LuaResult<()> {
        {
            let th = self.th_mut();
            th.n_ccalls += inc;
            if noyield {
                th.nny += 1;
            }
        }
        if self.th().n_ccalls >= self.config.max_ccalls {
            // free any use of the extra slots
            self.check_stack(0)?;
            self.check_cstack()?;
        }
        if let Some(ci) = self.precall(func, nresults)? {
            self.frame_mut(ci).callstatus = CallStatus::FRESH;
            self.execute(ci)?;
        }
        let th = self.th_mut();
        th.n_ccalls -= inc;
        if noyield {
            th.nny -= 1;
        }
        Ok(())
    }

    /// Call the function at `func`; arguments are above it up to `top`.
    pub fn call_at(&mut self, func: StkId, nresults: i32) -> LuaResult<()> {
        self.ccall(func, nresults, 1, false)
    }

    /// Like [`Vm::call_at`], but nothing inside the call may yield.
    pub fn call_noyield_at(&mut self, func: StkId, nresults: i32) -> LuaResult<()> {
        self.ccall(func, nresults, 1, true)
    }

    /// Limit nested native calls.
    pub(crate) fn check_cstack(&mut self) -> LuaResult<()> {
        let n = self.th().n_ccalls;
        let max = self.config.max_ccalls;
        if n == max {
            Err(self.run_error("C stack overflow"))
        } else if n >= max / 10 * 11 {
            // error while handling the overflow
            Err(LuaError::ErrorInHandler)
        } else {
            Ok(())
        }
    }

    // ---- Variadic frames ----

    /// Relocate a vararg frame: copy the function and its fixed parameters
    /// above the actual arguments, leaving the extra ones below.
    pub fn adjust_varargs(&mut self, ci: usize, nfixparams: usize) -> LuaResult<()> {
        let fsize = self
            .frame_proto(ci)
            .map_or(0, |p| self.heap.get_proto(p).max_stack_size as usize);
        let func = self.frame(ci).func;
        let actual = self.th().top - func - 1;
        let nextra = actual - nfixparams;
        self.frame_mut(ci).nextraargs = nextra;
        self.check_stack(fsize + 1)?;
        let th = self.th_mut();
        let top = th.top;
        th.stack[top] = th.stack[func];
        for i in 1..=nfixparams {
            th.stack[top + i] = th.stack[func + i];
            // erase the original for the collector
            th.stack[func + i] = TValue::Nil;
        }
        th.top = top + 1 + nfixparams;
        let frame = &mut th.frames[ci];
        frame.func += actual + 1;
        frame.top += actual + 1;
        Ok(())
    }

    /// Copy the extra arguments of vararg frame `ci` to `where_`; a negative
    /// `wanted` copies all of them and sets `top` after the last.
    pub fn get_varargs(&mut self, ci: usize, where_: StkId, wanted: i32) -> LuaResult<()> {
        let nextra = self.frame(ci).nextraargs;
        let wanted = if wanted < 0 {
            let top = self.th().top;
            if where_ + nextra > top {
                self.check_stack_gc(where_ + nextra - top)?;
            }
            self.th_mut().top = where_ + nextra;
            nextra
        } else {
            wanted as usize
        };
        let th = self.th_mut();
        let src = th.frames[ci].func - nextra;
        let n = wanted.min(nextra);
        th.stack.copy_within(src..src + n, where_);
        th.stack[where_ + n..where_ + wanted].fill(TValue::Nil);
        Ok(())
    }
}
