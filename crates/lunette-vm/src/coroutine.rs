//! Coroutines: creating, resuming, yielding and closing threads.
//!
//! A resumed thread becomes `Vm::current` and the resumer waits on the
//! `resumers` stack. Yields unwind back to `resume` as `LuaError::Yield`;
//! what the interrupted frames still owe is finished on the next resume by
//! running their continuations (`unroll`).

use crate::callinfo::{CallStatus, KContext, KFunction, MULTRET};
use crate::config::LUA_MINSTACK;
use crate::error::{LuaError, LuaResult, Status};
use crate::func::CloseStatus;
use crate::heap::GcObject;
use crate::state::Vm;
use crate::thread::{CoroutineStatus, LuaThread};
use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use tracing::trace;

impl Vm {
    /// Create a thread, push it on the running thread's stack and return
    /// it. The new thread inherits the running thread's hook.
    pub fn new_thread(&mut self) -> LuaResult<GcRef> {
        self.check_gc();
        let mut t = LuaThread::new();
        {
            let cur = self.th();
            t.hook = cur.hook;
            t.hookmask = cur.hookmask;
            t.base_hook_count = cur.base_hook_count;
        }
        t.reset_hook_count();
        let r = self.alloc(GcObject::Thread(Box::new(t)))?;
        self.push(TValue::Thread(r))?;
        Ok(r)
    }

    /// Move the `n` topmost values of thread `from` onto thread `to`.
    pub fn xmove(&mut self, from: GcRef, to: GcRef, n: usize) -> LuaResult<()> {
        if from == to || n == 0 {
            return Ok(());
        }
        let t = self.heap.get_thread(to);
        if t.stack_last() - t.top <= n {
            let needed = t.top + n + 1;
            if needed > self.config.max_stack {
                return Err(self.run_error("stack overflow"));
            }
            let newsize = (2 * t.stack_size()).min(self.config.max_stack).max(needed);
            self.realloc_stack_of(to, newsize, true)?;
        }
        let f = self.heap.get_thread_mut(from);
        f.top -= n;
        let start = f.top;
        let vals: Vec<TValue> = f.stack[start..start + n].to_vec();
        let t = self.heap.get_thread_mut(to);
        let top = t.top;
        t.stack[top..top + n].copy_from_slice(&vals);
        t.top = top + n;
        Ok(())
    }

    /// Whether the running thread may yield.
    pub fn is_yieldable(&self) -> bool {
        self.th().is_yieldable()
    }

    /// Status of thread `co` as seen from the running thread.
    pub fn coroutine_status(&self, co: GcRef) -> CoroutineStatus {
        if co == self.current {
            return CoroutineStatus::Running;
        }
        if self.resumers.contains(&co) {
            return CoroutineStatus::Normal;
        }
        let t = self.heap.get_thread(co);
        match t.status {
            Status::Yield => CoroutineStatus::Suspended,
            Status::Ok if t.ci != 0 => CoroutineStatus::Normal,
            Status::Ok if t.base_values() == 0 => CoroutineStatus::Dead,
            Status::Ok => CoroutineStatus::Suspended,
            _ => CoroutineStatus::Dead,
        }
    }

    fn resume_error(&mut self, co: GcRef, msg: &str, nargs: usize) -> (Status, usize) {
        let msg = match self.intern(msg.as_bytes()) {
            Ok(s) => TValue::Str(s),
            Err(_) => TValue::Str(self.memerrmsg),
        };
        let t = self.heap.get_thread_mut(co);
        t.top -= nargs;
        let top = t.top;
        t.stack[top] = msg;
        t.top = top + 1;
        (Status::ErrRun, 1)
    }

    /// Start or continue thread `co` with the `nargs` values on top of its
    /// stack (plus the body function below them on the first resume).
    ///
    /// Returns `Yield` with the number of yielded values, `Ok` with the
    /// number of values the body returned, or an error status with the
    /// error object on top of `co`'s stack; the thread is then dead.
    pub fn resume(&mut self, co: GcRef, nargs: usize) -> (Status, usize) {
        let from = self.current;
        let t = self.heap.get_thread(co);
        match t.status {
            Status::Ok => {
                if t.ci != 0 || co == from || self.resumers.contains(&co) {
                    return self.resume_error(co, "cannot resume non-suspended coroutine", nargs);
                }
                if t.base_values() == nargs {
                    // no body to run
                    return self.resume_error(co, "cannot resume dead coroutine", nargs);
                }
            }
            Status::Yield => {}
            _ => return self.resume_error(co, "cannot resume dead coroutine", nargs),
        }
        let ccalls = self.th().n_ccalls;
        if ccalls >= self.config.max_ccalls {
            return self.resume_error(co, "C stack overflow", nargs);
        }
        {
            let t = self.heap.get_thread_mut(co);
            t.n_ccalls = ccalls + 1;
            t.nny = 0;
        }
        self.resumers.push(from);
        self.current = co;
        trace!(target: "lunette::coroutine", thread = ?co, nargs, "resume");
        let r = self.raw_run_protected(|vm| vm.resume_body(nargs));
        let status = match self.precover(r) {
            Ok(()) | Err(LuaError::Yield) => self.th().status,
            Err(e) => {
                // unrecoverable: the thread is dead
                let top = self.th().top;
                self.th_mut().status = e.status();
                self.set_error_obj(Some(&e), top);
                let ci = self.th().ci;
                let top = self.th().top;
                self.frame_mut(ci).top = top;
                e.status()
            }
        };
        let nres = {
            let t = self.th();
            if status == Status::Yield {
                t.ci().nyield
            } else {
                t.top - (t.ci().func + 1)
            }
        };
        self.resumers.pop();
        self.current = from;
        trace!(target: "lunette::coroutine", thread = ?co, ?status, nres, "resume returned");
        (status, nres)
    }

    fn resume_body(&mut self, nargs: usize) -> LuaResult<()> {
        let first_arg = self.th().top - nargs;
        let ci = self.th().ci;
        if self.th().status == Status::Ok {
            // starting the body
            return self.ccall(first_arg - 1, MULTRET, 0, false);
        }
        self.th_mut().status = Status::Ok;
        if self.frame(ci).is_lua() {
            // yielded inside a hook: discard the arguments and go on
            self.th_mut().top = first_arg;
            self.execute(ci)?;
        } else {
            let mut n = nargs;
            if let Some(k) = self.frame(ci).k {
                let ctx = self.frame(ci).ctx;
                n = k(self, Status::Yield, ctx)?;
            }
            self.poscall(ci, n)?;
        }
        self.unroll()
    }

    /// Finish every frame interrupted by a yield, down to the base frame.
    fn unroll(&mut self) -> LuaResult<()> {
        loop {
            let ci = self.th().ci;
            if ci == 0 {
                return Ok(());
            }
            if self.frame(ci).is_native() {
                self.finish_ccall(ci)?;
            } else {
                self.finish_op(ci)?;
                self.execute(ci)?;
            }
        }
    }

    fn finish_ccall(&mut self, ci: usize) -> LuaResult<()> {
        let n = if self.frame(ci).callstatus.contains(CallStatus::CLSRET) {
            // was closing variables on return; redo the return
            self.frame(ci).nres
        } else {
            let mut status = Status::Yield;
            if self.frame(ci).callstatus.contains(CallStatus::YPCALL) {
                status = self.finish_pcallk(ci)?;
            }
            self.adjust_results(MULTRET);
            match self.frame(ci).k {
                Some(k) => {
                    let ctx = self.frame(ci).ctx;
                    k(self, status, ctx)?
                }
                None => self.th().top - (self.frame(ci).func + 1),
            }
        };
        self.poscall(ci, n)
    }

    /// Finish a yieldable pcall interrupted by a yield or recovering from
    /// an error. Returns the status its continuation receives.
    fn finish_pcallk(&mut self, ci: usize) -> LuaResult<Status> {
        let status = match self.frame_mut(ci).recover.take() {
            None => Status::Yield,
            Some(err) => {
                let func = self.frame(ci).funcidx;
                let oah = self.frame(ci).callstatus.contains(CallStatus::OAH);
                self.th_mut().allowhook = oah;
                let func = self.close(func, CloseStatus::Error(err.clone()), true)?;
                self.set_error_obj(Some(&err), func);
                self.shrink_stack();
                err.status()
            }
        };
        let old_errfunc = {
            let frame = self.frame_mut(ci);
            frame.callstatus.remove(CallStatus::YPCALL);
            frame.old_errfunc
        };
        self.th_mut().errfunc = old_errfunc;
        Ok(status)
    }

    /// Innermost frame that is a yieldable pcall.
    fn find_pcall(&self) -> Option<usize> {
        let th = self.th();
        (0..=th.ci)
            .rev()
            .find(|&ci| th.frames[ci].callstatus.contains(CallStatus::YPCALL))
    }

    /// Hand errors to pending yieldable pcalls, continuing the coroutine
    /// after each recovery.
    fn precover(&mut self, mut result: LuaResult<()>) -> LuaResult<()> {
        loop {
            let err = match result {
                Err(e) if e.status().is_error() => e,
                r => return r,
            };
            let Some(ci) = self.find_pcall() else {
                return Err(err);
            };
            trace!(target: "lunette::coroutine", ci, status = ?err.status(), "recovering in pcall");
            self.th_mut().ci = ci;
            self.frame_mut(ci).recover = Some(err);
            result = self.raw_run_protected(|vm| vm.unroll());
        }
    }

    /// Yield the `nresults` topmost values from the running coroutine.
    ///
    /// From a native function the return value is always an error to
    /// propagate (`LuaError::Yield`); `k` then runs with `ctx` when the
    /// coroutine resumes. Inside a hook it returns `Ok(0)` and the hook
    /// must return right away; hooks cannot yield values.
    pub fn yield_k(&mut self, nresults: usize, ctx: KContext, k: Option<KFunction>) -> LuaResult<usize> {
        let ci = self.th().ci;
        if !self.th().is_yieldable() {
            let msg = if self.current != self.main_thread {
                "attempt to yield across a C-call boundary"
            } else {
                "attempt to yield from outside a coroutine"
            };
            return Err(self.run_error(msg));
        }
        let in_hook = self.frame(ci).is_lua();
        if in_hook && nresults != 0 {
            return Err(self.run_error("hooks cannot yield values"));
        }
        if in_hook && k.is_some() {
            return Err(self.run_error("hooks cannot continue after yielding"));
        }
        self.th_mut().status = Status::Yield;
        let frame = self.frame_mut(ci);
        frame.nyield = nresults;
        if in_hook {
            return Ok(0);
        }
        frame.k = k;
        if k.is_some() {
            frame.ctx = ctx;
        }
        Err(LuaError::Yield)
    }

    /// Reset thread `th`: unwind its frames, close its pending variables
    /// (passing `err` to the closing methods) and leave only the final
    /// error object, if any, on its stack. Returns the error that remains
    /// after closing.
    pub(crate) fn reset_thread(&mut self, th: GcRef, err: Option<LuaError>) -> Option<LuaError> {
        let prev = self.current;
        if prev != th {
            self.resumers.push(prev);
            self.current = th;
        }
        {
            let t = self.th_mut();
            t.ci = 0;
            t.stack[0] = TValue::Nil;
            t.frames[0].func = 0;
            t.frames[0].callstatus = CallStatus::C;
            t.status = Status::Ok;
            t.errfunc = 0;
        }
        let err = match err {
            Some(LuaError::Yield) => None,
            e => e,
        };
        let err = self.close_protected(1, err);
        match &err {
            Some(e) => self.set_error_obj(Some(e), 1),
            None => self.th_mut().top = 1,
        }
        let top = self.th().top;
        self.frame_mut(0).top = top + LUA_MINSTACK;
        // failing to shrink is harmless
        let _ = self.realloc_stack(top + LUA_MINSTACK, false);
        if prev != th {
            self.resumers.pop();
            self.current = prev;
        }
        err
    }

    /// Close a suspended or dead coroutine: run its pending closing methods
    /// and reset it so it can be reused. Returns `Ok` or the status of the
    /// error left on its stack.
    pub fn close_thread(&mut self, co: GcRef) -> LuaResult<Status> {
        match self.coroutine_status(co) {
            CoroutineStatus::Running => {
                return Err(self.run_error("cannot close a running coroutine"));
            }
            CoroutineStatus::Normal => {
                return Err(self.run_error("cannot close a normal coroutine"));
            }
            _ => {}
        }
        let ccalls = self.th().n_ccalls;
        let t = self.heap.get_thread_mut(co);
        t.n_ccalls = ccalls;
        let status = t.status;
        let errobj = if t.top > 1 { t.stack[t.top - 1] } else { TValue::Nil };
        let err = LuaError::from_status(status, errobj);
        trace!(target: "lunette::coroutine", thread = ?co, ?status, "close thread");
        Ok(self.reset_thread(co, err).map_or(Status::Ok, |e| e.status()))
    }
}
