//! Protected execution.
//!
//! A protected region is a call to `raw_run_protected`: it counts itself as
//! an open handler on the running thread, runs the body and, if the body
//! returns an error, restores the nested-call counters saved on entry. The
//! error value travels inside the `LuaError`; regions that catch it store
//! it on the stack with `set_error_obj`.

use crate::error::{LuaError, LuaResult};
use crate::func::CloseStatus;
use crate::state::Vm;
use crate::thread::StkId;
use lunette_core::value::TValue;

/// Source name as shown in messages.
pub(crate) fn chunk_id(source: &[u8]) -> String {
    match source.first() {
        Some(b'=') | Some(b'@') => String::from_utf8_lossy(&source[1..]).into_owned(),
        _ => {
            let line = source.split(|&b| b == b'\n').next().unwrap_or(&[]);
            format!("[string \"{}\"]", String::from_utf8_lossy(line))
        }
    }
}

impl Vm {
    /// Run `f` as a protected region of the running thread.
    pub(crate) fn raw_run_protected<F>(&mut self, f: F) -> LuaResult<()>
    where
        F: FnOnce(&mut Vm) -> LuaResult<()>,
    {
        let th = self.current;
        let (old_ccalls, old_nny) = {
            let t = self.heap.get_thread_mut(th);
            t.handlers += 1;
            (t.n_ccalls, t.nny)
        };
        let result = f(self);
        let t = self.heap.get_thread_mut(th);
        t.handlers -= 1;
        if result.is_err() {
            t.n_ccalls = old_ccalls;
            t.nny = old_nny;
        }
        result
    }

    /// Value that represents `err` on a stack.
    pub fn error_value(&self, err: &LuaError) -> TValue {
        match err {
            LuaError::Runtime(v) | LuaError::Syntax(v) => *v,
            LuaError::Memory => TValue::Str(self.memerrmsg),
            LuaError::ErrorInHandler => TValue::Str(self.errerrmsg),
            LuaError::Yield => TValue::Nil,
        }
    }

    /// Put the error object for `err` (nil for `None`) at `old_top` and make
    /// it the last value on the stack.
    pub(crate) fn set_error_obj(&mut self, err: Option<&LuaError>, old_top: StkId) {
        let v = err.map_or(TValue::Nil, |e| self.error_value(e));
        let th = self.th_mut();
        th.stack[old_top] = v;
        th.top = old_top + 1;
    }

    /// Last stop for an error that escaped every protected region of the
    /// running thread. The thread is reset and the error goes on to the
    /// main thread's handler, if it has one; otherwise calls the panic
    /// callback and aborts.
    ///
    /// The error object travels inside the returned error, and whichever
    /// region catches it switches back to its own thread, so the running
    /// thread is left as it is.
    pub(crate) fn throw(&mut self, err: LuaError) -> LuaError {
        if self.th().handlers > 0 {
            return err;
        }
        let cur = self.current;
        let fallback = err.clone();
        let err = self.reset_thread(cur, Some(err)).unwrap_or(fallback);
        let main = self.main_thread;
        if cur != main && self.heap.get_thread(main).handlers > 0 {
            return err;
        }
        if let Some(panic) = self.panic {
            panic(self);
        }
        std::process::abort()
    }

    /// Pass an error escaping an unprotected API call through [`Vm::throw`].
    pub(crate) fn unprotected<T>(&mut self, r: LuaResult<T>) -> LuaResult<T> {
        r.map_err(|e| match e {
            LuaError::Yield => e,
            e => self.throw(e),
        })
    }

    /// Raise `v` as a runtime error, first passing it through the message
    /// handler of the innermost protected call, if any.
    pub fn error_msg(&mut self, v: TValue) -> LuaError {
        {
            let th = self.th_mut();
            let top = th.top;
            th.stack[top] = v;
            th.top = top + 1;
        }
        let errfunc = self.th().errfunc;
        if errfunc != 0 {
            let th = self.th_mut();
            let top = th.top;
            th.stack[top] = th.stack[top - 1];
            th.stack[top - 1] = th.stack[errfunc];
            th.top = top + 1;
            if let Err(e) = self.call_noyield_at(top - 1, 1) {
                return e;
            }
        }
        let th = self.th();
        LuaError::Runtime(th.stack[th.top - 1])
    }

    /// Raise a runtime error with a message, prefixed with the source
    /// position when an interpreted frame is running.
    pub fn run_error(&mut self, msg: &str) -> LuaError {
        let msg = match self.where_info() {
            Some(pos) => format!("{pos} {msg}"),
            None => msg.to_owned(),
        };
        match self.intern(msg.as_bytes()) {
            Ok(s) => self.error_msg(TValue::Str(s)),
            Err(e) => e,
        }
    }

    fn where_info(&self) -> Option<String> {
        let ci = self.th().ci;
        if !self.frame(ci).is_lua() {
            return None;
        }
        let p = self.heap.get_proto(self.frame_proto(ci)?);
        let line = p.line_at(self.frame(ci).savedpc.saturating_sub(1));
        if line < 0 {
            return None;
        }
        let src = p
            .source
            .and_then(|s| self.heap.string_bytes(TValue::Str(s)))
            .map_or_else(|| "?".to_owned(), chunk_id);
        Some(format!("{src}:{line}:"))
    }

    /// Close every to-be-closed variable from `level` up, in protected mode.
    /// An error raised by a closing method replaces `status`, and closing
    /// goes on with the remaining variables.
    pub(crate) fn close_protected(
        &mut self,
        level: StkId,
        mut status: Option<LuaError>,
    ) -> Option<LuaError> {
        let old_ci = self.th().ci;
        let old_allowhook = self.th().allowhook;
        loop {
            let st = match &status {
                None => CloseStatus::Normal,
                Some(e) => CloseStatus::Error(e.clone()),
            };
            match self.raw_run_protected(|vm| vm.close(level, st, false).map(|_| ())) {
                Ok(()) => return status,
                Err(e) => {
                    let th = self.th_mut();
                    th.ci = old_ci;
                    th.allowhook = old_allowhook;
                    status = Some(e);
                }
            }
        }
    }

    /// Run `f` with `ef` as the error handler. On error, unwind to the frame
    /// current on entry, close pending variables above `old_top`, leave the
    /// error object at `old_top` and return the error.
    pub(crate) fn protected_call<F>(&mut self, f: F, old_top: StkId, ef: StkId) -> LuaResult<()>
    where
        F: FnOnce(&mut Vm) -> LuaResult<()>,
    {
        let (old_ci, old_allowhook, old_errfunc) = {
            let th = self.th();
            (th.ci, th.allowhook, th.errfunc)
        };
        self.th_mut().errfunc = ef;
        let result = match self.raw_run_protected(f) {
            Ok(()) => Ok(()),
            Err(e) => {
                {
                    let th = self.th_mut();
                    th.ci = old_ci;
                    th.allowhook = old_allowhook;
                }
                let fallback = e.clone();
                let e = self.close_protected(old_top, Some(e)).unwrap_or(fallback);
                self.set_error_obj(Some(&e), old_top);
                self.shrink_stack();
                Err(e)
            }
        };
        self.th_mut().errfunc = old_errfunc;
        result
    }
}
