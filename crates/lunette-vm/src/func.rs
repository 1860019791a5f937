//! Closures, upvalues and to-be-closed variables.

use crate::error::{LuaError, LuaResult};
use crate::heap::{GcObject, LuaClosure, UpVal};
use crate::metamethod::Tm;
use crate::state::Vm;
use crate::thread::StkId;
use lunette_core::object::GcRef;
use lunette_core::value::TValue;

/// How pending to-be-closed variables are being closed.
#[derive(Debug, Clone)]
pub enum CloseStatus {
    /// Closing on return: keep `top`, pass nil as the error.
    KeepTop,
    /// Closing without an error; the error argument is nil.
    Normal,
    /// Closing while unwinding `err`, which each method receives.
    Error(LuaError),
}

impl Vm {
    /// Create an interpreted closure over `proto` with `nupvals` empty
    /// upvalue slots.
    pub fn new_lua_closure(&mut self, proto: GcRef, nupvals: usize) -> LuaResult<GcRef> {
        self.alloc(GcObject::LuaClosure(LuaClosure {
            proto,
            upvals: vec![None; nupvals],
        }))
    }

    /// Fill every upvalue slot of `cl` with a fresh closed cell holding nil.
    pub fn init_upvals(&mut self, cl: GcRef) -> LuaResult<()> {
        let n = self.heap.get_closure(cl).upvals.len();
        for i in 0..n {
            let uv = self.alloc(GcObject::Upval(UpVal::Closed(TValue::Nil)))?;
            self.heap.get_closure_mut(cl).upvals[i] = Some(uv);
            self.obj_barrier(cl, uv);
        }
        Ok(())
    }

    /// Open upvalue of the running thread for stack slot `level`, created
    /// if it does not exist yet.
    pub fn find_upval(&mut self, level: StkId) -> LuaResult<GcRef> {
        let cur = self.current;
        let pos = match self
            .th()
            .open_upval
            .binary_search_by_key(&level, |&(l, _)| l)
        {
            Ok(i) => return Ok(self.th().open_upval[i].1),
            Err(i) => i,
        };
        let uv = self.alloc(GcObject::Upval(UpVal::Open { thread: cur, level }))?;
        let th = self.th_mut();
        th.open_upval.insert(pos, (level, uv));
        if !th.in_twups {
            th.in_twups = true;
            self.twups.push(cur);
        }
        Ok(uv)
    }

    /// Drop an open upvalue from its thread's list (the cell is being freed).
    pub(crate) fn unlink_upval(&mut self, uv: GcRef) {
        if let Some(GcObject::Upval(UpVal::Open { thread, level })) = self.heap.get(uv) {
            let (thread, level) = (*thread, *level);
            if let Some(GcObject::Thread(th)) = self.heap.get_mut(thread) {
                if let Ok(i) = th.open_upval.binary_search_by_key(&level, |&(l, _)| l) {
                    th.open_upval.remove(i);
                }
            }
        }
    }

    /// Close every open upvalue of the running thread at or above `level`:
    /// the current stack value moves into the cell.
    pub fn close_upvals(&mut self, level: StkId) {
        let cur = self.current;
        self.close_upvals_of(cur, level);
    }

    pub(crate) fn close_upvals_of(&mut self, thread: GcRef, level: StkId) {
        loop {
            let th = self.heap.get_thread_mut(thread);
            let Some(&(l, uv)) = th.open_upval.last() else { break };
            if l < level {
                break;
            }
            th.open_upval.pop();
            let v = th.stack[l];
            *self.heap.get_upval_mut(uv) = UpVal::Closed(v);
            let marked = self.heap.header_mut(uv).is_some_and(|h| {
                let marked = !h.is_white();
                if marked {
                    // closed upvalues cannot be gray
                    h.set_black();
                }
                marked
            });
            if marked {
                self.barrier(uv, v);
            }
        }
    }

    /// Current value of upvalue `idx` of interpreted closure `cl`.
    pub fn upval_get(&self, cl: GcRef, idx: usize) -> TValue {
        match self.heap.get_closure(cl).upvals.get(idx) {
            Some(Some(uv)) => self.heap.upval_value(*uv),
            _ => TValue::Nil,
        }
    }

    /// Assign upvalue `idx` of interpreted closure `cl`.
    pub fn upval_set(&mut self, cl: GcRef, idx: usize, v: TValue) {
        let Some(Some(uv)) = self.heap.get_closure(cl).upvals.get(idx).copied() else {
            return;
        };
        match *self.heap.get_upval(uv) {
            UpVal::Open { thread, level } => {
                self.heap.get_thread_mut(thread).stack[level] = v;
            }
            UpVal::Closed(_) => {
                *self.heap.get_upval_mut(uv) = UpVal::Closed(v);
                self.barrier(uv, v);
            }
        }
    }

    /// Register stack slot `level` as a to-be-closed variable. `false` and
    /// `nil` need no closing; any other value must have `__close`.
    pub fn new_tbc_upval(&mut self, level: StkId) -> LuaResult<()> {
        let v = self.th().stack[level];
        if v.is_falsy() {
            return Ok(());
        }
        if self.get_tm_by_obj(v, Tm::Close).is_none() {
            let ci = self.th().ci;
            let idx = level - self.frame(ci).func;
            let vname = self.local_name(ci, idx).unwrap_or_else(|| "?".to_owned());
            return Err(self.run_error(&format!("variable '{vname}' got a non-closable value")));
        }
        self.th_mut().tbclist.push(level);
        Ok(())
    }

    fn local_name(&self, ci: usize, n: usize) -> Option<String> {
        let p = self.heap.get_proto(self.frame_proto(ci)?);
        let pc = self.frame(ci).savedpc.saturating_sub(1);
        let name = p.local_name(n, pc)?;
        self.heap
            .string_bytes(TValue::Str(name))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Call the `__close` method of the variable at `level` with the error
    /// object for `status`.
    fn prep_call_close_method(&mut self, level: StkId, status: &CloseStatus, yy: bool) -> LuaResult<()> {
        let errobj = match status {
            CloseStatus::KeepTop => TValue::Nil,
            CloseStatus::Normal => {
                self.set_error_obj(None, level + 1);
                TValue::Nil
            }
            CloseStatus::Error(e) => {
                self.set_error_obj(Some(e), level + 1);
                self.th().stack[level + 1]
            }
        };
        let obj = self.th().stack[level];
        self.call_close_method(obj, errobj, yy)
    }

    fn call_close_method(&mut self, obj: TValue, err: TValue, yy: bool) -> LuaResult<()> {
        let tm = self.get_tm_by_obj(obj, Tm::Close).unwrap_or(TValue::Nil);
        let top = self.th().top;
        {
            let th = self.th_mut();
            th.stack[top] = tm;
            th.stack[top + 1] = obj;
            th.stack[top + 2] = err;
            th.top = top + 3;
        }
        if yy {
            self.call_at(top, 0)
        } else {
            self.call_noyield_at(top, 0)
        }
    }

    /// Close upvalues and to-be-closed variables from `level` up, newest
    /// first. `yy` allows the closing methods to yield. Returns `level`.
    pub fn close(&mut self, level: StkId, status: CloseStatus, yy: bool) -> LuaResult<StkId> {
        self.close_upvals(level);
        while let Some(&tbc) = self.th().tbclist.last() {
            if tbc < level {
                break;
            }
            self.th_mut().tbclist.pop();
            self.prep_call_close_method(tbc, &status, yy)?;
        }
        Ok(level)
    }
}
