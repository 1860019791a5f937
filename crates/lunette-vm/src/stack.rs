//! Stack manager: growth, shrinking and space checks.
//!
//! Slots are addressed by offset, so nothing needs fixing up when the
//! backing vector moves.

use crate::config::{EXTRA_STACK, LUA_MINSTACK};
use crate::error::{LuaError, LuaResult};
use crate::state::Vm;
use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use std::mem::size_of;
use tracing::trace;

impl Vm {
    /// Resize the stack of thread `th` to `newsize` usable slots. Returns
    /// `Ok(false)` when memory runs out and `raise` is false.
    pub(crate) fn realloc_stack_of(
        &mut self,
        th: GcRef,
        newsize: usize,
        raise: bool,
    ) -> LuaResult<bool> {
        let oldsize = self.heap.get_thread(th).stack_size();
        if newsize > oldsize {
            let extra = (newsize - oldsize) * size_of::<TValue>();
            if self.heap.would_exceed(extra) {
                if self.gc.can_try_again() {
                    self.full_gc(true);
                }
                if self.heap.would_exceed(extra) {
                    return if raise { Err(LuaError::Memory) } else { Ok(false) };
                }
            }
        }
        let t = self.heap.get_thread_mut(th);
        t.stack.resize(newsize + EXTRA_STACK, TValue::Nil);
        if newsize < oldsize {
            t.stack.shrink_to_fit();
        }
        self.heap.recharge(th);
        trace!(target: "lunette::stack", thread = ?th, oldsize, newsize, "stack reallocated");
        Ok(true)
    }

    pub(crate) fn realloc_stack(&mut self, newsize: usize, raise: bool) -> LuaResult<bool> {
        let th = self.current;
        self.realloc_stack_of(th, newsize, raise)
    }

    /// Grow the running thread's stack so that at least `n` more slots fit
    /// above `top`. Past the configured maximum the thread gets the error
    /// reserve once and a "stack overflow" error; growing while already in
    /// the reserve is an error in error handling.
    pub(crate) fn grow_stack(&mut self, n: usize, raise: bool) -> LuaResult<bool> {
        let size = self.th().stack_size();
        let max = self.config.max_stack;
        if size > max {
            // already using the error reserve
            return if raise { Err(LuaError::ErrorInHandler) } else { Ok(false) };
        }
        if n < max {
            let needed = self.th().top + n;
            let newsize = (2 * size).min(max).max(needed);
            if newsize <= max {
                return self.realloc_stack(newsize, raise);
            }
        }
        self.realloc_stack(self.config.error_stack_size(), raise)?;
        if raise {
            return Err(self.run_error("stack overflow"));
        }
        Ok(false)
    }

    /// Make sure `n` free slots exist above `top`, growing if needed.
    pub fn check_stack(&mut self, n: usize) -> LuaResult<()> {
        let th = self.th();
        if th.stack_last() - th.top <= n {
            self.grow_stack(n, true)?;
        }
        Ok(())
    }

    /// Like [`Vm::check_stack`], but give the collector a chance to run
    /// before growing.
    pub(crate) fn check_stack_gc(&mut self, n: usize) -> LuaResult<()> {
        let th = self.th();
        if th.stack_last() - th.top <= n {
            self.check_gc();
            self.grow_stack(n, true)?;
        }
        Ok(())
    }

    /// Slots in use by thread `th`: the highest of `top` and every live
    /// frame's limit, never below `LUA_MINSTACK`.
    pub(crate) fn stack_in_use(&self, th: GcRef) -> usize {
        let t = self.heap.get_thread(th);
        let lim = t.frames[..=t.ci]
            .iter()
            .map(|ci| ci.top)
            .fold(t.top, usize::max);
        (lim + 1).max(LUA_MINSTACK)
    }

    /// Give back stack space a thread no longer needs, unless it is
    /// handling a stack overflow. Also trims the frame cache.
    pub(crate) fn shrink_stack_of(&mut self, th: GcRef) {
        let inuse = self.stack_in_use(th);
        let max_stack = self.config.max_stack;
        let max = if inuse > max_stack / 3 {
            max_stack
        } else {
            inuse * 3
        };
        if inuse <= max_stack && self.heap.get_thread(th).stack_size() > max {
            let nsize = if inuse > max_stack / 2 {
                max_stack
            } else {
                inuse * 2
            };
            // failing to shrink is harmless
            let _ = self.realloc_stack_of(th, nsize, false);
        }
        self.shrink_ci_of(th);
    }

    pub(crate) fn shrink_stack(&mut self) {
        let th = self.current;
        self.shrink_stack_of(th);
    }

    /// Push one slot, growing the stack if `top` reached its end.
    pub(crate) fn inc_top(&mut self) -> LuaResult<()> {
        self.th_mut().top += 1;
        self.check_stack(0)
    }
}
