//! Debug hook interface: what the core calls and when.

use crate::callinfo::CallStatus;
use crate::config::LUA_MINSTACK;
use crate::error::{LuaError, LuaResult, Status};
use crate::state::Vm;
use bitflags::bitflags;

bitflags! {
    /// Events a hook subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HookMask: u8 {
        const CALL = 1 << 0;
        const RET = 1 << 1;
        const LINE = 1 << 2;
        const COUNT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line,
    Count,
    TailCall,
}

/// What a hook is told about the event.
#[derive(Debug, Clone, Copy)]
pub struct DebugInfo {
    pub event: HookEvent,
    /// Current line for line events, -1 otherwise.
    pub current_line: i32,
    /// Frame the event belongs to.
    pub ci: usize,
    /// First transferred value (1-based from the frame's function slot).
    pub ftransfer: usize,
    /// Number of transferred values (arguments or results).
    pub ntransfer: usize,
}

/// A hook callback. Errors it returns propagate like any other error.
pub type HookFn = fn(&mut Vm, &DebugInfo) -> LuaResult<()>;

impl Vm {
    /// Install (or with `None`/empty mask, remove) the hook of the running
    /// thread.
    pub fn set_hook(&mut self, hook: Option<HookFn>, mask: HookMask, count: i32) {
        let (hook, mask) = match hook {
            Some(f) if !mask.is_empty() => (Some(f), mask),
            _ => (None, HookMask::empty()),
        };
        let th = self.th_mut();
        th.hook = hook;
        th.base_hook_count = count;
        th.reset_hook_count();
        th.hookmask = mask;
        if !mask.is_empty() {
            // interpreted frames must notice the new hook
            for ci in th.frames[..=th.ci].iter_mut().filter(|ci| ci.is_lua()) {
                ci.trap = true;
            }
        }
    }

    pub fn hook_mask(&self) -> HookMask {
        self.th().hookmask
    }

    pub fn hook_count(&self) -> i32 {
        self.th().base_hook_count
    }

    /// Call the hook for `event` in the running frame, if hooks are allowed.
    pub fn hook(
        &mut self,
        event: HookEvent,
        line: i32,
        ftransfer: usize,
        ntransfer: usize,
    ) -> LuaResult<()> {
        let (hook, allow) = {
            let th = self.th();
            (th.hook, th.allowhook)
        };
        let Some(hook) = hook else { return Ok(()) };
        if !allow {
            return Ok(());
        }
        let ci = self.th().ci;
        let mut mask = CallStatus::HOOKED;
        let saved_top = self.th().top;
        let saved_ci_top = self.th().frames[ci].top;
        {
            let th = self.th_mut();
            if ntransfer != 0 {
                mask |= CallStatus::TRAN;
                th.frames[ci].ftransfer = ftransfer;
                th.frames[ci].ntransfer = ntransfer;
            }
            // protect the whole activation register
            if th.frames[ci].is_lua() && th.top < th.frames[ci].top {
                th.top = th.frames[ci].top;
            }
        }
        self.check_stack(LUA_MINSTACK)?;
        {
            let th = self.th_mut();
            if th.frames[ci].top < th.top + LUA_MINSTACK {
                th.frames[ci].top = th.top + LUA_MINSTACK;
            }
            th.allowhook = false;
            th.frames[ci].callstatus |= mask;
        }
        let ar = DebugInfo {
            event,
            current_line: line,
            ci,
            ftransfer,
            ntransfer,
        };
        hook(self, &ar)?;
        let th = self.th_mut();
        th.allowhook = true;
        th.frames[ci].top = saved_ci_top;
        th.top = saved_top;
        th.frames[ci].callstatus.remove(mask);
        if th.status == Status::Yield {
            // the hook yielded (allowed only for interpreted frames)
            th.frames[ci].callstatus |= CallStatus::HOOKYIELD;
            return Err(LuaError::Yield);
        }
        Ok(())
    }

    /// Call hook for an interpreted function that is starting. The
    /// dispatcher calls this before the first instruction.
    pub fn hook_call(&mut self, ci: usize) -> LuaResult<()> {
        {
            let th = self.th_mut();
            th.oldpc = 0;
            if th.frames[ci].callstatus.contains(CallStatus::HOOKYIELD) {
                // resumed after a hook yielded; the flag is cleared by
                // `trace_exec` once the instruction is retried
                return Ok(());
            }
            if !th.hookmask.contains(HookMask::CALL) {
                return Ok(());
            }
        }
        let event = if self.frame(ci).callstatus.contains(CallStatus::TAIL) {
            HookEvent::TailCall
        } else {
            HookEvent::Call
        };
        let nparams = self.frame_proto(ci).map_or(0, |p| self.heap.get_proto(p).num_params);
        // hooks assume the pc is already incremented
        self.frame_mut(ci).savedpc += 1;
        let r = self.hook(event, -1, 1, nparams as usize);
        self.frame_mut(ci).savedpc -= 1;
        r
    }

    /// Return hook for the frame returning `nres` values from the top.
    pub(crate) fn ret_hook(&mut self, ci: usize, nres: usize) -> LuaResult<()> {
        if self.th().hookmask.contains(HookMask::RET) {
            let firstres = self.th().top - nres;
            let mut delta = 0;
            if self.frame(ci).is_lua() {
                if let Some(p) = self.frame_proto(ci) {
                    let p = self.heap.get_proto(p);
                    if p.is_vararg {
                        delta = self.frame(ci).nextraargs + p.num_params as usize + 1;
                    }
                }
            }
            // vararg frames report against their virtual function slot
            self.frame_mut(ci).func += delta;
            let ftransfer = firstres - self.frame(ci).func;
            let r = self.hook(HookEvent::Return, -1, ftransfer, nres);
            self.frame_mut(ci).func -= delta;
            r?;
        }
        if ci > 0 && self.frame(ci - 1).is_lua() {
            let pc = self.frame(ci - 1).savedpc;
            self.th_mut().oldpc = pc.saturating_sub(1);
        }
        Ok(())
    }

    /// Line and count hooks before instruction `pc` of the running
    /// interpreted frame. Dispatchers call this while the frame's `trap` is
    /// set; `uses_top` tells that the instruction consumes values up to
    /// `top`, which must then be left alone.
    pub fn trace_exec(&mut self, pc: usize, uses_top: bool) -> LuaResult<()> {
        let ci = self.th().ci;
        let mask = self.th().hookmask;
        if !mask.intersects(HookMask::LINE | HookMask::COUNT) {
            self.frame_mut(ci).trap = false;
            return Ok(());
        }
        self.frame_mut(ci).savedpc = pc + 1;
        let counthook = mask.contains(HookMask::COUNT) && {
            let th = self.th_mut();
            th.hook_count -= 1;
            th.hook_count == 0
        };
        if counthook {
            self.th_mut().reset_hook_count();
        } else if !mask.contains(HookMask::LINE) {
            return Ok(());
        }
        let th = self.th_mut();
        if th.frames[ci].callstatus.contains(CallStatus::HOOKYIELD) {
            // the hook already ran before the yield
            th.frames[ci].callstatus.remove(CallStatus::HOOKYIELD);
            return Ok(());
        }
        if !uses_top {
            th.top = th.frames[ci].top;
        }
        let mut result = Ok(());
        if counthook {
            result = self.hook(HookEvent::Count, -1, 0, 0);
        }
        if result.is_ok() && mask.contains(HookMask::LINE) {
            let line = self.frame_proto(ci).map(|p| {
                let p = self.heap.get_proto(p);
                let oldpc = self.th().oldpc;
                let oldpc = if oldpc < p.code.len() { oldpc } else { 0 };
                let newline = p.line_at(pc);
                (pc <= oldpc || p.line_at(oldpc) != newline).then_some(newline)
            });
            if let Some(Some(newline)) = line {
                result = self.hook(HookEvent::Line, newline, 0, 0);
            }
            self.th_mut().oldpc = pc;
        }
        if let Err(LuaError::Yield) = result {
            let th = self.th_mut();
            if counthook {
                th.hook_count = 1;
            }
            // resuming runs the same instruction again
            th.frames[ci].savedpc -= 1;
        }
        result
    }
}
