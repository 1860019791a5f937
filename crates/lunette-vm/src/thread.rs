//! Per-thread state: value stack, call chain, open upvalues, hook settings.

use crate::callinfo::CallInfo;
use crate::config::{BASIC_STACK_SIZE, EXTRA_STACK, LUA_MINSTACK};
use crate::error::Status;
use crate::hook::{HookFn, HookMask};
use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use std::mem::size_of;

/// A stack slot, as an offset from the bottom of the thread's stack.
/// Offsets stay valid across stack reallocation.
pub type StkId = usize;

/// Coroutine lifecycle states, as seen from the running thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// The thread asking.
    Running,
    /// Created or yielded; ready to be resumed.
    Suspended,
    /// Resumed another coroutine and waits for it.
    Normal,
    /// Finished or failed.
    Dead,
}

/// One Lua thread (the main thread or a coroutine).
pub struct LuaThread {
    /// Slots; the last `EXTRA_STACK` lie past `stack_last`.
    pub(crate) stack: Vec<TValue>,
    /// First free slot.
    pub(crate) top: StkId,
    /// Call chain. Entries above `ci` are cached for reuse.
    pub(crate) frames: Vec<CallInfo>,
    /// Index of the running frame.
    pub(crate) ci: usize,
    /// Open upvalues as `(level, cell)`, sorted by level.
    pub(crate) open_upval: Vec<(StkId, GcRef)>,
    /// Pending to-be-closed variables, in creation order.
    pub(crate) tbclist: Vec<StkId>,
    pub(crate) status: Status,
    /// Nested native calls (plus nested non-yieldable calls in `nny`).
    pub(crate) n_ccalls: u32,
    /// Nested non-yieldable calls; zero means the thread can yield.
    pub(crate) nny: u32,
    /// Slot of the current error handler (0 = none).
    pub(crate) errfunc: StkId,
    /// Protected regions currently open on this thread.
    pub(crate) handlers: u32,
    pub(crate) hook: Option<HookFn>,
    pub(crate) hookmask: HookMask,
    pub(crate) base_hook_count: i32,
    pub(crate) hook_count: i32,
    pub(crate) allowhook: bool,
    /// Last instruction traced, for line hooks.
    pub(crate) oldpc: usize,
    /// Registered in the list of threads with open upvalues.
    pub(crate) in_twups: bool,
}

impl LuaThread {
    /// A fresh thread with a basic stack and its base frame.
    pub(crate) fn new() -> Self {
        let mut frames = Vec::with_capacity(8);
        // slot 0 is the base frame's function entry
        frames.push(CallInfo::base(1, 1 + LUA_MINSTACK));
        LuaThread {
            stack: vec![TValue::Nil; BASIC_STACK_SIZE + EXTRA_STACK],
            top: 1,
            frames,
            ci: 0,
            open_upval: Vec::new(),
            tbclist: Vec::new(),
            status: Status::Ok,
            n_ccalls: 0,
            nny: 0,
            errfunc: 0,
            handlers: 0,
            hook: None,
            hookmask: HookMask::empty(),
            base_hook_count: 0,
            hook_count: 0,
            allowhook: true,
            oldpc: 0,
            in_twups: false,
        }
    }

    /// Usable slots (excluding the extra reserve).
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    /// First slot of the extra reserve.
    #[inline]
    pub fn stack_last(&self) -> StkId {
        self.stack.len() - EXTRA_STACK
    }

    #[inline]
    pub fn top(&self) -> StkId {
        self.top
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn ci(&self) -> &CallInfo {
        &self.frames[self.ci]
    }

    #[inline]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        &mut self.frames[self.ci]
    }

    /// Running frame index (0 = base frame).
    #[inline]
    pub fn ci_index(&self) -> usize {
        self.ci
    }

    /// Frames in use, base frame included.
    #[inline]
    pub fn call_depth(&self) -> usize {
        self.ci + 1
    }

    /// Frames allocated, cached ones included.
    #[inline]
    pub fn frames_allocated(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn frame(&self, ci: usize) -> &CallInfo {
        &self.frames[ci]
    }

    #[inline]
    pub fn value_at(&self, slot: StkId) -> TValue {
        self.stack[slot]
    }

    #[inline]
    pub fn is_yieldable(&self) -> bool {
        self.nny == 0
    }

    #[inline]
    pub fn has_open_upvals(&self) -> bool {
        !self.open_upval.is_empty()
    }

    pub fn open_upval_count(&self) -> usize {
        self.open_upval.len()
    }

    /// Values pushed by the base frame that have not been consumed.
    pub(crate) fn base_values(&self) -> usize {
        self.top - (self.frames[0].func + 1)
    }

    pub(crate) fn reset_hook_count(&mut self) {
        self.hook_count = self.base_hook_count;
    }

    pub fn byte_size(&self) -> usize {
        size_of::<LuaThread>()
            + self.stack.len() * size_of::<TValue>()
            + self.frames.len() * size_of::<CallInfo>()
            + self.open_upval.capacity() * size_of::<(StkId, GcRef)>()
    }
}
