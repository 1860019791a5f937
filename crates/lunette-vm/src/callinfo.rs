//! Call frame information.

use crate::error::{LuaError, LuaResult, Status};
use crate::state::Vm;
use crate::thread::StkId;
use bitflags::bitflags;

/// "Return all results" marker for `nresults`.
pub const MULTRET: i32 = -1;

/// A native function: reads its arguments from the stack and returns how
/// many values it left on top as results.
pub type NativeFn = fn(&mut Vm) -> LuaResult<usize>;

/// Opaque value handed back to a continuation.
pub type KContext = isize;

/// Continuation of a native function interrupted by a yield (or by an
/// error inside a yieldable protected call).
pub type KFunction = fn(&mut Vm, Status, KContext) -> LuaResult<usize>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallStatus: u16 {
        /// Original value of `allowhook` (saved by yieldable pcalls).
        const OAH = 1 << 0;
        /// Native function frame.
        const C = 1 << 1;
        /// Fresh dispatcher invocation; returning from it leaves `execute`.
        const FRESH = 1 << 2;
        /// Running a debug hook.
        const HOOKED = 1 << 3;
        /// Yieldable protected call.
        const YPCALL = 1 << 4;
        /// Frame entered through a tail call.
        const TAIL = 1 << 5;
        /// Last hook call yielded.
        const HOOKYIELD = 1 << 6;
        /// Frame is running a finalizer.
        const FIN = 1 << 7;
        /// `ftransfer`/`ntransfer` describe the values being transferred.
        const TRAN = 1 << 8;
        /// Native function is closing to-be-closed variables on return.
        const CLSRET = 1 << 9;
    }
}

/// Encode `nresults` for a native frame that still has to-be-closed
/// variables pending.
#[inline]
pub fn code_nresults(n: i32) -> i32 {
    -n - 3
}

/// Inverse of [`code_nresults`].
#[inline]
pub fn decode_nresults(n: i32) -> i32 {
    -n - 3
}

/// Whether a native frame's `nresults` carries the to-be-closed mark.
#[inline]
pub fn has_to_close(n: i32) -> bool {
    n < MULTRET
}

/// A call frame on a thread's call chain.
#[derive(Clone, Debug, Default)]
pub struct CallInfo {
    /// Stack slot holding the called function.
    pub func: StkId,
    /// Limit of this frame's stack window.
    pub top: StkId,
    /// Expected number of results (`MULTRET` = all).
    pub nresults: i32,
    pub callstatus: CallStatus,

    // Interpreted frames.
    /// Index of the next instruction.
    pub savedpc: usize,
    /// Dispatcher must check hooks before the next instruction.
    pub trap: bool,
    /// Varargs passed beyond the fixed parameters.
    pub nextraargs: usize,

    // Native frames.
    pub k: Option<KFunction>,
    pub ctx: KContext,
    /// Error handler active before a yieldable pcall.
    pub old_errfunc: StkId,

    /// Slot of the function called by a yieldable pcall.
    pub funcidx: StkId,
    /// Values being yielded.
    pub nyield: usize,
    /// Results of a native frame closing to-be-closed variables.
    pub nres: usize,
    /// First transferred value, for hooks (1-based, relative to `func`).
    pub ftransfer: usize,
    /// Number of transferred values, for hooks.
    pub ntransfer: usize,

    /// Error being recovered by a yieldable pcall while it unrolls.
    pub(crate) recover: Option<LuaError>,
}

impl CallInfo {
    /// The base frame every thread starts with.
    pub fn base(top: StkId, limit: StkId) -> Self {
        CallInfo {
            func: top - 1,
            top: limit,
            nresults: 0,
            callstatus: CallStatus::C,
            ..Default::default()
        }
    }

    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        !self.callstatus.contains(CallStatus::C)
    }

    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.callstatus.contains(CallStatus::C)
    }

    /// Whether the frame is a yieldable pcall that is recovering an error.
    #[inline]
    pub fn is_recovering(&self) -> bool {
        self.recover.is_some()
    }

    /// Reset every field for reuse by a new call.
    pub(crate) fn reinit(&mut self, func: StkId, nresults: i32, status: CallStatus, top: StkId) {
        *self = CallInfo {
            func,
            top,
            nresults,
            callstatus: status,
            ..Default::default()
        };
    }
}
