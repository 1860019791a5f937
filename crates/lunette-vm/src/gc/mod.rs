//! Incremental and generational tracing collector.
//!
//! Objects live in the heap arena; which collector list owns an object is
//! recorded in its header (`GcList`), so moving between lists is a header
//! update plus, for the finalizer lists, an entry in `finobj`/`tobefnz`.
//! Worklists (`gray`, `grayagain`, the weak-table lists) hold handles.
//!
//! An incremental cycle runs through the phases of [`GcPhase`] in order,
//! paced by the allocation debt. In generational mode most collections are
//! minor ones that only sweep young objects (see `generational.rs`).

mod barrier;
mod check;
mod finalize;
mod generational;
mod mark;
mod sweep;
mod weak;

pub use check::ColorViolation;

use crate::config::{GcMode, VmConfig};
use crate::state::Vm;
use bitflags::bitflags;
use lunette_core::object::{Age, GcList, GcRef, Marks};
use lunette_core::value::TValue;
use std::collections::VecDeque;
use std::mem::size_of;
use tracing::{debug, trace};

/// Objects swept per step.
pub(crate) const GCSWEEPMAX: usize = 100;
/// Finalizers run per step.
pub(crate) const GCFINMAX: usize = 10;
/// Work charged for each finalizer.
pub(crate) const GCFINALIZECOST: usize = 50;
/// Bytes of allocation that correspond to one unit of work.
pub(crate) const WORK2MEM: isize = size_of::<TValue>() as isize;
/// Divisor applied to the estimate before the pause multiplier.
const PAUSEADJ: usize = 100;

/// Collector phases, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcPhase {
    Propagate,
    EnterAtomic,
    Atomic,
    SwpAllGc,
    SwpFinObj,
    SwpToBeFnz,
    SwpEnd,
    CallFin,
    Pause,
}

impl GcPhase {
    /// Phases in which black objects must not point to white ones.
    #[inline]
    pub fn keeps_invariant(self) -> bool {
        self <= GcPhase::Atomic
    }

    #[inline]
    pub fn is_sweep(self) -> bool {
        (GcPhase::SwpAllGc..=GcPhase::SwpEnd).contains(&self)
    }
}

bitflags! {
    /// Reasons the collector is stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GcStop: u8 {
        /// Stopped by the embedder.
        const USR = 1 << 0;
        /// Stopped internally (state being built, finalizer running).
        const GC = 1 << 1;
        /// The state is closing.
        const CLS = 1 << 2;
    }
}

/// Requests accepted by [`Vm::gc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCommand {
    Stop,
    Restart,
    /// Full collection.
    Collect,
    /// Bytes in use.
    Count,
    /// Pay `n` KiB of debt (0 for one basic step).
    Step(usize),
    IsRunning,
    /// Switch to incremental mode; zero keeps a parameter unchanged.
    Incremental { pause: u32, stepmul: u32, stepsize: u32 },
    /// Switch to generational mode; zero keeps a parameter unchanged.
    Generational { minormul: u32, majormul: u32 },
}

/// Answers of [`Vm::gc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcResponse {
    Done,
    Count(usize),
    /// Whether the step finished a cycle.
    Step(bool),
    Running(bool),
    /// Mode before the switch.
    PreviousMode(GcMode),
    /// Collector control is not available inside a finalizer.
    Refused,
}

pub(crate) struct GcState {
    pub(crate) current_white: Marks,
    pub(crate) phase: GcPhase,
    pub(crate) kind: GcMode,
    pub(crate) stp: GcStop,
    /// Running an emergency collection.
    pub(crate) emergency: bool,
    /// Emergency collections are not allowed (a step is running).
    pub(crate) stopem: bool,
    /// The state is fully built.
    pub(crate) built: bool,
    pub(crate) gray: Vec<GcRef>,
    pub(crate) grayagain: Vec<GcRef>,
    /// Weak-value tables to clear.
    pub(crate) weak: Vec<GcRef>,
    /// Ephemeron tables.
    pub(crate) ephemeron: Vec<GcRef>,
    /// Tables with weak keys and values.
    pub(crate) allweak: Vec<GcRef>,
    /// Objects with a finalizer, in the order they were registered.
    pub(crate) finobj: Vec<GcRef>,
    /// Unreachable objects whose finalizer is pending, next one first.
    pub(crate) tobefnz: VecDeque<GcRef>,
    /// Next arena slot to sweep.
    pub(crate) sweep_cursor: usize,
    /// Bytes in use after the last collection.
    pub(crate) estimate: usize,
    /// Objects traversed by the last atomic phase of a bad collection
    /// (0 when the last generational collection was good).
    pub(crate) lastatomic: usize,
    pub(crate) pause: u32,
    pub(crate) stepmul: u32,
    pub(crate) stepsize: u32,
    pub(crate) genminormul: u32,
    pub(crate) genmajormul: u32,
}

impl GcState {
    pub(crate) fn new(config: &VmConfig) -> Self {
        GcState {
            current_white: Marks::WHITE0,
            phase: GcPhase::Pause,
            kind: GcMode::Incremental,
            stp: GcStop::empty(),
            emergency: false,
            stopem: false,
            built: false,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            finobj: Vec::new(),
            tobefnz: VecDeque::new(),
            sweep_cursor: 0,
            estimate: 0,
            lastatomic: 0,
            pause: config.gc_pause,
            stepmul: config.gc_stepmul,
            stepsize: config.gc_stepsize,
            genminormul: config.gen_minor_mul,
            genmajormul: config.gen_major_mul,
        }
    }

    /// Whether an allocation failure may trigger an emergency collection.
    #[inline]
    pub(crate) fn can_try_again(&self) -> bool {
        self.built && !self.stopem
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.stp.is_empty()
    }

    /// Generational, or incremental only while recovering from a bad
    /// generational collection.
    #[inline]
    pub(crate) fn is_dec_gen(&self) -> bool {
        self.kind == GcMode::Generational || self.lastatomic != 0
    }

    pub(crate) fn clear_gray_lists(&mut self) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.allweak.clear();
        self.ephemeron.clear();
    }
}

impl Vm {
    pub fn gc_phase(&self) -> GcPhase {
        self.gc.phase
    }

    pub fn gc_mode(&self) -> GcMode {
        self.gc.kind
    }

    /// Make `r` permanent: gray and old forever, never swept.
    pub(crate) fn fix(&mut self, r: GcRef) {
        if let Some(h) = self.heap.header_mut(r) {
            h.set_gray();
            h.set_age(Age::Old);
            h.set_list(GcList::Fixed);
        }
    }

    /// Allocation-point hook: do a step when debt is positive.
    pub fn check_gc(&mut self) {
        if self.heap.debt() > 0 {
            self.step();
        }
    }

    /// One collector step, sized by the current debt.
    pub(crate) fn step(&mut self) {
        if !self.gc.is_running() {
            // not running: try again later
            self.heap.set_debt(-2000);
        } else if self.gc.is_dec_gen() {
            self.gen_step();
        } else {
            self.inc_step();
        }
    }

    fn inc_step(&mut self) {
        let stepmul = (self.gc.stepmul as isize) | 1;
        let mut debt = (self.heap.debt() / WORK2MEM) * stepmul;
        let stepsize = if (self.gc.stepsize as usize) < isize::BITS as usize - 2 {
            ((1isize << self.gc.stepsize) / WORK2MEM) * stepmul
        } else {
            isize::MAX
        };
        loop {
            let work = self.single_step() as isize;
            debt -= work;
            if debt <= -stepsize || self.gc.phase == GcPhase::Pause {
                break;
            }
        }
        if self.gc.phase == GcPhase::Pause {
            self.set_pause();
        } else {
            let debt = (debt / stepmul) * WORK2MEM;
            self.heap.set_debt(debt);
        }
        trace!(
            target: "lunette::gc",
            phase = ?self.gc.phase,
            debt = self.heap.debt(),
            total = self.heap.total_bytes(),
            "incremental step"
        );
    }

    /// Set the debt so the next cycle starts once memory use reaches
    /// `pause`% of the estimate.
    pub(crate) fn set_pause(&mut self) {
        let pause = self.gc.pause as isize;
        let estimate = (self.gc.estimate / PAUSEADJ).max(1) as isize;
        let threshold = if pause < isize::MAX / estimate {
            estimate * pause
        } else {
            isize::MAX
        };
        let debt = (self.heap.total_bytes() as isize - threshold).min(0);
        self.heap.set_debt(debt);
    }

    /// Advance the collector by one phase-specific unit of work.
    pub(crate) fn single_step(&mut self) -> usize {
        debug_assert!(!self.gc.stopem, "collector is not reentrant");
        self.gc.stopem = true;
        let work = match self.gc.phase {
            GcPhase::Pause => {
                self.restart_collection();
                self.gc.phase = GcPhase::Propagate;
                debug!(target: "lunette::gc", total = self.heap.total_bytes(), "cycle started");
                1
            }
            GcPhase::Propagate => {
                if self.gc.gray.is_empty() {
                    self.gc.phase = GcPhase::EnterAtomic;
                    0
                } else {
                    self.propagate_mark()
                }
            }
            GcPhase::EnterAtomic => {
                let work = self.atomic();
                self.enter_sweep();
                self.gc.estimate = self.heap.total_bytes();
                debug!(target: "lunette::gc", work, estimate = self.gc.estimate, "atomic done");
                work
            }
            GcPhase::Atomic => 0,
            GcPhase::SwpAllGc => self.sweep_step(GcList::AllGc, GcPhase::SwpFinObj),
            GcPhase::SwpFinObj => self.sweep_step(GcList::FinObj, GcPhase::SwpToBeFnz),
            GcPhase::SwpToBeFnz => self.sweep_step(GcList::ToBeFnz, GcPhase::SwpEnd),
            GcPhase::SwpEnd => {
                self.heap.strings.check_size();
                self.gc.phase = GcPhase::CallFin;
                debug!(target: "lunette::gc", total = self.heap.total_bytes(), "sweep done");
                0
            }
            GcPhase::CallFin => {
                if !self.gc.tobefnz.is_empty() && !self.gc.emergency {
                    // collections are fine while finalizers run
                    self.gc.stopem = false;
                    self.run_a_few_finalizers(GCFINMAX) * GCFINALIZECOST
                } else {
                    self.gc.phase = GcPhase::Pause;
                    0
                }
            }
        };
        self.gc.stopem = false;
        work
    }

    /// Step until the collector reaches `phase`.
    pub(crate) fn run_until(&mut self, phase: GcPhase) {
        while self.gc.phase != phase {
            self.single_step();
        }
    }

    fn full_inc(&mut self) {
        if self.gc.phase.keeps_invariant() {
            // sweep everything back to white
            self.enter_sweep();
        }
        self.run_until(GcPhase::Pause);
        self.run_until(GcPhase::CallFin);
        self.run_until(GcPhase::Pause);
        self.set_pause();
    }

    /// Full collection. An emergency collection neither shrinks stacks nor
    /// runs finalizers.
    pub fn full_gc(&mut self, emergency: bool) {
        debug_assert!(!self.gc.emergency);
        self.gc.emergency = emergency;
        debug!(
            target: "lunette::gc",
            emergency,
            mode = ?self.gc.kind,
            total = self.heap.total_bytes(),
            "full collection"
        );
        if self.gc.kind == GcMode::Incremental {
            self.full_inc();
        } else {
            self.full_gen();
        }
        self.gc.emergency = false;
    }

    /// Switch collector mode.
    pub fn change_mode(&mut self, mode: GcMode) {
        if mode != self.gc.kind {
            debug!(target: "lunette::gc", from = ?self.gc.kind, to = ?mode, "mode change");
            match mode {
                GcMode::Generational => {
                    self.enter_gen();
                }
                GcMode::Incremental => self.enter_inc(),
            }
        }
        self.gc.lastatomic = 0;
    }

    /// Collector control for embedders.
    pub fn gc(&mut self, cmd: GcCommand) -> GcResponse {
        if self.gc.stp.contains(GcStop::GC) {
            return GcResponse::Refused;
        }
        match cmd {
            GcCommand::Stop => {
                self.gc.stp = GcStop::USR;
                GcResponse::Done
            }
            GcCommand::Restart => {
                self.heap.set_debt(0);
                self.gc.stp = GcStop::empty();
                GcResponse::Done
            }
            GcCommand::Collect => {
                self.full_gc(false);
                GcResponse::Done
            }
            GcCommand::Count => GcResponse::Count(self.heap.total_bytes()),
            GcCommand::Step(kib) => {
                let oldstp = self.gc.stp;
                let mut debt: isize = 1;
                self.gc.stp = GcStop::empty();
                if kib == 0 {
                    self.heap.set_debt(0);
                    self.step();
                } else {
                    debt = (kib as isize).saturating_mul(1024) + self.heap.debt();
                    self.heap.set_debt(debt);
                    self.check_gc();
                }
                self.gc.stp = oldstp;
                GcResponse::Step(debt > 0 && self.gc.phase == GcPhase::Pause)
            }
            GcCommand::IsRunning => GcResponse::Running(self.gc.is_running()),
            GcCommand::Incremental { pause, stepmul, stepsize } => {
                let prev = self.decorated_mode();
                if pause != 0 {
                    self.gc.pause = pause;
                }
                if stepmul != 0 {
                    self.gc.stepmul = stepmul;
                }
                if stepsize != 0 {
                    self.gc.stepsize = stepsize;
                }
                self.change_mode(GcMode::Incremental);
                GcResponse::PreviousMode(prev)
            }
            GcCommand::Generational { minormul, majormul } => {
                let prev = self.decorated_mode();
                if minormul != 0 {
                    self.gc.genminormul = minormul;
                }
                if majormul != 0 {
                    self.gc.genmajormul = majormul;
                }
                self.change_mode(GcMode::Generational);
                GcResponse::PreviousMode(prev)
            }
        }
    }

    fn decorated_mode(&self) -> GcMode {
        if self.gc.is_dec_gen() {
            GcMode::Generational
        } else {
            GcMode::Incremental
        }
    }
}
