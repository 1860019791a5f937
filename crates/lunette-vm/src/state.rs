//! The interpreter context.
//!
//! `Vm` owns the heap and the collector and knows which thread is running.
//! Every thread, including the main one, is a heap object; `current` names
//! the running one, and all stack and frame operations act on it.

use crate::callinfo::{CallInfo, NativeFn};
use crate::config::{GcMode, VmConfig};
use crate::dispatch::Dispatcher;
use crate::error::LuaError;
use crate::gc::{GcStop, GcState};
use crate::heap::{GcObject, Heap};
use crate::metamethod::{fast_tm, metatable_of, MetamethodNames, Tm};
use crate::thread::{LuaThread, StkId};
use lunette_core::object::{GcHeader, GcRef, LUA_NUMTYPES};
use lunette_core::string::LuaString;
use lunette_core::table::Table;
use lunette_core::value::{LightFn, TValue};
use indexmap::IndexMap;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Registry slot holding the main thread.
pub const LUA_RIDX_MAINTHREAD: i64 = 1;
/// Registry slot holding the globals table.
pub const LUA_RIDX_GLOBALS: i64 = 2;

/// Called when an error escapes every protected region. May diverge (for
/// instance by panicking); if it returns, the process aborts.
pub type PanicFn = fn(&mut Vm);

/// Receives warning messages.
pub type WarnFn = Box<dyn FnMut(&str)>;

/// A registered light native function.
#[derive(Clone, Copy)]
pub struct NativeEntry {
    pub name: &'static str,
    pub func: NativeFn,
}

fn default_panic(vm: &mut Vm) {
    let top = vm.th().top;
    let msg = vm
        .heap
        .string_bytes(vm.th().stack[top - 1])
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_else(|| "error object is not a string".to_owned());
    error!(target: "lunette", "unprotected error in call to Lua API ({msg})");
}

fn make_seed() -> u32 {
    let local = 0u8;
    let addr = &local as *const u8 as usize;
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());
    (addr as u32) ^ nanos ^ ((addr as u64 >> 32) as u32)
}

pub struct Vm {
    pub heap: Heap,
    pub(crate) gc: GcState,
    pub(crate) config: VmConfig,
    /// Running thread.
    pub(crate) current: GcRef,
    pub(crate) main_thread: GcRef,
    /// Threads waiting in `resume` for the thread they resumed.
    pub(crate) resumers: Vec<GcRef>,
    pub(crate) registry: GcRef,
    /// Metatables for basic types without per-object metatables.
    pub(crate) type_mt: [Option<GcRef>; LUA_NUMTYPES],
    pub(crate) tm: MetamethodNames,
    pub(crate) memerrmsg: GcRef,
    pub(crate) errerrmsg: GcRef,
    /// Light native functions, addressed by `LightFn` handles.
    /// Light natives, keyed by function address.
    pub(crate) natives: IndexMap<usize, NativeEntry>,
    pub(crate) dispatcher: Option<Rc<dyn Dispatcher>>,
    pub(crate) panic: Option<PanicFn>,
    pub(crate) warnf: Option<WarnFn>,
    /// Threads with open upvalues.
    pub(crate) twups: Vec<GcRef>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        let mut heap = Heap::new(make_seed());
        let mut gc = GcState::new(&config);
        // no collection while the state is being built
        gc.stp = GcStop::GC;
        let white = gc.current_white;
        let main = GcObject::Thread(Box::new(LuaThread::new()));
        let main_thread = heap.insert(GcHeader::new(main.tag(), white), main);
        let mut vm = Vm {
            heap,
            gc,
            config,
            current: main_thread,
            main_thread,
            resumers: Vec::new(),
            registry: main_thread,
            type_mt: [None; LUA_NUMTYPES],
            tm: MetamethodNames::new([main_thread; Tm::ALL.len()]),
            memerrmsg: main_thread,
            errerrmsg: main_thread,
            natives: IndexMap::new(),
            dispatcher: None,
            panic: Some(default_panic),
            warnf: None,
            twups: Vec::new(),
        };
        // the main thread never yields
        vm.th_mut().nny = 1;
        vm.init_registry();
        vm.memerrmsg = vm.new_fixed_string("not enough memory");
        vm.errerrmsg = vm.new_fixed_string("error in error handling");
        let names = Tm::ALL.map(|tm| vm.new_fixed_string(tm.name()));
        vm.tm = MetamethodNames::new(names);
        vm.gc.stp = GcStop::empty();
        vm.gc.built = true;
        vm.heap.memory_limit = vm.config.memory_limit;
        if vm.config.gc_mode == GcMode::Generational {
            vm.change_mode(GcMode::Generational);
        }
        debug!(
            target: "lunette::gc",
            total = vm.heap.total_bytes(),
            mode = ?vm.gc.kind,
            "state created"
        );
        vm
    }

    fn init_registry(&mut self) {
        let registry = self.alloc_unchecked(GcObject::Table(Table::new(2, 0)));
        let globals = self.alloc_unchecked(GcObject::Table(Table::new(0, 0)));
        self.registry = registry;
        let main = self.main_thread;
        let t = self.heap.get_table_mut(registry);
        t.raw_seti(LUA_RIDX_MAINTHREAD, TValue::Thread(main));
        t.raw_seti(LUA_RIDX_GLOBALS, TValue::Table(globals));
        self.heap.recharge(registry);
    }

    fn new_fixed_string(&mut self, s: &str) -> GcRef {
        let data: Rc<[u8]> = Rc::from(s.as_bytes());
        let r = self.alloc_unchecked(GcObject::String(LuaString::new(
            Rc::clone(&data),
            self.heap.seed(),
        )));
        self.heap.strings.insert(data, r);
        self.fix(r);
        r
    }

    /// Tear the state down: close pending to-be-closed variables of the
    /// main thread, run every pending finalizer, free all objects.
    pub fn close_state(mut self) {
        self.current = self.main_thread;
        self.resumers.clear();
        self.th_mut().ci = 0;
        let _ = self.close_protected(1, None);
        self.free_all_objects();
        debug!(target: "lunette::gc", remaining = self.heap.len(), "state closed");
    }

    // ---- Allocation ----

    /// Store a new object without checking the memory limit.
    pub(crate) fn alloc_unchecked(&mut self, obj: GcObject) -> GcRef {
        let header = GcHeader::new(obj.tag(), self.gc.current_white);
        self.heap.insert(header, obj)
    }

    /// Store a new object, collecting in an emergency if it would pass the
    /// memory limit.
    pub(crate) fn alloc(&mut self, obj: GcObject) -> Result<GcRef, LuaError> {
        self.reserve(obj.byte_size())?;
        Ok(self.alloc_unchecked(obj))
    }

    /// Make room for `bytes` more bytes or fail with a memory error.
    pub(crate) fn reserve(&mut self, bytes: usize) -> Result<(), LuaError> {
        if !self.heap.would_exceed(bytes) {
            return Ok(());
        }
        if self.gc.can_try_again() {
            self.full_gc(true);
        }
        if self.heap.would_exceed(bytes) {
            return Err(LuaError::Memory);
        }
        Ok(())
    }

    /// Intern a string.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<GcRef, LuaError> {
        if let Some(r) = self.heap.strings.lookup(bytes) {
            let cw = self.gc.current_white;
            if let Some(h) = self.heap.header_mut(r) {
                if h.is_dead(cw) {
                    // condemned but not swept yet
                    h.flip_white();
                }
            }
            return Ok(r);
        }
        let data: Rc<[u8]> = Rc::from(bytes);
        let s = LuaString::new(Rc::clone(&data), self.heap.seed());
        let r = self.alloc(GcObject::String(s))?;
        self.heap.strings.insert(data, r);
        Ok(r)
    }

    // ---- Running thread ----

    #[inline]
    pub(crate) fn th(&self) -> &LuaThread {
        self.heap.get_thread(self.current)
    }

    #[inline]
    pub(crate) fn th_mut(&mut self) -> &mut LuaThread {
        self.heap.get_thread_mut(self.current)
    }

    #[inline]
    pub fn current_thread(&self) -> GcRef {
        self.current
    }

    #[inline]
    pub fn main_thread(&self) -> GcRef {
        self.main_thread
    }

    pub fn thread(&self, r: GcRef) -> &LuaThread {
        self.heap.get_thread(r)
    }

    #[inline]
    pub fn current_ci(&self) -> usize {
        self.th().ci
    }

    #[inline]
    pub fn frame(&self, ci: usize) -> &CallInfo {
        &self.th().frames[ci]
    }

    #[inline]
    pub fn frame_mut(&mut self, ci: usize) -> &mut CallInfo {
        &mut self.th_mut().frames[ci]
    }

    /// Prototype run by an interpreted frame.
    pub fn frame_proto(&self, ci: usize) -> Option<GcRef> {
        match self.th().stack[self.frame(ci).func] {
            TValue::LuaFn(cl) => Some(self.heap.get_closure(cl).proto),
            _ => None,
        }
    }

    #[inline]
    pub fn top(&self) -> StkId {
        self.th().top
    }

    /// Move `top` to an absolute slot without clearing anything.
    /// Dispatchers use it to delimit arguments and results.
    #[inline]
    pub fn set_top_raw(&mut self, top: StkId) {
        self.th_mut().top = top;
    }

    #[inline]
    pub fn stack_value(&self, slot: StkId) -> TValue {
        self.th().stack[slot]
    }

    #[inline]
    pub fn set_stack_value(&mut self, slot: StkId, v: TValue) {
        self.th_mut().stack[slot] = v;
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    // ---- Registry, metatables, natives ----

    pub fn registry(&self) -> TValue {
        TValue::Table(self.registry)
    }

    pub fn globals(&self) -> TValue {
        self.heap.get_table(self.registry).raw_geti(LUA_RIDX_GLOBALS)
    }

    pub fn get_metatable(&self, v: TValue) -> Option<GcRef> {
        metatable_of(&self.heap, &self.type_mt, v)
    }

    /// Metamethod `tm` of value `v`, if any.
    pub fn get_tm_by_obj(&self, v: TValue, tm: Tm) -> Option<TValue> {
        fast_tm(&self.heap, self.get_metatable(v), self.tm.get(tm))
    }

    /// Metatable shared by all values of basic type `basic`.
    pub fn set_type_metatable(&mut self, basic: u8, mt: Option<GcRef>) {
        if let Some(slot) = self.type_mt.get_mut(basic as usize) {
            *slot = mt;
        }
    }

    /// Register a light native function and return its value. A function
    /// registered before keeps its slot (and its first name).
    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> TValue {
        let entry = self.natives.entry(func as usize);
        let idx = entry.index() as u32;
        entry.or_insert(NativeEntry { name, func });
        TValue::LightFn(LightFn(idx))
    }

    pub(crate) fn native_fn(&self, f: LightFn) -> Option<NativeFn> {
        self.natives.get_index(f.0 as usize).map(|(_, e)| e.func)
    }

    pub fn native_name(&self, f: LightFn) -> Option<&'static str> {
        self.natives.get_index(f.0 as usize).map(|(_, e)| e.name)
    }

    /// Number of distinct light natives registered so far.
    pub fn native_count(&self) -> usize {
        self.natives.len()
    }

    // ---- Panic and warnings ----

    /// Replace the panic callback, returning the previous one.
    pub fn set_panic(&mut self, f: Option<PanicFn>) -> Option<PanicFn> {
        std::mem::replace(&mut self.panic, f)
    }

    /// Replace the warning sink. `None` restores logging through `tracing`.
    pub fn set_warn_fn(&mut self, f: Option<WarnFn>) {
        self.warnf = f;
    }

    pub(crate) fn warning(&mut self, msg: &str) {
        match self.warnf.as_mut() {
            Some(f) => f(msg),
            None => warn!(target: "lunette", "{msg}"),
        }
    }

    /// Report the error object on top of the stack as a warning
    /// "error in <where> (<message>)".
    pub(crate) fn warn_error(&mut self, where_: &str) {
        let errobj = self.th().stack[self.th().top - 1];
        let msg = self
            .heap
            .string_bytes(errobj)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_else(|| "error object is not a string".to_owned());
        self.warning(&format!("error in {where_} ({msg})"));
    }
}
