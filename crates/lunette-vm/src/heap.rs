//! Object heap: the arena of collectable objects plus allocation accounting.
//!
//! Accounting follows the "total + debt" scheme: `total + debt` is the number
//! of bytes in use, and a positive debt means the collector owes work.

use crate::callinfo::NativeFn;
use crate::proto::Proto;
use crate::thread::{LuaThread, StkId};
use lunette_core::gc::Arena;
use lunette_core::object::{
    ctb, GcHeader, GcRef, LUA_VCCL, LUA_VLCL, LUA_VPROTO, LUA_VSHRSTR, LUA_VTABLE, LUA_VTHREAD,
    LUA_VUPVAL, LUA_VUSERDATA,
};
use lunette_core::string::{LuaString, StringTable};
use lunette_core::table::Table;
use lunette_core::value::TValue;
use std::any::Any;
use std::fmt;
use std::mem::size_of;

/// A closure over a prototype.
#[derive(Debug, Clone)]
pub struct LuaClosure {
    pub proto: GcRef,
    /// Upvalue cells; `None` until the creator fills them.
    pub upvals: Vec<Option<GcRef>>,
}

/// A native function with its own upvalue slots.
#[derive(Clone)]
pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<TValue>,
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native closure({} upvalues)", self.upvalues.len())
    }
}

/// Full userdata: an opaque host payload plus user values and a metatable.
pub struct Userdata {
    pub metatable: Option<GcRef>,
    pub user_values: Vec<TValue>,
    pub data: Box<dyn Any>,
    /// Payload size the host declared at creation.
    pub size: usize,
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "userdata(size={}, user_values={})",
            self.size,
            self.user_values.len()
        )
    }
}

/// An upvalue cell: open while its variable still lives on a stack.
#[derive(Debug, Clone, Copy)]
pub enum UpVal {
    /// Variable at `level` on the stack of `thread`.
    Open { thread: GcRef, level: StkId },
    /// Captured value.
    Closed(TValue),
}

impl UpVal {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, UpVal::Open { .. })
    }
}

/// Every kind of collectable object.
pub enum GcObject {
    String(LuaString),
    Table(Table),
    LuaClosure(LuaClosure),
    NativeClosure(NativeClosure),
    Userdata(Userdata),
    Thread(Box<LuaThread>),
    Upval(UpVal),
    Proto(Box<Proto>),
}

impl GcObject {
    /// Collectable type tag stored in the header.
    pub fn tag(&self) -> u8 {
        ctb(match self {
            GcObject::String(_) => LUA_VSHRSTR,
            GcObject::Table(_) => LUA_VTABLE,
            GcObject::LuaClosure(_) => LUA_VLCL,
            GcObject::NativeClosure(_) => LUA_VCCL,
            GcObject::Userdata(_) => LUA_VUSERDATA,
            GcObject::Thread(_) => LUA_VTHREAD,
            GcObject::Upval(_) => LUA_VUPVAL,
            GcObject::Proto(_) => LUA_VPROTO,
        })
    }

    /// Approximate footprint charged to the allocation counters.
    pub fn byte_size(&self) -> usize {
        const HDR: usize = size_of::<GcHeader>() + 16;
        HDR + match self {
            GcObject::String(s) => size_of::<LuaString>() + s.len() + 1,
            GcObject::Table(t) => t.byte_size(),
            GcObject::LuaClosure(c) => size_of::<LuaClosure>() + c.upvals.len() * size_of::<GcRef>(),
            GcObject::NativeClosure(c) => {
                size_of::<NativeClosure>() + c.upvalues.len() * size_of::<TValue>()
            }
            GcObject::Userdata(u) => {
                size_of::<Userdata>() + u.size + u.user_values.len() * size_of::<TValue>()
            }
            GcObject::Thread(th) => th.byte_size(),
            GcObject::Upval(_) => size_of::<UpVal>(),
            GcObject::Proto(p) => p.byte_size(),
        }
    }
}

#[cold]
#[track_caller]
fn freed(r: GcRef, what: &str) -> ! {
    panic!("{what} {r:?} was freed")
}

/// Arena of all collectable objects.
pub struct Heap {
    objects: Arena<GcObject>,
    pub(crate) strings: StringTable,
    seed: u32,
    /// Bytes in use minus `debt`.
    total: isize,
    /// Bytes allocated and not yet compensated by collector work.
    debt: isize,
    pub(crate) memory_limit: Option<usize>,
}

impl Heap {
    pub fn new(seed: u32) -> Self {
        Heap {
            objects: Arena::new(),
            strings: StringTable::new(),
            seed,
            total: 0,
            debt: 0,
            memory_limit: None,
        }
    }

    #[inline]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Bytes currently in use.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        (self.total + self.debt).max(0) as usize
    }

    #[inline]
    pub fn debt(&self) -> isize {
        self.debt
    }

    /// Move the debt without changing the bytes-in-use total.
    pub(crate) fn set_debt(&mut self, debt: isize) {
        let tb = self.total + self.debt;
        let debt = debt.max(tb - isize::MAX);
        self.total = tb - debt;
        self.debt = debt;
    }

    /// Whether growing by `extra` bytes would pass the memory limit.
    #[inline]
    pub(crate) fn would_exceed(&self, extra: usize) -> bool {
        matches!(self.memory_limit, Some(limit) if self.total_bytes().saturating_add(extra) > limit)
    }

    pub(crate) fn insert(&mut self, header: GcHeader, obj: GcObject) -> GcRef {
        let size = obj.byte_size();
        self.debt += size as isize;
        self.objects.insert(header, obj, size)
    }

    /// Free an object and credit its bytes back.
    pub(crate) fn remove(&mut self, r: GcRef) -> Option<GcObject> {
        let cell = self.objects.remove(r)?;
        self.debt -= cell.charged as isize;
        if let GcObject::String(s) = &cell.value {
            self.strings.remove(s.as_bytes(), r);
        }
        Some(cell.value)
    }

    /// Re-measure an object after it grew or shrank.
    pub(crate) fn recharge(&mut self, r: GcRef) {
        if let Some(cell) = self.objects.get_mut(r) {
            let size = cell.value.byte_size();
            self.debt += size as isize - cell.charged as isize;
            cell.charged = size;
        }
    }

    /// Bytes a resize of `r` would add.
    pub(crate) fn growth_of(&self, r: GcRef, new_size: usize) -> usize {
        self.objects
            .get(r)
            .map_or(new_size, |cell| new_size.saturating_sub(cell.charged))
    }

    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&GcObject> {
        self.objects.get(r).map(|cell| &cell.value)
    }

    #[inline]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        self.objects.get_mut(r).map(|cell| &mut cell.value)
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.objects.get(r).map(|cell| &cell.header)
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        self.objects.get_mut(r).map(|cell| &mut cell.header)
    }

    #[inline]
    pub fn contains(&self, r: GcRef) -> bool {
        self.objects.contains(r)
    }

    /// Number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.objects.capacity()
    }

    #[inline]
    pub(crate) fn handle_at(&self, index: usize) -> Option<GcRef> {
        self.objects.handle_at(index)
    }

    pub(crate) fn handles(&self) -> Vec<GcRef> {
        self.objects.handles()
    }

    // ---- Typed access ----

    pub fn get_string(&self, r: GcRef) -> &LuaString {
        match self.get(r) {
            Some(GcObject::String(s)) => s,
            _ => freed(r, "string"),
        }
    }

    pub fn get_table(&self, r: GcRef) -> &Table {
        match self.get(r) {
            Some(GcObject::Table(t)) => t,
            _ => freed(r, "table"),
        }
    }

    pub fn get_table_mut(&mut self, r: GcRef) -> &mut Table {
        match self.get_mut(r) {
            Some(GcObject::Table(t)) => t,
            _ => freed(r, "table"),
        }
    }

    pub fn get_closure(&self, r: GcRef) -> &LuaClosure {
        match self.get(r) {
            Some(GcObject::LuaClosure(c)) => c,
            _ => freed(r, "closure"),
        }
    }

    pub fn get_closure_mut(&mut self, r: GcRef) -> &mut LuaClosure {
        match self.get_mut(r) {
            Some(GcObject::LuaClosure(c)) => c,
            _ => freed(r, "closure"),
        }
    }

    pub fn get_native(&self, r: GcRef) -> &NativeClosure {
        match self.get(r) {
            Some(GcObject::NativeClosure(c)) => c,
            _ => freed(r, "native closure"),
        }
    }

    pub fn get_native_mut(&mut self, r: GcRef) -> &mut NativeClosure {
        match self.get_mut(r) {
            Some(GcObject::NativeClosure(c)) => c,
            _ => freed(r, "native closure"),
        }
    }

    pub fn get_userdata(&self, r: GcRef) -> &Userdata {
        match self.get(r) {
            Some(GcObject::Userdata(u)) => u,
            _ => freed(r, "userdata"),
        }
    }

    pub fn get_userdata_mut(&mut self, r: GcRef) -> &mut Userdata {
        match self.get_mut(r) {
            Some(GcObject::Userdata(u)) => u,
            _ => freed(r, "userdata"),
        }
    }

    pub fn get_thread(&self, r: GcRef) -> &LuaThread {
        match self.get(r) {
            Some(GcObject::Thread(t)) => t,
            _ => freed(r, "thread"),
        }
    }

    pub fn get_thread_mut(&mut self, r: GcRef) -> &mut LuaThread {
        match self.get_mut(r) {
            Some(GcObject::Thread(t)) => t,
            _ => freed(r, "thread"),
        }
    }

    pub fn get_upval(&self, r: GcRef) -> &UpVal {
        match self.get(r) {
            Some(GcObject::Upval(u)) => u,
            _ => freed(r, "upvalue"),
        }
    }

    pub fn get_upval_mut(&mut self, r: GcRef) -> &mut UpVal {
        match self.get_mut(r) {
            Some(GcObject::Upval(u)) => u,
            _ => freed(r, "upvalue"),
        }
    }

    pub fn get_proto(&self, r: GcRef) -> &Proto {
        match self.get(r) {
            Some(GcObject::Proto(p)) => p,
            _ => freed(r, "proto"),
        }
    }

    pub fn get_proto_mut(&mut self, r: GcRef) -> &mut Proto {
        match self.get_mut(r) {
            Some(GcObject::Proto(p)) => p,
            _ => freed(r, "proto"),
        }
    }

    /// Contents of a string value, if it is one.
    pub fn string_bytes(&self, v: TValue) -> Option<&[u8]> {
        match v {
            TValue::Str(r) => match self.get(r) {
                Some(GcObject::String(s)) => Some(s.as_bytes()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Metatable attached directly to a table or full userdata.
    pub fn own_metatable(&self, v: TValue) -> Option<GcRef> {
        match v {
            TValue::Table(r) => self.get_table(r).metatable,
            TValue::Userdata(r) => self.get_userdata(r).metatable,
            _ => None,
        }
    }

    /// Current value of an upvalue cell.
    pub fn upval_value(&self, uv: GcRef) -> TValue {
        match *self.get_upval(uv) {
            UpVal::Open { thread, level } => self.get_thread(thread).stack[level],
            UpVal::Closed(v) => v,
        }
    }
}
