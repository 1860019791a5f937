//! Tagged Lua values.
//!
//! A `TValue` is a closed sum type. Collectable variants carry a `GcRef`
//! into the heap arena; everything else is stored inline. The 8-bit tag
//! (`TValue::tag`) encodes basic type, variant and the collectable bit the
//! same way object headers do, so a value can be checked against the object
//! it points to.

use crate::object::*;
use std::fmt;

/// Handle to a registered native function without upvalues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LightFn(pub u32);

/// A Lua value.
#[derive(Clone, Copy)]
pub enum TValue {
    Nil,
    /// Empty slot (array hole, cleared weak entry).
    Empty,
    /// Result of a lookup for an absent key.
    AbsentKey,
    Bool(bool),
    Int(i64),
    Float(f64),
    LightUserdata(usize),
    LightFn(LightFn),
    Str(GcRef),
    Table(GcRef),
    /// Interpreted closure.
    LuaFn(GcRef),
    /// Native closure with upvalues.
    NativeFn(GcRef),
    Userdata(GcRef),
    Thread(GcRef),
}

impl TValue {
    // ---- Constructors ----

    #[inline]
    pub const fn nil() -> Self {
        TValue::Nil
    }

    #[inline]
    pub const fn from_bool(b: bool) -> Self {
        TValue::Bool(b)
    }

    #[inline]
    pub const fn from_integer(i: i64) -> Self {
        TValue::Int(i)
    }

    #[inline]
    pub const fn from_float(f: f64) -> Self {
        TValue::Float(f)
    }

    // ---- Tags ----

    /// Full tag: variant plus collectable bit.
    pub fn tag(&self) -> u8 {
        match self {
            TValue::Nil => LUA_VNIL,
            TValue::Empty => LUA_VEMPTY,
            TValue::AbsentKey => LUA_VABSTKEY,
            TValue::Bool(false) => LUA_VFALSE,
            TValue::Bool(true) => LUA_VTRUE,
            TValue::Int(_) => LUA_VNUMINT,
            TValue::Float(_) => LUA_VNUMFLT,
            TValue::LightUserdata(_) => LUA_VLIGHTUSERDATA,
            TValue::LightFn(_) => LUA_VLCF,
            TValue::Str(_) => ctb(LUA_VSHRSTR),
            TValue::Table(_) => ctb(LUA_VTABLE),
            TValue::LuaFn(_) => ctb(LUA_VLCL),
            TValue::NativeFn(_) => ctb(LUA_VCCL),
            TValue::Userdata(_) => ctb(LUA_VUSERDATA),
            TValue::Thread(_) => ctb(LUA_VTHREAD),
        }
    }

    /// Basic type (`LUA_TNIL` .. `LUA_TTHREAD`).
    #[inline]
    pub fn base_type(&self) -> u8 {
        novariant(self.tag())
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        type_name(self.base_type())
    }

    // ---- Type checks ----

    /// Any variant of nil, including empty slots and absent keys.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, TValue::Nil | TValue::Empty | TValue::AbsentKey)
    }

    /// Only the standard nil.
    #[inline]
    pub fn is_strict_nil(&self) -> bool {
        matches!(self, TValue::Nil)
    }

    /// Only nil and false are falsy.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        self.is_nil() || matches!(self, TValue::Bool(false))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, TValue::Bool(_))
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, TValue::Int(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, TValue::Float(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, TValue::Int(_) | TValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, TValue::Str(_))
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        matches!(self, TValue::Table(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(
            self,
            TValue::LuaFn(_) | TValue::NativeFn(_) | TValue::LightFn(_)
        )
    }

    #[inline]
    pub fn is_thread(&self) -> bool {
        matches!(self, TValue::Thread(_))
    }

    #[inline]
    pub fn is_collectable(&self) -> bool {
        self.gc_ref().is_some()
    }

    // ---- Extractors ----

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            TValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            TValue::Int(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Numeric value as a float (integers converted).
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            TValue::Int(i) => Some(i as f64),
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::Str(r) => Some(r),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::Table(r) => Some(r),
            _ => None,
        }
    }

    #[inline]
    pub fn as_thread_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::Thread(r) => Some(r),
            _ => None,
        }
    }

    /// Heap handle of a collectable value.
    #[inline]
    pub fn gc_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::Str(r)
            | TValue::Table(r)
            | TValue::LuaFn(r)
            | TValue::NativeFn(r)
            | TValue::Userdata(r)
            | TValue::Thread(r) => Some(r),
            _ => None,
        }
    }

    /// Rebuild a value from a handle and the tag stored in its header.
    /// Returns `None` for internal objects (upvalues, prototypes).
    pub fn from_gc(r: GcRef, tag: u8) -> Option<TValue> {
        match with_variant(tag) {
            LUA_VSHRSTR => Some(TValue::Str(r)),
            LUA_VTABLE => Some(TValue::Table(r)),
            LUA_VLCL => Some(TValue::LuaFn(r)),
            LUA_VCCL => Some(TValue::NativeFn(r)),
            LUA_VUSERDATA => Some(TValue::Userdata(r)),
            LUA_VTHREAD => Some(TValue::Thread(r)),
            _ => None,
        }
    }
}

impl Default for TValue {
    fn default() -> Self {
        TValue::Nil
    }
}

/// Raw equality: no metamethods, integers and floats compare numerically.
impl PartialEq for TValue {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (a, b) if a.is_nil() && b.is_nil() => true,
            (TValue::Bool(a), TValue::Bool(b)) => a == b,
            (TValue::Int(a), TValue::Int(b)) => a == b,
            (TValue::Float(a), TValue::Float(b)) => a == b,
            (TValue::Int(a), TValue::Float(b)) | (TValue::Float(b), TValue::Int(a)) => {
                b.fract() == 0.0 && b >= i64::MIN as f64 && b < i64::MAX as f64 && a == b as i64
            }
            (TValue::LightUserdata(a), TValue::LightUserdata(b)) => a == b,
            (TValue::LightFn(a), TValue::LightFn(b)) => a == b,
            (a, b) => match (a.gc_ref(), b.gc_ref()) {
                (Some(x), Some(y)) => x == y && a.tag() == b.tag(),
                _ => false,
            },
        }
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TValue::Nil => write!(f, "nil"),
            TValue::Empty => write!(f, "<empty>"),
            TValue::AbsentKey => write!(f, "<absent>"),
            TValue::Bool(b) => write!(f, "{b}"),
            TValue::Int(i) => write!(f, "{i}"),
            TValue::Float(x) => write!(f, "{x:?}"),
            TValue::LightUserdata(p) => write!(f, "userdata: {p:#x}"),
            TValue::LightFn(id) => write!(f, "function: builtin {}", id.0),
            TValue::Str(r) => write!(f, "string{r:?}"),
            TValue::Table(r) => write!(f, "table{r:?}"),
            TValue::LuaFn(r) => write!(f, "function{r:?}"),
            TValue::NativeFn(r) => write!(f, "native{r:?}"),
            TValue::Userdata(r) => write!(f, "userdata{r:?}"),
            TValue::Thread(r) => write!(f, "thread{r:?}"),
        }
    }
}
