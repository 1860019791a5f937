//! Metamethods the execution core consults.

use crate::heap::Heap;
use lunette_core::object::{GcRef, LUA_NUMTYPES};
use lunette_core::value::TValue;

/// Metamethod events used by calls, finalization, weak tables and closing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tm {
    Gc,
    Mode,
    Close,
    Call,
}

impl Tm {
    pub const ALL: [Tm; 4] = [Tm::Gc, Tm::Mode, Tm::Close, Tm::Call];

    pub fn name(self) -> &'static str {
        match self {
            Tm::Gc => "__gc",
            Tm::Mode => "__mode",
            Tm::Close => "__close",
            Tm::Call => "__call",
        }
    }
}

/// Pre-interned, permanently fixed metamethod name strings.
#[derive(Clone, Copy, Debug)]
pub struct MetamethodNames {
    names: [GcRef; Tm::ALL.len()],
}

impl MetamethodNames {
    pub(crate) fn new(names: [GcRef; Tm::ALL.len()]) -> Self {
        MetamethodNames { names }
    }

    #[inline]
    pub fn get(&self, tm: Tm) -> GcRef {
        self.names[tm as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.names.iter().copied()
    }
}

/// Metatable of any value: own metatable for tables and full userdata,
/// the per-type one otherwise.
pub fn metatable_of(
    heap: &Heap,
    type_mt: &[Option<GcRef>; LUA_NUMTYPES],
    v: TValue,
) -> Option<GcRef> {
    match v {
        TValue::Table(_) | TValue::Userdata(_) => heap.own_metatable(v),
        _ => type_mt[v.base_type() as usize],
    }
}

/// Raw lookup of event `name` in metatable `mt`; absent entries are `None`.
pub fn fast_tm(heap: &Heap, mt: Option<GcRef>, name: GcRef) -> Option<TValue> {
    let mt = mt?;
    let v = heap.get_table(mt).raw_get(TValue::Str(name));
    if v.is_nil() {
        None
    } else {
        Some(v)
    }
}
