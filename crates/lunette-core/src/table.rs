//! Hybrid array+hash table for Lua.

use crate::object::GcRef;
use crate::value::{LightFn, TValue};
use indexmap::IndexMap;
use std::fmt;

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    /// Float key, stored as raw bits for hashing.
    Float(u64),
    Boolean(bool),
    LightUserdata(usize),
    LightFn(LightFn),
    String(GcRef),
    Table(GcRef),
    LuaFn(GcRef),
    NativeFn(GcRef),
    Userdata(GcRef),
    Thread(GcRef),
}

impl TableKey {
    /// Normalize a value into a key. Floats with an exact integer value
    /// become integer keys; nil and NaN are not valid keys.
    pub fn from_value(v: TValue) -> Option<TableKey> {
        Some(match v {
            TValue::Nil | TValue::Empty | TValue::AbsentKey => return None,
            TValue::Int(i) => TableKey::Integer(i),
            TValue::Float(f) => {
                if f.is_nan() {
                    return None;
                }
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    TableKey::Integer(f as i64)
                } else {
                    TableKey::Float(f.to_bits())
                }
            }
            TValue::Bool(b) => TableKey::Boolean(b),
            TValue::LightUserdata(p) => TableKey::LightUserdata(p),
            TValue::LightFn(f) => TableKey::LightFn(f),
            TValue::Str(r) => TableKey::String(r),
            TValue::Table(r) => TableKey::Table(r),
            TValue::LuaFn(r) => TableKey::LuaFn(r),
            TValue::NativeFn(r) => TableKey::NativeFn(r),
            TValue::Userdata(r) => TableKey::Userdata(r),
            TValue::Thread(r) => TableKey::Thread(r),
        })
    }

    pub fn to_value(self) -> TValue {
        match self {
            TableKey::Integer(i) => TValue::Int(i),
            TableKey::Float(bits) => TValue::Float(f64::from_bits(bits)),
            TableKey::Boolean(b) => TValue::Bool(b),
            TableKey::LightUserdata(p) => TValue::LightUserdata(p),
            TableKey::LightFn(f) => TValue::LightFn(f),
            TableKey::String(r) => TValue::Str(r),
            TableKey::Table(r) => TValue::Table(r),
            TableKey::LuaFn(r) => TValue::LuaFn(r),
            TableKey::NativeFn(r) => TValue::NativeFn(r),
            TableKey::Userdata(r) => TValue::Userdata(r),
            TableKey::Thread(r) => TValue::Thread(r),
        }
    }
}

/// Invalid key in a raw assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableError {
    NilIndex,
    NanIndex,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::NilIndex => write!(f, "table index is nil"),
            TableError::NanIndex => write!(f, "table index is NaN"),
        }
    }
}

impl std::error::Error for TableError {}

/// Weakness declared through the `__mode` metafield.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeakMode {
    Strong,
    /// Strong keys, weak values.
    WeakValues,
    /// Weak keys, strong values.
    Ephemeron,
    /// Weak keys and weak values.
    AllWeak,
}

impl WeakMode {
    /// Classify a `__mode` string: `k` makes keys weak, `v` values.
    pub fn from_mode(mode: &[u8]) -> WeakMode {
        let weak_keys = mode.contains(&b'k');
        let weak_values = mode.contains(&b'v');
        match (weak_keys, weak_values) {
            (false, false) => WeakMode::Strong,
            (false, true) => WeakMode::WeakValues,
            (true, false) => WeakMode::Ephemeron,
            (true, true) => WeakMode::AllWeak,
        }
    }
}

/// A Lua table: hybrid array + hash map.
pub struct Table {
    /// Array part (1-indexed: array[0] corresponds to key 1).
    array: Vec<TValue>,
    /// Hash part for non-sequential keys (insertion-order preserving).
    hash: IndexMap<TableKey, TValue>,
    /// Metatable (if any).
    pub metatable: Option<GcRef>,
}

impl Table {
    /// Create a new empty table with size hints.
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Raw get by TValue key. Absent keys read as nil.
    pub fn raw_get(&self, key: TValue) -> TValue {
        match TableKey::from_value(key) {
            Some(TableKey::Integer(i)) => self.raw_geti(i),
            Some(tk) => self.hash.get(&tk).copied().map(normalize).unwrap_or(TValue::Nil),
            None => TValue::Nil,
        }
    }

    /// Raw set by TValue key.
    pub fn raw_set(&mut self, key: TValue, value: TValue) -> Result<(), TableError> {
        let tk = match TableKey::from_value(key) {
            Some(tk) => tk,
            None if key.is_nil() => return Err(TableError::NilIndex),
            None => return Err(TableError::NanIndex),
        };
        if let TableKey::Integer(i) = tk {
            self.raw_seti(i, value);
            return Ok(());
        }
        if value.is_nil() {
            // Keep the slot if the key existed so an ongoing traversal can
            // still find it.
            if let Some(slot) = self.hash.get_mut(&tk) {
                *slot = TValue::Empty;
            }
        } else {
            self.hash.insert(tk, value);
        }
        Ok(())
    }

    /// Fast integer get (1-indexed).
    pub fn raw_geti(&self, key: i64) -> TValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            normalize(self.array[(key - 1) as usize])
        } else {
            self.hash
                .get(&TableKey::Integer(key))
                .copied()
                .map(normalize)
                .unwrap_or(TValue::Nil)
        }
    }

    /// Fast integer set (1-indexed).
    pub fn raw_seti(&mut self, key: i64, value: TValue) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                self.array[idx] = if value.is_nil() { TValue::Empty } else { value };
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                self.array.push(value);
                self.migrate_hash_to_array();
                return;
            }
        }
        if value.is_nil() {
            if let Some(slot) = self.hash.get_mut(&TableKey::Integer(key)) {
                *slot = TValue::Empty;
            }
        } else {
            self.hash.insert(TableKey::Integer(key), value);
        }
    }

    /// Border of the array part: the largest n with t[n] non-nil and
    /// t[n+1] nil.
    pub fn length(&self) -> i64 {
        match self.array.last() {
            None => return 0,
            Some(v) if !v.is_nil() => return self.array.len() as i64,
            _ => {}
        }
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// Move consecutive integer entries from hash into array.
    fn migrate_hash_to_array(&mut self) {
        loop {
            let next_idx = self.array.len() as i64 + 1;
            match self.hash.shift_remove(&TableKey::Integer(next_idx)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }

    // ---- Collector access ----

    /// Array part, including empty slots.
    pub fn array_values(&self) -> &[TValue] {
        &self.array
    }

    /// Live hash entries (empty slots skipped).
    pub fn hash_entries(&self) -> impl Iterator<Item = (TValue, TValue)> + '_ {
        self.hash
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.to_value(), *v))
    }

    /// All live entries, array part first.
    pub fn entries(&self) -> impl Iterator<Item = (TValue, TValue)> + '_ {
        self.array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (TValue::Int(i as i64 + 1), *v))
            .chain(self.hash_entries())
    }

    /// Number of entries in the hash part, empty slots included.
    pub fn hash_len(&self) -> usize {
        self.hash.len()
    }

    /// Empty every slot (array or hash) whose value satisfies `dead`.
    pub fn clear_values<F: FnMut(TValue) -> bool>(&mut self, mut dead: F) {
        for v in self.array.iter_mut() {
            if !v.is_nil() && dead(*v) {
                *v = TValue::Empty;
            }
        }
        for v in self.hash.values_mut() {
            if !v.is_nil() && dead(*v) {
                *v = TValue::Empty;
            }
        }
    }

    /// Empty every hash slot whose key satisfies `dead`.
    pub fn clear_keys<F: FnMut(TValue) -> bool>(&mut self, mut dead: F) {
        for (k, v) in self.hash.iter_mut() {
            if !v.is_nil() && dead(k.to_value()) {
                *v = TValue::Empty;
            }
        }
    }

    /// Drop empty hash slots whose key is collectable, so the key object
    /// is no longer referenced by the table.
    pub fn remove_dead_keys(&mut self) {
        self.hash
            .retain(|k, v| !(v.is_nil() && k.to_value().is_collectable()));
    }

    /// Units of collector work a traversal of this table costs.
    pub fn traverse_cost(&self) -> usize {
        1 + self.array.len() + 2 * self.hash.len()
    }

    /// Approximate heap footprint in bytes.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.array.capacity() * std::mem::size_of::<TValue>()
            + self.hash.capacity()
                * (std::mem::size_of::<TableKey>() + std::mem::size_of::<TValue>() + 8)
    }
}

#[inline]
fn normalize(v: TValue) -> TValue {
    if v.is_nil() {
        TValue::Nil
    } else {
        v
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
