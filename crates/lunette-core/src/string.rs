//! Interned Lua strings.
//!
//! Every string is interned: equal contents always share one heap object,
//! so string equality is handle equality. The table maps contents to the
//! handle of the owning heap object; the collector removes entries when it
//! frees the object.

use crate::object::GcRef;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A Lua string with its precomputed hash.
#[derive(Clone)]
pub struct LuaString {
    data: Rc<[u8]>,
    hash: u32,
}

impl LuaString {
    pub fn new(data: Rc<[u8]>, seed: u32) -> Self {
        let hash = lua_hash(&data, seed);
        LuaString { data, hash }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn shared(&self) -> Rc<[u8]> {
        Rc::clone(&self.data)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Lossy UTF-8 view, for messages.
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.data) {
            Ok(s) => write!(f, "\"{s}\""),
            Err(_) => write!(f, "<binary string len={}>", self.data.len()),
        }
    }
}

/// Seeded string hash (luaS_hash).
pub fn lua_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (bytes.len() as u32);
    for &b in bytes.iter().rev() {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(b as u32);
    }
    h
}

/// Contents -> heap handle map for interned strings.
#[derive(Debug, Default)]
pub struct StringTable {
    map: HashMap<Rc<[u8]>, GcRef>,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            map: HashMap::new(),
        }
    }

    #[inline]
    pub fn lookup(&self, bytes: &[u8]) -> Option<GcRef> {
        self.map.get(bytes).copied()
    }

    pub fn insert(&mut self, data: Rc<[u8]>, r: GcRef) {
        self.map.insert(data, r);
    }

    /// Drop the entry for a freed string. Only removes it if it still
    /// points to `r`.
    pub fn remove(&mut self, bytes: &[u8], r: GcRef) {
        if self.map.get(bytes) == Some(&r) {
            self.map.remove(bytes);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Release spare capacity when the table is mostly empty.
    pub fn check_size(&mut self) {
        if self.map.len() < self.map.capacity() / 4 {
            self.map.shrink_to(self.map.len() * 2);
        }
    }
}
