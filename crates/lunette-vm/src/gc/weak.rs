//! Clearing weak tables after marking.

use super::mark::Weak;
use crate::state::Vm;
use lunette_core::object::GcRef;
use lunette_core::value::TValue;
use std::collections::HashSet;

impl Vm {
    /// Whether a weak reference to `v` must be dropped. Strings are values,
    /// never weak: they get marked instead.
    pub(crate) fn is_cleared(&mut self, v: TValue) -> bool {
        match v {
            TValue::Str(r) => {
                self.mark_object(r);
                false
            }
            _ => v.gc_ref().is_some_and(|r| self.is_white(r)),
        }
    }

    fn weak_list(&self, which: Weak) -> &[GcRef] {
        match which {
            Weak::Values => &self.gc.weak,
            Weak::Ephemeron => &self.gc.ephemeron,
            Weak::All => &self.gc.allweak,
        }
    }

    /// Objects among `values` that a weak reference no longer keeps.
    fn cleared_set(&mut self, values: impl IntoIterator<Item = TValue>) -> HashSet<GcRef> {
        let mut dead = HashSet::new();
        for v in values {
            if self.is_cleared(v) {
                if let Some(r) = v.gc_ref() {
                    dead.insert(r);
                }
            }
        }
        dead
    }

    /// Empty the entries with unmarked values in the tables of `which`,
    /// starting at position `from` of the list.
    pub(crate) fn clear_by_values(&mut self, which: Weak, from: usize) {
        let tables: Vec<GcRef> = self.weak_list(which)[from..].to_vec();
        for t in tables {
            let tbl = self.heap.get_table(t);
            let values: Vec<TValue> = tbl
                .array_values()
                .iter()
                .copied()
                .chain(tbl.hash_entries().map(|(_, v)| v))
                .collect();
            let dead = self.cleared_set(values);
            let tbl = self.heap.get_table_mut(t);
            if !dead.is_empty() {
                tbl.clear_values(|v| v.gc_ref().is_some_and(|r| dead.contains(&r)));
            }
            tbl.remove_dead_keys();
        }
    }

    /// Empty the entries with unmarked keys in the tables of `which`.
    pub(crate) fn clear_by_keys(&mut self, which: Weak) {
        let tables: Vec<GcRef> = self.weak_list(which).to_vec();
        for t in tables {
            let keys: Vec<TValue> = self.heap.get_table(t).hash_entries().map(|(k, _)| k).collect();
            let dead = self.cleared_set(keys);
            let tbl = self.heap.get_table_mut(t);
            if !dead.is_empty() {
                tbl.clear_keys(|k| k.gc_ref().is_some_and(|r| dead.contains(&r)));
            }
            tbl.remove_dead_keys();
        }
    }
}
