//! Interface method table: a fixed-size hash table from interface method to
//! implementation, with copy-on-grow conflict tables for colliding slots.

use std::sync::{Arc, RwLock};

use crate::utf;

use super::class::MethodRef;

/// Number of imtable slots per class.
pub const IMT_SIZE: usize = 43;

#[derive(Clone, Default)]
pub enum ImtSlot {
    #[default]
    Vacant,
    Single {
        interface_method: MethodRef,
        implementation: MethodRef,
    },
    Conflict(Arc<ConflictTable>),
}

/// A `(interface method, implementation)` pair list terminated by a pair
/// with no interface method. Lookup is a linear scan stopped by the
/// sentinel.
pub struct ConflictTable {
    entries: Vec<ConflictEntry>,
}

#[derive(Clone, Copy)]
pub struct ConflictEntry {
    pub interface_method: Option<MethodRef>,
    pub implementation: Option<MethodRef>,
}

impl ConflictTable {
    fn from_pairs(pairs: &[(MethodRef, MethodRef)]) -> Self {
        let mut entries: Vec<ConflictEntry> = pairs
            .iter()
            .map(|(interface_method, implementation)| ConflictEntry {
                interface_method: Some(*interface_method),
                implementation: Some(*implementation),
            })
            .collect();
        entries.push(ConflictEntry {
            interface_method: None,
            implementation: None,
        });
        Self { entries }
    }

    pub fn lookup(&self, interface_method: MethodRef) -> Option<MethodRef> {
        for entry in &self.entries {
            let candidate = entry.interface_method?;
            if candidate == interface_method {
                return entry.implementation;
            }
        }
        None
    }

    /// Number of real pairs, not counting the sentinel.
    pub fn count(&self) -> usize {
        self.entries
            .iter()
            .take_while(|e| e.interface_method.is_some())
            .count()
    }

    /// Copy-on-grow: a new table with all prior pairs, the new pair, and a
    /// fresh sentinel. The old table stays valid for concurrent readers
    /// until the slot that references it is republished.
    fn grown(&self, interface_method: MethodRef, implementation: MethodRef) -> Self {
        let mut pairs: Vec<(MethodRef, MethodRef)> = self
            .entries
            .iter()
            .filter_map(|e| Some((e.interface_method?, e.implementation?)))
            .collect();
        pairs.push((interface_method, implementation));
        Self::from_pairs(&pairs)
    }
}

/// Fixed-size dispatch table. Slots are write-once except for conflict
/// table replacement, which swaps in a fully built table under the slot
/// lock; the lock's release/acquire ordering is what publishes the new
/// table to concurrent readers.
pub struct ImTable {
    slots: Vec<RwLock<ImtSlot>>,
}

impl Default for ImTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ImTable {
    pub fn new() -> Self {
        Self {
            slots: (0..IMT_SIZE).map(|_| RwLock::new(ImtSlot::Vacant)).collect(),
        }
    }

    /// The slot an interface method hashes to.
    pub fn imt_index(name: &str, signature: &str) -> usize {
        let hash = utf::str_hash(name)
            .wrapping_mul(31)
            .wrapping_add(utf::str_hash(signature));
        (hash as usize) % IMT_SIZE
    }

    pub fn get(&self, index: usize) -> ImtSlot {
        self.slots[index].read().unwrap().clone()
    }

    /// Places an implementation, converting the slot to a conflict table
    /// when a second, different interface method lands on it.
    pub fn install(&self, index: usize, interface_method: MethodRef, implementation: MethodRef) {
        let mut slot = self.slots[index].write().unwrap();
        let next = match &*slot {
            ImtSlot::Vacant => ImtSlot::Single {
                interface_method,
                implementation,
            },
            ImtSlot::Single {
                interface_method: existing,
                implementation: existing_impl,
            } => {
                if *existing == interface_method {
                    // a more derived implementation replaces the old one
                    ImtSlot::Single {
                        interface_method,
                        implementation,
                    }
                } else {
                    ImtSlot::Conflict(Arc::new(ConflictTable::from_pairs(&[
                        (*existing, *existing_impl),
                        (interface_method, implementation),
                    ])))
                }
            }
            ImtSlot::Conflict(table) => match table.lookup(interface_method) {
                Some(found) if found == implementation => return,
                _ => ImtSlot::Conflict(Arc::new(table.grown(interface_method, implementation))),
            },
        };
        *slot = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::class::ClassId;

    fn mref(class: u32, index: u16) -> MethodRef {
        MethodRef {
            class: ClassId(class),
            index,
        }
    }

    #[test]
    fn test_single_then_conflict() {
        let imt = ImTable::new();
        imt.install(3, mref(1, 0), mref(9, 0));
        match imt.get(3) {
            ImtSlot::Single { implementation, .. } => assert_eq!(implementation, mref(9, 0)),
            _ => panic!("expected single entry"),
        }

        // a different interface method on the same slot forces a conflict
        // table holding both pairs
        imt.install(3, mref(2, 4), mref(9, 1));
        match imt.get(3) {
            ImtSlot::Conflict(table) => {
                assert_eq!(table.count(), 2);
                assert_eq!(table.lookup(mref(1, 0)), Some(mref(9, 0)));
                assert_eq!(table.lookup(mref(2, 4)), Some(mref(9, 1)));
                assert_eq!(table.lookup(mref(7, 7)), None);
            }
            _ => panic!("expected conflict table"),
        }
    }

    #[test]
    fn test_conflict_table_grows_by_one() {
        let imt = ImTable::new();
        imt.install(0, mref(1, 0), mref(9, 0));
        imt.install(0, mref(2, 0), mref(9, 1));
        imt.install(0, mref(3, 0), mref(9, 2));
        match imt.get(0) {
            ImtSlot::Conflict(table) => {
                assert_eq!(table.count(), 3);
                assert_eq!(table.lookup(mref(3, 0)), Some(mref(9, 2)));
            }
            _ => panic!("expected conflict table"),
        }
    }

    #[test]
    fn test_same_interface_method_updates_in_place() {
        let imt = ImTable::new();
        imt.install(5, mref(1, 0), mref(9, 0));
        imt.install(5, mref(1, 0), mref(10, 0));
        match imt.get(5) {
            ImtSlot::Single { implementation, .. } => assert_eq!(implementation, mref(10, 0)),
            _ => panic!("expected single entry"),
        }
    }

    #[test]
    fn test_imt_index_is_stable() {
        let a = ImTable::imt_index("run", "()V");
        let b = ImTable::imt_index("run", "()V");
        assert_eq!(a, b);
        assert!(a < IMT_SIZE);
    }
}
