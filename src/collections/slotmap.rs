/// Handle into a [`SlotMap`]. A key stops resolving once its slot is released,
/// even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}
impl Key {
    pub fn index(self) -> usize {
        self.index as usize
    }
}
impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    // free slots hold the next free index
    value: Result<T, u32>,
}

#[derive(Debug)]
pub struct SlotMap<T> {
    head: u32,
    entries: Vec<Slot<T>>,
    len: usize,
}
impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self {
            head: u32::MAX,
            entries: vec![],
            len: 0,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn get(&mut self, key: Key) -> Option<&mut T> {
        self.entries
            .get_mut(key.index())
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut().ok())
    }
    /// The live key at `index`, if any. Poll events only carry the index.
    pub fn key_at(&self, index: usize) -> Option<Key> {
        let slot = self.entries.get(index)?;
        slot.value.is_ok().then_some(Key {
            index: index as u32,
            generation: slot.generation,
        })
    }
    pub fn insert(&mut self, value: T) -> Key {
        self.len += 1;
        if self.head == u32::MAX {
            let index = self.entries.len() as u32;
            self.entries.push(Slot {
                generation: 0,
                value: Ok(value),
            });
            return Key { index, generation: 0 };
        }
        let index = self.head;
        let slot = &mut self.entries[index as usize];
        self.head = match std::mem::replace(&mut slot.value, Ok(value)) {
            Err(next) => next,
            // the free list only ever points at free slots
            Ok(_) => unreachable!("corrupted slotmap"),
        };
        Key {
            index,
            generation: slot.generation,
        }
    }
    pub fn release(&mut self, key: Key) -> Option<T> {
        let slot = self.entries.get_mut(key.index())?;
        if slot.generation != key.generation || slot.value.is_err() {
            return None;
        }
        let value = std::mem::replace(&mut slot.value, Err(self.head)).ok();
        slot.generation = slot.generation.wrapping_add(1);
        self.head = key.index;
        self.len -= 1;
        value
    }
    pub fn keys(&self) -> Vec<Key> {
        (0..self.entries.len()).filter_map(|i| self.key_at(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_keys_do_not_resolve_after_reuse() {
        let mut map = SlotMap::new();
        let a = map.insert("a");
        let b = map.insert("b");
        assert_eq!(map.release(a), Some("a"));
        assert_eq!(map.release(a), None);
        let c = map.insert("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(map.get(a), None);
        assert_eq!(map.get(c).copied(), Some("c"));
        assert_eq!(map.key_at(a.index()), Some(c));
        assert_eq!(map.len(), 2);
        assert_eq!(map.keys(), vec![c, b]);
    }

    #[test]
    fn free_list_reuses_most_recent_first() {
        let mut map = SlotMap::new();
        let keys: Vec<_> = (0..4).map(|i| map.insert(i)).collect();
        map.release(keys[1]);
        map.release(keys[3]);
        assert_eq!(map.insert(10).index(), 3);
        assert_eq!(map.insert(11).index(), 1);
        assert_eq!(map.insert(12).index(), 4);
        assert!(map.key_at(99).is_none());
    }
}
