use crate::Idx;
use std::ops::{Index, IndexMut};

/// Slot storage with a live bitmap and a LIFO free list
///
/// Removing an entry only marks its slot as free, so that indices stay valid until
/// `compact` is called
#[derive(Debug, Clone, Default)]
pub struct Arena<T> {
    slots: Vec<T>,
    live: Vec<bool>,
    free: Vec<Idx>,
}

impl<T> Arena<T> {
    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            slots: Vec::with_capacity(n),
            live: Vec::with_capacity(n),
            free: Vec::new(),
        }
    }

    /// Insert a value, reusing the most recently freed slot if any
    pub fn insert(&mut self, v: T) -> Idx {
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = v;
            self.live[i as usize] = true;
            i
        } else {
            self.slots.push(v);
            self.live.push(true);
            (self.slots.len() - 1) as Idx
        }
    }

    /// Mark a slot as free. Returns false if it was not live
    pub fn remove(&mut self, i: Idx) -> bool {
        if !self.contains(i) {
            return false;
        }
        self.live[i as usize] = false;
        self.free.push(i);
        true
    }

    #[must_use]
    pub fn contains(&self, i: Idx) -> bool {
        self.live.get(i as usize).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn get(&self, i: Idx) -> Option<&T> {
        if self.contains(i) {
            Some(&self.slots[i as usize])
        } else {
            None
        }
    }

    #[allow(dead_code)]
    pub fn get_mut(&mut self, i: Idx) -> Option<&mut T> {
        if self.contains(i) {
            Some(&mut self.slots[i as usize])
        } else {
            None
        }
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots, live or not
    #[must_use]
    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over the live entries and their indices
    pub fn iter(&self) -> impl Iterator<Item = (Idx, &T)> + '_ {
        self.slots
            .iter()
            .zip(self.live.iter())
            .enumerate()
            .filter(|(_, (_, l))| **l)
            .map(|(i, (v, _))| (i as Idx, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Idx, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .zip(self.live.iter())
            .enumerate()
            .filter(|(_, (_, l))| **l)
            .map(|(i, (v, _))| (i as Idx, v))
    }

    /// Indices of the live entries
    pub fn keys(&self) -> impl Iterator<Item = Idx> + '_ {
        self.live
            .iter()
            .enumerate()
            .filter(|(_, l)| **l)
            .map(|(i, _)| i as Idx)
    }

    /// Remove the free slots, keeping the order of the live entries, and return
    /// the old to new index map
    pub fn compact(&mut self) -> Vec<Option<Idx>> {
        let mut map = vec![None; self.slots.len()];
        let mut next = 0;
        for (i, l) in self.live.iter().enumerate() {
            if *l {
                map[i] = Some(next);
                next += 1;
            }
        }

        let mut i = 0;
        let live = std::mem::take(&mut self.live);
        self.slots.retain(|_| {
            let keep = live[i];
            i += 1;
            keep
        });
        self.live = vec![true; self.slots.len()];
        self.free.clear();

        map
    }
}

impl<T> Index<Idx> for Arena<T> {
    type Output = T;

    fn index(&self, i: Idx) -> &Self::Output {
        debug_assert!(self.contains(i), "slot {i} is not live");
        &self.slots[i as usize]
    }
}

impl<T> IndexMut<Idx> for Arena<T> {
    fn index_mut(&mut self, i: Idx) -> &mut Self::Output {
        debug_assert!(self.contains(i), "slot {i} is not live");
        &mut self.slots[i as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::Arena;

    #[test]
    fn test_reuse() {
        let mut a = Arena::default();
        let i0 = a.insert(10);
        let i1 = a.insert(11);
        let i2 = a.insert(12);
        assert_eq!((i0, i1, i2), (0, 1, 2));

        assert!(a.remove(i0));
        assert!(a.remove(i2));
        assert!(!a.remove(i2));
        assert_eq!(a.len(), 1);
        assert_eq!(a.n_slots(), 3);

        // LIFO
        assert_eq!(a.insert(13), 2);
        assert_eq!(a.insert(14), 0);
        assert_eq!(a.insert(15), 3);
        assert_eq!(a.get(0), Some(&14));
    }

    #[test]
    fn test_compact() {
        let mut a = Arena::default();
        for i in 0..6 {
            a.insert(i);
        }
        a.remove(1);
        a.remove(4);

        let map = a.compact();
        assert_eq!(map, vec![Some(0), None, Some(1), Some(2), None, Some(3)]);
        assert_eq!(a.len(), 4);
        assert_eq!(a.n_slots(), 4);
        let vals = a.iter().map(|(_, v)| *v).collect::<Vec<_>>();
        assert_eq!(vals, vec![0, 2, 3, 5]);
        assert_eq!(a.insert(7), 4);
    }
}
