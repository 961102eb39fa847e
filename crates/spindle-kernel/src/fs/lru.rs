//! Recency list over buffer slots, linked by index instead of by pointer.

/// Index of a buffer slot in the cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufId(pub usize);

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<BufId>,
    next: Option<BufId>,
    linked: bool,
}

/// Doubly linked list of slots, oldest at the front. Every membership change
/// is O(1).
#[derive(Debug, Default)]
pub struct LruList {
    links: Vec<Link>,
    head: Option<BufId>,
    tail: Option<BufId>,
    len: usize,
}

impl LruList {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, id: BufId) -> bool {
        self.links.get(id.0).is_some_and(|l| l.linked)
    }

    fn link_mut(&mut self, id: BufId) -> &mut Link {
        if id.0 >= self.links.len() {
            self.links.resize(id.0 + 1, Link::default());
        }
        &mut self.links[id.0]
    }

    pub fn push_back(&mut self, id: BufId) {
        self.remove(id);
        let tail = self.tail;
        *self.link_mut(id) = Link {
            prev: tail,
            next: None,
            linked: true,
        };
        match tail {
            Some(t) => self.links[t.0].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn push_front(&mut self, id: BufId) {
        self.remove(id);
        let head = self.head;
        *self.link_mut(id) = Link {
            prev: None,
            next: head,
            linked: true,
        };
        match head {
            Some(h) => self.links[h.0].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    pub fn remove(&mut self, id: BufId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let Link { prev, next, .. } = self.links[id.0];

        match prev {
            Some(p) => self.links[p.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n.0].prev = prev,
            None => self.tail = prev,
        }

        self.links[id.0] = Link::default();
        self.len -= 1;
        true
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = BufId> + '_ {
        std::iter::successors(self.head, move |id| self.links[id.0].next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &LruList) -> Vec<usize> {
        list.iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_push_back_keeps_insertion_order() {
        let mut lru = LruList::default();
        for i in [3, 0, 7] {
            lru.push_back(BufId(i));
        }
        assert_eq!(ids(&lru), vec![3, 0, 7]);
        assert!(lru.remove(BufId(3)));
        assert_eq!(ids(&lru), vec![0, 7]);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_remove_from_middle_and_ends() {
        let mut lru = LruList::default();
        for i in 0..5 {
            lru.push_back(BufId(i));
        }
        assert!(lru.remove(BufId(2)));
        assert!(!lru.remove(BufId(2)));
        assert!(lru.remove(BufId(0)));
        assert!(lru.remove(BufId(4)));
        assert_eq!(ids(&lru), vec![1, 3]);
        assert!(!lru.contains(BufId(4)));
    }

    #[test]
    fn test_reinsert_moves_to_back() {
        let mut lru = LruList::default();
        for i in 0..3 {
            lru.push_back(BufId(i));
        }
        lru.push_back(BufId(0));
        assert_eq!(ids(&lru), vec![1, 2, 0]);
        lru.push_front(BufId(2));
        assert_eq!(ids(&lru), vec![2, 1, 0]);
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn test_drain_to_empty() {
        let mut lru = LruList::default();
        lru.push_back(BufId(1));
        assert!(lru.remove(BufId(1)));
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.iter().count(), 0);
        lru.push_front(BufId(1));
        assert_eq!(ids(&lru), vec![1]);
    }
}
