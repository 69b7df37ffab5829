//! Index-linked descriptor chains
//!
//! Links are `Option<WorkerId>` entries in tables owned by the chain and
//! indexed by descriptor id, so a chain and its links live under one lock.
//! Tables grow on demand as the arena grows.

use icl_core::WorkerId;

#[inline]
fn grow<T: Clone>(table: &mut Vec<T>, id: WorkerId, fill: T) {
    let need = id.as_usize() + 1;
    if table.len() < need {
        table.resize(need, fill);
    }
}

/// LIFO singly linked chain (free and reuse chains)
#[derive(Debug, Default)]
pub struct SinglyLinked {
    head: Option<WorkerId>,
    count: usize,
    next: Vec<Option<WorkerId>>,
    linked: Vec<bool>,
}

impl SinglyLinked {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn head(&self) -> Option<WorkerId> {
        self.head
    }

    #[inline]
    pub fn contains(&self, id: WorkerId) -> bool {
        self.linked.get(id.as_usize()).copied().unwrap_or(false)
    }

    /// Push at head. Returns false if already linked.
    pub fn push(&mut self, id: WorkerId) -> bool {
        if self.contains(id) {
            return false;
        }
        grow(&mut self.next, id, None);
        grow(&mut self.linked, id, false);
        self.next[id.as_usize()] = self.head;
        self.linked[id.as_usize()] = true;
        self.head = Some(id);
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<WorkerId> {
        let id = self.head?;
        let i = id.as_usize();
        self.head = self.next.get(i).copied().flatten();
        if let Some(slot) = self.next.get_mut(i) {
            *slot = None;
        }
        if let Some(flag) = self.linked.get_mut(i) {
            *flag = false;
        }
        self.count = self.count.saturating_sub(1);
        Some(id)
    }

    /// Unlink a specific member (walks from the head)
    pub fn remove(&mut self, id: WorkerId) -> bool {
        if !self.contains(id) {
            return false;
        }
        if self.head == Some(id) {
            self.pop();
            return true;
        }
        let mut prev = self.head;
        while let Some(p) = prev {
            let after = self.next.get(p.as_usize()).copied().flatten();
            if after == Some(id) {
                self.next[p.as_usize()] = self.next.get(id.as_usize()).copied().flatten();
                self.next[id.as_usize()] = None;
                self.linked[id.as_usize()] = false;
                self.count = self.count.saturating_sub(1);
                return true;
            }
            prev = after;
        }
        false
    }

    /// Members from head to tail. Stops after `limit` steps.
    pub fn walk(&self, limit: usize) -> Vec<WorkerId> {
        let mut out = Vec::with_capacity(self.count.min(limit));
        let mut cur = self.head;
        while let Some(id) = cur {
            if out.len() >= limit {
                break;
            }
            out.push(id);
            cur = self.next.get(id.as_usize()).copied().flatten();
        }
        out
    }

    /// Link-table consistency: count, membership flags, no cycles
    pub fn check(&self, limit: usize) -> Result<Vec<WorkerId>, String> {
        let members = self.walk(limit.saturating_add(1));
        if members.len() > limit {
            return Err(format!("walk exceeded {} steps (cycle?)", limit));
        }
        if members.len() != self.count {
            return Err(format!("count {} but walk found {}", self.count, members.len()));
        }
        for id in &members {
            if !self.contains(*id) {
                return Err(format!("{} reachable but not flagged linked", id));
            }
        }
        let flagged = self.linked.iter().filter(|f| **f).count();
        if flagged != self.count {
            return Err(format!("{} flagged linked but count is {}", flagged, self.count));
        }
        Ok(members)
    }
}

/// Doubly linked chain with O(1) removal (assigned chain)
#[derive(Debug, Default)]
pub struct DoublyLinked {
    head: Option<WorkerId>,
    count: usize,
    next: Vec<Option<WorkerId>>,
    prev: Vec<Option<WorkerId>>,
    linked: Vec<bool>,
}

impl DoublyLinked {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn contains(&self, id: WorkerId) -> bool {
        self.linked.get(id.as_usize()).copied().unwrap_or(false)
    }

    pub fn push_front(&mut self, id: WorkerId) -> bool {
        if self.contains(id) {
            return false;
        }
        grow(&mut self.next, id, None);
        grow(&mut self.prev, id, None);
        grow(&mut self.linked, id, false);
        let i = id.as_usize();
        self.next[i] = self.head;
        self.prev[i] = None;
        if let Some(h) = self.head {
            self.prev[h.as_usize()] = Some(id);
        }
        self.linked[i] = true;
        self.head = Some(id);
        self.count += 1;
        true
    }

    pub fn remove(&mut self, id: WorkerId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let i = id.as_usize();
        let (p, n) = (self.prev[i], self.next[i]);
        match p {
            Some(p) => self.next[p.as_usize()] = n,
            None => self.head = n,
        }
        if let Some(n) = n {
            self.prev[n.as_usize()] = p;
        }
        self.next[i] = None;
        self.prev[i] = None;
        self.linked[i] = false;
        self.count = self.count.saturating_sub(1);
        true
    }

    pub fn walk(&self, limit: usize) -> Vec<WorkerId> {
        let mut out = Vec::with_capacity(self.count.min(limit));
        let mut cur = self.head;
        while let Some(id) = cur {
            if out.len() >= limit {
                break;
            }
            out.push(id);
            cur = self.next.get(id.as_usize()).copied().flatten();
        }
        out
    }

    /// Same as `SinglyLinked::check`, plus back-link symmetry
    pub fn check(&self, limit: usize) -> Result<Vec<WorkerId>, String> {
        let members = self.walk(limit.saturating_add(1));
        if members.len() > limit {
            return Err(format!("walk exceeded {} steps (cycle?)", limit));
        }
        if members.len() != self.count {
            return Err(format!("count {} but walk found {}", self.count, members.len()));
        }
        let mut expect_prev = None;
        for id in &members {
            if !self.contains(*id) {
                return Err(format!("{} reachable but not flagged linked", id));
            }
            let prev = self.prev.get(id.as_usize()).copied().flatten();
            if prev != expect_prev {
                return Err(format!("{} has prev {:?}, expected {:?}", id, prev, expect_prev));
            }
            expect_prev = Some(*id);
        }
        let flagged = self.linked.iter().filter(|f| **f).count();
        if flagged != self.count {
            return Err(format!("{} flagged linked but count is {}", flagged, self.count));
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(n: u32) -> WorkerId {
        WorkerId::new(n)
    }

    #[test]
    fn test_singly_lifo() {
        let mut c = SinglyLinked::new();
        assert!(c.push(w(3)));
        assert!(c.push(w(1)));
        assert!(!c.push(w(3)));
        assert_eq!(c.len(), 2);
        assert_eq!(c.pop(), Some(w(1)));
        assert_eq!(c.pop(), Some(w(3)));
        assert_eq!(c.pop(), None);
        assert!(c.check(16).unwrap().is_empty());
    }

    #[test]
    fn test_singly_remove_middle() {
        let mut c = SinglyLinked::new();
        for n in 0..5 {
            c.push(w(n));
        }
        assert!(c.remove(w(2)));
        assert!(!c.remove(w(2)));
        assert!(c.remove(w(4)));
        assert!(c.remove(w(0)));
        assert_eq!(c.check(16).unwrap(), vec![w(3), w(1)]);
    }

    #[test]
    fn test_doubly_remove() {
        let mut c = DoublyLinked::new();
        for n in 0..4 {
            c.push_front(w(n));
        }
        assert_eq!(c.walk(16), vec![w(3), w(2), w(1), w(0)]);
        assert!(c.remove(w(2)));
        assert!(c.remove(w(3)));
        assert!(c.remove(w(0)));
        assert_eq!(c.check(16).unwrap(), vec![w(1)]);
        assert!(c.remove(w(1)));
        assert!(c.is_empty());
        assert!(c.check(16).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let mut c = SinglyLinked::new();
        c.push(w(0));
        c.push(w(1));
        c.next[0] = Some(w(1));
        assert!(c.check(8).is_err());
    }
}
