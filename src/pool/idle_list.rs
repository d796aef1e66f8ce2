//! Doubly linked list of idle connections.
//!
//! Nodes live in a slot vector and link to each other by index, which gives
//! O(1) push/pop at both ends and O(1) unlinking from the middle (needed when
//! the health sweep finds a bad connection that is not at the head). Freed
//! slots are recycled.
//!
//! A [`NodeId`] carries the generation of the node it was issued for, so a
//! stale id whose slot has since been reused unlinks nothing.

/// Handle to a linked node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    idx: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct IdleList<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    next_generation: u64,
}

impl<T> Default for IdleList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdleList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, value: T, prev: Option<usize>, next: Option<usize>) -> NodeId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let node = Node {
            value,
            generation,
            prev,
            next,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        NodeId { idx, generation }
    }

    fn node(&self, idx: usize) -> Option<&Node<T>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn set_prev(&mut self, idx: usize, prev: Option<usize>) {
        let node = self.slots.get_mut(idx).and_then(Option::as_mut);
        debug_assert!(node.is_some(), "linked index {idx} points at a vacant slot");
        if let Some(node) = node {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, idx: usize, next: Option<usize>) {
        let node = self.slots.get_mut(idx).and_then(Option::as_mut);
        debug_assert!(node.is_some(), "linked index {idx} points at a vacant slot");
        if let Some(node) = node {
            node.next = next;
        }
    }

    pub fn push_front(&mut self, value: T) -> NodeId {
        let old_head = self.head;
        let id = self.alloc(value, None, old_head);
        match old_head {
            Some(h) => self.set_prev(h, Some(id.idx)),
            None => self.tail = Some(id.idx),
        }
        self.head = Some(id.idx);
        self.len += 1;
        id
    }

    pub fn push_back(&mut self, value: T) -> NodeId {
        let old_tail = self.tail;
        let id = self.alloc(value, old_tail, None);
        match old_tail {
            Some(t) => self.set_next(t, Some(id.idx)),
            None => self.head = Some(id.idx),
        }
        self.tail = Some(id.idx);
        self.len += 1;
        id
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        self.unlink(head)
    }

    pub fn pop_back(&mut self) -> Option<T> {
        let tail = self.tail?;
        self.unlink(tail)
    }

    /// Unlink a node from anywhere in the list. Ids of nodes that were
    /// already removed return `None`, even if their slot was reused.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let linked = self.get(id).is_some();
        if linked {
            self.unlink(id.idx)
        } else {
            None
        }
    }

    /// The value behind `id`, if that node is still linked
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id.idx)
            .filter(|node| node.generation == id.generation)
            .map(|node| &node.value)
    }

    fn unlink(&mut self, idx: usize) -> Option<T> {
        let node = self.slots.get_mut(idx)?.take()?;

        match node.prev {
            Some(p) => self.set_next(p, node.next),
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.set_prev(n, node.prev),
            None => self.tail = node.prev,
        }

        self.free.push(idx);
        self.len -= 1;
        Some(node.value)
    }

    pub fn front(&self) -> Option<&T> {
        self.head.and_then(|h| self.node(h)).map(|node| &node.value)
    }

    pub fn back(&self) -> Option<&T> {
        self.tail.and_then(|t| self.node(t)).map(|node| &node.value)
    }

    /// Iterate head to tail
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Unlink every node, head first
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(value) = self.pop_front() {
            out.push(value);
        }
        self.slots.clear();
        self.free.clear();
        out
    }
}

pub struct Iter<'a, T> {
    list: &'a IdleList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.list.node(idx)?;
        self.cursor = node.next;
        Some((
            NodeId {
                idx,
                generation: node.generation,
            },
            &node.value,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &IdleList<u32>) -> Vec<u32> {
        list.iter().map(|(_, v)| *v).collect()
    }

    fn assert_links(list: &IdleList<u32>) {
        if let Some(h) = list.head {
            assert!(list.node(h).unwrap().prev.is_none());
        }
        if let Some(t) = list.tail {
            assert!(list.node(t).unwrap().next.is_none());
        }
        assert_eq!(list.iter().count(), list.len());
    }

    #[test]
    fn test_stack_discipline() {
        let mut list = IdleList::new();
        list.push_front(1);
        list.push_front(2);
        list.push_front(3);
        assert_eq!(collect(&list), vec![3, 2, 1]);
        assert_eq!(list.pop_front(), Some(3));
        assert_eq!(list.pop_front(), Some(2));
        assert_links(&list);
    }

    #[test]
    fn test_queue_discipline() {
        let mut list = IdleList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.front(), Some(&3));
        assert_eq!(list.back(), Some(&3));
        assert_links(&list);
    }

    #[test]
    fn test_remove_from_middle() {
        let mut list = IdleList::new();
        list.push_back(1);
        let mid = list.push_back(2);
        list.push_back(3);

        assert_eq!(list.remove(mid), Some(2));
        assert_eq!(list.remove(mid), None);
        assert_eq!(collect(&list), vec![1, 3]);
        assert_eq!(list.len(), 2);
        assert_links(&list);
    }

    #[test]
    fn test_remove_ends() {
        let mut list = IdleList::new();
        let first = list.push_back(1);
        list.push_back(2);
        let last = list.push_back(3);

        assert_eq!(list.remove(first), Some(1));
        assert_eq!(list.remove(last), Some(3));
        assert_eq!(collect(&list), vec![2]);
        assert_links(&list);

        assert_eq!(list.pop_back(), Some(2));
        assert!(list.is_empty());
        assert!(list.front().is_none());
        assert!(list.back().is_none());
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut list = IdleList::new();
        for i in 0..4 {
            list.push_back(i);
        }
        list.pop_front();
        list.pop_front();
        list.push_front(10);
        list.push_back(11);
        assert_eq!(list.slots.len(), 4);
        assert_eq!(collect(&list), vec![10, 2, 3, 11]);
        assert_links(&list);
    }

    #[test]
    fn test_stale_id_does_not_remove_reused_slot() {
        let mut list = IdleList::new();
        let stale = list.push_back(1);
        assert_eq!(list.pop_front(), Some(1));

        let fresh = list.push_back(2);
        assert_eq!(list.slots.len(), 1);
        assert_eq!(list.get(stale), None);
        assert_eq!(list.remove(stale), None);
        assert_eq!(list.get(fresh), Some(&2));
        assert_eq!(list.len(), 1);
        assert_eq!(list.remove(fresh), Some(2));
    }

    #[test]
    fn test_drain() {
        let mut list = IdleList::new();
        list.push_front(1);
        list.push_front(2);
        assert_eq!(list.drain(), vec![2, 1]);
        assert!(list.is_empty());
        assert!(list.pop_back().is_none());
    }
}
