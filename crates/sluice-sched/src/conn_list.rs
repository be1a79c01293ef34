//! Active/idle connection lists for the download pool.
//!
//! Two doubly-linked lists threaded through one arena. Nodes are addressed
//! by `NodeId`; unlink, move-to-head and move-to-tail are O(1). The lists
//! are owned by a single thread, so there is no locking here.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Active,
    Idle,
}

impl Segment {
    fn slot(self) -> usize {
        match self {
            Segment::Active => 0,
            Segment::Idle => 1,
        }
    }
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    segment: Segment,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
pub struct SegmentedList<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    ends: [Ends; 2],
}

impl<T> Default for SegmentedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SegmentedList<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            ends: [Ends::default(); 2],
        }
    }

    pub fn len(&self, segment: Segment) -> usize {
        self.ends[segment.slot()].len
    }

    pub fn is_empty(&self) -> bool {
        self.ends.iter().all(|e| e.len == 0)
    }

    pub fn head(&self, segment: Segment) -> Option<NodeId> {
        self.ends[segment.slot()].head.map(NodeId)
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id.0).and_then(|n| n.next).map(NodeId)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id.0).map(|n| &n.value)
    }

    pub fn segment_of(&self, id: NodeId) -> Option<Segment> {
        self.node(id.0).map(|n| n.segment)
    }

    pub fn push_head(&mut self, segment: Segment, value: T) -> NodeId {
        let idx = self.alloc(value, segment);
        self.link_head(idx, segment);
        NodeId(idx)
    }

    pub fn push_tail(&mut self, segment: Segment, value: T) -> NodeId {
        let idx = self.alloc(value, segment);
        self.link_tail(idx, segment);
        NodeId(idx)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if self.node(id.0).is_none() {
            return None;
        }
        self.unlink(id.0);
        let node = self.nodes.get_mut(id.0).and_then(Option::take)?;
        self.free.push(id.0);
        Some(node.value)
    }

    pub fn move_to_head(&mut self, id: NodeId, segment: Segment) {
        if self.node(id.0).is_some() {
            self.unlink(id.0);
            self.link_head(id.0, segment);
        }
    }

    pub fn move_to_tail(&mut self, id: NodeId, segment: Segment) {
        if self.node(id.0).is_some() {
            self.unlink(id.0);
            self.link_tail(id.0, segment);
        }
    }

    /// Values of one segment, head to tail.
    pub fn iter(&self, segment: Segment) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.ends[segment.slot()].head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = self.node(idx)?;
            cursor = node.next;
            Some(&node.value)
        })
    }

    fn node(&self, idx: usize) -> Option<&Node<T>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<T>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn alloc(&mut self, value: T, segment: Segment) -> usize {
        let node = Node {
            value,
            segment,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Some(node) = self.node(idx) else { return };
        let (prev, next, slot) = (node.prev, node.next, node.segment.slot());
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.ends[slot].head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.ends[slot].tail = prev,
        }
        self.ends[slot].len -= 1;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_head(&mut self, idx: usize, segment: Segment) {
        let slot = segment.slot();
        let old_head = self.ends[slot].head;
        if let Some(node) = self.node_mut(idx) {
            node.segment = segment;
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(n) = self.node_mut(h) {
                    n.prev = Some(idx);
                }
            }
            None => self.ends[slot].tail = Some(idx),
        }
        self.ends[slot].head = Some(idx);
        self.ends[slot].len += 1;
    }

    fn link_tail(&mut self, idx: usize, segment: Segment) {
        let slot = segment.slot();
        let old_tail = self.ends[slot].tail;
        if let Some(node) = self.node_mut(idx) {
            node.segment = segment;
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(n) = self.node_mut(t) {
                    n.next = Some(idx);
                }
            }
            None => self.ends[slot].head = Some(idx),
        }
        self.ends[slot].tail = Some(idx);
        self.ends[slot].len += 1;
    }
}
