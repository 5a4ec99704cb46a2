//! Intrusive doubly-linked task list over a slab
//!
//! Each task records its slot index, so unlinking is O(1) and needs no
//! search. Slots are recycled through a free stack.

use crate::task::{CompileTask, NO_SLOT};
use std::sync::Arc;

struct Node {
    task: Option<Arc<CompileTask>>,
    prev: usize,
    next: usize,
}

pub(crate) struct TaskList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl TaskList {
    pub(crate) fn new() -> Self {
        TaskList {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NO_SLOT,
            tail: NO_SLOT,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot of the oldest task
    pub(crate) fn head(&self) -> Option<usize> {
        (self.head != NO_SLOT).then_some(self.head)
    }

    /// Append at the tail; returns the slot
    pub(crate) fn push_back(&mut self, task: Arc<CompileTask>) -> usize {
        assert_eq!(
            task.queue_slot(),
            NO_SLOT,
            "compile task {} is already on a queue",
            task.compile_id()
        );
        let node = Node {
            task: Some(task.clone()),
            prev: self.tail,
            next: NO_SLOT,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        if self.tail == NO_SLOT {
            self.head = slot;
        } else {
            self.nodes[self.tail].next = slot;
        }
        self.tail = slot;
        self.len += 1;
        task.set_queue_slot(slot);
        slot
    }

    /// Unlink the task in `slot`
    pub(crate) fn unlink(&mut self, slot: usize) -> Arc<CompileTask> {
        let (task, prev, next) = {
            let node = &mut self.nodes[slot];
            let task = node
                .task
                .take()
                .unwrap_or_else(|| panic!("compile queue linkage corrupted at slot {}", slot));
            (task, node.prev, node.next)
        };
        assert_eq!(task.queue_slot(), slot, "compile queue linkage corrupted");

        if prev == NO_SLOT {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NO_SLOT {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }

        self.free.push(slot);
        self.len -= 1;
        task.set_queue_slot(NO_SLOT);
        task
    }

    /// Tasks in insertion order with their slots
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

pub(crate) struct Iter<'a> {
    list: &'a TaskList,
    cursor: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, &'a Arc<CompileTask>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NO_SLOT {
            return None;
        }
        let slot = self.cursor;
        let node = &self.list.nodes[slot];
        self.cursor = node.next;
        node.task.as_ref().map(|task| (slot, task))
    }
}
