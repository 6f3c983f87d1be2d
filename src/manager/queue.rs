use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    id: String,
    priority: i32,
}

/// The ids of the queued tasks, in admission order.
/// New submissions are kept sorted by priority (stable, lower first);
/// retried and resumed tasks jump to the front.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<Entry>,
}

impl PendingQueue {
    /// append, then re-sort the whole queue by priority
    pub fn push_sorted(&mut self, id: String, priority: i32) {
        self.entries.push_back(Entry { id, priority });
        self.entries
            .make_contiguous()
            .sort_by_key(|entry| entry.priority);
    }

    pub fn push_front(&mut self, id: String, priority: i32) {
        self.entries.push_front(Entry { id, priority });
    }

    pub fn push_back(&mut self, id: String, priority: i32) {
        self.entries.push_back(Entry { id, priority });
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.entries.pop_front().map(|entry| entry.id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.iter().position(|entry| entry.id == id) {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
