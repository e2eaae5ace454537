//! Consumer registry - live queues grouped by platform id
//!
//! Registration reads the baseline revision, and fan-out advances the
//! watermark, inside the registry's critical section. A queue therefore
//! either receives an announced notification or was handed a baseline at or
//! past its revision, never neither.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::queue::EventQueue;

/// Revision reported while no subscription is active
pub const INVALID_REVISION: i64 = -1;

/// Last revision the notificator has processed, tagged with the
/// subscription lifetime that produced it
#[derive(Debug)]
pub(crate) struct Watermark {
    revision: AtomicI64,
    generation: AtomicU64,
}

impl Watermark {
    pub fn new() -> Self {
        Self {
            revision: AtomicI64::new(INVALID_REVISION),
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> i64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Seed the revision for a new subscription lifetime
    pub fn set(&self, revision: i64) {
        self.revision.store(revision, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// End the current subscription lifetime
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.revision.store(INVALID_REVISION, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    consumers: Mutex<HashMap<String, Vec<EventQueue>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `queue` and return the watermark observed at that instant
    pub fn add_with_baseline(&self, platform_id: &str, queue: EventQueue, watermark: &Watermark) -> i64 {
        let mut consumers = self.consumers.lock();
        consumers.entry(platform_id.to_string()).or_default().push(queue);
        watermark.get()
    }

    /// Move the watermark to `revision` and select its recipients in one step.
    ///
    /// Returns `None` without touching the watermark when `generation` is no
    /// longer the current subscription lifetime.
    pub fn advance_and_select(
        &self,
        platform_id: &str,
        revision: i64,
        generation: u64,
        watermark: &Watermark,
    ) -> Option<Vec<EventQueue>> {
        let consumers = self.consumers.lock();
        if watermark.generation() != generation {
            return None;
        }
        watermark.set(revision);
        Some(Self::select(&consumers, platform_id))
    }

    /// End the watermark's subscription lifetime. Serialized with
    /// `advance_and_select` so a stale loop cannot write after it.
    pub fn invalidate(&self, watermark: &Watermark) {
        let _consumers = self.consumers.lock();
        watermark.invalidate();
    }

    /// Remove the queue with `queue_id`, dropping its platform bucket if it
    /// becomes empty. Returns the removed queue and its platform.
    pub fn remove(&self, queue_id: &str) -> Option<(String, EventQueue)> {
        let mut consumers = self.consumers.lock();

        let (platform_id, index) = consumers.iter().find_map(|(platform_id, queues)| {
            queues
                .iter()
                .position(|q| q.id() == queue_id)
                .map(|index| (platform_id.clone(), index))
        })?;

        let queues = consumers.get_mut(&platform_id)?;
        let queue = queues.remove(index);
        if queues.is_empty() {
            consumers.remove(&platform_id);
        }
        Some((platform_id, queue))
    }

    /// Queues that should receive a notification for `platform_id`.
    ///
    /// An empty platform id selects every registered queue.
    #[cfg(test)]
    pub fn recipients(&self, platform_id: &str) -> Vec<EventQueue> {
        Self::select(&self.consumers.lock(), platform_id)
    }

    fn select(consumers: &HashMap<String, Vec<EventQueue>>, platform_id: &str) -> Vec<EventQueue> {
        if platform_id.is_empty() {
            consumers.values().flatten().cloned().collect()
        } else {
            consumers.get(platform_id).cloned().unwrap_or_default()
        }
    }

    /// Take every queue out of the registry, leaving it empty
    pub fn drain(&self) -> Vec<EventQueue> {
        let consumers = std::mem::take(&mut *self.consumers.lock());
        consumers.into_values().flatten().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.consumers.lock().values().map(Vec::len).sum()
    }

    pub fn platform_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_recipients() {
        let registry = ConsumerRegistry::new();
        let watermark = Watermark::new();
        let a1 = EventQueue::new(1);
        let a2 = EventQueue::new(1);
        let b1 = EventQueue::new(1);
        registry.add_with_baseline("a", a1.clone(), &watermark);
        registry.add_with_baseline("a", a2.clone(), &watermark);
        registry.add_with_baseline("b", b1.clone(), &watermark);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.platform_count(), 2);

        let ids: Vec<String> = registry.recipients("a").iter().map(|q| q.id().to_string()).collect();
        assert_eq!(ids, vec![a1.id().to_string(), a2.id().to_string()]);

        assert_eq!(registry.recipients("").len(), 3);
        assert!(registry.recipients("unknown").is_empty());
    }

    #[test]
    fn test_baseline_follows_watermark() {
        let registry = ConsumerRegistry::new();
        let watermark = Watermark::new();
        assert_eq!(registry.add_with_baseline("a", EventQueue::new(1), &watermark), INVALID_REVISION);

        let recipients = registry.advance_and_select("a", 12, 0, &watermark).unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(watermark.get(), 12);
        assert_eq!(registry.add_with_baseline("a", EventQueue::new(1), &watermark), 12);

        // No recipients still advances the watermark
        assert!(registry.advance_and_select("z", 13, 0, &watermark).unwrap().is_empty());
        assert_eq!(watermark.get(), 13);

        registry.invalidate(&watermark);
        assert_eq!(watermark.get(), INVALID_REVISION);
        assert_eq!(watermark.generation(), 1);
    }

    #[test]
    fn test_stale_generation_leaves_watermark_alone() {
        let registry = ConsumerRegistry::new();
        let watermark = Watermark::new();
        registry.add_with_baseline("a", EventQueue::new(1), &watermark);
        watermark.set(10);

        let stale = watermark.generation();
        registry.invalidate(&watermark);
        assert!(registry.advance_and_select("a", 11, stale, &watermark).is_none());
        assert_eq!(watermark.get(), INVALID_REVISION);

        // The next lifetime seeds its own revision; the old loop still cannot advance it
        watermark.set(20);
        assert!(registry.advance_and_select("", 12, stale, &watermark).is_none());
        assert_eq!(watermark.get(), 20);
        assert_eq!(registry.advance_and_select("", 21, watermark.generation(), &watermark).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_drops_empty_bucket() {
        let registry = ConsumerRegistry::new();
        let watermark = Watermark::new();
        let a1 = EventQueue::new(1);
        let b1 = EventQueue::new(1);
        registry.add_with_baseline("a", a1.clone(), &watermark);
        registry.add_with_baseline("b", b1.clone(), &watermark);

        let (platform_id, removed) = registry.remove(a1.id()).unwrap();
        assert_eq!(platform_id, "a");
        assert_eq!(removed.id(), a1.id());
        assert_eq!(registry.platform_count(), 1);

        assert!(registry.remove(a1.id()).is_none());
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = ConsumerRegistry::new();
        let watermark = Watermark::new();
        registry.add_with_baseline("a", EventQueue::new(1), &watermark);
        registry.add_with_baseline("b", EventQueue::new(1), &watermark);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }
}
