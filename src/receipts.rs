use std::collections::{BTreeSet, HashSet};

use log::debug;

use crate::models::ChatCredential;
use crate::store::MessageStore;

/// One visibility report for a rendered message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intersection {
    pub message_id: i64,
    /// Fraction of the message currently on screen, `0.0..=1.0`.
    pub ratio: f32,
}

/// Turns visibility reports into batched read receipts.
///
/// Each report call yields at most one batch. Ids are reported once; a
/// failed flush hands its ids back through [`ReadReceiptTracker::requeue`].
#[derive(Debug)]
pub struct ReadReceiptTracker {
    threshold: f32,
    page_visible: bool,
    on_screen: BTreeSet<i64>,
    processed: HashSet<i64>,
    queue: Vec<i64>,
}

impl ReadReceiptTracker {
    pub fn new(threshold: f32) -> Self {
        ReadReceiptTracker {
            threshold,
            page_visible: true,
            on_screen: BTreeSet::new(),
            processed: HashSet::new(),
            queue: Vec::new(),
        }
    }

    pub fn is_page_visible(&self) -> bool {
        self.page_visible
    }

    /// Applies one observer callback worth of reports. Newly read messages
    /// are marked in `store` and queued; returns how many were queued.
    pub fn observe(
        &mut self,
        entries: &[Intersection],
        store: &mut MessageStore,
        me: &ChatCredential,
    ) -> usize {
        let mut candidates = Vec::new();
        for entry in entries {
            if entry.ratio >= self.threshold {
                self.on_screen.insert(entry.message_id);
                candidates.push(entry.message_id);
            } else {
                self.on_screen.remove(&entry.message_id);
            }
        }
        if !self.page_visible {
            return 0;
        }
        self.consider(&candidates, store, me)
    }

    /// Tracks page visibility. Returns true when the page just became
    /// visible again, in which case the caller should [`rescan`](Self::rescan).
    pub fn set_page_visible(&mut self, visible: bool) -> bool {
        let regained = visible && !self.page_visible;
        self.page_visible = visible;
        regained
    }

    /// Re-considers everything still on screen.
    pub fn rescan(&mut self, store: &mut MessageStore, me: &ChatCredential) -> usize {
        if !self.page_visible {
            return 0;
        }
        let on_screen: Vec<i64> = self.on_screen.iter().copied().collect();
        self.consider(&on_screen, store, me)
    }

    /// Drains the queue into one batch.
    pub fn take_batch(&mut self) -> Option<Vec<i64>> {
        if self.queue.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.queue))
        }
    }

    /// Puts the ids of a failed flush back in front of the queue.
    pub fn requeue(&mut self, ids: Vec<i64>) {
        debug!("Re-queueing {} read receipts", ids.len());
        let mut queue = ids;
        for id in self.queue.drain(..) {
            if !queue.contains(&id) {
                queue.push(id);
            }
        }
        self.queue = queue;
    }

    /// Forgets everything; used when the open room changes.
    pub fn reset(&mut self) {
        self.on_screen.clear();
        self.processed.clear();
        self.queue.clear();
    }

    fn consider(&mut self, ids: &[i64], store: &mut MessageStore, me: &ChatCredential) -> usize {
        let mut fresh = Vec::new();
        for &id in ids {
            if self.processed.contains(&id) {
                continue;
            }
            let Some(message) = store.get(id) else {
                continue;
            };
            if message.is_read || message.is_from(me) {
                continue;
            }
            self.processed.insert(id);
            fresh.push(id);
        }
        store.mark_read(&fresh);
        let queued = fresh.len();
        self.queue.extend(fresh);
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessagePage, UserType, WireMessage};
    use crate::rooms::tests::signed_in;
    use chrono::{TimeZone, Utc};

    fn wire(id: i64, sender_type: UserType, sender_id: &str) -> WireMessage {
        WireMessage {
            message_id: id,
            sender_type,
            sender_id: sender_id.to_string(),
            text: Some(format!("message {id}")),
            file_path: None,
            is_read: false,
            created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            temp_id: None,
        }
    }

    fn store_with(messages: Vec<WireMessage>) -> MessageStore {
        let mut store = MessageStore::new();
        let request = store.begin_load(3);
        assert!(store.apply_page(
            request,
            MessagePage {
                messages,
                page: 1,
                limit: 20,
                total: 0,
                is_last_page: true,
            },
        ));
        store
    }

    fn seen(id: i64, ratio: f32) -> Intersection {
        Intersection {
            message_id: id,
            ratio,
        }
    }

    #[test]
    fn one_report_yields_one_batch() {
        let me = signed_in();
        let mut store = store_with(vec![
            wire(12, UserType::App, "expert_7"),
            wire(13, UserType::App, "expert_7"),
            wire(14, UserType::App, "expert_7"),
        ]);
        let mut tracker = ReadReceiptTracker::new(0.5);

        let queued = tracker.observe(&[seen(12, 0.9), seen(13, 0.6), seen(14, 0.5)], &mut store, &me);
        assert_eq!(queued, 3);
        assert_eq!(tracker.take_batch(), Some(vec![12, 13, 14]));
        assert_eq!(tracker.take_batch(), None);
        assert!(store.messages().iter().all(|m| m.is_read));
    }

    #[test]
    fn ignores_own_read_and_barely_visible_messages() {
        let me = signed_in();
        let mut read = wire(2, UserType::App, "expert_7");
        read.is_read = true;
        let mut store = store_with(vec![
            wire(1, UserType::Web, "customer_1"),
            read,
            wire(3, UserType::App, "expert_7"),
        ]);
        let mut tracker = ReadReceiptTracker::new(0.5);

        tracker.observe(&[seen(1, 1.0), seen(2, 1.0), seen(3, 0.2), seen(99, 1.0)], &mut store, &me);
        assert_eq!(tracker.take_batch(), None);
    }

    #[test]
    fn ids_are_reported_once() {
        let me = signed_in();
        let mut store = store_with(vec![wire(5, UserType::App, "expert_7")]);
        let mut tracker = ReadReceiptTracker::new(0.5);

        tracker.observe(&[seen(5, 1.0)], &mut store, &me);
        assert_eq!(tracker.take_batch(), Some(vec![5]));
        tracker.observe(&[seen(5, 1.0)], &mut store, &me);
        assert_eq!(tracker.take_batch(), None);
    }

    #[test]
    fn hidden_page_defers_until_visible_again() {
        let me = signed_in();
        let mut store = store_with(vec![
            wire(7, UserType::App, "expert_7"),
            wire(8, UserType::App, "expert_7"),
        ]);
        let mut tracker = ReadReceiptTracker::new(0.5);

        assert!(!tracker.set_page_visible(false));
        assert_eq!(tracker.observe(&[seen(7, 1.0), seen(8, 0.8)], &mut store, &me), 0);
        assert_eq!(tracker.rescan(&mut store, &me), 0);
        assert!(store.messages().iter().all(|m| !m.is_read));

        assert!(tracker.set_page_visible(true));
        assert_eq!(tracker.rescan(&mut store, &me), 2);
        assert_eq!(tracker.take_batch(), Some(vec![7, 8]));
        assert!(!tracker.set_page_visible(true));
    }

    #[test]
    fn requeued_ids_ride_with_next_batch() {
        let me = signed_in();
        let mut store = store_with(vec![
            wire(1, UserType::App, "expert_7"),
            wire(2, UserType::App, "expert_7"),
        ]);
        let mut tracker = ReadReceiptTracker::new(0.5);

        tracker.observe(&[seen(1, 1.0)], &mut store, &me);
        let failed = tracker.take_batch().unwrap();
        tracker.requeue(failed);
        tracker.observe(&[seen(2, 1.0)], &mut store, &me);
        assert_eq!(tracker.take_batch(), Some(vec![1, 2]));
    }
}
