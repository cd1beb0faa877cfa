// Checking List - which checker is currently reviewing which task
//
// At most one claimant per task. All mutations happen under one mutex;
// events are published after the lock is released.

use crate::application::constants::CHECKERS_TOPIC;
use crate::domain::{CheckingListItem, TaskId};
use crate::port::{RealtimeEvent, RealtimePublisher};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub const EVENT_CHECK_TASK: &str = "check-task";
pub const EVENT_UNCHECK_TASK: &str = "uncheck-task";

pub struct CheckingList {
    items: Mutex<HashMap<TaskId, Arc<CheckingListItem>>>,
    publisher: Arc<dyn RealtimePublisher>,
}

impl CheckingList {
    pub fn new(publisher: Arc<dyn RealtimePublisher>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            publisher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<CheckingListItem>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `task_id` for `checker_id`
    ///
    /// No-op (returns false) when anyone already holds the task.
    pub fn add(&self, task_id: &str, checker_id: &str) -> bool {
        let item = {
            let mut items = self.lock();
            if items.contains_key(task_id) {
                return false;
            }
            let item = Arc::new(CheckingListItem::new(task_id, checker_id));
            items.insert(task_id.to_string(), Arc::clone(&item));
            item
        };

        debug!(task_id, checker_id, "Task checking started");
        self.announce(EVENT_CHECK_TASK, item.as_ref());
        true
    }

    /// Release the claim, only when `checker_id` is the claimant
    pub fn remove(&self, task_id: &str, checker_id: &str) -> bool {
        let item = {
            let mut items = self.lock();
            match items.get(task_id) {
                Some(item) if item.checker_id == checker_id => items.remove(task_id),
                _ => None,
            }
        };

        match item {
            Some(item) => {
                debug!(task_id, checker_id, "Task checking stopped");
                self.announce(EVENT_UNCHECK_TASK, item.as_ref());
                true
            }
            None => false,
        }
    }

    /// Clear the claim whoever holds it (the task itself is gone)
    pub fn remove_by_task_id(&self, task_id: &str) -> Option<Arc<CheckingListItem>> {
        self.lock().remove(task_id)
    }

    pub fn is_task_checking(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    /// Current claimant of `task_id`
    pub fn claimant(&self, task_id: &str) -> Option<String> {
        self.lock().get(task_id).map(|item| item.checker_id.clone())
    }

    /// Snapshot of every claim (shared, not deep-copied)
    pub fn all(&self) -> Vec<Arc<CheckingListItem>> {
        self.lock().values().cloned().collect()
    }

    /// Snapshot of the claims held by one checker
    pub fn list(&self, checker_id: &str) -> Vec<Arc<CheckingListItem>> {
        self.lock()
            .values()
            .filter(|item| item.checker_id == checker_id)
            .cloned()
            .collect()
    }

    fn announce<T: Serialize>(&self, name: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(payload) => {
                self.publisher
                    .publish(RealtimeEvent::new(CHECKERS_TOPIC, name, payload));
            }
            Err(e) => warn!(event = name, error = %e, "Could not encode checking event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::realtime::MockRealtimePublisher;
    use mockall::predicate::function;

    fn publisher_expecting(events: &'static [&'static str]) -> Arc<MockRealtimePublisher> {
        let mut publisher = MockRealtimePublisher::new();
        let mut seq = mockall::Sequence::new();
        for name in events {
            publisher
                .expect_publish()
                .with(function(move |e: &RealtimeEvent| {
                    e.topic == CHECKERS_TOPIC && e.name == *name
                }))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(1usize);
        }
        Arc::new(publisher)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let list = CheckingList::new(publisher_expecting(&[EVENT_CHECK_TASK, EVENT_UNCHECK_TASK]));

        assert!(list.add("task-1", "alice"));
        assert!(!list.add("task-1", "bob"));
        assert_eq!(list.claimant("task-1").as_deref(), Some("alice"));

        assert!(!list.remove("task-1", "bob"));
        assert!(list.is_task_checking("task-1"));

        assert!(list.remove("task-1", "alice"));
        assert!(!list.is_task_checking("task-1"));
    }

    #[test]
    fn test_force_remove_ignores_claimant_and_is_silent() {
        let list = CheckingList::new(publisher_expecting(&[EVENT_CHECK_TASK]));
        list.add("task-1", "alice");

        let removed = list.remove_by_task_id("task-1").unwrap();
        assert_eq!(removed.checker_id, "alice");
        assert!(list.remove_by_task_id("task-1").is_none());
        assert!(list.all().is_empty());
    }

    #[test]
    fn test_list_filters_by_checker() {
        let list = CheckingList::new(publisher_expecting(&[
            EVENT_CHECK_TASK,
            EVENT_CHECK_TASK,
            EVENT_CHECK_TASK,
        ]));
        list.add("task-1", "alice");
        list.add("task-2", "bob");
        list.add("task-3", "alice");

        let mut mine: Vec<_> = list.list("alice").iter().map(|i| i.task_id.clone()).collect();
        mine.sort();
        assert_eq!(mine, vec!["task-1", "task-3"]);
        assert_eq!(list.all().len(), 3);
    }

    #[test]
    fn test_concurrent_adds_have_one_winner() {
        let list = Arc::new(CheckingList::new(publisher_expecting(&[EVENT_CHECK_TASK])));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || list.add("task-1", &format!("checker-{n}")))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
