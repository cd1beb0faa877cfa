// Checker Task Service - review tasks for back-office checkers
//
// New tasks go through the retry-queue writer and are announced as `task`
// once stored. Live review claims are kept in the checking list.

use crate::application::checking_list::CheckingList;
use crate::application::constants::{CHECKERS_TOPIC, CITIES_COLLECTION, SELLERS_COLLECTION};
use crate::application::writer::{FollowUp, Lookup, RetryQueueWriter, WriterError};
use crate::config::WriterConfig;
use crate::domain::{CheckerTask, CheckerTaskType, DocumentId};
use crate::port::{DocumentStore, IdProvider, RealtimeEvent, RealtimePublisher};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub const EVENT_TASK: &str = "task";
pub const EVENT_DELETE_TASK: &str = "delete-task";

/// Shape of the `task` event: the stored task with its seller joined in
fn task_follow_up() -> FollowUp {
    FollowUp::publish(CHECKERS_TOPIC, EVENT_TASK)
        .lookup(
            Lookup::new(SELLERS_COLLECTION, "seller_id", "_id", "seller")
                .project(["name", "type", "logo"])
                .with(Lookup::new(CITIES_COLLECTION, "city_id", "_id", "city").project(["name"])),
        )
        .project(["description", "target_id", "type", "is_urgent", "seller"])
}

pub struct CheckerTaskService {
    writer: RetryQueueWriter<CheckerTask>,
    checking_list: Arc<CheckingList>,
    publisher: Arc<dyn RealtimePublisher>,
}

impl CheckerTaskService {
    /// Build the service and spawn its writer task
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn RealtimePublisher>,
        ids: Arc<dyn IdProvider>,
        config: WriterConfig,
    ) -> (Self, JoinHandle<()>) {
        let (writer, handle) = RetryQueueWriter::spawn(
            store,
            Arc::clone(&publisher),
            ids,
            config,
            task_follow_up(),
        );
        let checking_list = Arc::new(CheckingList::new(Arc::clone(&publisher)));
        (
            Self {
                writer,
                checking_list,
                publisher,
            },
            handle,
        )
    }

    pub fn writer(&self) -> &RetryQueueWriter<CheckerTask> {
        &self.writer
    }

    pub fn checking_list(&self) -> &CheckingList {
        &self.checking_list
    }

    pub fn product(
        &self,
        target_id: &str,
        description: &str,
        seller_id: &str,
    ) -> Result<DocumentId, WriterError> {
        self.writer.enqueue(
            &CheckerTask::new(CheckerTaskType::Product, target_id, description).seller(seller_id),
        )
    }

    pub fn post(
        &self,
        target_id: &str,
        is_urgent: bool,
        description: &str,
        seller_id: &str,
    ) -> Result<DocumentId, WriterError> {
        self.writer.enqueue(
            &CheckerTask::new(CheckerTaskType::Post, target_id, description)
                .urgent(is_urgent)
                .seller(seller_id),
        )
    }

    /// Auctions are always urgent and carry no seller
    pub fn auction(&self, target_id: &str, description: &str) -> Result<DocumentId, WriterError> {
        self.writer.enqueue(
            &CheckerTask::new(CheckerTaskType::Auction, target_id, description).urgent(true),
        )
    }

    /// The seller under review is both target and seller
    pub fn seller_profile(
        &self,
        target_id: &str,
        description: &str,
    ) -> Result<DocumentId, WriterError> {
        self.writer.enqueue(
            &CheckerTask::new(CheckerTaskType::Profile, target_id, description).seller(target_id),
        )
    }

    /// Checker approved the task: drop their claim and retract the task
    ///
    /// Returns whether `checker_id` held the claim.
    pub fn confirm(&self, task_id: &str, checker_id: &str) -> bool {
        let released = self.checking_list.remove(task_id, checker_id);
        self.announce_delete(task_id);
        info!(task_id, checker_id, released, "Checker task confirmed");
        released
    }

    /// The task itself is gone: retract it and clear any claim
    pub fn remove_task(&self, task_id: &str) {
        self.announce_delete(task_id);
        self.checking_list.remove_by_task_id(task_id);
        info!(task_id, "Checker task removed");
    }

    fn announce_delete(&self, task_id: &str) {
        self.publisher.publish(RealtimeEvent::new(
            CHECKERS_TOPIC,
            EVENT_DELETE_TASK,
            json!(task_id),
        ));
    }
}
