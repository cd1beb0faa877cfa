// Checking-List Domain Model - ephemeral review claims

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a review task
pub type TaskId = String;

/// Identifier of the actor (checker) reviewing a task
pub type CheckerId = String;

/// Claim that a checker is currently reviewing a task
///
/// Lives only in process memory; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckingListItem {
    pub task_id: TaskId,
    pub checker_id: CheckerId,
    pub created_at: DateTime<Utc>,
}

impl CheckingListItem {
    pub fn new(task_id: impl Into<String>, checker_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            checker_id: checker_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Kind of entity a review task points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerTaskType {
    Product,
    Post,
    Auction,
    Profile,
}

/// Review task as persisted in the tasks collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerTask {
    pub target_id: String,
    pub description: String,
    pub is_urgent: bool,
    #[serde(rename = "type")]
    pub task_type: CheckerTaskType,
    pub created_at: DateTime<Utc>,
    pub seller_id: Option<String>,
}

impl CheckerTask {
    pub fn new(
        task_type: CheckerTaskType,
        target_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            description: description.into(),
            is_urgent: false,
            task_type,
            created_at: Utc::now(),
            seller_id: None,
        }
    }

    pub fn urgent(mut self, is_urgent: bool) -> Self {
        self.is_urgent = is_urgent;
        self
    }

    pub fn seller(mut self, seller_id: impl Into<String>) -> Self {
        self.seller_id = Some(seller_id.into());
        self
    }
}
