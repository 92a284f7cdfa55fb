use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::events::FlowEvent;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Backward-compatible alias so old code referencing `NotificationType` still compiles.
pub type NotificationType = NotificationLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub level: NotificationLevel,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub action_url: Option<String>,
}

/// Ring-buffer backed notification store using `VecDeque` for O(1) eviction.
#[derive(Debug, Clone)]
pub struct NotificationStore {
    notifications: VecDeque<Notification>,
    max_stored: usize,
}

impl NotificationStore {
    pub fn new(max_stored: usize) -> Self {
        Self {
            notifications: VecDeque::new(),
            max_stored,
        }
    }

    /// Create and store a new notification. Returns its id.
    pub fn add(
        &mut self,
        title: impl Into<String>,
        message: impl Into<String>,
        level: NotificationLevel,
        source: impl Into<String>,
    ) -> Uuid {
        let notification = Notification {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.into(),
            level,
            source: source.into(),
            created_at: Utc::now(),
            read: false,
            action_url: None,
        };
        let id = notification.id;
        self.notifications.push_back(notification);
        // Ring buffer: evict oldest when over capacity (O(1) with VecDeque).
        while self.notifications.len() > self.max_stored {
            self.notifications.pop_front();
        }
        id
    }

    /// Create and store a notification with an optional action URL.
    pub fn add_with_url(
        &mut self,
        title: impl Into<String>,
        message: impl Into<String>,
        level: NotificationLevel,
        source: impl Into<String>,
        action_url: Option<String>,
    ) -> Uuid {
        let id = self.add(title, message, level, source);
        if let Some(url) = action_url {
            if let Some(n) = self.notifications.iter_mut().find(|n| n.id == id) {
                n.action_url = Some(url);
            }
        }
        id
    }

    /// Return all unread notifications (newest first).
    pub fn list_unread(&self) -> Vec<&Notification> {
        self.notifications
            .iter()
            .rev()
            .filter(|n| !n.read)
            .collect()
    }

    /// Paginated listing of all notifications (newest first).
    pub fn list_all(&self, limit: usize, offset: usize) -> Vec<&Notification> {
        self.notifications
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .collect()
    }

    /// Return a reference to all stored notifications (oldest first, raw order).
    pub fn all_raw(&self) -> &VecDeque<Notification> {
        &self.notifications
    }

    /// Mark a single notification as read. Returns false if not found.
    pub fn mark_read(&mut self, id: Uuid) -> bool {
        if let Some(n) = self.notifications.iter_mut().find(|n| n.id == id) {
            n.read = true;
            true
        } else {
            false
        }
    }

    /// Mark every notification as read.
    pub fn mark_all_read(&mut self) {
        for n in &mut self.notifications {
            n.read = true;
        }
    }

    /// Delete a notification by id. Returns true if found and removed.
    pub fn delete(&mut self, id: Uuid) -> bool {
        let before = self.notifications.len();
        self.notifications.retain(|n| n.id != id);
        self.notifications.len() < before
    }

    /// Count of unread notifications.
    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    /// Total notification count.
    pub fn total_count(&self) -> usize {
        self.notifications.len()
    }

    /// Remove notifications older than the specified TTL in seconds.
    /// Returns the number of notifications removed.
    pub fn cleanup_old(&mut self, ttl_secs: u64) -> usize {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(ttl_secs as i64);

        let before_count = self.notifications.len();
        self.notifications.retain(|n| n.created_at >= cutoff);
        let after_count = self.notifications.len();

        before_count - after_count
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

// ---------------------------------------------------------------------------
// Event-to-notification conversion
// ---------------------------------------------------------------------------

/// Convert a [`FlowEvent`] into a notification, if relevant. Returns `None`
/// for events that are routine enough not to warrant surfacing to an
/// operator (e.g. every routed message).
pub fn notification_from_event(
    msg: &FlowEvent,
) -> Option<(String, String, NotificationLevel, String, Option<String>)> {
    match msg {
        FlowEvent::MessageRouted { .. } => None,
        FlowEvent::HandoffRequested { conversation_id, reason } => Some((
            "Handoff requested".to_string(),
            reason.clone(),
            NotificationLevel::Warning,
            format!("conversation:{conversation_id}"),
            None,
        )),
        FlowEvent::RunCompleted { detector_id, run_id, findings } => Some((
            "Detector run completed".to_string(),
            format!("{findings} finding(s)"),
            NotificationLevel::Info,
            format!("detector:{detector_id}"),
            Some(format!("/runs/{run_id}")),
        )),
        FlowEvent::RunFailed { detector_id, run_id, error } => Some((
            "Detector run failed".to_string(),
            error.clone(),
            NotificationLevel::Error,
            format!("detector:{detector_id}"),
            Some(format!("/runs/{run_id}")),
        )),
        FlowEvent::AlertRaised { alert_id, detector_id, severity } => Some((
            format!("{severity:?} alert"),
            msg.summary(),
            match severity {
                kiss_api_types::Severity::Critical | kiss_api_types::Severity::High => NotificationLevel::Error,
                kiss_api_types::Severity::Medium => NotificationLevel::Warning,
                kiss_api_types::Severity::Low => NotificationLevel::Info,
            },
            format!("detector:{detector_id}"),
            Some(format!("/alerts/{alert_id}")),
        )),
        FlowEvent::CaseOpened { case_id } => Some((
            "Case opened".to_string(),
            msg.summary(),
            NotificationLevel::Info,
            "system".to_string(),
            Some(format!("/cases/{case_id}")),
        )),
        FlowEvent::CaseTransitioned { case_id, .. } => Some((
            "Case updated".to_string(),
            msg.summary(),
            NotificationLevel::Info,
            "system".to_string(),
            Some(format!("/cases/{case_id}")),
        )),
        FlowEvent::ActionAwaitingApproval { action_id, .. } => Some((
            "Action awaiting approval".to_string(),
            msg.summary(),
            NotificationLevel::Warning,
            "system".to_string(),
            Some(format!("/actions/{action_id}")),
        )),
        FlowEvent::ActionExecuted { action_id, .. } => Some((
            "Action executed".to_string(),
            msg.summary(),
            NotificationLevel::Success,
            "system".to_string(),
            Some(format!("/actions/{action_id}")),
        )),
        FlowEvent::JobDeadLettered { queue, .. } => Some((
            "Job dead-lettered".to_string(),
            msg.summary(),
            NotificationLevel::Error,
            format!("queue:{queue}"),
            None,
        )),
        FlowEvent::OutboundDeferred { .. } => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
