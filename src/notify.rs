//! Outbound notices to server owners and staff.
//!
//! The orchestration core never formats chat-platform messages itself; it
//! hands plain text to a [`Notifier`]. The daemon logs notices through
//! `tracing`, tests record them.

use std::sync::Mutex;

pub trait Notifier: Send + Sync {
    /// Private notice to the owner of a server.
    fn owner(&self, owner: &str, message: &str);
    /// Staff moderation channel.
    fn moderation(&self, message: &str);
    /// Staff error channel.
    fn error(&self, message: &str);
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn owner(&self, owner: &str, message: &str) {
        tracing::info!(target: "gamehost::notice", %owner, "{message}");
    }

    fn moderation(&self, message: &str) {
        tracing::warn!(target: "gamehost::moderation", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "gamehost::errors", "{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Owner { owner: String, message: String },
    Moderation(String),
    Error(String),
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice);
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Owner notices that contain `needle`.
    pub fn owner_messages_containing(&self, needle: &str) -> Vec<String> {
        self.notices()
            .into_iter()
            .filter_map(|n| match n {
                Notice::Owner { message, .. } if message.contains(needle) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn owner(&self, owner: &str, message: &str) {
        self.push(Notice::Owner {
            owner: owner.to_string(),
            message: message.to_string(),
        });
    }

    fn moderation(&self, message: &str) {
        self.push(Notice::Moderation(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.push(Notice::Error(message.to_string()));
    }
}
