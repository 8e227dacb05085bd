//! Fire-and-forget user notices (toasts).
//!
//! Notices are broadcast to whoever renders them and mirrored to the log.
//! Emitting never fails: with no subscriber the notice is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

const NOTICE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: Uuid,
    pub level: NoticeLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct NoticeEmitter {
    tx: broadcast::Sender<Notice>,
}

impl Default for NoticeEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn emit(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Warning | NoticeLevel::Error => warn!(?level, %message, "notice"),
            NoticeLevel::Info | NoticeLevel::Success => info!(?level, %message, "notice"),
        }
        let _ = self.tx.send(Notice {
            id: Uuid::new_v4(),
            level,
            message,
            created_at: Utc::now(),
        });
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(NoticeLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(NoticeLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(NoticeLevel::Error, message);
    }
}
