use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::ViewerError;

pub const DEFAULT_NOTIFICATION_LIFETIME: Duration = Duration::from_secs(4);
const MAX_VISIBLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub level: NotificationLevel,
    pub message: String,
    pub expires_at: Instant,
}

/// Transient toasts. Only explicit user actions end up here; background
/// failures are logged instead.
#[derive(Debug)]
pub struct Notifications {
    lifetime: Duration,
    items: VecDeque<Notification>,
    next_id: u64,
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_LIFETIME)
    }
}

impl Notifications {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            items: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn push(&mut self, level: NotificationLevel, message: impl Into<String>, now: Instant) {
        let notification = Notification {
            id: self.next_id,
            level,
            message: message.into(),
            expires_at: now + self.lifetime,
        };
        self.next_id += 1;
        self.items.push_back(notification);
        while self.items.len() > MAX_VISIBLE {
            self.items.pop_front();
        }
    }

    pub fn info(&mut self, message: impl Into<String>, now: Instant) {
        self.push(NotificationLevel::Info, message, now);
    }

    /// Shows user-visible errors and logs the rest.
    pub fn report(&mut self, err: &ViewerError, now: Instant) {
        if err.is_user_visible() {
            log::error!("{err}");
            self.push(NotificationLevel::Error, err.to_string(), now);
        } else {
            log::warn!("{err}");
        }
    }

    pub fn prune(&mut self, now: Instant) {
        self.items.retain(|item| item.expires_at > now);
    }

    pub fn dismiss(&mut self, id: u64) {
        self.items.retain(|item| item.id != id);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.items.iter().map(|item| item.expires_at).min()
    }
}
