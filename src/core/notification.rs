// src/core/notification.rs

//! Administrator notification hook.
//!
//! Failover start and end, corrupt log fragments, permanent recovery failure
//! and replication fragment errors all surface through this hook. The default
//! implementation logs the message; deployments can plug an external script.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Notice,
    Error,
}

pub trait NotificationHook: Send + Sync {
    fn notify(&self, severity: Severity, subject: &str, body: &str);
}

/// Default hook: writes the notification to the server log.
pub struct LogNotificationHook;

impl NotificationHook for LogNotificationHook {
    fn notify(&self, severity: Severity, subject: &str, body: &str) {
        match severity {
            Severity::Notice => info!("ADMIN NOTICE: {}\n{}", subject, body),
            Severity::Error => error!("ADMIN ALERT: {}\n{}", subject, body),
        }
    }
}

/// Test hook that records every notification.
pub struct RecordingNotificationHook {
    pub notifications: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotificationHook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notifications: Mutex::new(Vec::new()),
        })
    }
}

impl NotificationHook for RecordingNotificationHook {
    fn notify(&self, severity: Severity, subject: &str, _body: &str) {
        self.notifications
            .lock()
            .push((severity, subject.to_string()));
    }
}
