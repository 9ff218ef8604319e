//! Idle/AFK state tracking for the embedding application.
//!
//! Applies monitor events to two independent flags: status idle (drives the
//! visible presence) and notifications idle (drives AFK notification routing).

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::dispatch::EventSink;
use crate::protocol::Event;
use crate::protocol::IdleUpdate;

/// Consumer that mirrors the monitor's idle reports.
pub struct IdleTracker {
    /// Visible status idleness.
    status_idle: AtomicBool,

    /// Notification idleness.
    notifs_idle: AtomicBool,

    /// Whether a watch is currently running.
    watching: AtomicBool,
}

impl IdleTracker {
    /// Create a tracker with everything active.
    pub fn new() -> Self {
        Self {
            status_idle: AtomicBool::new(false),
            notifs_idle: AtomicBool::new(false),
            watching: AtomicBool::new(false),
        }
    }

    /// Whether the status should show as idle.
    pub fn is_status_idle(&self) -> bool {
        self.status_idle.load(Ordering::Relaxed)
    }

    /// Whether notifications should be treated as AFK.
    pub fn is_notifs_idle(&self) -> bool {
        self.notifs_idle.load(Ordering::Relaxed)
    }

    /// Whether a watch is running.
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Relaxed)
    }

    /// Apply an idle update. Absent fields leave their flag alone.
    pub fn apply(&self, update: IdleUpdate) {
        if let Some(idle) = update.status_idle {
            let prev = self.status_idle.swap(idle, Ordering::Relaxed);
            if prev != idle {
                info!("Status idle: {} -> {}", prev, idle);
            }
        }

        if let Some(idle) = update.notifs_idle {
            let prev = self.notifs_idle.swap(idle, Ordering::Relaxed);
            if prev != idle {
                info!("Notifications idle: {} -> {}", prev, idle);
            }
        }
    }

    /// Detection is inactive: nothing counts as idle.
    fn reset(&self) {
        self.status_idle.store(false, Ordering::Relaxed);
        self.notifs_idle.store(false, Ordering::Relaxed);
        self.watching.store(false, Ordering::Relaxed);
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for IdleTracker {
    fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::WatchEvent(update) => self.apply(update),
            Event::WatchStarted {
                status_timeout,
                notifs_timeout,
            } => {
                info!(
                    "Watch started (status after {} min, notifications after {} min)",
                    status_timeout, notifs_timeout
                );
                self.watching.store(true, Ordering::Relaxed);
            }
            Event::WatchStopped => {
                info!("Watch stopped");
                self.reset();
            }
            Event::Connected => debug!("Monitor connected"),
            Event::Info(text) => debug!("Monitor: {}", text),
            Event::Error(text) => error!("Monitor error: {}", text),
            Event::Exited(code) => {
                warn!("Monitor exited with code {:?}", code);
                self.reset();
            }
        }
        Ok(())
    }
}
